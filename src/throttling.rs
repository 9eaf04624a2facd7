//! Back-off on throttling signals.
//!
//! When the wrapped service raises [`SoftHsmError::Throttled`], the decorator
//! asks the signal's own [`BackoffStrategy`](crate::error::BackoffStrategy)
//! for a delay, sleeps, and calls again. Every attempt of one logical call
//! shares a `call_id` so the retries can be followed in the logs. Once the
//! strategy has no delay left the call fails with
//! [`SoftHsmError::ServiceUnavailable`].
//!
//! An optional cap on the summed back-off bounds one call's sleeping. The
//! default stack sets it to the retry decorator's per-attempt timeout.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;
use uuid::Uuid;

use crate::entities::SigningKeyEntity;
use crate::error::SoftHsmError;
use crate::schemes::{KeyScheme, PublicKey, SignatureSpec};
use crate::service::{
    CryptoService, CryptoServiceExtension, KeyGenerationRequest, KeyReference, RewrapSummary,
    SharedSecretSpec, SignRequest, WrappingKeyContext, WrappingKeyParent,
};

/// How the decorators wait. Tests substitute a recorder.
pub type Sleeper = Arc<dyn Fn(Duration) + Send + Sync>;

pub fn thread_sleeper() -> Sleeper {
    Arc::new(std::thread::sleep)
}

pub struct ThrottlingDecorator<S> {
    inner: S,
    sleeper: Sleeper,
    max_total_delay: Option<Duration>,
}

impl<S: CryptoService> ThrottlingDecorator<S> {
    pub fn new(inner: S) -> Self {
        Self::with_sleeper(inner, thread_sleeper())
    }

    pub fn with_sleeper(inner: S, sleeper: Sleeper) -> Self {
        Self {
            inner,
            sleeper,
            max_total_delay: None,
        }
    }

    /// Give up once the next delay would take the summed back-off past `limit`.
    pub fn with_max_total_delay(mut self, limit: Duration) -> Self {
        self.max_total_delay = Some(limit);
        self
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn max_total_delay(&self) -> Option<Duration> {
        self.max_total_delay
    }

    fn execute<T>(
        &self,
        operation: &str,
        mut call: impl FnMut(&S) -> Result<T, SoftHsmError>,
    ) -> Result<T, SoftHsmError> {
        let call_id = Uuid::new_v4();
        let mut attempt: u32 = 1;
        let mut slept = Duration::ZERO;
        loop {
            let signal = match call(&self.inner) {
                Err(SoftHsmError::Throttled(signal)) => signal,
                other => return other,
            };
            let delay = signal
                .strategy
                .backoff(attempt)
                .filter(|d| self.max_total_delay.map_or(true, |max| slept + *d <= max));
            match delay {
                Some(delay) => {
                    warn!(
                        %call_id,
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        reason = %signal.message,
                        "throttled, backing off"
                    );
                    (*self.sleeper)(delay);
                    slept += delay;
                    attempt += 1;
                }
                None => {
                    warn!(
                        %call_id,
                        operation,
                        attempt,
                        slept_ms = slept.as_millis() as u64,
                        "throttling budget exhausted"
                    );
                    return Err(SoftHsmError::ServiceUnavailable(format!(
                        "{operation} still throttled after {attempt} attempts: {}",
                        signal.message
                    )));
                }
            }
        }
    }
}

impl<S: CryptoService> CryptoService for ThrottlingDecorator<S> {
    fn extensions(&self) -> BTreeSet<CryptoServiceExtension> {
        self.inner.extensions()
    }

    fn supported_schemes(&self) -> BTreeMap<KeyScheme, Vec<SignatureSpec>> {
        self.inner.supported_schemes()
    }

    fn generate_key_pair(&self, request: &KeyGenerationRequest) -> Result<PublicKey, SoftHsmError> {
        self.execute("generate_key_pair", |s| s.generate_key_pair(request))
    }

    fn sign(&self, request: &SignRequest) -> Result<Vec<u8>, SoftHsmError> {
        self.execute("sign", |s| s.sign(request))
    }

    fn derive_shared_secret(&self, spec: &SharedSecretSpec) -> Result<Vec<u8>, SoftHsmError> {
        self.execute("derive_shared_secret", |s| s.derive_shared_secret(spec))
    }

    fn create_wrapping_key(
        &self,
        alias: &str,
        fail_if_exists: bool,
        context: &WrappingKeyContext,
    ) -> Result<(), SoftHsmError> {
        self.execute("create_wrapping_key", |s| {
            s.create_wrapping_key(alias, fail_if_exists, context)
        })
    }

    fn rewrap_wrapping_key(
        &self,
        tenant_id: &str,
        alias: &str,
        new_parent: &WrappingKeyParent,
    ) -> Result<i32, SoftHsmError> {
        self.execute("rewrap_wrapping_key", |s| {
            s.rewrap_wrapping_key(tenant_id, alias, new_parent)
        })
    }

    fn rewrap_all_signing_keys_wrapped_by(
        &self,
        wrapping_key_id: Uuid,
        tenant_id: &str,
    ) -> Result<RewrapSummary, SoftHsmError> {
        self.execute("rewrap_all_signing_keys_wrapped_by", |s| {
            s.rewrap_all_signing_keys_wrapped_by(wrapping_key_id, tenant_id)
        })
    }

    fn delete(&self, alias: &str, context: &WrappingKeyContext) -> Result<bool, SoftHsmError> {
        self.execute("delete", |s| s.delete(alias, context))
    }

    fn lookup_signing_key(
        &self,
        tenant_id: &str,
        key: &KeyReference,
    ) -> Result<SigningKeyEntity, SoftHsmError> {
        self.execute("lookup_signing_key", |s| s.lookup_signing_key(tenant_id, key))
    }
}
