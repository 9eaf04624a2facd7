//! Bounded retries with a per-attempt timeout.
//!
//! Each attempt runs on a worker thread and the caller waits at most
//! `attempt_timeout` for its result. The timeout bounds the wait only: a
//! timed-out attempt keeps running and may still complete its writes, which
//! is safe because every write is keyed by a content-stable identifier.
//!
//! Recoverable failures are retried after `wait_between` until
//! `max_attempts` is spent. Bad-request, not-found, state and
//! authentication errors reach the caller unchanged. Anything else that
//! survives is reported as a single [`SoftHsmError::CryptoService`] naming
//! the operation and its non-secret arguments.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde_json::json;
use tracing::{error, warn};
use uuid::Uuid;

use crate::config::RetryConfig;
use crate::entities::SigningKeyEntity;
use crate::error::{Recoverability, SoftHsmError};
use crate::schemes::{KeyScheme, PublicKey, SignatureSpec};
use crate::service::{
    CryptoService, CryptoServiceExtension, KeyGenerationRequest, KeyReference, RewrapSummary,
    SharedSecretSpec, SignRequest, WrappingKeyContext, WrappingKeyParent,
};
use crate::throttling::{thread_sleeper, Sleeper};

pub struct RetryTimeoutDecorator<S> {
    inner: Arc<S>,
    max_attempts: u32,
    attempt_timeout: Duration,
    wait_between: Duration,
    sleeper: Sleeper,
}

impl<S: CryptoService + 'static> RetryTimeoutDecorator<S> {
    pub fn new(inner: S, config: &RetryConfig) -> Self {
        Self {
            inner: Arc::new(inner),
            max_attempts: config.max_attempts.max(1),
            attempt_timeout: config.attempt_timeout(),
            wait_between: config.wait_between(),
            sleeper: thread_sleeper(),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Sleeper) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn execute<T, F>(
        &self,
        operation: &'static str,
        arguments: serde_json::Value,
        call: F,
    ) -> Result<T, SoftHsmError>
    where
        T: Send + 'static,
        F: Fn(&S) -> Result<T, SoftHsmError> + Send + Sync + 'static,
    {
        let call = Arc::new(call);
        let mut attempt = 1;
        let failure = loop {
            let err = match self.attempt(operation, Arc::clone(&call)) {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if err.recoverability() == Recoverability::NonRecoverable || attempt >= self.max_attempts {
                break err;
            }
            warn!(
                operation,
                attempt,
                max_attempts = self.max_attempts,
                error = %err,
                "attempt failed, retrying"
            );
            (*self.sleeper)(self.wait_between);
            attempt += 1;
        };

        if !failure.is_translatable() {
            return Err(failure);
        }
        error!(operation, attempt, error = %failure, "crypto service call failed");
        Err(SoftHsmError::CryptoService {
            operation: operation.to_string(),
            arguments,
            reason: failure.to_string(),
        })
    }

    fn attempt<T, F>(&self, operation: &'static str, call: Arc<F>) -> Result<T, SoftHsmError>
    where
        T: Send + 'static,
        F: Fn(&S) -> Result<T, SoftHsmError> + Send + Sync + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let inner = Arc::clone(&self.inner);
        thread::Builder::new()
            .name(format!("softhsm-{operation}"))
            .spawn(move || {
                let _ = tx.send((*call)(&*inner));
            })
            .map_err(|e| SoftHsmError::Transient(format!("cannot start {operation}: {e}")))?;

        match rx.recv_timeout(self.attempt_timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                warn!(operation, timeout_ms = self.attempt_timeout.as_millis() as u64, "attempt timed out");
                Err(SoftHsmError::Timeout {
                    operation: operation.to_string(),
                    timeout: self.attempt_timeout,
                })
            }
            Err(RecvTimeoutError::Disconnected) => Err(SoftHsmError::Transient(format!(
                "{operation} worker exited without a result"
            ))),
        }
    }
}

impl<S: CryptoService + 'static> CryptoService for RetryTimeoutDecorator<S> {
    fn extensions(&self) -> BTreeSet<CryptoServiceExtension> {
        self.inner.extensions()
    }

    fn supported_schemes(&self) -> BTreeMap<KeyScheme, Vec<SignatureSpec>> {
        self.inner.supported_schemes()
    }

    fn generate_key_pair(&self, request: &KeyGenerationRequest) -> Result<PublicKey, SoftHsmError> {
        let request = request.clone();
        self.execute("generate_key_pair", request.diagnostics(), move |s| {
            s.generate_key_pair(&request)
        })
    }

    fn sign(&self, request: &SignRequest) -> Result<Vec<u8>, SoftHsmError> {
        let request = request.clone();
        self.execute("sign", request.diagnostics(), move |s| s.sign(&request))
    }

    fn derive_shared_secret(&self, spec: &SharedSecretSpec) -> Result<Vec<u8>, SoftHsmError> {
        let spec = spec.clone();
        self.execute("derive_shared_secret", spec.diagnostics(), move |s| {
            s.derive_shared_secret(&spec)
        })
    }

    fn create_wrapping_key(
        &self,
        alias: &str,
        fail_if_exists: bool,
        context: &WrappingKeyContext,
    ) -> Result<(), SoftHsmError> {
        let alias = alias.to_string();
        let context = context.clone();
        let arguments = json!({
            "alias": alias,
            "fail_if_exists": fail_if_exists,
            "tenant_id": context.tenant_id,
        });
        self.execute("create_wrapping_key", arguments, move |s| {
            s.create_wrapping_key(&alias, fail_if_exists, &context)
        })
    }

    fn rewrap_wrapping_key(
        &self,
        tenant_id: &str,
        alias: &str,
        new_parent: &WrappingKeyParent,
    ) -> Result<i32, SoftHsmError> {
        let (tenant_id, alias, new_parent) =
            (tenant_id.to_string(), alias.to_string(), new_parent.clone());
        let arguments = json!({ "tenant_id": tenant_id, "alias": alias });
        self.execute("rewrap_wrapping_key", arguments, move |s| {
            s.rewrap_wrapping_key(&tenant_id, &alias, &new_parent)
        })
    }

    fn rewrap_all_signing_keys_wrapped_by(
        &self,
        wrapping_key_id: Uuid,
        tenant_id: &str,
    ) -> Result<RewrapSummary, SoftHsmError> {
        let tenant_id = tenant_id.to_string();
        let arguments = json!({
            "wrapping_key_id": wrapping_key_id.to_string(),
            "tenant_id": tenant_id,
        });
        self.execute("rewrap_all_signing_keys_wrapped_by", arguments, move |s| {
            s.rewrap_all_signing_keys_wrapped_by(wrapping_key_id, &tenant_id)
        })
    }

    fn delete(&self, alias: &str, context: &WrappingKeyContext) -> Result<bool, SoftHsmError> {
        let (alias, context) = (alias.to_string(), context.clone());
        let arguments = json!({ "alias": alias, "tenant_id": context.tenant_id });
        self.execute("delete", arguments, move |s| s.delete(&alias, &context))
    }

    fn lookup_signing_key(
        &self,
        tenant_id: &str,
        key: &KeyReference,
    ) -> Result<SigningKeyEntity, SoftHsmError> {
        let (tenant_id, key) = (tenant_id.to_string(), key.clone());
        let arguments = json!({ "tenant_id": tenant_id });
        self.execute("lookup_signing_key", arguments, move |s| {
            s.lookup_signing_key(&tenant_id, &key)
        })
    }
}
