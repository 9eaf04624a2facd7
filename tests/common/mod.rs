//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use softhsm::entities::{HsmAssociationEntity, SigningKeyEntity};
use softhsm::error::SoftHsmError;
use softhsm::schemes::{KeyScheme, PublicKey, SignatureSpec};
use softhsm::service::{
    CryptoService, CryptoServiceExtension, KeyGenerationRequest, KeyReference, Repositories,
    RewrapSummary, SharedSecretSpec, SignRequest, SoftCryptoService, WrappingKeyContext,
    WrappingKeyParent, SOFT_HSM_ID,
};
use softhsm::throttling::Sleeper;
use softhsm::SoftHsmConfig;
use uuid::Uuid;

pub const TENANT: &str = "tenant-a";

pub fn config() -> SoftHsmConfig {
    SoftHsmConfig::with_root("root", "correct horse battery staple", "nacl")
}

/// A service whose tenant has master wrapping key `k1` under the root.
pub fn provisioned_service(repositories: Repositories) -> SoftCryptoService {
    let service = SoftCryptoService::new(&config(), repositories);
    service
        .create_wrapping_key(
            "k1",
            true,
            &WrappingKeyContext::new(TENANT, WrappingKeyParent::Unmanaged("root".into())),
        )
        .unwrap();
    service
        .repositories()
        .associations
        .save(HsmAssociationEntity::new(TENANT, SOFT_HSM_ID, Some("k1".into())))
        .unwrap();
    service
}

pub fn wrapping_key_id(service: &SoftCryptoService, alias: &str) -> Uuid {
    service
        .repositories()
        .wrapping
        .create(TENANT)
        .unwrap()
        .find_key(alias)
        .unwrap()
        .unwrap()
        .id
}

/// Records requested delays instead of sleeping.
pub fn recording_sleeper() -> (Sleeper, Arc<Mutex<Vec<Duration>>>) {
    let delays = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&delays);
    let sleeper: Sleeper = Arc::new(move |d| sink.lock().unwrap().push(d));
    (sleeper, delays)
}

/// A service whose `sign` replays a script of results.
#[derive(Default)]
pub struct ScriptedService {
    pub script: Mutex<VecDeque<Result<Vec<u8>, SoftHsmError>>>,
    pub calls: AtomicUsize,
    pub delay: Option<Duration>,
}

impl ScriptedService {
    pub fn new(script: Vec<Result<Vec<u8>, SoftHsmError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            ..Self::default()
        }
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

fn not_scripted<T>() -> Result<T, SoftHsmError> {
    Err(SoftHsmError::BadRequest("not scripted".into()))
}

impl CryptoService for ScriptedService {
    fn extensions(&self) -> BTreeSet<CryptoServiceExtension> {
        BTreeSet::new()
    }

    fn supported_schemes(&self) -> BTreeMap<KeyScheme, Vec<SignatureSpec>> {
        BTreeMap::new()
    }

    fn generate_key_pair(&self, _: &KeyGenerationRequest) -> Result<PublicKey, SoftHsmError> {
        not_scripted()
    }

    fn sign(&self, _: &SignRequest) -> Result<Vec<u8>, SoftHsmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(b"signature".to_vec()))
    }

    fn derive_shared_secret(&self, _: &SharedSecretSpec) -> Result<Vec<u8>, SoftHsmError> {
        not_scripted()
    }

    fn create_wrapping_key(
        &self,
        _: &str,
        _: bool,
        _: &WrappingKeyContext,
    ) -> Result<(), SoftHsmError> {
        not_scripted()
    }

    fn rewrap_wrapping_key(
        &self,
        _: &str,
        _: &str,
        _: &WrappingKeyParent,
    ) -> Result<i32, SoftHsmError> {
        not_scripted()
    }

    fn rewrap_all_signing_keys_wrapped_by(
        &self,
        _: Uuid,
        _: &str,
    ) -> Result<RewrapSummary, SoftHsmError> {
        not_scripted()
    }

    fn delete(&self, _: &str, _: &WrappingKeyContext) -> Result<bool, SoftHsmError> {
        not_scripted()
    }

    fn lookup_signing_key(
        &self,
        _: &str,
        _: &KeyReference,
    ) -> Result<SigningKeyEntity, SoftHsmError> {
        not_scripted()
    }
}

pub fn sign_request() -> SignRequest {
    SignRequest::new(
        TENANT,
        KeyReference::Alias("any".into()),
        b"payload",
        SignatureSpec::EdDsa,
    )
}
