//! The crypto service contract and its software implementation.
//!
//! [`SoftCryptoService`] owns no persistent state. It orchestrates reads and
//! writes through the repositories and keeps two advisory caches: unwrapped
//! wrapping keys and signing-key rows by short fingerprint. Unwrapped signing
//! keys are never cached; they live in zeroising buffers for the duration of
//! a single call.
//!
//! The decorators in `throttling` and `retry` implement the same
//! [`CryptoService`] trait, so callers cannot tell a decorated service from
//! this one.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::cache::{ShortHashCache, WrappingKeyCache};
use crate::chain::{ChainResolver, UnmanagedRoots};
use crate::config::SoftHsmConfig;
use crate::entities::{
    SigningKeyEntity, SigningKeyHeader, SigningKeySaveContext, SigningKeyStatus, WrappingKeyInfo,
};
use crate::error::SoftHsmError;
use crate::repository::{
    HsmAssociationRepository, InMemoryHsmAssociationRepository, InMemorySigningRepositoryFactory,
    InMemoryWrappingRepositoryFactory, SigningRepository, SigningRepositoryFactory,
    WrappingRepository, WrappingRepositoryFactory,
};
use crate::schemes::{self, KeyScheme, PublicKey, SchemeMetadata, SignatureSpec};
use crate::wrapping::{WrappingKey, WRAPPING_ALGORITHM, WRAPPING_KEY_ENCODING_VERSION};

/// HSM id recorded on keys held by this software implementation.
pub const SOFT_HSM_ID: &str = "SOFT";

// ---------------------------------------------------------------------------
// Contract
// ---------------------------------------------------------------------------

/// Optional capabilities a crypto service advertises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CryptoServiceExtension {
    RequireWrappingKey,
    DeleteKeys,
    SharedSecretDerivation,
}

/// How a caller names a signing key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyReference {
    PublicKey(Vec<u8>),
    Alias(String),
}

impl KeyReference {
    fn diagnostics(&self) -> serde_json::Value {
        match self {
            Self::PublicKey(bytes) => json!({ "key_id": schemes::key_ids(bytes).0 }),
            Self::Alias(alias) => json!({ "alias": alias }),
        }
    }
}

impl From<&PublicKey> for KeyReference {
    fn from(key: &PublicKey) -> Self {
        Self::PublicKey(key.encoded.clone())
    }
}

#[derive(Debug, Clone)]
pub struct KeyGenerationRequest {
    pub tenant_id: String,
    pub category: String,
    pub scheme: KeyScheme,
    pub alias: Option<String>,
    pub external_id: Option<String>,
}

impl KeyGenerationRequest {
    pub fn new(tenant_id: &str, category: &str, scheme: KeyScheme) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            category: category.to_string(),
            scheme,
            alias: None,
            external_id: None,
        }
    }

    pub fn with_alias(mut self, alias: &str) -> Self {
        self.alias = Some(alias.to_string());
        self
    }

    pub fn with_external_id(mut self, external_id: &str) -> Self {
        self.external_id = Some(external_id.to_string());
        self
    }

    pub(crate) fn diagnostics(&self) -> serde_json::Value {
        json!({
            "tenant_id": self.tenant_id,
            "category": self.category,
            "scheme": self.scheme.code_name(),
            "alias": self.alias,
            "external_id": self.external_id,
        })
    }
}

#[derive(Debug, Clone)]
pub struct SignRequest {
    pub tenant_id: String,
    pub key: KeyReference,
    pub data: Vec<u8>,
    pub spec: SignatureSpec,
}

impl SignRequest {
    pub fn new(tenant_id: &str, key: KeyReference, data: &[u8], spec: SignatureSpec) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            key,
            data: data.to_vec(),
            spec,
        }
    }

    pub(crate) fn diagnostics(&self) -> serde_json::Value {
        json!({
            "tenant_id": self.tenant_id,
            "key": self.key.diagnostics(),
            "spec": self.spec.signature_name(),
            "data_len": self.data.len(),
        })
    }
}

/// Inputs for key agreement between a tenant-held key and a peer key.
#[derive(Debug, Clone)]
pub struct SharedSecretSpec {
    pub tenant_id: String,
    pub public_key: Vec<u8>,
    pub other_public_key: Vec<u8>,
}

impl SharedSecretSpec {
    pub(crate) fn diagnostics(&self) -> serde_json::Value {
        json!({
            "tenant_id": self.tenant_id,
            "key_id": schemes::key_ids(&self.public_key).0,
            "other_key_id": schemes::key_ids(&self.other_public_key).0,
        })
    }
}

/// The key a new or rotated wrapping key is wrapped by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WrappingKeyParent {
    /// A configuration-resident root, by name.
    Unmanaged(String),
    /// Another catalogued wrapping key, by alias.
    Managed(String),
}

impl WrappingKeyParent {
    fn name(&self) -> &str {
        match self {
            Self::Unmanaged(name) | Self::Managed(name) => name,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WrappingKeyContext {
    pub tenant_id: String,
    pub parent: WrappingKeyParent,
}

impl WrappingKeyContext {
    pub fn new(tenant_id: &str, parent: WrappingKeyParent) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            parent,
        }
    }
}

/// What a rewrap run did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewrapSummary {
    pub target_wrapping_key_id: Uuid,
    /// New material rows written.
    pub migrated: usize,
    /// Rows that already existed under the target key.
    pub already_present: usize,
}

/// Key custody operations. Implemented by [`SoftCryptoService`] and by every
/// decorator in front of it.
pub trait CryptoService: Send + Sync {
    fn extensions(&self) -> BTreeSet<CryptoServiceExtension>;

    fn supported_schemes(&self) -> BTreeMap<KeyScheme, Vec<SignatureSpec>>;

    /// Generate a key pair, wrap the private half under the tenant's current
    /// wrapping key and record both catalog rows.
    fn generate_key_pair(&self, request: &KeyGenerationRequest) -> Result<PublicKey, SoftHsmError>;

    fn sign(&self, request: &SignRequest) -> Result<Vec<u8>, SoftHsmError>;

    fn derive_shared_secret(&self, spec: &SharedSecretSpec) -> Result<Vec<u8>, SoftHsmError>;

    fn create_wrapping_key(
        &self,
        alias: &str,
        fail_if_exists: bool,
        context: &WrappingKeyContext,
    ) -> Result<(), SoftHsmError>;

    /// Re-encrypt a wrapping key's own material under `new_parent`.
    /// Returns the new generation.
    fn rewrap_wrapping_key(
        &self,
        tenant_id: &str,
        alias: &str,
        new_parent: &WrappingKeyParent,
    ) -> Result<i32, SoftHsmError>;

    /// Copy every signing key wrapped by `wrapping_key_id` under the tenant's
    /// current wrapping key. Old rows are kept.
    fn rewrap_all_signing_keys_wrapped_by(
        &self,
        wrapping_key_id: Uuid,
        tenant_id: &str,
    ) -> Result<RewrapSummary, SoftHsmError>;

    /// Delete an unreferenced wrapping key of the context's tenant. `false`
    /// if the alias is unknown. The context's parent is not consulted.
    fn delete(&self, alias: &str, context: &WrappingKeyContext) -> Result<bool, SoftHsmError>;

    fn lookup_signing_key(
        &self,
        tenant_id: &str,
        key: &KeyReference,
    ) -> Result<SigningKeyEntity, SoftHsmError>;
}

// ---------------------------------------------------------------------------
// Soft implementation
// ---------------------------------------------------------------------------

/// The repositories a service reads and writes through.
#[derive(Clone)]
pub struct Repositories {
    pub wrapping: Arc<dyn WrappingRepositoryFactory>,
    pub signing: Arc<dyn SigningRepositoryFactory>,
    pub associations: Arc<dyn HsmAssociationRepository>,
}

impl Repositories {
    pub fn in_memory() -> Self {
        Self {
            wrapping: Arc::new(InMemoryWrappingRepositoryFactory::new()),
            signing: Arc::new(InMemorySigningRepositoryFactory::new()),
            associations: Arc::new(InMemoryHsmAssociationRepository::new()),
        }
    }
}

pub struct SoftCryptoService {
    pub(crate) repositories: Repositories,
    pub(crate) scheme_metadata: SchemeMetadata,
    pub(crate) roots: UnmanagedRoots,
    pub(crate) wrapping_cache: Arc<WrappingKeyCache>,
    pub(crate) short_hash_cache: Arc<ShortHashCache>,
}

/// A resolved parent for wrapping a new or rotated key.
struct ResolvedParent {
    key: Arc<WrappingKey>,
    managed: bool,
    reference: String,
    chain_ids: Vec<Uuid>,
}

impl SoftCryptoService {
    /// Build a service whose roots and cache sizes come from `config`.
    pub fn new(config: &SoftHsmConfig, repositories: Repositories) -> Self {
        Self {
            repositories,
            scheme_metadata: SchemeMetadata::default(),
            roots: UnmanagedRoots::from_config(config),
            wrapping_cache: Arc::new(WrappingKeyCache::new(config.wrapping_key_cache.max_entries)),
            short_hash_cache: Arc::new(ShortHashCache::new(config.short_hash_cache.max_entries)),
        }
    }

    pub fn with_caches(
        mut self,
        wrapping_cache: Arc<WrappingKeyCache>,
        short_hash_cache: Arc<ShortHashCache>,
    ) -> Self {
        self.wrapping_cache = wrapping_cache;
        self.short_hash_cache = short_hash_cache;
        self
    }

    pub fn with_scheme_metadata(mut self, scheme_metadata: SchemeMetadata) -> Self {
        self.scheme_metadata = scheme_metadata;
        self
    }

    pub fn with_roots(mut self, roots: UnmanagedRoots) -> Self {
        self.roots = roots;
        self
    }

    pub fn repositories(&self) -> &Repositories {
        &self.repositories
    }

    pub(crate) fn wrapping_repo(
        &self,
        tenant_id: &str,
    ) -> Result<Arc<dyn WrappingRepository>, SoftHsmError> {
        self.repositories.wrapping.create(tenant_id)
    }

    pub(crate) fn signing_repo(
        &self,
        tenant_id: &str,
    ) -> Result<Arc<dyn SigningRepository>, SoftHsmError> {
        self.repositories.signing.create(tenant_id)
    }

    pub(crate) fn resolver<'a>(
        &'a self,
        tenant_id: &'a str,
        repository: &'a dyn WrappingRepository,
    ) -> ChainResolver<'a> {
        ChainResolver {
            tenant_id,
            repository,
            roots: &self.roots,
            cache: &self.wrapping_cache,
        }
    }

    /// The catalog row named by the tenant's HSM association.
    pub(crate) fn current_wrapping_key_info(
        &self,
        tenant_id: &str,
        repository: &dyn WrappingRepository,
    ) -> Result<WrappingKeyInfo, SoftHsmError> {
        let association = self
            .repositories
            .associations
            .find_by_tenant(tenant_id)?
            .ok_or_else(|| {
                SoftHsmError::NotFound(format!("HSM association for tenant '{tenant_id}'"))
            })?;
        let alias = association.master_key_alias.ok_or_else(|| {
            SoftHsmError::IllegalState(format!(
                "tenant '{tenant_id}' has no master key alias in its HSM association"
            ))
        })?;
        repository.find_key(&alias)?.ok_or_else(|| {
            SoftHsmError::IllegalState(format!(
                "Unable to find existing wrapping key '{alias}' for tenant '{tenant_id}'"
            ))
        })
    }

    fn resolve_parent(
        &self,
        tenant_id: &str,
        repository: &dyn WrappingRepository,
        parent: &WrappingKeyParent,
    ) -> Result<ResolvedParent, SoftHsmError> {
        match parent {
            WrappingKeyParent::Unmanaged(name) => {
                let key = self.roots.get(name).ok_or_else(|| {
                    SoftHsmError::IllegalState(format!(
                        "Unable to find parent key '{name}' for tenant '{tenant_id}'"
                    ))
                })?;
                Ok(ResolvedParent {
                    key,
                    managed: false,
                    reference: name.clone(),
                    chain_ids: Vec::new(),
                })
            }
            WrappingKeyParent::Managed(alias) => {
                let info = repository.find_key(alias)?.ok_or_else(|| {
                    SoftHsmError::IllegalState(format!(
                        "Unable to find parent key '{alias}' for tenant '{tenant_id}'"
                    ))
                })?;
                let resolver = self.resolver(tenant_id, repository);
                let chain = resolver.parent_chain(&info)?;
                let key = resolver.peel(&chain)?;
                Ok(ResolvedParent {
                    key,
                    managed: true,
                    reference: info.id.to_string(),
                    chain_ids: chain.links.iter().map(|l| l.id).collect(),
                })
            }
        }
    }

    /// Find a signing key row, consulting the short-hash cache first.
    fn find_signing_key(
        &self,
        tenant_id: &str,
        repository: &dyn SigningRepository,
        key: &KeyReference,
    ) -> Result<SigningKeyEntity, SoftHsmError> {
        let entity = match key {
            KeyReference::Alias(alias) => repository.find_by_alias(alias)?.ok_or_else(|| {
                SoftHsmError::NotFound(format!(
                    "signing key with alias '{alias}' for tenant '{tenant_id}'"
                ))
            })?,
            KeyReference::PublicKey(bytes) => {
                let (short, full) = schemes::key_ids(bytes);
                if let Some(hit) = self.short_hash_cache.get(tenant_id, &short) {
                    if hit.full_key_id == full {
                        debug!(tenant_id, key_id = %short, "short hash cache hit");
                        return Ok(hit);
                    }
                    debug!(tenant_id, key_id = %short, "short hash collision, using full key id");
                }
                let by_short = repository.lookup_by_key_ids(std::slice::from_ref(&short))?;
                let found = match by_short.into_iter().find(|k| k.full_key_id == full) {
                    Some(found) => Some(found),
                    None => repository.lookup_by_full_key_ids(&[full])?.into_iter().next(),
                };
                found.ok_or_else(|| {
                    SoftHsmError::NotFound(format!(
                        "signing key '{short}' for tenant '{tenant_id}'"
                    ))
                })?
            }
        };
        self.short_hash_cache.put(&entity);
        Ok(entity)
    }

    /// Re-read `entity` from the repository before its private half is used.
    /// Cached rows may carry a stale status.
    fn require_active(
        &self,
        tenant_id: &str,
        repository: &dyn SigningRepository,
        entity: SigningKeyEntity,
    ) -> Result<SigningKeyEntity, SoftHsmError> {
        let current = repository
            .find_by_public_key(&entity.public_key)?
            .ok_or_else(|| {
                self.short_hash_cache.invalidate(tenant_id, &entity.key_id);
                SoftHsmError::NotFound(format!(
                    "signing key '{}' for tenant '{tenant_id}'",
                    entity.key_id
                ))
            })?;
        if current.status == SigningKeyStatus::Destroyed {
            self.short_hash_cache.invalidate(tenant_id, &current.key_id);
            return Err(SoftHsmError::BadRequest(format!(
                "signing key '{}' of tenant '{tenant_id}' is destroyed",
                current.key_id
            )));
        }
        if current != entity {
            self.short_hash_cache.put(&current);
        }
        Ok(current)
    }

    /// Unwrap the private half of `entity` and hand it to `f`. The buffer is
    /// zeroised as soon as `f` returns.
    fn with_private_key<T>(
        &self,
        tenant_id: &str,
        entity: &SigningKeyEntity,
        f: impl FnOnce(&[u8]) -> Result<T, SoftHsmError>,
    ) -> Result<T, SoftHsmError> {
        let signing = self.signing_repo(tenant_id)?;
        let wrapping = self.wrapping_repo(tenant_id)?;

        let mut materials = signing.key_materials_for(entity.id)?;
        if materials.is_empty() {
            return Err(SoftHsmError::IllegalState(format!(
                "signing key '{}' of tenant '{tenant_id}' has no key material",
                entity.key_id
            )));
        }

        // Prefer the copy under the current wrapping key, else the newest.
        let current_id = match self.current_wrapping_key_info(tenant_id, wrapping.as_ref()) {
            Ok(info) => Some(info.id),
            Err(SoftHsmError::NotFound(_) | SoftHsmError::IllegalState(_)) => None,
            Err(err) => return Err(err),
        };
        materials.sort_by_key(|m| std::cmp::Reverse(m.created));
        let material = match materials
            .iter()
            .position(|m| Some(m.wrapping_key_id) == current_id)
        {
            Some(idx) => materials.swap_remove(idx),
            None => materials.swap_remove(0),
        };

        let info = wrapping
            .find_key_by_id(material.wrapping_key_id)?
            .ok_or_else(|| {
                SoftHsmError::IllegalState(format!(
                    "Unable to find existing wrapping key {} for tenant '{tenant_id}'",
                    material.wrapping_key_id
                ))
            })?;
        let key = self.resolver(tenant_id, wrapping.as_ref()).resolve(&info)?;
        let private: Zeroizing<Vec<u8>> = key.unwrap(&material.key_material)?;
        f(&private)
    }
}

fn require_non_blank(value: &str, what: &str) -> Result<(), SoftHsmError> {
    if value.trim().is_empty() {
        return Err(SoftHsmError::BadRequest(format!("{what} must not be blank")));
    }
    Ok(())
}

impl CryptoService for SoftCryptoService {
    fn extensions(&self) -> BTreeSet<CryptoServiceExtension> {
        BTreeSet::from([
            CryptoServiceExtension::RequireWrappingKey,
            CryptoServiceExtension::DeleteKeys,
            CryptoServiceExtension::SharedSecretDerivation,
        ])
    }

    fn supported_schemes(&self) -> BTreeMap<KeyScheme, Vec<SignatureSpec>> {
        self.scheme_metadata.supported_signature_specs()
    }

    fn generate_key_pair(&self, request: &KeyGenerationRequest) -> Result<PublicKey, SoftHsmError> {
        let tenant_id = request.tenant_id.as_str();
        require_non_blank(tenant_id, "tenant id")?;
        require_non_blank(&request.category, "category")?;
        if let Some(alias) = &request.alias {
            require_non_blank(alias, "alias")?;
        }
        let scheme = self.scheme_metadata.require(request.scheme)?;

        let signing = self.signing_repo(tenant_id)?;
        if let Some(alias) = &request.alias {
            if signing.find_by_alias(alias)?.is_some() {
                return Err(SoftHsmError::BadRequest(format!(
                    "signing key alias '{alias}' already exists for tenant '{tenant_id}'"
                )));
            }
        }

        let wrapping = self.wrapping_repo(tenant_id)?;
        let info = self.current_wrapping_key_info(tenant_id, wrapping.as_ref())?;
        let wrapping_key = self.resolver(tenant_id, wrapping.as_ref()).resolve(&info)?;

        let pair = schemes::generate_key_pair(scheme)?;
        let key_material = wrapping_key.wrap(&pair.private_key)?;
        drop(pair.private_key);

        let hsm_id = self
            .repositories
            .associations
            .find_by_tenant(tenant_id)?
            .map(|a| a.hsm_id)
            .unwrap_or_else(|| SOFT_HSM_ID.to_string());
        let entity = signing.save_signing_key(SigningKeySaveContext::WrappedKeySave {
            header: SigningKeyHeader {
                tenant_id: tenant_id.to_string(),
                category: request.category.clone(),
                alias: request.alias.clone(),
                external_id: request.external_id.clone(),
                scheme,
                hsm_id,
                public_key: pair.public_key.clone(),
            },
            wrapping_key_id: info.id,
            key_material,
        })?;
        self.short_hash_cache.put(&entity);

        info!(
            tenant_id,
            category = %request.category,
            scheme = scheme.code_name(),
            key_id = %entity.key_id,
            wrapping_key = %info.alias,
            "generated key pair"
        );
        Ok(PublicKey::new(scheme, pair.public_key))
    }

    fn sign(&self, request: &SignRequest) -> Result<Vec<u8>, SoftHsmError> {
        let tenant_id = request.tenant_id.as_str();
        require_non_blank(tenant_id, "tenant id")?;
        let signing = self.signing_repo(tenant_id)?;
        let entity = self.find_signing_key(tenant_id, signing.as_ref(), &request.key)?;
        let entity = self.require_active(tenant_id, signing.as_ref(), entity)?;
        let scheme = entity.scheme()?;
        if !scheme.signature_specs().contains(&request.spec) {
            return Err(SoftHsmError::BadRequest(format!(
                "signature spec '{}' is not supported by {}",
                request.spec.signature_name(),
                scheme.code_name()
            )));
        }
        let signature = self.with_private_key(tenant_id, &entity, |private| {
            schemes::sign(scheme, request.spec, private, &request.data)
        })?;
        debug!(tenant_id, key_id = %entity.key_id, spec = request.spec.signature_name(), "signed");
        Ok(signature)
    }

    fn derive_shared_secret(&self, spec: &SharedSecretSpec) -> Result<Vec<u8>, SoftHsmError> {
        let tenant_id = spec.tenant_id.as_str();
        require_non_blank(tenant_id, "tenant id")?;
        let signing = self.signing_repo(tenant_id)?;
        let entity = self.find_signing_key(
            tenant_id,
            signing.as_ref(),
            &KeyReference::PublicKey(spec.public_key.clone()),
        )?;
        let entity = self.require_active(tenant_id, signing.as_ref(), entity)?;
        let scheme = entity.scheme()?;
        if !scheme.supports_key_agreement() {
            return Err(SoftHsmError::BadRequest(format!(
                "{} keys cannot derive shared secrets",
                scheme.code_name()
            )));
        }
        let secret = self.with_private_key(tenant_id, &entity, |private| {
            schemes::derive_shared_secret(private, &spec.other_public_key)
        })?;
        Ok(secret.to_vec())
    }

    fn create_wrapping_key(
        &self,
        alias: &str,
        fail_if_exists: bool,
        context: &WrappingKeyContext,
    ) -> Result<(), SoftHsmError> {
        let tenant_id = context.tenant_id.as_str();
        require_non_blank(tenant_id, "tenant id")?;
        require_non_blank(alias, "wrapping key alias")?;
        let repo = self.wrapping_repo(tenant_id)?;

        if repo.find_key(alias)?.is_some() {
            if fail_if_exists {
                return Err(SoftHsmError::BadRequest(format!(
                    "wrapping key with alias '{alias}' already exists for tenant '{tenant_id}'"
                )));
            }
            info!(tenant_id, alias, "wrapping key already exists, nothing to create");
            return Ok(());
        }

        let parent = self.resolve_parent(tenant_id, repo.as_ref(), &context.parent)?;
        let key = WrappingKey::generate()?;
        let now = Utc::now();
        let info = repo.save_key(WrappingKeyInfo {
            id: Uuid::new_v4(),
            alias: alias.to_string(),
            generation: 1,
            created: now,
            encoding_version: WRAPPING_KEY_ENCODING_VERSION,
            algorithm_name: WRAPPING_ALGORITHM.to_string(),
            key_material: parent.key.wrap_key(&key)?,
            rotation_date: now,
            is_parent_key_managed: parent.managed,
            parent_key_reference: parent.reference,
        })?;
        self.wrapping_cache.put(tenant_id, info.id, Arc::new(key));

        info!(
            tenant_id,
            alias,
            wrapping_key_id = %info.id,
            parent = context.parent.name(),
            managed = info.is_parent_key_managed,
            "created wrapping key"
        );
        Ok(())
    }

    fn rewrap_wrapping_key(
        &self,
        tenant_id: &str,
        alias: &str,
        new_parent: &WrappingKeyParent,
    ) -> Result<i32, SoftHsmError> {
        require_non_blank(tenant_id, "tenant id")?;
        require_non_blank(alias, "wrapping key alias")?;
        let repo = self.wrapping_repo(tenant_id)?;
        let info = repo.find_key(alias)?.ok_or_else(|| {
            SoftHsmError::IllegalState(format!(
                "Unable to find existing wrapping key '{alias}' for tenant '{tenant_id}'"
            ))
        })?;
        let key = self.resolver(tenant_id, repo.as_ref()).resolve(&info)?;
        let parent = self.resolve_parent(tenant_id, repo.as_ref(), new_parent)?;
        if parent.chain_ids.contains(&info.id) {
            return Err(SoftHsmError::BadRequest(format!(
                "wrapping key '{alias}' cannot be wrapped by its own descendant '{}'",
                new_parent.name()
            )));
        }

        let mut updated = info.clone();
        updated.generation = info.generation + 1;
        updated.key_material = parent.key.wrap_key(&key)?;
        updated.is_parent_key_managed = parent.managed;
        updated.parent_key_reference = parent.reference;
        updated.rotation_date = Utc::now();
        let saved = repo.save_key(updated)?;
        self.wrapping_cache.invalidate(tenant_id, saved.id);

        info!(
            tenant_id,
            alias,
            generation = saved.generation,
            parent = new_parent.name(),
            "rewrapped wrapping key"
        );
        Ok(saved.generation)
    }

    fn rewrap_all_signing_keys_wrapped_by(
        &self,
        wrapping_key_id: Uuid,
        tenant_id: &str,
    ) -> Result<RewrapSummary, SoftHsmError> {
        self.rewrap_signing_keys(wrapping_key_id, tenant_id)
    }

    fn delete(&self, alias: &str, context: &WrappingKeyContext) -> Result<bool, SoftHsmError> {
        let tenant_id = context.tenant_id.as_str();
        require_non_blank(tenant_id, "tenant id")?;
        require_non_blank(alias, "alias")?;
        let repo = self.wrapping_repo(tenant_id)?;
        let Some(info) = repo.find_key(alias)? else {
            return Ok(false);
        };

        let in_use = |reason: &str| {
            SoftHsmError::IllegalState(format!(
                "wrapping key '{alias}' of tenant '{tenant_id}' is still {reason}"
            ))
        };
        if !self
            .signing_repo(tenant_id)?
            .key_materials_wrapped_by(info.id)?
            .is_empty()
        {
            return Err(in_use("wrapping signing keys"));
        }
        if !repo
            .find_keys_wrapped_by_parent(&info.id.to_string())?
            .is_empty()
        {
            return Err(in_use("wrapping other wrapping keys"));
        }
        let is_master = self
            .repositories
            .associations
            .find_by_tenant(tenant_id)?
            .and_then(|a| a.master_key_alias)
            .is_some_and(|a| a == alias);
        if is_master {
            return Err(in_use("the tenant's master key"));
        }

        let deleted = repo.delete_key(alias)?;
        self.wrapping_cache.invalidate(tenant_id, info.id);
        info!(tenant_id, alias, deleted, "deleted wrapping key");
        Ok(deleted)
    }

    fn lookup_signing_key(
        &self,
        tenant_id: &str,
        key: &KeyReference,
    ) -> Result<SigningKeyEntity, SoftHsmError> {
        require_non_blank(tenant_id, "tenant id")?;
        let signing = self.signing_repo(tenant_id)?;
        self.find_signing_key(tenant_id, signing.as_ref(), key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::HsmAssociationEntity;

    fn service_with_tenant(tenant: &str) -> SoftCryptoService {
        let config = SoftHsmConfig::with_root("root", "pass", "salt");
        let service = SoftCryptoService::new(&config, Repositories::in_memory());
        service
            .create_wrapping_key(
                "master",
                true,
                &WrappingKeyContext::new(tenant, WrappingKeyParent::Unmanaged("root".into())),
            )
            .unwrap();
        service
            .repositories
            .associations
            .save(HsmAssociationEntity::new(tenant, SOFT_HSM_ID, Some("master".into())))
            .unwrap();
        service
    }

    #[test]
    fn generate_then_sign_verifies() {
        let service = service_with_tenant("t");
        let public = service
            .generate_key_pair(&KeyGenerationRequest::new("t", "LEDGER", KeyScheme::EcdsaP256))
            .unwrap();
        let sig = service
            .sign(&SignRequest::new(
                "t",
                KeyReference::from(&public),
                b"hello",
                SignatureSpec::EcdsaSha256,
            ))
            .unwrap();
        assert!(public.verify(SignatureSpec::EcdsaSha256, b"hello", &sig));
    }

    #[test]
    fn blank_inputs_are_rejected_before_io() {
        let service = service_with_tenant("t");
        let err = service
            .generate_key_pair(&KeyGenerationRequest::new("t", " ", KeyScheme::Ed25519))
            .unwrap_err();
        assert!(matches!(err, SoftHsmError::BadRequest(_)));
    }

    #[test]
    fn unsupported_scheme_is_bad_request() {
        let service = service_with_tenant("t")
            .with_scheme_metadata(SchemeMetadata::new(vec![KeyScheme::Ed25519]));
        let err = service
            .generate_key_pair(&KeyGenerationRequest::new("t", "LEDGER", KeyScheme::EcdsaP384))
            .unwrap_err();
        assert!(matches!(err, SoftHsmError::BadRequest(_)));
    }

    #[test]
    fn tenant_without_association_is_not_found() {
        let service = service_with_tenant("t");
        let err = service
            .generate_key_pair(&KeyGenerationRequest::new("other", "LEDGER", KeyScheme::Ed25519))
            .unwrap_err();
        assert!(matches!(err, SoftHsmError::NotFound(_)));
    }

    #[test]
    fn duplicate_wrapping_alias_honours_fail_if_exists() {
        let service = service_with_tenant("t");
        let ctx = WrappingKeyContext::new("t", WrappingKeyParent::Unmanaged("root".into()));
        assert!(service.create_wrapping_key("master", false, &ctx).is_ok());
        assert!(matches!(
            service.create_wrapping_key("master", true, &ctx),
            Err(SoftHsmError::BadRequest(_))
        ));
    }

    /// Association store that starts failing on demand.
    struct FlakyAssociations {
        inner: InMemoryHsmAssociationRepository,
        failing: std::sync::atomic::AtomicBool,
    }

    impl FlakyAssociations {
        fn check(&self) -> Result<(), SoftHsmError> {
            if self.failing.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(SoftHsmError::Transient("association store unreachable".into()));
            }
            Ok(())
        }
    }

    impl HsmAssociationRepository for FlakyAssociations {
        fn find_by_tenant(
            &self,
            tenant_id: &str,
        ) -> Result<Option<HsmAssociationEntity>, SoftHsmError> {
            self.check()?;
            self.inner.find_by_tenant(tenant_id)
        }

        fn save(&self, entity: HsmAssociationEntity) -> Result<(), SoftHsmError> {
            self.check()?;
            self.inner.save(entity)
        }

        fn set_master_key_alias(&self, tenant_id: &str, alias: &str) -> Result<(), SoftHsmError> {
            self.check()?;
            self.inner.set_master_key_alias(tenant_id, alias)
        }
    }

    #[test]
    fn material_selection_propagates_infrastructure_errors() {
        let associations = Arc::new(FlakyAssociations {
            inner: InMemoryHsmAssociationRepository::new(),
            failing: std::sync::atomic::AtomicBool::new(false),
        });
        let repositories = Repositories {
            associations: associations.clone(),
            ..Repositories::in_memory()
        };
        let config = SoftHsmConfig::with_root("root", "pass", "salt");
        let service = SoftCryptoService::new(&config, repositories);
        service
            .create_wrapping_key(
                "master",
                true,
                &WrappingKeyContext::new("t", WrappingKeyParent::Unmanaged("root".into())),
            )
            .unwrap();
        associations
            .save(HsmAssociationEntity::new("t", SOFT_HSM_ID, Some("master".into())))
            .unwrap();
        let public = service
            .generate_key_pair(&KeyGenerationRequest::new("t", "LEDGER", KeyScheme::Ed25519))
            .unwrap();

        associations
            .failing
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let err = service
            .sign(&SignRequest::new(
                "t",
                KeyReference::from(&public),
                b"hello",
                SignatureSpec::EdDsa,
            ))
            .unwrap_err();
        assert!(matches!(err, SoftHsmError::Transient(_)));
    }

    #[test]
    fn delete_refuses_keys_in_use() {
        let service = service_with_tenant("t");
        let ctx = WrappingKeyContext::new("t", WrappingKeyParent::Managed("master".into()));
        assert!(matches!(
            service.delete("master", &ctx),
            Err(SoftHsmError::IllegalState(_))
        ));
        assert!(!service.delete("nope", &ctx).unwrap());

        service.create_wrapping_key("spare", true, &ctx).unwrap();
        // Another tenant's context does not reach this tenant's key.
        let foreign = WrappingKeyContext::new("u", WrappingKeyParent::Managed("master".into()));
        assert!(!service.delete("spare", &foreign).unwrap());
        assert!(service.delete("spare", &ctx).unwrap());
    }
}
