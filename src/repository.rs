//! Catalog repositories.
//!
//! Repositories exclusively own entity persistence. Wrapping and signing
//! repositories are scoped to one tenant and handed out by factories; the
//! HSM association repository spans tenants.
//!
//! The in-memory implementations stand in for a relational store with
//! read-committed isolation. The composite-key insert on key material is
//! the only consistency guard the rewrap protocol relies on.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use uuid::Uuid;

use crate::entities::{
    HsmAssociationEntity, SigningKeyEntity, SigningKeyMaterialEntity, SigningKeySaveContext,
    SigningKeyStatus, WrappingKeyInfo,
};
use crate::error::SoftHsmError;

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Wrapping-key catalog for one tenant.
pub trait WrappingRepository: Send + Sync {
    /// Insert or overwrite the row with `info.id`. Aliases are unique.
    fn save_key(&self, info: WrappingKeyInfo) -> Result<WrappingKeyInfo, SoftHsmError>;
    fn find_key(&self, alias: &str) -> Result<Option<WrappingKeyInfo>, SoftHsmError>;
    fn find_key_by_id(&self, id: Uuid) -> Result<Option<WrappingKeyInfo>, SoftHsmError>;
    /// Rows whose `parent_key_reference` equals `parent_reference`.
    fn find_keys_wrapped_by_parent(
        &self,
        parent_reference: &str,
    ) -> Result<Vec<WrappingKeyInfo>, SoftHsmError>;
    fn delete_key(&self, alias: &str) -> Result<bool, SoftHsmError>;
}

pub trait WrappingRepositoryFactory: Send + Sync {
    fn create(&self, tenant_id: &str) -> Result<Arc<dyn WrappingRepository>, SoftHsmError>;
}

/// Signing-key catalog and key-material copies for one tenant.
pub trait SigningRepository: Send + Sync {
    fn save_signing_key(
        &self,
        context: SigningKeySaveContext,
    ) -> Result<SigningKeyEntity, SoftHsmError>;
    fn find_by_alias(&self, alias: &str) -> Result<Option<SigningKeyEntity>, SoftHsmError>;
    fn find_by_public_key(&self, public_key: &[u8])
        -> Result<Option<SigningKeyEntity>, SoftHsmError>;
    fn lookup_by_key_ids(&self, key_ids: &[String]) -> Result<Vec<SigningKeyEntity>, SoftHsmError>;
    fn lookup_by_full_key_ids(
        &self,
        full_key_ids: &[String],
    ) -> Result<Vec<SigningKeyEntity>, SoftHsmError>;
    fn key_materials_for(
        &self,
        signing_key_id: Uuid,
    ) -> Result<Vec<SigningKeyMaterialEntity>, SoftHsmError>;
    fn key_materials_wrapped_by(
        &self,
        wrapping_key_id: Uuid,
    ) -> Result<Vec<SigningKeyMaterialEntity>, SoftHsmError>;
    /// Insert-if-absent on `(wrapping_key_id, signing_key_id)`. Returns
    /// `false`, leaving the stored row untouched, on a duplicate.
    fn insert_key_material(&self, material: SigningKeyMaterialEntity) -> Result<bool, SoftHsmError>;
    fn set_status(&self, signing_key_id: Uuid, status: SigningKeyStatus)
        -> Result<(), SoftHsmError>;
}

pub trait SigningRepositoryFactory: Send + Sync {
    fn create(&self, tenant_id: &str) -> Result<Arc<dyn SigningRepository>, SoftHsmError>;
}

/// Tenant to HSM association lookups.
pub trait HsmAssociationRepository: Send + Sync {
    fn find_by_tenant(&self, tenant_id: &str) -> Result<Option<HsmAssociationEntity>, SoftHsmError>;
    fn save(&self, entity: HsmAssociationEntity) -> Result<(), SoftHsmError>;
    fn set_master_key_alias(&self, tenant_id: &str, alias: &str) -> Result<(), SoftHsmError>;
}

// ---------------------------------------------------------------------------
// In-memory wrapping repository
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct InMemoryWrappingRepository {
    rows: RwLock<HashMap<Uuid, WrappingKeyInfo>>,
}

impl WrappingRepository for InMemoryWrappingRepository {
    fn save_key(&self, info: WrappingKeyInfo) -> Result<WrappingKeyInfo, SoftHsmError> {
        let mut rows = self.rows.write();
        if rows
            .values()
            .any(|r| r.alias == info.alias && r.id != info.id)
        {
            return Err(SoftHsmError::BadRequest(format!(
                "wrapping key alias '{}' already exists",
                info.alias
            )));
        }
        rows.insert(info.id, info.clone());
        Ok(info)
    }

    fn find_key(&self, alias: &str) -> Result<Option<WrappingKeyInfo>, SoftHsmError> {
        Ok(self.rows.read().values().find(|r| r.alias == alias).cloned())
    }

    fn find_key_by_id(&self, id: Uuid) -> Result<Option<WrappingKeyInfo>, SoftHsmError> {
        Ok(self.rows.read().get(&id).cloned())
    }

    fn find_keys_wrapped_by_parent(
        &self,
        parent_reference: &str,
    ) -> Result<Vec<WrappingKeyInfo>, SoftHsmError> {
        Ok(self
            .rows
            .read()
            .values()
            .filter(|r| r.parent_key_reference == parent_reference)
            .cloned()
            .collect())
    }

    fn delete_key(&self, alias: &str) -> Result<bool, SoftHsmError> {
        let mut rows = self.rows.write();
        let id = rows.values().find(|r| r.alias == alias).map(|r| r.id);
        Ok(id.and_then(|id| rows.remove(&id)).is_some())
    }
}

/// Hands out one in-memory wrapping repository per tenant.
#[derive(Debug, Default)]
pub struct InMemoryWrappingRepositoryFactory {
    tenants: RwLock<HashMap<String, Arc<InMemoryWrappingRepository>>>,
}

impl InMemoryWrappingRepositoryFactory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WrappingRepositoryFactory for InMemoryWrappingRepositoryFactory {
    fn create(&self, tenant_id: &str) -> Result<Arc<dyn WrappingRepository>, SoftHsmError> {
        require_tenant(tenant_id)?;
        let repo = Arc::clone(self.tenants.write().entry(tenant_id.to_string()).or_default());
        Ok(repo)
    }
}

// ---------------------------------------------------------------------------
// In-memory signing repository
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct InMemorySigningRepository {
    keys: RwLock<HashMap<Uuid, SigningKeyEntity>>,
    materials: RwLock<HashMap<(Uuid, Uuid), SigningKeyMaterialEntity>>,
}

impl SigningRepository for InMemorySigningRepository {
    fn save_signing_key(
        &self,
        context: SigningKeySaveContext,
    ) -> Result<SigningKeyEntity, SoftHsmError> {
        let (entity, material) = context.into_entities();
        {
            let mut keys = self.keys.write();
            if let Some(alias) = &entity.alias {
                if keys.values().any(|k| k.alias.as_ref() == Some(alias)) {
                    return Err(SoftHsmError::BadRequest(format!(
                        "signing key alias '{alias}' already exists for tenant '{}'",
                        entity.tenant_id
                    )));
                }
            }
            if keys.values().any(|k| k.full_key_id == entity.full_key_id) {
                return Err(SoftHsmError::BadRequest(format!(
                    "public key {} is already registered",
                    entity.full_key_id
                )));
            }
            keys.insert(entity.id, entity.clone());
        }
        if let Some(material) = material {
            self.insert_key_material(material)?;
        }
        Ok(entity)
    }

    fn find_by_alias(&self, alias: &str) -> Result<Option<SigningKeyEntity>, SoftHsmError> {
        Ok(self
            .keys
            .read()
            .values()
            .find(|k| k.alias.as_deref() == Some(alias))
            .cloned())
    }

    fn find_by_public_key(
        &self,
        public_key: &[u8],
    ) -> Result<Option<SigningKeyEntity>, SoftHsmError> {
        Ok(self
            .keys
            .read()
            .values()
            .find(|k| k.public_key == public_key)
            .cloned())
    }

    fn lookup_by_key_ids(&self, key_ids: &[String]) -> Result<Vec<SigningKeyEntity>, SoftHsmError> {
        Ok(self
            .keys
            .read()
            .values()
            .filter(|k| key_ids.contains(&k.key_id))
            .cloned()
            .collect())
    }

    fn lookup_by_full_key_ids(
        &self,
        full_key_ids: &[String],
    ) -> Result<Vec<SigningKeyEntity>, SoftHsmError> {
        Ok(self
            .keys
            .read()
            .values()
            .filter(|k| full_key_ids.contains(&k.full_key_id))
            .cloned()
            .collect())
    }

    fn key_materials_for(
        &self,
        signing_key_id: Uuid,
    ) -> Result<Vec<SigningKeyMaterialEntity>, SoftHsmError> {
        Ok(self
            .materials
            .read()
            .values()
            .filter(|m| m.signing_key_id == signing_key_id)
            .cloned()
            .collect())
    }

    fn key_materials_wrapped_by(
        &self,
        wrapping_key_id: Uuid,
    ) -> Result<Vec<SigningKeyMaterialEntity>, SoftHsmError> {
        Ok(self
            .materials
            .read()
            .values()
            .filter(|m| m.wrapping_key_id == wrapping_key_id)
            .cloned()
            .collect())
    }

    fn insert_key_material(&self, material: SigningKeyMaterialEntity) -> Result<bool, SoftHsmError> {
        let mut materials = self.materials.write();
        let key = (material.wrapping_key_id, material.signing_key_id);
        if materials.contains_key(&key) {
            return Ok(false);
        }
        materials.insert(key, material);
        Ok(true)
    }

    fn set_status(
        &self,
        signing_key_id: Uuid,
        status: SigningKeyStatus,
    ) -> Result<(), SoftHsmError> {
        let mut keys = self.keys.write();
        let key = keys
            .get_mut(&signing_key_id)
            .ok_or_else(|| SoftHsmError::NotFound(format!("signing key {signing_key_id}")))?;
        key.status = status;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct InMemorySigningRepositoryFactory {
    tenants: RwLock<HashMap<String, Arc<InMemorySigningRepository>>>,
}

impl InMemorySigningRepositoryFactory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SigningRepositoryFactory for InMemorySigningRepositoryFactory {
    fn create(&self, tenant_id: &str) -> Result<Arc<dyn SigningRepository>, SoftHsmError> {
        require_tenant(tenant_id)?;
        let repo = Arc::clone(self.tenants.write().entry(tenant_id.to_string()).or_default());
        Ok(repo)
    }
}

// ---------------------------------------------------------------------------
// In-memory association repository
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct InMemoryHsmAssociationRepository {
    rows: RwLock<HashMap<String, HsmAssociationEntity>>,
}

impl InMemoryHsmAssociationRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HsmAssociationRepository for InMemoryHsmAssociationRepository {
    fn find_by_tenant(&self, tenant_id: &str) -> Result<Option<HsmAssociationEntity>, SoftHsmError> {
        Ok(self.rows.read().get(tenant_id).cloned())
    }

    fn save(&self, entity: HsmAssociationEntity) -> Result<(), SoftHsmError> {
        require_tenant(&entity.tenant_id)?;
        self.rows.write().insert(entity.tenant_id.clone(), entity);
        Ok(())
    }

    fn set_master_key_alias(&self, tenant_id: &str, alias: &str) -> Result<(), SoftHsmError> {
        let mut rows = self.rows.write();
        let row = rows
            .get_mut(tenant_id)
            .ok_or_else(|| SoftHsmError::NotFound(format!("HSM association for tenant '{tenant_id}'")))?;
        row.master_key_alias = Some(alias.to_string());
        Ok(())
    }
}

fn require_tenant(tenant_id: &str) -> Result<(), SoftHsmError> {
    if tenant_id.trim().is_empty() {
        return Err(SoftHsmError::BadRequest("tenant id must not be blank".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{SigningKeyHeader, SigningKeySaveContext};
    use crate::schemes::KeyScheme;
    use chrono::Utc;

    fn wrapping_row(alias: &str) -> WrappingKeyInfo {
        WrappingKeyInfo {
            id: Uuid::new_v4(),
            alias: alias.into(),
            generation: 1,
            created: Utc::now(),
            encoding_version: 1,
            algorithm_name: "AES".into(),
            key_material: vec![0; 60],
            rotation_date: Utc::now(),
            is_parent_key_managed: false,
            parent_key_reference: "root".into(),
        }
    }

    #[test]
    fn wrapping_aliases_are_unique() {
        let repo = InMemoryWrappingRepository::default();
        let row = repo.save_key(wrapping_row("k1")).unwrap();
        assert!(repo.save_key(wrapping_row("k1")).is_err());

        // Same id overwrites.
        let mut updated = row.clone();
        updated.generation = 2;
        repo.save_key(updated).unwrap();
        assert_eq!(repo.find_key("k1").unwrap().unwrap().generation, 2);
        assert_eq!(repo.find_keys_wrapped_by_parent("root").unwrap().len(), 1);
        assert!(repo.delete_key("k1").unwrap());
        assert!(!repo.delete_key("k1").unwrap());
    }

    #[test]
    fn factories_isolate_tenants() {
        let factory = InMemoryWrappingRepositoryFactory::new();
        factory.create("a").unwrap().save_key(wrapping_row("k")).unwrap();
        assert!(factory.create("b").unwrap().find_key("k").unwrap().is_none());
        assert!(factory.create("a").unwrap().find_key("k").unwrap().is_some());
        assert!(factory.create("  ").is_err());
    }

    #[test]
    fn material_insert_is_insert_if_absent() {
        let repo = InMemorySigningRepository::default();
        let wrapping_key_id = Uuid::new_v4();
        let entity = repo
            .save_signing_key(SigningKeySaveContext::WrappedKeySave {
                header: SigningKeyHeader {
                    tenant_id: "t".into(),
                    category: "LEDGER".into(),
                    alias: Some("a".into()),
                    external_id: None,
                    scheme: KeyScheme::Ed25519,
                    hsm_id: "SOFT".into(),
                    public_key: vec![4; 32],
                },
                wrapping_key_id,
                key_material: vec![1; 48],
            })
            .unwrap();

        let duplicate = SigningKeyMaterialEntity {
            wrapping_key_id,
            signing_key_id: entity.id,
            key_material: vec![2; 48],
            created: Utc::now(),
        };
        assert!(!repo.insert_key_material(duplicate).unwrap());
        let rows = repo.key_materials_for(entity.id).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].key_material, vec![1; 48]);

        let found = repo.lookup_by_key_ids(&[entity.key_id.clone()]).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(repo.find_by_alias("a").unwrap().unwrap().id, entity.id);
    }
}
