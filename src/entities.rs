//! Persistent key catalog rows.
//!
//! These mirror the relational layout: one HSM association per tenant, a
//! signing-key table, a signing-key-material table keyed by
//! `(wrapping_key_id, signing_key_id)`, and a wrapping-key table with a
//! unique alias. Every `key_material` field holds wrapped bytes only.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::schemes::{self, KeyScheme};

/// Encoding version written into signing-key rows.
pub const SIGNING_KEY_ENCODING_VERSION: i32 = 1;

/// Which HSM and master key alias scope a tenant's keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HsmAssociationEntity {
    pub id: Uuid,
    pub tenant_id: String,
    pub hsm_id: String,
    pub timestamp: DateTime<Utc>,
    /// Alias of the tenant's current wrapping key.
    pub master_key_alias: Option<String>,
}

impl HsmAssociationEntity {
    pub fn new(tenant_id: &str, hsm_id: &str, master_key_alias: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.to_string(),
            hsm_id: hsm_id.to_string(),
            timestamp: Utc::now(),
            master_key_alias,
        }
    }
}

/// Catalog row for a generated wrapping key.
///
/// `key_material` is only meaningful once unwrapped by the key named in
/// `parent_key_reference`: another row's id when `is_parent_key_managed`,
/// otherwise the name of a configuration-resident root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappingKeyInfo {
    pub id: Uuid,
    pub alias: String,
    pub generation: i32,
    pub created: DateTime<Utc>,
    pub encoding_version: i32,
    pub algorithm_name: String,
    pub key_material: Vec<u8>,
    pub rotation_date: DateTime<Utc>,
    pub is_parent_key_managed: bool,
    pub parent_key_reference: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SigningKeyStatus {
    Normal,
    Destroyed,
}

/// Public half of a tenant's signing key.
///
/// Immutable after creation except for `status` and `hsm_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningKeyEntity {
    pub id: Uuid,
    pub tenant_id: String,
    /// Short fingerprint, an index that tolerates collisions.
    pub key_id: String,
    pub full_key_id: String,
    pub created: DateTime<Utc>,
    pub category: String,
    pub scheme_code_name: String,
    pub public_key: Vec<u8>,
    pub encoding_version: i32,
    pub alias: Option<String>,
    pub hsm_alias: Option<String>,
    pub external_id: Option<String>,
    pub hsm_id: String,
    pub status: SigningKeyStatus,
}

impl SigningKeyEntity {
    pub fn scheme(&self) -> Result<KeyScheme, crate::error::SoftHsmError> {
        KeyScheme::from_code_name(&self.scheme_code_name)
    }
}

/// One wrapped copy of a signing private key.
///
/// A signing key gains one row per wrapping key that has ever wrapped it.
/// Rows are inserted, never updated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningKeyMaterialEntity {
    pub wrapping_key_id: Uuid,
    pub signing_key_id: Uuid,
    pub key_material: Vec<u8>,
    pub created: DateTime<Utc>,
}

/// The fields common to both ways of saving a signing key.
#[derive(Debug, Clone)]
pub struct SigningKeyHeader {
    pub tenant_id: String,
    pub category: String,
    pub alias: Option<String>,
    pub external_id: Option<String>,
    pub scheme: KeyScheme,
    pub hsm_id: String,
    pub public_key: Vec<u8>,
}

/// What to persist when a signing key is recorded.
#[derive(Debug, Clone)]
pub enum SigningKeySaveContext {
    /// The private half lives elsewhere; only the public key is catalogued.
    PublicKeySave {
        header: SigningKeyHeader,
        hsm_alias: Option<String>,
    },
    /// The private half is held here, wrapped by `wrapping_key_id`.
    WrappedKeySave {
        header: SigningKeyHeader,
        wrapping_key_id: Uuid,
        key_material: Vec<u8>,
    },
}

impl SigningKeySaveContext {
    pub fn header(&self) -> &SigningKeyHeader {
        match self {
            Self::PublicKeySave { header, .. } | Self::WrappedKeySave { header, .. } => header,
        }
    }

    /// Build the rows this context describes.
    pub fn into_entities(self) -> (SigningKeyEntity, Option<SigningKeyMaterialEntity>) {
        let now = Utc::now();
        let (header, hsm_alias, material) = match self {
            Self::PublicKeySave { header, hsm_alias } => (header, hsm_alias, None),
            Self::WrappedKeySave {
                header,
                wrapping_key_id,
                key_material,
            } => (header, None, Some((wrapping_key_id, key_material))),
        };
        let (key_id, full_key_id) = schemes::key_ids(&header.public_key);
        let entity = SigningKeyEntity {
            id: Uuid::new_v4(),
            tenant_id: header.tenant_id,
            key_id,
            full_key_id,
            created: now,
            category: header.category,
            scheme_code_name: header.scheme.code_name().to_string(),
            public_key: header.public_key,
            encoding_version: SIGNING_KEY_ENCODING_VERSION,
            alias: header.alias,
            hsm_alias,
            external_id: header.external_id,
            hsm_id: header.hsm_id,
            status: SigningKeyStatus::Normal,
        };
        let material = material.map(|(wrapping_key_id, key_material)| SigningKeyMaterialEntity {
            wrapping_key_id,
            signing_key_id: entity.id,
            key_material,
            created: now,
        });
        (entity, material)
    }
}
