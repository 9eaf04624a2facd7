//! Administrative HSM configuration.
//!
//! Requests arrive from an external transport as [`HsmConfigRequest`]
//! values. Only the reserved cluster tenant may issue them. Provisioning a
//! tenant with [`HsmConfigHandler::assign_hsm`] writes its HSM association
//! and makes sure the associated master wrapping key exists.
//!
//! A config may only list schemes the backing service supports, and
//! `capacity`, when set, caps the number of tenants assigned to it.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::entities::HsmAssociationEntity;
use crate::error::SoftHsmError;
use crate::repository::HsmAssociationRepository;
use crate::schemes::KeyScheme;
use crate::service::{CryptoService, WrappingKeyContext, WrappingKeyParent};

/// The platform's own tenant, the only one allowed to manage HSM configs.
pub const CLUSTER_TENANT_ID: &str = "cluster";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MasterKeyPolicy {
    /// Each tenant gets a freshly named master wrapping key.
    Unique,
    /// Every tenant uses a master wrapping key with this alias.
    Shared(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HsmConfig {
    /// Assigned on first put when empty.
    pub id: String,
    pub description: String,
    pub master_key_policy: MasterKeyPolicy,
    /// Maximum number of tenants; unlimited when `None`.
    pub capacity: Option<u32>,
    pub supported_schemes: Vec<KeyScheme>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HsmConfigRequest {
    PutHsmConfig(HsmConfig),
    LinkCategoriesToConfig {
        config_id: String,
        categories: Vec<String>,
    },
    LookupConfig {
        config_id: String,
    },
    LookupLinkedCategories {
        config_id: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HsmConfigResponse {
    ConfigId(String),
    Config(HsmConfig),
    LinkedCategories(Vec<String>),
}

pub struct HsmConfigHandler {
    configs: RwLock<HashMap<String, HsmConfig>>,
    categories: RwLock<HashMap<String, BTreeSet<String>>>,
    assigned: RwLock<HashMap<String, BTreeSet<String>>>,
    associations: Arc<dyn HsmAssociationRepository>,
    service: Arc<dyn CryptoService>,
    default_root: String,
}

impl HsmConfigHandler {
    pub fn new(
        associations: Arc<dyn HsmAssociationRepository>,
        service: Arc<dyn CryptoService>,
        default_root: &str,
    ) -> Self {
        Self {
            configs: RwLock::new(HashMap::new()),
            categories: RwLock::new(HashMap::new()),
            assigned: RwLock::new(HashMap::new()),
            associations,
            service,
            default_root: default_root.to_string(),
        }
    }

    pub fn handle(
        &self,
        tenant_id: &str,
        request: HsmConfigRequest,
    ) -> Result<HsmConfigResponse, SoftHsmError> {
        if tenant_id != CLUSTER_TENANT_ID {
            return Err(SoftHsmError::BadRequest(format!(
                "tenant '{tenant_id}' may not manage HSM configuration"
            )));
        }
        match request {
            HsmConfigRequest::PutHsmConfig(mut config) => {
                if config.id.trim().is_empty() {
                    config.id = Uuid::new_v4().to_string();
                }
                if let MasterKeyPolicy::Shared(alias) = &config.master_key_policy {
                    if alias.trim().is_empty() {
                        return Err(SoftHsmError::BadRequest(
                            "shared master key alias must not be blank".into(),
                        ));
                    }
                }
                let available = self.service.supported_schemes();
                if let Some(missing) = config
                    .supported_schemes
                    .iter()
                    .find(|s| !available.contains_key(s))
                {
                    return Err(SoftHsmError::BadRequest(format!(
                        "scheme {} is not supported by this HSM",
                        missing.code_name()
                    )));
                }
                let id = config.id.clone();
                info!(config_id = %id, "stored HSM config");
                self.configs.write().insert(id.clone(), config);
                Ok(HsmConfigResponse::ConfigId(id))
            }
            HsmConfigRequest::LinkCategoriesToConfig {
                config_id,
                categories,
            } => {
                self.config(&config_id)?;
                if categories.iter().any(|c| c.trim().is_empty()) {
                    return Err(SoftHsmError::BadRequest("category must not be blank".into()));
                }
                let mut links = self.categories.write();
                let linked = links.entry(config_id.clone()).or_default();
                linked.extend(categories.into_iter().map(|c| c.to_uppercase()));
                info!(config_id = %config_id, categories = linked.len(), "linked categories");
                Ok(HsmConfigResponse::LinkedCategories(linked.iter().cloned().collect()))
            }
            HsmConfigRequest::LookupConfig { config_id } => {
                Ok(HsmConfigResponse::Config(self.config(&config_id)?))
            }
            HsmConfigRequest::LookupLinkedCategories { config_id } => {
                self.config(&config_id)?;
                let linked = self
                    .categories
                    .read()
                    .get(&config_id)
                    .map(|c| c.iter().cloned().collect())
                    .unwrap_or_default();
                Ok(HsmConfigResponse::LinkedCategories(linked))
            }
        }
    }

    /// Associate `tenant_id` with a stored config and create its master
    /// wrapping key under the default root. Returns the existing
    /// association if the tenant is already provisioned.
    pub fn assign_hsm(
        &self,
        tenant_id: &str,
        config_id: &str,
    ) -> Result<HsmAssociationEntity, SoftHsmError> {
        if let Some(existing) = self.associations.find_by_tenant(tenant_id)? {
            return Ok(existing);
        }
        let config = self.config(config_id)?;
        if let Some(capacity) = config.capacity {
            let assigned = self.assigned.read().get(config_id).map_or(0, BTreeSet::len);
            if assigned >= capacity as usize {
                return Err(SoftHsmError::IllegalState(format!(
                    "HSM config '{config_id}' is at its capacity of {capacity} tenants"
                )));
            }
        }
        let alias = match &config.master_key_policy {
            MasterKeyPolicy::Unique => format!("{tenant_id}-master-{}", Uuid::new_v4().simple()),
            MasterKeyPolicy::Shared(alias) => alias.clone(),
        };
        self.service.create_wrapping_key(
            &alias,
            false,
            &WrappingKeyContext::new(
                tenant_id,
                WrappingKeyParent::Unmanaged(self.default_root.clone()),
            ),
        )?;
        let association = HsmAssociationEntity::new(tenant_id, &config.id, Some(alias));
        self.associations.save(association.clone())?;
        self.assigned
            .write()
            .entry(config.id.clone())
            .or_default()
            .insert(tenant_id.to_string());
        info!(tenant_id, config_id, alias = ?association.master_key_alias, "assigned HSM");
        Ok(association)
    }

    fn config(&self, config_id: &str) -> Result<HsmConfig, SoftHsmError> {
        self.configs
            .read()
            .get(config_id)
            .cloned()
            .ok_or_else(|| SoftHsmError::NotFound(format!("HSM config '{config_id}'")))
    }
}
