//! Wrapping-key chain resolution.
//!
//! A wrapping key's stored material is itself wrapped by its parent, and so
//! on up to an unmanaged root held in configuration. Resolution walks the
//! catalog from a row up to its root, then peels top-down:
//!
//! ```text
//! root (config) -> unwrap(row_n) -> ... -> unwrap(row_0) = usable key
//! ```
//!
//! The walk always reads the repository, so a broken link is reported even
//! when the target key is cached. Only the unwrapping is served from cache.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use crate::cache::WrappingKeyCache;
use crate::config::SoftHsmConfig;
use crate::entities::WrappingKeyInfo;
use crate::error::SoftHsmError;
use crate::repository::WrappingRepository;
use crate::wrapping::WrappingKey;

/// Configuration-resident root keys, by name.
#[derive(Default)]
pub struct UnmanagedRoots {
    keys: HashMap<String, Arc<WrappingKey>>,
}

impl UnmanagedRoots {
    pub fn from_config(config: &SoftHsmConfig) -> Self {
        let keys = config
            .root_keys
            .iter()
            .map(|r| (r.name.clone(), Arc::new(WrappingKey::derive(&r.passphrase, &r.salt))))
            .collect();
        Self { keys }
    }

    pub fn insert(&mut self, name: impl Into<String>, key: WrappingKey) {
        self.keys.insert(name.into(), Arc::new(key));
    }

    pub fn get(&self, name: &str) -> Option<Arc<WrappingKey>> {
        self.keys.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.keys.contains_key(name)
    }
}

/// The catalog rows between a wrapping key and its root, nearest first.
pub struct ParentChain {
    pub links: Vec<WrappingKeyInfo>,
    pub root_name: String,
}

/// Resolves wrapping-key rows to usable keys for one tenant.
pub struct ChainResolver<'a> {
    pub tenant_id: &'a str,
    pub repository: &'a dyn WrappingRepository,
    pub roots: &'a UnmanagedRoots,
    pub cache: &'a WrappingKeyCache,
}

impl<'a> ChainResolver<'a> {
    /// Walk from `info` to its unmanaged root, failing on the first missing link.
    pub fn parent_chain(&self, info: &WrappingKeyInfo) -> Result<ParentChain, SoftHsmError> {
        let mut links = vec![info.clone()];
        let mut seen = HashSet::from([info.id]);
        loop {
            let current = &links[links.len() - 1];
            if !current.is_parent_key_managed {
                let root_name = current.parent_key_reference.clone();
                if !self.roots.contains(&root_name) {
                    return Err(SoftHsmError::IllegalState(format!(
                        "Unable to find parent key '{}' of wrapping key '{}' for tenant '{}'",
                        root_name, current.alias, self.tenant_id
                    )));
                }
                return Ok(ParentChain { links, root_name });
            }

            let parent = Uuid::parse_str(&current.parent_key_reference)
                .ok()
                .map(|id| self.repository.find_key_by_id(id))
                .transpose()?
                .flatten()
                .ok_or_else(|| {
                    SoftHsmError::IllegalState(format!(
                        "Unable to find parent key '{}' of wrapping key '{}' for tenant '{}'",
                        current.parent_key_reference, current.alias, self.tenant_id
                    ))
                })?;
            if !seen.insert(parent.id) {
                return Err(SoftHsmError::IllegalState(format!(
                    "wrapping key chain of '{}' loops back to '{}'",
                    info.alias, parent.alias
                )));
            }
            links.push(parent);
        }
    }

    /// Resolve `info` to a usable key.
    pub fn resolve(&self, info: &WrappingKeyInfo) -> Result<Arc<WrappingKey>, SoftHsmError> {
        let chain = self.parent_chain(info)?;
        self.peel(&chain)
    }

    /// Unwrap a resolved chain top-down, reusing cached links.
    pub fn peel(&self, chain: &ParentChain) -> Result<Arc<WrappingKey>, SoftHsmError> {
        let target = &chain.links[0];
        if let Some(hit) = self.cache.get(self.tenant_id, target.id) {
            debug!(tenant_id = self.tenant_id, alias = %target.alias, "wrapping key cache hit");
            return Ok(hit);
        }
        debug!(
            tenant_id = self.tenant_id,
            alias = %target.alias,
            depth = chain.links.len(),
            root = %chain.root_name,
            "wrapping key cache miss, unwrapping chain"
        );

        // Start below the nearest cached ancestor, or at the root.
        let mut start = chain.links.len();
        let mut key = None;
        for (i, link) in chain.links.iter().enumerate().skip(1) {
            if let Some(hit) = self.cache.get(self.tenant_id, link.id) {
                start = i;
                key = Some(hit);
                break;
            }
        }
        let mut key = match key {
            Some(k) => k,
            None => self.roots.get(&chain.root_name).ok_or_else(|| {
                SoftHsmError::IllegalState(format!(
                    "Unable to find parent key '{}' for tenant '{}'",
                    chain.root_name, self.tenant_id
                ))
            })?,
        };

        for link in chain.links[..start].iter().rev() {
            let unwrapped = Arc::new(key.unwrap_key(&link.key_material)?);
            self.cache.put(self.tenant_id, link.id, Arc::clone(&unwrapped));
            key = unwrapped;
        }
        Ok(key)
    }
}
