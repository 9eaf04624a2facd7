//! Advisory in-memory caches.
//!
//! Both caches are injected into the service at construction. A miss or a
//! stale entry is resolved by re-reading the repositories, never reported
//! as an error. Writers invalidate, readers repopulate.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::RwLock;
use uuid::Uuid;

use crate::entities::SigningKeyEntity;
use crate::wrapping::WrappingKey;

/// A map that evicts its oldest entry once `max_entries` is exceeded.
struct Bounded<K, V> {
    max_entries: usize,
    inner: RwLock<(HashMap<K, V>, VecDeque<K>)>,
}

impl<K: Eq + Hash + Clone, V: Clone> Bounded<K, V> {
    fn new(max_entries: usize) -> Self {
        Self {
            max_entries: max_entries.max(1),
            inner: RwLock::new((HashMap::new(), VecDeque::new())),
        }
    }

    fn get(&self, key: &K) -> Option<V> {
        self.inner.read().0.get(key).cloned()
    }

    fn put(&self, key: K, value: V) {
        let mut guard = self.inner.write();
        let (map, order) = &mut *guard;
        if map.insert(key.clone(), value).is_none() {
            order.push_back(key);
        }
        while map.len() > self.max_entries {
            match order.pop_front() {
                Some(oldest) => {
                    map.remove(&oldest);
                }
                None => break,
            }
        }
    }

    fn remove(&self, key: &K) {
        let mut guard = self.inner.write();
        let (map, order) = &mut *guard;
        if map.remove(key).is_some() {
            order.retain(|k| k != key);
        }
    }

    fn len(&self) -> usize {
        self.inner.read().0.len()
    }

    fn clear(&self) {
        let mut guard = self.inner.write();
        guard.0.clear();
        guard.1.clear();
    }
}

/// Unwrapped wrapping keys by `(tenant, wrapping key id)`.
pub struct WrappingKeyCache {
    entries: Bounded<(String, Uuid), Arc<WrappingKey>>,
}

impl WrappingKeyCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Bounded::new(max_entries),
        }
    }

    pub fn get(&self, tenant_id: &str, id: Uuid) -> Option<Arc<WrappingKey>> {
        self.entries.get(&(tenant_id.to_string(), id))
    }

    pub fn put(&self, tenant_id: &str, id: Uuid, key: Arc<WrappingKey>) {
        self.entries.put((tenant_id.to_string(), id), key);
    }

    pub fn invalidate(&self, tenant_id: &str, id: Uuid) {
        self.entries.remove(&(tenant_id.to_string(), id));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

/// Signing-key catalog rows by `(tenant, short key id)`.
pub struct ShortHashCache {
    entries: Bounded<(String, String), SigningKeyEntity>,
}

impl ShortHashCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Bounded::new(max_entries),
        }
    }

    pub fn get(&self, tenant_id: &str, key_id: &str) -> Option<SigningKeyEntity> {
        self.entries.get(&(tenant_id.to_string(), key_id.to_string()))
    }

    pub fn put(&self, entity: &SigningKeyEntity) {
        self.entries
            .put((entity.tenant_id.clone(), entity.key_id.clone()), entity.clone());
    }

    pub fn invalidate(&self, tenant_id: &str, key_id: &str) {
        self.entries.remove(&(tenant_id.to_string(), key_id.to_string()));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}
