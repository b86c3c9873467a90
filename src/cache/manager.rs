//! Cache Registry
//!
//! Maps cache names to their implementations. Inbound replication events and bootstrap
//! requests name the cache they target; this is where that name is resolved.

use super::ReplicatedCache;

use dashmap::DashMap;
use std::sync::Arc;

pub struct CacheManager {
    caches: DashMap<String, Arc<dyn ReplicatedCache>>,
}

impl CacheManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            caches: DashMap::new(),
        })
    }

    /// Registers a cache under its own name, replacing any previous cache of that name.
    pub fn register(&self, cache: Arc<dyn ReplicatedCache>) {
        let name = cache.name().to_string();
        if self.caches.insert(name.clone(), cache).is_some() {
            tracing::warn!("Replaced previously registered cache {}", name);
        } else {
            tracing::info!("Registered cache {}", name);
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ReplicatedCache>> {
        self.caches.get(name).map(|entry| entry.value().clone())
    }

    pub fn unregister(&self, name: &str) -> Option<Arc<dyn ReplicatedCache>> {
        self.caches.remove(name).map(|(_, cache)| cache)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.caches.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.caches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.caches.is_empty()
    }
}

impl Default for CacheManager {
    fn default() -> Self {
        Self {
            caches: DashMap::new(),
        }
    }
}
