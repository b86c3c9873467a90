//! In-Memory Cache
//!
//! A concurrent, TTL-aware cache backed by `DashMap`. Local writes are reported to the
//! registered listeners; replica writes are applied silently so that a received
//! replication event never echoes back into the cluster.

use super::types::Element;
use super::{CacheEventListener, ReplicatedCache};

use anyhow::Result;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

pub struct MemoryCache {
    name: String,
    entries: DashMap<String, Element>,
    listeners: RwLock<Vec<Arc<dyn CacheEventListener>>>,
    default_time_to_live_ms: Option<u64>,
    transactional: bool,
    transaction_active: AtomicBool,
    committed_transactions: AtomicUsize,
}

impl MemoryCache {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Self::with_options(name, None, false)
    }

    /// Creates a cache whose elements expire after `time_to_live_ms` unless the element
    /// carries its own lifetime.
    pub fn with_time_to_live(name: impl Into<String>, time_to_live_ms: Option<u64>) -> Arc<Self> {
        Self::with_options(name, time_to_live_ms, false)
    }

    /// Creates a cache that exposes a transaction scope.
    pub fn transactional(name: impl Into<String>) -> Arc<Self> {
        Self::with_options(name, None, true)
    }

    pub fn with_options(
        name: impl Into<String>,
        default_time_to_live_ms: Option<u64>,
        transactional: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            entries: DashMap::new(),
            listeners: RwLock::new(Vec::new()),
            default_time_to_live_ms,
            transactional,
            transaction_active: AtomicBool::new(false),
            committed_transactions: AtomicUsize::new(0),
        })
    }

    pub fn add_listener(&self, listener: Arc<dyn CacheEventListener>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Application write: stores the value and notifies listeners.
    pub fn insert(&self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Result<()> {
        let element = Element::new(key, value).with_time_to_live(self.default_time_to_live_ms);
        self.put(element, false)
    }

    /// Application read. Expired elements are evicted and reported as absent.
    pub fn get(&self, key: &str) -> Option<Element> {
        let element = self.entries.get(key).map(|entry| entry.value().clone())?;
        if element.is_expired() {
            self.entries.remove_if(key, |_, current| current.is_expired());
            return None;
        }
        Some(element)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get_quiet(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops every expired element, returning how many were removed.
    pub fn evict_expired(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, element| !element.is_expired());
        before.saturating_sub(self.entries.len())
    }

    pub fn committed_transactions(&self) -> usize {
        self.committed_transactions.load(Ordering::SeqCst)
    }

    fn listeners(&self) -> Vec<Arc<dyn CacheEventListener>> {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ReplicatedCache for MemoryCache {
    fn name(&self) -> &str {
        &self.name
    }

    fn get_quiet(&self, key: &str) -> Option<Element> {
        self.entries
            .get(key)
            .map(|entry| entry.value().clone())
            .filter(|element| !element.is_expired())
    }

    fn keys(&self) -> Vec<String> {
        self.entries.iter().map(|entry| entry.key().clone()).collect()
    }

    fn put(&self, element: Element, replica: bool) -> Result<()> {
        if element.key.is_empty() {
            return Err(anyhow::anyhow!("Cannot store an element with an empty key"));
        }

        self.entries.insert(element.key.clone(), element.clone());

        if !replica {
            for listener in self.listeners() {
                listener.notify_put(&self.name, &element);
            }
        }
        Ok(())
    }

    fn remove(&self, key: &str, replica: bool) -> Result<bool> {
        let removed = self.entries.remove(key).is_some();

        if removed && !replica {
            for listener in self.listeners() {
                listener.notify_removed(&self.name, key);
            }
        }
        Ok(removed)
    }

    fn remove_all(&self, replica: bool) -> Result<()> {
        self.entries.clear();

        if !replica {
            for listener in self.listeners() {
                listener.notify_removed_all(&self.name);
            }
        }
        Ok(())
    }

    fn is_transaction_active(&self) -> bool {
        self.transactional && self.transaction_active.load(Ordering::SeqCst)
    }

    fn begin_transaction_if_needed(&self) {
        if self.transactional {
            self.transaction_active.store(true, Ordering::SeqCst);
        }
    }

    fn commit_transaction_if_needed(&self) {
        if self.transactional && self.transaction_active.swap(false, Ordering::SeqCst) {
            self.committed_transactions.fetch_add(1, Ordering::SeqCst);
        }
    }
}
