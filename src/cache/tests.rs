//! Cache Module Tests
//!
//! Validates the local cache mechanics the replication layer relies on.
//!
//! ## Test Scopes
//! - **Elements**: expiry arithmetic.
//! - **MemoryCache**: replica flag handling, quiet reads, transactions.
//! - **CacheManager**: lookup by name.

#[cfg(test)]
mod tests {
    use crate::cache::{CacheEventListener, CacheManager, Element, MemoryCache, ReplicatedCache};
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct RecordingListener {
        events: Mutex<Vec<String>>,
    }

    impl CacheEventListener for RecordingListener {
        fn notify_put(&self, cache_name: &str, element: &Element) {
            self.events
                .lock()
                .unwrap()
                .push(format!("put:{}:{}", cache_name, element.key));
        }

        fn notify_removed(&self, cache_name: &str, key: &str) {
            self.events
                .lock()
                .unwrap()
                .push(format!("remove:{}:{}", cache_name, key));
        }

        fn notify_removed_all(&self, cache_name: &str) {
            self.events
                .lock()
                .unwrap()
                .push(format!("clear:{}", cache_name));
        }
    }

    // ============================================================
    // ELEMENT TESTS
    // ============================================================

    #[test]
    fn test_element_without_ttl_never_expires() {
        let element = Element::new("k", b"v".to_vec());
        assert!(element.expires_at_ms().is_none());
        assert!(!element.is_expired());
    }

    #[test]
    fn test_element_with_elapsed_ttl_is_expired() {
        let mut element = Element::new("k", b"v".to_vec()).with_time_to_live(Some(10));
        element.created_at_ms -= 1_000;
        assert!(element.is_expired());
    }

    // ============================================================
    // MEMORY CACHE TESTS
    // ============================================================

    #[test]
    fn test_local_writes_notify_listeners() {
        let cache = MemoryCache::new("users");
        let listener = Arc::new(RecordingListener::default());
        cache.add_listener(listener.clone());

        cache.insert("alice", b"1".to_vec()).unwrap();
        cache.remove("alice", false).unwrap();
        cache.remove_all(false).unwrap();

        let events = listener.events.lock().unwrap().clone();
        assert_eq!(
            events,
            vec!["put:users:alice", "remove:users:alice", "clear:users"]
        );
    }

    #[test]
    fn test_replica_writes_are_silent() {
        let cache = MemoryCache::new("users");
        let listener = Arc::new(RecordingListener::default());
        cache.add_listener(listener.clone());

        cache.put(Element::new("bob", b"2".to_vec()), true).unwrap();
        cache.remove("bob", true).unwrap();
        cache.remove_all(true).unwrap();

        assert!(listener.events.lock().unwrap().is_empty());
    }

    #[test]
    fn test_remove_of_absent_key_reports_false_and_does_not_notify() {
        let cache = MemoryCache::new("users");
        let listener = Arc::new(RecordingListener::default());
        cache.add_listener(listener.clone());

        assert!(!cache.remove("ghost", false).unwrap());
        assert!(listener.events.lock().unwrap().is_empty());
    }

    #[test]
    fn test_empty_key_is_rejected() {
        let cache = MemoryCache::new("users");
        assert!(cache.put(Element::new("", b"x".to_vec()), false).is_err());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_get_quiet_hides_expired_elements() {
        let cache = MemoryCache::new("sessions");
        let mut element = Element::new("s1", b"token".to_vec()).with_time_to_live(Some(5));
        element.created_at_ms -= 100;
        cache.put(element, true).unwrap();

        assert!(cache.get_quiet("s1").is_none());
        assert_eq!(cache.keys(), vec!["s1".to_string()]);
        assert_eq!(cache.evict_expired(), 1);
        assert!(cache.keys().is_empty());
    }

    #[test]
    fn test_default_time_to_live_applies_to_inserts() {
        let cache = MemoryCache::with_time_to_live("short", Some(60_000));
        cache.insert("k", b"v".to_vec()).unwrap();

        let element = cache.get("k").expect("element should be present");
        assert_eq!(element.time_to_live_ms, Some(60_000));
    }

    #[test]
    fn test_transaction_scope_counts_commits() {
        let cache = MemoryCache::transactional("tx");
        assert!(!cache.is_transaction_active());

        cache.begin_transaction_if_needed();
        assert!(cache.is_transaction_active());
        cache.commit_transaction_if_needed();

        assert!(!cache.is_transaction_active());
        assert_eq!(cache.committed_transactions(), 1);
    }

    #[test]
    fn test_non_transactional_cache_ignores_scope() {
        let cache = MemoryCache::new("plain");
        cache.begin_transaction_if_needed();
        assert!(!cache.is_transaction_active());
        cache.commit_transaction_if_needed();
        assert_eq!(cache.committed_transactions(), 0);
    }

    // ============================================================
    // CACHE MANAGER TESTS
    // ============================================================

    #[test]
    fn test_manager_lookup_by_name() {
        let manager = CacheManager::new();
        manager.register(MemoryCache::new("b"));
        manager.register(MemoryCache::new("a"));

        assert_eq!(manager.len(), 2);
        assert_eq!(manager.names(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(manager.get("a").unwrap().name(), "a");
        assert!(manager.get("missing").is_none());

        assert!(manager.unregister("a").is_some());
        assert!(manager.get("a").is_none());
    }
}
