//! Node Module Tests
//!
//! ## Test Scopes
//! - **Wiring**: configured caches are attached and replicate between members.
//! - **Lifecycle**: bootstrap on start and disposal.
//! - **Gossip**: bootstrap between members of a real loopback `GossipGroup`.
//! - **HTTP**: handler behaviour against a live node.

#[cfg(test)]
mod tests {
    use crate::bootstrap::BootstrapOutcome;
    use crate::cache::{Element, ReplicatedCache};
    use crate::config::{CacheSettings, GroupSettings, ReplicationConfig};
    use crate::group::{GossipGroup, LocalEndpoint, LocalNetwork};
    use crate::node::ReplicationNode;
    use crate::node::handlers::{
        handle_bootstrap, handle_clear, handle_get, handle_put, handle_remove, handle_status,
    };
    use crate::node::protocol::{BootstrapQuery, PutRequest};
    use axum::Json;
    use axum::extract::{Extension, Path, Query};
    use axum::http::StatusCode;
    use std::sync::Arc;
    use std::time::Duration;

    fn config(caches: Vec<CacheSettings>) -> ReplicationConfig {
        ReplicationConfig {
            caches,
            ..ReplicationConfig::default()
        }
    }

    fn synchronous(name: &str) -> CacheSettings {
        CacheSettings {
            replicate_asynchronously: false,
            bootstrap_asynchronously: false,
            ..CacheSettings::new(name)
        }
    }

    fn start(
        network: &Arc<LocalNetwork>,
        name: &str,
        caches: Vec<CacheSettings>,
    ) -> (Arc<LocalEndpoint>, Arc<ReplicationNode>) {
        let endpoint = network.join(name);
        let node = ReplicationNode::start(config(caches), endpoint.clone()).unwrap();
        (endpoint, node)
    }

    async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        false
    }

    // ============================================================
    // WIRING TESTS
    // ============================================================

    #[tokio::test]
    async fn test_configured_caches_are_attached() {
        let network = LocalNetwork::new();
        let (_, node) = start(
            &network,
            "a",
            vec![synchronous("users"), synchronous("orders")],
        );

        assert_eq!(node.cache_names(), vec!["orders", "users"]);
        assert!(node.cache("users").is_some());
        assert!(node.cache("missing").is_none());
    }

    #[tokio::test]
    async fn test_local_writes_reach_the_peer_once() {
        let network = LocalNetwork::new();
        let (a_endpoint, a) = start(&network, "a", vec![synchronous("users")]);
        let (b_endpoint, b) = start(&network, "b", vec![synchronous("users")]);

        a.cache("users").unwrap().insert("alice", b"1".to_vec()).unwrap();
        let b_users = b.cache("users").unwrap();
        assert!(eventually(|| b_users.contains_key("alice")).await);

        a.cache("users").unwrap().remove("alice", false).unwrap();
        assert!(eventually(|| !b_users.contains_key("alice")).await);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(a_endpoint.sent_messages(), 2);
        assert_eq!(b_endpoint.sent_messages(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_asynchronous_cache_replicates_after_window() {
        let network = LocalNetwork::new();
        let settings = CacheSettings {
            async_window_ms: 200,
            ..CacheSettings::new("sessions")
        };
        let (_, a) = start(&network, "a", vec![settings.clone()]);
        let (_, b) = start(&network, "b", vec![settings]);

        a.cache("sessions").unwrap().insert("s1", b"token".to_vec()).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let b_sessions = b.cache("sessions").unwrap();
        assert!(!b_sessions.contains_key("s1"));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(eventually(|| b_sessions.contains_key("s1")).await);
    }

    // ============================================================
    // LIFECYCLE TESTS
    // ============================================================

    #[tokio::test]
    async fn test_bootstrap_on_start_fills_new_member() {
        let network = LocalNetwork::new();
        let (_, veteran) = start(&network, "veteran", vec![synchronous("users")]);
        let users = veteran.cache("users").unwrap();
        for i in 0..120 {
            users.put(crate::cache::Element::new(format!("u{}", i), b"x".to_vec()), true).unwrap();
        }

        let skipped = CacheSettings {
            bootstrap_on_start: false,
            ..synchronous("audit")
        };
        let (_, newcomer) = start(&network, "newcomer", vec![synchronous("users"), skipped]);

        let outcomes = newcomer.bootstrap_caches().await;

        assert_eq!(
            outcomes,
            vec![(
                "users".to_string(),
                BootstrapOutcome::Complete { replicated: 120 }
            )]
        );
        assert_eq!(newcomer.cache("users").unwrap().len(), 120);
    }

    #[tokio::test]
    async fn test_bootstrap_of_unknown_cache_fails() {
        let network = LocalNetwork::new();
        let (_, node) = start(&network, "a", vec![synchronous("users")]);

        assert!(node.bootstrap("orders", false).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispose_flushes_queued_writes_and_detaches() {
        let network = LocalNetwork::new();
        let settings = CacheSettings::new("users");
        let (_, a) = start(&network, "a", vec![settings.clone()]);
        let (_, b) = start(&network, "b", vec![settings]);

        a.cache("users").unwrap().insert("alice", b"1".to_vec()).unwrap();
        a.dispose().await;

        let b_users = b.cache("users").unwrap();
        assert!(eventually(|| b_users.contains_key("alice")).await);
        assert!(!a.transport().is_alive());
        assert!(!a.coordinator().is_alive());

        b.cache("users").unwrap().insert("bob", b"2".to_vec()).unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!a.cache("users").unwrap().contains_key("bob"));
    }

    // ============================================================
    // GOSSIP TESTS
    // ============================================================

    fn loopback(seeds: Vec<std::net::SocketAddr>) -> GroupSettings {
        GroupSettings {
            bind: Some("127.0.0.1:0".parse().unwrap()),
            seeds,
            multicast_addr: "127.0.0.1".parse().unwrap(),
            ..GroupSettings::default()
        }
    }

    #[tokio::test]
    async fn test_bootstrap_over_gossip_group_with_large_values() {
        let seed_group = GossipGroup::new(&loopback(vec![])).await.unwrap();
        let seed = ReplicationNode::start(config(vec![synchronous("users")]), seed_group.clone())
            .unwrap();
        seed_group.start();

        let users = seed.cache("users").unwrap();
        for i in 0..150 {
            users
                .put(Element::new(format!("u{}", i), vec![i as u8; 1024]), true)
                .unwrap();
        }

        let joiner_group = GossipGroup::new(&loopback(vec![seed_group.local_node.addr]))
            .await
            .unwrap();
        let joiner =
            ReplicationNode::start(config(vec![synchronous("users")]), joiner_group.clone())
                .unwrap();
        joiner_group.start();
        assert!(joiner_group.wait_for_members(2, Duration::from_secs(5)).await);
        assert!(seed_group.wait_for_members(2, Duration::from_secs(5)).await);

        let outcome = joiner.bootstrap("users", false).await.unwrap();

        assert_eq!(outcome, BootstrapOutcome::Complete { replicated: 150 });
        let copied = joiner.cache("users").unwrap();
        assert_eq!(copied.len(), 150);
        assert_eq!(copied.get("u149").unwrap().value, vec![149u8; 1024]);

        joiner.dispose().await;
        seed.dispose().await;
        joiner_group.shutdown();
        seed_group.shutdown();
    }

    // ============================================================
    // HTTP TESTS
    // ============================================================

    #[tokio::test]
    async fn test_http_put_get_remove() {
        let network = LocalNetwork::new();
        let (_, node) = start(&network, "a", vec![synchronous("users")]);
        let path = || Path(("users".to_string(), "alice".to_string()));

        let (status, Json(put)) = handle_put(
            Extension(node.clone()),
            path(),
            Json(PutRequest {
                value: "hello".to_string(),
                time_to_live_ms: None,
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(put.success);

        let (status, Json(got)) = handle_get(Extension(node.clone()), path()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(got.value.as_deref(), Some("hello"));

        let (_, Json(removed)) = handle_remove(Extension(node.clone()), path()).await;
        assert!(removed.removed);

        let (status, _) = handle_get(Extension(node), path()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_http_unknown_cache_is_not_found() {
        let network = LocalNetwork::new();
        let (_, node) = start(&network, "a", vec![synchronous("users")]);

        let (status, _) = handle_get(
            Extension(node.clone()),
            Path(("orders".to_string(), "o1".to_string())),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, Json(response)) = handle_bootstrap(
            Extension(node),
            Path("orders".to_string()),
            Query(BootstrapQuery::default()),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(response.outcome, "unknown_cache");
    }

    #[tokio::test]
    async fn test_http_clear_and_status() {
        let network = LocalNetwork::new();
        let (_, node) = start(&network, "a", vec![synchronous("users")]);
        node.cache("users").unwrap().insert("k", b"v".to_vec()).unwrap();

        let (_, Json(status)) = handle_status(Extension(node.clone())).await;
        assert_eq!(status.node, "a");
        assert_eq!(status.members, vec!["a"]);
        assert_eq!(status.caches[0].entries, 1);
        assert!(status.pending_bootstraps.is_empty());

        let (_, Json(cleared)) =
            handle_clear(Extension(node.clone()), Path("users".to_string())).await;
        assert!(cleared.removed);
        assert!(node.cache("users").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_http_bootstrap_without_peers() {
        let network = LocalNetwork::new();
        let (_, node) = start(&network, "a", vec![synchronous("users")]);

        let (status, Json(response)) = handle_bootstrap(
            Extension(node),
            Path("users".to_string()),
            Query(BootstrapQuery::default()),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(response.outcome, "no_peers");
    }
}
