//! Group Module Tests
//!
//! Validates the membership substrate replication runs on.
//!
//! ## Test Scopes
//! - **Data Structures**: identity types and wire messages of the gossip protocol.
//! - **GossipGroup**: initialization, member lookup and `Data` frame delivery over loopback.
//! - **LocalNetwork**: ordered delivery, broadcast fan-out and receiver handling.

#[cfg(test)]
mod tests {
    use crate::config::GroupSettings;
    use crate::group::types::{GossipMessage, Node, NodeId, NodeState};
    use crate::group::{
        Destination, GossipGroup, GroupTransport, LocalNetwork, MessageReceiver,
    };
    use std::net::SocketAddr;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Default)]
    struct Inbox {
        messages: Mutex<Vec<(NodeId, Vec<u8>)>>,
    }

    impl MessageReceiver for Inbox {
        fn receive(&self, from: &NodeId, payload: &[u8]) {
            self.messages
                .lock()
                .unwrap()
                .push((from.clone(), payload.to_vec()));
        }
    }

    impl Inbox {
        fn payloads(&self) -> Vec<Vec<u8>> {
            self.messages
                .lock()
                .unwrap()
                .iter()
                .map(|(_, payload)| payload.clone())
                .collect()
        }
    }

    fn loopback_settings(seeds: Vec<SocketAddr>) -> GroupSettings {
        GroupSettings {
            bind: Some("127.0.0.1:0".parse().unwrap()),
            seeds,
            multicast_addr: "127.0.0.1".parse().unwrap(),
            ..GroupSettings::default()
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        for _ in 0..100 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        condition()
    }

    // ============================================================
    // NODE ID TESTS
    // ============================================================

    #[test]
    fn test_node_id_is_unique() {
        let id1 = NodeId::new();
        let id2 = NodeId::new();

        assert_ne!(id1, id2, "Each NodeId should be unique");
    }

    #[test]
    fn test_node_id_ordering_is_lexicographic() {
        let mut ids = vec![
            NodeId("node-c".to_string()),
            NodeId("node-a".to_string()),
            NodeId("node-b".to_string()),
        ];
        ids.sort();

        assert_eq!(ids[0].to_string(), "node-a");
        assert_eq!(ids[2].to_string(), "node-c");
    }

    // ============================================================
    // GOSSIP MESSAGE TESTS
    // ============================================================

    #[test]
    fn test_node_bincode_serialization_skips_last_seen() {
        let node = Node {
            id: NodeId("bincode-test".to_string()),
            addr: "10.0.0.1:5000".parse().unwrap(),
            state: NodeState::Suspect,
            incarnation: 100,
            last_seen: Some(std::time::Instant::now()),
        };

        let encoded = bincode::serialize(&node).expect("Bincode serialization failed");
        let restored: Node = bincode::deserialize(&encoded).expect("Bincode deserialization failed");

        assert_eq!(restored.id, node.id);
        assert_eq!(restored.state, NodeState::Suspect);
        assert!(restored.last_seen.is_none());
    }

    #[test]
    fn test_gossip_data_frame_serialization() {
        let msg = GossipMessage::Data {
            from: NodeId("sender".to_string()),
            payload: vec![1, 2, 3],
        };

        let encoded = bincode::serialize(&msg).expect("Failed to serialize Data");
        let decoded: GossipMessage =
            bincode::deserialize(&encoded).expect("Failed to deserialize Data");

        if let GossipMessage::Data { from, payload } = decoded {
            assert_eq!(from.0, "sender");
            assert_eq!(payload, vec![1, 2, 3]);
        } else {
            panic!("Wrong message type");
        }
    }

    // ============================================================
    // GOSSIP GROUP TESTS
    // ============================================================

    #[tokio::test]
    async fn test_gossip_group_creation() {
        let group = GossipGroup::new(&loopback_settings(vec![]))
            .await
            .expect("Failed to create group");

        assert_eq!(group.members.len(), 1);
        assert_eq!(group.current_members(), vec![group.local_address()]);
        assert!(group.other_members().is_empty());
        assert!(group.announce_addr().is_none());
    }

    #[tokio::test]
    async fn test_gossip_group_send_to_unknown_member_fails() {
        let group = GossipGroup::new(&loopback_settings(vec![])).await.unwrap();

        let result = group.send(
            &Destination::Member(NodeId("nobody".to_string())),
            b"payload".to_vec(),
        );

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_gossip_groups_discover_each_other_and_exchange_data() {
        let seed = GossipGroup::new(&loopback_settings(vec![])).await.unwrap();
        seed.start();

        let joiner = GossipGroup::new(&loopback_settings(vec![seed.local_node.addr]))
            .await
            .unwrap();
        joiner.start();

        assert!(wait_until(|| seed.current_members().len() == 2).await);
        assert!(wait_until(|| joiner.current_members().len() == 2).await);

        let inbox = Arc::new(Inbox::default());
        seed.set_receiver(inbox.clone());

        joiner
            .send(&Destination::Broadcast, b"replicate-me".to_vec())
            .unwrap();

        assert!(wait_until(|| !inbox.payloads().is_empty()).await);
        let messages = inbox.messages.lock().unwrap().clone();
        assert_eq!(messages[0].0, joiner.local_address());
        assert_eq!(messages[0].1, b"replicate-me".to_vec());

        seed.shutdown();
        joiner.shutdown();
    }

    #[tokio::test]
    async fn test_gossip_group_delivers_payloads_larger_than_a_datagram() {
        let seed = GossipGroup::new(&loopback_settings(vec![])).await.unwrap();
        seed.start();
        let joiner = GossipGroup::new(&loopback_settings(vec![seed.local_node.addr]))
            .await
            .unwrap();
        joiner.start();
        assert!(seed.wait_for_members(2, Duration::from_secs(5)).await);
        assert!(joiner.wait_for_members(2, Duration::from_secs(5)).await);

        let inbox = Arc::new(Inbox::default());
        joiner.set_receiver(inbox.clone());

        let payloads: Vec<Vec<u8>> = (0..3u8)
            .map(|i| (0..200 * 1024).map(|j| (j % 251) as u8 ^ i).collect())
            .collect();
        for payload in &payloads {
            seed.send(&Destination::Member(joiner.local_address()), payload.clone())
                .unwrap();
        }
        seed.send(&Destination::Broadcast, b"done".to_vec()).unwrap();

        assert!(wait_until(|| inbox.payloads().len() == 4).await);
        let received = inbox.payloads();
        assert_eq!(&received[..3], &payloads[..]);
        assert_eq!(received[3], b"done".to_vec());

        seed.shutdown();
        joiner.shutdown();
    }

    #[tokio::test]
    async fn test_wait_for_members_times_out_when_alone() {
        let group = GossipGroup::new(&loopback_settings(vec![])).await.unwrap();
        group.start();

        assert!(group.wait_for_members(1, Duration::from_millis(10)).await);
        assert!(!group.wait_for_members(2, Duration::from_millis(300)).await);

        group.shutdown();
    }

    // ============================================================
    // LOCAL NETWORK TESTS
    // ============================================================

    #[tokio::test]
    async fn test_local_network_delivers_in_order() {
        let network = LocalNetwork::new();
        let a = network.join("a");
        let b = network.join("b");

        let inbox = Arc::new(Inbox::default());
        b.set_receiver(inbox.clone());

        for i in 0..10u8 {
            a.send(&Destination::Member(b.local_address()), vec![i]).unwrap();
        }

        assert!(wait_until(|| inbox.payloads().len() == 10).await);
        let expected: Vec<Vec<u8>> = (0..10u8).map(|i| vec![i]).collect();
        assert_eq!(inbox.payloads(), expected);
        assert_eq!(a.sent_messages(), 10);
    }

    #[tokio::test]
    async fn test_local_network_broadcast_skips_sender() {
        let network = LocalNetwork::new();
        let a = network.join("a");
        let b = network.join("b");
        let c = network.join("c");

        let inbox_a = Arc::new(Inbox::default());
        let inbox_b = Arc::new(Inbox::default());
        let inbox_c = Arc::new(Inbox::default());
        a.set_receiver(inbox_a.clone());
        b.set_receiver(inbox_b.clone());
        c.set_receiver(inbox_c.clone());

        a.send(&Destination::Broadcast, b"hello".to_vec()).unwrap();

        assert!(wait_until(|| inbox_b.payloads().len() == 1 && inbox_c.payloads().len() == 1).await);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(inbox_a.payloads().is_empty());
        assert_eq!(a.other_members(), vec![b.local_address(), c.local_address()]);
    }

    #[tokio::test]
    async fn test_local_network_leave_removes_member() {
        let network = LocalNetwork::new();
        let a = network.join("a");
        let b = network.join("b");

        network.leave(b.id());

        assert_eq!(a.current_members(), vec![a.local_address()]);
        assert!(
            a.send(&Destination::Member(b.local_address()), vec![1])
                .is_err()
        );
    }
}
