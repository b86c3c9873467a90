//! Group Communication Module
//!
//! Provides the membership view and messaging substrate the replication layer runs on.
//! Replication only needs four things from a group: who is in it, who we are, a way to
//! send bytes to one member or to everyone else, and a callback for inbound messages.
//! Those are captured by [`GroupTransport`].
//!
//! ## Implementations
//! - **`GossipGroup`**: UDP gossip membership (inspired by SWIM) with suspect/dead failure
//!   detection and incarnation numbers. Replication payloads travel as length-prefixed
//!   `Data` frames over one TCP stream per peer, so they are not bound by datagram size.
//! - **`LocalNetwork`**: in-process endpoints connected through a hub, with ordered
//!   per-endpoint delivery. Used by tests and single-process setups.

pub mod local;
pub mod service;
pub mod types;

pub use local::{LocalEndpoint, LocalNetwork};
pub use service::GossipGroup;
pub use types::NodeId;

use anyhow::Result;
use std::sync::Arc;

/// Target of an outbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// Every current member except the sender.
    Broadcast,
    Member(NodeId),
}

/// Inbound message callback. Invoked once per received message with the raw payload.
pub trait MessageReceiver: Send + Sync {
    fn receive(&self, from: &NodeId, payload: &[u8]);
}

/// Membership view plus send/receive, as consumed by the replication layer.
pub trait GroupTransport: Send + Sync {
    /// Current members, including the local node, in a stable order.
    fn current_members(&self) -> Vec<NodeId>;

    fn local_address(&self) -> NodeId;

    /// Hands the payload to the group. Messages are never delivered back to the sender.
    fn send(&self, destination: &Destination, payload: Vec<u8>) -> Result<()>;

    /// Installs the inbound callback, replacing any previous one.
    fn set_receiver(&self, receiver: Arc<dyn MessageReceiver>);

    /// Drops the inbound callback.
    fn clear_receiver(&self);

    fn other_members(&self) -> Vec<NodeId> {
        let local = self.local_address();
        self.current_members()
            .into_iter()
            .filter(|member| member != &local)
            .collect()
    }
}

#[cfg(test)]
mod tests;
