//! Cache Replication Module
//!
//! Moves cache mutations between nodes.
//!
//! ## Flow
//! 1. A local write reaches the [`CacheReplicator`], which turns it into a [`CacheEvent`].
//! 2. The [`ReplicationTransport`] sends it immediately or parks it in a time window to be
//!    flushed with other events.
//! 3. On the receiving side the [`NotificationDispatcher`] decodes the message and applies
//!    each event as a replica write, which is never replicated again.

pub mod dispatcher;
pub mod protocol;
pub mod replicator;
pub mod transport;

pub use dispatcher::NotificationDispatcher;
pub use protocol::{CacheEvent, Delivery, EventKind, WireError, WirePayload};
pub use replicator::CacheReplicator;
pub use transport::ReplicationTransport;
