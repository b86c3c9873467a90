//! Cache Bootstrap Module
//!
//! Fills an empty cache on a joining node from the contents of a live peer.
//!
//! ## Core Concepts
//! - **Request**: one [`BootstrapRequest`] per cache being filled, registered by cache name
//!   in the [`PendingRequestRegistry`]. Inbound transfer events are matched by name.
//! - **Peer selection**: peers are tried one at a time, in random order, each with a
//!   bounded number of response waits.
//! - **Liveness**: the task driving a request holds a guard. Once the guard is dropped the
//!   request is abandoned and the registry stops reporting it.
//! - **Workers**: requesting and serving both run on a bounded [`WorkerPool`]. When the
//!   pool is saturated the caller does the work itself.

pub mod coordinator;
pub mod pool;
pub mod registry;
pub mod types;

pub use coordinator::BootstrapCoordinator;
pub use pool::{Submitted, WorkerPool};
pub use registry::PendingRequestRegistry;
pub use types::{BootstrapOutcome, BootstrapRequest, BootstrapStatus, RequestGuard};
