//! Local Cache Module
//!
//! The replication layer never owns cache data. It reads and mutates caches through the
//! narrow [`ReplicatedCache`] interface and locates them by name via [`CacheManager`].
//!
//! ## Core Concepts
//! - **Replica writes**: every mutating call carries a `replica` flag. Writes that originate
//!   from a received replication event are flagged so they are never broadcast again.
//! - **Quiet reads**: `get_quiet` reads without touching access statistics, which is what
//!   bootstrap serving and idempotent removes need.
//! - **Transactions**: caches may expose a transaction scope; the inbound dispatcher opens
//!   one around each applied event when none is active.
//! - **Listeners**: local (non-replica) writes are reported to [`CacheEventListener`]s, which
//!   is how the replicator learns about application mutations.

pub mod manager;
pub mod memory;
pub mod types;

pub use manager::CacheManager;
pub use memory::MemoryCache;
pub use types::{Element, now_ms};

use anyhow::Result;

/// The cache operations consumed by the replication layer.
pub trait ReplicatedCache: Send + Sync {
    fn name(&self) -> &str;

    /// Reads an element without recording an access.
    fn get_quiet(&self, key: &str) -> Option<Element>;

    fn keys(&self) -> Vec<String>;

    fn put(&self, element: Element, replica: bool) -> Result<()>;

    /// Returns `true` if an element was removed.
    fn remove(&self, key: &str, replica: bool) -> Result<bool>;

    fn remove_all(&self, replica: bool) -> Result<()>;

    fn is_transaction_active(&self) -> bool {
        false
    }

    fn begin_transaction_if_needed(&self) {}

    fn commit_transaction_if_needed(&self) {}
}

/// Observer of local cache mutations.
///
/// Only writes made by the hosting application are reported; replica writes are not.
pub trait CacheEventListener: Send + Sync {
    fn notify_put(&self, cache_name: &str, element: &Element);

    fn notify_removed(&self, cache_name: &str, key: &str);

    fn notify_removed_all(&self, cache_name: &str);
}

#[cfg(test)]
mod tests;
