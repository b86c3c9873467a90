use crate::cache::ReplicatedCache;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapStatus {
    Pending,
    Complete,
    Incomplete,
}

/// Result of asking for a cache to be bootstrapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapOutcome {
    /// A peer streamed its whole cache.
    Complete { replicated: u64 },
    /// Every candidate peer was tried without a complete transfer.
    Incomplete { replicated: u64 },
    /// No other member was present to bootstrap from.
    NoPeers,
    /// Asynchronous request accepted; the caller does not wait for it.
    Submitted,
    /// Synchronous caller stopped waiting before the request finished.
    TimedOut,
    /// The bootstrap task ended without reporting an outcome.
    Failed,
    /// The coordinator is shutting down.
    Rejected,
}

impl BootstrapOutcome {
    pub fn is_complete(&self) -> bool {
        matches!(self, BootstrapOutcome::Complete { .. })
    }
}

/// Per-cache bootstrap state shared between the requesting task and inbound handlers.
pub struct BootstrapRequest {
    id: Uuid,
    cache: Arc<dyn ReplicatedCache>,
    asynchronous: bool,
    status: watch::Sender<BootstrapStatus>,
    replication_count: AtomicU64,
    abandoned: AtomicBool,
}

impl BootstrapRequest {
    pub fn new(cache: Arc<dyn ReplicatedCache>, asynchronous: bool) -> Arc<Self> {
        let (status, _) = watch::channel(BootstrapStatus::Pending);
        Arc::new(Self {
            id: Uuid::new_v4(),
            cache,
            asynchronous,
            status,
            replication_count: AtomicU64::new(0),
            abandoned: AtomicBool::new(false),
        })
    }

    pub fn cache(&self) -> &Arc<dyn ReplicatedCache> {
        &self.cache
    }

    pub fn cache_name(&self) -> &str {
        self.cache.name()
    }

    pub fn is_asynchronous(&self) -> bool {
        self.asynchronous
    }

    pub fn status(&self) -> BootstrapStatus {
        *self.status.borrow()
    }

    pub fn replication_count(&self) -> u64 {
        self.replication_count.load(Ordering::SeqCst)
    }

    /// Prepares the request for another peer.
    pub fn reset(&self) {
        self.replication_count.store(0, Ordering::SeqCst);
        self.status.send_replace(BootstrapStatus::Pending);
    }

    pub fn complete(&self, status: BootstrapStatus) {
        self.status.send_replace(status);
    }

    pub fn count_replication(&self) {
        self.replication_count.fetch_add(1, Ordering::SeqCst);
    }

    /// Waits until the status leaves `Pending`. Returns `false` on timeout.
    pub async fn wait_for_bootstrap(&self, timeout: Duration) -> bool {
        let mut status = self.status.subscribe();
        tokio::time::timeout(
            timeout,
            status.wait_for(|status| *status != BootstrapStatus::Pending),
        )
        .await
        .map(|changed| changed.is_ok())
        .unwrap_or(false)
    }

    /// Marks the request as no longer owned by a running task.
    pub fn abandon(&self) {
        self.abandoned.store(true, Ordering::SeqCst);
    }

    pub fn is_abandoned(&self) -> bool {
        self.abandoned.load(Ordering::SeqCst)
    }

    /// Ties the request's liveness to the returned guard.
    pub fn guard(self: &Arc<Self>) -> RequestGuard {
        RequestGuard(self.clone())
    }
}

impl fmt::Display for BootstrapRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "BootstrapRequest[{}, cache={}, async={}, status={:?}, replicated={}]",
            self.id,
            self.cache_name(),
            self.asynchronous,
            self.status(),
            self.replication_count()
        )
    }
}

/// Held by the task driving a request. Dropping it, for whatever reason, abandons the
/// request so the registry can purge it.
pub struct RequestGuard(Arc<BootstrapRequest>);

impl RequestGuard {
    pub fn request(&self) -> &Arc<BootstrapRequest> {
        &self.0
    }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.0.abandon();
    }
}
