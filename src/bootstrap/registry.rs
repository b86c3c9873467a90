//! Pending Bootstrap Registry
//!
//! Map of cache name to the live [`BootstrapRequest`] for that cache. At most one live
//! request exists per name. Entries whose owning task has gone away are treated as absent
//! and purged, either on access or by the periodic sweeper.

use super::types::BootstrapRequest;

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub struct PendingRequestRegistry {
    requests: DashMap<String, Arc<BootstrapRequest>>,
    /// Bumped on every removal or insertion so waiters can re-check the size.
    changes: watch::Sender<u64>,
}

impl PendingRequestRegistry {
    pub fn new() -> Arc<Self> {
        let (changes, _) = watch::channel(0);
        Arc::new(Self {
            requests: DashMap::new(),
            changes,
        })
    }

    /// Registers `request`, returning the live request it replaced, if any.
    pub fn put(&self, cache_name: &str, request: Arc<BootstrapRequest>) -> Option<Arc<BootstrapRequest>> {
        let previous = self.requests.insert(cache_name.to_string(), request);
        self.notify_change();
        previous.filter(|previous| !previous.is_abandoned())
    }

    pub fn get(&self, cache_name: &str) -> Option<Arc<BootstrapRequest>> {
        let request = self.requests.get(cache_name).map(|entry| entry.value().clone())?;
        if request.is_abandoned() {
            tracing::info!(
                "Bootstrap request for {} has been abandoned, removing it",
                cache_name
            );
            if self
                .requests
                .remove_if(cache_name, |_, current| Arc::ptr_eq(current, &request))
                .is_some()
            {
                self.notify_change();
            }
            return None;
        }
        Some(request)
    }

    pub fn remove(&self, cache_name: &str) -> Option<Arc<BootstrapRequest>> {
        let (_, request) = self.requests.remove(cache_name)?;
        self.notify_change();
        Some(request)
    }

    /// Purges abandoned entries. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let before = self.requests.len();
        self.requests.retain(|name, request| {
            if request.is_abandoned() {
                tracing::info!("Bootstrap request for {} has been abandoned, removing it", name);
                false
            } else {
                true
            }
        });
        let removed = before.saturating_sub(self.requests.len());
        if removed > 0 {
            self.notify_change();
        }
        removed
    }

    /// Number of live requests.
    pub fn len(&self) -> usize {
        self.sweep();
        self.requests.len()
    }

    /// Entries currently stored, abandoned ones included. Does not sweep.
    #[cfg(test)]
    pub(crate) fn stored_len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<String> {
        self.sweep();
        let mut keys: Vec<String> = self.requests.iter().map(|entry| entry.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Waits until exactly `target` live requests remain. Re-checks whenever the registry
    /// changes and at least once a second. Returns `false` if `timeout` elapses first.
    pub async fn wait_for_size(&self, target: usize, timeout: Duration) -> bool {
        let poll = timeout.min(Duration::from_secs(1));
        let deadline = Instant::now() + timeout;
        let mut changes = self.changes.subscribe();

        loop {
            if self.len() == target {
                return true;
            }

            let now = Instant::now();
            if now >= deadline {
                return false;
            }

            let wait = poll.min(deadline - now);
            let _ = tokio::time::timeout(wait, changes.changed()).await;
        }
    }

    /// Starts the periodic sweep. The task stops once the registry is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let registry = Arc::downgrade(self);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                interval.tick().await;
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                let removed = registry.sweep();
                if removed > 0 {
                    tracing::debug!("Swept {} abandoned bootstrap requests", removed);
                }
            }
        })
    }

    fn notify_change(&self) {
        self.changes.send_modify(|version| *version = version.wrapping_add(1));
    }
}
