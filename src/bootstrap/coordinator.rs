//! Bootstrap Coordinator
//!
//! Drives both sides of a cache bootstrap.
//!
//! ## Requesting
//! A request is registered under the cache name and handed to the worker pool. The worker
//! asks one randomly chosen peer at a time for its contents and waits for the peer to
//! report completion, moving on to the next peer if it does not. The registry entry is
//! removed when the worker finishes, whatever the outcome.
//!
//! ## Serving
//! A peer's request is answered with the cache contents in chunks, followed by a single
//! completion event. Unknown caches are answered with an incomplete event.

use super::pool::{Submitted, WorkerPool};
use super::registry::PendingRequestRegistry;
use super::types::{BootstrapOutcome, BootstrapRequest, BootstrapStatus, RequestGuard};
use crate::cache::{CacheManager, ReplicatedCache};
use crate::config::BootstrapSettings;
use crate::group::{Destination, NodeId};
use crate::replication::protocol::CacheEvent;
use crate::replication::transport::ReplicationTransport;

use anyhow::{Result, anyhow};
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use uuid::Uuid;

pub struct BootstrapCoordinator {
    settings: BootstrapSettings,
    alive: AtomicBool,
    registry: Arc<PendingRequestRegistry>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    pool: WorkerPool,
    transport: Arc<ReplicationTransport>,
    caches: Arc<CacheManager>,
    self_ref: Weak<Self>,
}

impl BootstrapCoordinator {
    /// Must be called from within a tokio runtime. Workers are labelled with `cluster_name`.
    pub fn new(
        cluster_name: &str,
        settings: BootstrapSettings,
        transport: Arc<ReplicationTransport>,
        caches: Arc<CacheManager>,
    ) -> Result<Arc<Self>> {
        let pool = WorkerPool::new(format!("{}-bootstrap", cluster_name), settings.max_workers)?;
        Ok(Arc::new_cyclic(|self_ref| Self {
            settings,
            alive: AtomicBool::new(true),
            registry: PendingRequestRegistry::new(),
            sweeper: Mutex::new(None),
            pool,
            transport,
            caches,
            self_ref: self_ref.clone(),
        }))
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn registry(&self) -> &Arc<PendingRequestRegistry> {
        &self.registry
    }

    pub fn has_pending_requests(&self) -> bool {
        !self.registry.is_empty()
    }

    pub fn max_workers(&self) -> usize {
        self.pool.max_workers()
    }

    pub fn set_max_workers(&self, max_workers: usize) {
        self.pool.set_max_workers(max_workers);
    }

    /// Waits until no bootstrap request is pending.
    pub async fn wait_for_complete_bootstrap(&self, timeout: Duration) -> bool {
        self.registry.wait_for_size(0, timeout).await
    }

    /// Starts bootstrapping `cache` from the group.
    ///
    /// Asynchronous requests return [`BootstrapOutcome::Submitted`] straight away.
    /// Synchronous requests wait for the outcome, bounded by the per-peer response budget.
    pub async fn request_bootstrap(
        &self,
        cache: Arc<dyn ReplicatedCache>,
        asynchronous: bool,
    ) -> BootstrapOutcome {
        self.submit(BootstrapRequest::new(cache, asynchronous)).await
    }

    pub async fn submit(&self, request: Arc<BootstrapRequest>) -> BootstrapOutcome {
        if !self.is_alive() {
            tracing::warn!(
                "Bootstrap coordinator is disposed, ignoring bootstrap request for {}",
                request.cache_name()
            );
            return BootstrapOutcome::Rejected;
        }
        let Some(coordinator) = self.self_ref.upgrade() else {
            return BootstrapOutcome::Rejected;
        };
        self.ensure_sweeper();

        let cache_name = request.cache_name().to_string();
        if let Some(previous) = self.registry.put(&cache_name, request.clone()) {
            tracing::warn!(
                "Replaced pending {} with a new request for the same cache",
                previous
            );
        }
        tracing::debug!("Registered {}", request);

        let (done_tx, done_rx) = oneshot::channel();
        let guard = request.guard();
        let task = async move {
            let outcome = coordinator.run_request(guard).await;
            let _ = done_tx.send(outcome);
        };

        match self
            .pool
            .try_spawn(format!("bootstrap-request cache={}", cache_name), task)
        {
            Submitted::Spawned => {}
            Submitted::Saturated(task) => {
                tracing::debug!(
                    "Bootstrap workers saturated, running request for {} on the caller",
                    cache_name
                );
                task.await;
            }
            Submitted::Rejected => return BootstrapOutcome::Rejected,
        }

        if request.is_asynchronous() {
            return BootstrapOutcome::Submitted;
        }

        let budget = self.settings.max_response_timeout();
        match tokio::time::timeout(budget, done_rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => {
                tracing::warn!(
                    "Bootstrap of {} failed, continuing without a completed bootstrap",
                    cache_name
                );
                BootstrapOutcome::Failed
            }
            Err(_) => {
                tracing::warn!(
                    "Bootstrap of {} did not finish within {:?}, continuing without a completed bootstrap",
                    cache_name,
                    budget
                );
                BootstrapOutcome::TimedOut
            }
        }
    }

    async fn run_request(&self, guard: RequestGuard) -> BootstrapOutcome {
        let request = guard.request();
        let cache_name = request.cache_name().to_string();

        let outcome = self.bootstrap_from_peers(request).await;

        match self.registry.remove(&cache_name) {
            Some(removed) => tracing::debug!("Removed {}", removed),
            None => tracing::warn!("No pending bootstrap request for {} to remove", cache_name),
        }
        outcome
    }

    async fn bootstrap_from_peers(&self, request: &BootstrapRequest) -> BootstrapOutcome {
        let cache_name = request.cache_name();
        let mut candidates = self.transport.group().other_members();

        if candidates.is_empty() {
            tracing::info!(
                "No other members in the group, nothing to bootstrap {} from",
                cache_name
            );
            return BootstrapOutcome::NoPeers;
        }

        tracing::debug!(
            "Bootstrapping {} on {} from peers {:?}",
            cache_name,
            self.transport.group().local_address(),
            candidates
        );

        let mut replicated = 0;
        loop {
            request.reset();

            let index = rand::thread_rng().gen_range(0..candidates.len());
            let peer = candidates.swap_remove(index);

            let correlation_id = Uuid::new_v4().to_string();
            tracing::debug!(
                "Requesting bootstrap of {} from {} ({})",
                cache_name,
                peer,
                correlation_id
            );
            self.transport.send(
                &Destination::Member(peer.clone()),
                vec![CacheEvent::bootstrap_request(cache_name, correlation_id)],
            );

            self.wait_for_peer(request, &peer).await;
            replicated += request.replication_count();

            if request.status() == BootstrapStatus::Complete || candidates.is_empty() {
                break;
            }
        }

        if request.status() == BootstrapStatus::Complete {
            tracing::info!(
                "Bootstrap of {} complete, {} elements replicated",
                cache_name,
                replicated
            );
            BootstrapOutcome::Complete { replicated }
        } else {
            request.complete(BootstrapStatus::Incomplete);
            tracing::info!(
                "Bootstrap of {} incomplete after trying every peer, {} elements replicated",
                cache_name,
                replicated
            );
            BootstrapOutcome::Incomplete { replicated }
        }
    }

    async fn wait_for_peer(&self, request: &BootstrapRequest, peer: &NodeId) -> bool {
        let timeout = self.settings.response_timeout();
        let tries = self.settings.response_tries.max(1);

        for attempt in 1..=tries {
            if request.wait_for_bootstrap(timeout).await {
                return true;
            }
            tracing::debug!(
                "Bootstrap of {} not complete after {:?}, will wait {} more times",
                request.cache_name(),
                timeout * attempt,
                tries - attempt
            );
        }

        tracing::warn!(
            "Bootstrap of {} not complete after {:?}, giving up on {}",
            request.cache_name(),
            timeout * tries,
            peer
        );
        false
    }

    /// Answers a peer's bootstrap request on the worker pool, or inline when saturated.
    pub fn handle_bootstrap_request(&self, from: &NodeId, event: &CacheEvent) {
        if !self.is_alive() {
            tracing::warn!(
                "Bootstrap coordinator is disposed, ignoring bootstrap request from {}",
                from
            );
            return;
        }
        let Some(coordinator) = self.self_ref.upgrade() else {
            return;
        };
        self.ensure_sweeper();

        let requester = from.clone();
        let cache_name = event.cache_name.clone();
        let correlation_id = event.correlation_id().map(str::to_string);
        let task = async move {
            coordinator.serve_bootstrap(&requester, &cache_name, correlation_id.as_deref());
        };

        match self.pool.try_spawn(
            format!("bootstrap-response cache={} peer={}", event.cache_name, from),
            task,
        ) {
            Submitted::Spawned | Submitted::Rejected => {}
            Submitted::Saturated(_) => {
                tracing::debug!(
                    "Bootstrap workers saturated, serving {} to {} on the caller",
                    event.cache_name,
                    from
                );
                self.serve_bootstrap(from, &event.cache_name, event.correlation_id());
            }
        }
    }

    /// Streams the live contents of `cache_name` to `requester`.
    pub fn serve_bootstrap(&self, requester: &NodeId, cache_name: &str, correlation_id: Option<&str>) {
        let reply_to = Destination::Member(requester.clone());

        let Some(cache) = self.caches.get(cache_name) else {
            tracing::warn!(
                "Bootstrap request from {} for unknown cache {}",
                requester,
                cache_name
            );
            self.transport
                .send(&reply_to, vec![CacheEvent::bootstrap_incomplete(cache_name)]);
            return;
        };

        tracing::debug!(
            "Serving bootstrap of {} to {} ({:?})",
            cache_name,
            requester,
            correlation_id
        );

        if self.registry.get(cache_name).is_some() {
            tracing::debug!(
                "{} is itself bootstrapping here, telling {} the transfer may be incomplete",
                cache_name,
                requester
            );
            self.transport
                .send(&reply_to, vec![CacheEvent::bootstrap_incomplete(cache_name)]);
        }

        let chunk_size = self.settings.chunk_size.max(1);
        let mut chunk = Vec::with_capacity(chunk_size);
        let mut sent = 0;
        for key in cache.keys() {
            let Some(element) = cache.get_quiet(&key) else {
                continue;
            };
            if element.is_expired() {
                continue;
            }
            chunk.push(CacheEvent::bootstrap_chunk(cache_name, element));

            if chunk.len() == chunk_size {
                sent += chunk.len();
                self.transport.send(&reply_to, std::mem::take(&mut chunk));
            }
        }
        if !chunk.is_empty() {
            sent += chunk.len();
            self.transport.send(&reply_to, chunk);
        }

        if sent == 0 {
            tracing::debug!("No elements of {} to send to {}", cache_name, requester);
        }

        self.transport
            .send(&reply_to, vec![CacheEvent::bootstrap_complete(cache_name)]);
        tracing::debug!(
            "Sent {} elements of {} to {}",
            sent,
            cache_name,
            requester
        );
    }

    /// Applies one element of an incoming transfer to the cache being bootstrapped.
    pub fn handle_bootstrap_chunk(&self, event: &CacheEvent) -> Result<()> {
        let Some(request) = self.registry.get(&event.cache_name) else {
            tracing::warn!(
                "No pending bootstrap for {}, dropping {}",
                event.cache_name,
                event
            );
            return Ok(());
        };

        let element = event
            .element
            .clone()
            .ok_or_else(|| anyhow!("{} carries no element", event))?;
        request.cache().put(element, true)?;
        request.count_replication();
        Ok(())
    }

    pub fn handle_bootstrap_complete(&self, event: &CacheEvent) {
        self.resolve(event, BootstrapStatus::Complete);
    }

    pub fn handle_bootstrap_incomplete(&self, event: &CacheEvent) {
        self.resolve(event, BootstrapStatus::Incomplete);
    }

    fn resolve(&self, event: &CacheEvent, status: BootstrapStatus) {
        match self.registry.get(&event.cache_name) {
            Some(request) => {
                tracing::debug!("{} resolved as {:?}", request, status);
                request.complete(status);
            }
            None => tracing::warn!(
                "No pending bootstrap for {}, ignoring {}",
                event.cache_name,
                event
            ),
        }
    }

    /// Stops accepting requests, waits for pending ones and shuts the pool down.
    pub async fn dispose(&self) {
        if !self.alive.swap(false, Ordering::SeqCst) {
            return;
        }

        let timeout = self.settings.shutdown_timeout();
        if self.has_pending_requests() {
            tracing::info!("Waiting up to {:?} for pending bootstrap requests", timeout);
            if !self.wait_for_complete_bootstrap(timeout).await {
                tracing::warn!(
                    "Shutting down with {} bootstrap requests still pending",
                    self.registry.len()
                );
            }
        }

        self.pool.shutdown(timeout).await;

        if let Some(sweeper) = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            sweeper.abort();
        }
        tracing::debug!("Bootstrap coordinator disposed");
    }

    fn ensure_sweeper(&self) {
        let mut sweeper = self.sweeper.lock().unwrap_or_else(PoisonError::into_inner);
        if sweeper.is_none() {
            *sweeper = Some(self.registry.spawn_sweeper(self.settings.cleanup_interval()));
        }
    }
}
