//! Replication Node
//!
//! Owns the replication components for one member of the group and their lifecycle:
//! the outbound transport, the bootstrap coordinator, the inbound dispatcher and the
//! caches attached to them.

pub mod handlers;
pub mod protocol;

use crate::bootstrap::{BootstrapCoordinator, BootstrapOutcome};
use crate::cache::{CacheManager, MemoryCache};
use crate::config::{CacheSettings, ReplicationConfig};
use crate::group::{GroupTransport, NodeId};
use crate::replication::{CacheReplicator, NotificationDispatcher, ReplicationTransport};

use anyhow::{Result, anyhow};
use dashmap::DashMap;
use std::sync::Arc;

pub struct ReplicationNode {
    config: ReplicationConfig,
    group: Arc<dyn GroupTransport>,
    caches: Arc<CacheManager>,
    memory_caches: DashMap<String, Arc<MemoryCache>>,
    transport: Arc<ReplicationTransport>,
    coordinator: Arc<BootstrapCoordinator>,
}

impl ReplicationNode {
    /// Wires the replication layer onto `group` and creates the configured caches.
    pub fn start(config: ReplicationConfig, group: Arc<dyn GroupTransport>) -> Result<Arc<Self>> {
        let caches = CacheManager::new();
        let transport = ReplicationTransport::new(group.clone(), config.bootstrap.chunk_size)?;
        let coordinator = BootstrapCoordinator::new(
            &config.cluster_name,
            config.bootstrap.clone(),
            transport.clone(),
            caches.clone(),
        )?;

        let dispatcher = NotificationDispatcher::new(caches.clone(), coordinator.clone());
        group.set_receiver(dispatcher);

        let node = Arc::new(Self {
            config,
            group,
            caches,
            memory_caches: DashMap::new(),
            transport,
            coordinator,
        });

        for settings in node.config.caches.clone() {
            node.add_cache(&settings);
        }

        tracing::info!(
            "Replication for '{}' started on {} with caches {:?}",
            node.config.cluster_name,
            node.local_address(),
            node.caches.names()
        );
        Ok(node)
    }

    /// Creates a cache with a replicator attached and registers it for inbound events.
    pub fn add_cache(&self, settings: &CacheSettings) -> Arc<MemoryCache> {
        let cache = MemoryCache::with_options(
            settings.name.clone(),
            settings.time_to_live_ms,
            settings.transactional,
        );
        cache.add_listener(CacheReplicator::new(self.transport.clone(), settings));

        self.caches.register(cache.clone());
        self.memory_caches.insert(settings.name.clone(), cache.clone());
        tracing::debug!("Attached cache {} to replication", settings.name);
        cache
    }

    pub fn cache(&self, name: &str) -> Option<Arc<MemoryCache>> {
        self.memory_caches.get(name).map(|cache| cache.value().clone())
    }

    pub fn cache_names(&self) -> Vec<String> {
        self.caches.names()
    }

    pub fn local_address(&self) -> NodeId {
        self.group.local_address()
    }

    pub fn group(&self) -> &Arc<dyn GroupTransport> {
        &self.group
    }

    pub fn transport(&self) -> &Arc<ReplicationTransport> {
        &self.transport
    }

    pub fn coordinator(&self) -> &Arc<BootstrapCoordinator> {
        &self.coordinator
    }

    pub async fn bootstrap(&self, name: &str, asynchronous: bool) -> Result<BootstrapOutcome> {
        let cache = self
            .caches
            .get(name)
            .ok_or_else(|| anyhow!("Unknown cache {}", name))?;
        Ok(self.coordinator.request_bootstrap(cache, asynchronous).await)
    }

    /// Bootstraps every cache configured with `bootstrap_on_start`, in configuration order.
    pub async fn bootstrap_caches(&self) -> Vec<(String, BootstrapOutcome)> {
        let mut outcomes = Vec::new();
        for settings in &self.config.caches {
            if !settings.bootstrap_on_start {
                continue;
            }
            match self
                .bootstrap(&settings.name, settings.bootstrap_asynchronously)
                .await
            {
                Ok(outcome) => {
                    tracing::info!("Bootstrap of {} on start: {:?}", settings.name, outcome);
                    outcomes.push((settings.name.clone(), outcome));
                }
                Err(e) => tracing::warn!("Cannot bootstrap {} on start: {}", settings.name, e),
            }
        }
        outcomes
    }

    /// Shuts replication down: pending bootstraps, workers, then queued events. The group
    /// itself is left running.
    pub async fn dispose(&self) {
        self.coordinator.dispose().await;
        self.transport.dispose();
        self.group.clear_receiver();
        tracing::info!(
            "Replication for '{}' on {} stopped",
            self.config.cluster_name,
            self.local_address()
        );
    }
}

#[cfg(test)]
mod tests;
