//! Inbound Event Dispatcher
//!
//! Decodes messages received from the group and applies them. Bootstrap events are
//! routed to the [`BootstrapCoordinator`]; everything else is applied to the named local
//! cache as a replica write. A bad message or event is logged and skipped, never
//! propagated.

use super::protocol::{self, CacheEvent, EventKind, WirePayload};
use crate::bootstrap::BootstrapCoordinator;
use crate::cache::CacheManager;
use crate::group::{MessageReceiver, NodeId};

use anyhow::{Result, anyhow};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

pub struct NotificationDispatcher {
    caches: Arc<CacheManager>,
    coordinator: Arc<BootstrapCoordinator>,
    unknown_events: AtomicUsize,
}

impl NotificationDispatcher {
    pub fn new(caches: Arc<CacheManager>, coordinator: Arc<BootstrapCoordinator>) -> Arc<Self> {
        Arc::new(Self {
            caches,
            coordinator,
            unknown_events: AtomicUsize::new(0),
        })
    }

    /// Events skipped because their kind code is not understood.
    pub fn unknown_events(&self) -> usize {
        self.unknown_events.load(Ordering::SeqCst)
    }

    /// Applies one event inside a transaction scope, unless one is already open.
    fn safe_handle(&self, from: &NodeId, event: &CacheEvent) {
        let cache = self.caches.get(&event.cache_name);
        let already_active = cache
            .as_ref()
            .map(|cache| cache.is_transaction_active())
            .unwrap_or(false);

        if let Some(cache) = &cache
            && !already_active
        {
            cache.begin_transaction_if_needed();
        }

        if let Err(e) = self.handle_event(from, event) {
            tracing::error!("Failed to handle {} from {}: {:#}", event, from, e);
        }

        if let Some(cache) = &cache
            && !already_active
        {
            cache.commit_transaction_if_needed();
        }
    }

    fn handle_event(&self, from: &NodeId, event: &CacheEvent) -> Result<()> {
        match event.kind {
            kind if kind.is_bootstrap() => self.route_bootstrap(from, event),
            EventKind::Unknown(code) => {
                self.unknown_events.fetch_add(1, Ordering::SeqCst);
                tracing::warn!("Unknown event kind {} in {}, ignoring it", code, event);
                Ok(())
            }
            _ => self.apply(event),
        }
    }

    fn route_bootstrap(&self, from: &NodeId, event: &CacheEvent) -> Result<()> {
        match event.kind {
            EventKind::BootstrapRequest => self.coordinator.handle_bootstrap_request(from, event),
            EventKind::BootstrapChunk => return self.coordinator.handle_bootstrap_chunk(event),
            EventKind::BootstrapComplete => self.coordinator.handle_bootstrap_complete(event),
            EventKind::BootstrapIncomplete => self.coordinator.handle_bootstrap_incomplete(event),
            other => tracing::debug!("Kind {} is not a bootstrap event", other.code()),
        }
        Ok(())
    }

    fn apply(&self, event: &CacheEvent) -> Result<()> {
        let Some(cache) = self.caches.get(&event.cache_name) else {
            tracing::debug!("No local cache {}, ignoring {}", event.cache_name, event);
            return Ok(());
        };

        match event.kind {
            EventKind::Put => {
                let element = event
                    .element
                    .clone()
                    .ok_or_else(|| anyhow!("{} carries no element", event))?;
                cache.put(element, true)?;
            }
            EventKind::Remove => {
                let key = event
                    .key
                    .as_deref()
                    .ok_or_else(|| anyhow!("{} carries no key", event))?;
                if cache.get_quiet(key).is_some() {
                    cache.remove(key, true)?;
                } else {
                    tracing::trace!("{} not present in {}, nothing to remove", key, event.cache_name);
                }
            }
            EventKind::RemoveAll => cache.remove_all(true)?,
            other => tracing::debug!("Kind {} does not mutate a cache", other.code()),
        }
        Ok(())
    }
}

impl MessageReceiver for NotificationDispatcher {
    fn receive(&self, from: &NodeId, payload: &[u8]) {
        match protocol::decode(payload) {
            Ok(WirePayload::Event(event)) => self.safe_handle(from, &event),
            Ok(WirePayload::Events(events)) => {
                tracing::trace!("Received {} events from {}", events.len(), from);
                for event in &events {
                    self.safe_handle(from, event);
                }
            }
            Err(e) => tracing::warn!("Ignoring message from {}: {}", from, e),
        }
    }
}
