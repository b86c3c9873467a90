use super::protocol::{CacheEvent, Delivery};
use super::transport::ReplicationTransport;
use crate::cache::{CacheEventListener, Element};
use crate::config::CacheSettings;
use crate::group::Destination;

use std::sync::Arc;

/// Broadcasts local cache mutations to the rest of the group.
pub struct CacheReplicator {
    transport: Arc<ReplicationTransport>,
    replicate_puts: bool,
    replicate_removes: bool,
    delivery: Delivery,
}

impl CacheReplicator {
    pub fn new(transport: Arc<ReplicationTransport>, settings: &CacheSettings) -> Arc<Self> {
        let delivery = if settings.replicate_asynchronously {
            Delivery::Windowed {
                window_ms: settings.async_window_ms,
            }
        } else {
            Delivery::Immediate
        };

        Arc::new(Self {
            transport,
            replicate_puts: settings.replicate_puts,
            replicate_removes: settings.replicate_removes,
            delivery,
        })
    }

    pub fn delivery(&self) -> Delivery {
        self.delivery
    }

    fn replicate(&self, event: CacheEvent) {
        self.transport.send(&Destination::Broadcast, vec![event]);
    }
}

impl CacheEventListener for CacheReplicator {
    fn notify_put(&self, cache_name: &str, element: &Element) {
        if self.replicate_puts {
            self.replicate(CacheEvent::put(cache_name, element.clone(), self.delivery));
        }
    }

    fn notify_removed(&self, cache_name: &str, key: &str) {
        if self.replicate_removes {
            self.replicate(CacheEvent::remove(cache_name, key, self.delivery));
        }
    }

    fn notify_removed_all(&self, cache_name: &str) {
        if self.replicate_removes {
            self.replicate(CacheEvent::remove_all(cache_name, self.delivery));
        }
    }
}
