//! Outbound Replication Transport
//!
//! Sends cache events to the group. Synchronous events go out straight away as one
//! message. Asynchronous events are parked in a queue keyed by their window length and a
//! timer per window flushes the queue to every member in bounded chunks.

use super::protocol::{self, CacheEvent, Delivery};
use crate::group::{Destination, GroupTransport};

use anyhow::Result;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Maximum number of events carried by one flushed message.
pub const DEFAULT_CHUNK_SIZE: usize = 100;

type EventQueue = Mutex<VecDeque<CacheEvent>>;

pub struct ReplicationTransport {
    group: Arc<dyn GroupTransport>,
    alive: AtomicBool,
    /// Window length in milliseconds -> pending asynchronous events.
    queues: DashMap<u64, Arc<EventQueue>>,
    timers: DashMap<u64, JoinHandle<()>>,
    chunk_size: usize,
    runtime: Handle,
    self_ref: Weak<Self>,
}

impl ReplicationTransport {
    /// Must be called from within a tokio runtime; window timers are spawned on it.
    pub fn new(group: Arc<dyn GroupTransport>, chunk_size: usize) -> Result<Arc<Self>> {
        let runtime = Handle::try_current()?;
        Ok(Arc::new_cyclic(|self_ref| Self {
            group,
            alive: AtomicBool::new(true),
            queues: DashMap::new(),
            timers: DashMap::new(),
            chunk_size: chunk_size.max(1),
            runtime,
            self_ref: self_ref.clone(),
        }))
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn group(&self) -> &Arc<dyn GroupTransport> {
        &self.group
    }

    /// Sends the events, preserving their relative order within each delivery class.
    ///
    /// Windowed events are always flushed to every member, whatever `destination` says.
    pub fn send(&self, destination: &Destination, events: Vec<CacheEvent>) {
        if !self.is_alive() || events.is_empty() {
            tracing::warn!(
                "Ignoring send request of {} events. Transport alive = {}",
                events.len(),
                self.is_alive()
            );
            return;
        }

        let mut synchronous = Vec::with_capacity(events.len());
        for event in events {
            match event.delivery() {
                Delivery::Windowed { window_ms } if window_ms > 0 => {
                    tracing::trace!("Queueing {} for the {}ms window", event, window_ms);
                    let queue = self.queue_for(window_ms);
                    queue
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push_back(event);
                }
                _ => synchronous.push(event),
            }
        }

        if !synchronous.is_empty() {
            tracing::debug!(
                "Sending {} synchronous events to {:?}",
                synchronous.len(),
                destination
            );
            self.send_data(destination, &synchronous);
        }
    }

    /// Number of asynchronous events not yet flushed.
    pub fn pending_events(&self) -> usize {
        self.queues
            .iter()
            .map(|queue| queue.lock().unwrap_or_else(PoisonError::into_inner).len())
            .sum()
    }

    /// Number of distinct flush windows currently scheduled.
    pub fn window_count(&self) -> usize {
        self.timers.len()
    }

    /// Stops the window timers, flushes whatever is still queued and forgets the queues.
    pub fn dispose(&self) {
        if !self.alive.swap(false, Ordering::SeqCst) {
            return;
        }

        let windows: Vec<u64> = self.timers.iter().map(|timer| *timer.key()).collect();
        for window in windows {
            if let Some((_, timer)) = self.timers.remove(&window) {
                timer.abort();
            }
        }

        let queues: Vec<Arc<EventQueue>> =
            self.queues.iter().map(|queue| queue.value().clone()).collect();
        for queue in &queues {
            self.flush_queue(queue);
        }
        self.queues.clear();

        tracing::debug!("Replication transport disposed");
    }

    fn queue_for(&self, window_ms: u64) -> Arc<EventQueue> {
        match self.queues.entry(window_ms) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                let queue = Arc::new(Mutex::new(VecDeque::new()));
                entry.insert(queue.clone());
                self.start_flush_timer(window_ms, queue.clone());
                queue
            }
        }
    }

    fn start_flush_timer(&self, window_ms: u64, queue: Arc<EventQueue>) {
        let transport = self.self_ref.clone();
        let period = Duration::from_millis(window_ms);

        let timer = self.runtime.spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                interval.tick().await;
                let Some(transport) = transport.upgrade() else {
                    break;
                };
                if !transport.is_alive() {
                    break;
                }
                transport.flush_queue(&queue);
            }
        });

        tracing::debug!("Scheduled asynchronous flush every {}ms", window_ms);
        self.timers.insert(window_ms, timer);
    }

    /// Drains the queue in chunks until it is empty. Events whose element expired while
    /// queued are dropped.
    fn flush_queue(&self, queue: &EventQueue) {
        loop {
            let batch = {
                let mut pending = queue.lock().unwrap_or_else(PoisonError::into_inner);
                if pending.is_empty() {
                    break;
                }

                let mut batch = Vec::with_capacity(pending.len().min(self.chunk_size));
                while batch.len() < self.chunk_size {
                    let Some(event) = pending.pop_front() else {
                        break;
                    };
                    if event.is_valid() {
                        batch.push(event);
                    } else {
                        tracing::warn!("Skipping {}, its element is no longer valid", event);
                    }
                }
                batch
            };

            if batch.is_empty() {
                continue;
            }

            tracing::debug!("Flushing {} queued events", batch.len());
            self.send_data(&Destination::Broadcast, &batch);
        }
    }

    fn send_data(&self, destination: &Destination, events: &[CacheEvent]) {
        let payload = match protocol::encode(events) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(
                    "Failed to encode {} events, they will not be sent: {}",
                    events.len(),
                    e
                );
                return;
            }
        };

        if let Err(e) = self.group.send(destination, payload) {
            tracing::error!(
                "Failed to send {} events to {:?}: {}",
                events.len(),
                destination,
                e
            );
        }
    }
}
