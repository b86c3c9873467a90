//! In-Process Group
//!
//! A hub of endpoints living in one process. Every endpoint owns an inbox drained by a
//! dedicated delivery task, so messages between two endpoints arrive in send order and
//! a receiver callback never runs on the sender's stack.

use super::types::NodeId;
use super::{Destination, GroupTransport, MessageReceiver};

use anyhow::Result;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

type ReceiverSlot = Arc<RwLock<Option<Arc<dyn MessageReceiver>>>>;

pub struct LocalNetwork {
    endpoints: DashMap<NodeId, Arc<LocalEndpoint>>,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            endpoints: DashMap::new(),
        })
    }

    /// Adds an endpoint named `name` to the network. Must be called inside a tokio runtime.
    pub fn join(self: &Arc<Self>, name: &str) -> Arc<LocalEndpoint> {
        let id = NodeId(name.to_string());
        let (inbox, mut messages) = mpsc::unbounded_channel::<(NodeId, Vec<u8>)>();
        let receiver: ReceiverSlot = Arc::new(RwLock::new(None));

        let delivery = {
            let receiver = receiver.clone();
            let id = id.clone();
            tokio::spawn(async move {
                while let Some((from, payload)) = messages.recv().await {
                    let current = receiver
                        .read()
                        .unwrap_or_else(PoisonError::into_inner)
                        .clone();
                    match current {
                        Some(receiver) => receiver.receive(&from, &payload),
                        None => tracing::trace!("{} dropped message from {}", id, from),
                    }
                }
            })
        };

        let endpoint = Arc::new(LocalEndpoint {
            id: id.clone(),
            network: Arc::downgrade(self),
            inbox,
            receiver,
            sent: AtomicUsize::new(0),
            delivery,
        });

        self.endpoints.insert(id, endpoint.clone());
        endpoint
    }

    /// Removes an endpoint; messages already queued for it are discarded.
    pub fn leave(&self, id: &NodeId) {
        if let Some((_, endpoint)) = self.endpoints.remove(id) {
            endpoint.delivery.abort();
        }
    }

    pub fn members(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.endpoints.iter().map(|entry| entry.key().clone()).collect();
        ids.sort();
        ids
    }

    fn deliver(&self, from: &NodeId, to: &NodeId, payload: Vec<u8>) -> Result<()> {
        let endpoint = self
            .endpoints
            .get(to)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| anyhow::anyhow!("Unknown group member: {}", to))?;

        endpoint
            .inbox
            .send((from.clone(), payload))
            .map_err(|_| anyhow::anyhow!("Member {} is no longer receiving", to))
    }
}

pub struct LocalEndpoint {
    id: NodeId,
    network: Weak<LocalNetwork>,
    inbox: mpsc::UnboundedSender<(NodeId, Vec<u8>)>,
    receiver: ReceiverSlot,
    sent: AtomicUsize,
    delivery: JoinHandle<()>,
}

impl LocalEndpoint {
    pub fn id(&self) -> &NodeId {
        &self.id
    }

    /// Number of messages handed to the network by this endpoint.
    pub fn sent_messages(&self) -> usize {
        self.sent.load(Ordering::SeqCst)
    }

    fn network(&self) -> Result<Arc<LocalNetwork>> {
        self.network
            .upgrade()
            .ok_or_else(|| anyhow::anyhow!("Local network has been dropped"))
    }
}

impl GroupTransport for LocalEndpoint {
    fn current_members(&self) -> Vec<NodeId> {
        self.network()
            .map(|network| network.members())
            .unwrap_or_default()
    }

    fn local_address(&self) -> NodeId {
        self.id.clone()
    }

    fn send(&self, destination: &Destination, payload: Vec<u8>) -> Result<()> {
        let network = self.network()?;
        self.sent.fetch_add(1, Ordering::SeqCst);

        match destination {
            Destination::Member(to) => network.deliver(&self.id, to, payload),
            Destination::Broadcast => {
                for member in network.members() {
                    if member == self.id {
                        continue;
                    }
                    if let Err(e) = network.deliver(&self.id, &member, payload.clone()) {
                        tracing::warn!("{}", e);
                    }
                }
                Ok(())
            }
        }
    }

    fn set_receiver(&self, receiver: Arc<dyn MessageReceiver>) {
        *self.receiver.write().unwrap_or_else(PoisonError::into_inner) = Some(receiver);
    }

    fn clear_receiver(&self) {
        *self.receiver.write().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

impl Drop for LocalEndpoint {
    fn drop(&mut self) {
        self.delivery.abort();
    }
}
