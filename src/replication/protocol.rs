//! Replication Wire Protocol
//!
//! Defines the event record exchanged between nodes and the framing of a message body.
//!
//! A message body is either one [`CacheEvent`] or an ordered list of them. Event kinds
//! travel as their integer codes so that nodes agree on meaning independently of how the
//! enum is laid out in code.

use crate::cache::Element;

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub const KIND_PUT: u8 = 0;
pub const KIND_REMOVE: u8 = 1;
pub const KIND_REMOVE_ALL: u8 = 3;
pub const KIND_BOOTSTRAP_REQUEST: u8 = 10;
pub const KIND_BOOTSTRAP_CHUNK: u8 = 11;
pub const KIND_BOOTSTRAP_COMPLETE: u8 = 12;
pub const KIND_BOOTSTRAP_INCOMPLETE: u8 = 13;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum EventKind {
    Put,
    Remove,
    RemoveAll,
    BootstrapRequest,
    BootstrapChunk,
    BootstrapComplete,
    BootstrapIncomplete,
    /// A code this node does not understand. Kept so one odd event cannot spoil a batch.
    Unknown(u8),
}

impl EventKind {
    pub fn code(self) -> u8 {
        match self {
            EventKind::Put => KIND_PUT,
            EventKind::Remove => KIND_REMOVE,
            EventKind::RemoveAll => KIND_REMOVE_ALL,
            EventKind::BootstrapRequest => KIND_BOOTSTRAP_REQUEST,
            EventKind::BootstrapChunk => KIND_BOOTSTRAP_CHUNK,
            EventKind::BootstrapComplete => KIND_BOOTSTRAP_COMPLETE,
            EventKind::BootstrapIncomplete => KIND_BOOTSTRAP_INCOMPLETE,
            EventKind::Unknown(code) => code,
        }
    }

    pub fn is_bootstrap(self) -> bool {
        matches!(
            self,
            EventKind::BootstrapRequest
                | EventKind::BootstrapChunk
                | EventKind::BootstrapComplete
                | EventKind::BootstrapIncomplete
        )
    }
}

impl From<u8> for EventKind {
    fn from(code: u8) -> Self {
        match code {
            KIND_PUT => EventKind::Put,
            KIND_REMOVE => EventKind::Remove,
            KIND_REMOVE_ALL => EventKind::RemoveAll,
            KIND_BOOTSTRAP_REQUEST => EventKind::BootstrapRequest,
            KIND_BOOTSTRAP_CHUNK => EventKind::BootstrapChunk,
            KIND_BOOTSTRAP_COMPLETE => EventKind::BootstrapComplete,
            KIND_BOOTSTRAP_INCOMPLETE => EventKind::BootstrapIncomplete,
            other => EventKind::Unknown(other),
        }
    }
}

impl From<EventKind> for u8 {
    fn from(kind: EventKind) -> Self {
        kind.code()
    }
}

/// How an outbound event should be sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Delivery {
    /// Sent as soon as it is handed to the transport.
    #[default]
    Immediate,
    /// Accumulated and sent with other events of the same window.
    Windowed { window_ms: u64 },
}

/// A single replication or bootstrap event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEvent {
    pub kind: EventKind,
    pub cache_name: String,
    /// Element key; for a bootstrap request, the correlation id.
    pub key: Option<String>,
    pub element: Option<Element>,
    pub asynchronous: bool,
    pub async_window_ms: u64,
}

impl CacheEvent {
    fn new(
        kind: EventKind,
        cache_name: &str,
        key: Option<String>,
        element: Option<Element>,
        delivery: Delivery,
    ) -> Self {
        let (asynchronous, async_window_ms) = match delivery {
            Delivery::Immediate => (false, 0),
            Delivery::Windowed { window_ms } => (true, window_ms),
        };
        Self {
            kind,
            cache_name: cache_name.to_string(),
            key,
            element,
            asynchronous,
            async_window_ms,
        }
    }

    pub fn put(cache_name: &str, element: Element, delivery: Delivery) -> Self {
        let key = Some(element.key.clone());
        Self::new(EventKind::Put, cache_name, key, Some(element), delivery)
    }

    pub fn remove(cache_name: &str, key: &str, delivery: Delivery) -> Self {
        Self::new(
            EventKind::Remove,
            cache_name,
            Some(key.to_string()),
            None,
            delivery,
        )
    }

    pub fn remove_all(cache_name: &str, delivery: Delivery) -> Self {
        Self::new(EventKind::RemoveAll, cache_name, None, None, delivery)
    }

    pub fn bootstrap_request(cache_name: &str, correlation_id: String) -> Self {
        Self::new(
            EventKind::BootstrapRequest,
            cache_name,
            Some(correlation_id),
            None,
            Delivery::Immediate,
        )
    }

    pub fn bootstrap_chunk(cache_name: &str, element: Element) -> Self {
        let key = Some(element.key.clone());
        Self::new(
            EventKind::BootstrapChunk,
            cache_name,
            key,
            Some(element),
            Delivery::Immediate,
        )
    }

    pub fn bootstrap_complete(cache_name: &str) -> Self {
        Self::new(
            EventKind::BootstrapComplete,
            cache_name,
            None,
            None,
            Delivery::Immediate,
        )
    }

    pub fn bootstrap_incomplete(cache_name: &str) -> Self {
        Self::new(
            EventKind::BootstrapIncomplete,
            cache_name,
            None,
            None,
            Delivery::Immediate,
        )
    }

    pub fn delivery(&self) -> Delivery {
        if self.asynchronous {
            Delivery::Windowed {
                window_ms: self.async_window_ms,
            }
        } else {
            Delivery::Immediate
        }
    }

    pub fn correlation_id(&self) -> Option<&str> {
        match self.kind {
            EventKind::BootstrapRequest => self.key.as_deref(),
            _ => None,
        }
    }

    /// An event is worth sending unless the element it carries has expired meanwhile.
    pub fn is_valid(&self) -> bool {
        self.element
            .as_ref()
            .map(|element| !element.is_expired())
            .unwrap_or(true)
    }
}

impl fmt::Display for CacheEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CacheEvent[kind={:?}, cache={}, key={:?}]",
            self.kind, self.cache_name, self.key
        )
    }
}

/// Framing of one message body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WirePayload {
    Event(CacheEvent),
    Events(Vec<CacheEvent>),
}

impl WirePayload {
    pub fn into_events(self) -> Vec<CacheEvent> {
        match self {
            WirePayload::Event(event) => vec![event],
            WirePayload::Events(events) => events,
        }
    }
}

#[derive(Debug, Error)]
pub enum WireError {
    #[error("empty message")]
    Empty,
    #[error("nothing to encode")]
    NothingToEncode,
    #[error("malformed payload: {0}")]
    Malformed(#[from] bincode::Error),
}

/// Encodes events as one message: a lone event is sent bare, several as a list.
pub fn encode(events: &[CacheEvent]) -> Result<Vec<u8>, WireError> {
    match events {
        [] => Err(WireError::NothingToEncode),
        [event] => Ok(bincode::serialize(&WirePayload::Event(event.clone()))?),
        many => Ok(bincode::serialize(&WirePayload::Events(many.to_vec()))?),
    }
}

pub fn decode(payload: &[u8]) -> Result<WirePayload, WireError> {
    if payload.is_empty() {
        return Err(WireError::Empty);
    }
    Ok(bincode::deserialize(payload)?)
}
