use serde::{Deserialize, Serialize};

/// A cached key/value pair together with its expiry metadata.
///
/// Values are opaque bytes; the replication layer never interprets them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Element {
    pub key: String,
    pub value: Vec<u8>,
    /// Wall-clock creation time in milliseconds.
    pub created_at_ms: u64,
    /// Lifetime from `created_at_ms`. `None` means the element never expires.
    pub time_to_live_ms: Option<u64>,
}

impl Element {
    pub fn new(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            created_at_ms: now_ms(),
            time_to_live_ms: None,
        }
    }

    pub fn with_time_to_live(mut self, time_to_live_ms: Option<u64>) -> Self {
        self.time_to_live_ms = time_to_live_ms;
        self
    }

    pub fn expires_at_ms(&self) -> Option<u64> {
        self.time_to_live_ms
            .map(|ttl| self.created_at_ms.saturating_add(ttl))
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at_ms()
            .map(|expires_at| now_ms() >= expires_at)
            .unwrap_or(false)
    }
}

/// Helper to get the current system time in milliseconds.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
