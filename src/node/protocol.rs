//! HTTP API
//!
//! Endpoints and JSON bodies of the node's administrative surface. Values are carried as
//! UTF-8 text; the cache itself stores raw bytes.

use serde::{Deserialize, Serialize};

pub const ENDPOINT_CACHE_ENTRY: &str = "/cache/:name/:key";
pub const ENDPOINT_CACHE: &str = "/cache/:name";
pub const ENDPOINT_BOOTSTRAP: &str = "/bootstrap/:name";
pub const ENDPOINT_STATUS: &str = "/status";

#[derive(Debug, Serialize, Deserialize)]
pub struct PutRequest {
    pub value: String,
    /// Overrides the cache's default time to live.
    #[serde(default)]
    pub time_to_live_ms: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PutResponse {
    pub success: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GetResponse {
    pub value: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RemoveResponse {
    pub removed: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct BootstrapQuery {
    #[serde(default)]
    pub asynchronous: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BootstrapResponse {
    /// `complete`, `incomplete`, `no_peers`, `submitted`, `timed_out`, `failed`,
    /// `rejected` or `unknown_cache`.
    pub outcome: String,
    pub replicated: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CacheStatus {
    pub name: String,
    pub entries: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub node: String,
    pub members: Vec<String>,
    pub caches: Vec<CacheStatus>,
    pub pending_bootstraps: Vec<String>,
    pub queued_events: usize,
}
