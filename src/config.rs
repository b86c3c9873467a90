//! Node Configuration
//!
//! Loaded from a JSON file when present, otherwise defaults. A handful of environment
//! variables override the group transport and the bootstrap pool size so a deployment can
//! tune them without shipping a file.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

pub const ENV_MCAST_ADDR: &str = "CACHE_REPLICATION_MCAST_ADDR";
pub const ENV_MCAST_PORT: &str = "CACHE_REPLICATION_MCAST_PORT";
pub const ENV_MCAST_TTL: &str = "CACHE_REPLICATION_MCAST_TTL";
pub const ENV_BOOTSTRAP_THREADS: &str = "CACHE_REPLICATION_BOOTSTRAP_THREADS";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Used to label log spans and worker tasks.
    pub cluster_name: String,
    pub group: GroupSettings,
    pub bootstrap: BootstrapSettings,
    pub caches: Vec<CacheSettings>,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            cluster_name: "cache-replication".to_string(),
            group: GroupSettings::default(),
            bootstrap: BootstrapSettings::default(),
            caches: Vec::new(),
        }
    }
}

/// Group transport settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupSettings {
    /// Local socket address. Defaults to the wildcard address on `multicast_port`.
    pub bind: Option<SocketAddr>,
    /// Known members to contact on startup.
    pub seeds: Vec<SocketAddr>,
    pub multicast_addr: IpAddr,
    pub multicast_port: u16,
    pub multicast_ttl: u32,
    /// Upper bound on waiting for a first peer before bootstrapping on start.
    pub join_timeout_ms: u64,
}

impl GroupSettings {
    pub fn bind_addr(&self) -> SocketAddr {
        self.bind.unwrap_or_else(|| {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.multicast_port)
        })
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}

impl Default for GroupSettings {
    fn default() -> Self {
        Self {
            bind: None,
            seeds: Vec::new(),
            multicast_addr: IpAddr::V4(Ipv4Addr::new(224, 0, 0, 2)),
            multicast_port: 45588,
            multicast_ttl: 1,
            join_timeout_ms: 3000,
        }
    }
}

/// Bootstrap protocol settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapSettings {
    /// Upper bound on concurrently running bootstrap tasks.
    pub max_workers: usize,
    /// How long a requester waits for a status change before retrying the wait.
    pub response_timeout_ms: u64,
    /// Number of waits per peer before moving on.
    pub response_tries: u32,
    /// Maximum events per outbound chunk message.
    pub chunk_size: usize,
    /// Period of the stale request sweep.
    pub cleanup_interval_ms: u64,
    /// Bound on each disposal wait (pending requests, worker shutdown).
    pub shutdown_timeout_ms: u64,
}

impl BootstrapSettings {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    /// Total time spent on one peer: `response_timeout * response_tries`.
    pub fn max_response_timeout(&self) -> Duration {
        self.response_timeout() * self.response_tries
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

impl Default for BootstrapSettings {
    fn default() -> Self {
        Self {
            max_workers: 50,
            response_timeout_ms: 30_000,
            response_tries: 10,
            chunk_size: 100,
            cleanup_interval_ms: 60_000,
            shutdown_timeout_ms: 30_000,
        }
    }
}

/// Per-cache replication settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    pub name: String,
    #[serde(default)]
    pub time_to_live_ms: Option<u64>,
    #[serde(default)]
    pub transactional: bool,
    #[serde(default = "default_true")]
    pub replicate_puts: bool,
    #[serde(default = "default_true")]
    pub replicate_removes: bool,
    #[serde(default = "default_true")]
    pub replicate_asynchronously: bool,
    #[serde(default = "default_async_window_ms")]
    pub async_window_ms: u64,
    #[serde(default = "default_true")]
    pub bootstrap_on_start: bool,
    #[serde(default = "default_true")]
    pub bootstrap_asynchronously: bool,
}

impl CacheSettings {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            time_to_live_ms: None,
            transactional: false,
            replicate_puts: true,
            replicate_removes: true,
            replicate_asynchronously: true,
            async_window_ms: default_async_window_ms(),
            bootstrap_on_start: true,
            bootstrap_asynchronously: true,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_async_window_ms() -> u64 {
    1_000
}

impl ReplicationConfig {
    /// Loads `path` if it exists and parses, otherwise falls back to defaults.
    /// Environment overrides are applied in both cases.
    pub fn load_or_default(path: &Path) -> Self {
        let mut config = Self::default();

        if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(content) => match serde_json::from_str::<ReplicationConfig>(&content) {
                    Ok(loaded) => {
                        tracing::info!(
                            "Loaded replication config from {}: {} cache(s)",
                            path.display(),
                            loaded.caches.len()
                        );
                        config = loaded;
                    }
                    Err(e) => {
                        tracing::error!(
                            "Failed to parse {}: {}, using defaults",
                            path.display(),
                            e
                        );
                    }
                },
                Err(e) => {
                    tracing::error!("Failed to read {}: {}, using defaults", path.display(), e);
                }
            }
        } else {
            tracing::info!("No config at {}, using defaults", path.display());
        }

        config.apply_env_overrides();
        config
    }

    pub fn apply_env_overrides(&mut self) {
        if let Some(addr) = env_parse::<IpAddr>(ENV_MCAST_ADDR) {
            self.group.multicast_addr = addr;
        }
        if let Some(port) = env_parse::<u16>(ENV_MCAST_PORT) {
            self.group.multicast_port = port;
        }
        if let Some(ttl) = env_parse::<u32>(ENV_MCAST_TTL) {
            self.group.multicast_ttl = ttl;
        }
        if let Some(threads) = env_parse::<usize>(ENV_BOOTSTRAP_THREADS) {
            self.bootstrap.max_workers = threads;
        }
    }
}

fn env_parse<T>(name: &str) -> Option<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!("Ignoring {}={:?}: {}", name, raw, e);
            None
        }
    }
}
