//! Cache Replication Library
//!
//! Keeps named in-process caches consistent across the members of a group and lets a
//! joining member fill its caches from a live peer. The binary (`main.rs`) runs one member
//! with an HTTP surface on top.
//!
//! ## Architecture Modules
//! - **`cache`**: the cache interface replication works against, plus an in-memory cache.
//! - **`group`**: membership and messaging. A UDP gossip group for real deployments and an
//!   in-process network for tests.
//! - **`replication`**: wire protocol, outbound transport with time-windowed batching, the
//!   inbound dispatcher and the listener that turns local writes into events.
//! - **`bootstrap`**: pull-based transfer of a whole cache from one peer, with retries,
//!   a pending-request registry and a bounded worker pool.
//! - **`node`**: wiring and lifecycle of all of the above for one member, and its HTTP API.
//! - **`config`**: file and environment configuration.

pub mod bootstrap;
pub mod cache;
pub mod config;
pub mod group;
pub mod node;
pub mod replication;
