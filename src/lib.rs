//! hoardd: a memcached-compatible in-memory cache server with per-object
//! pessimistic locking, master→slave replication, and a companion resource
//! counter service.

#![deny(warnings)]

pub mod config;
pub mod counter;
pub mod gc;
pub mod logging;
pub mod memcache;
pub mod replication;
pub mod server;
pub mod shared;
pub mod stats;

/// Version string reported by `version` and `stats`.
pub const VERSION: &str = concat!("hoardd version ", env!("CARGO_PKG_VERSION"));

/// Checks after losing the master before taking over, at 100 ms each.
pub const MASTER_CHECKS: u32 = 50;

/// At most this many replicas may be attached at once.
pub const MAX_SLAVES: usize = 5;

/// Cap on back-to-back snapshot sweeps for flapping replicas.
pub const MAX_CONSECUTIVE_GCS: u32 = 3;

/// A per-connection scratch output buffer larger than this is released
/// after the batch instead of being kept around.
pub const SCRATCH_BUFSIZE: usize = 5 << 20;
