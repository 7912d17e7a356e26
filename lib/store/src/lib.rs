//! In-memory object storage for hoardd: a fingerprinted hash key, a
//! bucketed concurrent map with one mutex per bucket, and the cache object
//! with heap or spilled payloads.

#![deny(warnings)]

mod key;
mod map;
mod object;
mod spill;

pub use key::{fingerprint, HashKey};
pub use map::{nearest_prime, BucketMap};
pub use object::{CacheObject, ConnectionId, NotANumber, SpillSettings, FLUSH_AGE};
pub use spill::SpillFile;
