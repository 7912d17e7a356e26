//! Wire protocol machines for hoardd: the memcached text and binary
//! dialects (with the lock/unlock extensions), the replication stream
//! encoding, and the counter service framing.
//!
//! Request decoders implement [`tokio_util::codec::Decoder`]; `Ok(None)`
//! means more bytes are needed. Response builders append complete frames to
//! a caller-supplied [`bytes::BytesMut`].

#![deny(warnings)]

pub mod counter;
pub mod memcache;
pub mod repl;

use std::io;

use snafu::Snafu;

/// Maximum accepted key length, in bytes.
pub const MAX_KEY_LENGTH: usize = 250;

/// A single pending request larger than this resets the connection.
pub const MAX_REQUEST_LENGTH: usize = 30 << 20;

/// Expiration times up to this many seconds are relative to now; larger
/// values are absolute Unix time.
pub const EXPTIME_THRESHOLD: i64 = 60 * 60 * 24 * 30;

/// Sentinel expiration meaning "leave the expiration unchanged".
pub const EXPTIME_NONE: i64 = -1;

/// Errors produced while framing a byte stream into requests.
#[derive(Debug, Snafu)]
pub enum FrameError {
    /// The peer accumulated more than [`MAX_REQUEST_LENGTH`] bytes without
    /// completing a request.
    #[snafu(display("pending request exceeds {limit} bytes"))]
    RequestTooLarge { limit: usize },

    #[snafu(context(false), display("socket read failed: {source}"))]
    Io { source: io::Error },
}

pub(crate) fn resolve_exptime(t: u64, now: i64) -> i64 {
    if t == 0 {
        return 0;
    }
    let t = t as i64;
    if t > EXPTIME_THRESHOLD {
        t
    } else {
        now + t
    }
}

pub(crate) fn resolve_binary_exptime(raw: u32, now: i64) -> i64 {
    if raw == u32::MAX {
        return EXPTIME_NONE;
    }
    resolve_exptime(u64::from(raw), now)
}
