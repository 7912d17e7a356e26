//! Master→slave replication: the slave registry and outbound fan-out on
//! the master, and the apply path on a slave.
//!
//! Mutations travel as quiet binary memcache requests encoded from the
//! live object, so append/prepend replicate the merged payload.
//! Replication is best-effort: a failing or clogged slave is dropped, the
//! master never waits for acknowledgement.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex;
use smallvec::SmallVec;
use snafu::Snafu;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use hoardd_store::{CacheObject, HashKey};
use hoardd_wire::memcache::{BinaryCommand, BinaryRequest};
use hoardd_wire::repl;

use crate::shared::Shared;
use crate::stats::RELAXED;
use crate::MAX_SLAVES;

/// One attached replica: a staging buffer drained by a writer task.
///
/// Frames are appended whole under the buffer's mutex, so concurrent
/// producers (workers, the GC sweep) never interleave partial frames.
pub struct Slave {
    pub peer: SocketAddr,
    max_buffered: usize,
    outbox: Mutex<BytesMut>,
    wakeup: Notify,
    valid: AtomicBool,
    last_heartbeat: AtomicI64,
}

impl Slave {
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    pub fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
        self.wakeup.notify_one();
    }

    pub fn heartbeat(&self, now: i64) {
        self.last_heartbeat.store(now, RELAXED);
    }

    pub fn timed_out(&self, now: i64, timeout: i64) -> bool {
        self.last_heartbeat.load(RELAXED) + timeout <= now
    }

    /// Appends one frame to the outbox. An outbox past the configured cap
    /// means the slave cannot keep up; it is dropped rather than letting
    /// it stall the master.
    pub fn push_frame(&self, build: impl FnOnce(&mut BytesMut)) {
        if !self.is_valid() {
            return;
        }
        let mut outbox = self.outbox.lock();
        build(&mut outbox);
        if outbox.len() > self.max_buffered {
            warn!(peer = %self.peer, "replication buffer is full, dropping the slave");
            outbox.clear();
            drop(outbox);
            self.invalidate();
            return;
        }
        drop(outbox);
        self.wakeup.notify_one();
    }

    fn take_chunk(&self) -> Option<bytes::Bytes> {
        let mut outbox = self.outbox.lock();
        if outbox.is_empty() {
            None
        } else {
            Some(outbox.split().freeze())
        }
    }
}

/// Drains a slave's outbox to its socket, FIFO.
pub async fn run_slave_writer(slave: Arc<Slave>, mut write: OwnedWriteHalf) {
    loop {
        match slave.take_chunk() {
            Some(chunk) => {
                if let Err(error) = write.write_all(&chunk).await {
                    // a vanished peer is routine; anything else is worth a line.
                    if error.kind() != io::ErrorKind::BrokenPipe {
                        warn!(peer = %slave.peer, %error, "replication write failed");
                    }
                    slave.invalidate();
                    return;
                }
            }
            None => {
                if !slave.is_valid() {
                    return;
                }
                slave.wakeup.notified().await;
            }
        }
    }
}

/// Consumes a slave's inbound bytes; any byte is a heartbeat.
pub async fn run_slave_reader(slave: Arc<Slave>, shared: Arc<Shared>, mut read: OwnedReadHalf) {
    let mut buf = [0u8; 4096];
    loop {
        match read.read(&mut buf).await {
            Ok(0) | Err(_) => {
                slave.invalidate();
                return;
            }
            Ok(_) => slave.heartbeat(shared.now()),
        }
    }
}

/// The master-side registry of attached replicas.
#[derive(Default)]
pub struct ReplHub {
    slaves: Mutex<Vec<Arc<Slave>>>,
    /// Joined but not yet sent a full snapshot; handled by the next GC.
    pending_snapshot: Mutex<Vec<Arc<Slave>>>,
}

impl ReplHub {
    /// Registers a newly connected replica, or refuses it at capacity.
    pub fn register(
        &self,
        peer: SocketAddr,
        max_buffered: usize,
        now: i64,
    ) -> Option<Arc<Slave>> {
        let mut slaves = self.slaves.lock();
        if slaves.len() >= MAX_SLAVES {
            return None;
        }
        let slave = Arc::new(Slave {
            peer,
            max_buffered,
            outbox: Mutex::new(BytesMut::new()),
            wakeup: Notify::new(),
            valid: AtomicBool::new(true),
            last_heartbeat: AtomicI64::new(now),
        });
        slaves.push(slave.clone());
        self.pending_snapshot.lock().push(slave.clone());
        info!(%peer, "a new slave has joined");
        Some(slave)
    }

    /// Currently valid replicas, for fan-out.
    pub fn active(&self) -> SmallVec<[Arc<Slave>; MAX_SLAVES]> {
        self.slaves
            .lock()
            .iter()
            .filter(|s| s.is_valid())
            .cloned()
            .collect()
    }

    pub fn count(&self) -> usize {
        self.slaves.lock().len()
    }

    pub fn has_pending_snapshot(&self) -> bool {
        !self.pending_snapshot.lock().is_empty()
    }

    /// Claims the replicas awaiting their initial snapshot.
    pub fn take_pending_snapshot(&self) -> Vec<Arc<Slave>> {
        std::mem::take(&mut *self.pending_snapshot.lock())
    }

    /// Drops invalid replicas and times out silent ones.
    pub fn prune(&self, now: i64, timeout: i64) {
        let mut slaves = self.slaves.lock();
        slaves.retain(|slave| {
            if !slave.is_valid() {
                return false;
            }
            if slave.timed_out(now, timeout) {
                info!(
                    peer = %slave.peer,
                    "no heartbeats from a slave, closing the replication socket"
                );
                slave.invalidate();
                return false;
            }
            true
        });
        self.pending_snapshot.lock().retain(|slave| slave.is_valid());
    }

    pub fn clear(&self) {
        for slave in self.slaves.lock().drain(..) {
            slave.invalidate();
        }
        self.pending_snapshot.lock().clear();
    }
}

/// Fans one object state out as `SetQ`.
pub fn repl_object(
    slaves: &[Arc<Slave>],
    key: &HashKey,
    obj: &mut CacheObject,
) -> io::Result<()> {
    if slaves.is_empty() {
        return Ok(());
    }
    let mut data = BytesMut::with_capacity(obj.size());
    obj.read_into(&mut data)?;
    for slave in slaves {
        slave.push_frame(|out| {
            repl::put_set(out, key.as_bytes(), obj.flags(), obj.exptime_wire(), &data)
        });
    }
    Ok(())
}

/// Fans one removal out as `DeleteQ`.
pub fn repl_delete(slaves: &[Arc<Slave>], key: &HashKey) {
    for slave in slaves {
        slave.push_frame(|out| repl::put_delete(out, key.as_bytes()));
    }
}

/// The replication stream carried something that is not a binary frame;
/// the slave aborts so the supervisor can restart it.
#[derive(Debug, Snafu)]
pub enum ReplicaError {
    #[snafu(display("invalid replication data"))]
    CorruptStream,

    #[snafu(display("cannot apply replicated object: {source}"))]
    Apply { source: io::Error },
}

/// Applies one replicated frame to the local map (slave side).
pub fn apply_replicated(shared: &Shared, req: &BinaryRequest) -> Result<(), ReplicaError> {
    match req.command {
        Some(BinaryCommand::SetQ) => {
            let failure = std::cell::Cell::new(None::<io::Error>);
            let updated = std::cell::Cell::new(false);
            shared.cache.apply(
                &req.key,
                |_, obj| {
                    debug!(key = %String::from_utf8_lossy(&req.key), "repl: set");
                    if let Err(e) = obj.set(&req.data, req.flags, req.exptime, &shared.spill) {
                        failure.set(Some(e));
                    }
                    updated.set(true);
                    true
                },
                Some(|_: &HashKey| {
                    match CacheObject::new(&req.data, req.flags, req.exptime, &shared.spill) {
                        Ok(o) => {
                            shared.stats.total_objects.fetch_add(1, RELAXED);
                            Some(o)
                        }
                        Err(e) => {
                            failure.set(Some(e));
                            None
                        }
                    }
                }),
            );
            if let Some(source) = failure.into_inner() {
                return Err(ReplicaError::Apply { source });
            }
            let counter = if updated.get() {
                &shared.stats.repl_updated
            } else {
                &shared.stats.repl_created
            };
            counter.fetch_add(1, RELAXED);
        }
        Some(BinaryCommand::DeleteQ) => {
            debug!(key = %String::from_utf8_lossy(&req.key), "repl: remove");
            shared.cache.remove(&req.key);
            shared.stats.repl_removed.fetch_add(1, RELAXED);
        }
        _ => {
            error!(opcode = format!("{:#04x}", req.opcode), "unknown replication command");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::shared::Shared;

    fn test_shared() -> Arc<Shared> {
        let mut config = Config::default();
        config.temp_dir = std::env::temp_dir();
        config.buckets = 64;
        Shared::new(config, Default::default())
    }

    fn set_req(key: &[u8], value: &[u8], flags: u32) -> BinaryRequest {
        use tokio_util::codec::Decoder;

        let mut out = BytesMut::new();
        repl::put_set(&mut out, key, flags, 0, value);
        let mut decoder =
            hoardd_wire::memcache::MemcacheDecoder::new(Arc::new(AtomicI64::new(0)));
        match decoder.decode(&mut out).unwrap().unwrap() {
            hoardd_wire::memcache::Request::Binary(req) => req,
            _ => unreachable!(),
        }
    }

    #[test]
    fn replicated_set_creates_then_updates() {
        let shared = test_shared();

        apply_replicated(&shared, &set_req(b"k", b"v1", 5)).unwrap();
        assert_eq!(shared.stats.repl_created.load(RELAXED), 1);

        apply_replicated(&shared, &set_req(b"k", b"v2", 5)).unwrap();
        assert_eq!(shared.stats.repl_updated.load(RELAXED), 1);

        let mut seen = BytesMut::new();
        shared.cache.apply(
            b"k",
            |_, obj| {
                obj.read_into(&mut seen).unwrap();
                true
            },
            None::<fn(&HashKey) -> Option<CacheObject>>,
        );
        assert_eq!(&seen[..], b"v2");
    }
}
