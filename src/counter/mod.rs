//! The counter service: named resource accounting over its own binary
//! framing, with per-connection acquisition ledgers and a periodic GC that
//! drops fully released counters.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::codec::FramedRead;
use tracing::{debug, warn};

use hoardd_store::HashKey;
use hoardd_wire::counter::{
    put_stat, CounterCommand, CounterDecoder, CounterRequest, CounterResponder, CounterStatus,
};

use crate::shared::Shared;
use crate::stats::RELAXED;

/// One named counter: current consumption plus its historical peak.
///
/// The maximum is not stored; every `Acquire` carries its own cap.
#[derive(Debug)]
pub struct CounterObject {
    consumption: u32,
    max_consumption: u32,
}

impl CounterObject {
    pub fn new(resources: u32) -> Self {
        Self {
            consumption: resources,
            max_consumption: resources,
        }
    }

    /// Consumes `resources` unless that would exceed `maximum`.
    pub fn acquire(&mut self, resources: u32, maximum: u32) -> bool {
        let Some(next) = self.consumption.checked_add(resources) else {
            return false;
        };
        if next > maximum {
            return false;
        }
        self.consumption = next;
        self.max_consumption = self.max_consumption.max(next);
        true
    }

    pub fn release(&mut self, resources: u32) -> bool {
        if resources > self.consumption {
            return false;
        }
        self.consumption -= resources;
        true
    }

    pub fn consumption(&self) -> u32 {
        self.consumption
    }

    pub fn max_consumption(&self) -> u32 {
        self.max_consumption
    }

    /// Fully released counters are garbage.
    pub fn deletable(&self) -> bool {
        self.consumption == 0
    }
}

type NoCreate = Option<fn(&HashKey) -> Option<CounterObject>>;
const NO_CREATE: NoCreate = None;

/// Per-connection acquisition ledger; everything still held is released
/// when the connection goes away.
#[derive(Default)]
struct Ledger {
    acquired: HashMap<Bytes, u32>,
}

impl Ledger {
    fn on_acquire(&mut self, name: &HashKey, resources: u32) {
        *self.acquired.entry(name.bytes().clone()).or_insert(0) += resources;
    }

    fn on_release(&mut self, name: &[u8], resources: u32) -> bool {
        let Some(held) = self.acquired.get_mut(name) else {
            return false;
        };
        if *held < resources {
            return false;
        }
        *held -= resources;
        if *held == 0 {
            self.acquired.remove(name);
        }
        true
    }

    fn release_all(&mut self, shared: &Shared) {
        for (name, held) in self.acquired.drain() {
            shared.counters.apply(
                &name,
                |_, obj| {
                    let released = obj.release(held);
                    debug_assert!(released, "over-release on teardown");
                    true
                },
                NO_CREATE,
            );
        }
    }
}

fn execute(shared: &Shared, ledger: &mut Ledger, req: &CounterRequest, out: &mut BytesMut) {
    let mut r = CounterResponder::new(out, req);

    if req.status != CounterStatus::Ok {
        r.error(req.status);
        return;
    }
    let Some(command) = req.command else {
        r.error(CounterStatus::UnknownCommand);
        return;
    };
    shared.counter_stats.count_op(command);

    match command {
        CounterCommand::Noop => r.success(),
        CounterCommand::Get => {
            let mut consumption = None;
            shared.counters.apply(
                &req.name,
                |_, obj| {
                    consumption = Some(obj.consumption());
                    true
                },
                NO_CREATE,
            );
            match consumption {
                Some(count) => r.consumption(count),
                None => r.error(CounterStatus::NotFound),
            }
        }
        CounterCommand::Acquire => {
            let granted = std::cell::Cell::new(false);
            let ledger = std::cell::RefCell::new(ledger);
            shared.counters.apply(
                &req.name,
                |k, obj| {
                    if obj.acquire(req.resources, req.maximum) {
                        ledger.borrow_mut().on_acquire(k, req.resources);
                        granted.set(true);
                    }
                    true
                },
                Some(|k: &HashKey| {
                    ledger.borrow_mut().on_acquire(k, req.resources);
                    shared.counter_stats.total_objects.fetch_add(1, RELAXED);
                    granted.set(true);
                    Some(CounterObject::new(req.resources))
                }),
            );
            if granted.get() {
                r.consumption(req.resources);
            } else {
                r.error(CounterStatus::ResourceNotAvailable);
            }
        }
        CounterCommand::Release => {
            let mut found = false;
            let mut released = false;
            shared.counters.apply(
                &req.name,
                |k, obj| {
                    found = true;
                    if !ledger.on_release(k.as_bytes(), req.resources) {
                        return true;
                    }
                    let ok = obj.release(req.resources);
                    debug_assert!(ok, "ledger out of sync");
                    released = true;
                    true
                },
                NO_CREATE,
            );
            if !found {
                r.error(CounterStatus::NotFound);
            } else if released {
                r.success();
            } else {
                r.error(CounterStatus::NotAcquired);
            }
        }
        CounterCommand::Stats => {
            let stats = &shared.counter_stats;
            let mut body = BytesMut::new();
            put_stat(&mut body, "objects", stats.objects.load(RELAXED));
            put_stat(&mut body, "total_objects", stats.total_objects.load(RELAXED));
            put_stat(&mut body, "used_memory", stats.used_memory.load(RELAXED));
            put_stat(&mut body, "conflicts", stats.conflicts.load(RELAXED));
            put_stat(&mut body, "gc_count", stats.gc_count.load(RELAXED));
            put_stat(
                &mut body,
                "last_gc_elapsed",
                stats.last_gc_elapsed.load(RELAXED),
            );
            put_stat(
                &mut body,
                "total_gc_elapsed",
                stats.total_gc_elapsed.load(RELAXED),
            );
            put_stat(
                &mut body,
                "curr_connections",
                stats.curr_connections.load(RELAXED),
            );
            put_stat(
                &mut body,
                "total_connections",
                stats.total_connections.load(RELAXED),
            );
            for command in CounterCommand::ALL {
                put_stat(
                    &mut body,
                    &format!("command:{}", command.name()),
                    stats.op_count(command),
                );
            }
            r.stats(&body);
        }
        CounterCommand::Dump => {
            shared.counters.for_each(|key, obj| {
                r.dump_entry(key.as_bytes(), obj.consumption(), obj.max_consumption());
            });
            // terminated by an OK response with an empty body.
            r.success();
        }
    }
}

/// Serves one counter client connection.
pub async fn serve_client(shared: Arc<Shared>, stream: TcpStream) {
    let stats = &shared.counter_stats;
    let max = shared.config.counter.max_connections;
    if max != 0 && stats.curr_connections.load(RELAXED) >= u64::from(max) {
        return;
    }
    stats.curr_connections.fetch_add(1, RELAXED);
    stats.total_connections.fetch_add(1, RELAXED);

    let _ = stream.set_nodelay(true);
    let (read, mut write) = stream.into_split();
    let mut framed = FramedRead::new(read, CounterDecoder);
    let mut ledger = Ledger::default();
    let mut out = BytesMut::new();

    while let Some(next) = framed.next().await {
        match next {
            Ok(req) => {
                execute(&shared, &mut ledger, &req, &mut out);
                if !out.is_empty() {
                    if write.write_all(&out).await.is_err() {
                        break;
                    }
                    out.clear();
                }
            }
            Err(error) => {
                warn!(%error, "counter connection error");
                break;
            }
        }
    }

    ledger.release_all(&shared);
    stats.curr_connections.fetch_sub(1, RELAXED);
}

/// Sweeps fully released counters and refreshes counter statistics.
/// Runs on a blocking thread.
pub fn run_gc(shared: &Shared) {
    let started = Instant::now();
    let stats = &shared.counter_stats;

    let mut objects: u64 = 0;
    let mut conflicts: u64 = 0;
    let mut used_memory: u64 = 0;
    for index in 0..shared.counters.bucket_count() {
        let mut in_bucket = 0u32;
        shared.counters.gc_bucket(index, |key, obj| {
            if obj.deletable() {
                return true;
            }
            objects += 1;
            in_bucket += 1;
            if in_bucket == 2 {
                conflicts += 1;
            }
            used_memory += (std::mem::size_of::<HashKey>()
                + key.len()
                + std::mem::size_of::<CounterObject>()) as u64;
            false
        });
    }

    stats.objects.store(objects, RELAXED);
    stats.used_memory.store(used_memory, RELAXED);
    stats.conflicts.store(conflicts, RELAXED);
    stats.gc_count.fetch_add(1, RELAXED);

    let elapsed = started.elapsed().as_micros() as u64;
    stats.last_gc_elapsed.store(elapsed, RELAXED);
    stats.total_gc_elapsed.fetch_add(elapsed, RELAXED);
    debug!(elapsed_us = elapsed, survived = objects, "counter GC end");
}

/// Decides when the counter GC runs: on `stat_interval` boundaries.
pub struct CounterGc {
    last_gc: i64,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl CounterGc {
    pub fn new(now: i64) -> Self {
        Self {
            last_gc: now,
            task: None,
        }
    }

    pub fn maybe_start(&mut self, shared: &Arc<Shared>, now: i64) {
        if let Some(task) = &self.task {
            if !task.is_finished() {
                return;
            }
            self.task = None;
            self.last_gc = now;
        }

        let interval = shared.config.counter.stat_interval as i64;
        let boundary = (now / interval) * interval;
        if self.last_gc >= boundary {
            return;
        }
        let shared = shared.clone();
        self.task = Some(tokio::task::spawn_blocking(move || run_gc(&shared)));
    }

    pub fn shutdown(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::logging::LogControl;

    fn test_shared() -> Arc<Shared> {
        let mut config = Config::default();
        config.temp_dir = std::env::temp_dir();
        config.buckets = 64;
        config.counter.buckets = 16;
        Shared::new(config, LogControl::default())
    }

    fn acquire(shared: &Shared, ledger: &mut Ledger, name: &[u8], n: u32, max: u32) -> BytesMut {
        let req = CounterRequest {
            command: Some(CounterCommand::Acquire),
            opcode: CounterCommand::Acquire.opcode(),
            status: CounterStatus::Ok,
            flags: 0,
            opaque: [0; 4],
            resources: n,
            maximum: max,
            name: Bytes::copy_from_slice(name),
        };
        let mut out = BytesMut::new();
        execute(shared, ledger, &req, &mut out);
        out
    }

    fn release(shared: &Shared, ledger: &mut Ledger, name: &[u8], n: u32) -> BytesMut {
        let req = CounterRequest {
            command: Some(CounterCommand::Release),
            opcode: CounterCommand::Release.opcode(),
            status: CounterStatus::Ok,
            flags: 0,
            opaque: [0; 4],
            resources: n,
            maximum: 0,
            name: Bytes::copy_from_slice(name),
        };
        let mut out = BytesMut::new();
        execute(shared, ledger, &req, &mut out);
        out
    }

    fn status_of(frame: &[u8]) -> u8 {
        frame[2]
    }

    #[test]
    fn acquire_respects_the_maximum() {
        let shared = test_shared();
        let mut ledger = Ledger::default();

        let out = acquire(&shared, &mut ledger, b"sem", 3, 5);
        assert_eq!(status_of(&out), 0x00);

        // 3 + 3 > 5
        let out = acquire(&shared, &mut ledger, b"sem", 3, 5);
        assert_eq!(status_of(&out), 0x21);

        let out = acquire(&shared, &mut ledger, b"sem", 2, 5);
        assert_eq!(status_of(&out), 0x00);
    }

    #[test]
    fn release_requires_prior_acquisition() {
        let shared = test_shared();
        let mut ledger = Ledger::default();
        acquire(&shared, &mut ledger, b"sem", 3, 5);

        let mut other = Ledger::default();
        let out = release(&shared, &mut other, b"sem", 1);
        assert_eq!(status_of(&out), 0x22); // NotAcquired

        let out = release(&shared, &mut ledger, b"sem", 4);
        assert_eq!(status_of(&out), 0x22); // more than held

        let out = release(&shared, &mut ledger, b"sem", 2);
        assert_eq!(status_of(&out), 0x00);

        let out = release(&shared, &mut ledger, b"missing", 1);
        assert_eq!(status_of(&out), 0x01); // NotFound
    }

    #[test]
    fn teardown_releases_everything() {
        let shared = test_shared();
        let mut ledger = Ledger::default();
        acquire(&shared, &mut ledger, b"a", 3, 5);
        acquire(&shared, &mut ledger, b"b", 1, 1);
        ledger.release_all(&shared);

        let mut consumption = None;
        shared.counters.apply(
            b"a",
            |_, obj| {
                consumption = Some(obj.consumption());
                true
            },
            NO_CREATE,
        );
        assert_eq!(consumption, Some(0));
    }

    #[test]
    fn gc_drops_fully_released_counters() {
        let shared = test_shared();
        let mut ledger = Ledger::default();
        acquire(&shared, &mut ledger, b"gone", 2, 5);
        acquire(&shared, &mut ledger, b"kept", 2, 5);
        release(&shared, &mut ledger, b"gone", 2);

        run_gc(&shared);
        assert_eq!(shared.counter_stats.objects.load(RELAXED), 1);

        let mut found = false;
        shared.counters.apply(
            b"gone",
            |_, _| {
                found = true;
                true
            },
            NO_CREATE,
        );
        assert!(!found);
    }

    #[test]
    fn peak_consumption_is_tracked() {
        let mut obj = CounterObject::new(3);
        assert_eq!(obj.max_consumption(), 3);
        obj.release(2);
        assert!(obj.acquire(4, 5));
        assert_eq!(obj.consumption(), 5);
        assert_eq!(obj.max_consumption(), 5);
        obj.release(5);
        assert!(obj.deletable());
        assert_eq!(obj.max_consumption(), 5);
    }
}
