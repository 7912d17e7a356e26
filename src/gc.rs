//! The cache garbage collector: a periodic per-bucket sweep implementing
//! flush, LRU-by-age eviction, and expiration, plus the statistics refresh
//! and the initial snapshot for newly joined replicas.

use std::sync::Arc;
use std::time::Instant;

use smallvec::SmallVec;
use tracing::{debug, error, info, warn};

use hoardd_store::{CacheObject, HashKey};

use crate::replication::{repl_delete, repl_object, Slave};
use crate::shared::Shared;
use crate::stats::RELAXED;
use crate::{MAX_CONSECUTIVE_GCS, MAX_SLAVES};

/// Tests whether `addr` is assigned to this host.
pub fn vip_is_local(addr: std::net::IpAddr) -> bool {
    std::net::UdpSocket::bind((addr, 0)).is_ok()
}

/// Decides when a sweep runs and owns the running sweep thread.
pub struct CacheGc {
    last_gc: i64,
    consecutive: u32,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl CacheGc {
    pub fn new(now: i64) -> Self {
        Self {
            last_gc: now,
            consecutive: 0,
            task: None,
        }
    }

    fn due(&mut self, shared: &Shared, now: i64) -> bool {
        let flush_at = shared.stats.flush_time.load(RELAXED);
        if flush_at != 0 && now >= flush_at {
            return true;
        }

        // run immediately when over the memory limit.
        if shared.stats.used_memory.load(RELAXED) > shared.config.memory_limit.0 as u64 {
            return true;
        }

        // new slaves need a snapshot, but flapping ones must not pin the
        // sweep in a loop.
        if shared.repl.has_pending_snapshot() && self.consecutive < MAX_CONSECUTIVE_GCS {
            self.consecutive += 1;
            return true;
        }

        if now > self.last_gc + shared.config.gc_interval as i64 {
            self.consecutive = 0;
            return true;
        }

        false
    }

    /// Starts a sweep if one is due and the previous one has finished.
    pub fn maybe_start(&mut self, shared: &Arc<Shared>, now: i64) {
        if let Some(task) = &self.task {
            if !task.is_finished() {
                return;
            }
            self.task = None;
            self.last_gc = now;
        }

        if !self.due(shared, now) {
            return;
        }

        // losing the VIP means another host took over; fail fast so the
        // supervisor restarts this process as a replica.
        if !vip_is_local(shared.config.virtual_ip) {
            error!("VIP has been lost, exiting quickly");
            std::process::exit(2);
        }

        let shared = shared.clone();
        let slaves = shared.repl.active();
        let new_slaves = shared.repl.take_pending_snapshot();
        self.task = Some(tokio::task::spawn_blocking(move || {
            run_sweep(&shared, &slaves, &new_slaves);
        }));
    }

    pub fn shutdown(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[derive(Default)]
struct SweepTally {
    objects: u64,
    under_1k: u64,
    under_4k: u64,
    under_16k: u64,
    under_64k: u64,
    under_256k: u64,
    under_1m: u64,
    under_4m: u64,
    huge: u64,
    used_memory: u64,
    conflicts: u64,
    oldest_age: u32,
    largest: u64,
    expirations: u64,
    evictions: u64,
}

/// One full sweep over every bucket. Runs on a blocking thread; each
/// bucket is held only while it is walked.
pub fn run_sweep(shared: &Shared, slaves: &[Arc<Slave>], new_slaves: &[Arc<Slave>]) {
    let started = Instant::now();
    let now = shared.now();

    let flush_at = shared.stats.flush_time.load(RELAXED);
    let flush = flush_at != 0 && now >= flush_at;

    let mut evict_age: u32 = 0;
    if !flush && shared.stats.used_memory.load(RELAXED) > shared.config.memory_limit.0 as u64 {
        // concentrate eviction on the oldest roughly one-hour tail.
        let oldest = shared.stats.oldest_age.load(RELAXED) as u32;
        let one_hour = (3600 / shared.config.gc_interval) as u32 + 1;
        evict_age = if oldest < one_hour * 2 {
            (oldest / 2).max(1)
        } else {
            oldest - one_hour
        };
        warn!(evict_age, "evicting objects by age");
    }

    let mut tally = SweepTally::default();
    let heap_limit = shared.config.heap_data_limit.0;

    for index in 0..shared.cache.bucket_count() {
        let mut in_bucket = 0u32;
        shared.cache.gc_bucket(index, |key, obj| {
            if flush && !obj.locked() {
                repl_delete(slaves, key);
                return true;
            }
            if evict_age > 0 && obj.age() >= evict_age && !obj.locked() {
                tally.evictions += 1;
                repl_delete(slaves, key);
                return true;
            }
            if obj.expired(now, flush_at) {
                tally.expirations += 1;
                repl_delete(slaves, key);
                return true;
            }

            obj.survive();
            tally.objects += 1;
            in_bucket += 1;
            if in_bucket == 2 {
                tally.conflicts += 1;
            }
            let size = obj.size() as u64;
            match size {
                0..=1023 => tally.under_1k += 1,
                1024..=4095 => tally.under_4k += 1,
                4096..=16383 => tally.under_16k += 1,
                16384..=65535 => tally.under_64k += 1,
                65536..=262143 => tally.under_256k += 1,
                262144..=1048575 => tally.under_1m += 1,
                1048576..=4194303 => tally.under_4m += 1,
                _ => tally.huge += 1,
            }
            tally.used_memory += (std::mem::size_of::<HashKey>()
                + key.len()
                + std::mem::size_of::<CacheObject>()) as u64;
            if obj.size() <= heap_limit {
                tally.used_memory += size;
            }
            tally.oldest_age = tally.oldest_age.max(obj.age());
            tally.largest = tally.largest.max(size);

            if !new_slaves.is_empty() {
                if let Err(error) = repl_object(new_slaves, key, obj) {
                    warn!(%error, "cannot snapshot an object to new slaves");
                }
            }
            false
        });
    }

    if flush {
        shared.stats.flush_time.store(0, RELAXED);
    }

    let stats = &shared.stats;
    stats.objects.store(tally.objects, RELAXED);
    stats.objects_under_1k.store(tally.under_1k, RELAXED);
    stats.objects_under_4k.store(tally.under_4k, RELAXED);
    stats.objects_under_16k.store(tally.under_16k, RELAXED);
    stats.objects_under_64k.store(tally.under_64k, RELAXED);
    stats.objects_under_256k.store(tally.under_256k, RELAXED);
    stats.objects_under_1m.store(tally.under_1m, RELAXED);
    stats.objects_under_4m.store(tally.under_4m, RELAXED);
    stats.objects_huge.store(tally.huge, RELAXED);
    stats.used_memory.store(tally.used_memory, RELAXED);
    stats.conflicts.store(tally.conflicts, RELAXED);
    stats.gc_count.fetch_add(1, RELAXED);
    stats.oldest_age.store(u64::from(tally.oldest_age), RELAXED);
    stats.largest_object_size.store(tally.largest, RELAXED);
    stats.last_expirations.store(tally.expirations, RELAXED);
    stats.last_evictions.store(tally.evictions, RELAXED);
    stats.total_evictions.fetch_add(tally.evictions, RELAXED);

    if !new_slaves.is_empty() {
        info!(
            slaves = new_slaves.len(),
            "initial replication completed for new slave(s)"
        );
    }

    let elapsed = started.elapsed().as_micros() as u64;
    stats.last_gc_elapsed.store(elapsed, RELAXED);
    stats.total_gc_elapsed.fetch_add(elapsed, RELAXED);
    debug!(
        elapsed_us = elapsed,
        expired = tally.expirations,
        evicted = tally.evictions,
        survived = tally.objects,
        "GC end"
    );
}

/// Convenience wrapper used by the sweep trigger and tests.
pub fn sweep_now(shared: &Shared) {
    let slaves: SmallVec<[Arc<Slave>; MAX_SLAVES]> = shared.repl.active();
    let new_slaves = shared.repl.take_pending_snapshot();
    run_sweep(shared, &slaves, &new_slaves);
}
