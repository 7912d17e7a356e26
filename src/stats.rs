//! Statistics counters. Everything here is a relaxed atomic: exported
//! values are snapshots and need not be mutually consistent.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use hoardd_wire::counter::CounterCommand;
use hoardd_wire::memcache::TextCommand;

pub const RELAXED: Ordering = Ordering::Relaxed;

fn zeroed<const N: usize>() -> [AtomicU64; N] {
    std::array::from_fn(|_| AtomicU64::new(0))
}

/// Cache-side statistics, exported by the `stats` commands.
pub struct Stats {
    /* object counters, updated at every GC */
    pub objects: AtomicU64,
    pub objects_under_1k: AtomicU64,
    pub objects_under_4k: AtomicU64,
    pub objects_under_16k: AtomicU64,
    pub objects_under_64k: AtomicU64,
    pub objects_under_256k: AtomicU64,
    pub objects_under_1m: AtomicU64,
    pub objects_under_4m: AtomicU64,
    pub objects_huge: AtomicU64,
    pub used_memory: AtomicU64,
    pub conflicts: AtomicU64,

    /* GC statistics */
    pub gc_count: AtomicU64,
    pub oldest_age: AtomicU64,
    pub largest_object_size: AtomicU64,
    pub last_expirations: AtomicU64,
    pub last_evictions: AtomicU64,
    pub total_evictions: AtomicU64,
    /// Microseconds.
    pub last_gc_elapsed: AtomicU64,
    pub total_gc_elapsed: AtomicU64,

    /* realtime statistics */
    pub total_objects: AtomicU64,
    /// The global flush boundary written by `flush_all`; 0 = none.
    pub flush_time: AtomicI64,
    pub curr_connections: AtomicU64,
    pub total_connections: AtomicU64,
    pub text_ops: [AtomicU64; TextCommand::COUNT],
    /// Indexed by raw opcode.
    pub bin_ops: [AtomicU64; 256],
    pub get_hits: AtomicU64,
    pub get_misses: AtomicU64,
    pub cas_hits: AtomicU64,
    pub cas_misses: AtomicU64,
    pub cas_badval: AtomicU64,

    /* replication statistics, maintained in slave mode */
    pub repl_created: AtomicU64,
    pub repl_updated: AtomicU64,
    pub repl_removed: AtomicU64,
}

impl Default for Stats {
    fn default() -> Self {
        Self {
            objects: AtomicU64::new(0),
            objects_under_1k: AtomicU64::new(0),
            objects_under_4k: AtomicU64::new(0),
            objects_under_16k: AtomicU64::new(0),
            objects_under_64k: AtomicU64::new(0),
            objects_under_256k: AtomicU64::new(0),
            objects_under_1m: AtomicU64::new(0),
            objects_under_4m: AtomicU64::new(0),
            objects_huge: AtomicU64::new(0),
            used_memory: AtomicU64::new(0),
            conflicts: AtomicU64::new(0),
            gc_count: AtomicU64::new(0),
            oldest_age: AtomicU64::new(0),
            largest_object_size: AtomicU64::new(0),
            last_expirations: AtomicU64::new(0),
            last_evictions: AtomicU64::new(0),
            total_evictions: AtomicU64::new(0),
            last_gc_elapsed: AtomicU64::new(0),
            total_gc_elapsed: AtomicU64::new(0),
            total_objects: AtomicU64::new(0),
            flush_time: AtomicI64::new(0),
            curr_connections: AtomicU64::new(0),
            total_connections: AtomicU64::new(0),
            text_ops: zeroed(),
            bin_ops: zeroed(),
            get_hits: AtomicU64::new(0),
            get_misses: AtomicU64::new(0),
            cas_hits: AtomicU64::new(0),
            cas_misses: AtomicU64::new(0),
            cas_badval: AtomicU64::new(0),
            repl_created: AtomicU64::new(0),
            repl_updated: AtomicU64::new(0),
            repl_removed: AtomicU64::new(0),
        }
    }
}

impl Stats {
    pub fn count_text_op(&self, command: TextCommand) {
        self.text_ops[command.index()].fetch_add(1, RELAXED);
    }

    pub fn count_bin_op(&self, opcode: u8) {
        self.bin_ops[opcode as usize].fetch_add(1, RELAXED);
    }

    /// Forgets everything learned while attached to a previous master.
    pub fn reset_for_slave(&self) {
        self.total_objects.store(0, RELAXED);
        self.repl_created.store(0, RELAXED);
        self.repl_updated.store(0, RELAXED);
        self.repl_removed.store(0, RELAXED);
    }
}

/// Counter-service statistics.
pub struct CounterStats {
    pub objects: AtomicU64,
    pub total_objects: AtomicU64,
    pub used_memory: AtomicU64,
    pub conflicts: AtomicU64,
    pub gc_count: AtomicU64,
    pub last_gc_elapsed: AtomicU64,
    pub total_gc_elapsed: AtomicU64,
    pub curr_connections: AtomicU64,
    pub total_connections: AtomicU64,
    pub ops: [AtomicU64; CounterCommand::ALL.len()],
}

impl Default for CounterStats {
    fn default() -> Self {
        Self {
            objects: AtomicU64::new(0),
            total_objects: AtomicU64::new(0),
            used_memory: AtomicU64::new(0),
            conflicts: AtomicU64::new(0),
            gc_count: AtomicU64::new(0),
            last_gc_elapsed: AtomicU64::new(0),
            total_gc_elapsed: AtomicU64::new(0),
            curr_connections: AtomicU64::new(0),
            total_connections: AtomicU64::new(0),
            ops: zeroed(),
        }
    }
}

impl CounterStats {
    pub fn count_op(&self, command: CounterCommand) {
        let index = CounterCommand::ALL
            .iter()
            .position(|c| *c == command)
            .unwrap_or(0);
        self.ops[index].fetch_add(1, RELAXED);
    }

    pub fn op_count(&self, command: CounterCommand) -> u64 {
        let index = CounterCommand::ALL
            .iter()
            .position(|c| *c == command)
            .unwrap_or(0);
        self.ops[index].load(RELAXED)
    }
}
