//! The state shared by every task: configuration snapshot, statistics,
//! both object maps, the replication hub, and the coarse server clock.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::info;

use hoardd_store::{BucketMap, CacheObject, ConnectionId, SpillSettings};

use crate::config::Config;
use crate::counter::CounterObject;
use crate::logging::LogControl;
use crate::replication::ReplHub;
use crate::stats::{CounterStats, Stats, RELAXED};

pub struct Shared {
    pub config: Config,
    pub spill: SpillSettings,
    pub stats: Stats,
    pub counter_stats: CounterStats,
    pub cache: BucketMap<CacheObject>,
    pub counters: BucketMap<CounterObject>,
    /// Seconds since the epoch, advanced by the server interval tick.
    pub clock: Arc<AtomicI64>,
    pub repl: ReplHub,
    pub log: LogControl,
    /// While set, client traffic on the memcache and counter ports is
    /// refused.
    pub is_slave: AtomicBool,
    next_conn_id: AtomicU64,
}

fn wall_clock() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

impl Shared {
    pub fn new(config: Config, log: LogControl) -> Arc<Self> {
        let spill = SpillSettings {
            heap_data_limit: config.heap_data_limit.0,
            temp_dir: config.temp_dir.clone(),
        };
        let cache = BucketMap::new(config.buckets);
        let counters = BucketMap::new(config.counter.buckets);
        Arc::new(Self {
            config,
            spill,
            stats: Stats::default(),
            counter_stats: CounterStats::default(),
            cache,
            counters,
            clock: Arc::new(AtomicI64::new(wall_clock())),
            repl: ReplHub::default(),
            log,
            is_slave: AtomicBool::new(false),
            next_conn_id: AtomicU64::new(1),
        })
    }

    pub fn now(&self) -> i64 {
        self.clock.load(RELAXED)
    }

    /// Re-reads the wall clock; called once per interval tick.
    pub fn tick_clock(&self) -> i64 {
        let now = wall_clock();
        self.clock.store(now, RELAXED);
        now
    }

    pub fn next_connection_id(&self) -> ConnectionId {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn slave_mode(&self) -> bool {
        self.is_slave.load(Ordering::Acquire)
    }

    pub fn set_slave_mode(&self, slave: bool) {
        self.is_slave.store(slave, Ordering::Release);
    }

    /// Drops all cached state before (re)attaching to a master.
    pub fn clear_for_slave(&self) {
        self.cache.clear();
        self.counters.clear();
        self.stats.reset_for_slave();
    }

    /// One-line per-service summaries, triggered by SIGUSR1.
    pub fn dump_stats(&self) {
        if self.slave_mode() {
            info!(
                created = self.stats.repl_created.load(RELAXED),
                updated = self.stats.repl_updated.load(RELAXED),
                removed = self.stats.repl_removed.load(RELAXED),
                "memcache replication stats"
            );
            return;
        }

        let mut ops: u64 = 0;
        for counter in &self.stats.text_ops {
            ops += counter.load(RELAXED);
        }
        for counter in &self.stats.bin_ops {
            ops += counter.load(RELAXED);
        }
        info!(
            slaves = self.repl.count(),
            objects = self.stats.objects.load(RELAXED),
            clients = self.stats.curr_connections.load(RELAXED),
            total_ops = ops,
            "memcache master"
        );

        if self.config.counter.enable {
            let mut counter_ops: u64 = 0;
            for counter in &self.counter_stats.ops {
                counter_ops += counter.load(RELAXED);
            }
            info!(
                objects = self.counter_stats.objects.load(RELAXED),
                clients = self.counter_stats.curr_connections.load(RELAXED),
                total_ops = counter_ops,
                "counter"
            );
        }
    }
}
