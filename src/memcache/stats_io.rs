//! `stats` emission for both dialects.

use hoardd_wire::memcache::{
    BinaryCommand, BinaryResponder, StatsCategory, TextCommand, TextResponder,
};

use crate::shared::Shared;
use crate::stats::RELAXED;
use crate::VERSION;

/// (user_sec, user_usec, system_sec, system_usec) of this process.
fn rusage() -> (i64, i64, i64, i64) {
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::getrusage(libc::RUSAGE_SELF, &mut usage) };
    if rc != 0 {
        return (0, 0, 0, 0);
    }
    (
        usage.ru_utime.tv_sec,
        usage.ru_utime.tv_usec,
        usage.ru_stime.tv_sec,
        usage.ru_stime.tv_usec,
    )
}

/// Emits the selected category as `STAT` lines; the caller appends `END`.
pub fn text_stats(r: &mut TextResponder<'_>, category: StatsCategory, shared: &Shared) {
    let mut emit = |name: &str, value: String| r.stat(name, value);
    match category {
        StatsCategory::Settings => each_setting(shared, &mut emit),
        StatsCategory::Items => each_item_stat(shared, &mut emit),
        StatsCategory::Sizes => each_size_stat(shared, &mut emit),
        StatsCategory::Ops => each_op_stat(shared, &mut emit),
        StatsCategory::General => each_general_stat(shared, &mut emit),
    }
}

/// Emits the selected category as binary stat records plus the empty
/// terminator.
pub fn binary_stats(r: &mut BinaryResponder<'_>, category: StatsCategory, shared: &Shared) {
    let mut emit = |name: &str, value: String| r.stat(name.as_bytes(), value.as_bytes());
    match category {
        StatsCategory::Settings => each_setting(shared, &mut emit),
        StatsCategory::Items => each_item_stat(shared, &mut emit),
        StatsCategory::Sizes => each_size_stat(shared, &mut emit),
        StatsCategory::Ops => each_op_stat(shared, &mut emit),
        StatsCategory::General => each_general_stat(shared, &mut emit),
    }
    r.success();
}

fn each_setting(shared: &Shared, emit: &mut dyn FnMut(&str, String)) {
    let config = &shared.config;
    emit("maxbytes", config.memory_limit.0.to_string());
    emit("tcpport", config.port.to_string());
    emit("replport", config.repl_port.to_string());
    emit("virtual_ip", config.virtual_ip.to_string());
    emit("evictions", "on".to_owned());
    emit("cas_enabled", "on".to_owned());
    emit("locking", "on".to_owned());
    emit("tmp_dir", config.temp_dir.display().to_string());
    emit("buckets", config.buckets.to_string());
    emit("item_size_max", config.max_data_size.0.to_string());
    emit("num_threads", config.workers.to_string());
    emit("gc_interval", config.gc_interval.to_string());
}

fn each_item_stat(shared: &Shared, emit: &mut dyn FnMut(&str, String)) {
    let stats = &shared.stats;
    emit("items:1:number", stats.objects.load(RELAXED).to_string());
    emit("items:1:age", stats.oldest_age.load(RELAXED).to_string());
    emit(
        "items:1:evicted",
        stats.total_evictions.load(RELAXED).to_string(),
    );
    emit(
        "items:1:conflicts",
        stats.conflicts.load(RELAXED).to_string(),
    );
    emit(
        "items:1:largest",
        stats.largest_object_size.load(RELAXED).to_string(),
    );
}

fn each_size_stat(shared: &Shared, emit: &mut dyn FnMut(&str, String)) {
    let stats = &shared.stats;
    emit("1024", stats.objects_under_1k.load(RELAXED).to_string());
    emit("4096", stats.objects_under_4k.load(RELAXED).to_string());
    emit("16384", stats.objects_under_16k.load(RELAXED).to_string());
    emit("65536", stats.objects_under_64k.load(RELAXED).to_string());
    emit("262144", stats.objects_under_256k.load(RELAXED).to_string());
    emit("1048576", stats.objects_under_1m.load(RELAXED).to_string());
    emit("4194304", stats.objects_under_4m.load(RELAXED).to_string());
    emit("huge", stats.objects_huge.load(RELAXED).to_string());
}

fn each_op_stat(shared: &Shared, emit: &mut dyn FnMut(&str, String)) {
    let stats = &shared.stats;
    for index in 1..TextCommand::COUNT {
        let command = TEXT_COMMANDS[index];
        let count = stats.text_ops[index].load(RELAXED);
        emit(&format!("text:{}", command.name()), count.to_string());
    }
    for command in BinaryCommand::ALL {
        let count = stats.bin_ops[command.opcode() as usize].load(RELAXED);
        emit(&format!("binary:{}", command.name()), count.to_string());
    }
}

// TextCommand in declaration (= reporting) order, skipping Unknown.
const TEXT_COMMANDS: [TextCommand; TextCommand::COUNT] = [
    TextCommand::Unknown,
    TextCommand::Set,
    TextCommand::Add,
    TextCommand::Replace,
    TextCommand::Append,
    TextCommand::Prepend,
    TextCommand::Cas,
    TextCommand::Get,
    TextCommand::Gets,
    TextCommand::Delete,
    TextCommand::Incr,
    TextCommand::Decr,
    TextCommand::Touch,
    TextCommand::Lock,
    TextCommand::Unlock,
    TextCommand::UnlockAll,
    TextCommand::Slabs,
    TextCommand::Stats,
    TextCommand::FlushAll,
    TextCommand::Version,
    TextCommand::Verbosity,
    TextCommand::Quit,
];

fn each_general_stat(shared: &Shared, emit: &mut dyn FnMut(&str, String)) {
    let stats = &shared.stats;
    let (user_sec, user_usec, sys_sec, sys_usec) = rusage();

    emit("pid", std::process::id().to_string());
    emit("time", shared.now().to_string());
    emit("version", VERSION.to_owned());
    emit(
        "pointer_size",
        (std::mem::size_of::<usize>() * 8).to_string(),
    );
    emit("rusage_user", format!("{user_sec}:{user_usec}"));
    emit("rusage_system", format!("{sys_sec}:{sys_usec}"));
    emit(
        "curr_connections",
        stats.curr_connections.load(RELAXED).to_string(),
    );
    emit(
        "total_connections",
        stats.total_connections.load(RELAXED).to_string(),
    );
    emit("curr_items", stats.objects.load(RELAXED).to_string());
    emit("total_items", stats.total_objects.load(RELAXED).to_string());
    emit("bytes", stats.used_memory.load(RELAXED).to_string());
    emit("limit_maxbytes", shared.config.memory_limit.0.to_string());
    emit("threads", shared.config.workers.to_string());
    emit("get_hits", stats.get_hits.load(RELAXED).to_string());
    emit("get_misses", stats.get_misses.load(RELAXED).to_string());
    emit("cas_hits", stats.cas_hits.load(RELAXED).to_string());
    emit("cas_misses", stats.cas_misses.load(RELAXED).to_string());
    emit("cas_badval", stats.cas_badval.load(RELAXED).to_string());
    emit("gc_count", stats.gc_count.load(RELAXED).to_string());
    emit("slaves", shared.repl.count().to_string());
    emit(
        "last_expirations",
        stats.last_expirations.load(RELAXED).to_string(),
    );
    emit(
        "last_evictions",
        stats.last_evictions.load(RELAXED).to_string(),
    );
    emit("evictions", stats.total_evictions.load(RELAXED).to_string());
    emit(
        "last_gc_elapsed",
        stats.last_gc_elapsed.load(RELAXED).to_string(),
    );
    emit(
        "total_gc_elapsed",
        stats.total_gc_elapsed.load(RELAXED).to_string(),
    );
}
