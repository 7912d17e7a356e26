//! Per-command execution against the bucket map.
//!
//! Each command becomes a closure run under the key's bucket lock; the
//! closure writes the response into the connection's output buffer and, for
//! successful mutations, fans the new object state out to the replicas.

use std::cell::{Cell, RefCell};
use std::io;

use bytes::BytesMut;
use snafu::Snafu;

use hoardd_store::{CacheObject, HashKey};
use hoardd_wire::memcache::{
    BinaryCommand, BinaryRequest, BinaryResponder, BinaryStatus, TextCommand, TextRequest,
    TextResponder,
};
use hoardd_wire::{EXPTIME_NONE, MAX_KEY_LENGTH};

use super::{stats_io, Connection};
use crate::replication::{repl_delete, repl_object};
use crate::shared::Shared;
use crate::stats::RELAXED;
use crate::VERSION;

/// Creator placeholder for lookup-only map calls.
pub(crate) const NO_CREATE: Option<fn(&HashKey) -> Option<CacheObject>> = None;

/// A store-side failure (spill I/O); the connection is closed after
/// logging it.
#[derive(Debug, Snafu)]
#[snafu(display("object store operation failed: {source}"))]
pub struct ExecError {
    pub source: io::Error,
}

/// What the connection should do after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// Flush the output buffer, then close.
    Close,
}

fn finish(failure: Cell<Option<io::Error>>, flow: Flow) -> Result<Flow, ExecError> {
    match failure.into_inner() {
        Some(source) => Err(ExecError { source }),
        None => Ok(flow),
    }
}

/// Executes one text request, appending responses to `out`.
pub fn execute_text(
    shared: &Shared,
    conn: &mut Connection,
    req: &TextRequest,
    out: &mut BytesMut,
) -> Result<Flow, ExecError> {
    shared.stats.count_text_op(req.command);

    let r = RefCell::new(TextResponder::new(out));
    if !req.valid {
        r.borrow_mut().error();
        return Ok(Flow::Continue);
    }

    let failure = Cell::new(None::<io::Error>);
    let now = shared.now();
    let flush_at = shared.stats.flush_time.load(RELAXED);
    let conn_id = conn.id;

    match req.command {
        TextCommand::Set | TextCommand::Add | TextCommand::Replace => {
            let key = req.key();
            if key.len() > MAX_KEY_LENGTH || req.data.len() > shared.config.max_data_size.0 {
                r.borrow_mut().error();
                return finish(failure, Flow::Continue);
            }
            let slaves = shared.repl.active();
            let command = req.command;
            let found = shared.cache.apply(
                key,
                |k, obj| {
                    if obj.locked_by_other(conn_id) {
                        if !req.no_reply {
                            r.borrow_mut().locked();
                        }
                        return true;
                    }
                    if obj.expired(now, flush_at) {
                        if command == TextCommand::Replace {
                            return false;
                        }
                    } else if command == TextCommand::Add {
                        return false;
                    }
                    match obj.set(&req.data, req.flags, req.exptime, &shared.spill) {
                        Ok(()) => {
                            if !req.no_reply {
                                r.borrow_mut().stored();
                            }
                            if let Err(e) = repl_object(&slaves, k, obj) {
                                failure.set(Some(e));
                            }
                        }
                        Err(e) => failure.set(Some(e)),
                    }
                    true
                },
                if command == TextCommand::Replace {
                    None
                } else {
                    Some(|k: &HashKey| {
                        match CacheObject::new(&req.data, req.flags, req.exptime, &shared.spill) {
                            Ok(mut o) => {
                                shared.stats.total_objects.fetch_add(1, RELAXED);
                                if !req.no_reply {
                                    r.borrow_mut().stored();
                                }
                                if let Err(e) = repl_object(&slaves, k, &mut o) {
                                    failure.set(Some(e));
                                }
                                Some(o)
                            }
                            Err(e) => {
                                failure.set(Some(e));
                                None
                            }
                        }
                    })
                },
            );
            if !found && !req.no_reply {
                r.borrow_mut().not_stored();
            }
        }
        TextCommand::Append | TextCommand::Prepend => {
            let slaves = shared.repl.active();
            let prepending = req.command == TextCommand::Prepend;
            let found = shared.cache.apply(
                req.key(),
                |k, obj| {
                    if obj.locked_by_other(conn_id) {
                        if !req.no_reply {
                            r.borrow_mut().locked();
                        }
                        return true;
                    }
                    if obj.expired(now, flush_at) {
                        return false;
                    }
                    let result = if prepending {
                        obj.prepend(&req.data, &shared.spill)
                    } else {
                        obj.append(&req.data, &shared.spill)
                    };
                    match result {
                        Ok(()) => {
                            if !req.no_reply {
                                r.borrow_mut().stored();
                            }
                            if let Err(e) = repl_object(&slaves, k, obj) {
                                failure.set(Some(e));
                            }
                        }
                        Err(e) => failure.set(Some(e)),
                    }
                    true
                },
                NO_CREATE,
            );
            if !found && !req.no_reply {
                r.borrow_mut().not_stored();
            }
        }
        TextCommand::Cas => {
            let slaves = shared.repl.active();
            let found = shared.cache.apply(
                req.key(),
                |k, obj| {
                    if obj.locked_by_other(conn_id) {
                        if !req.no_reply {
                            r.borrow_mut().locked();
                        }
                        return true;
                    }
                    if obj.expired(now, flush_at) {
                        return false;
                    }
                    if obj.cas() != req.cas_unique {
                        shared.stats.cas_badval.fetch_add(1, RELAXED);
                        if !req.no_reply {
                            r.borrow_mut().exists();
                        }
                        return true;
                    }
                    match obj.set(&req.data, req.flags, req.exptime, &shared.spill) {
                        Ok(()) => {
                            shared.stats.cas_hits.fetch_add(1, RELAXED);
                            if !req.no_reply {
                                r.borrow_mut().stored();
                            }
                            if let Err(e) = repl_object(&slaves, k, obj) {
                                failure.set(Some(e));
                            }
                        }
                        Err(e) => failure.set(Some(e)),
                    }
                    true
                },
                NO_CREATE,
            );
            if !found {
                shared.stats.cas_misses.fetch_add(1, RELAXED);
                if !req.no_reply {
                    r.borrow_mut().not_found();
                }
            }
        }
        TextCommand::Incr | TextCommand::Decr => {
            let slaves = shared.repl.active();
            let decrementing = req.command == TextCommand::Decr;
            let found = shared.cache.apply(
                req.key(),
                |k, obj| {
                    if obj.locked_by_other(conn_id) {
                        if !req.no_reply {
                            r.borrow_mut().locked();
                        }
                        return true;
                    }
                    if obj.expired(now, flush_at) {
                        return false;
                    }
                    let result = if decrementing {
                        obj.decr(req.value)
                    } else {
                        obj.incr(req.value)
                    };
                    match result {
                        Ok(n) => {
                            if !req.no_reply {
                                r.borrow_mut().number(n);
                            }
                            if let Err(e) = repl_object(&slaves, k, obj) {
                                failure.set(Some(e));
                            }
                        }
                        Err(_) => {
                            if !req.no_reply {
                                r.borrow_mut().non_numeric();
                            }
                        }
                    }
                    true
                },
                NO_CREATE,
            );
            if !found && !req.no_reply {
                r.borrow_mut().not_found();
            }
        }
        TextCommand::Touch => {
            let slaves = shared.repl.active();
            let found = shared.cache.apply(
                req.key(),
                |k, obj| {
                    if obj.expired(now, flush_at) {
                        return false;
                    }
                    obj.touch(req.exptime);
                    if let Err(e) = repl_object(&slaves, k, obj) {
                        failure.set(Some(e));
                    }
                    true
                },
                NO_CREATE,
            );
            if !req.no_reply {
                if found {
                    r.borrow_mut().touched();
                } else {
                    r.borrow_mut().not_found();
                }
            }
        }
        TextCommand::Delete => {
            let slaves = shared.repl.active();
            let found = shared.cache.remove_if(req.key(), |k, obj| {
                if obj.locked_by_other(conn_id) {
                    if !req.no_reply {
                        r.borrow_mut().locked();
                    }
                    return false;
                }
                if obj.locked_by(conn_id) {
                    conn.remove_lock(k.as_bytes());
                }
                if !req.no_reply {
                    r.borrow_mut().deleted();
                }
                repl_delete(&slaves, k);
                true
            });
            if !found && !req.no_reply {
                r.borrow_mut().not_found();
            }
        }
        TextCommand::Lock => {
            let found = shared.cache.apply(
                req.key(),
                |k, obj| {
                    if obj.expired(now, flush_at) {
                        return false;
                    }
                    if obj.locked() {
                        r.borrow_mut().locked();
                        return true;
                    }
                    obj.lock(conn_id);
                    conn.add_lock(k);
                    r.borrow_mut().ok();
                    true
                },
                NO_CREATE,
            );
            if !found {
                r.borrow_mut().not_found();
            }
        }
        TextCommand::Unlock => {
            let found = shared.cache.apply(
                req.key(),
                |k, obj| {
                    if !obj.locked_by(conn_id) {
                        return false;
                    }
                    obj.unlock();
                    conn.remove_lock(k.as_bytes());
                    r.borrow_mut().ok();
                    true
                },
                NO_CREATE,
            );
            if !found {
                r.borrow_mut().not_locked();
            }
        }
        TextCommand::UnlockAll => {
            conn.unlock_all(shared);
            r.borrow_mut().ok();
        }
        TextCommand::Get | TextCommand::Gets => {
            let with_cas = req.command == TextCommand::Gets;
            let mut scratch = BytesMut::new();
            for key in &req.keys {
                let hit = shared.cache.apply(
                    key,
                    |k, obj| {
                        if obj.expired(now, flush_at) {
                            return false;
                        }
                        scratch.clear();
                        if let Err(e) = obj.read_into(&mut scratch) {
                            failure.set(Some(e));
                            return true;
                        }
                        let cas = with_cas.then(|| obj.cas());
                        r.borrow_mut().value(k.as_bytes(), obj.flags(), &scratch, cas);
                        true
                    },
                    NO_CREATE,
                );
                let counter = if hit {
                    &shared.stats.get_hits
                } else {
                    &shared.stats.get_misses
                };
                counter.fetch_add(1, RELAXED);
            }
            r.borrow_mut().end();
        }
        TextCommand::Slabs => {
            r.borrow_mut().ok();
        }
        TextCommand::Stats => {
            stats_io::text_stats(&mut r.borrow_mut(), req.stats, shared);
            r.borrow_mut().end();
        }
        TextCommand::FlushAll => {
            shared.stats.flush_time.store(req.exptime, RELAXED);
            if !req.no_reply {
                r.borrow_mut().ok();
            }
        }
        TextCommand::Version => {
            r.borrow_mut().version(VERSION);
        }
        TextCommand::Verbosity => {
            if let Some(verbosity) = req.verbosity {
                shared.log.set_verbosity(verbosity);
            }
            if !req.no_reply {
                r.borrow_mut().ok();
            }
        }
        TextCommand::Quit => {
            conn.unlock_all(shared);
            return finish(failure, Flow::Close);
        }
        TextCommand::Unknown => {
            r.borrow_mut().error();
        }
    }

    finish(failure, Flow::Continue)
}

/// Executes one binary request, appending responses to `out`.
pub fn execute_binary(
    shared: &Shared,
    conn: &mut Connection,
    req: &BinaryRequest,
    out: &mut BytesMut,
) -> Result<Flow, ExecError> {
    shared.stats.count_bin_op(req.opcode);

    let r = RefCell::new(BinaryResponder::new(out, req));
    if req.status != BinaryStatus::Ok {
        r.borrow_mut().error(req.status);
        return Ok(Flow::Continue);
    }
    let Some(command) = req.command else {
        r.borrow_mut().error(BinaryStatus::UnknownCommand);
        return Ok(Flow::Continue);
    };

    let failure = Cell::new(None::<io::Error>);
    let now = shared.now();
    let flush_at = shared.stats.flush_time.load(RELAXED);
    let conn_id = conn.id;

    use BinaryCommand::*;
    match command {
        Get | GetQ | GetK | GetKQ | GaT | GaTQ | GaTK | GaTKQ | LaG | LaGQ | LaGK | LaGKQ => {
            let locking = LaG <= command && command <= LaGKQ;
            let with_key = matches!(command, GetK | GetKQ | GaTK | GaTKQ | LaGK | LaGKQ);
            let found = shared.cache.apply(
                &req.key,
                |k, obj| {
                    if locking {
                        if obj.locked() {
                            r.borrow_mut().error(BinaryStatus::Locked);
                            return true;
                        }
                        obj.lock(conn_id);
                        conn.add_lock(k);
                    }
                    if obj.expired(now, flush_at) {
                        return false;
                    }
                    if req.exptime != EXPTIME_NONE {
                        obj.touch(req.exptime);
                    }
                    let mut scratch = BytesMut::new();
                    if let Err(e) = obj.read_into(&mut scratch) {
                        failure.set(Some(e));
                        return true;
                    }
                    let key = with_key.then(|| k.as_bytes());
                    r.borrow_mut().get(obj.flags(), &scratch, obj.cas(), key);
                    true
                },
                NO_CREATE,
            );
            let counter = if found {
                &shared.stats.get_hits
            } else {
                &shared.stats.get_misses
            };
            counter.fetch_add(1, RELAXED);
            if !found && (!req.quiet || command == LaGQ) {
                r.borrow_mut().error(BinaryStatus::NotFound);
            }
        }
        Set | SetQ | Add | AddQ | Replace | ReplaceQ => {
            if req.key.len() > MAX_KEY_LENGTH {
                r.borrow_mut().error(BinaryStatus::Invalid);
                return finish(failure, Flow::Continue);
            }
            if req.data.len() > shared.config.max_data_size.0 {
                r.borrow_mut().error(BinaryStatus::TooLargeValue);
                return finish(failure, Flow::Continue);
            }
            let slaves = shared.repl.active();
            let replacing = matches!(command, Replace | ReplaceQ);
            let adding = matches!(command, Add | AddQ);
            let found = shared.cache.apply(
                &req.key,
                |k, obj| {
                    if obj.locked_by_other(conn_id) {
                        r.borrow_mut().error(BinaryStatus::Locked);
                        return true;
                    }
                    if obj.expired(now, flush_at) {
                        if req.cas_unique != 0 || replacing {
                            return false;
                        }
                    } else if adding {
                        return false;
                    }
                    if req.cas_unique != 0 && req.cas_unique != obj.cas() {
                        shared.stats.cas_badval.fetch_add(1, RELAXED);
                        r.borrow_mut().error(BinaryStatus::Exists);
                        return true;
                    }
                    match obj.set(&req.data, req.flags, req.exptime, &shared.spill) {
                        Ok(()) => {
                            if req.cas_unique != 0 {
                                shared.stats.cas_hits.fetch_add(1, RELAXED);
                            }
                            if !req.quiet {
                                r.borrow_mut().set(obj.cas());
                            }
                            if let Err(e) = repl_object(&slaves, k, obj) {
                                failure.set(Some(e));
                            }
                        }
                        Err(e) => failure.set(Some(e)),
                    }
                    true
                },
                if !replacing && req.cas_unique == 0 {
                    Some(|k: &HashKey| {
                        match CacheObject::new(&req.data, req.flags, req.exptime, &shared.spill) {
                            Ok(mut o) => {
                                shared.stats.total_objects.fetch_add(1, RELAXED);
                                if !req.quiet {
                                    r.borrow_mut().set(o.cas());
                                }
                                if let Err(e) = repl_object(&slaves, k, &mut o) {
                                    failure.set(Some(e));
                                }
                                Some(o)
                            }
                            Err(e) => {
                                failure.set(Some(e));
                                None
                            }
                        }
                    })
                } else {
                    None
                },
            );
            if !found {
                if req.cas_unique != 0 {
                    shared.stats.cas_misses.fetch_add(1, RELAXED);
                    r.borrow_mut().error(BinaryStatus::NotFound);
                } else {
                    r.borrow_mut().error(BinaryStatus::NotStored);
                }
            }
        }
        RaU | RaUQ => {
            if req.key.len() > MAX_KEY_LENGTH {
                r.borrow_mut().error(BinaryStatus::Invalid);
                return finish(failure, Flow::Continue);
            }
            if req.data.len() > shared.config.max_data_size.0 {
                r.borrow_mut().error(BinaryStatus::TooLargeValue);
                return finish(failure, Flow::Continue);
            }
            let slaves = shared.repl.active();
            let found = shared.cache.apply(
                &req.key,
                |k, obj| {
                    if !obj.locked_by(conn_id) {
                        r.borrow_mut().error(BinaryStatus::NotLocked);
                        return true;
                    }
                    if req.cas_unique != 0 && req.cas_unique != obj.cas() {
                        r.borrow_mut().error(BinaryStatus::Exists);
                        return true;
                    }
                    match obj.set(&req.data, req.flags, req.exptime, &shared.spill) {
                        Ok(()) => {
                            obj.unlock();
                            conn.remove_lock(k.as_bytes());
                            if !req.quiet {
                                r.borrow_mut().set(obj.cas());
                            }
                            if let Err(e) = repl_object(&slaves, k, obj) {
                                failure.set(Some(e));
                            }
                        }
                        Err(e) => failure.set(Some(e)),
                    }
                    true
                },
                NO_CREATE,
            );
            if !found {
                if req.cas_unique != 0 {
                    r.borrow_mut().error(BinaryStatus::NotFound);
                } else {
                    r.borrow_mut().error(BinaryStatus::NotStored);
                }
            }
        }
        Append | AppendQ | Prepend | PrependQ => {
            let slaves = shared.repl.active();
            let prepending = matches!(command, Prepend | PrependQ);
            let found = shared.cache.apply(
                &req.key,
                |k, obj| {
                    if obj.locked_by_other(conn_id) {
                        r.borrow_mut().error(BinaryStatus::Locked);
                        return true;
                    }
                    if obj.expired(now, flush_at) {
                        return false;
                    }
                    let result = if prepending {
                        obj.prepend(&req.data, &shared.spill)
                    } else {
                        obj.append(&req.data, &shared.spill)
                    };
                    match result {
                        Ok(()) => {
                            if !req.quiet {
                                r.borrow_mut().success();
                            }
                            if let Err(e) = repl_object(&slaves, k, obj) {
                                failure.set(Some(e));
                            }
                        }
                        Err(e) => failure.set(Some(e)),
                    }
                    true
                },
                NO_CREATE,
            );
            if !found {
                r.borrow_mut().error(BinaryStatus::NotFound);
            }
        }
        Delete | DeleteQ => {
            let slaves = shared.repl.active();
            let found = shared.cache.remove_if(&req.key, |k, obj| {
                if obj.locked_by_other(conn_id) {
                    r.borrow_mut().error(BinaryStatus::Locked);
                    return false;
                }
                if obj.locked_by(conn_id) {
                    conn.remove_lock(k.as_bytes());
                }
                if !req.quiet {
                    r.borrow_mut().success();
                }
                repl_delete(&slaves, k);
                true
            });
            if !found && !req.quiet {
                r.borrow_mut().error(BinaryStatus::NotFound);
            }
        }
        Increment | IncrementQ | Decrement | DecrementQ => {
            let slaves = shared.repl.active();
            let decrementing = matches!(command, Decrement | DecrementQ);
            let found = shared.cache.apply(
                &req.key,
                |k, obj| {
                    if obj.locked_by_other(conn_id) {
                        r.borrow_mut().error(BinaryStatus::Locked);
                        return true;
                    }
                    if obj.expired(now, flush_at) {
                        return false;
                    }
                    let result = if decrementing {
                        obj.decr(req.value)
                    } else {
                        obj.incr(req.value)
                    };
                    match result {
                        Ok(n) => {
                            if !req.quiet {
                                r.borrow_mut().incdec(n, obj.cas());
                            }
                            if let Err(e) = repl_object(&slaves, k, obj) {
                                failure.set(Some(e));
                            }
                        }
                        Err(_) => {
                            r.borrow_mut().error(BinaryStatus::NonNumeric);
                        }
                    }
                    true
                },
                if req.exptime != EXPTIME_NONE {
                    Some(|k: &HashKey| {
                        let mut o = CacheObject::new_numeric(req.initial, req.exptime);
                        shared.stats.total_objects.fetch_add(1, RELAXED);
                        if !req.quiet {
                            r.borrow_mut().incdec(req.initial, o.cas());
                        }
                        if let Err(e) = repl_object(&slaves, k, &mut o) {
                            failure.set(Some(e));
                        }
                        Some(o)
                    })
                } else {
                    None
                },
            );
            if !found {
                r.borrow_mut().error(BinaryStatus::NotFound);
            }
        }
        Touch => {
            let slaves = shared.repl.active();
            let found = shared.cache.apply(
                &req.key,
                |k, obj| {
                    if obj.expired(now, flush_at) {
                        return false;
                    }
                    obj.touch(req.exptime);
                    if let Err(e) = repl_object(&slaves, k, obj) {
                        failure.set(Some(e));
                    }
                    true
                },
                NO_CREATE,
            );
            if found {
                r.borrow_mut().success();
            } else {
                r.borrow_mut().error(BinaryStatus::NotFound);
            }
        }
        Lock | LockQ => {
            let found = shared.cache.apply(
                &req.key,
                |k, obj| {
                    if obj.expired(now, flush_at) {
                        return false;
                    }
                    if obj.locked() {
                        r.borrow_mut().error(BinaryStatus::Locked);
                        return true;
                    }
                    obj.lock(conn_id);
                    conn.add_lock(k);
                    if !req.quiet {
                        r.borrow_mut().success();
                    }
                    true
                },
                NO_CREATE,
            );
            if !found {
                r.borrow_mut().error(BinaryStatus::NotFound);
            }
        }
        Unlock | UnlockQ => {
            let found = shared.cache.apply(
                &req.key,
                |k, obj| {
                    if !obj.locked_by(conn_id) {
                        r.borrow_mut().error(BinaryStatus::NotLocked);
                        return true;
                    }
                    obj.unlock();
                    conn.remove_lock(k.as_bytes());
                    if !req.quiet {
                        r.borrow_mut().success();
                    }
                    true
                },
                NO_CREATE,
            );
            if !found {
                r.borrow_mut().error(BinaryStatus::NotFound);
            }
        }
        UnlockAll | UnlockAllQ => {
            conn.unlock_all(shared);
            if !req.quiet {
                r.borrow_mut().success();
            }
        }
        Quit | QuitQ => {
            conn.unlock_all(shared);
            if !req.quiet {
                r.borrow_mut().success();
            }
            return finish(failure, Flow::Close);
        }
        Flush | FlushQ => {
            shared.stats.flush_time.store(req.exptime, RELAXED);
            if !req.quiet {
                r.borrow_mut().success();
            }
        }
        Noop => {
            r.borrow_mut().success();
        }
        Version => {
            r.borrow_mut().version(VERSION);
        }
        Stat => {
            stats_io::binary_stats(&mut r.borrow_mut(), req.stats, shared);
        }
    }

    finish(failure, Flow::Continue)
}
