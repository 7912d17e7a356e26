//! Memcache command handling: per-connection state, the per-command
//! dispatcher, the stats emitters, and the client connection task.

mod connection;
mod exec;
mod stats_io;

pub use connection::serve_client;
pub use exec::{execute_binary, execute_text, ExecError, Flow};

use bytes::Bytes;
use hoardd_store::{ConnectionId, HashKey};

use crate::shared::Shared;

/// Per-connection state: the lock list and the identity used as the
/// object lock owner.
pub struct Connection {
    pub id: ConnectionId,
    /// Keys currently locked by this connection. Touched only by the
    /// connection's own task.
    locks: Vec<Bytes>,
}

impl Connection {
    pub fn new(id: ConnectionId) -> Self {
        Self {
            id,
            locks: Vec::new(),
        }
    }

    pub fn add_lock(&mut self, key: &HashKey) {
        self.locks.push(key.bytes().clone());
    }

    pub fn remove_lock(&mut self, key: &[u8]) {
        match self.locks.iter().position(|k| k[..] == *key) {
            Some(index) => {
                self.locks.swap_remove(index);
            }
            None => debug_assert!(false, "remove_lock: key not in the lock list"),
        }
    }

    /// Best-effort release of every lock held by this connection.
    pub fn unlock_all(&mut self, shared: &Shared) {
        let id = self.id;
        for key in self.locks.drain(..) {
            shared.cache.apply(
                &key,
                |_, obj| {
                    if obj.locked_by(id) {
                        obj.unlock();
                    }
                    true
                },
                exec::NO_CREATE,
            );
        }
    }
}
