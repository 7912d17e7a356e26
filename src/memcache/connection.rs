//! The memcache client connection task.
//!
//! One task owns each connection: frames are decoded and executed strictly
//! in arrival order and responses are written back by the same task, which
//! is what makes per-connection ordering and the atomic-send contract hold.

use std::sync::Arc;

use bytes::BytesMut;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::codec::FramedRead;
use tracing::{debug, warn};

use hoardd_wire::memcache::{MemcacheDecoder, Request};
use hoardd_wire::FrameError;

use crate::shared::Shared;
use crate::stats::RELAXED;
use crate::SCRATCH_BUFSIZE;

use super::{execute_binary, execute_text, Connection, Flow};

fn configure_socket(stream: &TcpStream) {
    let _ = stream.set_nodelay(true);
    let sock = socket2::SockRef::from(stream);
    let _ = sock.set_keepalive(true);
}

/// Serves one client connection until it quits, errors, or disconnects.
pub async fn serve_client(shared: Arc<Shared>, stream: TcpStream) {
    // a replica accepts no client traffic.
    if shared.slave_mode() {
        return;
    }
    let max = shared.config.max_connections;
    if max != 0 && shared.stats.curr_connections.load(RELAXED) >= u64::from(max) {
        return;
    }
    shared.stats.curr_connections.fetch_add(1, RELAXED);
    shared.stats.total_connections.fetch_add(1, RELAXED);

    configure_socket(&stream);
    let (read, mut write) = stream.into_split();
    let mut framed = FramedRead::new(read, MemcacheDecoder::new(shared.clock.clone()));
    let mut conn = Connection::new(shared.next_connection_id());
    let mut out = BytesMut::new();

    'serve: while let Some(next) = framed.next().await {
        let request = match next {
            Ok(request) => request,
            Err(FrameError::RequestTooLarge { limit }) => {
                warn!(limit, "denied a too large request");
                break;
            }
            Err(FrameError::Io { source }) => {
                debug!(error = %source, "client read failed");
                break;
            }
        };

        let flow = match &request {
            Request::Text(req) => execute_text(&shared, &mut conn, req, &mut out),
            Request::Binary(req) => execute_binary(&shared, &mut conn, req, &mut out),
        };

        let flow = match flow {
            Ok(flow) => flow,
            Err(error) => {
                warn!(%error, "closing the connection");
                break;
            }
        };

        if !out.is_empty() {
            if write.write_all(&out).await.is_err() {
                break 'serve;
            }
            out.clear();
        }
        // an oversized scratch buffer shrinks back after the command.
        if out.capacity() > SCRATCH_BUFSIZE {
            out = BytesMut::new();
        }

        if flow == Flow::Close {
            let _ = write.shutdown().await;
            break;
        }
    }

    conn.unlock_all(&shared);
    shared.stats.curr_connections.fetch_sub(1, RELAXED);
}
