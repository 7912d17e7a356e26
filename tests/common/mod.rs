//! Helpers shared by the end-to-end tests: an in-process server on an
//! ephemeral port and a handful of raw socket utilities.

// not every test binary uses every helper.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use hoardd::config::Config;
use hoardd::logging::LogControl;
use hoardd::server;
use hoardd::shared::Shared;

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.temp_dir = std::env::temp_dir();
    config.buckets = 1024;
    config.counter.buckets = 64;
    config
}

pub fn test_shared() -> Arc<Shared> {
    Shared::new(test_config(), LogControl::default())
}

pub async fn start_memcache(shared: Arc<Shared>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(server::serve_memcache_listener(shared, listener));
    addr
}

pub async fn start_counter(shared: Arc<Shared>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(server::serve_counter_listener(shared, listener));
    addr
}

pub async fn start_repl(shared: Arc<Shared>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(server::serve_repl_listener(shared, listener));
    addr
}

pub async fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).await.unwrap();
    stream.set_nodelay(true).unwrap();
    stream
}

/// Sends `request` and asserts the next `expected.len()` bytes match.
pub async fn roundtrip(stream: &mut TcpStream, request: &[u8], expected: &[u8]) {
    stream.write_all(request).await.unwrap();
    expect(stream, expected).await;
}

/// Reads exactly `expected.len()` bytes and asserts equality.
pub async fn expect(stream: &mut TcpStream, expected: &[u8]) {
    let mut got = vec![0u8; expected.len()];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut got))
        .await
        .expect("timed out waiting for a response")
        .unwrap();
    assert_eq!(
        got,
        expected,
        "got {:?}, expected {:?}",
        String::from_utf8_lossy(&got),
        String::from_utf8_lossy(expected)
    );
}

/// Reads exactly `n` bytes.
pub async fn read_n(stream: &mut TcpStream, n: usize) -> Vec<u8> {
    let mut got = vec![0u8; n];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut got))
        .await
        .expect("timed out waiting for a response")
        .unwrap();
    got
}
