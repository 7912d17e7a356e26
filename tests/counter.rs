//! End-to-end counter service scenarios.

mod common;

use std::time::Duration;

use common::*;

fn be_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([buf[at], buf[at + 1]])
}

fn be_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn header(opcode: u8, body_len: u32) -> Vec<u8> {
    let mut out = Vec::new();
    out.push(0x90);
    out.push(opcode);
    out.push(0);
    out.push(0);
    out.extend_from_slice(&body_len.to_be_bytes());
    out.extend_from_slice(&[9, 9, 9, 9]); // opaque
    out
}

fn acquire(name: &[u8], resources: u32, maximum: u32) -> Vec<u8> {
    let mut out = header(0x02, (10 + name.len()) as u32);
    out.extend_from_slice(&resources.to_be_bytes());
    out.extend_from_slice(&maximum.to_be_bytes());
    out.extend_from_slice(&(name.len() as u16).to_be_bytes());
    out.extend_from_slice(name);
    out
}

fn release(name: &[u8], resources: u32) -> Vec<u8> {
    let mut out = header(0x03, (6 + name.len()) as u32);
    out.extend_from_slice(&resources.to_be_bytes());
    out.extend_from_slice(&(name.len() as u16).to_be_bytes());
    out.extend_from_slice(name);
    out
}

fn get(name: &[u8]) -> Vec<u8> {
    let mut out = header(0x01, (2 + name.len()) as u32);
    out.extend_from_slice(&(name.len() as u16).to_be_bytes());
    out.extend_from_slice(name);
    out
}

/// (status, body)
async fn read_response(stream: &mut tokio::net::TcpStream) -> (u8, Vec<u8>) {
    let head = read_n(stream, 12).await;
    assert_eq!(head[0], 0x91);
    assert_eq!(&head[8..12], &[9, 9, 9, 9]);
    let body_len = be_u32(&head, 4) as usize;
    let body = if body_len > 0 {
        read_n(stream, body_len).await
    } else {
        Vec::new()
    };
    (head[2], body)
}

async fn send(stream: &mut tokio::net::TcpStream, bytes: &[u8]) {
    tokio::io::AsyncWriteExt::write_all(stream, bytes).await.unwrap();
}

#[tokio::test]
async fn acquire_until_exhausted_then_release() {
    let shared = test_shared();
    let addr = start_counter(shared).await;
    let mut client = connect(addr).await;

    send(&mut client, &acquire(b"sem", 3, 5)).await;
    let (status, body) = read_response(&mut client).await;
    assert_eq!(status, 0x00);
    assert_eq!(be_u32(&body, 0), 3);

    // 3 + 3 > 5
    send(&mut client, &acquire(b"sem", 3, 5)).await;
    let (status, body) = read_response(&mut client).await;
    assert_eq!(status, 0x21);
    assert_eq!(body, b"Resource not available");

    send(&mut client, &release(b"sem", 2)).await;
    let (status, _) = read_response(&mut client).await;
    assert_eq!(status, 0x00);

    send(&mut client, &get(b"sem")).await;
    let (status, body) = read_response(&mut client).await;
    assert_eq!(status, 0x00);
    assert_eq!(be_u32(&body, 0), 1);
}

#[tokio::test]
async fn disconnect_releases_acquired_resources() {
    let shared = test_shared();
    let addr = start_counter(shared.clone()).await;

    let mut holder = connect(addr).await;
    send(&mut holder, &acquire(b"sem", 3, 5)).await;
    let (status, _) = read_response(&mut holder).await;
    assert_eq!(status, 0x00);
    drop(holder);

    // teardown releases asynchronously; poll a fresh connection.
    let mut other = connect(addr).await;
    let mut released = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        send(&mut other, &get(b"sem")).await;
        let (status, body) = read_response(&mut other).await;
        assert_eq!(status, 0x00);
        if be_u32(&body, 0) == 0 {
            released = true;
            break;
        }
    }
    assert!(released, "resources were never released");
}

#[tokio::test]
async fn release_validation() {
    let shared = test_shared();
    let addr = start_counter(shared).await;
    let mut a = connect(addr).await;
    let mut b = connect(addr).await;

    send(&mut a, &acquire(b"sem", 2, 5)).await;
    let (status, _) = read_response(&mut a).await;
    assert_eq!(status, 0x00);

    // a different connection never acquired anything.
    send(&mut b, &release(b"sem", 1)).await;
    let (status, body) = read_response(&mut b).await;
    assert_eq!(status, 0x22);
    assert_eq!(body, b"Not acquired");

    // releasing more than held fails too.
    send(&mut a, &release(b"sem", 3)).await;
    let (status, _) = read_response(&mut a).await;
    assert_eq!(status, 0x22);

    // unknown names are NotFound.
    send(&mut a, &release(b"missing", 1)).await;
    let (status, _) = read_response(&mut a).await;
    assert_eq!(status, 0x01);
}

#[tokio::test]
async fn dump_streams_entries_with_empty_terminator() {
    let shared = test_shared();
    let addr = start_counter(shared).await;
    let mut client = connect(addr).await;

    send(&mut client, &acquire(b"one", 1, 10)).await;
    read_response(&mut client).await;
    send(&mut client, &acquire(b"two", 2, 10)).await;
    read_response(&mut client).await;

    send(&mut client, &header(0x11, 0)).await;
    let mut seen = Vec::new();
    loop {
        let (status, body) = read_response(&mut client).await;
        assert_eq!(status, 0x00);
        if body.is_empty() {
            break; // the terminator
        }
        let name_len = be_u16(&body, 8) as usize;
        let name = body[10..10 + name_len].to_vec();
        seen.push((name, be_u32(&body, 0), be_u32(&body, 4)));
    }
    seen.sort();
    assert_eq!(
        seen,
        vec![(b"one".to_vec(), 1, 1), (b"two".to_vec(), 2, 2)]
    );
}

#[tokio::test]
async fn noop_and_unknown_and_stats() {
    let shared = test_shared();
    let addr = start_counter(shared).await;
    let mut client = connect(addr).await;

    send(&mut client, &header(0x00, 0)).await;
    let (status, body) = read_response(&mut client).await;
    assert_eq!(status, 0x00);
    assert!(body.is_empty());

    send(&mut client, &header(0x7f, 0)).await;
    let (status, body) = read_response(&mut client).await;
    assert_eq!(status, 0x81);
    assert_eq!(body, b"Unknown command");

    send(&mut client, &header(0x10, 0)).await;
    let (status, body) = read_response(&mut client).await;
    assert_eq!(status, 0x00);
    // the body is a sequence of (name_len, value_len, name, value) entries.
    let name_len = be_u16(&body, 0) as usize;
    assert_eq!(&body[4..4 + name_len], b"objects");
}
