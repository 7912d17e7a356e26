//! Replication stream encoding: mutations travel master→slave as quiet
//! binary memcache requests (`SetQ` for stores, `DeleteQ` for removals).

use bytes::{BufMut, BytesMut};

use crate::memcache::{BinaryCommand, BINARY_REQUEST_MAGIC};

fn put_header(out: &mut BytesMut, command: BinaryCommand, key_len: u16, extras_len: u8, data_len: u32) {
    let total = u32::from(key_len) + u32::from(extras_len) + data_len;
    out.put_u8(BINARY_REQUEST_MAGIC);
    out.put_u8(command.opcode());
    out.put_u16(key_len);
    out.put_u8(extras_len);
    out.put_u8(0);
    out.put_u16(0);
    out.put_u32(total);
    out.put_u32(0); // opaque
    out.put_u64(0); // cas
}

/// Encodes one `SetQ` carrying the live object state (not the client
/// request, so append/prepend replicate the merged payload).
pub fn put_set(out: &mut BytesMut, key: &[u8], flags: u32, exptime: u32, data: &[u8]) {
    put_header(out, BinaryCommand::SetQ, key.len() as u16, 8, data.len() as u32);
    out.put_u32(flags);
    out.put_u32(exptime);
    out.put_slice(key);
    out.put_slice(data);
}

/// Encodes one `DeleteQ`.
pub fn put_delete(out: &mut BytesMut, key: &[u8]) {
    put_header(out, BinaryCommand::DeleteQ, key.len() as u16, 0, 0);
    out.put_slice(key);
}
