//! The binary dialect: 24-byte-header request parser and response builder.

use std::ops::Range;

use bytes::{BufMut, Bytes, BytesMut};

use super::{
    BinaryCommand, BinaryStatus, StatsCategory, BINARY_HEADER_SIZE, BINARY_RESPONSE_MAGIC,
};
use crate::{resolve_binary_exptime, EXPTIME_NONE, MAX_KEY_LENGTH, MAX_REQUEST_LENGTH};

/// A parsed binary request.
///
/// A complete frame that fails validation carries a non-OK `status`; the
/// handler just echoes it back.
#[derive(Debug)]
pub struct BinaryRequest {
    /// `None` for an unrecognized opcode.
    pub command: Option<BinaryCommand>,
    pub opcode: u8,
    pub status: BinaryStatus,
    pub quiet: bool,
    pub opaque: [u8; 4],
    pub key: Bytes,
    pub cas_unique: u64,
    pub flags: u32,
    pub exptime: i64,
    pub data: Bytes,
    pub value: u64,
    pub initial: u64,
    pub stats: StatsCategory,
}

#[derive(Debug)]
pub(crate) struct RawBinary {
    pub consumed: usize,
    command: Option<BinaryCommand>,
    opcode: u8,
    status: BinaryStatus,
    quiet: bool,
    opaque: [u8; 4],
    key: Range<usize>,
    cas_unique: u64,
    flags: u32,
    exptime: i64,
    data: Range<usize>,
    value: u64,
    initial: u64,
    stats: StatsCategory,
}

impl Default for RawBinary {
    fn default() -> Self {
        Self {
            consumed: 0,
            command: None,
            opcode: 0,
            status: BinaryStatus::Invalid,
            quiet: false,
            opaque: [0; 4],
            key: 0..0,
            cas_unique: 0,
            flags: 0,
            exptime: 0,
            data: 0..0,
            value: 0,
            initial: 0,
            stats: StatsCategory::General,
        }
    }
}

impl RawBinary {
    pub(crate) fn materialize(self, frame: &Bytes) -> BinaryRequest {
        BinaryRequest {
            command: self.command,
            opcode: self.opcode,
            status: self.status,
            quiet: self.quiet,
            opaque: self.opaque,
            key: frame.slice(self.key),
            cas_unique: self.cas_unique,
            flags: self.flags,
            exptime: self.exptime,
            data: frame.slice(self.data),
            value: self.value,
            initial: self.initial,
            stats: self.stats,
        }
    }
}

fn be_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([buf[at], buf[at + 1]])
}

fn be_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn be_u64(buf: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[at..at + 8]);
    u64::from_be_bytes(raw)
}

/// Parses one binary request from the head of `buf`.
///
/// `consumed == 0` means the frame is still incomplete.
pub(crate) fn parse(buf: &[u8], now: i64) -> RawBinary {
    let mut raw = RawBinary::default();

    if buf.len() < BINARY_HEADER_SIZE {
        return raw; // incomplete
    }
    let total_len = be_u32(buf, 8) as usize;
    if buf.len() < BINARY_HEADER_SIZE + total_len {
        return raw; // incomplete
    }
    raw.consumed = BINARY_HEADER_SIZE + total_len;

    raw.opcode = buf[1];
    raw.command = BinaryCommand::from_opcode(raw.opcode);
    raw.quiet = raw.command.map(BinaryCommand::quiet).unwrap_or(false);
    raw.opaque.copy_from_slice(&buf[12..16]);

    let key_len = be_u16(buf, 2) as usize;
    if key_len > MAX_KEY_LENGTH {
        return raw; // invalid
    }
    let extras_len = buf[4] as usize;
    if total_len < key_len + extras_len {
        return raw; // invalid
    }
    if key_len > 0 {
        let start = BINARY_HEADER_SIZE + extras_len;
        raw.key = start..start + key_len;
    }

    raw.cas_unique = be_u64(buf, 16);

    let data_len = total_len - key_len - extras_len;
    if data_len > MAX_REQUEST_LENGTH {
        raw.status = BinaryStatus::TooLargeValue;
        return raw;
    }
    if data_len > 0 {
        let start = BINARY_HEADER_SIZE + extras_len + key_len;
        raw.data = start..start + data_len;
    }

    let extras = BINARY_HEADER_SIZE;
    use BinaryCommand::*;
    match raw.command {
        Some(
            Get | GetQ | GetK | GetKQ | GaT | GaTQ | GaTK | GaTKQ | LaG | LaGQ | LaGK | LaGKQ,
        ) => {
            if extras_len != 0 && extras_len != 4 {
                return raw;
            }
            if key_len == 0 || data_len > 0 {
                return raw;
            }
            raw.exptime = if extras_len == 4 {
                resolve_binary_exptime(be_u32(buf, extras), now)
            } else {
                EXPTIME_NONE
            };
        }
        Some(Set | SetQ | Add | AddQ | Replace | ReplaceQ | RaU | RaUQ) => {
            if extras_len != 8 || key_len == 0 || data_len == 0 {
                return raw;
            }
            raw.flags = be_u32(buf, extras);
            raw.exptime = resolve_binary_exptime(be_u32(buf, extras + 4), now);
        }
        Some(Delete | DeleteQ) => {
            if extras_len != 0 || key_len == 0 || data_len > 0 {
                return raw;
            }
        }
        Some(Increment | IncrementQ | Decrement | DecrementQ) => {
            if extras_len != 20 || key_len == 0 || data_len > 0 {
                return raw;
            }
            raw.value = be_u64(buf, extras);
            raw.initial = be_u64(buf, extras + 8);
            raw.exptime = resolve_binary_exptime(be_u32(buf, extras + 16), now);
        }
        Some(Touch) => {
            if key_len == 0 || extras_len != 4 || data_len != 0 {
                return raw;
            }
            raw.exptime = resolve_binary_exptime(be_u32(buf, extras), now);
        }
        Some(Flush | FlushQ) => {
            if extras_len != 0 && extras_len != 4 {
                return raw;
            }
            if key_len != 0 || data_len > 0 {
                return raw;
            }
            // the 4-byte extras form carries an explicit flush time.
            raw.exptime = if extras_len == 4 {
                resolve_binary_exptime(be_u32(buf, extras), now)
            } else {
                now
            };
        }
        Some(Append | AppendQ | Prepend | PrependQ) => {
            if extras_len != 0 || key_len == 0 || data_len == 0 {
                return raw;
            }
        }
        Some(Lock | LockQ | Unlock | UnlockQ) => {
            if extras_len != 0 || key_len == 0 || data_len > 0 {
                return raw;
            }
        }
        Some(Stat) => {
            if extras_len != 0 || data_len != 0 {
                return raw;
            }
            raw.stats = match &buf[raw.key.clone()] {
                b"settings" => StatsCategory::Settings,
                b"items" => StatsCategory::Items,
                b"sizes" => StatsCategory::Sizes,
                b"ops" => StatsCategory::Ops,
                _ => StatsCategory::General,
            };
        }
        // no body constraints.
        Some(Quit | QuitQ | Version | Noop | UnlockAll | UnlockAllQ) => {}
        None => {
            raw.status = BinaryStatus::UnknownCommand;
            return raw;
        }
    }

    raw.status = BinaryStatus::Ok;
    raw
}

/// Builds binary-dialect response frames into a caller-supplied buffer.
pub struct BinaryResponder<'a> {
    out: &'a mut BytesMut,
    opcode: u8,
    opaque: [u8; 4],
}

impl<'a> BinaryResponder<'a> {
    pub fn new(out: &'a mut BytesMut, request: &BinaryRequest) -> Self {
        Self {
            out,
            opcode: request.opcode,
            opaque: request.opaque,
        }
    }

    fn header(
        &mut self,
        key_len: u16,
        extras_len: u8,
        data_len: u32,
        cas: u64,
        status: BinaryStatus,
    ) {
        let total = u32::from(key_len) + u32::from(extras_len) + data_len;
        self.out.put_u8(BINARY_RESPONSE_MAGIC);
        self.out.put_u8(self.opcode);
        self.out.put_u16(key_len);
        self.out.put_u8(extras_len);
        self.out.put_u8(0);
        self.out.put_u16(status as u16);
        self.out.put_u32(total);
        self.out.put_slice(&self.opaque);
        self.out.put_u64(cas);
    }

    pub fn error(&mut self, status: BinaryStatus) {
        let message = status.message();
        self.header(0, 0, message.len() as u32, 0, status);
        self.out.put_slice(message);
    }

    pub fn success(&mut self) {
        self.header(0, 0, 0, 0, BinaryStatus::Ok);
    }

    pub fn set(&mut self, cas: u64) {
        self.header(0, 0, 0, cas, BinaryStatus::Ok);
    }

    /// A Get-family response; `key` is present for the K variants.
    pub fn get(&mut self, flags: u32, data: &[u8], cas: u64, key: Option<&[u8]>) {
        let key_len = key.map(<[u8]>::len).unwrap_or(0) as u16;
        self.header(key_len, 4, data.len() as u32, cas, BinaryStatus::Ok);
        self.out.put_u32(flags);
        if let Some(key) = key {
            self.out.put_slice(key);
        }
        self.out.put_slice(data);
    }

    pub fn incdec(&mut self, value: u64, cas: u64) {
        self.header(0, 0, 8, cas, BinaryStatus::Ok);
        self.out.put_u64(value);
    }

    pub fn stat(&mut self, key: &[u8], value: &[u8]) {
        self.header(key.len() as u16, 0, value.len() as u32, 0, BinaryStatus::Ok);
        self.out.put_slice(key);
        self.out.put_slice(value);
    }

    pub fn version(&mut self, version: &str) {
        self.header(0, 0, version.len() as u32, 0, BinaryStatus::Ok);
        self.out.put_slice(version.as_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(
        opcode: u8,
        extras: &[u8],
        key: &[u8],
        data: &[u8],
        cas: u64,
    ) -> BytesMut {
        let mut out = BytesMut::new();
        out.put_u8(0x80);
        out.put_u8(opcode);
        out.put_u16(key.len() as u16);
        out.put_u8(extras.len() as u8);
        out.put_u8(0);
        out.put_u16(0);
        out.put_u32((extras.len() + key.len() + data.len()) as u32);
        out.put_slice(&[0xde, 0xad, 0xbe, 0xef]);
        out.put_u64(cas);
        out.put_slice(extras);
        out.put_slice(key);
        out.put_slice(data);
        out
    }

    fn parse_one(input: &[u8]) -> (usize, BinaryRequest) {
        let raw = parse(input, 1_000_000);
        let consumed = raw.consumed;
        let bytes = Bytes::copy_from_slice(&input[..consumed.min(input.len())]);
        (consumed, raw.materialize(&bytes))
    }

    #[test]
    fn parse_set_request() {
        let mut extras = BytesMut::new();
        extras.put_u32(7);
        extras.put_u32(0);
        let input = frame(0x01, &extras, b"key", b"value", 3);
        let (consumed, req) = parse_one(&input);

        assert_eq!(consumed, input.len());
        assert_eq!(req.status, BinaryStatus::Ok);
        assert_eq!(req.command, Some(BinaryCommand::Set));
        assert!(!req.quiet);
        assert_eq!(&req.key[..], b"key");
        assert_eq!(&req.data[..], b"value");
        assert_eq!(req.flags, 7);
        assert_eq!(req.exptime, 0);
        assert_eq!(req.cas_unique, 3);
        assert_eq!(req.opaque, [0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn parse_get_with_exptime_sentinel() {
        let input = frame(0x00, &[], b"k", b"", 0);
        let (_, req) = parse_one(&input);
        assert_eq!(req.status, BinaryStatus::Ok);
        assert_eq!(req.exptime, EXPTIME_NONE);
    }

    #[test]
    fn parse_incr_extras() {
        let mut extras = BytesMut::new();
        extras.put_u64(1); // delta
        extras.put_u64(10); // initial
        extras.put_u32(100); // exptime
        let input = frame(0x05, &extras, b"n", b"", 0);
        let (_, req) = parse_one(&input);
        assert_eq!(req.status, BinaryStatus::Ok);
        assert_eq!(req.value, 1);
        assert_eq!(req.initial, 10);
        assert_eq!(req.exptime, 1_000_100);

        // 0xffffffff means "no change".
        let mut extras = BytesMut::new();
        extras.put_u64(2);
        extras.put_u64(0);
        extras.put_u32(u32::MAX);
        let input = frame(0x05, &extras, b"n", b"", 0);
        let (_, req) = parse_one(&input);
        assert_eq!(req.exptime, EXPTIME_NONE);
    }

    #[test]
    fn set_without_extras_is_invalid() {
        let input = frame(0x01, &[], b"key", b"value", 0);
        let (consumed, req) = parse_one(&input);
        assert_eq!(consumed, input.len());
        assert_eq!(req.status, BinaryStatus::Invalid);
    }

    #[test]
    fn get_with_value_is_invalid() {
        let input = frame(0x00, &[], b"key", b"junk", 0);
        let (_, req) = parse_one(&input);
        assert_eq!(req.status, BinaryStatus::Invalid);
    }

    #[test]
    fn unknown_opcode() {
        let input = frame(0x77, &[], b"", b"", 0);
        let (_, req) = parse_one(&input);
        assert_eq!(req.command, None);
        assert_eq!(req.status, BinaryStatus::UnknownCommand);
    }

    #[test]
    fn oversized_key_is_invalid() {
        let key = vec![b'k'; MAX_KEY_LENGTH + 1];
        let input = frame(0x04, &[], &key, b"", 0);
        let (consumed, req) = parse_one(&input);
        assert_eq!(consumed, input.len());
        assert_eq!(req.status, BinaryStatus::Invalid);
    }

    #[test]
    fn incomplete_frame_consumes_nothing() {
        let mut extras = BytesMut::new();
        extras.put_u32(0);
        extras.put_u32(0);
        let input = frame(0x01, &extras, b"key", b"value", 0);
        let raw = parse(&input[..input.len() - 1], 0);
        assert_eq!(raw.consumed, 0);
        let raw = parse(&input[..10], 0);
        assert_eq!(raw.consumed, 0);
    }

    #[test]
    fn lock_family_validation() {
        let input = frame(0x40, &[], b"k", b"", 0);
        let (_, req) = parse_one(&input);
        assert_eq!(req.status, BinaryStatus::Ok);
        assert_eq!(req.command, Some(BinaryCommand::Lock));

        // a lock with a value body is invalid.
        let input = frame(0x40, &[], b"k", b"v", 0);
        let (_, req) = parse_one(&input);
        assert_eq!(req.status, BinaryStatus::Invalid);
    }

    #[test]
    fn stat_categories_come_from_the_key() {
        let input = frame(0x10, &[], b"sizes", b"", 0);
        let (_, req) = parse_one(&input);
        assert_eq!(req.status, BinaryStatus::Ok);
        assert_eq!(req.stats, StatsCategory::Sizes);
    }

    #[test]
    fn responder_roundtrip() {
        let input = frame(0x01, &[0; 8], b"key", b"value", 0);
        let (_, req) = parse_one(&input);

        let mut out = BytesMut::new();
        let mut r = BinaryResponder::new(&mut out, &req);
        r.set(9);
        assert_eq!(out.len(), BINARY_HEADER_SIZE);
        assert_eq!(out[0], 0x81);
        assert_eq!(out[1], 0x01);
        assert_eq!(&out[6..8], &[0, 0]);
        assert_eq!(&out[12..16], &[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(be_u64(&out, 16), 9);

        out.clear();
        let mut r = BinaryResponder::new(&mut out, &req);
        r.error(BinaryStatus::Locked);
        assert_eq!(be_u16(&out, 6), 0x0010);
        assert_eq!(&out[BINARY_HEADER_SIZE..], b"Locked");

        out.clear();
        let mut r = BinaryResponder::new(&mut out, &req);
        r.get(7, b"data", 3, Some(b"key"));
        assert_eq!(be_u16(&out, 2), 3); // key length
        assert_eq!(out[4], 4); // extras length
        assert_eq!(be_u32(&out, 8), 4 + 3 + 4); // total body
        assert_eq!(be_u32(&out, BINARY_HEADER_SIZE), 7); // flags
        assert_eq!(&out[BINARY_HEADER_SIZE + 4..], b"keydata");
    }
}
