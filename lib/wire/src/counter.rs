//! The counter service protocol: a 12-byte binary framing distinct from
//! memcache, carrying named resource acquire/release accounting.

use bytes::{BufMut, Bytes, BytesMut};
use std::ops::Range;
use tokio_util::codec::Decoder;

use crate::{FrameError, MAX_REQUEST_LENGTH};

pub const COUNTER_REQUEST_MAGIC: u8 = 0x90;
pub const COUNTER_RESPONSE_MAGIC: u8 = 0x91;
pub const COUNTER_HEADER_SIZE: usize = 12;

/// Counter protocol commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CounterCommand {
    Noop = 0x00,
    Get = 0x01,
    Acquire = 0x02,
    Release = 0x03,
    Stats = 0x10,
    Dump = 0x11,
}

impl CounterCommand {
    pub fn from_opcode(opcode: u8) -> Option<Self> {
        Some(match opcode {
            0x00 => CounterCommand::Noop,
            0x01 => CounterCommand::Get,
            0x02 => CounterCommand::Acquire,
            0x03 => CounterCommand::Release,
            0x10 => CounterCommand::Stats,
            0x11 => CounterCommand::Dump,
            _ => return None,
        })
    }

    pub fn opcode(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            CounterCommand::Noop => "noop",
            CounterCommand::Get => "get",
            CounterCommand::Acquire => "acquire",
            CounterCommand::Release => "release",
            CounterCommand::Stats => "stats",
            CounterCommand::Dump => "dump",
        }
    }

    pub const ALL: [CounterCommand; 6] = [
        CounterCommand::Noop,
        CounterCommand::Get,
        CounterCommand::Acquire,
        CounterCommand::Release,
        CounterCommand::Stats,
        CounterCommand::Dump,
    ];
}

/// Counter protocol response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CounterStatus {
    Ok = 0x00,
    NotFound = 0x01,
    Invalid = 0x04,
    ResourceNotAvailable = 0x21,
    NotAcquired = 0x22,
    UnknownCommand = 0x81,
    OutOfMemory = 0x82,
}

impl CounterStatus {
    pub fn message(self) -> &'static [u8] {
        match self {
            CounterStatus::Ok => b"No error",
            CounterStatus::NotFound => b"Not found",
            CounterStatus::Invalid => b"Invalid arguments",
            CounterStatus::ResourceNotAvailable => b"Resource not available",
            CounterStatus::NotAcquired => b"Not acquired",
            CounterStatus::UnknownCommand => b"Unknown command",
            CounterStatus::OutOfMemory => b"OutOfMemory",
        }
    }
}

/// A parsed counter request; validation failures carry a non-OK status.
#[derive(Debug)]
pub struct CounterRequest {
    pub command: Option<CounterCommand>,
    pub opcode: u8,
    pub status: CounterStatus,
    pub flags: u8,
    pub opaque: [u8; 4],
    pub resources: u32,
    pub maximum: u32,
    pub name: Bytes,
}

fn be_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([buf[at], buf[at + 1]])
}

fn be_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

/// Splits a byte stream into counter requests.
#[derive(Debug, Clone, Default)]
pub struct CounterDecoder;

struct RawCounter {
    consumed: usize,
    command: Option<CounterCommand>,
    opcode: u8,
    status: CounterStatus,
    flags: u8,
    opaque: [u8; 4],
    resources: u32,
    maximum: u32,
    name: Range<usize>,
}

fn parse(buf: &[u8]) -> RawCounter {
    let mut raw = RawCounter {
        consumed: 0,
        command: None,
        opcode: 0,
        status: CounterStatus::Invalid,
        flags: 0,
        opaque: [0; 4],
        resources: 0,
        maximum: 0,
        name: 0..0,
    };

    if buf.len() < COUNTER_HEADER_SIZE {
        return raw; // incomplete
    }
    let body_len = be_u32(buf, 4) as usize;
    if buf.len() < COUNTER_HEADER_SIZE + body_len {
        return raw; // incomplete
    }
    raw.consumed = COUNTER_HEADER_SIZE + body_len;

    raw.opcode = buf[1];
    raw.command = CounterCommand::from_opcode(raw.opcode);
    raw.flags = buf[2];
    raw.opaque.copy_from_slice(&buf[8..12]);

    if buf[0] != COUNTER_REQUEST_MAGIC {
        return raw; // invalid
    }

    let body = COUNTER_HEADER_SIZE;
    match raw.command {
        Some(CounterCommand::Noop | CounterCommand::Stats | CounterCommand::Dump) => {}
        Some(CounterCommand::Get) => {
            if body_len < 2 {
                return raw;
            }
            let name_len = be_u16(buf, body) as usize;
            if name_len == 0 || 2 + name_len > body_len {
                return raw;
            }
            raw.name = body + 2..body + 2 + name_len;
        }
        Some(CounterCommand::Acquire) => {
            if body_len < 10 {
                return raw;
            }
            raw.resources = be_u32(buf, body);
            if raw.resources == 0 {
                return raw;
            }
            raw.maximum = be_u32(buf, body + 4);
            if raw.maximum < raw.resources {
                return raw;
            }
            let name_len = be_u16(buf, body + 8) as usize;
            if name_len == 0 || 10 + name_len > body_len {
                return raw;
            }
            raw.name = body + 10..body + 10 + name_len;
        }
        Some(CounterCommand::Release) => {
            if body_len < 6 {
                return raw;
            }
            raw.resources = be_u32(buf, body);
            let name_len = be_u16(buf, body + 4) as usize;
            if name_len == 0 || 6 + name_len > body_len {
                return raw;
            }
            raw.name = body + 6..body + 6 + name_len;
        }
        None => {
            raw.status = CounterStatus::UnknownCommand;
            return raw;
        }
    }

    raw.status = CounterStatus::Ok;
    raw
}

impl Decoder for CounterDecoder {
    type Item = CounterRequest;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<CounterRequest>, FrameError> {
        if src.is_empty() {
            return Ok(None);
        }
        let raw = parse(&src[..]);
        if raw.consumed == 0 {
            if src.len() > MAX_REQUEST_LENGTH {
                return Err(FrameError::RequestTooLarge {
                    limit: MAX_REQUEST_LENGTH,
                });
            }
            return Ok(None);
        }
        let frame = src.split_to(raw.consumed).freeze();
        Ok(Some(CounterRequest {
            command: raw.command,
            opcode: raw.opcode,
            status: raw.status,
            flags: raw.flags,
            opaque: raw.opaque,
            resources: raw.resources,
            maximum: raw.maximum,
            name: frame.slice(raw.name),
        }))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<CounterRequest>, FrameError> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None => {
                src.clear();
                Ok(None)
            }
        }
    }
}

/// Builds counter response frames into a caller-supplied buffer.
pub struct CounterResponder<'a> {
    out: &'a mut BytesMut,
    opcode: u8,
    opaque: [u8; 4],
}

impl<'a> CounterResponder<'a> {
    pub fn new(out: &'a mut BytesMut, request: &CounterRequest) -> Self {
        Self {
            out,
            opcode: request.opcode,
            opaque: request.opaque,
        }
    }

    fn header(&mut self, status: CounterStatus, body_len: u32) {
        self.out.put_u8(COUNTER_RESPONSE_MAGIC);
        self.out.put_u8(self.opcode);
        self.out.put_u8(status as u8);
        self.out.put_u8(0);
        self.out.put_u32(body_len);
        self.out.put_slice(&self.opaque);
    }

    /// An OK response with an empty body; also the `Dump` terminator.
    pub fn success(&mut self) {
        self.header(CounterStatus::Ok, 0);
    }

    pub fn error(&mut self, status: CounterStatus) {
        let message = status.message();
        self.header(status, message.len() as u32);
        self.out.put_slice(message);
    }

    /// The `Get`/`Acquire` response body: one 32-bit count.
    pub fn consumption(&mut self, count: u32) {
        self.header(CounterStatus::Ok, 4);
        self.out.put_u32(count);
    }

    /// One `Dump` record.
    pub fn dump_entry(&mut self, name: &[u8], consumption: u32, max_consumption: u32) {
        self.header(CounterStatus::Ok, (10 + name.len()) as u32);
        self.out.put_u32(consumption);
        self.out.put_u32(max_consumption);
        self.out.put_u16(name.len() as u16);
        self.out.put_slice(name);
    }

    /// The `Stats` response around a body built with [`put_stat`].
    pub fn stats(&mut self, body: &[u8]) {
        self.header(CounterStatus::Ok, body.len() as u32);
        self.out.put_slice(body);
    }
}

/// Appends one name/value statistics entry to a `Stats` body.
pub fn put_stat(body: &mut BytesMut, name: &str, value: impl std::fmt::Display) {
    let value = value.to_string();
    body.put_u16(name.len() as u16);
    body.put_u16(value.len() as u16);
    body.put_slice(name.as_bytes());
    body.put_slice(value.as_bytes());
}
