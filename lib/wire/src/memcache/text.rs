//! The text dialect: a line-oriented request parser and the fixed-line
//! response builder.

use std::ops::Range;

use bytes::{BufMut, Bytes, BytesMut};
use memchr::memchr;
use smallvec::SmallVec;

use super::{StatsCategory, TextCommand, Verbosity};
use crate::{resolve_exptime, EXPTIME_THRESHOLD};

const CR: u8 = b'\x0d';
const LF: u8 = b'\x0a';
const SP: u8 = b'\x20';
const CRLF: &[u8] = b"\x0d\x0a";

/// A parsed text request.
///
/// A complete but malformed request is reported with `valid == false`; the
/// handler answers `ERROR` and the connection continues.
#[derive(Debug, Default)]
pub struct TextRequest {
    pub command: TextCommand,
    pub valid: bool,
    pub no_reply: bool,
    /// One key for most commands; all requested keys for `get`/`gets`.
    pub keys: SmallVec<[Bytes; 4]>,
    pub flags: u32,
    pub exptime: i64,
    pub cas_unique: u64,
    pub data: Bytes,
    pub value: u64,
    pub verbosity: Option<Verbosity>,
    pub stats: StatsCategory,
}

impl TextRequest {
    pub fn key(&self) -> &[u8] {
        self.keys.first().map(|k| k.as_ref()).unwrap_or(b"")
    }
}

#[derive(Debug, Default)]
pub(crate) struct RawText {
    pub consumed: usize,
    command: TextCommand,
    valid: bool,
    no_reply: bool,
    keys: SmallVec<[Range<usize>; 4]>,
    flags: u32,
    exptime: i64,
    cas_unique: u64,
    data: Range<usize>,
    value: u64,
    verbosity: Option<Verbosity>,
    stats: StatsCategory,
}

impl RawText {
    /// Turns offsets into cheap slices of the frozen `frame`.
    pub(crate) fn materialize(self, frame: &Bytes) -> TextRequest {
        TextRequest {
            command: self.command,
            valid: self.valid,
            no_reply: self.no_reply,
            keys: self.keys.into_iter().map(|r| frame.slice(r)).collect(),
            flags: self.flags,
            exptime: self.exptime,
            cas_unique: self.cas_unique,
            data: frame.slice(self.data),
            value: self.value,
            verbosity: self.verbosity,
            stats: self.stats,
        }
    }
}

/// Tokenizer over one request line; `end` is the index of the CR.
struct Line<'a> {
    buf: &'a [u8],
    pos: usize,
    end: usize,
}

impl<'a> Line<'a> {
    fn skip_spaces(&mut self) {
        while self.pos < self.end && self.buf[self.pos] == SP {
            self.pos += 1;
        }
    }

    fn at_end(&mut self) -> bool {
        self.skip_spaces();
        self.pos == self.end
    }

    fn token(&mut self) -> Option<Range<usize>> {
        self.skip_spaces();
        if self.pos == self.end {
            return None;
        }
        let start = self.pos;
        let stop = match memchr(SP, &self.buf[start..self.end]) {
            Some(offset) => start + offset,
            None => self.end,
        };
        self.pos = stop;
        Some(start..stop)
    }

    fn bytes(&self, range: &Range<usize>) -> &'a [u8] {
        &self.buf[range.clone()]
    }
}

fn to_uint(token: &[u8]) -> Option<u64> {
    if token.is_empty() {
        return None;
    }
    let mut value: u64 = 0;
    for &b in token {
        if !b.is_ascii_digit() {
            return None;
        }
        value = value
            .checked_mul(10)?
            .checked_add(u64::from(b - b'0'))?;
    }
    Some(value)
}

/// Consumes an optional trailing `noreply` and rejects garbage.
fn trailer(line: &mut Line<'_>) -> Option<bool> {
    let Some(token) = line.token() else {
        return Some(false);
    };
    if line.bytes(&token) != b"noreply" {
        return None;
    }
    if line.at_end() {
        Some(true)
    } else {
        None
    }
}

/// Parses one text request from the head of `buf`.
///
/// `consumed == 0` means the request is still incomplete.
pub(crate) fn parse(buf: &[u8], now: i64) -> RawText {
    let mut raw = RawText::default();

    let Some(lf) = memchr(LF, buf) else {
        return raw; // incomplete
    };
    raw.consumed = lf + 1;
    if lf == 0 {
        return raw; // a lone LF is invalid
    }
    let end = lf - 1;
    if buf[end] != CR {
        return raw;
    }

    let mut line = Line { buf, pos: 0, end };
    let Some(command) = line.token() else {
        return raw; // empty line
    };

    match line.bytes(&command) {
        b"set" => parse_storage(&mut raw, line, buf, now, TextCommand::Set, false),
        b"add" => parse_storage(&mut raw, line, buf, now, TextCommand::Add, false),
        b"replace" => parse_storage(&mut raw, line, buf, now, TextCommand::Replace, false),
        b"append" => parse_storage(&mut raw, line, buf, now, TextCommand::Append, false),
        b"prepend" => parse_storage(&mut raw, line, buf, now, TextCommand::Prepend, false),
        b"cas" => parse_storage(&mut raw, line, buf, now, TextCommand::Cas, true),
        b"get" => parse_get(&mut raw, line, TextCommand::Get),
        b"gets" => parse_get(&mut raw, line, TextCommand::Gets),
        b"delete" => parse_delete(&mut raw, line),
        b"incr" => parse_incdec(&mut raw, line, TextCommand::Incr),
        b"decr" => parse_incdec(&mut raw, line, TextCommand::Decr),
        b"touch" => parse_touch(&mut raw, line, now),
        b"lock" => parse_lock(&mut raw, line, TextCommand::Lock),
        b"unlock" => parse_lock(&mut raw, line, TextCommand::Unlock),
        b"unlock_all" => {
            raw.command = TextCommand::UnlockAll;
            raw.valid = true;
        }
        b"slabs" => {
            // accepted and ignored.
            raw.command = TextCommand::Slabs;
            raw.valid = true;
        }
        b"stats" => parse_stats(&mut raw, line),
        b"flush_all" => parse_flushall(&mut raw, line, now),
        b"version" => {
            raw.command = TextCommand::Version;
            raw.valid = true;
        }
        b"verbosity" => parse_verbosity(&mut raw, line),
        b"quit" => {
            raw.command = TextCommand::Quit;
            raw.valid = true;
        }
        _ => {}
    }
    raw
}

fn parse_storage(
    raw: &mut RawText,
    mut line: Line<'_>,
    buf: &[u8],
    now: i64,
    command: TextCommand,
    is_cas: bool,
) {
    raw.command = command;

    let Some(key) = line.token() else { return };
    let Some(flags) = line.token().and_then(|t| to_uint(line.bytes(&t))) else {
        return;
    };
    if flags > u64::from(u32::MAX) {
        return;
    }
    let Some(exptime) = line.token().and_then(|t| to_uint(line.bytes(&t))) else {
        return;
    };
    let Some(nbytes) = line.token().and_then(|t| to_uint(line.bytes(&t))) else {
        return;
    };
    if nbytes > u64::from(u32::MAX) {
        return;
    }
    if is_cas {
        let Some(cas) = line.token().and_then(|t| to_uint(line.bytes(&t))) else {
            return;
        };
        raw.cas_unique = cas;
    }
    let Some(no_reply) = trailer(&mut line) else {
        return;
    };

    raw.keys.push(key);
    raw.flags = flags as u32;
    raw.exptime = resolve_exptime(exptime, now);
    raw.no_reply = no_reply;

    // the data block plus its CRLF follows the line.
    let nbytes = nbytes as usize;
    let data_start = line.end + 2;
    let total = data_start + nbytes + 2;
    if buf.len() < total {
        raw.consumed = 0; // incomplete
        return;
    }
    raw.consumed = total;
    if buf[data_start + nbytes] != CR || buf[data_start + nbytes + 1] != LF {
        return;
    }
    raw.data = data_start..data_start + nbytes;
    raw.valid = true;
}

fn parse_get(raw: &mut RawText, mut line: Line<'_>, command: TextCommand) {
    raw.command = command;
    while let Some(key) = line.token() {
        raw.keys.push(key);
    }
    raw.valid = !raw.keys.is_empty();
}

fn parse_delete(raw: &mut RawText, mut line: Line<'_>) {
    raw.command = TextCommand::Delete;
    let Some(key) = line.token() else { return };
    let Some(no_reply) = trailer(&mut line) else {
        return;
    };
    raw.keys.push(key);
    raw.no_reply = no_reply;
    raw.valid = true;
}

fn parse_incdec(raw: &mut RawText, mut line: Line<'_>, command: TextCommand) {
    raw.command = command;
    let Some(key) = line.token() else { return };
    let Some(value) = line.token().and_then(|t| to_uint(line.bytes(&t))) else {
        return;
    };
    let Some(no_reply) = trailer(&mut line) else {
        return;
    };
    raw.keys.push(key);
    raw.value = value;
    raw.no_reply = no_reply;
    raw.valid = true;
}

fn parse_touch(raw: &mut RawText, mut line: Line<'_>, now: i64) {
    raw.command = TextCommand::Touch;
    let Some(key) = line.token() else { return };
    let Some(exptime) = line.token().and_then(|t| to_uint(line.bytes(&t))) else {
        return;
    };
    let Some(no_reply) = trailer(&mut line) else {
        return;
    };
    raw.keys.push(key);
    raw.exptime = resolve_exptime(exptime, now);
    raw.no_reply = no_reply;
    raw.valid = true;
}

fn parse_lock(raw: &mut RawText, mut line: Line<'_>, command: TextCommand) {
    raw.command = command;
    let Some(key) = line.token() else { return };
    if !line.at_end() {
        return;
    }
    raw.keys.push(key);
    raw.valid = true;
}

fn parse_stats(raw: &mut RawText, mut line: Line<'_>) {
    raw.command = TextCommand::Stats;
    let Some(category) = line.token() else {
        raw.valid = true;
        return;
    };
    raw.stats = match line.bytes(&category) {
        b"ops" => StatsCategory::Ops,
        b"items" => StatsCategory::Items,
        b"sizes" => StatsCategory::Sizes,
        b"settings" => StatsCategory::Settings,
        _ => return,
    };
    raw.valid = true;
}

fn parse_flushall(raw: &mut RawText, mut line: Line<'_>, now: i64) {
    raw.command = TextCommand::FlushAll;
    raw.exptime = now;

    if line.at_end() {
        raw.valid = true;
        return;
    }
    if line.buf[line.pos].is_ascii_digit() {
        let Some(delay) = line.token().and_then(|t| to_uint(line.bytes(&t))) else {
            return;
        };
        let delay = delay as i64;
        raw.exptime = if delay > EXPTIME_THRESHOLD {
            delay
        } else {
            now + delay
        };
    }
    let Some(no_reply) = trailer(&mut line) else {
        return;
    };
    raw.no_reply = no_reply;
    raw.valid = true;
}

fn parse_verbosity(raw: &mut RawText, mut line: Line<'_>) {
    raw.command = TextCommand::Verbosity;
    let Some(level) = line.token() else { return };
    raw.verbosity = Some(match line.bytes(&level) {
        b"error" => Verbosity::Error,
        b"warning" => Verbosity::Warning,
        b"debug" => Verbosity::Debug,
        // unrecognized levels fall back to info.
        _ => Verbosity::Info,
    });
    let Some(no_reply) = trailer(&mut line) else {
        raw.verbosity = None;
        return;
    };
    raw.no_reply = no_reply;
    raw.valid = true;
}

/// Builds text-dialect reply lines into a caller-supplied buffer.
pub struct TextResponder<'a> {
    out: &'a mut BytesMut,
}

impl<'a> TextResponder<'a> {
    pub fn new(out: &'a mut BytesMut) -> Self {
        Self { out }
    }

    pub fn error(&mut self) {
        self.out.put_slice(b"ERROR\x0d\x0a");
    }

    pub fn ok(&mut self) {
        self.out.put_slice(b"OK\x0d\x0a");
    }

    pub fn end(&mut self) {
        self.out.put_slice(b"END\x0d\x0a");
    }

    pub fn stored(&mut self) {
        self.out.put_slice(b"STORED\x0d\x0a");
    }

    pub fn not_stored(&mut self) {
        self.out.put_slice(b"NOT_STORED\x0d\x0a");
    }

    pub fn exists(&mut self) {
        self.out.put_slice(b"EXISTS\x0d\x0a");
    }

    pub fn not_found(&mut self) {
        self.out.put_slice(b"NOT_FOUND\x0d\x0a");
    }

    pub fn touched(&mut self) {
        self.out.put_slice(b"TOUCHED\x0d\x0a");
    }

    pub fn deleted(&mut self) {
        self.out.put_slice(b"DELETED\x0d\x0a");
    }

    pub fn locked(&mut self) {
        self.out.put_slice(b"LOCKED\x0d\x0a");
    }

    pub fn non_numeric(&mut self) {
        self.out
            .put_slice(b"CLIENT_ERROR cannot increment or decrement non-numeric value\x0d\x0a");
    }

    pub fn not_locked(&mut self) {
        self.out
            .put_slice(b"CLIENT_ERROR object is not locked or not found\x0d\x0a");
    }

    /// One `VALUE` record; `cas` is present for `gets`.
    pub fn value(&mut self, key: &[u8], flags: u32, data: &[u8], cas: Option<u64>) {
        self.out.put_slice(b"VALUE ");
        self.out.put_slice(key);
        match cas {
            Some(cas) => {
                self.out
                    .put_slice(format!(" {} {} {}\x0d\x0a", flags, data.len(), cas).as_bytes());
            }
            None => {
                self.out
                    .put_slice(format!(" {} {}\x0d\x0a", flags, data.len()).as_bytes());
            }
        }
        self.out.put_slice(data);
        self.out.put_slice(CRLF);
    }

    /// The `incr`/`decr` result line.
    pub fn number(&mut self, value: u64) {
        self.out.put_slice(format!("{value}\x0d\x0a").as_bytes());
    }

    pub fn stat(&mut self, name: &str, value: impl std::fmt::Display) {
        self.out
            .put_slice(format!("STAT {name} {value}\x0d\x0a").as_bytes());
    }

    pub fn version(&mut self, version: &str) {
        self.out
            .put_slice(format!("VERSION {version}\x0d\x0a").as_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_one(input: &[u8]) -> (usize, TextRequest) {
        let raw = parse(input, 1_000_000);
        let consumed = raw.consumed;
        let frame = Bytes::copy_from_slice(&input[..consumed.min(input.len())]);
        (consumed, raw.materialize(&frame))
    }

    #[test]
    fn parse_set_with_data() {
        let (consumed, req) = parse_one(b"set foo 7 0 5\r\nhello\r\n");
        assert_eq!(consumed, 22);
        assert!(req.valid);
        assert_eq!(req.command, TextCommand::Set);
        assert_eq!(req.key(), b"foo");
        assert_eq!(req.flags, 7);
        assert_eq!(req.exptime, 0);
        assert_eq!(&req.data[..], b"hello");
        assert!(!req.no_reply);
    }

    #[test]
    fn parse_set_noreply() {
        let (_, req) = parse_one(b"set foo 0 0 1 noreply\r\nx\r\n");
        assert!(req.valid);
        assert!(req.no_reply);
    }

    #[test]
    fn incomplete_data_consumes_nothing() {
        let raw = parse(b"set foo 0 0 10\r\nhel", 0);
        assert_eq!(raw.consumed, 0);
    }

    #[test]
    fn data_without_crlf_is_invalid() {
        let (consumed, req) = parse_one(b"set foo 0 0 5\r\nhelloXY");
        assert_eq!(consumed, 22);
        assert!(!req.valid);
    }

    #[test]
    fn relative_and_absolute_exptime() {
        let now = 1_000_000;
        let raw = parse(b"set k 0 60 1\r\nx\r\n", now);
        assert_eq!(raw.exptime, now + 60);

        let absolute = (EXPTIME_THRESHOLD + 1) as u64;
        let input = format!("set k 0 {absolute} 1\r\nx\r\n");
        let raw = parse(input.as_bytes(), now);
        assert_eq!(raw.exptime, EXPTIME_THRESHOLD + 1);
    }

    #[test]
    fn parse_cas_command() {
        let (_, req) = parse_one(b"cas k 1 0 2 99\r\nab\r\n");
        assert!(req.valid);
        assert_eq!(req.command, TextCommand::Cas);
        assert_eq!(req.cas_unique, 99);
    }

    #[test]
    fn parse_multi_key_get() {
        let (consumed, req) = parse_one(b"gets a bb  ccc\r\n");
        assert_eq!(consumed, 16);
        assert!(req.valid);
        assert_eq!(req.command, TextCommand::Gets);
        let keys: Vec<&[u8]> = req.keys.iter().map(|k| k.as_ref()).collect();
        assert_eq!(keys, vec![&b"a"[..], &b"bb"[..], &b"ccc"[..]]);
    }

    #[test]
    fn get_without_key_is_invalid() {
        let (_, req) = parse_one(b"get\r\n");
        assert!(!req.valid);
    }

    #[test]
    fn parse_incr() {
        let (_, req) = parse_one(b"incr n 5\r\n");
        assert!(req.valid);
        assert_eq!(req.command, TextCommand::Incr);
        assert_eq!(req.value, 5);
    }

    #[test]
    fn incr_with_non_numeric_argument_is_invalid() {
        let (_, req) = parse_one(b"incr n 5x\r\n");
        assert!(!req.valid);
    }

    #[test]
    fn parse_delete_and_touch() {
        let (_, req) = parse_one(b"delete k noreply\r\n");
        assert!(req.valid);
        assert!(req.no_reply);

        let (_, req) = parse_one(b"touch k 100\r\n");
        assert!(req.valid);
        assert_eq!(req.command, TextCommand::Touch);
    }

    #[test]
    fn parse_lock_rejects_garbage() {
        let (_, req) = parse_one(b"lock k\r\n");
        assert!(req.valid);
        assert_eq!(req.command, TextCommand::Lock);

        let (_, req) = parse_one(b"lock k junk\r\n");
        assert!(!req.valid);

        let (_, req) = parse_one(b"unlock_all\r\n");
        assert!(req.valid);
        assert_eq!(req.command, TextCommand::UnlockAll);
    }

    #[test]
    fn parse_stats_categories() {
        let (_, req) = parse_one(b"stats\r\n");
        assert!(req.valid);
        assert_eq!(req.stats, StatsCategory::General);

        let (_, req) = parse_one(b"stats items\r\n");
        assert_eq!(req.stats, StatsCategory::Items);

        let (_, req) = parse_one(b"stats bogus\r\n");
        assert!(!req.valid);
    }

    #[test]
    fn parse_flush_all_delay() {
        let now = 500;
        let raw = parse(b"flush_all\r\n", now);
        assert!(raw.valid);
        assert_eq!(raw.exptime, now);

        let raw = parse(b"flush_all 30 noreply\r\n", now);
        assert!(raw.valid);
        assert_eq!(raw.exptime, now + 30);
        assert!(raw.no_reply);
    }

    #[test]
    fn parse_verbosity_levels() {
        let (_, req) = parse_one(b"verbosity debug\r\n");
        assert!(req.valid);
        assert_eq!(req.verbosity, Some(Verbosity::Debug));

        let (_, req) = parse_one(b"verbosity loud\r\n");
        assert!(req.valid);
        assert_eq!(req.verbosity, Some(Verbosity::Info));
    }

    #[test]
    fn unknown_command_is_invalid_but_consumed() {
        let (consumed, req) = parse_one(b"frobnicate\r\n");
        assert_eq!(consumed, 12);
        assert!(!req.valid);
        assert_eq!(req.command, TextCommand::Unknown);
    }

    #[test]
    fn line_without_cr_is_invalid() {
        let (consumed, req) = parse_one(b"get k\n");
        assert_eq!(consumed, 6);
        assert!(!req.valid);
    }

    #[test]
    fn responder_emits_value_records() {
        let mut out = BytesMut::new();
        let mut r = TextResponder::new(&mut out);
        r.value(b"foo", 0, b"hello", None);
        r.end();
        assert_eq!(&out[..], b"VALUE foo 0 5\r\nhello\r\nEND\r\n");

        out.clear();
        let mut r = TextResponder::new(&mut out);
        r.value(b"foo", 9, b"x", Some(42));
        assert_eq!(&out[..], b"VALUE foo 9 1 42\r\nx\r\n");
    }
}
