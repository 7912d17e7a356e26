use std::io;
use std::path::PathBuf;

use bytes::BytesMut;
use snafu::Snafu;

use crate::spill::SpillFile;

/// Identity of the connection that may hold object locks.
pub type ConnectionId = u64;

/// GC ticks after which a surviving spilled payload gets the
/// drop-page-cache hint.
pub const FLUSH_AGE: u32 = 10;

/// `incr`/`decr` was attempted on a payload that is not an unsigned
/// decimal number.
#[derive(Debug, Snafu)]
#[snafu(display("cannot increment or decrement a non-numeric value"))]
pub struct NotANumber;

/// Where and when payloads spill out of the heap.
#[derive(Debug, Clone)]
pub struct SpillSettings {
    /// Payloads larger than this live in a temp file instead of the heap.
    pub heap_data_limit: usize,
    /// Directory for spill files.
    pub temp_dir: PathBuf,
}

#[derive(Debug)]
enum Payload {
    Heap(BytesMut),
    Spilled(SpillFile),
}

/// One cache entry: payload, metadata, GC age, and the lock owner.
///
/// The payload representation is tied to its size: at most
/// `heap_data_limit` bytes inline, spilled otherwise. The transition is
/// monotonic; once spilled, an object never moves back to the heap. Every
/// mutation bumps the CAS token exactly once.
#[derive(Debug)]
pub struct CacheObject {
    payload: Payload,
    length: usize,
    flags: u32,
    exptime: i64,
    cas: u64,
    age: u32,
    locker: Option<ConnectionId>,
}

impl CacheObject {
    pub fn new(
        data: &[u8],
        flags: u32,
        exptime: i64,
        spill: &SpillSettings,
    ) -> io::Result<Self> {
        let payload = if data.len() > spill.heap_data_limit {
            let mut file = SpillFile::create_in(&spill.temp_dir)?;
            file.write(data)?;
            Payload::Spilled(file)
        } else {
            Payload::Heap(BytesMut::from(data))
        };
        Ok(Self {
            payload,
            length: data.len(),
            flags,
            exptime,
            cas: 1,
            age: 0,
            locker: None,
        })
    }

    /// Creates an object holding `initial` as a decimal string, as binary
    /// `Increment`/`Decrement` do on a miss.
    pub fn new_numeric(initial: u64, exptime: i64) -> Self {
        let text = initial.to_string();
        Self {
            length: text.len(),
            payload: Payload::Heap(BytesMut::from(text.as_bytes())),
            flags: 0,
            exptime,
            cas: 1,
            age: 0,
            locker: None,
        }
    }

    /// Replaces the payload and metadata, bumping the CAS token.
    pub fn set(
        &mut self,
        data: &[u8],
        flags: u32,
        exptime: i64,
        spill: &SpillSettings,
    ) -> io::Result<()> {
        self.flags = flags;
        self.exptime = exptime;
        self.cas += 1;
        self.age = 0;

        if data.len() > spill.heap_data_limit {
            match &mut self.payload {
                Payload::Spilled(file) => {
                    file.clear()?;
                    file.write(data)?;
                }
                Payload::Heap(_) => {
                    let mut file = SpillFile::create_in(&spill.temp_dir)?;
                    file.write(data)?;
                    self.payload = Payload::Spilled(file);
                }
            }
        } else {
            self.payload = Payload::Heap(BytesMut::from(data));
        }
        self.length = data.len();
        Ok(())
    }

    /// Appends `data` without touching flags or exptime.
    pub fn append(&mut self, data: &[u8], spill: &SpillSettings) -> io::Result<()> {
        self.cas += 1;
        self.age = 0;
        if data.is_empty() {
            return Ok(());
        }

        let new_size = self.length + data.len();
        if new_size > spill.heap_data_limit {
            match &mut self.payload {
                Payload::Spilled(file) => file.write(data)?,
                Payload::Heap(heap) => {
                    let mut file = SpillFile::create_in(&spill.temp_dir)?;
                    if !heap.is_empty() {
                        file.write(heap)?;
                    }
                    file.write(data)?;
                    self.payload = Payload::Spilled(file);
                }
            }
        } else {
            match &mut self.payload {
                Payload::Heap(heap) => heap.extend_from_slice(data),
                // new_size > length >= spill boundary already.
                Payload::Spilled(file) => file.write(data)?,
            }
        }
        self.length = new_size;
        Ok(())
    }

    /// Prepends `data` without touching flags or exptime.
    pub fn prepend(&mut self, data: &[u8], spill: &SpillSettings) -> io::Result<()> {
        self.cas += 1;
        self.age = 0;
        if data.is_empty() {
            return Ok(());
        }

        let new_size = self.length + data.len();
        if new_size > spill.heap_data_limit {
            match &mut self.payload {
                Payload::Spilled(file) => {
                    let mut merged = BytesMut::with_capacity(new_size);
                    merged.extend_from_slice(data);
                    file.read_into(&mut merged)?;
                    file.clear()?;
                    file.write(&merged)?;
                }
                Payload::Heap(heap) => {
                    let mut file = SpillFile::create_in(&spill.temp_dir)?;
                    file.write(data)?;
                    if !heap.is_empty() {
                        file.write(heap)?;
                    }
                    self.payload = Payload::Spilled(file);
                }
            }
        } else {
            let Payload::Heap(heap) = &mut self.payload else {
                unreachable!("payload within heap limit is always inline");
            };
            let mut merged = BytesMut::with_capacity(new_size);
            merged.extend_from_slice(data);
            merged.extend_from_slice(heap);
            *heap = merged;
        }
        self.length = new_size;
        Ok(())
    }

    pub fn incr(&mut self, n: u64) -> Result<u64, NotANumber> {
        let value = self.numeric_value()?.wrapping_add(n);
        self.store_numeric(value);
        Ok(value)
    }

    pub fn decr(&mut self, n: u64) -> Result<u64, NotANumber> {
        let value = self.numeric_value()?.saturating_sub(n);
        self.store_numeric(value);
        Ok(value)
    }

    /// Updates the expiration time. Does not bump the CAS token.
    pub fn touch(&mut self, exptime: i64) {
        self.exptime = exptime;
        self.age = 0;
    }

    /// Appends the payload to `buf` and resets the GC age.
    pub fn read_into(&mut self, buf: &mut BytesMut) -> io::Result<()> {
        self.age = 0;
        match &self.payload {
            Payload::Heap(heap) => {
                buf.extend_from_slice(heap);
                Ok(())
            }
            Payload::Spilled(file) => file.read_into(buf),
        }
    }

    pub fn size(&self) -> usize {
        self.length
    }

    pub fn is_spilled(&self) -> bool {
        matches!(self.payload, Payload::Spilled(_))
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn cas(&self) -> u64 {
        self.cas
    }

    pub fn exptime(&self) -> i64 {
        self.exptime
    }

    /// Expiration as carried on the wire.
    pub fn exptime_wire(&self) -> u32 {
        self.exptime as u32
    }

    /// A locked object never expires; `flush_at` expires every unlocked
    /// object once reached.
    pub fn expired(&self, now: i64, flush_at: i64) -> bool {
        if self.locked() {
            return false;
        }
        if flush_at != 0 && flush_at <= now {
            return true;
        }
        if self.exptime == 0 {
            return false;
        }
        self.exptime <= now
    }

    pub fn age(&self) -> u32 {
        self.age
    }

    /// Marks one survived GC tick.
    pub fn survive(&mut self) {
        self.age += 1;
        if self.age == FLUSH_AGE {
            if let Payload::Spilled(file) = &self.payload {
                file.advise_dont_need();
            }
        }
    }

    /// Caller must have checked `locked()` first.
    pub fn lock(&mut self, conn: ConnectionId) {
        debug_assert!(self.locker.is_none());
        self.locker = Some(conn);
    }

    pub fn unlock(&mut self) {
        self.locker = None;
    }

    pub fn locked(&self) -> bool {
        self.locker.is_some()
    }

    pub fn locked_by(&self, conn: ConnectionId) -> bool {
        self.locker == Some(conn)
    }

    pub fn locked_by_other(&self, conn: ConnectionId) -> bool {
        self.locked() && !self.locked_by(conn)
    }

    // Digit-prefix parsing: leading ASCII whitespace is skipped and trailing
    // bytes are ignored, but overflow and an empty digit run are rejected.
    fn numeric_value(&self) -> Result<u64, NotANumber> {
        let Payload::Heap(heap) = &self.payload else {
            return Err(NotANumber);
        };
        let text = &heap[..];
        let start = text
            .iter()
            .position(|b| !b.is_ascii_whitespace())
            .ok_or(NotANumber)?;
        let digits: &[u8] = &text[start..];
        let end = digits
            .iter()
            .position(|b| !b.is_ascii_digit())
            .unwrap_or(digits.len());
        if end == 0 {
            return Err(NotANumber);
        }
        let mut value: u64 = 0;
        for &b in &digits[..end] {
            value = value
                .checked_mul(10)
                .and_then(|v| v.checked_add(u64::from(b - b'0')))
                .ok_or(NotANumber)?;
        }
        Ok(value)
    }

    fn store_numeric(&mut self, value: u64) {
        let text = value.to_string();
        self.length = text.len();
        self.payload = Payload::Heap(BytesMut::from(text.as_bytes()));
        self.cas += 1;
        self.age = 0;
    }
}
