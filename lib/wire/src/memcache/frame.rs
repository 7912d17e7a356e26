//! Dialect-dispatching frame decoder: the first byte of a request selects
//! the binary (0x80) or text parser.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use tokio_util::codec::Decoder;

use super::{binary, is_binary_request, text, Request};
use crate::{FrameError, MAX_REQUEST_LENGTH};

/// Splits a byte stream into memcache requests of either dialect.
///
/// Relative expiration times are resolved against `clock` (seconds since
/// the epoch) at parse time.
#[derive(Debug, Clone)]
pub struct MemcacheDecoder {
    clock: Arc<AtomicI64>,
}

impl MemcacheDecoder {
    pub fn new(clock: Arc<AtomicI64>) -> Self {
        Self { clock }
    }

    fn incomplete(&self, src: &BytesMut) -> Result<Option<Request>, FrameError> {
        if src.len() > MAX_REQUEST_LENGTH {
            return Err(FrameError::RequestTooLarge {
                limit: MAX_REQUEST_LENGTH,
            });
        }
        Ok(None)
    }
}

impl Decoder for MemcacheDecoder {
    type Item = Request;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Request>, FrameError> {
        if src.is_empty() {
            return Ok(None);
        }
        let now = self.clock.load(Ordering::Relaxed);

        if is_binary_request(src[0]) {
            let raw = binary::parse(&src[..], now);
            if raw.consumed == 0 {
                return self.incomplete(src);
            }
            let frame = src.split_to(raw.consumed).freeze();
            Ok(Some(Request::Binary(raw.materialize(&frame))))
        } else {
            let raw = text::parse(&src[..], now);
            if raw.consumed == 0 {
                return self.incomplete(src);
            }
            let frame = src.split_to(raw.consumed).freeze();
            Ok(Some(Request::Text(raw.materialize(&frame))))
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Request>, FrameError> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None => {
                // a trailing partial request dies with the connection.
                src.clear();
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::BufMut;

    use super::*;
    use crate::memcache::{BinaryCommand, TextCommand};

    fn decoder() -> MemcacheDecoder {
        MemcacheDecoder::new(Arc::new(AtomicI64::new(1000)))
    }

    #[test]
    fn dispatches_both_dialects_in_one_stream() {
        let mut input = BytesMut::new();
        input.put_slice(b"get foo\r\n");
        // binary Noop
        input.put_u8(0x80);
        input.put_u8(0x0a);
        input.put_slice(&[0; 22]);
        input.put_slice(b"version\r\n");

        let mut decoder = decoder();
        let Some(Request::Text(req)) = decoder.decode(&mut input).unwrap() else {
            panic!("expected a text request");
        };
        assert_eq!(req.command, TextCommand::Get);

        let Some(Request::Binary(req)) = decoder.decode(&mut input).unwrap() else {
            panic!("expected a binary request");
        };
        assert_eq!(req.command, Some(BinaryCommand::Noop));

        let Some(Request::Text(req)) = decoder.decode(&mut input).unwrap() else {
            panic!("expected a text request");
        };
        assert_eq!(req.command, TextCommand::Version);

        assert!(decoder.decode(&mut input).unwrap().is_none());
    }

    #[test]
    fn partial_requests_wait_for_more() {
        let mut input = BytesMut::from(&b"set k 0 0 5\r\nhe"[..]);
        let mut decoder = decoder();
        assert!(decoder.decode(&mut input).unwrap().is_none());
        assert_eq!(input.len(), 15); // nothing consumed

        input.put_slice(b"llo\r\n");
        let Some(Request::Text(req)) = decoder.decode(&mut input).unwrap() else {
            panic!("expected a text request");
        };
        assert!(req.valid);
        assert_eq!(&req.data[..], b"hello");
    }

    #[test]
    fn oversized_pending_request_errors() {
        let mut input = BytesMut::new();
        input.resize(MAX_REQUEST_LENGTH + 1, b'a'); // no LF in sight
        let mut decoder = decoder();
        assert!(matches!(
            decoder.decode(&mut input),
            Err(FrameError::RequestTooLarge { .. })
        ));
    }

    #[test]
    fn eof_discards_trailing_partial() {
        let mut input = BytesMut::from(&b"get foo"[..]);
        let mut decoder = decoder();
        assert!(decoder.decode_eof(&mut input).unwrap().is_none());
        assert!(input.is_empty());
    }
}
