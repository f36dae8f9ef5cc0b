//! Netstring framing: `<decimal length>:<payload>,`.
//!
//! Two entry points share the same length validation:
//! - `decode`/`encode` work on complete byte slices.
//! - `FrameReader` drives a non-blocking socket one frame at a time and
//!   never reads past the terminating comma of the current frame, so
//!   bytes belonging to the next frame stay in the kernel buffer.

use bytes::{BufMut, BytesMut};
use std::io::{self, Read};
use thiserror::Error;

/// Largest payload accepted on the wire (20 MiB).
pub const MAX_PAYLOAD_SIZE: usize = 20 * 1024 * 1024;

/// Largest number of decimal digits in a length prefix.
pub const MAX_LENGTH_DIGITS: usize = 10;

/// Reasons a byte stream is not a valid netstring.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FramingError {
    #[error("invalid character {0:#04x} in length prefix")]
    InvalidLengthDigit(u8),
    #[error("empty length prefix")]
    EmptyLength,
    #[error("length prefix has a leading zero")]
    LeadingZero,
    #[error("length prefix longer than {MAX_LENGTH_DIGITS} digits")]
    LengthTooLong,
    #[error("declared payload of {0} bytes exceeds the maximum of {1}")]
    PayloadTooLarge(u64, usize),
    #[error("netstring not terminated with ',' (found {0:#04x})")]
    MissingTerminator(u8),
}

/// Result of decoding a byte slice.
#[derive(Debug, PartialEq, Eq)]
pub enum Decoded<'a> {
    /// The slice holds a valid prefix of a frame.
    NeedMoreData,
    /// The slice can never become a valid frame.
    Reject(FramingError),
    /// A complete frame.
    Frame {
        payload: &'a [u8],
        /// Bytes of input used by the frame, terminator included.
        consumed: usize,
    },
}

/// Incremental parser for the `<digits>:` prefix.
#[derive(Debug, Default, Clone)]
struct LengthPrefix {
    value: u64,
    digits: usize,
}

impl LengthPrefix {
    /// Feed one byte. Returns the declared length once `:` is seen.
    fn push(&mut self, byte: u8, limit: usize) -> Result<Option<usize>, FramingError> {
        match byte {
            b'0'..=b'9' => {
                if self.digits == MAX_LENGTH_DIGITS {
                    return Err(FramingError::LengthTooLong);
                }
                if self.digits == 1 && self.value == 0 {
                    return Err(FramingError::LeadingZero);
                }
                self.value = self.value * 10 + u64::from(byte - b'0');
                self.digits += 1;
                Ok(None)
            }
            b':' => {
                if self.digits == 0 {
                    return Err(FramingError::EmptyLength);
                }
                match usize::try_from(self.value) {
                    Ok(len) if len <= limit => Ok(Some(len)),
                    _ => Err(FramingError::PayloadTooLarge(self.value, limit)),
                }
            }
            other => Err(FramingError::InvalidLengthDigit(other)),
        }
    }
}

/// Decode the first frame in `input` using the default payload limit.
pub fn decode(input: &[u8]) -> Decoded<'_> {
    decode_with_limit(input, MAX_PAYLOAD_SIZE)
}

/// Decode the first frame in `input`, rejecting payloads above `limit`.
pub fn decode_with_limit(input: &[u8], limit: usize) -> Decoded<'_> {
    let mut prefix = LengthPrefix::default();

    for (pos, &byte) in input.iter().enumerate() {
        let len = match prefix.push(byte, limit) {
            Ok(Some(len)) => len,
            Ok(None) => continue,
            Err(e) => return Decoded::Reject(e),
        };

        let body_start = pos + 1;
        let terminator = body_start + len;
        return match input.get(terminator) {
            None => Decoded::NeedMoreData,
            Some(b',') => Decoded::Frame {
                payload: &input[body_start..terminator],
                consumed: terminator + 1,
            },
            Some(&other) => Decoded::Reject(FramingError::MissingTerminator(other)),
        };
    }

    Decoded::NeedMoreData
}

/// Frame `payload` as a netstring.
pub fn encode(payload: &[u8]) -> BytesMut {
    let prefix = payload.len().to_string();
    let mut out = BytesMut::with_capacity(prefix.len() + payload.len() + 2);
    out.put_slice(prefix.as_bytes());
    out.put_u8(b':');
    out.put_slice(payload);
    out.put_u8(b',');
    out
}

/// Outcome of draining readable bytes from a socket.
#[derive(Debug)]
pub enum ReadOutcome {
    /// The socket would block before the frame completed.
    Continue,
    /// A complete frame is buffered and ready for processing.
    Dispatch,
    /// The connection must be closed.
    Remove(RemoveReason),
}

/// Why a connection stopped being readable.
#[derive(Debug, Error)]
pub enum RemoveReason {
    #[error("peer closed the connection")]
    Eof,
    #[error("framing error: {0}")]
    Framing(#[from] FramingError),
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
}

/// Read phase of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadPhase {
    /// Accumulating length digits.
    ReadingLength,
    /// Accumulating `len` payload bytes plus the terminator.
    ReadingBody { len: usize },
    /// A whole frame is buffered.
    Complete { len: usize },
}

/// Streaming reader for one netstring at a time.
#[derive(Debug)]
pub struct FrameReader {
    phase: ReadPhase,
    prefix: LengthPrefix,
    /// Sized to the whole body once the length is known.
    buf: BytesMut,
    /// Body bytes received so far.
    filled: usize,
    limit: usize,
}

impl FrameReader {
    /// Create a reader that rejects payloads larger than `limit`.
    pub fn new(limit: usize) -> Self {
        Self {
            phase: ReadPhase::ReadingLength,
            prefix: LengthPrefix::default(),
            buf: BytesMut::new(),
            filled: 0,
            limit: limit.min(MAX_PAYLOAD_SIZE),
        }
    }

    pub fn phase(&self) -> ReadPhase {
        self.phase
    }

    /// The buffered payload, once a frame is complete.
    pub fn frame(&self) -> Option<&[u8]> {
        match self.phase {
            ReadPhase::Complete { len } => self.buf.get(..len),
            _ => None,
        }
    }

    /// True when part of a frame has been consumed but not all of it.
    pub fn is_mid_frame(&self) -> bool {
        match self.phase {
            ReadPhase::ReadingLength => self.prefix.digits > 0,
            ReadPhase::ReadingBody { .. } => true,
            ReadPhase::Complete { .. } => false,
        }
    }

    /// Discard the current frame and start over with an empty buffer.
    pub fn reset(&mut self) {
        self.phase = ReadPhase::ReadingLength;
        self.prefix = LengthPrefix::default();
        self.buf = BytesMut::new();
        self.filled = 0;
    }

    /// Consume bytes from `src` until it would block, the frame is
    /// complete, or the stream becomes unusable.
    pub fn read_from<R: Read>(&mut self, src: &mut R) -> ReadOutcome {
        loop {
            match self.phase {
                ReadPhase::Complete { .. } => return ReadOutcome::Dispatch,
                ReadPhase::ReadingLength => {
                    // One byte at a time so nothing past ':' is consumed.
                    let mut byte = [0u8; 1];
                    match src.read(&mut byte) {
                        Ok(0) => return ReadOutcome::Remove(RemoveReason::Eof),
                        Ok(_) => match self.prefix.push(byte[0], self.limit) {
                            Ok(None) => {}
                            Ok(Some(len)) => {
                                self.buf = BytesMut::zeroed(len + 1);
                                self.filled = 0;
                                self.phase = ReadPhase::ReadingBody { len };
                            }
                            Err(e) => return ReadOutcome::Remove(e.into()),
                        },
                        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                            return ReadOutcome::Continue
                        }
                        Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                        Err(e) => return ReadOutcome::Remove(e.into()),
                    }
                }
                ReadPhase::ReadingBody { len } => {
                    match src.read(&mut self.buf[self.filled..]) {
                        Ok(0) => return ReadOutcome::Remove(RemoveReason::Eof),
                        Ok(n) => self.filled += n,
                        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                            return ReadOutcome::Continue
                        }
                        Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                        Err(e) => return ReadOutcome::Remove(e.into()),
                    }

                    if self.filled == len + 1 {
                        let last = self.buf[len];
                        if last != b',' {
                            return ReadOutcome::Remove(
                                FramingError::MissingTerminator(last).into(),
                            );
                        }
                        self.phase = ReadPhase::Complete { len };
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::time::{Duration, Instant};

    /// Yields the given chunks, then reports would-block.
    struct Chunked {
        chunks: VecDeque<Vec<u8>>,
        eof: bool,
    }

    impl Read for Chunked {
        fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
            let Some(mut chunk) = self.chunks.pop_front() else {
                return if self.eof {
                    Ok(0)
                } else {
                    Err(io::ErrorKind::WouldBlock.into())
                };
            };
            let n = chunk.len().min(out.len());
            out[..n].copy_from_slice(&chunk[..n]);
            if n < chunk.len() {
                chunk.drain(..n);
                self.chunks.push_front(chunk);
            }
            Ok(n)
        }
    }

    fn chunked(parts: &[&[u8]], eof: bool) -> Chunked {
        Chunked {
            chunks: parts.iter().map(|p| p.to_vec()).collect(),
            eof,
        }
    }

    #[test]
    fn test_decode_complete_frame() {
        match decode(b"5:hello,rest") {
            Decoded::Frame { payload, consumed } => {
                assert_eq!(payload, b"hello");
                assert_eq!(consumed, 8);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_decode_empty_payload() {
        assert_eq!(
            decode(b"0:,"),
            Decoded::Frame {
                payload: b"",
                consumed: 3
            }
        );
    }

    #[test]
    fn test_decode_incomplete() {
        assert_eq!(decode(b""), Decoded::NeedMoreData);
        assert_eq!(decode(b"12"), Decoded::NeedMoreData);
        assert_eq!(decode(b"5:hel"), Decoded::NeedMoreData);
        // Still waiting on the comma. A stream that ends here is closed by
        // the reader, which is where this input gets rejected.
        assert_eq!(decode(b"7:{\"a\":1}"), Decoded::NeedMoreData);
    }

    #[test]
    fn test_decode_bad_terminator() {
        assert_eq!(
            decode(b"7:{\"a\":1}x"),
            Decoded::Reject(FramingError::MissingTerminator(b'x'))
        );
    }

    #[test]
    fn test_decode_bad_prefix() {
        assert_eq!(
            decode(b"1a:x,"),
            Decoded::Reject(FramingError::InvalidLengthDigit(b'a'))
        );
        assert_eq!(decode(b":x,"), Decoded::Reject(FramingError::EmptyLength));
        assert_eq!(decode(b"05:hello,"), Decoded::Reject(FramingError::LeadingZero));
        assert_eq!(
            decode(b"12345678901:"),
            Decoded::Reject(FramingError::LengthTooLong)
        );
    }

    #[test]
    fn test_decode_oversize() {
        assert!(matches!(
            decode(b"20971521:"),
            Decoded::Reject(FramingError::PayloadTooLarge(20_971_521, MAX_PAYLOAD_SIZE))
        ));
        assert!(matches!(
            decode_with_limit(b"11:hello world,", 10),
            Decoded::Reject(FramingError::PayloadTooLarge(11, 10))
        ));
    }

    #[test]
    fn test_encode() {
        assert_eq!(&encode(b"hello")[..], b"5:hello,");
        assert_eq!(&encode(b"")[..], b"0:,");
    }

    #[test]
    fn test_reader_split_frame() {
        let mut reader = FrameReader::new(MAX_PAYLOAD_SIZE);
        let mut src = chunked(&[b"1", b"1:hello", b" wor"], false);
        assert!(matches!(reader.read_from(&mut src), ReadOutcome::Continue));
        assert!(reader.is_mid_frame());
        assert!(reader.frame().is_none());

        src.chunks.push_back(b"ld,".to_vec());
        assert!(matches!(reader.read_from(&mut src), ReadOutcome::Dispatch));
        assert_eq!(reader.frame(), Some(&b"hello world"[..]));
        assert_eq!(reader.phase(), ReadPhase::Complete { len: 11 });
    }

    #[test]
    fn test_reader_does_not_consume_next_frame() {
        let mut reader = FrameReader::new(MAX_PAYLOAD_SIZE);
        let mut src = chunked(&[b"2:ab,3:cde,"], false);
        assert!(matches!(reader.read_from(&mut src), ReadOutcome::Dispatch));
        assert_eq!(reader.frame(), Some(&b"ab"[..]));

        reader.reset();
        assert!(matches!(reader.read_from(&mut src), ReadOutcome::Dispatch));
        assert_eq!(reader.frame(), Some(&b"cde"[..]));
    }

    #[test]
    fn test_reader_eof_mid_body() {
        let mut reader = FrameReader::new(MAX_PAYLOAD_SIZE);
        let mut src = chunked(&[b"7:{\"a\":1}"], true);
        assert!(matches!(
            reader.read_from(&mut src),
            ReadOutcome::Remove(RemoveReason::Eof)
        ));
    }

    #[test]
    fn test_reader_rejects_bad_terminator() {
        let mut reader = FrameReader::new(MAX_PAYLOAD_SIZE);
        let mut src = chunked(&[b"7:{\"a\":1}7:"], false);
        assert!(matches!(
            reader.read_from(&mut src),
            ReadOutcome::Remove(RemoveReason::Framing(FramingError::MissingTerminator(b'7')))
        ));
    }

    #[test]
    fn test_reader_rejects_oversize() {
        let mut reader = FrameReader::new(4);
        let mut src = chunked(&[b"5:hello,"], false);
        assert!(matches!(
            reader.read_from(&mut src),
            ReadOutcome::Remove(RemoveReason::Framing(FramingError::PayloadTooLarge(5, 4)))
        ));
    }

    #[test]
    fn test_reader_large_frame_in_small_segments() {
        let payload: Vec<u8> = (0..MAX_PAYLOAD_SIZE).map(|i| b'a' + (i % 26) as u8).collect();
        let framed = encode(&payload);
        let mut src = Chunked {
            chunks: framed.chunks(4096).map(<[u8]>::to_vec).collect(),
            eof: false,
        };
        let mut reader = FrameReader::new(MAX_PAYLOAD_SIZE);

        let started = Instant::now();
        assert!(matches!(reader.read_from(&mut src), ReadOutcome::Dispatch));
        let elapsed = started.elapsed();

        assert_eq!(reader.frame(), Some(&payload[..]));
        // Linear in the frame size however small the segments are.
        assert!(elapsed < Duration::from_secs(5), "read took {elapsed:?}");
    }
}
