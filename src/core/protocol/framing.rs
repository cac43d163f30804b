//! Wire framing for the optical link
//!
//! A frame is `START [escaped body] END`. Requests start with 0x80, the meter
//! answers with 0x40, and both end with CR (0x0D). Any reserved byte inside the
//! body is sent as `ESC, byte ^ 0xFF`.

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tracing::warn;

use super::checksum::append_crc;

// ============ Markers ============

/// Start marker of a frame sent to the meter
pub const START_REQUEST: u8 = 0x80;
/// Start marker of a frame sent by the meter
pub const START_RESPONSE: u8 = 0x40;
/// Frame terminator (carriage return)
pub const END: u8 = 0x0D;
/// Escape prefix
pub const ESC: u8 = 0x1B;
/// Acknowledge, reserved on the wire
pub const ACK: u8 = 0x06;

/// Bytes that must never appear unescaped inside a body
pub const RESERVED: [u8; 5] = [ACK, END, ESC, START_RESPONSE, START_REQUEST];

/// Largest raw frame the accumulator keeps before giving up
pub const MAX_FRAME_LEN: usize = 50;

/// Framing errors
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// No terminator within the buffer capacity
    #[error("Frame overflow: no terminator within {capacity} bytes")]
    Overflow {
        /// Capacity that was exceeded
        capacity: usize,
    },
}

/// Whether `byte` has to be escaped on the wire
pub fn is_reserved(byte: u8) -> bool {
    RESERVED.contains(&byte)
}

/// Escape a single body byte
pub fn escape_byte(byte: u8, out: &mut Vec<u8>) {
    if is_reserved(byte) {
        out.push(ESC);
        out.push(byte ^ 0xFF);
    } else {
        out.push(byte);
    }
}

/// Escape a whole body
pub fn escape(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() * 2);
    for &byte in body {
        escape_byte(byte, &mut out);
    }
    out
}

/// Undo escaping of a raw frame body
///
/// Escaped values outside the reserved set are kept but logged. A dangling
/// escape at the very end has nothing to apply to and is dropped.
pub fn unescape(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len());
    let mut iter = raw.iter().copied();

    while let Some(byte) = iter.next() {
        if byte != ESC {
            out.push(byte);
            continue;
        }
        match iter.next() {
            Some(next) => {
                let value = next ^ 0xFF;
                if !is_reserved(value) {
                    warn!("Unexpected escape sequence: 1b {:02x} -> {:02x}", next, value);
                }
                out.push(value);
            }
            None => {
                warn!("Dangling escape byte at end of frame");
            }
        }
    }

    out
}

/// Build a complete wire frame: CRC, escaping, start marker and terminator
pub fn encode_frame(start: u8, body: &[u8]) -> Vec<u8> {
    let mut message = body.to_vec();
    append_crc(&mut message);

    let mut frame = Vec::with_capacity(message.len() * 2 + 2);
    frame.push(start);
    for &byte in &message {
        escape_byte(byte, &mut frame);
    }
    frame.push(END);
    frame
}

/// Receive accumulator
///
/// Fed one byte at a time. Start markers are skipped, everything else is kept
/// until a terminator hands back the raw (still escaped) frame.
#[derive(Debug)]
pub struct FrameAccumulator {
    buffer: BytesMut,
    capacity: usize,
}

impl Default for FrameAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameAccumulator {
    /// Create an accumulator with the default capacity
    pub fn new() -> Self {
        Self::with_capacity(MAX_FRAME_LEN)
    }

    /// Create an accumulator holding at most `capacity` bytes
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(capacity),
            capacity,
        }
    }

    /// Feed one byte
    ///
    /// Returns `Ok(Some(frame))` when a terminator completes a frame,
    /// `Ok(None)` while a frame is still being collected, and
    /// `Err(FrameError::Overflow)` when the capacity is exhausted. The buffer is
    /// empty after a completed frame and after an overflow.
    pub fn push(&mut self, byte: u8) -> Result<Option<Bytes>, FrameError> {
        match byte {
            START_RESPONSE => Ok(None),
            END => Ok(Some(self.buffer.split().freeze())),
            _ if self.buffer.len() >= self.capacity => {
                self.buffer.clear();
                Err(FrameError::Overflow {
                    capacity: self.capacity,
                })
            }
            _ => {
                self.buffer.extend_from_slice(&[byte]);
                Ok(None)
            }
        }
    }

    /// Number of bytes collected so far
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// True when no partial frame is pending
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Drop any partial frame
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protocol::checksum::verify;

    #[test]
    fn test_escape_reserved() {
        for b in RESERVED {
            assert_eq!(escape(&[b]), vec![ESC, b ^ 0xFF]);
            assert_eq!(unescape(&escape(&[b])), vec![b]);
        }
    }

    #[test]
    fn test_plain_bytes_untouched() {
        let body = [0x3F, 0x10, 0x01, 0x00, 0x01];
        assert_eq!(escape(&body), body.to_vec());
        assert_eq!(unescape(&body), body.to_vec());
    }

    #[test]
    fn test_unexpected_escape_kept() {
        // 0x1b 0xfe decodes to 0x01, which is not reserved: logged, not rejected
        assert_eq!(unescape(&[0x3F, ESC, 0xFE, 0x10]), vec![0x3F, 0x01, 0x10]);
    }

    #[test]
    fn test_dangling_escape_dropped() {
        assert_eq!(unescape(&[0x3F, 0x10, ESC]), vec![0x3F, 0x10]);
    }

    #[test]
    fn test_encode_frame_layout() {
        let frame = encode_frame(START_REQUEST, &[0x3F, 0x10, 0x01, 0x00, 0x01]);
        assert_eq!(frame.first(), Some(&START_REQUEST));
        assert_eq!(frame.last(), Some(&END));
        let inner = &frame[1..frame.len() - 1];
        assert!(!inner.contains(&END));
        assert!(!inner.contains(&START_REQUEST));
        assert!(verify(&unescape(inner)));
    }

    #[test]
    fn test_accumulator_strips_markers() {
        let mut acc = FrameAccumulator::new();
        for b in [START_RESPONSE, START_RESPONSE, 0x3F, 0x10] {
            assert_eq!(acc.push(b), Ok(None));
        }
        let frame = acc.push(END).unwrap().unwrap();
        assert_eq!(&frame[..], &[0x3F, 0x10]);
        assert!(acc.is_empty());
    }

    #[test]
    fn test_accumulator_overflow_then_recovers() {
        let mut acc = FrameAccumulator::with_capacity(8);
        for _ in 0..8 {
            assert_eq!(acc.push(0x11), Ok(None));
        }
        assert_eq!(acc.push(0x11), Err(FrameError::Overflow { capacity: 8 }));
        assert!(acc.is_empty());

        acc.push(0x22).unwrap();
        let frame = acc.push(END).unwrap().unwrap();
        assert_eq!(&frame[..], &[0x22]);
    }

    #[test]
    fn test_terminator_at_capacity_completes() {
        let mut acc = FrameAccumulator::with_capacity(4);
        for b in [1, 2, 3, 4] {
            acc.push(b).unwrap();
        }
        let frame = acc.push(END).unwrap().unwrap();
        assert_eq!(frame.len(), 4);
    }
}
