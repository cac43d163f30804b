//! Kamstrup "read register" request and response
//!
//! Request body: `3f 10 01 <reg hi> <reg lo>`.
//! Response body: `3f 10 <reg hi> <reg lo> <unit> <len> <exp> <mantissa...>`.
//! Both are followed by a big-endian CRC and framed by [`super::framing`].

use thiserror::Error;
use tracing::debug;

use super::checksum::{self, CRC_LEN};
use super::framing::{self, START_REQUEST, START_RESPONSE};
use crate::core::registers::{RegisterId, UnitCode};

/// Destination address of the meter on the optical port
pub const DESTINATION: u8 = 0x3F;
/// "Get register" command
pub const CMD_GET_REGISTER: u8 = 0x10;
/// Number of registers requested per frame
pub const REGISTER_COUNT: u8 = 0x01;

/// Bytes before the mantissa in a response body
pub const RESPONSE_HEADER_LEN: usize = 7;

/// Longest mantissa that fits in 64 bits
pub const MAX_MANTISSA_LEN: usize = 8;

/// Exponent sign flag in the exponent byte
const EXP_NEGATIVE: u8 = 0x40;
/// Value sign flag in the exponent byte
const VALUE_NEGATIVE: u8 = 0x80;
/// Exponent magnitude bits
const EXP_MASK: u8 = 0x3F;

/// Why a response frame was rejected
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// CRC residue was not zero
    #[error("CRC check failed (residue 0x{residue:04x})")]
    Integrity {
        /// Residue left after running the CRC over the frame
        residue: u16,
    },
    /// Magic bytes or echoed register differ from the request
    #[error("Header mismatch: expected register {expected}, got {found:02x?}")]
    HeaderMismatch {
        /// Register that was requested
        expected: RegisterId,
        /// First four bytes of the decoded frame
        found: [u8; 4],
    },
    /// Frame shorter than its own header claims
    #[error("Truncated frame: {len} bytes, need {needed}")]
    Truncated {
        /// Decoded length including CRC
        len: usize,
        /// Length the header requires
        needed: usize,
    },
    /// Mantissa wider than 64 bits
    #[error("Mantissa of {0} bytes is too long")]
    MantissaTooLong(usize),
}

impl DecodeError {
    /// Short tag used in logs and statistics
    pub fn kind(&self) -> &'static str {
        match self {
            DecodeError::Integrity { .. } => "crc",
            DecodeError::HeaderMismatch { .. } => "header",
            DecodeError::Truncated { .. } => "truncated",
            DecodeError::MantissaTooLong(_) => "mantissa",
        }
    }
}

/// Unescaped request body (without CRC)
pub fn request_body(register: RegisterId) -> [u8; 5] {
    let [hi, lo] = register.to_be_bytes();
    [DESTINATION, CMD_GET_REGISTER, REGISTER_COUNT, hi, lo]
}

/// Complete wire frame asking the meter for one register
pub fn build_read_request(register: RegisterId) -> Vec<u8> {
    framing::encode_frame(START_REQUEST, &request_body(register))
}

/// Parse a raw request frame (start marker and terminator already removed)
///
/// Used by the virtual meter to find out which register was asked for.
pub fn parse_read_request(raw: &[u8]) -> Result<RegisterId, DecodeError> {
    let body = framing::unescape(raw);
    let residue = checksum::crc16(&body);
    if residue != 0 {
        return Err(DecodeError::Integrity { residue });
    }
    let needed = request_body(RegisterId(0)).len() + CRC_LEN;
    if body.len() != needed {
        return Err(DecodeError::Truncated {
            len: body.len(),
            needed,
        });
    }
    if body[..3] != [DESTINATION, CMD_GET_REGISTER, REGISTER_COUNT] {
        return Err(DecodeError::HeaderMismatch {
            expected: RegisterId::from_be_bytes([body[3], body[4]]),
            found: [body[0], body[1], body[2], body[3]],
        });
    }
    Ok(RegisterId::from_be_bytes([body[3], body[4]]))
}

/// Decoded register value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadResponse {
    /// Register echoed by the meter
    pub register: RegisterId,
    /// Unit code
    pub unit: UnitCode,
    /// Unsigned mantissa
    pub mantissa: u64,
    /// Mantissa width on the wire
    pub mantissa_len: u8,
    /// Raw exponent/sign byte
    pub exponent_byte: u8,
}

impl ReadResponse {
    /// Build a response from its numeric parts
    ///
    /// `exponent` is clamped to the 6-bit magnitude the wire format carries.
    pub fn new(register: RegisterId, unit: UnitCode, mantissa: u64, exponent: i8, negative: bool) -> Self {
        let magnitude = exponent.unsigned_abs().min(EXP_MASK);
        let mut exponent_byte = magnitude;
        if exponent < 0 {
            exponent_byte |= EXP_NEGATIVE;
        }
        if negative {
            exponent_byte |= VALUE_NEGATIVE;
        }
        let significant = (64 - mantissa.leading_zeros()).div_ceil(8).max(1);
        Self {
            register,
            unit,
            mantissa,
            // At most 8 bytes for a u64
            mantissa_len: significant as u8,
            exponent_byte,
        }
    }

    /// Signed decimal exponent
    pub fn exponent(&self) -> i32 {
        let magnitude = i32::from(self.exponent_byte & EXP_MASK);
        if self.exponent_byte & EXP_NEGATIVE != 0 {
            -magnitude
        } else {
            magnitude
        }
    }

    /// Whether the value sign flag is set
    pub fn is_negative(&self) -> bool {
        self.exponent_byte & VALUE_NEGATIVE != 0
    }

    /// Final reading: mantissa × 10^exponent × sign
    pub fn value(&self) -> f64 {
        #[allow(clippy::cast_precision_loss)]
        let magnitude = self.mantissa as f64 * 10f64.powi(self.exponent());
        if self.is_negative() {
            -magnitude
        } else {
            magnitude
        }
    }

    /// Unescaped response body without CRC
    pub fn to_body(&self) -> Vec<u8> {
        let [hi, lo] = self.register.to_be_bytes();
        let len = usize::from(self.mantissa_len).min(MAX_MANTISSA_LEN);
        let mut body = Vec::with_capacity(RESPONSE_HEADER_LEN + len);
        body.extend_from_slice(&[
            DESTINATION,
            CMD_GET_REGISTER,
            hi,
            lo,
            self.unit.0,
            len as u8,
            self.exponent_byte,
        ]);
        body.extend_from_slice(&self.mantissa.to_be_bytes()[MAX_MANTISSA_LEN - len..]);
        body
    }

    /// Complete wire frame as the meter would send it
    pub fn to_frame(&self) -> Vec<u8> {
        framing::encode_frame(START_RESPONSE, &self.to_body())
    }
}

/// Decode and verify a raw response frame for `expected`
///
/// `raw` is what the accumulator returns: start markers stripped, terminator
/// excluded, still escaped.
pub fn parse_read_response(raw: &[u8], expected: RegisterId) -> Result<ReadResponse, DecodeError> {
    let msg = framing::unescape(raw);

    let residue = checksum::crc16(&msg);
    if residue != 0 {
        return Err(DecodeError::Integrity { residue });
    }

    if msg.len() < 4 + CRC_LEN {
        return Err(DecodeError::Truncated {
            len: msg.len(),
            needed: RESPONSE_HEADER_LEN + CRC_LEN,
        });
    }

    let found = [msg[0], msg[1], msg[2], msg[3]];
    let [hi, lo] = expected.to_be_bytes();
    if found != [DESTINATION, CMD_GET_REGISTER, hi, lo] {
        return Err(DecodeError::HeaderMismatch { expected, found });
    }

    if msg.len() < RESPONSE_HEADER_LEN + CRC_LEN {
        return Err(DecodeError::Truncated {
            len: msg.len(),
            needed: RESPONSE_HEADER_LEN + CRC_LEN,
        });
    }

    let unit = UnitCode(msg[4]);
    let mantissa_len = msg[5];
    let exponent_byte = msg[6];
    let len = usize::from(mantissa_len);

    if len > MAX_MANTISSA_LEN {
        return Err(DecodeError::MantissaTooLong(len));
    }
    let needed = RESPONSE_HEADER_LEN + len + CRC_LEN;
    if msg.len() < needed {
        return Err(DecodeError::Truncated {
            len: msg.len(),
            needed,
        });
    }

    let mantissa = msg[RESPONSE_HEADER_LEN..RESPONSE_HEADER_LEN + len]
        .iter()
        .fold(0u64, |acc, &b| (acc << 8) | u64::from(b));

    let response = ReadResponse {
        register: expected,
        unit,
        mantissa,
        mantissa_len,
        exponent_byte,
    };
    debug!(
        "Decoded {}: mantissa={} exp=0x{:02x} unit={} -> {}",
        expected, mantissa, exponent_byte, unit, response.value()
    );
    Ok(response)
}
