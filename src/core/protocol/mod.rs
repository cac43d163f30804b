//! Kamstrup optical protocol
//!
//! - CRC-16 (CCITT polynomial, zero init, augmented)
//! - Byte stuffing and frame delimiting
//! - Read-register request/response codec

pub mod checksum;
pub mod framing;
pub mod kamstrup;

pub use checksum::{append_crc, crc16};
pub use framing::{encode_frame, FrameAccumulator, FrameError};
pub use kamstrup::{build_read_request, parse_read_response, DecodeError, ReadResponse};
