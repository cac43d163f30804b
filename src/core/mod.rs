//! Core module containing the meter driver
//!
//! This module provides:
//! - Protocol codec (CRC, escaping, read-register frames)
//! - Register catalog and result store
//! - Transport to the optical head
//! - Non-blocking polling state machine
//! - Publishing to metric sinks
//! - Virtual meter for tests and dry runs

pub mod clock;
pub mod driver;
pub mod poller;
pub mod protocol;
pub mod publish;
pub mod registers;
pub mod simulator;
pub mod store;
pub mod transport;
