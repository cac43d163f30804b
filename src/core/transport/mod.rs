//! Transport layer for the optical head
//!
//! The poller talks to a half-duplex byte channel through [`MeterLink`]:
//! - Serial ports (IR read head on USB-serial or UART)
//! - The in-memory virtual meter (tests, `simulate` command)

mod serial;

pub use serial::{list_ports, SerialConfig, SerialLink, SerialParity};

use thiserror::Error;

/// Transport error types
#[derive(Error, Debug)]
pub enum TransportError {
    /// Port not found
    #[error("Port not found: {0}")]
    PortNotFound(String),

    /// Permission denied
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Opening the port failed for another reason
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Line settings the port cannot be opened with
    #[error("Unsupported line settings: {0}")]
    InvalidSettings(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// `read` called with nothing pending
    #[error("No data available")]
    NoData,

    /// Link closed
    #[error("Disconnected")]
    Disconnected,
}

/// Transport statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    /// Bytes sent
    pub bytes_sent: u64,
    /// Bytes received
    pub bytes_received: u64,
    /// Bytes thrown away by `flush`
    pub bytes_discarded: u64,
}

/// Half-duplex byte channel to the meter
///
/// The poller calls these from its cooperative tick. `available`, `read` and
/// `flush` must not block for longer than a single byte time. `write` returns
/// once the frame is on the wire, which takes
/// [`SerialConfig::transmit_time`] for a serial link (about 11 ms for a
/// request at 9600 8N2).
#[cfg_attr(test, mockall::automock)]
pub trait MeterLink {
    /// Transmit a complete frame
    fn write(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Whether a byte can be read without waiting
    fn available(&mut self) -> Result<bool, TransportError>;

    /// Take the next received byte; only valid after `available` returned true
    fn read(&mut self) -> Result<u8, TransportError>;

    /// Discard everything received but not yet read
    fn flush(&mut self) -> Result<(), TransportError>;
}

impl<L: MeterLink + ?Sized> MeterLink for Box<L> {
    fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        (**self).write(data)
    }

    fn available(&mut self) -> Result<bool, TransportError> {
        (**self).available()
    }

    fn read(&mut self) -> Result<u8, TransportError> {
        (**self).read()
    }

    fn flush(&mut self) -> Result<(), TransportError> {
        (**self).flush()
    }
}
