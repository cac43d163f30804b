//! Serial port transport implementation

use super::{MeterLink, TransportError, TransportStats};
use serde::{Deserialize, Serialize};
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::time::Duration;
use tracing::trace;

/// Serial port parity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerialParity {
    /// No parity
    #[default]
    None,
    /// Odd parity
    Odd,
    /// Even parity
    Even,
}

impl std::str::FromStr for SerialParity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" | "n" => Ok(Self::None),
            "odd" | "o" => Ok(Self::Odd),
            "even" | "e" => Ok(Self::Even),
            other => Err(format!("unknown parity: {other}")),
        }
    }
}

/// Serial port configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Port name (e.g., COM3, /dev/ttyUSB0)
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Data bits (5, 6, 7, 8)
    pub data_bits: u8,
    /// Stop bits (1, 2)
    pub stop_bits: u8,
    /// Parity
    pub parity: SerialParity,
}

impl SerialConfig {
    /// Kamstrup optical defaults (9600 8N2) on `port`
    pub fn new(port: &str, baud_rate: u32) -> Self {
        Self {
            port: port.to_string(),
            baud_rate,
            data_bits: 8,
            stop_bits: 2,
            parity: SerialParity::None,
        }
    }

    /// Set data bits
    #[must_use]
    pub fn data_bits(mut self, bits: u8) -> Self {
        self.data_bits = bits;
        self
    }

    /// Set stop bits
    #[must_use]
    pub fn stop_bits(mut self, bits: u8) -> Self {
        self.stop_bits = bits;
        self
    }

    /// Set parity
    #[must_use]
    pub fn parity(mut self, parity: SerialParity) -> Self {
        self.parity = parity;
        self
    }

    /// Time needed to shift `bytes` characters out of the UART
    ///
    /// Counts the start bit, data bits, optional parity bit and stop bits.
    pub fn transmit_time(&self, bytes: usize) -> Duration {
        if self.baud_rate == 0 {
            return Duration::ZERO;
        }
        let parity = u64::from(self.parity != SerialParity::None);
        let bits_per_char = 1 + u64::from(self.data_bits) + parity + u64::from(self.stop_bits);
        let micros = bytes as u64 * bits_per_char * 1_000_000 / u64::from(self.baud_rate);
        Duration::from_micros(micros)
    }

    fn line_settings(&self) -> Result<(DataBits, StopBits, Parity), TransportError> {
        let data_bits = match self.data_bits {
            5 => DataBits::Five,
            6 => DataBits::Six,
            7 => DataBits::Seven,
            8 => DataBits::Eight,
            other => {
                return Err(TransportError::InvalidSettings(format!("{other} data bits")));
            }
        };

        let stop_bits = match self.stop_bits {
            1 => StopBits::One,
            2 => StopBits::Two,
            other => {
                return Err(TransportError::InvalidSettings(format!("{other} stop bits")));
            }
        };

        let parity = match self.parity {
            SerialParity::Odd => Parity::Odd,
            SerialParity::Even => Parity::Even,
            SerialParity::None => Parity::None,
        };

        Ok((data_bits, stop_bits, parity))
    }

    /// Short description, e.g. `/dev/ttyUSB0 @ 9600 baud (8N2)`
    pub fn describe(&self) -> String {
        format!(
            "{} @ {} baud ({}{}{})",
            self.port,
            self.baud_rate,
            self.data_bits,
            match self.parity {
                SerialParity::None => "N",
                SerialParity::Odd => "O",
                SerialParity::Even => "E",
            },
            self.stop_bits,
        )
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        let port = if cfg!(windows) { "COM3" } else { "/dev/ttyUSB0" };
        Self::new(port, 9600)
    }
}

/// Serial port link to the IR read head
pub struct SerialLink {
    config: SerialConfig,
    port: Box<dyn SerialPort>,
    rx: VecDeque<u8>,
    stats: TransportStats,
}

impl SerialLink {
    /// Open the port described by `config`
    pub fn open(config: SerialConfig) -> Result<Self, TransportError> {
        let (data_bits, stop_bits, parity) = config.line_settings()?;

        let port = serialport::new(&config.port, config.baud_rate)
            .data_bits(data_bits)
            .stop_bits(stop_bits)
            .parity(parity)
            .flow_control(FlowControl::None)
            .timeout(Duration::from_millis(10))
            .open()
            .map_err(|e| match e.kind() {
                serialport::ErrorKind::NoDevice => TransportError::PortNotFound(config.port.clone()),
                serialport::ErrorKind::Io(std::io::ErrorKind::PermissionDenied) => {
                    TransportError::PermissionDenied(config.port.clone())
                }
                _ => TransportError::ConnectionFailed(e.to_string()),
            })?;

        Ok(Self {
            config,
            port,
            rx: VecDeque::with_capacity(64),
            stats: TransportStats::default(),
        })
    }

    /// Port configuration
    pub fn config(&self) -> &SerialConfig {
        &self.config
    }

    /// Byte counters since the port was opened
    pub fn stats(&self) -> TransportStats {
        self.stats
    }

    /// Move whatever the driver has buffered into `rx` without waiting
    fn fill(&mut self) -> Result<(), TransportError> {
        let pending = self.port.bytes_to_read().map_err(|e| TransportError::IoError(e.into()))?;
        if pending == 0 {
            return Ok(());
        }
        let mut buf = vec![0u8; pending as usize];
        match self.port.read(&mut buf) {
            Ok(0) => Err(TransportError::Disconnected),
            Ok(n) => {
                self.rx.extend(&buf[..n]);
                self.stats.bytes_received += n as u64;
                trace!("RX {}", hex::encode(&buf[..n]));
                Ok(())
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(()),
            Err(e) => Err(TransportError::IoError(e)),
        }
    }
}

impl MeterLink for SerialLink {
    fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.port.write_all(data)?;
        // Drains the transmitter, blocking for the frame's wire time
        self.port.flush()?;
        self.stats.bytes_sent += data.len() as u64;
        trace!(
            "TX {} ({} us on the wire)",
            hex::encode(data),
            self.config.transmit_time(data.len()).as_micros()
        );
        Ok(())
    }

    fn available(&mut self) -> Result<bool, TransportError> {
        if self.rx.is_empty() {
            self.fill()?;
        }
        Ok(!self.rx.is_empty())
    }

    fn read(&mut self) -> Result<u8, TransportError> {
        self.rx.pop_front().ok_or(TransportError::NoData)
    }

    fn flush(&mut self) -> Result<(), TransportError> {
        self.stats.bytes_discarded += self.rx.len() as u64;
        self.rx.clear();
        self.port
            .clear(ClearBuffer::Input)
            .map_err(|e| TransportError::IoError(e.into()))
    }
}

/// List available serial ports
pub fn list_ports() -> Result<Vec<serialport::SerialPortInfo>, TransportError> {
    serialport::available_ports().map_err(|e| TransportError::IoError(e.into()))
}
