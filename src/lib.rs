//! # Kamstrup Optical Core Library
//!
//! Polls a Kamstrup 382-class energy meter over its optical (IR) eye, one
//! register at a time, and publishes the readings:
//! - CRC-16 framing with byte stuffing
//! - Read-register request/response codec
//! - Non-blocking sweep state machine with pacing, retries and timeouts
//! - Serial port transport and an in-memory virtual meter
//! - Metric sinks (tracing, text/JSON/CSV writers, `metrics` gauges)
//!
//! ## Example
//!
//! ```rust,no_run
//! use kamstrup_core::{
//!     MeterDriver, PollConfig, Poller, RegisterCatalog, SerialConfig, SerialLink, SystemClock,
//!     TracingSink,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let link = SerialLink::open(SerialConfig::new("/dev/ttyUSB0", 9600))?;
//!     let poller = Poller::new(link, SystemClock::new(), RegisterCatalog::default(), PollConfig::default());
//!     let mut driver = MeterDriver::new(poller, 60_000);
//!
//!     let shutdown = async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     };
//!     let summary = driver.run(&mut TracingSink, shutdown).await;
//!     println!("{} sweeps", summary.stats.sweeps_completed);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod cli;
pub mod config;
pub mod core;

// Re-exports for convenience
pub use crate::cli::{CliResult, ExitCodes};
pub use crate::config::{AppConfig, ConfigError};
pub use crate::core::clock::{Clock, ManualClock, SystemClock};
pub use crate::core::driver::{MeterDriver, SweepSummary};
pub use crate::core::poller::{PollConfig, PollEvent, PollFailure, PollState, PollStats, Poller};
pub use crate::core::protocol::{DecodeError, FrameError, ReadResponse};
pub use crate::core::publish::{
    CollectingSink, FanoutSink, MetricSink, MetricsSink, PublishFormat, Reading, TracingSink,
    WriterSink,
};
pub use crate::core::registers::{
    CatalogPreset, RegisterCatalog, RegisterDescriptor, RegisterId, UnitCode,
};
pub use crate::core::simulator::{ErrorInjectionConfig, Fault, VirtualMeter};
pub use crate::core::store::{MeterValue, ResultStore};
pub use crate::core::transport::{MeterLink, SerialConfig, SerialLink, TransportError};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
