//! Register sweep state machine
//!
//! Walks the register catalog one request at a time over a half-duplex link.
//! Every call to [`Poller::tick`] performs at most one transition and never
//! blocks: waiting is done by comparing the clock against timestamps taken
//! when a state was entered.
//!
//! ```text
//!   Idle --period--> Pacing --delay--> Sending --> AwaitingResponse
//!                      ^                                 |
//!                      +------ value / retry / skip -----+
//!                                                        |
//!   Idle <-------------- SweepComplete <-- last register-+
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::core::clock::Clock;
use crate::core::protocol::framing::{FrameAccumulator, FrameError};
use crate::core::protocol::kamstrup::{build_read_request, parse_read_response, DecodeError};
use crate::core::registers::{RegisterCatalog, RegisterId};
use crate::core::store::ResultStore;
use crate::core::transport::{MeterLink, TransportError};

/// Poller state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PollState {
    /// Sweep inactive, waiting for the sweep period
    Idle,
    /// Sweep active, waiting out the inter-request delay
    Pacing,
    /// About to transmit a request
    Sending,
    /// Request sent, collecting the answer
    AwaitingResponse,
    /// Last register handled; returns to Idle on the next tick
    SweepComplete,
}

impl PollState {
    /// Check if a sweep is in progress
    pub fn is_sweeping(&self) -> bool {
        matches!(self, Self::Pacing | Self::Sending | Self::AwaitingResponse)
    }

    /// Check if the link is owned by an outstanding request
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::AwaitingResponse)
    }
}

/// Timing and retry settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    /// Failed attempts allowed on one register before it is skipped
    pub retry_limit: u32,
    /// Time to wait for a complete answer
    pub response_timeout_ms: u64,
    /// Delay between consecutive requests
    pub pacing_ms: u64,
    /// Time between sweep starts
    pub sweep_period_ms: u64,
    /// Scheduler tick used by the driver loop
    pub tick_ms: u64,
    /// Let timeouts consume the retry budget instead of skipping at once
    pub retry_on_timeout: bool,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            retry_limit: 3,
            response_timeout_ms: 500,
            pacing_ms: 500,
            sweep_period_ms: 60_000,
            tick_ms: 5,
            retry_on_timeout: false,
        }
    }
}

/// Why an attempt produced no value
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PollFailure {
    /// Frame arrived but did not decode
    #[error("{0}")]
    Decode(#[from] DecodeError),
    /// Receiver buffer filled up before a terminator
    #[error("{0}")]
    Overflow(#[from] FrameError),
    /// No complete frame in time
    #[error("No response within {0} ms")]
    Timeout(u64),
    /// Link reported an error
    #[error("Transport error: {0}")]
    Transport(String),
}

impl From<TransportError> for PollFailure {
    fn from(err: TransportError) -> Self {
        Self::Transport(err.to_string())
    }
}

/// What a tick did
#[derive(Debug, Clone, PartialEq)]
pub enum PollEvent {
    /// Nothing worth reporting (waiting, pacing, partial frame)
    None,
    /// A new sweep was armed
    SweepStarted,
    /// Request transmitted
    RequestSent {
        /// Catalog index
        index: usize,
        /// Register asked for
        register: RegisterId,
    },
    /// Verified value stored
    ValueStored {
        /// Catalog index
        index: usize,
        /// Register read
        register: RegisterId,
        /// Decoded reading
        value: f64,
    },
    /// Attempt failed, the same register will be asked again
    AttemptFailed {
        /// Catalog index
        index: usize,
        /// Register concerned
        register: RegisterId,
        /// Cause
        failure: PollFailure,
        /// Failed attempts so far on this register
        retries: u32,
    },
    /// Register left without a value for this sweep
    RegisterSkipped {
        /// Catalog index
        index: usize,
        /// Register concerned
        register: RegisterId,
        /// Cause of the last failure
        failure: PollFailure,
    },
    /// Every register was visited
    SweepCompleted {
        /// Registers holding a valid value
        valid: usize,
        /// Catalog size
        total: usize,
    },
}

/// Poller statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollStats {
    /// Requests transmitted
    pub requests_sent: u64,
    /// Values stored
    pub values_stored: u64,
    /// Frames rejected by the decoder
    pub decode_failures: u64,
    /// Receive buffer overflows
    pub overflows: u64,
    /// Responses that never completed
    pub timeouts: u64,
    /// Link errors
    pub transport_errors: u64,
    /// Registers skipped without a value
    pub registers_skipped: u64,
    /// Sweeps finished
    pub sweeps_completed: u64,
}

/// Sweep state machine over one link
pub struct Poller<L, C> {
    link: L,
    clock: C,
    catalog: RegisterCatalog,
    config: PollConfig,
    store: ResultStore,
    accumulator: FrameAccumulator,
    state: PollState,
    index: usize,
    retries: u32,
    sweep_active: bool,
    last_sweep_start: Option<u64>,
    state_since: u64,
    sent_at: u64,
    stats: PollStats,
}

impl<L: MeterLink, C: Clock> Poller<L, C> {
    /// Create a poller; the first sweep starts on the first tick
    pub fn new(link: L, clock: C, catalog: RegisterCatalog, config: PollConfig) -> Self {
        let store = ResultStore::new(catalog.len());
        let now = clock.now_ms();
        Self {
            link,
            clock,
            catalog,
            config,
            store,
            accumulator: FrameAccumulator::new(),
            state: PollState::Idle,
            index: 0,
            retries: 0,
            sweep_active: false,
            last_sweep_start: None,
            state_since: now,
            sent_at: now,
            stats: PollStats::default(),
        }
    }

    /// Get current state
    pub fn state(&self) -> PollState {
        self.state
    }

    /// Catalog index of the register being polled
    pub fn current_index(&self) -> usize {
        self.index
    }

    /// Failed attempts on the current register
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Whether a sweep is armed
    pub fn is_sweep_active(&self) -> bool {
        self.sweep_active
    }

    /// Latest values
    pub fn store(&self) -> &ResultStore {
        &self.store
    }

    /// Registers being polled
    pub fn catalog(&self) -> &RegisterCatalog {
        &self.catalog
    }

    /// Timing and retry settings
    pub fn config(&self) -> &PollConfig {
        &self.config
    }

    /// Counters since creation
    pub fn stats(&self) -> PollStats {
        self.stats
    }

    /// The clock driving this poller
    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Borrow the link
    pub fn link(&self) -> &L {
        &self.link
    }

    /// Mutably borrow the link
    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    /// Run one scheduling step
    pub fn tick(&mut self) -> PollEvent {
        let now = self.clock.now_ms();

        match self.state {
            PollState::Idle => {
                if self.sweep_due(now) {
                    self.start_sweep(now)
                } else {
                    PollEvent::None
                }
            }
            PollState::Pacing => {
                if self.clock.elapsed_ms(self.state_since) >= self.config.pacing_ms {
                    self.enter(PollState::Sending, now);
                }
                PollEvent::None
            }
            PollState::Sending => self.send_request(now),
            PollState::AwaitingResponse => self.receive(),
            PollState::SweepComplete => self.finish_sweep(now),
        }
    }

    fn sweep_due(&self, now: u64) -> bool {
        match self.last_sweep_start {
            None => true,
            Some(start) => now.saturating_sub(start) >= self.config.sweep_period_ms,
        }
    }

    fn enter(&mut self, state: PollState, now: u64) {
        if state != self.state {
            debug!("Poll state {:?} -> {:?}", self.state, state);
        }
        self.state = state;
        self.state_since = now;
    }

    fn current_register(&self) -> RegisterId {
        self.catalog
            .get(self.index)
            .map(|d| d.id)
            .unwrap_or(RegisterId(0))
    }

    fn start_sweep(&mut self, now: u64) -> PollEvent {
        self.sweep_active = true;
        self.last_sweep_start = Some(now);
        info!("Starting sweep over {} registers", self.catalog.len());
        self.enter(PollState::Pacing, now);
        PollEvent::SweepStarted
    }

    fn finish_sweep(&mut self, now: u64) -> PollEvent {
        self.sweep_active = false;
        self.index = 0;
        self.stats.sweeps_completed += 1;
        let valid = self.store.valid_count();
        let total = self.catalog.len();
        info!(
            "Sweep complete: {}/{} registers valid (requests={}, failures={}, timeouts={}, skipped={})",
            valid,
            total,
            self.stats.requests_sent,
            self.stats.decode_failures + self.stats.overflows + self.stats.transport_errors,
            self.stats.timeouts,
            self.stats.registers_skipped,
        );
        self.enter(PollState::Idle, now);
        PollEvent::SweepCompleted { valid, total }
    }

    fn send_request(&mut self, now: u64) -> PollEvent {
        let register = self.current_register();
        let label = self.catalog.get(self.index).map_or("", |d| d.label.as_str());
        debug!("Querying register index {} - {} - {}", self.index, label, register);

        let frame = build_read_request(register);
        self.accumulator.clear();
        if let Err(e) = self.link.write(&frame) {
            return self.attempt_failed(e.into(), now);
        }
        // Drop noise and the optical echo of our own request
        if let Err(e) = self.link.flush() {
            warn!("Failed to clear input after request: {}", e);
        }

        self.stats.requests_sent += 1;
        self.sent_at = now;
        self.enter(PollState::AwaitingResponse, now);
        PollEvent::RequestSent {
            index: self.index,
            register,
        }
    }

    fn receive(&mut self) -> PollEvent {
        let now = self.clock.now_ms();

        if self.clock.elapsed_ms(self.sent_at) > self.config.response_timeout_ms {
            self.accumulator.clear();
            return self.timed_out(now);
        }

        match self.link.available() {
            Ok(true) => {}
            Ok(false) => return PollEvent::None,
            Err(e) => return self.attempt_failed(e.into(), now),
        }
        let byte = match self.link.read() {
            Ok(byte) => byte,
            Err(e) => return self.attempt_failed(e.into(), now),
        };

        match self.accumulator.push(byte) {
            Ok(None) => PollEvent::None,
            Ok(Some(raw)) => {
                let register = self.current_register();
                match parse_read_response(&raw, register) {
                    Ok(response) => self.value_received(response.value(), now),
                    Err(e) => self.attempt_failed(e.into(), now),
                }
            }
            Err(e) => {
                if let Err(flush_err) = self.link.flush() {
                    warn!("Failed to clear input after overflow: {}", flush_err);
                }
                self.attempt_failed(e.into(), now)
            }
        }
    }

    fn value_received(&mut self, value: f64, now: u64) -> PollEvent {
        let index = self.index;
        let register = self.current_register();
        self.store.set(index, value);
        self.stats.values_stored += 1;
        if let Some(desc) = self.catalog.get(index) {
            debug!("Value logged successfully - {} - {}", desc.label, value);
        }
        self.advance(now);
        PollEvent::ValueStored {
            index,
            register,
            value,
        }
    }

    fn attempt_failed(&mut self, failure: PollFailure, now: u64) -> PollEvent {
        match &failure {
            PollFailure::Decode(_) => self.stats.decode_failures += 1,
            PollFailure::Overflow(_) => self.stats.overflows += 1,
            PollFailure::Timeout(_) => self.stats.timeouts += 1,
            PollFailure::Transport(_) => self.stats.transport_errors += 1,
        }

        let index = self.index;
        let register = self.current_register();
        self.retries += 1;

        if self.retries > self.config.retry_limit {
            warn!(
                "Giving up on register {} after {} failed attempts: {}",
                register, self.retries, failure
            );
            self.skip(now);
            return PollEvent::RegisterSkipped {
                index,
                register,
                failure,
            };
        }

        warn!(
            "Attempt {} on register {} failed: {}",
            self.retries, register, failure
        );
        self.enter(PollState::Pacing, now);
        PollEvent::AttemptFailed {
            index,
            register,
            failure,
            retries: self.retries,
        }
    }

    fn timed_out(&mut self, now: u64) -> PollEvent {
        let failure = PollFailure::Timeout(self.config.response_timeout_ms);
        if self.config.retry_on_timeout {
            return self.attempt_failed(failure, now);
        }

        self.stats.timeouts += 1;
        let index = self.index;
        let register = self.current_register();
        debug!("Timed out listening for register {}", register);
        self.skip(now);
        PollEvent::RegisterSkipped {
            index,
            register,
            failure,
        }
    }

    fn skip(&mut self, now: u64) {
        self.stats.registers_skipped += 1;
        self.advance(now);
    }

    fn advance(&mut self, now: u64) {
        self.retries = 0;
        self.index += 1;
        if self.index >= self.catalog.len() {
            self.index = 0;
            self.enter(PollState::SweepComplete, now);
        } else {
            self.enter(PollState::Pacing, now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use crate::core::registers::RegisterDescriptor;
    use crate::core::transport::MockMeterLink;

    fn catalog(ids: &[u16]) -> RegisterCatalog {
        RegisterCatalog::new(
            ids.iter()
                .map(|&id| RegisterDescriptor::new(id, &format!("R{id}"), None))
                .collect(),
        )
        .unwrap()
    }

    #[test]
    fn test_first_tick_starts_sweep_then_paces() {
        let clock = ManualClock::new();
        let link = MockMeterLink::new();
        let mut poller = Poller::new(link, clock.clone(), catalog(&[1]), PollConfig::default());

        assert_eq!(poller.tick(), PollEvent::SweepStarted);
        assert_eq!(poller.state(), PollState::Pacing);
        assert!(poller.is_sweep_active());

        clock.advance(499);
        assert_eq!(poller.tick(), PollEvent::None);
        assert_eq!(poller.state(), PollState::Pacing);

        clock.advance(1);
        poller.tick();
        assert_eq!(poller.state(), PollState::Sending);
    }

    #[test]
    fn test_send_writes_request_then_flushes() {
        let clock = ManualClock::new();
        let mut link = MockMeterLink::new();
        let mut seq = mockall::Sequence::new();
        let expected = build_read_request(RegisterId(0x041e));
        link.expect_write()
            .withf(move |data| data == expected.as_slice())
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        link.expect_flush()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(()));

        let config = PollConfig {
            pacing_ms: 0,
            ..Default::default()
        };
        let mut poller = Poller::new(link, clock, catalog(&[0x041e]), config);
        poller.tick();
        poller.tick();
        assert_eq!(
            poller.tick(),
            PollEvent::RequestSent {
                index: 0,
                register: RegisterId(0x041e)
            }
        );
        assert_eq!(poller.state(), PollState::AwaitingResponse);
        assert_eq!(poller.stats().requests_sent, 1);
    }

    #[test]
    fn test_write_error_counts_as_failed_attempt() {
        let clock = ManualClock::new();
        let mut link = MockMeterLink::new();
        link.expect_write()
            .returning(|_| Err(TransportError::Disconnected));

        let config = PollConfig {
            pacing_ms: 0,
            ..Default::default()
        };
        let mut poller = Poller::new(link, clock, catalog(&[1, 2]), config);
        poller.tick();
        poller.tick();
        match poller.tick() {
            PollEvent::AttemptFailed { failure, retries, .. } => {
                assert_eq!(failure, PollFailure::Transport("Disconnected".into()));
                assert_eq!(retries, 1);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(poller.state(), PollState::Pacing);
        assert_eq!(poller.current_index(), 0);
        assert_eq!(poller.stats().transport_errors, 1);
    }

    #[test]
    fn test_timeout_skips_without_consulting_retries() {
        let clock = ManualClock::new();
        let mut link = MockMeterLink::new();
        link.expect_write().returning(|_| Ok(()));
        link.expect_flush().returning(|| Ok(()));
        link.expect_available().returning(|| Ok(false));

        let config = PollConfig {
            pacing_ms: 0,
            ..Default::default()
        };
        let mut poller = Poller::new(link, clock.clone(), catalog(&[1, 2]), config);
        poller.tick();
        poller.tick();
        poller.tick();

        clock.advance(500);
        assert_eq!(poller.tick(), PollEvent::None);

        clock.advance(1);
        assert_eq!(
            poller.tick(),
            PollEvent::RegisterSkipped {
                index: 0,
                register: RegisterId(1),
                failure: PollFailure::Timeout(500),
            }
        );
        assert_eq!(poller.current_index(), 1);
        assert_eq!(poller.retries(), 0);
        assert_eq!(poller.stats().timeouts, 1);
    }

    #[test]
    fn test_retry_on_timeout_uses_budget() {
        let clock = ManualClock::new();
        let mut link = MockMeterLink::new();
        link.expect_write().returning(|_| Ok(()));
        link.expect_flush().returning(|| Ok(()));
        link.expect_available().returning(|| Ok(false));

        let config = PollConfig {
            pacing_ms: 0,
            retry_limit: 1,
            retry_on_timeout: true,
            ..Default::default()
        };
        let mut poller = Poller::new(link, clock.clone(), catalog(&[1, 2]), config);
        poller.tick();
        poller.tick();
        poller.tick();
        clock.advance(501);
        assert!(matches!(poller.tick(), PollEvent::AttemptFailed { retries: 1, .. }));
        assert_eq!(poller.current_index(), 0);

        poller.tick();
        poller.tick();
        clock.advance(501);
        assert!(matches!(poller.tick(), PollEvent::RegisterSkipped { index: 0, .. }));
        assert_eq!(poller.current_index(), 1);
    }

    #[test]
    fn test_state_helpers() {
        assert!(PollState::AwaitingResponse.is_busy());
        assert!(PollState::Pacing.is_sweeping());
        assert!(!PollState::Idle.is_sweeping());
        assert!(!PollState::SweepComplete.is_busy());
    }
}
