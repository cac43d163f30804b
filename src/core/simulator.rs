//! Virtual meter
//!
//! An in-memory [`MeterLink`] that answers read-register requests the way a
//! Kamstrup meter does. Faults can be scripted per response (deterministic, for
//! tests) or injected with a probability (for the `simulate` command).

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tracing::debug;

use crate::core::protocol::framing::{END, ESC, MAX_FRAME_LEN, START_REQUEST, START_RESPONSE};
use crate::core::protocol::kamstrup::{parse_read_request, ReadResponse};
use crate::core::registers::{RegisterCatalog, RegisterId, UnitCode};
use crate::core::transport::{MeterLink, TransportError};

/// What happens to one response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Fault {
    /// Answer normally
    None,
    /// Flip a bit in the CRC trailer
    CorruptCrc,
    /// Do not answer at all
    Drop,
    /// Answer with a frame that echoes another register
    WrongRegister,
    /// Line noise ahead of an otherwise valid frame
    GarbagePrefix,
    /// Stream junk without a terminator until the receiver overflows
    Overflow,
}

/// Probabilistic fault injection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInjectionConfig {
    /// Enable error injection
    pub enabled: bool,
    /// Probability of a corrupted CRC (0.0 - 1.0)
    pub corruption_probability: f32,
    /// Probability of no answer (0.0 - 1.0)
    pub drop_probability: f32,
    /// Probability of noise ahead of the frame (0.0 - 1.0)
    pub garbage_probability: f32,
    /// Probability of an unterminated junk stream (0.0 - 1.0)
    pub overflow_probability: f32,
    /// RNG seed, for reproducible runs
    pub seed: u64,
}

impl Default for ErrorInjectionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            corruption_probability: 0.0,
            drop_probability: 0.0,
            garbage_probability: 0.0,
            overflow_probability: 0.0,
            seed: 0x4B41_4D53,
        }
    }
}

/// Picks a fault for each response
struct ErrorInjector {
    config: ErrorInjectionConfig,
    rng: StdRng,
}

impl ErrorInjector {
    fn new(config: ErrorInjectionConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self { config, rng }
    }

    fn pick(&mut self) -> Fault {
        if !self.config.enabled {
            return Fault::None;
        }
        let roll: f32 = self.rng.gen();
        let mut threshold = self.config.drop_probability;
        if roll < threshold {
            return Fault::Drop;
        }
        threshold += self.config.corruption_probability;
        if roll < threshold {
            return Fault::CorruptCrc;
        }
        threshold += self.config.garbage_probability;
        if roll < threshold {
            return Fault::GarbagePrefix;
        }
        threshold += self.config.overflow_probability;
        if roll < threshold {
            return Fault::Overflow;
        }
        Fault::None
    }
}

/// Simulated meter on the far side of the optical link
pub struct VirtualMeter {
    registers: HashMap<RegisterId, ReadResponse>,
    request: Vec<u8>,
    in_request: bool,
    pending: Option<Vec<u8>>,
    rx: VecDeque<u8>,
    script: VecDeque<Fault>,
    injector: ErrorInjector,
    requests: Vec<RegisterId>,
}

impl Default for VirtualMeter {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualMeter {
    /// Meter with no registers; every request goes unanswered
    pub fn new() -> Self {
        Self {
            registers: HashMap::new(),
            request: Vec::with_capacity(16),
            in_request: false,
            pending: None,
            rx: VecDeque::new(),
            script: VecDeque::new(),
            injector: ErrorInjector::new(ErrorInjectionConfig::default()),
            requests: Vec::new(),
        }
    }

    /// Meter that answers every register of `catalog` with plausible values
    pub fn with_catalog(catalog: &RegisterCatalog) -> Self {
        let mut meter = Self::new();
        for (i, desc) in catalog.iter().enumerate() {
            let mantissa = 1000 + 37 * i as u64;
            let (unit, exponent) = match desc.unit.as_deref() {
                Some("kWh") => (UnitCode(2), -2),
                Some("V") => (UnitCode(0), 0),
                Some("A") => (UnitCode(0), -2),
                _ => (UnitCode(0), -3),
            };
            meter.set_register(ReadResponse::new(desc.id, unit, mantissa, exponent, false));
        }
        meter
    }

    /// Set or replace the answer for one register
    pub fn set_register(&mut self, response: ReadResponse) {
        self.registers.insert(response.register, response);
    }

    /// Convenience: answer `register` with `mantissa × 10^exponent`
    pub fn set_value(&mut self, register: RegisterId, mantissa: u64, exponent: i8) {
        self.set_register(ReadResponse::new(register, UnitCode(0), mantissa, exponent, false));
    }

    /// Queue faults for the next responses, in order
    pub fn script<I: IntoIterator<Item = Fault>>(&mut self, faults: I) {
        self.script.extend(faults);
    }

    /// Enable probabilistic faults
    pub fn inject_errors(&mut self, config: ErrorInjectionConfig) {
        self.injector = ErrorInjector::new(config);
    }

    /// Registers requested so far, in order
    pub fn requests(&self) -> &[RegisterId] {
        &self.requests
    }

    fn next_fault(&mut self) -> Fault {
        self.script.pop_front().unwrap_or_else(|| self.injector.pick())
    }

    fn handle_request(&mut self, raw: &[u8]) {
        let register = match parse_read_request(raw) {
            Ok(register) => register,
            Err(e) => {
                debug!("Virtual meter ignoring request: {}", e);
                return;
            }
        };
        self.requests.push(register);

        let Some(response) = self.registers.get(&register).copied() else {
            debug!("Virtual meter has no register {}", register);
            return;
        };

        let fault = self.next_fault();
        debug!("Virtual meter answering {} with fault {:?}", register, fault);
        self.pending = match fault {
            Fault::None => Some(response.to_frame()),
            Fault::Drop => None,
            Fault::CorruptCrc => {
                let mut frame = response.to_frame();
                // Last byte before END is the (possibly escaped) CRC low byte
                let pos = frame.len() - 2;
                frame[pos] ^= 0x01;
                if matches!(frame[pos], END | START_RESPONSE | ESC) {
                    frame[pos] ^= 0x03;
                }
                Some(frame)
            }
            Fault::WrongRegister => {
                let other = RegisterId(register.0.wrapping_add(1));
                Some(ReadResponse { register: other, ..response }.to_frame())
            }
            Fault::GarbagePrefix => {
                let mut frame = vec![0x55, 0xaa, 0x01];
                frame.extend(response.to_frame());
                Some(frame)
            }
            Fault::Overflow => {
                let mut junk = vec![START_RESPONSE];
                junk.extend(std::iter::repeat(0x55).take(MAX_FRAME_LEN + 10));
                Some(junk)
            }
        };
    }
}

impl MeterLink for VirtualMeter {
    fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        for &byte in data {
            match byte {
                START_REQUEST => {
                    self.request.clear();
                    self.in_request = true;
                }
                END if self.in_request => {
                    self.in_request = false;
                    let raw = std::mem::take(&mut self.request);
                    self.handle_request(&raw);
                }
                _ if self.in_request => self.request.push(byte),
                _ => {}
            }
        }
        Ok(())
    }

    fn available(&mut self) -> Result<bool, TransportError> {
        // The answer arrives after the sender has cleared its input
        if self.rx.is_empty() {
            if let Some(frame) = self.pending.take() {
                self.rx.extend(frame);
            }
        }
        Ok(!self.rx.is_empty())
    }

    fn read(&mut self) -> Result<u8, TransportError> {
        self.rx.pop_front().ok_or(TransportError::NoData)
    }

    fn flush(&mut self) -> Result<(), TransportError> {
        self.rx.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protocol::framing::FrameAccumulator;
    use crate::core::protocol::kamstrup::{build_read_request, parse_read_response, DecodeError};

    fn exchange(meter: &mut VirtualMeter, register: RegisterId) -> Option<Result<ReadResponse, DecodeError>> {
        meter.write(&build_read_request(register)).unwrap();
        meter.flush().unwrap();
        let mut acc = FrameAccumulator::new();
        while meter.available().unwrap() {
            match acc.push(meter.read().unwrap()) {
                Ok(Some(raw)) => return Some(parse_read_response(&raw, register)),
                Ok(None) => {}
                Err(_) => return None,
            }
        }
        None
    }

    #[test]
    fn test_answers_configured_register() {
        let mut meter = VirtualMeter::new();
        meter.set_value(RegisterId(0x041e), 2301, -1);
        let r = exchange(&mut meter, RegisterId(0x041e)).unwrap().unwrap();
        assert!((r.value() - 230.1).abs() < 1e-9);
        assert_eq!(meter.requests(), &[RegisterId(0x041e)]);
    }

    #[test]
    fn test_unknown_register_is_silent() {
        let mut meter = VirtualMeter::new();
        assert!(exchange(&mut meter, RegisterId(0x0001)).is_none());
    }

    #[test]
    fn test_scripted_faults() {
        let mut meter = VirtualMeter::new();
        meter.set_value(RegisterId(1), 5, 0);
        meter.script([
            Fault::CorruptCrc,
            Fault::WrongRegister,
            Fault::Drop,
            Fault::GarbagePrefix,
        ]);

        assert!(matches!(
            exchange(&mut meter, RegisterId(1)),
            Some(Err(DecodeError::Integrity { .. }))
        ));
        assert!(matches!(
            exchange(&mut meter, RegisterId(1)),
            Some(Err(DecodeError::HeaderMismatch { .. }))
        ));
        assert!(exchange(&mut meter, RegisterId(1)).is_none());
        assert!(matches!(
            exchange(&mut meter, RegisterId(1)),
            Some(Err(DecodeError::Integrity { .. }))
        ));
        assert!(exchange(&mut meter, RegisterId(1)).unwrap().is_ok());
    }

    #[test]
    fn test_injection_is_reproducible() {
        let config = ErrorInjectionConfig {
            enabled: true,
            drop_probability: 0.5,
            ..Default::default()
        };
        let run = || {
            let mut meter = VirtualMeter::new();
            meter.set_value(RegisterId(1), 5, 0);
            meter.inject_errors(config.clone());
            (0..20).map(|_| exchange(&mut meter, RegisterId(1)).is_some()).collect::<Vec<_>>()
        };
        assert_eq!(run(), run());
    }
}
