//! Publishing readings to a metric sink
//!
//! Runs on its own cadence, independent of the sweep, and always pushes every
//! configured register. A register without a verified value is published as
//! NaN (JSON `null`, empty CSV field) rather than left out.

use chrono::{DateTime, Local};
use metrics::{describe_gauge, gauge};
use serde::{Deserialize, Serialize};
use std::io::{self, Write};
use tracing::info;

use crate::core::clock::Clock;
use crate::core::registers::{RegisterCatalog, RegisterDescriptor, RegisterId};
use crate::core::store::ResultStore;

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PublishFormat {
    /// `label = value unit`
    #[default]
    Text,
    /// JSON lines
    Json,
    /// CSV with timestamp
    Csv,
}

/// One published value
#[derive(Debug, Clone, Serialize)]
pub struct Reading {
    /// Time of publishing
    pub timestamp: DateTime<Local>,
    /// Register number
    pub register: RegisterId,
    /// Configured label
    pub label: String,
    /// Unit hint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    /// Value, NaN when not valid
    pub value: f64,
}

impl Reading {
    /// Build a reading for `descriptor`
    pub fn new(descriptor: &RegisterDescriptor, value: f64) -> Self {
        Self {
            timestamp: Local::now(),
            register: descriptor.id,
            label: descriptor.label.clone(),
            unit: descriptor.unit.clone(),
            value,
        }
    }

    /// Whether the register had a verified value
    pub fn is_valid(&self) -> bool {
        !self.value.is_nan()
    }
}

/// Destination for readings
pub trait MetricSink {
    /// Push one reading
    fn publish(&mut self, reading: &Reading) -> io::Result<()>;

    /// Called once after every register of a round was published
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Logs readings through `tracing`
#[derive(Debug, Default)]
pub struct TracingSink;

impl MetricSink for TracingSink {
    fn publish(&mut self, reading: &Reading) -> io::Result<()> {
        info!(
            register = %reading.register,
            label = %reading.label,
            value = reading.value,
            "Reading {} = {} {}",
            reading.label,
            reading.value,
            reading.unit.as_deref().unwrap_or("")
        );
        Ok(())
    }
}

/// Writes readings to any `Write` in the chosen format
pub struct WriterSink<W: Write> {
    writer: W,
    format: PublishFormat,
    header_written: bool,
}

impl<W: Write> WriterSink<W> {
    /// Create a sink
    pub fn new(writer: W, format: PublishFormat) -> Self {
        Self {
            writer,
            format,
            header_written: false,
        }
    }

    /// Unwrap the writer
    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> MetricSink for WriterSink<W> {
    fn publish(&mut self, reading: &Reading) -> io::Result<()> {
        match self.format {
            PublishFormat::Text => {
                let value = if reading.is_valid() {
                    reading.value.to_string()
                } else {
                    "NaN".to_string()
                };
                writeln!(
                    self.writer,
                    "{:<16} {:>16} {}",
                    reading.label,
                    value,
                    reading.unit.as_deref().unwrap_or("")
                )
            }
            PublishFormat::Json => {
                let line = serde_json::to_string(reading)?;
                writeln!(self.writer, "{line}")
            }
            PublishFormat::Csv => {
                if !self.header_written {
                    writeln!(self.writer, "timestamp,register,label,unit,value")?;
                    self.header_written = true;
                }
                let value = if reading.is_valid() {
                    reading.value.to_string()
                } else {
                    String::new()
                };
                writeln!(
                    self.writer,
                    "{},{},{},{},{}",
                    reading.timestamp.to_rfc3339(),
                    reading.register,
                    reading.label,
                    reading.unit.as_deref().unwrap_or(""),
                    value
                )
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

/// Keeps everything it receives; handy for tests and one-shot commands
#[derive(Debug, Default)]
pub struct CollectingSink {
    /// Readings in publish order
    pub readings: Vec<Reading>,
    /// Number of completed rounds
    pub rounds: usize,
}

impl MetricSink for CollectingSink {
    fn publish(&mut self, reading: &Reading) -> io::Result<()> {
        self.readings.push(reading.clone());
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.rounds += 1;
        Ok(())
    }
}

/// Gauge carrying every register, told apart by its `register` and `label` labels
pub const REGISTER_GAUGE: &str = "kamstrup_register";

/// Gauge with the number of registers that had a verified value in the last round
pub const VALID_GAUGE: &str = "kamstrup_registers_valid";

/// Sets `metrics` gauges for whatever recorder or exporter is installed
///
/// Invalid registers are set to NaN, so a scrape shows a gap instead of the
/// last good value.
#[derive(Debug, Default)]
pub struct MetricsSink {
    described: bool,
    valid_in_round: usize,
}

impl MetricsSink {
    /// New sink; gauges are described on the first publish
    pub fn new() -> Self {
        Self::default()
    }

    fn describe(&mut self) {
        if self.described {
            return;
        }
        describe_gauge!(REGISTER_GAUGE, "Latest meter register reading, NaN when not verified");
        describe_gauge!(VALID_GAUGE, "Registers with a verified value in the last publish round");
        self.described = true;
    }
}

impl MetricSink for MetricsSink {
    fn publish(&mut self, reading: &Reading) -> io::Result<()> {
        self.describe();
        if reading.is_valid() {
            self.valid_in_round += 1;
        }
        gauge!(
            REGISTER_GAUGE,
            "register" => reading.register.to_string(),
            "label" => reading.label.clone(),
            "unit" => reading.unit.clone().unwrap_or_default()
        )
        .set(reading.value);
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        gauge!(VALID_GAUGE).set(self.valid_in_round as f64);
        self.valid_in_round = 0;
        Ok(())
    }
}

/// Hands every reading to several sinks
///
/// Each sink sees every reading even when another one fails; the first error
/// is returned once all of them had their turn.
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Box<dyn MetricSink>>,
}

impl FanoutSink {
    /// Empty fan-out
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sink
    pub fn push(&mut self, sink: impl MetricSink + 'static) {
        self.sinks.push(Box::new(sink));
    }

    /// Number of sinks
    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    /// No sinks attached
    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    fn each(
        &mut self,
        mut f: impl FnMut(&mut dyn MetricSink) -> io::Result<()>,
    ) -> io::Result<()> {
        let mut first = None;
        for sink in &mut self.sinks {
            if let Err(e) = f(sink.as_mut()) {
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }
}

impl MetricSink for FanoutSink {
    fn publish(&mut self, reading: &Reading) -> io::Result<()> {
        self.each(|sink| sink.publish(reading))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.each(|sink| sink.flush())
    }
}

/// Push the current value of every register to `sink`
pub fn publish_all<S: MetricSink + ?Sized>(
    catalog: &RegisterCatalog,
    store: &ResultStore,
    sink: &mut S,
) -> io::Result<()> {
    for (index, descriptor) in catalog.iter().enumerate() {
        let value = store.get(index).map_or(f64::NAN, |v| v.or_nan());
        sink.publish(&Reading::new(descriptor, value))?;
    }
    sink.flush()
}

/// Fires every `interval_ms`, starting with the first check
#[derive(Debug, Clone)]
pub struct PublishSchedule {
    interval_ms: u64,
    last: Option<u64>,
}

impl PublishSchedule {
    /// Schedule with the given interval
    pub fn new(interval_ms: u64) -> Self {
        Self {
            interval_ms,
            last: None,
        }
    }

    /// True (and re-armed) when a publish round is due
    pub fn due<C: Clock + ?Sized>(&mut self, clock: &C) -> bool {
        let now = clock.now_ms();
        let due = match self.last {
            None => true,
            Some(last) => now.saturating_sub(last) >= self.interval_ms,
        };
        if due {
            self.last = Some(now);
        }
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use crate::core::registers::CatalogPreset;

    fn store_with(catalog: &RegisterCatalog, index: usize, value: f64) -> ResultStore {
        let mut store = ResultStore::new(catalog.len());
        store.set(index, value);
        store
    }

    #[test]
    fn test_invalid_published_as_nan() {
        let catalog = RegisterCatalog::preset(CatalogPreset::Single);
        let store = store_with(&catalog, 2, 1.5);
        let mut sink = CollectingSink::default();
        publish_all(&catalog, &store, &mut sink).unwrap();

        assert_eq!(sink.readings.len(), catalog.len());
        assert_eq!(sink.rounds, 1);
        assert_eq!(sink.readings[2].value, 1.5);
        assert!(sink.readings[0].value.is_nan());
        assert_eq!(sink.readings.iter().filter(|r| r.is_valid()).count(), 1);
    }

    #[test]
    fn test_json_uses_null_for_invalid() {
        let catalog = RegisterCatalog::preset(CatalogPreset::Single);
        let store = store_with(&catalog, 0, 12.5);
        let mut sink = WriterSink::new(Vec::new(), PublishFormat::Json);
        publish_all(&catalog, &store, &mut sink).unwrap();

        let out = String::from_utf8(sink.into_inner()).unwrap();
        let lines: Vec<serde_json::Value> = out
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 13);
        assert_eq!(lines[0]["label"], "EnergyIn");
        assert_eq!(lines[0]["value"], 12.5);
        assert_eq!(lines[0]["register"], 1);
        assert!(lines[1]["value"].is_null());
    }

    #[test]
    fn test_csv_header_once() {
        let catalog = RegisterCatalog::preset(CatalogPreset::Single);
        let store = ResultStore::new(catalog.len());
        let mut sink = WriterSink::new(Vec::new(), PublishFormat::Csv);
        publish_all(&catalog, &store, &mut sink).unwrap();
        publish_all(&catalog, &store, &mut sink).unwrap();

        let out = String::from_utf8(sink.into_inner()).unwrap();
        assert_eq!(out.lines().filter(|l| l.starts_with("timestamp,")).count(), 1);
        assert_eq!(out.lines().count(), 1 + 2 * 13);
        assert!(out.lines().nth(1).unwrap().ends_with(",kWh,"));
    }

    /// Records gauge values keyed by their `label` label, or the bare name
    mod recorder {
        use metrics::{
            Counter, Gauge, GaugeFn, Histogram, Key, KeyName, Metadata, Recorder, SharedString,
            Unit,
        };
        use std::collections::BTreeMap;
        use std::sync::{Arc, Mutex};

        type Values = Arc<Mutex<BTreeMap<String, f64>>>;

        #[derive(Default)]
        pub struct GaugeRecorder {
            pub values: Values,
            pub described: Mutex<Vec<String>>,
        }

        struct Slot {
            name: String,
            values: Values,
        }

        impl GaugeFn for Slot {
            fn increment(&self, value: f64) {
                *self.values.lock().unwrap().entry(self.name.clone()).or_insert(0.0) += value;
            }

            fn decrement(&self, value: f64) {
                self.increment(-value);
            }

            fn set(&self, value: f64) {
                self.values.lock().unwrap().insert(self.name.clone(), value);
            }
        }

        impl Recorder for GaugeRecorder {
            fn describe_counter(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

            fn describe_gauge(&self, key: KeyName, _: Option<Unit>, _: SharedString) {
                self.described.lock().unwrap().push(key.as_str().to_string());
            }

            fn describe_histogram(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

            fn register_counter(&self, _: &Key, _: &Metadata<'_>) -> Counter {
                Counter::noop()
            }

            fn register_gauge(&self, key: &Key, _: &Metadata<'_>) -> Gauge {
                let name = key
                    .labels()
                    .find(|l| l.key() == "label")
                    .map_or_else(|| key.name().to_string(), |l| l.value().to_string());
                Gauge::from_arc(Arc::new(Slot {
                    name,
                    values: Arc::clone(&self.values),
                }))
            }

            fn register_histogram(&self, _: &Key, _: &Metadata<'_>) -> Histogram {
                Histogram::noop()
            }
        }
    }

    #[test]
    fn test_metrics_sink_sets_gauges() {
        let catalog = RegisterCatalog::preset(CatalogPreset::Single);
        let store = store_with(&catalog, 10, 230.1);
        let recorder = recorder::GaugeRecorder::default();
        let mut sink = MetricsSink::new();

        metrics::with_local_recorder(&recorder, || {
            publish_all(&catalog, &store, &mut sink).unwrap();
            publish_all(&catalog, &store, &mut sink).unwrap();
        });

        let values = recorder.values.lock().unwrap();
        assert_eq!(values.len(), catalog.len() + 1);
        assert!((values["VoltageP1"] - 230.1).abs() < 1e-9);
        assert!(values["EnergyIn"].is_nan());
        assert_eq!(values[VALID_GAUGE], 1.0);
        assert_eq!(
            *recorder.described.lock().unwrap(),
            vec![REGISTER_GAUGE.to_string(), VALID_GAUGE.to_string()]
        );
    }

    /// Sink that refuses everything
    struct Refusing;

    impl MetricSink for Refusing {
        fn publish(&mut self, _reading: &Reading) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed"))
        }
    }

    /// Counts what it receives through a shared cell
    struct Counting(std::rc::Rc<std::cell::Cell<usize>>);

    impl MetricSink for Counting {
        fn publish(&mut self, _reading: &Reading) -> io::Result<()> {
            self.0.set(self.0.get() + 1);
            Ok(())
        }
    }

    #[test]
    fn test_fanout_reaches_every_sink() {
        let catalog = RegisterCatalog::preset(CatalogPreset::Single);
        let seen = std::rc::Rc::new(std::cell::Cell::new(0));
        let mut fanout = FanoutSink::new();
        fanout.push(Refusing);
        fanout.push(Counting(seen.clone()));
        assert_eq!(fanout.len(), 2);

        let reading = Reading::new(&catalog.entries()[0], 1.0);
        let err = fanout.publish(&reading).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert_eq!(seen.get(), 1);
        fanout.flush().unwrap();
    }

    #[test]
    fn test_schedule() {
        let clock = ManualClock::new();
        let mut schedule = PublishSchedule::new(60_000);
        assert!(schedule.due(&clock));
        assert!(!schedule.due(&clock));
        clock.advance(59_999);
        assert!(!schedule.due(&clock));
        clock.advance(1);
        assert!(schedule.due(&clock));
    }
}
