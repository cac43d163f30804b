//! Meter driver
//!
//! Couples a [`Poller`] with a publish schedule and drives both from a tokio
//! interval. The poller itself stays synchronous; this is the only place that
//! knows about the runtime.

use std::future::Future;
use std::io;
use std::time::Duration;

use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::core::clock::Clock;
use crate::core::poller::{PollEvent, PollStats, Poller};
use crate::core::publish::{publish_all, MetricSink, PublishSchedule};
use crate::core::transport::MeterLink;

/// Outcome of a finished sweep or run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SweepSummary {
    /// Registers holding a valid value
    pub valid: usize,
    /// Catalog size
    pub total: usize,
    /// Poller counters at the time of the summary
    pub stats: PollStats,
    /// Publish rounds the sink rejected
    pub publish_failures: u64,
}

impl SweepSummary {
    /// Whether every register produced a value
    pub fn is_complete(&self) -> bool {
        self.valid == self.total
    }
}

/// Poller plus publishing
pub struct MeterDriver<L, C> {
    poller: Poller<L, C>,
    schedule: PublishSchedule,
    publish_failures: u64,
}

impl<L: MeterLink, C: Clock> MeterDriver<L, C> {
    /// Publish every `publish_interval_ms`
    pub fn new(poller: Poller<L, C>, publish_interval_ms: u64) -> Self {
        Self {
            poller,
            schedule: PublishSchedule::new(publish_interval_ms),
            publish_failures: 0,
        }
    }

    /// Borrow the poller
    pub fn poller(&self) -> &Poller<L, C> {
        &self.poller
    }

    /// Current summary
    pub fn summary(&self) -> SweepSummary {
        SweepSummary {
            valid: self.poller.store().valid_count(),
            total: self.poller.catalog().len(),
            stats: self.poller.stats(),
            publish_failures: self.publish_failures,
        }
    }

    /// One poller tick, followed by a publish round when one is due
    ///
    /// A sink error is logged and counted; the next round is attempted on
    /// the regular schedule and polling carries on either way.
    pub fn step<S: MetricSink + ?Sized>(&mut self, sink: &mut S) -> PollEvent {
        let event = self.poller.tick();
        if self.schedule.due(self.poller.clock()) {
            debug!("Publishing {} registers", self.poller.catalog().len());
            if let Err(e) = publish_all(self.poller.catalog(), self.poller.store(), sink) {
                self.publish_failures += 1;
                warn!("Publishing failed ({} so far): {}", self.publish_failures, e);
            }
        }
        event
    }

    /// Tick until `shutdown` resolves
    pub async fn run<S, F>(&mut self, sink: &mut S, shutdown: F) -> SweepSummary
    where
        S: MetricSink + ?Sized,
        F: Future<Output = ()>,
    {
        let mut interval = self.interval();
        tokio::pin!(shutdown);

        info!(
            "Polling {} registers every {} ms",
            self.poller.catalog().len(),
            self.poller.config().sweep_period_ms
        );

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
                _ = interval.tick() => {
                    self.step(sink);
                }
            }
        }

        self.summary()
    }

    /// Tick until one full sweep has finished, then publish once
    ///
    /// Gives up after `limit`, returning `None`. Unlike [`run`](Self::run),
    /// a sink error is returned since the single round is the whole result.
    pub async fn sweep_once<S: MetricSink + ?Sized>(
        &mut self,
        sink: &mut S,
        limit: Duration,
    ) -> io::Result<Option<SweepSummary>> {
        let mut interval = self.interval();
        let outcome = tokio::time::timeout(limit, async {
            loop {
                interval.tick().await;
                if let PollEvent::SweepCompleted { .. } = self.poller.tick() {
                    break;
                }
            }
        })
        .await;

        if outcome.is_err() {
            return Ok(None);
        }
        publish_all(self.poller.catalog(), self.poller.store(), sink)?;
        Ok(Some(self.summary()))
    }

    fn interval(&self) -> tokio::time::Interval {
        let tick = Duration::from_millis(self.poller.config().tick_ms.max(1));
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        interval
    }
}
