//! Per-phase accounting shared by the download and upload loops.
//!
//! The meter owns the phase's append-only sample sequence, the running
//! throughput estimate and the throttles for the graph and latency feeds.
//! Time is passed in explicitly so the arithmetic can be tested without a
//! clock.

use std::time::Duration;

use tokio::time::Instant;

use super::frame::Ndt7Measurement;
use super::{Phase, Sample, SpeedTestEvents};
use crate::analysis::stats;
use crate::config::SessionConfig;

/// What a phase leaves behind once its connection is closed.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseSummary {
    pub value: f64,
    pub rtts: Vec<f64>,
    pub elapsed: Duration,
}

pub struct PhaseMeter<'a> {
    phase: Phase,
    events: &'a dyn SpeedTestEvents,
    started: Instant,
    budget: Duration,
    warmup: Duration,
    feed_interval: Duration,
    latency_feed: bool,
    last_data_point: Option<Instant>,
    last_latency: Option<Instant>,
    server_mbps: Option<f64>,
    client_bytes: u64,
    samples: Vec<Sample>,
}

impl<'a> PhaseMeter<'a> {
    pub fn new(
        phase: Phase,
        config: &SessionConfig,
        events: &'a dyn SpeedTestEvents,
        started: Instant,
    ) -> Self {
        Self {
            phase,
            events,
            started,
            budget: config.phase_duration(),
            warmup: config.warmup(),
            feed_interval: config.data_point_interval(),
            latency_feed: phase == Phase::Download,
            last_data_point: None,
            last_latency: None,
            server_mbps: None,
            client_bytes: 0,
            samples: Vec::new(),
        }
    }

    pub fn deadline(&self) -> Instant {
        self.started + self.budget
    }

    /// Apply a server measurement message.
    pub fn record_measurement(&mut self, m: &Ndt7Measurement, now: Instant) {
        let elapsed = now.saturating_duration_since(self.started);

        if let Some(rtt) = m.smoothed_rtt_ms() {
            self.samples.push(Sample::Rtt(rtt));
            if self.latency_feed && self.throttle_passed(self.last_latency, now) {
                self.last_latency = Some(now);
                self.events.on_latency_sample(rtt);
            }
        }

        if let Some(mbps) = m.throughput_mbps() {
            self.server_mbps = Some(mbps);
            self.samples.push(Sample::Throughput {
                mbps,
                at_elapsed_ms: elapsed.as_millis() as u64,
            });
        }
    }

    /// Count bytes moved by the client itself (payload received, or chunks sent).
    pub fn record_client_bytes(&mut self, n: usize) {
        self.client_bytes += n as u64;
    }

    /// Periodic update: progress always, a graph point when the throttle
    /// and the warm-up allow it.
    pub fn tick(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.started);
        let current = self.current_mbps(now);

        let percent = if self.budget.is_zero() {
            100.0
        } else {
            (elapsed.as_secs_f64() / self.budget.as_secs_f64() * 100.0).min(100.0)
        };
        self.events
            .on_progress(self.phase, percent, stats::round_to(current, 1));

        if elapsed >= self.warmup && self.throttle_passed(self.last_data_point, now) {
            self.last_data_point = Some(now);
            self.events.on_data_point(self.phase, current);
        }
    }

    /// Server figure when one exists, client-side estimate otherwise.
    pub fn current_mbps(&self, now: Instant) -> f64 {
        self.server_mbps.unwrap_or_else(|| {
            stats::mbps(
                self.client_bytes,
                now.saturating_duration_since(self.started),
            )
        })
    }

    /// Whether anything worth keeping has been observed.
    pub fn has_useful_data(&self) -> bool {
        !self.samples.is_empty() || self.client_bytes > 0
    }

    pub fn rtts(&self) -> Vec<f64> {
        self.samples
            .iter()
            .filter_map(|s| match s {
                Sample::Rtt(ms) => Some(*ms),
                Sample::Throughput { .. } => None,
            })
            .collect()
    }

    /// Close the books. Consumes the meter; the sample sequence ends here.
    pub fn finish(self, now: Instant) -> PhaseSummary {
        PhaseSummary {
            value: self.current_mbps(now),
            rtts: self.rtts(),
            elapsed: now.saturating_duration_since(self.started),
        }
    }

    fn throttle_passed(&self, last: Option<Instant>, now: Instant) -> bool {
        match last {
            None => true,
            Some(t) => now.saturating_duration_since(t) >= self.feed_interval,
        }
    }
}
