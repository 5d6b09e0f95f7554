//! Offline provider producing plausible, noisy figures on a short timeline.
//! Used for demos and UI work where a real network test is unwanted.

use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use super::{ProviderMeta, SpeedTestProvider};
use crate::analysis::stats::round_to;
use crate::discovery::Candidate;
use crate::throughput::{MeasurementResult, Phase, SessionError, SpeedTestEvents};

pub const SIMULATED_SERVER_ID: &str = "simulated.local";

const PING_PROBES: u32 = 3;
const PING_STEP: Duration = Duration::from_millis(300);
const RAMP_STEPS: f64 = 5.0;

/// `base` plus uniform noise in `[-spread/2, spread/2)`.
pub fn noise(base: f64, spread: f64) -> f64 {
    base + (rand::thread_rng().gen::<f64>() - 0.5) * spread
}

pub struct SimulatedProvider {
    phase_duration: Duration,
    tick: Duration,
}

impl Default for SimulatedProvider {
    fn default() -> Self {
        Self {
            phase_duration: Duration::from_secs(3),
            tick: Duration::from_millis(100),
        }
    }
}

impl SimulatedProvider {
    pub fn new(phase_duration: Duration, tick: Duration) -> Self {
        Self { phase_duration, tick }
    }

    fn steps(&self) -> u32 {
        let tick = self.tick.as_millis().max(1);
        (self.phase_duration.as_millis() / tick).max(1) as u32
    }

    async fn pause(&self, d: Duration, cancel: &CancellationToken) -> Result<(), SessionError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SessionError::Aborted),
            _ = tokio::time::sleep(d) => Ok(()),
        }
    }

    async fn transfer(
        &self,
        phase: Phase,
        target: f64,
        spread: f64,
        latency: Option<f64>,
        events: &dyn SpeedTestEvents,
        cancel: &CancellationToken,
    ) -> Result<(), SessionError> {
        let steps = self.steps();
        for i in 1..=steps {
            self.pause(self.tick, cancel).await?;
            let percent = i as f64 / steps as f64 * 100.0;
            let current = noise(target, spread) * (i as f64 / RAMP_STEPS).min(1.0);
            events.on_progress(phase, percent, round_to(current, 1));
            if i > RAMP_STEPS as u32 && i % 2 == 0 {
                events.on_data_point(phase, current);
                if let Some(ms) = latency {
                    events.on_latency_sample(noise(ms, 4.0));
                }
            }
        }
        events.on_phase_complete(phase, target);
        Ok(())
    }
}

#[async_trait::async_trait]
impl SpeedTestProvider for SimulatedProvider {
    fn meta(&self) -> ProviderMeta {
        ProviderMeta {
            id: "simulated",
            display_name: "Simulated",
            description: "Synthetic results without network traffic.",
        }
    }

    async fn run(
        &self,
        _candidate: &Candidate,
        events: &dyn SpeedTestEvents,
        cancel: &CancellationToken,
    ) -> Result<MeasurementResult, SessionError> {
        let ping = noise(45.0, 8.0);
        let download = noise(620.0, 150.0);
        let upload = noise(180.0, 60.0);
        let latency = noise(58.0, 10.0);
        let jitter = noise(12.0, 4.0);

        for i in 1..=PING_PROBES {
            self.pause(PING_STEP, cancel).await?;
            events.on_progress(
                Phase::Ping,
                i as f64 / PING_PROBES as f64 * 100.0,
                noise(ping, 4.0).round(),
            );
        }
        events.on_phase_complete(Phase::Ping, ping.round());

        self.transfer(Phase::Download, download, 200.0, Some(latency), events, cancel)
            .await?;
        self.transfer(Phase::Upload, upload, 100.0, None, events, cancel)
            .await?;

        Ok(MeasurementResult {
            download_mbps: round_to(download, 2),
            upload_mbps: round_to(upload, 2),
            ping_ms: ping.round(),
            latency_ms: latency.round(),
            jitter_ms: round_to(jitter, 1),
            server_id: SIMULATED_SERVER_ID.to_string(),
        })
    }
}
