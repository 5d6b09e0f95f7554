//! Throughput measurement: phase types, live event sink, and the providers
//! that drive a ping/download/upload session against one server.

pub mod frame;
pub mod meter;
pub mod provider;
pub mod report;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::analysis::stats::round_to;

/// Failure of one session against one candidate server.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SessionError {
    #[error("server unreachable: all {attempts} ping attempts failed")]
    Unreachable { attempts: u32 },

    #[error("{phase} transport error: {message}")]
    Transport { phase: Phase, message: String },

    #[error("aborted")]
    Aborted,
}

impl SessionError {
    pub fn transport(phase: Phase, message: impl std::fmt::Display) -> Self {
        SessionError::Transport {
            phase,
            message: message.to_string(),
        }
    }
}

/// One bounded measurement step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Ping,
    Download,
    Upload,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Ping => write!(f, "ping"),
            Phase::Download => write!(f, "download"),
            Phase::Upload => write!(f, "upload"),
        }
    }
}

/// A raw observation made during a phase.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Sample {
    Rtt(f64),
    Throughput { mbps: f64, at_elapsed_ms: u64 },
}

/// Final value of one completed phase.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PhaseResult {
    pub phase: Phase,
    pub value: f64,
}

/// Outcome of a full session against one server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementResult {
    pub download_mbps: f64,
    pub upload_mbps: f64,
    pub ping_ms: f64,
    pub latency_ms: f64,
    pub jitter_ms: f64,
    pub server_id: String,
}

impl MeasurementResult {
    /// Combine phase results and download-phase RTT samples into the
    /// exported figures, rounded for display.
    pub fn from_phases(
        server_id: &str,
        ping: PhaseResult,
        download: PhaseResult,
        upload: PhaseResult,
        download_rtts: &[f64],
    ) -> Self {
        use crate::analysis::stats;

        let latency = stats::latency(download_rtts, ping.value);
        let jitter = stats::jitter(download_rtts);

        Self {
            download_mbps: round_to(download.value, 2),
            upload_mbps: round_to(upload.value, 2),
            ping_ms: ping.value.round(),
            latency_ms: latency.round(),
            jitter_ms: round_to(jitter, 1),
            server_id: server_id.to_string(),
        }
    }
}

/// Live notifications from a running session.
///
/// Calls are synchronous and must not block: implementations record or
/// forward the value and return. Every method has a no-op default so sinks
/// only implement what they consume.
pub trait SpeedTestEvents: Send + Sync {
    /// `percent` is phase progress (0-100); `value` is the current headline
    /// figure in the phase's unit.
    fn on_progress(&self, _phase: Phase, _percent: f64, _value: f64) {}

    /// Throttled throughput feed for graphs.
    fn on_data_point(&self, _phase: Phase, _mbps: f64) {}

    /// Throttled RTT feed reported by the server under load.
    fn on_latency_sample(&self, _rtt_ms: f64) {}

    fn on_phase_complete(&self, _phase: Phase, _value: f64) {}
}

/// Sink that drops everything.
pub struct NoopEvents;

impl SpeedTestEvents for NoopEvents {}
