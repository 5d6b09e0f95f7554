//! Derived judgments over a finished (or fixed) set of metrics.
//!
//! Warnings flag problems worth surfacing; the capability checklist answers
//! "is this line good enough for X" for a fixed set of everyday uses.

use serde::{Deserialize, Serialize};

use crate::throughput::MeasurementResult;

/// Latency under load above this multiple of idle ping is flagged.
pub const LOADED_LATENCY_RATIO: f64 = 3.0;
pub const LOW_DOWNLOAD_MBPS: f64 = 10.0;
pub const LOW_UPLOAD_MBPS: f64 = 3.0;
pub const UNSTABLE_JITTER_MS: f64 = 10.0;

/// Metrics as seen by the presentation layer. Fields stay `None` until the
/// phase producing them has completed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SpeedTestMetrics {
    pub download: Option<f64>,
    pub upload: Option<f64>,
    pub ping: Option<f64>,
    pub latency: Option<f64>,
    pub jitter: Option<f64>,
}

impl From<&MeasurementResult> for SpeedTestMetrics {
    fn from(result: &MeasurementResult) -> Self {
        Self {
            download: Some(result.download_mbps),
            upload: Some(result.upload_mbps),
            ping: Some(result.ping_ms),
            latency: Some(result.latency_ms),
            jitter: Some(result.jitter_ms),
        }
    }
}

// ---------------------------------------------------------------------------
// Warnings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Warning {
    /// Latency under load is far above the idle ping (bufferbloat).
    HighLatencyUnderLoad {
        latency_ms: f64,
        ping_ms: f64,
        ratio: f64,
    },
    LowThroughput { download_mbps: f64, upload_mbps: f64 },
    Unstable { jitter_ms: f64 },
}

impl Warning {
    pub fn title_key(&self) -> &'static str {
        match self {
            Warning::HighLatencyUnderLoad { .. } => "speed_test.warning_high_latency",
            Warning::LowThroughput { .. } => "speed_test.warning_low_speed",
            Warning::Unstable { .. } => "speed_test.warning_unstable",
        }
    }
}

impl std::fmt::Display for Warning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Warning::HighLatencyUnderLoad {
                latency_ms,
                ping_ms,
                ratio,
            } => write!(
                f,
                "latency under load {:.0} ms is {:.0}x the idle ping of {:.0} ms",
                latency_ms, ratio, ping_ms
            ),
            Warning::LowThroughput {
                download_mbps,
                upload_mbps,
            } => write!(
                f,
                "low speed: {:.1} Mbps down / {:.1} Mbps up",
                download_mbps, upload_mbps
            ),
            Warning::Unstable { jitter_ms } => {
                write!(f, "unstable connection: jitter {:.1} ms", jitter_ms)
            }
        }
    }
}

/// Flag loaded latency, low throughput and instability.
pub fn warnings(m: &SpeedTestMetrics) -> Vec<Warning> {
    let mut out = Vec::new();

    if let (Some(ping), Some(latency)) = (m.ping, m.latency) {
        if ping > 0.0 && latency > ping * LOADED_LATENCY_RATIO {
            out.push(Warning::HighLatencyUnderLoad {
                latency_ms: latency,
                ping_ms: ping,
                ratio: (latency / ping).round(),
            });
        }
    }

    let slow_down = m.download.is_some_and(|d| d < LOW_DOWNLOAD_MBPS);
    let slow_up = m.upload.is_some_and(|u| u < LOW_UPLOAD_MBPS);
    if slow_down || slow_up {
        out.push(Warning::LowThroughput {
            download_mbps: m.download.unwrap_or(0.0),
            upload_mbps: m.upload.unwrap_or(0.0),
        });
    }

    if let Some(jitter) = m.jitter {
        if jitter > UNSTABLE_JITTER_MS {
            out.push(Warning::Unstable { jitter_ms: jitter });
        }
    }

    out
}

// ---------------------------------------------------------------------------
// Capability checklist
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Video4k,
    OnlineGaming,
    VideoCalls,
    HdVideo,
    MusicPodcasts,
    SocialWeb,
    EmailMessengers,
}

impl Capability {
    pub const ALL: [Capability; 7] = [
        Capability::Video4k,
        Capability::OnlineGaming,
        Capability::VideoCalls,
        Capability::HdVideo,
        Capability::MusicPodcasts,
        Capability::SocialWeb,
        Capability::EmailMessengers,
    ];

    pub fn name_key(&self) -> &'static str {
        match self {
            Capability::Video4k => "speed_test.task_4k_video",
            Capability::OnlineGaming => "speed_test.task_online_gaming",
            Capability::VideoCalls => "speed_test.task_video_calls",
            Capability::HdVideo => "speed_test.task_hd_video",
            Capability::MusicPodcasts => "speed_test.task_music_podcasts",
            Capability::SocialWeb => "speed_test.task_social_web",
            Capability::EmailMessengers => "speed_test.task_email_messengers",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Capability::Video4k => "4K video",
            Capability::OnlineGaming => "Online gaming",
            Capability::VideoCalls => "Video calls",
            Capability::HdVideo => "HD video",
            Capability::MusicPodcasts => "Music & podcasts",
            Capability::SocialWeb => "Social & web browsing",
            Capability::EmailMessengers => "Email & messengers",
        }
    }

    fn passes(&self, dl: f64, ul: f64, ping: f64, jitter: f64) -> bool {
        match self {
            Capability::Video4k => dl >= 25.0,
            Capability::OnlineGaming => ping <= 50.0 && jitter <= 30.0,
            Capability::VideoCalls => dl >= 5.0 && ul >= 3.0 && ping <= 100.0,
            Capability::HdVideo => dl >= 10.0,
            Capability::MusicPodcasts => dl >= 1.0,
            Capability::SocialWeb => dl >= 3.0,
            Capability::EmailMessengers => dl >= 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityCheck {
    pub capability: Capability,
    pub pass: bool,
    /// The figures the check was evaluated against, for display.
    pub download_mbps: f64,
    pub upload_mbps: f64,
    pub ping_ms: f64,
    pub jitter_ms: f64,
}

impl CapabilityCheck {
    pub fn desc_key(&self) -> String {
        let suffix = if self.pass { "_pass" } else { "_fail" };
        format!("{}{}", self.capability.name_key(), suffix)
    }
}

/// Evaluate every capability, failing items first. Missing figures count
/// as worst case (0 Mbps, 999 ms).
pub fn capability_checklist(m: &SpeedTestMetrics) -> Vec<CapabilityCheck> {
    let dl = m.download.unwrap_or(0.0);
    let ul = m.upload.unwrap_or(0.0);
    let ping = m.ping.unwrap_or(999.0);
    let jitter = m.jitter.unwrap_or(999.0);

    let mut checks: Vec<CapabilityCheck> = Capability::ALL
        .iter()
        .map(|&capability| CapabilityCheck {
            capability,
            pass: capability.passes(dl, ul, ping, jitter),
            download_mbps: dl,
            upload_mbps: ul,
            ping_ms: ping,
            jitter_ms: jitter,
        })
        .collect();

    // stable: keeps the fixed order inside each group
    checks.sort_by_key(|c| c.pass);
    checks
}

// ---------------------------------------------------------------------------
// Latency grading
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LatencyLevel {
    Excellent,
    Good,
    Fair,
    Slow,
}

impl LatencyLevel {
    /// Grade an idle ping or a loaded latency figure.
    pub fn for_ping(ms: f64) -> Self {
        if ms < 20.0 {
            LatencyLevel::Excellent
        } else if ms <= 50.0 {
            LatencyLevel::Good
        } else if ms <= 100.0 {
            LatencyLevel::Fair
        } else {
            LatencyLevel::Slow
        }
    }

    pub fn for_jitter(ms: f64) -> Self {
        if ms < 5.0 {
            LatencyLevel::Excellent
        } else if ms <= 15.0 {
            LatencyLevel::Good
        } else if ms <= 30.0 {
            LatencyLevel::Fair
        } else {
            LatencyLevel::Slow
        }
    }
}

impl std::fmt::Display for LatencyLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LatencyLevel::Excellent => write!(f, "excellent"),
            LatencyLevel::Good => write!(f, "good"),
            LatencyLevel::Fair => write!(f, "fair"),
            LatencyLevel::Slow => write!(f, "slow"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(dl: f64, ul: f64, ping: f64, latency: f64, jitter: f64) -> SpeedTestMetrics {
        SpeedTestMetrics {
            download: Some(dl),
            upload: Some(ul),
            ping: Some(ping),
            latency: Some(latency),
            jitter: Some(jitter),
        }
    }

    #[test]
    fn test_fast_line_has_no_warnings() {
        assert!(warnings(&metrics(150.0, 80.0, 8.0, 12.0, 2.0)).is_empty());
    }

    #[test]
    fn test_slow_line_flags_everything() {
        let w = warnings(&metrics(5.0, 1.5, 50.0, 200.0, 25.0));
        assert_eq!(w.len(), 3);
        assert_eq!(
            w[0],
            Warning::HighLatencyUnderLoad {
                latency_ms: 200.0,
                ping_ms: 50.0,
                ratio: 4.0
            }
        );
        assert_eq!(
            w[1],
            Warning::LowThroughput {
                download_mbps: 5.0,
                upload_mbps: 1.5
            }
        );
        assert_eq!(w[2], Warning::Unstable { jitter_ms: 25.0 });
    }

    #[test]
    fn test_thresholds_are_strict() {
        // exactly 3x ping, exactly 10 Mbps, exactly 3 Mbps, exactly 10 ms
        assert!(warnings(&metrics(10.0, 3.0, 20.0, 60.0, 10.0)).is_empty());
    }

    #[test]
    fn test_low_upload_alone_triggers_low_throughput() {
        let w = warnings(&metrics(200.0, 2.0, 10.0, 12.0, 1.0));
        assert_eq!(w.len(), 1);
        assert_eq!(w[0].title_key(), "speed_test.warning_low_speed");
    }

    #[test]
    fn test_missing_metrics_raise_nothing() {
        assert!(warnings(&SpeedTestMetrics::default()).is_empty());
    }

    #[test]
    fn test_checklist_sorted_failing_first() {
        // 12 Mbps down: HD passes, 4K fails; 120 ms ping fails gaming and calls
        let checks = capability_checklist(&metrics(12.0, 5.0, 120.0, 130.0, 4.0));
        assert_eq!(checks.len(), 7);

        let failing: Vec<Capability> = checks
            .iter()
            .take_while(|c| !c.pass)
            .map(|c| c.capability)
            .collect();
        assert_eq!(
            failing,
            vec![
                Capability::Video4k,
                Capability::OnlineGaming,
                Capability::VideoCalls
            ]
        );
        assert!(checks[3..].iter().all(|c| c.pass));
        assert_eq!(checks[3].capability, Capability::HdVideo);
    }

    #[test]
    fn test_checklist_defaults_missing_to_worst_case() {
        let checks = capability_checklist(&SpeedTestMetrics::default());
        assert!(checks.iter().all(|c| !c.pass));
        assert_eq!(checks[0].ping_ms, 999.0);
        assert_eq!(checks[0].desc_key(), "speed_test.task_4k_video_fail");
    }

    #[test]
    fn test_latency_levels() {
        assert_eq!(LatencyLevel::for_ping(8.0), LatencyLevel::Excellent);
        assert_eq!(LatencyLevel::for_ping(20.0), LatencyLevel::Good);
        assert_eq!(LatencyLevel::for_ping(100.0), LatencyLevel::Fair);
        assert_eq!(LatencyLevel::for_ping(101.0), LatencyLevel::Slow);

        assert_eq!(LatencyLevel::for_jitter(4.9), LatencyLevel::Excellent);
        assert_eq!(LatencyLevel::for_jitter(15.0), LatencyLevel::Good);
        assert_eq!(LatencyLevel::for_jitter(30.0), LatencyLevel::Fair);
        assert_eq!(LatencyLevel::for_jitter(31.0), LatencyLevel::Slow);
    }
}
