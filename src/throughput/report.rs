//! Measurement result formatting.

use super::MeasurementResult;
use crate::analysis::{LatencyLevel, Warning};

fn format_speed(mbps: f64) -> String {
    if mbps >= 1000.0 {
        format!("{:.2} Gbps", mbps / 1000.0)
    } else {
        format!("{:.1} Mbps", mbps)
    }
}

/// Format a measurement result as a human-readable summary.
pub fn format_summary(result: &MeasurementResult) -> String {
    format!(
        "download {}, upload {}, ping {:.0}ms ({}), latency under load {:.0}ms, jitter {:.1}ms ({}), server: {}",
        format_speed(result.download_mbps),
        format_speed(result.upload_mbps),
        result.ping_ms,
        LatencyLevel::for_ping(result.ping_ms),
        result.latency_ms,
        result.jitter_ms,
        LatencyLevel::for_jitter(result.jitter_ms),
        result.server_id,
    )
}

/// One line per warning, or `None` when there is nothing to report.
pub fn format_warnings(warnings: &[Warning]) -> Option<String> {
    if warnings.is_empty() {
        return None;
    }
    Some(
        warnings
            .iter()
            .map(|w| format!("  ! {w}"))
            .collect::<Vec<_>>()
            .join("\n"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(download_mbps: f64, upload_mbps: f64) -> MeasurementResult {
        MeasurementResult {
            download_mbps,
            upload_mbps,
            ping_ms: 12.0,
            latency_ms: 18.0,
            jitter_ms: 2.4,
            server_id: "mlab1-lga0t".to_string(),
        }
    }

    #[test]
    fn test_format_summary_gbps() {
        let summary = format_summary(&result(1412.5, 940.0));
        assert!(summary.contains("download 1.41 Gbps"));
        assert!(summary.contains("upload 940.0 Mbps"));
        assert!(summary.contains("mlab1-lga0t"));
    }

    #[test]
    fn test_format_summary_mbps() {
        let summary = format_summary(&result(245.3, 20.0));
        assert!(summary.contains("download 245.3 Mbps"));
        assert!(summary.contains("ping 12ms (excellent)"));
        assert!(summary.contains("jitter 2.4ms (excellent)"));
    }

    #[test]
    fn test_format_warnings() {
        assert_eq!(format_warnings(&[]), None);
        let text = format_warnings(&[Warning::Unstable { jitter_ms: 14.0 }]).unwrap();
        assert!(text.starts_with("  ! "));
    }
}
