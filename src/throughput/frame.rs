//! Classification of inbound NDT7 frames.
//!
//! The server interleaves a few JSON measurement messages per second with
//! (on the download side) a flood of payload messages whose only purpose is
//! to fill the link. Payload is recognised by shape and never parsed.

use serde::Deserialize;

use crate::analysis::stats;

/// Counters the server reports about its own side of the connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
pub struct AppInfo {
    /// Microseconds since the phase started on the server.
    #[serde(rename = "ElapsedTime", default)]
    pub elapsed_time_us: Option<u64>,
    #[serde(rename = "NumBytes", default)]
    pub num_bytes: Option<u64>,
}

/// Subset of the kernel `tcp_info` the server forwards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
pub struct TcpInfo {
    #[serde(rename = "SmoothedRTT", default)]
    pub smoothed_rtt_us: Option<u64>,
    #[serde(rename = "MinRTT", default)]
    pub min_rtt_us: Option<u64>,
}

/// A server measurement message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
pub struct Ndt7Measurement {
    #[serde(rename = "AppInfo", default)]
    pub app_info: Option<AppInfo>,
    #[serde(rename = "TCPInfo", default)]
    pub tcp_info: Option<TcpInfo>,
}

impl Ndt7Measurement {
    /// Server-observed throughput, when both counters are present and non-zero.
    pub fn throughput_mbps(&self) -> Option<f64> {
        let info = self.app_info?;
        stats::server_mbps(info.num_bytes?, info.elapsed_time_us?)
    }

    pub fn smoothed_rtt_ms(&self) -> Option<f64> {
        self.tcp_info?
            .smoothed_rtt_us
            .filter(|&us| us > 0)
            .map(|us| us as f64 / 1000.0)
    }
}

/// Result of classifying one inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Measurement(Ndt7Measurement),
    /// Payload or anything else without measurement content.
    Opaque,
}

impl Frame {
    /// Classify a text message. Text that does not open like a JSON object
    /// is treated as payload without invoking the parser.
    pub fn from_text(text: &str) -> Self {
        if !looks_like_object(text.as_bytes()) {
            return Frame::Opaque;
        }
        match serde_json::from_str::<Ndt7Measurement>(text) {
            Ok(m) => Frame::Measurement(m),
            Err(_) => Frame::Opaque,
        }
    }

    /// Binary messages are always payload.
    pub fn from_binary(_data: &[u8]) -> Self {
        Frame::Opaque
    }
}

fn looks_like_object(bytes: &[u8]) -> bool {
    bytes
        .iter()
        .find(|b| !b.is_ascii_whitespace())
        .is_some_and(|&b| b == b'{')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_measurement() {
        let text = r#"{"AppInfo":{"ElapsedTime":2000000,"NumBytes":25000000},
            "ConnectionInfo":{"Client":"1.2.3.4:5678"},
            "Origin":"server","Test":"download",
            "TCPInfo":{"SmoothedRTT":41500,"MinRTT":30000,"BytesAcked":1}}"#;

        let Frame::Measurement(m) = Frame::from_text(text) else {
            panic!("expected measurement");
        };
        assert_eq!(m.throughput_mbps(), Some(100.0));
        assert_eq!(m.smoothed_rtt_ms(), Some(41.5));
        assert_eq!(m.tcp_info.unwrap().min_rtt_us, Some(30000));
    }

    #[test]
    fn test_partial_measurements() {
        let Frame::Measurement(only_rtt) = Frame::from_text(r#"{"TCPInfo":{"SmoothedRTT":8000}}"#)
        else {
            panic!("expected measurement");
        };
        assert_eq!(only_rtt.throughput_mbps(), None);
        assert_eq!(only_rtt.smoothed_rtt_ms(), Some(8.0));

        let Frame::Measurement(no_elapsed) = Frame::from_text(r#"{"AppInfo":{"NumBytes":100}}"#)
        else {
            panic!("expected measurement");
        };
        assert_eq!(no_elapsed.throughput_mbps(), None);
    }

    #[test]
    fn test_payload_is_opaque() {
        assert_eq!(Frame::from_text("xxxxxxxxxxxxxxxx"), Frame::Opaque);
        assert_eq!(Frame::from_text(""), Frame::Opaque);
        assert_eq!(Frame::from_text("{not json"), Frame::Opaque);
        assert_eq!(Frame::from_text("[1,2,3]"), Frame::Opaque);
        assert_eq!(Frame::from_binary(&[0u8; 1024]), Frame::Opaque);
    }

    #[test]
    fn test_leading_whitespace_still_parses() {
        assert!(matches!(
            Frame::from_text("  \n{\"AppInfo\":{}}"),
            Frame::Measurement(_)
        ));
    }
}
