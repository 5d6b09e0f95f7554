//! Pure aggregation over raw phase samples.
//!
//! Nothing in here touches the clock or the network; every function maps a
//! slice of samples (in arrival order) to a single figure.

use std::time::Duration;

/// Arithmetic mean, `None` for an empty slice.
pub fn mean(samples: &[f64]) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    Some(samples.iter().sum::<f64>() / samples.len() as f64)
}

/// Median of the samples, independent of their order. Even-sized inputs
/// average the two middle values.
pub fn median(samples: &[f64]) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

/// Mean absolute difference between consecutive samples. Order matters:
/// the slice must be in arrival order. Zero for fewer than two samples.
pub fn jitter(samples: &[f64]) -> f64 {
    if samples.len() < 2 {
        return 0.0;
    }
    let total: f64 = samples.windows(2).map(|w| (w[1] - w[0]).abs()).sum();
    total / (samples.len() - 1) as f64
}

/// Latency under load: mean of the download-phase RTT samples, or the
/// idle ping median when the server never reported an RTT.
pub fn latency(download_rtts: &[f64], ping_ms: f64) -> f64 {
    mean(download_rtts).unwrap_or(ping_ms)
}

/// Megabits per second for `bytes` moved over `elapsed`. Zero when no time
/// has passed.
pub fn mbps(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return 0.0;
    }
    (bytes as f64 * 8.0) / secs / 1_000_000.0
}

/// Server-side throughput from NDT7 `AppInfo` counters. `elapsed_us` is in
/// microseconds, so bits per microsecond is already Mbps.
pub fn server_mbps(num_bytes: u64, elapsed_us: u64) -> Option<f64> {
    if num_bytes == 0 || elapsed_us == 0 {
        return None;
    }
    Some(num_bytes as f64 * 8.0 / elapsed_us as f64)
}

/// Round to `decimals` places.
pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}
