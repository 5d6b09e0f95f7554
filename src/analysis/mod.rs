//! Metric aggregation: pure functions from raw samples to final figures,
//! and the judgments derived from those figures.

pub mod stats;
pub mod verdict;

pub use verdict::{
    capability_checklist, warnings, Capability, CapabilityCheck, LatencyLevel, SpeedTestMetrics,
    Warning,
};
