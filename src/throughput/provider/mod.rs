use serde::Serialize;
use tokio_util::sync::CancellationToken;

use super::{MeasurementResult, SessionError, SpeedTestEvents};
use crate::discovery::Candidate;

pub mod ndt7;
pub mod simulated;

pub use ndt7::Ndt7Provider;
pub use simulated::SimulatedProvider;

/// Metadata describing a speed test provider.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderMeta {
    pub id: &'static str,           // "ndt7", "simulated"
    pub display_name: &'static str, // "NDT7 (M-Lab)", ...
    pub description: &'static str,
}

/// A full ping/download/upload session against one candidate.
///
/// Implementations report live figures through `events` and stop promptly
/// once `cancel` fires, returning [`SessionError::Aborted`].
#[async_trait::async_trait]
pub trait SpeedTestProvider: Send + Sync {
    fn meta(&self) -> ProviderMeta;

    async fn run(
        &self,
        candidate: &Candidate,
        events: &dyn SpeedTestEvents,
        cancel: &CancellationToken,
    ) -> Result<MeasurementResult, SessionError>;
}
