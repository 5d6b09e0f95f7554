//! ndt7-client -- NDT7 bandwidth measurement client.
//!
//! This crate provides server discovery against the M-Lab locate service,
//! the ping/download/upload protocol session, metric aggregation with
//! derived warnings, and the orchestration state machine that sequences a
//! test, falls back across servers, and enforces a cooldown.

pub mod analysis;
pub mod config;
pub mod discovery;
pub mod orchestrator;
pub mod telemetry;
pub mod throughput;

use anyhow::{bail, Result};

use orchestrator::{RunOutcome, SpeedTestOrchestrator, SpeedTestState};

/// Run one complete test and return the final state.
pub async fn run_once(orchestrator: &SpeedTestOrchestrator) -> Result<SpeedTestState> {
    let handle = orchestrator.start_test().await?;
    tracing::info!(token = %handle.token, "waiting for test to finish");

    match handle.outcome().await {
        RunOutcome::Completed(_) => Ok(orchestrator.snapshot()),
        RunOutcome::Failed(failure) => {
            let key = failure.message_key().unwrap_or("speed_test.error_test_failed");
            bail!("{failure} ({key})")
        }
        RunOutcome::Cancelled => bail!("test was cancelled"),
    }
}
