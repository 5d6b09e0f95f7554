//! Test orchestration: the state machine callers drive.
//!
//! A [`SpeedTestOrchestrator`] sequences discovery and per-candidate
//! sessions on one spawned task per run, publishes [`SpeedTestState`]
//! snapshots on a `watch` channel, and enforces the post-run cooldown.
//! Every mutation coming from a run is applied only while that run's
//! [`RunToken`] is current; the check happens under the channel's write
//! lock so a cancel can never interleave between check and write.

pub mod cooldown;
pub mod token;

use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::analysis::{
    capability_checklist, warnings, CapabilityCheck, SpeedTestMetrics, Warning,
};
use crate::analysis::stats::round_to;
use crate::config::SpeedTestConfig;
use crate::discovery::{
    Candidate, CandidateSource, DiscoveryError, ServerDirectory, StaticCandidates,
};
use crate::throughput::provider::simulated::{noise, SIMULATED_SERVER_ID};
use crate::throughput::provider::{Ndt7Provider, SimulatedProvider, SpeedTestProvider};
use crate::throughput::{MeasurementResult, Phase, SessionError, SpeedTestEvents};

use cooldown::Cooldown;
pub use token::{RunToken, RunTokens};

/// Server name shown for fixed-metric overrides.
pub const OVERRIDE_SERVER_ID: &str = "debug-server.example.com";

/// Points per synthetic graph.
const SYNTHETIC_GRAPH_POINTS: usize = 30;

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorPhase {
    #[default]
    Idle,
    Pinging,
    Downloading,
    Uploading,
    Done,
    Error,
}

impl OrchestratorPhase {
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            OrchestratorPhase::Pinging | OrchestratorPhase::Downloading | OrchestratorPhase::Uploading
        )
    }
}

impl From<Phase> for OrchestratorPhase {
    fn from(phase: Phase) -> Self {
        match phase {
            Phase::Ping => OrchestratorPhase::Pinging,
            Phase::Download => OrchestratorPhase::Downloading,
            Phase::Upload => OrchestratorPhase::Uploading,
        }
    }
}

/// Everything a presentation layer needs to render the test.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpeedTestState {
    pub phase: OrchestratorPhase,
    /// Progress of the current phase, 0-100.
    pub progress: f64,
    pub current_value: f64,
    pub current_unit: &'static str,
    pub metrics: SpeedTestMetrics,
    pub download_data: Vec<f64>,
    pub upload_data: Vec<f64>,
    /// Most recent loaded-latency sample.
    pub live_latency_ms: Option<f64>,
    pub warnings: Vec<Warning>,
    pub checklist: Vec<CapabilityCheck>,
    pub server_id: Option<String>,
    pub result: Option<MeasurementResult>,
    pub error: Option<TestFailure>,
    pub cooldown_seconds_left: u64,
    /// Wall-clock time the last run (or override) reached `Done`.
    pub finished_at: Option<DateTime<Utc>>,
}

impl Default for SpeedTestState {
    fn default() -> Self {
        Self {
            phase: OrchestratorPhase::Idle,
            progress: 0.0,
            current_value: 0.0,
            current_unit: unit_key(Phase::Ping),
            metrics: SpeedTestMetrics::default(),
            download_data: Vec::new(),
            upload_data: Vec::new(),
            live_latency_ms: None,
            warnings: Vec::new(),
            checklist: Vec::new(),
            server_id: None,
            result: None,
            error: None,
            cooldown_seconds_left: 0,
            finished_at: None,
        }
    }
}

impl SpeedTestState {
    fn starting() -> Self {
        Self {
            phase: OrchestratorPhase::Pinging,
            ..Self::default()
        }
    }

    /// Final metrics with their derived judgments.
    fn finished(metrics: SpeedTestMetrics) -> Self {
        Self {
            phase: OrchestratorPhase::Done,
            progress: 100.0,
            metrics,
            warnings: warnings(&metrics),
            checklist: capability_checklist(&metrics),
            finished_at: Some(Utc::now()),
            ..Self::default()
        }
    }
}

fn unit_key(phase: Phase) -> &'static str {
    match phase {
        Phase::Ping => "speed_test.unit_ms",
        Phase::Download | Phase::Upload => "speed_test.unit_mbps",
    }
}

// ---------------------------------------------------------------------------
// Errors and outcomes
// ---------------------------------------------------------------------------

/// Why a run failed, as surfaced to callers.
#[derive(Debug, Clone, Error, PartialEq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum TestFailure {
    #[error("rate limited by the locate service")]
    RateLimited,

    #[error("no test servers available")]
    NoServersAvailable,

    #[error("server unreachable")]
    Unreachable,

    #[error("connection error: {0}")]
    ConnectionError(String),

    #[error("aborted")]
    Aborted,

    #[error("test failed: {0}")]
    Unknown(String),
}

impl TestFailure {
    /// Display category. `None` for failures that must not be shown.
    pub fn message_key(&self) -> Option<&'static str> {
        match self {
            TestFailure::RateLimited => Some("speed_test.error_rate_limited"),
            TestFailure::NoServersAvailable => Some("speed_test.error_no_server"),
            TestFailure::Unreachable | TestFailure::ConnectionError(_) => {
                Some("speed_test.error_connection")
            }
            TestFailure::Aborted => None,
            TestFailure::Unknown(_) => Some("speed_test.error_test_failed"),
        }
    }

    pub fn is_silent(&self) -> bool {
        self.message_key().is_none()
    }
}

impl From<DiscoveryError> for TestFailure {
    fn from(err: DiscoveryError) -> Self {
        match err {
            DiscoveryError::RateLimited { .. } => TestFailure::RateLimited,
            DiscoveryError::EmptyResult | DiscoveryError::Transport(_) => {
                TestFailure::NoServersAvailable
            }
            DiscoveryError::Aborted => TestFailure::Aborted,
        }
    }
}

impl From<SessionError> for TestFailure {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Unreachable { .. } => TestFailure::Unreachable,
            SessionError::Transport { .. } => TestFailure::ConnectionError(err.to_string()),
            SessionError::Aborted => TestFailure::Aborted,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StartError {
    #[error("cooling down, {}s left", .remaining.as_secs())]
    CoolingDown { remaining: Duration },
}

/// How a run ended, from the point of view of whoever started it.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed(MeasurementResult),
    Failed(TestFailure),
    /// Cancelled, superseded by a newer run, or aborted.
    Cancelled,
}

/// Returned by [`SpeedTestOrchestrator::start_test`].
pub struct RunHandle {
    pub token: RunToken,
    outcome: oneshot::Receiver<RunOutcome>,
}

impl RunHandle {
    pub async fn outcome(self) -> RunOutcome {
        self.outcome.await.unwrap_or(RunOutcome::Cancelled)
    }
}

/// Fixed metric presets for demos and UI checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Scenario {
    Fast,
    Slow,
    HighLatency,
    Error,
}

impl Scenario {
    /// `None` for the error preset.
    pub fn metrics(&self) -> Option<SpeedTestMetrics> {
        let (download, upload, ping, latency, jitter) = match self {
            Scenario::Fast => (150.0, 80.0, 8.0, 12.0, 2.0),
            Scenario::Slow => (5.0, 1.5, 85.0, 200.0, 25.0),
            Scenario::HighLatency => (50.0, 25.0, 12.0, 180.0, 35.0),
            Scenario::Error => return None,
        };
        Some(SpeedTestMetrics {
            download: Some(download),
            upload: Some(upload),
            ping: Some(ping),
            latency: Some(latency),
            jitter: Some(jitter),
        })
    }
}

/// Ramp over the first five points towards `target`, with +/-7.5% noise.
pub fn synthetic_graph(target: f64, count: usize) -> Vec<f64> {
    (0..count)
        .map(|i| {
            let ramp = (i as f64 / 5.0).min(1.0);
            noise(target * ramp, target * 0.15).max(0.0)
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

struct ActiveRun {
    token: RunToken,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct Shared {
    directory: Arc<dyn CandidateSource>,
    provider: Arc<dyn SpeedTestProvider>,
    tokens: RunTokens,
    state: watch::Sender<SpeedTestState>,
    active: Mutex<Option<ActiveRun>>,
    /// Held across take-active .. store-active so overlapping starts,
    /// cancels and overrides never lose track of a spawned run.
    lifecycle: tokio::sync::Mutex<()>,
    cooldown: Cooldown,
    observer: RwLock<Option<Arc<dyn SpeedTestEvents>>>,
}

/// Cheap to clone; clones drive the same state machine.
#[derive(Clone)]
pub struct SpeedTestOrchestrator {
    shared: Arc<Shared>,
}

impl SpeedTestOrchestrator {
    pub fn new(
        directory: Arc<dyn CandidateSource>,
        provider: Arc<dyn SpeedTestProvider>,
        cooldown: Duration,
    ) -> Self {
        let (state, _) = watch::channel(SpeedTestState::default());
        Self {
            shared: Arc::new(Shared {
                directory,
                provider,
                tokens: RunTokens::new(),
                state,
                active: Mutex::new(None),
                lifecycle: tokio::sync::Mutex::new(()),
                cooldown: Cooldown::new(cooldown),
                observer: RwLock::new(None),
            }),
        }
    }

    /// Wire the network (or simulated) stack from configuration.
    pub fn from_config(config: &SpeedTestConfig) -> Result<Self, DiscoveryError> {
        let cooldown = config.orchestrator.cooldown();
        if config.orchestrator.simulate {
            let candidate = Candidate {
                id: SIMULATED_SERVER_ID.to_string(),
                urls: Default::default(),
            };
            return Ok(Self::new(
                Arc::new(StaticCandidates::new(vec![candidate])),
                Arc::new(SimulatedProvider::default()),
                cooldown,
            ));
        }

        let directory = ServerDirectory::new(config.discovery.clone())?;
        Ok(Self::new(
            Arc::new(directory),
            Arc::new(Ndt7Provider::new(config.session.clone())),
            cooldown,
        ))
    }

    /// Forward live session events (after the token check) to `observer`.
    pub fn set_observer(&self, observer: Option<Arc<dyn SpeedTestEvents>>) {
        *self
            .shared
            .observer
            .write()
            .unwrap_or_else(|e| e.into_inner()) = observer;
    }

    pub fn subscribe(&self) -> watch::Receiver<SpeedTestState> {
        self.shared.state.subscribe()
    }

    pub fn snapshot(&self) -> SpeedTestState {
        self.shared.state.borrow().clone()
    }

    pub fn provider_name(&self) -> &'static str {
        self.shared.provider.meta().display_name
    }

    /// Begin a new run. Refused while the cooldown is active. A run still in
    /// flight is cancelled and awaited first.
    pub async fn start_test(&self) -> Result<RunHandle, StartError> {
        let _serial = self.shared.lifecycle.lock().await;
        if let Some(remaining) = self.shared.cooldown.remaining() {
            debug!(remaining_secs = remaining.as_secs(), "start refused: cooling down");
            return Err(StartError::CoolingDown { remaining });
        }

        if let Some(previous) = self.shared.take_active() {
            info!(token = %previous.token, "superseding run still in flight");
            self.shared.tokens.invalidate();
            previous.cancel.cancel();
            join_quietly(previous).await;
        }

        let token = self.shared.tokens.mint();
        self.shared.cooldown.stop();
        self.shared.state.send_replace(SpeedTestState::starting());
        info!(%token, provider = self.provider_name(), "speed test started");

        let cancel = CancellationToken::new();
        let (tx, rx) = oneshot::channel();
        let shared = Arc::clone(&self.shared);
        let run_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            let outcome = shared.execute(token, &run_cancel).await;
            shared.clear_active(token);
            let _ = tx.send(outcome);
        });

        let displaced = self
            .shared
            .lock_active()
            .replace(ActiveRun { token, cancel, task });
        debug_assert!(displaced.is_none(), "run slot filled outside the lifecycle lock");
        Ok(RunHandle { token, outcome: rx })
    }

    /// Invalidate the current run, close its connections, and return to
    /// `Idle`. Returns once the run task has finished.
    pub async fn cancel_test(&self) {
        let _serial = self.shared.lifecycle.lock().await;
        self.shared.tokens.invalidate();
        if let Some(run) = self.shared.take_active() {
            run.cancel.cancel();
            join_quietly(run).await;
            info!("speed test cancelled");
        }
        self.shared.cooldown.stop();
        self.shared.state.send_replace(SpeedTestState::default());
    }

    /// Clear visible state and any cooldown. The current run, if any, keeps
    /// its token.
    pub fn reset(&self) {
        self.shared.cooldown.stop();
        self.shared.state.send_replace(SpeedTestState::default());
    }

    /// Cancel whatever is running, reset, and start again.
    pub async fn restart_test(&self) -> Result<RunHandle, StartError> {
        let running = self.shared.lock_active().is_some();
        if running || self.snapshot().phase.is_active() {
            self.cancel_test().await;
        }
        self.reset();
        self.start_test().await
    }

    /// Publish `Done` with fixed metrics, bypassing the network entirely.
    pub async fn override_with_fixed_metrics(&self, metrics: SpeedTestMetrics) {
        self.preempt().await;
        let state = SpeedTestState {
            download_data: synthetic_graph(metrics.download.unwrap_or(0.0), SYNTHETIC_GRAPH_POINTS),
            upload_data: synthetic_graph(metrics.upload.unwrap_or(0.0), SYNTHETIC_GRAPH_POINTS),
            server_id: Some(OVERRIDE_SERVER_ID.to_string()),
            ..SpeedTestState::finished(metrics)
        };
        self.shared.state.send_replace(state);
        info!(?metrics, "state overridden with fixed metrics");
    }

    pub async fn override_scenario(&self, scenario: Scenario) {
        match scenario.metrics() {
            Some(metrics) => self.override_with_fixed_metrics(metrics).await,
            None => {
                self.preempt().await;
                self.shared.state.send_replace(SpeedTestState {
                    phase: OrchestratorPhase::Error,
                    error: Some(TestFailure::Unknown("simulated failure".to_string())),
                    ..SpeedTestState::default()
                });
                info!(?scenario, "state overridden with failure");
            }
        }
    }

    /// Retire the current run and cooldown ahead of an override.
    async fn preempt(&self) {
        let _serial = self.shared.lifecycle.lock().await;
        self.shared.tokens.invalidate();
        if let Some(run) = self.shared.take_active() {
            run.cancel.cancel();
            join_quietly(run).await;
        }
        self.shared.cooldown.stop();
    }
}

async fn join_quietly(run: ActiveRun) {
    if let Err(e) = run.task.await {
        if e.is_panic() {
            warn!(token = %run.token, "run task panicked");
        }
    }
}

impl Shared {
    fn lock_active(&self) -> std::sync::MutexGuard<'_, Option<ActiveRun>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn take_active(&self) -> Option<ActiveRun> {
        self.lock_active().take()
    }

    fn clear_active(&self, token: RunToken) {
        let mut active = self.lock_active();
        if active.as_ref().is_some_and(|run| run.token == token) {
            *active = None;
        }
    }

    /// Mutate state only while `token` is current. Returns whether applied.
    fn apply(&self, token: RunToken, f: impl FnOnce(&mut SpeedTestState)) -> bool {
        self.state.send_if_modified(|state| {
            if !self.tokens.is_current(token) {
                return false;
            }
            f(state);
            true
        })
    }

    async fn execute(self: &Arc<Self>, token: RunToken, cancel: &CancellationToken) -> RunOutcome {
        let candidates = match self.directory.discover(cancel).await {
            Ok(candidates) => candidates,
            Err(DiscoveryError::Aborted) => return RunOutcome::Cancelled,
            Err(e) => {
                warn!(%token, error = %e, "server discovery failed");
                return self.fail(token, TestFailure::from(e));
            }
        };

        let events = RunEvents {
            shared: Arc::clone(self),
            token,
        };
        let mut last_error = None;

        for (index, candidate) in candidates.iter().enumerate() {
            let applied = self.apply(token, |state| {
                *state = SpeedTestState {
                    server_id: Some(candidate.id.clone()),
                    ..SpeedTestState::starting()
                };
            });
            if !applied {
                return RunOutcome::Cancelled;
            }

            info!(%token, server = %candidate.id, attempt = index + 1, of = candidates.len(), "trying server");
            match self.provider.run(candidate, &events, cancel).await {
                Ok(result) => return self.complete(token, result),
                Err(SessionError::Aborted) => {
                    debug!(%token, "run aborted");
                    return RunOutcome::Cancelled;
                }
                Err(e) => {
                    warn!(%token, server = %candidate.id, error = %e, "server failed, moving on");
                    last_error = Some(e);
                }
            }
        }

        self.directory.invalidate();
        let failure = last_error
            .map(TestFailure::from)
            .unwrap_or(TestFailure::NoServersAvailable);
        self.fail(token, failure)
    }

    fn complete(self: &Arc<Self>, token: RunToken, result: MeasurementResult) -> RunOutcome {
        let metrics = SpeedTestMetrics::from(&result);
        let applied = self.apply(token, |state| {
            let download_data = std::mem::take(&mut state.download_data);
            let upload_data = std::mem::take(&mut state.upload_data);
            *state = SpeedTestState {
                download_data,
                upload_data,
                server_id: Some(result.server_id.clone()),
                result: Some(result.clone()),
                ..SpeedTestState::finished(metrics)
            };
        });
        if !applied {
            return RunOutcome::Cancelled;
        }

        info!(
            %token,
            server = %result.server_id,
            download_mbps = result.download_mbps,
            upload_mbps = result.upload_mbps,
            ping_ms = result.ping_ms,
            latency_ms = result.latency_ms,
            jitter_ms = result.jitter_ms,
            "speed test complete"
        );
        self.start_cooldown(token);
        RunOutcome::Completed(result)
    }

    fn fail(self: &Arc<Self>, token: RunToken, failure: TestFailure) -> RunOutcome {
        if failure.is_silent() {
            return RunOutcome::Cancelled;
        }
        let applied = self.apply(token, |state| {
            state.phase = OrchestratorPhase::Error;
            state.error = Some(failure.clone());
        });
        if !applied {
            return RunOutcome::Cancelled;
        }

        warn!(%token, error = %failure, "speed test failed");
        self.start_cooldown(token);
        RunOutcome::Failed(failure)
    }

    fn start_cooldown(self: &Arc<Self>, token: RunToken) {
        let weak: Weak<Shared> = Arc::downgrade(self);
        self.cooldown.start_if(
            || self.tokens.is_current(token),
            move |left| {
                let Some(shared) = weak.upgrade() else {
                    return;
                };
                shared.state.send_modify(|state| {
                    state.cooldown_seconds_left = left;
                    if left == 0
                        && matches!(state.phase, OrchestratorPhase::Done | OrchestratorPhase::Error)
                    {
                        state.phase = OrchestratorPhase::Idle;
                    }
                });
            },
        );
    }
}

/// Session events bound to one run.
struct RunEvents {
    shared: Arc<Shared>,
    token: RunToken,
}

impl RunEvents {
    fn observer(&self) -> Option<Arc<dyn SpeedTestEvents>> {
        self.shared
            .observer
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl SpeedTestEvents for RunEvents {
    fn on_progress(&self, phase: Phase, percent: f64, value: f64) {
        let applied = self.shared.apply(self.token, |state| {
            state.phase = phase.into();
            state.progress = percent;
            state.current_value = value.round();
            state.current_unit = unit_key(phase);
        });
        if let Some(observer) = self.observer().filter(|_| applied) {
            observer.on_progress(phase, percent, value);
        }
    }

    fn on_data_point(&self, phase: Phase, mbps: f64) {
        let applied = self.shared.apply(self.token, |state| match phase {
            Phase::Download => state.download_data.push(mbps),
            Phase::Upload => state.upload_data.push(mbps),
            Phase::Ping => {}
        });
        if let Some(observer) = self.observer().filter(|_| applied) {
            observer.on_data_point(phase, mbps);
        }
    }

    fn on_latency_sample(&self, rtt_ms: f64) {
        let applied = self.shared.apply(self.token, |state| {
            state.live_latency_ms = Some(rtt_ms);
        });
        if let Some(observer) = self.observer().filter(|_| applied) {
            observer.on_latency_sample(rtt_ms);
        }
    }

    fn on_phase_complete(&self, phase: Phase, value: f64) {
        let applied = self.shared.apply(self.token, |state| match phase {
            Phase::Ping => state.metrics.ping = Some(value.round()),
            Phase::Download => state.metrics.download = Some(round_to(value, 2)),
            Phase::Upload => state.metrics.upload = Some(round_to(value, 2)),
        });
        if let Some(observer) = self.observer().filter(|_| applied) {
            observer.on_phase_complete(phase, value);
        }
    }
}
