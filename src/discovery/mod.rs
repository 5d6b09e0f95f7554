//! Measurement server discovery.
//!
//! [`ServerDirectory`] asks the locate endpoint for a proximity-ranked list
//! of candidates and caches it. The cache is an immutable snapshot swapped
//! under a lock, so readers never see a half-updated list. Only one fetch
//! runs at a time; callers arriving while it is in flight wait for it and
//! then read the snapshot it stored.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::DiscoveryConfig;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum DiscoveryError {
    #[error("server discovery failed: rate limited (429) after {attempts} attempts")]
    RateLimited { attempts: u32 },

    #[error("no test servers available")]
    EmptyResult,

    #[error("server discovery failed: {0}")]
    Transport(String),

    #[error("aborted")]
    Aborted,
}

/// Endpoint kinds a candidate exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolVariant {
    Download,
    Upload,
}

impl ProtocolVariant {
    fn path_segment(&self) -> &'static str {
        match self {
            ProtocolVariant::Download => "download",
            ProtocolVariant::Upload => "upload",
        }
    }
}

/// One discovered measurement server. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub id: String,
    pub urls: HashMap<ProtocolVariant, String>,
}

impl Candidate {
    pub fn url(&self, variant: ProtocolVariant) -> Option<&str> {
        self.urls.get(&variant).map(String::as_str)
    }

    /// Build a candidate from one locate result: `wss://` keys are
    /// preferred, then `ws://`, then a URL derived from the machine name.
    fn from_locate(result: LocateEntry) -> Self {
        let mut urls = HashMap::with_capacity(2);
        for variant in [ProtocolVariant::Download, ProtocolVariant::Upload] {
            let segment = variant.path_segment();
            let wss_key = format!("wss:///ndt/v7/{segment}");
            let ws_key = format!("ws:///ndt/v7/{segment}");
            let url = result
                .urls
                .get(&wss_key)
                .or_else(|| result.urls.get(&ws_key))
                .cloned()
                .unwrap_or_else(|| {
                    let host = result
                        .hostname
                        .clone()
                        .unwrap_or_else(|| format!("ndt-{}", result.machine));
                    format!("wss://{host}/ndt/v7/{segment}")
                });
            urls.insert(variant, url);
        }
        Self {
            id: result.machine,
            urls,
        }
    }
}

/// The cached candidate list and when it was fetched.
#[derive(Debug, Clone)]
pub struct CachedDirectory {
    pub candidates: Arc<[Candidate]>,
    pub fetched_at: Instant,
}

impl CachedDirectory {
    pub fn is_fresh(&self, ttl: Duration) -> bool {
        self.fetched_at.elapsed() < ttl
    }
}

#[derive(Debug, Deserialize)]
struct LocateResponse {
    #[serde(default)]
    results: Vec<LocateEntry>,
}

#[derive(Debug, Deserialize)]
struct LocateEntry {
    machine: String,
    #[serde(default)]
    hostname: Option<String>,
    #[serde(default)]
    urls: HashMap<String, String>,
}

/// Source of ranked candidates, injectable so the orchestrator can be
/// driven without a network.
#[async_trait::async_trait]
pub trait CandidateSource: Send + Sync {
    async fn discover(&self, cancel: &CancellationToken)
        -> Result<Arc<[Candidate]>, DiscoveryError>;

    /// Forget any cached list; the next `discover` fetches afresh.
    fn invalidate(&self);
}

/// A fixed candidate list that never expires. Backs the simulated mode.
pub struct StaticCandidates {
    candidates: Arc<[Candidate]>,
}

impl StaticCandidates {
    pub fn new(candidates: Vec<Candidate>) -> Self {
        Self {
            candidates: candidates.into(),
        }
    }
}

#[async_trait::async_trait]
impl CandidateSource for StaticCandidates {
    async fn discover(
        &self,
        _cancel: &CancellationToken,
    ) -> Result<Arc<[Candidate]>, DiscoveryError> {
        if self.candidates.is_empty() {
            return Err(DiscoveryError::EmptyResult);
        }
        Ok(Arc::clone(&self.candidates))
    }

    fn invalidate(&self) {}
}

pub struct ServerDirectory {
    client: reqwest::Client,
    config: DiscoveryConfig,
    cache: RwLock<Option<CachedDirectory>>,
    fetch_lock: tokio::sync::Mutex<()>,
}

impl ServerDirectory {
    pub fn new(config: DiscoveryConfig) -> Result<Self, DiscoveryError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| DiscoveryError::Transport(e.to_string()))?;
        Ok(Self::with_client(client, config))
    }

    pub fn with_client(client: reqwest::Client, config: DiscoveryConfig) -> Self {
        Self {
            client,
            config,
            cache: RwLock::new(None),
            fetch_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn cached(&self) -> Option<Arc<[Candidate]>> {
        let guard = self.cache.read().unwrap_or_else(|e| e.into_inner());
        guard
            .as_ref()
            .filter(|c| c.is_fresh(self.config.cache_ttl()))
            .map(|c| Arc::clone(&c.candidates))
    }

    fn store(&self, candidates: Arc<[Candidate]>) {
        let mut guard = self.cache.write().unwrap_or_else(|e| e.into_inner());
        *guard = Some(CachedDirectory {
            candidates,
            fetched_at: Instant::now(),
        });
    }

    async fn fetch(&self, cancel: &CancellationToken) -> Result<Arc<[Candidate]>, DiscoveryError> {
        // the first request plus one per retry
        let attempts = self.config.max_rate_limit_retries + 1;

        for attempt in 1..=attempts {
            if cancel.is_cancelled() {
                return Err(DiscoveryError::Aborted);
            }

            let response = tokio::select! {
                _ = cancel.cancelled() => return Err(DiscoveryError::Aborted),
                r = self.client.get(&self.config.locate_url).send() => r,
            }
            .map_err(|e| DiscoveryError::Transport(e.to_string()))?;

            let status = response.status();
            if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                if attempt == attempts {
                    break;
                }
                let delay = self.config.backoff_step() * attempt;
                warn!(attempt, delay_ms = delay.as_millis() as u64, "locate rate limited (429), backing off");
                tokio::select! {
                    _ = cancel.cancelled() => return Err(DiscoveryError::Aborted),
                    _ = tokio::time::sleep(delay) => {}
                }
                continue;
            }
            if !status.is_success() {
                return Err(DiscoveryError::Transport(format!("status {}", status.as_u16())));
            }

            let body: LocateResponse = response
                .json()
                .await
                .map_err(|e| DiscoveryError::Transport(format!("invalid locate response: {e}")))?;
            if body.results.is_empty() {
                return Err(DiscoveryError::EmptyResult);
            }

            let candidates: Arc<[Candidate]> = body
                .results
                .into_iter()
                .map(Candidate::from_locate)
                .collect();
            info!(
                servers = ?candidates.iter().map(|c| c.id.as_str()).collect::<Vec<_>>(),
                "discovered measurement servers"
            );
            return Ok(candidates);
        }

        Err(DiscoveryError::RateLimited { attempts })
    }
}

#[async_trait::async_trait]
impl CandidateSource for ServerDirectory {
    async fn discover(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Arc<[Candidate]>, DiscoveryError> {
        if let Some(candidates) = self.cached() {
            debug!(count = candidates.len(), "using cached servers");
            return Ok(candidates);
        }

        let _in_flight = tokio::select! {
            _ = cancel.cancelled() => return Err(DiscoveryError::Aborted),
            guard = self.fetch_lock.lock() => guard,
        };

        // a fetch that finished while we waited already filled the cache
        if let Some(candidates) = self.cached() {
            return Ok(candidates);
        }

        let candidates = self.fetch(cancel).await?;
        self.store(Arc::clone(&candidates));
        Ok(candidates)
    }

    fn invalidate(&self) {
        let mut guard = self.cache.write().unwrap_or_else(|e| e.into_inner());
        if guard.take().is_some() {
            info!("server cache invalidated");
        }
    }
}
