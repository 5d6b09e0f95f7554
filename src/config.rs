//! TOML configuration for the measurement client.
//!
//! Every section carries `#[serde(default)]` so a partial file only has to
//! name the values it overrides. The config file path can be supplied
//! through the `NDT7_CLIENT_CONFIG` environment variable; otherwise
//! `./ndt7-client.toml` is tried before falling back to compiled-in defaults.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV_VAR: &str = "NDT7_CLIENT_CONFIG";

/// Config file looked up in the working directory.
pub const LOCAL_CONFIG_FILE: &str = "ndt7-client.toml";

/// Nominal NDT7 phase length; the client may stop up to 2s earlier.
pub const NOMINAL_PHASE_MS: u64 = 10_000;
const MIN_PHASE_MS: u64 = NOMINAL_PHASE_MS - 2_000;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("session.ping_attempts must be at least 1")]
    NoPingAttempts,

    #[error("session.upload_chunk_size must be non-zero")]
    ZeroChunkSize,

    #[error("session.max_buffered_bytes ({ceiling}) must be at least one chunk ({chunk})")]
    BufferBelowChunk { ceiling: usize, chunk: usize },

    #[error("session.phase_duration_ms ({0}) must be between 8000 and 10000")]
    PhaseBudgetOutOfRange(u64),

    #[error("discovery.locate_url must not be empty")]
    EmptyLocateUrl,
}

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for the client.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpeedTestConfig {
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl SpeedTestConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded client configuration");
        Ok(config)
    }

    /// Try, in order: `$NDT7_CLIENT_CONFIG`, `./ndt7-client.toml`, defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV_VAR) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "{} set but file could not be loaded, trying fallback",
                        CONFIG_ENV_VAR
                    );
                }
            }
        }

        let local = Path::new(LOCAL_CONFIG_FILE);
        if local.exists() {
            match Self::load(local) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %local.display(),
                        error = %e,
                        "local config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.discovery.locate_url.trim().is_empty() {
            return Err(ConfigError::EmptyLocateUrl);
        }
        self.session.validate()
    }
}

// ---------------------------------------------------------------------------
// Discovery
// ---------------------------------------------------------------------------

/// Server discovery (locate API) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Locate endpoint returning the ranked candidate list.
    pub locate_url: String,
    /// How long a discovered list is reused (seconds).
    pub cache_ttl_secs: u64,
    /// Retries after the first request while the endpoint answers 429.
    pub max_rate_limit_retries: u32,
    /// Wait before retry n is `n * step` (milliseconds).
    pub backoff_step_ms: u64,
    /// HTTP request timeout (milliseconds).
    pub request_timeout_ms: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            locate_url: "https://locate.measurementlab.net/v2/nearest/ndt/ndt7".to_string(),
            cache_ttl_secs: 300,
            max_rate_limit_retries: 3,
            backoff_step_ms: 2_000,
            request_timeout_ms: 10_000,
        }
    }
}

impl DiscoveryConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn backoff_step(&self) -> Duration {
        Duration::from_millis(self.backoff_step_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Per-server protocol session settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// WebSocket subprotocol announced on every connection.
    pub subprotocol: String,
    /// Connect/close probes in the ping phase.
    pub ping_attempts: u32,
    /// Connection establishment timeout (milliseconds).
    pub connect_timeout_ms: u64,
    /// Client-side budget for the download and upload phases (milliseconds).
    pub phase_duration_ms: u64,
    /// Bytes per upload message.
    pub upload_chunk_size: usize,
    /// Unflushed upload bytes allowed before the sender waits.
    pub max_buffered_bytes: usize,
    /// Minimum gap between graph data points (milliseconds).
    pub data_point_interval_ms: u64,
    /// Phase time before data points are emitted (milliseconds).
    pub warmup_ms: u64,
    /// Progress ticker period (milliseconds).
    pub progress_interval_ms: u64,
    /// Skip client-side byte accounting of opaque payload frames and rely
    /// on server-reported counters alone.
    pub discard_opaque_frames: bool,
    /// Time allowed for the closing handshake after a phase ends (milliseconds).
    pub close_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            subprotocol: "net.measurementlab.ndt.v7".to_string(),
            ping_attempts: 3,
            connect_timeout_ms: 5_000,
            phase_duration_ms: NOMINAL_PHASE_MS,
            upload_chunk_size: 8 * 1024,
            max_buffered_bytes: 1_000_000,
            data_point_interval_ms: 200,
            warmup_ms: 1_000,
            progress_interval_ms: 100,
            discard_opaque_frames: false,
            close_timeout_ms: 1_000,
        }
    }
}

impl SessionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn phase_duration(&self) -> Duration {
        Duration::from_millis(self.phase_duration_ms)
    }

    pub fn data_point_interval(&self) -> Duration {
        Duration::from_millis(self.data_point_interval_ms)
    }

    pub fn warmup(&self) -> Duration {
        Duration::from_millis(self.warmup_ms)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms.max(1))
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ping_attempts == 0 {
            return Err(ConfigError::NoPingAttempts);
        }
        if self.upload_chunk_size == 0 {
            return Err(ConfigError::ZeroChunkSize);
        }
        if self.max_buffered_bytes < self.upload_chunk_size {
            return Err(ConfigError::BufferBelowChunk {
                ceiling: self.max_buffered_bytes,
                chunk: self.upload_chunk_size,
            });
        }
        if !(MIN_PHASE_MS..=NOMINAL_PHASE_MS).contains(&self.phase_duration_ms) {
            return Err(ConfigError::PhaseBudgetOutOfRange(self.phase_duration_ms));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Time after a finished or failed run before the next user start (seconds).
    pub cooldown_secs: u64,
    /// Use the simulated provider instead of the network.
    pub simulate: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: 60,
            simulate: false,
        }
    }
}

impl OrchestratorConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level (`trace`, `debug`, `info`, `warn`, `error`).
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let cfg = SpeedTestConfig::default();

        assert_eq!(
            cfg.discovery.locate_url,
            "https://locate.measurementlab.net/v2/nearest/ndt/ndt7"
        );
        assert_eq!(cfg.discovery.cache_ttl(), Duration::from_secs(300));
        assert_eq!(cfg.discovery.max_rate_limit_retries, 3);
        assert_eq!(cfg.discovery.backoff_step(), Duration::from_secs(2));

        assert_eq!(cfg.session.subprotocol, "net.measurementlab.ndt.v7");
        assert_eq!(cfg.session.ping_attempts, 3);
        assert_eq!(cfg.session.connect_timeout(), Duration::from_secs(5));
        assert_eq!(cfg.session.phase_duration(), Duration::from_secs(10));
        assert_eq!(cfg.session.upload_chunk_size, 8192);
        assert_eq!(cfg.session.max_buffered_bytes, 1_000_000);
        assert_eq!(cfg.session.data_point_interval(), Duration::from_millis(200));
        assert_eq!(cfg.session.warmup(), Duration::from_secs(1));
        assert!(!cfg.session.discard_opaque_frames);

        assert_eq!(cfg.orchestrator.cooldown(), Duration::from_secs(60));
        assert!(!cfg.orchestrator.simulate);
        assert_eq!(cfg.logging.level, "info");

        assert_eq!(cfg.validate(), Ok(()));
    }

    #[test]
    fn test_parse_example_toml() {
        let toml_str = r#"
[discovery]
locate_url = "http://127.0.0.1:9000/v2/nearest/ndt/ndt7"
cache_ttl_secs = 60
backoff_step_ms = 500

[session]
phase_duration_ms = 8000
discard_opaque_frames = true
max_buffered_bytes = 65536

[orchestrator]
cooldown_secs = 15
simulate = true

[logging]
level = "debug"
json = true
"#;

        let cfg: SpeedTestConfig = toml::from_str(toml_str).unwrap();

        assert_eq!(cfg.discovery.locate_url, "http://127.0.0.1:9000/v2/nearest/ndt/ndt7");
        assert_eq!(cfg.discovery.cache_ttl_secs, 60);
        assert_eq!(cfg.discovery.backoff_step_ms, 500);
        assert_eq!(cfg.discovery.max_rate_limit_retries, 3);
        assert_eq!(cfg.session.phase_duration_ms, 8000);
        assert!(cfg.session.discard_opaque_frames);
        assert_eq!(cfg.session.max_buffered_bytes, 65536);
        assert_eq!(cfg.session.upload_chunk_size, 8192);
        assert_eq!(cfg.orchestrator.cooldown_secs, 15);
        assert!(cfg.orchestrator.simulate);
        assert_eq!(cfg.logging.level, "debug");
        assert!(cfg.logging.json);
        assert_eq!(cfg.validate(), Ok(()));
    }

    #[test]
    fn test_empty_toml_uses_all_defaults() {
        let cfg: SpeedTestConfig = toml::from_str("").unwrap();
        let defaults = SpeedTestConfig::default();
        assert_eq!(cfg.discovery.locate_url, defaults.discovery.locate_url);
        assert_eq!(cfg.session.phase_duration_ms, defaults.session.phase_duration_ms);
        assert_eq!(cfg.orchestrator.cooldown_secs, defaults.orchestrator.cooldown_secs);
    }

    #[test]
    fn test_validate_rejects_bad_session_values() {
        let mut session = SessionConfig {
            phase_duration_ms: 12_000,
            ..SessionConfig::default()
        };
        assert_eq!(
            session.validate(),
            Err(ConfigError::PhaseBudgetOutOfRange(12_000))
        );

        session.phase_duration_ms = 7_999;
        assert_eq!(
            session.validate(),
            Err(ConfigError::PhaseBudgetOutOfRange(7_999))
        );

        session.phase_duration_ms = 9_000;
        session.max_buffered_bytes = 1024;
        assert_eq!(
            session.validate(),
            Err(ConfigError::BufferBelowChunk {
                ceiling: 1024,
                chunk: 8192
            })
        );

        session.max_buffered_bytes = 1_000_000;
        session.ping_attempts = 0;
        assert_eq!(session.validate(), Err(ConfigError::NoPingAttempts));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.toml");
        std::fs::write(&path, "[orchestrator]\ncooldown_secs = 5\n").unwrap();

        let cfg = SpeedTestConfig::load(&path).unwrap();
        assert_eq!(cfg.orchestrator.cooldown_secs, 5);
    }

    #[test]
    fn test_load_rejects_invalid_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.toml");
        std::fs::write(&path, "[session]\nupload_chunk_size = 0\n").unwrap();

        assert!(SpeedTestConfig::load(&path).is_err());
    }
}
