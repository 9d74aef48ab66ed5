// packages/engine/src/utils/config.rs
//! Engine configuration
//!
//! Configuration is layered: built-in defaults, then an optional file
//! (`config/shapes.*` or the path in `SHAPES_CONFIG`), then environment
//! variables such as `SHAPES_ATTESTATION__TOKEN=abc`.

use crate::utils::errors::{EngineError, Result};
use config::{Config, Environment, File};
use http::header::HeaderName;
use http::Uri;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Environment variable naming an explicit config file
pub const CONFIG_PATH_ENV: &str = "SHAPES_CONFIG";

/// Default config file stem, resolved against any supported extension
pub const DEFAULT_CONFIG_STEM: &str = "config/shapes";

/// Top-level engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub server: ServerConfig,
    pub transport: TransportConfig,
    pub attestation: AttestationConfig,
    pub observability: ObservabilityConfig,
}

/// Demo server location
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Base URL the `/hello` and `/shapes` endpoints hang off
    pub base_url: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: "https://demo-server.approovr.io".to_string(),
        }
    }
}

/// Which transport executes requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportMode {
    /// Real network through hyper
    Live,
    /// In-memory demo routes
    Stub,
}

/// Transport tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub mode: TransportMode,

    /// TCP connect timeout (milliseconds)
    pub connect_timeout_ms: u64,

    /// Time allowed for a whole load to reach a terminal event (milliseconds)
    pub request_timeout_ms: u64,

    /// Redirect hops followed before failing
    pub max_redirects: usize,

    /// Capacity of each task's event channel
    pub event_buffer: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            mode: TransportMode::Live,
            connect_timeout_ms: 10_000,
            request_timeout_ms: 30_000,
            max_redirects: 10,
            event_buffer: 64,
        }
    }
}

impl TransportConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// What to do when no attestation token could be obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenFailurePolicy {
    /// Send the fallback token and let the request proceed (fail-open)
    #[default]
    Sentinel,
    /// Fail the load locally without touching the network
    Abort,
}

/// Attestation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AttestationConfig {
    /// Header carrying the token
    pub header: String,

    /// Value sent when no token is available
    pub fallback_token: String,

    pub on_failure: TokenFailurePolicy,

    /// Fixed token served by the demo provider; unset means attestation fails
    pub token: Option<String>,

    /// Simulated provider latency (milliseconds)
    pub latency_ms: u64,
}

impl Default for AttestationConfig {
    fn default() -> Self {
        Self {
            header: "Approov-Token".to_string(),
            fallback_token: "NOTOKEN".to_string(),
            on_failure: TokenFailurePolicy::Sentinel,
            token: None,
            latency_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Logging and metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_format: LogFormat,

    /// `EnvFilter` directives, overridden by `RUST_LOG`
    pub log_filter: String,

    /// Install the Prometheus recorder
    pub metrics: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_format: LogFormat::Pretty,
            log_filter: "attest_relay_engine=debug,shapes_client=info,info".to_string(),
            metrics: true,
        }
    }
}

impl EngineConfig {
    /// Load configuration from defaults, the standard file locations and
    /// the environment
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).ok();
        Self::load_from(path.as_deref().map(Path::new))
    }

    /// Load configuration using an explicit file instead of the default stem
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => {
                debug!("Loading configuration from {:?}", path);
                File::from(path).required(true)
            }
            None => File::with_name(DEFAULT_CONFIG_STEM).required(false),
        };

        let config: EngineConfig = Config::builder()
            .add_source(Config::try_from(&EngineConfig::default())?)
            .add_source(file)
            .add_source(
                Environment::with_prefix("SHAPES")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        let base: Uri = self.server.base_url.parse().map_err(|e| {
            EngineError::ConfigError(format!(
                "Invalid server.base_url '{}': {}",
                self.server.base_url, e
            ))
        })?;
        if base.scheme().is_none() || base.host().is_none() {
            return Err(EngineError::ConfigError(format!(
                "server.base_url must be absolute: {}",
                self.server.base_url
            )));
        }

        HeaderName::from_bytes(self.attestation.header.as_bytes()).map_err(|_| {
            EngineError::ConfigError(format!(
                "Invalid attestation.header: {}",
                self.attestation.header
            ))
        })?;

        if self.transport.event_buffer == 0 {
            return Err(EngineError::ConfigError(
                "transport.event_buffer must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Render the effective configuration as YAML
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self)
            .map_err(|e| EngineError::ConfigError(format!("Failed to render config: {}", e)))
    }
}
