// packages/engine/src/observability/mod.rs
//! Logging and metrics setup
//!
//! Metric names emitted by the engine:
//!
//! - `interceptor_requests_total`: requests claimed by the attestation protocol
//! - `attestation_tokens_total{outcome}`: provider results (`success`, `failure`, `no_host`)
//! - `relay_events_total{kind}`: events forwarded to downstream clients
//! - `relay_terminal_total{phase}`: loads reaching `completed`, `failed` or `cancelled`

use crate::utils::config::{LogFormat, ObservabilityConfig};
use crate::utils::errors::{EngineError, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber
///
/// `RUST_LOG` wins over the configured filter when set.
pub fn init_tracing(config: &ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_filter))
        .map_err(|e| EngineError::ConfigError(format!("Invalid log filter: {}", e)))?;

    let registry = tracing_subscriber::registry().with(filter);

    let result = match config.log_format {
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).try_init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init(),
    };

    result.map_err(|e| EngineError::ConfigError(format!("Failed to init tracing: {}", e)))
}

/// Install the Prometheus recorder and return a handle for rendering
pub fn init_metrics() -> Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| EngineError::ConfigError(format!("Failed to install metrics recorder: {}", e)))
}
