// packages/engine/src/main.rs
//! Shapes client
//!
//! Runs the unprotected `/hello` check and the attested `/shapes` check
//! against the configured server and prints both outcomes.

use anyhow::{Context, Result};
use attest_relay_engine::app::ShapesController;
use attest_relay_engine::attestation::{AttestationProvider, StaticTokenProvider, UnavailableProvider};
use attest_relay_engine::interception::http_interceptor::InterceptorConfig;
use attest_relay_engine::observability::{init_metrics, init_tracing};
use attest_relay_engine::transport::{HyperTransport, StubTransport, Transport};
use attest_relay_engine::utils::config::{EngineConfig, LogFormat, TransportMode};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = EngineConfig::load().context("Failed to load configuration")?;

    // Initialize observability (tracing, metrics)
    init_tracing(&config.observability)?;
    let metrics = if config.observability.metrics {
        Some(init_metrics()?)
    } else {
        None
    };

    info!("Starting shapes client v{}", attest_relay_engine::VERSION);
    debug!("Configuration loaded: {:?}", config);

    let provider: Arc<dyn AttestationProvider> = match &config.attestation.token {
        Some(token) => Arc::new(
            StaticTokenProvider::new(token.clone())
                .with_latency(Duration::from_millis(config.attestation.latency_ms)),
        ),
        None => {
            info!("No attestation token configured, protected requests will carry the fallback");
            Arc::new(UnavailableProvider)
        }
    };

    let transport: Arc<dyn Transport> = match config.transport.mode {
        TransportMode::Live => {
            info!("Using live transport against {}", config.server.base_url);
            Arc::new(HyperTransport::new(&config.transport))
        }
        TransportMode::Stub => {
            let interceptor = InterceptorConfig::from_attestation(&config.attestation)?;
            let fallback = config.attestation.fallback_token.as_str();
            info!("Using stub transport");
            Arc::new(
                StubTransport::with_demo_routes(interceptor.header, fallback)
                    .with_event_buffer(config.transport.event_buffer),
            )
        }
    };

    let controller = ShapesController::from_config(&config, provider, transport)?;

    let outcomes = [controller.check_hello().await, controller.check_shape().await];
    for outcome in &outcomes {
        match config.observability.log_format {
            LogFormat::Json => println!("{}", serde_json::to_string(outcome)?),
            LogFormat::Pretty => println!("{}", outcome),
        }
    }

    if let Some(handle) = metrics {
        debug!("Metrics:\n{}", handle.render());
    }

    Ok(())
}
