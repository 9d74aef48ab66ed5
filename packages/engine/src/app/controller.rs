// packages/engine/src/app/controller.rs
//! Shapes controller: the two demo checks

use crate::attestation::AttestationProvider;
use crate::interception::http_interceptor::{AttestationProtocol, InterceptorConfig};
use crate::interception::registry::ProtocolRegistry;
use crate::interception::request::InterceptedRequest;
use crate::interception::session::{Response, Session};
use crate::transport::Transport;
use crate::utils::config::EngineConfig;
use crate::utils::errors::{EngineError, Result};
use http::StatusCode;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

/// Shapes served by `/shapes`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Shape {
    Circle,
    Rectangle,
    Square,
    Triangle,
}

impl Shape {
    /// Parse a response body; case and surrounding whitespace are ignored
    pub fn parse(text: &str) -> Option<Self> {
        match text.trim().to_lowercase().as_str() {
            "circle" => Some(Shape::Circle),
            "rectangle" => Some(Shape::Rectangle),
            "square" => Some(Shape::Square),
            "triangle" => Some(Shape::Triangle),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Shape::Circle => "circle",
            Shape::Rectangle => "rectangle",
            Shape::Square => "square",
            Shape::Triangle => "triangle",
        }
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a check concluded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Hello,
    Shape(Shape),
    Confused,
}

/// Result of one check, ready for display
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Outcome {
    pub endpoint: String,
    pub status: Option<u16>,
    pub verdict: Verdict,
    pub message: String,
}

impl Outcome {
    fn confused(endpoint: &str, status: Option<u16>, message: String) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            status,
            verdict: Verdict::Confused,
            message,
        }
    }

    pub fn is_confused(&self) -> bool {
        self.verdict == Verdict::Confused
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.endpoint, self.message)
    }
}

/// Issues the plain and the protected request
pub struct ShapesController {
    plain: Session,
    protected: Session,
    base_url: String,
}

impl ShapesController {
    /// Build both sessions over `transport`; only the protected one carries
    /// the attestation protocol
    pub fn new(
        base_url: impl Into<String>,
        transport: Arc<dyn Transport>,
        protocol: AttestationProtocol,
    ) -> Self {
        let registry = ProtocolRegistry::new();
        registry.register(Arc::new(protocol));

        Self {
            plain: Session::plain(Arc::clone(&transport)),
            protected: Session::new(registry, transport),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn from_config(
        config: &EngineConfig,
        provider: Arc<dyn AttestationProvider>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        let interceptor = InterceptorConfig::from_attestation(&config.attestation)?;
        let timeout = config.transport.request_timeout();

        let mut controller = Self::new(
            config.server.base_url.clone(),
            transport,
            AttestationProtocol::new(interceptor, provider),
        );
        controller.plain = controller.plain.with_request_timeout(timeout);
        controller.protected = controller.protected.with_request_timeout(timeout);
        Ok(controller)
    }

    pub fn protected_session(&self) -> &Session {
        &self.protected
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Unprotected liveness check against `/hello`
    pub async fn check_hello(&self) -> Outcome {
        let url = self.url("/hello");
        let outcome = match fetch(&self.plain, &url).await {
            Ok(response) if response.status == StatusCode::OK => Outcome {
                endpoint: url.clone(),
                status: Some(response.status.as_u16()),
                verdict: Verdict::Hello,
                message: format!("{}: OK", response.status.as_u16()),
            },
            Ok(response) => unexpected_status(&url, response.status),
            Err(e) => network_failure(&url, e),
        };
        info!("{}", outcome);
        outcome
    }

    /// Attested request against `/shapes`
    pub async fn check_shape(&self) -> Outcome {
        let url = self.url("/shapes");
        let outcome = match fetch(&self.protected, &url).await {
            Ok(response) if response.status == StatusCode::OK => {
                let code = response.status.as_u16();
                let text = response.text().trim().to_lowercase();
                match Shape::parse(&text) {
                    Some(shape) => Outcome {
                        endpoint: url.clone(),
                        status: Some(code),
                        verdict: Verdict::Shape(shape),
                        message: format!("{}: Approoved!", code),
                    },
                    None => Outcome::confused(
                        &url,
                        Some(code),
                        format!("{}: Approoved: unknown shape '{}'", code, text),
                    ),
                }
            }
            Ok(response) => unexpected_status(&url, response.status),
            Err(e) => network_failure(&url, e),
        };
        info!("{}", outcome);
        outcome
    }
}

async fn fetch(session: &Session, url: &str) -> Result<Response> {
    let request = InterceptedRequest::get(url)?;
    session.data_task(request).await
}

fn unexpected_status(url: &str, status: StatusCode) -> Outcome {
    let reason = status.canonical_reason().unwrap_or("Unknown status");
    Outcome::confused(url, Some(status.as_u16()), format!("{}: {}", status.as_u16(), reason))
}

fn network_failure(url: &str, error: EngineError) -> Outcome {
    warn!("Request to {} failed: {}", url, error);
    Outcome::confused(url, None, "Unknown networking error".to_string())
}
