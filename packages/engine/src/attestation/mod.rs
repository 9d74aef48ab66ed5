// packages/engine/src/attestation/mod.rs
//! Attestation token providers
//!
//! The provider is a black box to the interception layer: given a host it
//! blocks until it can answer with a token or a failure. Implementations must
//! be safe to call concurrently from several interceptors.

use std::time::Duration;
use tracing::debug;

/// Outcome of a token fetch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttestationResult {
    Success(String),
    Failure,
}

impl AttestationResult {
    pub fn token(&self) -> Option<&str> {
        match self {
            AttestationResult::Success(token) => Some(token),
            AttestationResult::Failure => None,
        }
    }
}

/// Fetches an attestation token for a host, blocking the caller
pub trait AttestationProvider: Send + Sync {
    fn fetch_token(&self, host: &str) -> AttestationResult;
}

impl<F> AttestationProvider for F
where
    F: Fn(&str) -> AttestationResult + Send + Sync,
{
    fn fetch_token(&self, host: &str) -> AttestationResult {
        self(host)
    }
}

/// Serves one fixed token for every host
#[derive(Debug, Clone)]
pub struct StaticTokenProvider {
    token: String,
    latency: Duration,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            latency: Duration::ZERO,
        }
    }

    /// Sleep for `latency` on every fetch, like a remote attestation round trip
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }
}

impl AttestationProvider for StaticTokenProvider {
    fn fetch_token(&self, host: &str) -> AttestationResult {
        if !self.latency.is_zero() {
            std::thread::sleep(self.latency);
        }
        debug!("Issued static token for {}", host);
        AttestationResult::Success(self.token.clone())
    }
}

/// Provider with no attestation service behind it
#[derive(Debug, Clone, Copy, Default)]
pub struct UnavailableProvider;

impl AttestationProvider for UnavailableProvider {
    fn fetch_token(&self, host: &str) -> AttestationResult {
        debug!("No attestation service available for {}", host);
        AttestationResult::Failure
    }
}
