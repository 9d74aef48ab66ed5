// packages/engine/src/utils/errors.rs
//! Error types for the engine
//!
//! `EngineError` is what library callers see. `TransportError` is the
//! terminal failure carried through the event relay to downstream clients,
//! so it is cheap to clone and holds only rendered messages.

use thiserror::Error;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Engine errors
#[derive(Error, Debug)]
pub enum EngineError {
    /// Configuration could not be loaded or is invalid
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Request could not be built
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Network or transport failure surfaced by a load
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Load did not reach a terminal event in time
    #[error("Request timed out after {0} ms")]
    Timeout(u64),

    /// Interception layer failure
    #[error("Interception failed: {0}")]
    InterceptionFailed(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for EngineError {
    fn from(err: config::ConfigError) -> Self {
        EngineError::ConfigError(err.to_string())
    }
}

/// Terminal failure of a single transport task
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Response body error: {0}")]
    Body(String),

    #[error("Too many redirects (limit: {0})")]
    TooManyRedirects(usize),

    #[error("Server trust rejected for {0}")]
    TrustRejected(String),

    #[error("Attestation rejected request to {0}")]
    AttestationRejected(String),

    #[error("Task cancelled")]
    Cancelled,

    #[error("Session invalidated: {0}")]
    SessionInvalidated(String),

    /// Transport went away without delivering a terminal event
    #[error("Transport closed before completion")]
    Closed,
}
