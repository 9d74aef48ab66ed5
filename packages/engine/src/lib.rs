// packages/engine/src/lib.rs
//! Attestation Relay Engine Library
//!
//! Intercepts outbound HTTP requests, attaches an attestation token to each
//! one and relays the resulting transport events back to the original
//! caller as if nothing had intercepted the request.
//!
//! # Architecture
//!
//! The engine is structured into several key modules:
//!
//! - **attestation**: token provider contract and demo providers
//! - **interception**: request wrapper, protocol registry, interceptor, relay
//! - **transport**: transport contract, hyper and stub transports
//! - **app**: the shapes demo controller
//! - **observability**: tracing and metrics
//! - **utils**: configuration and errors

// Public module exports
pub mod app;
pub mod attestation;
pub mod interception;
pub mod observability;
pub mod transport;
pub mod utils;

// Re-export commonly used types
pub use app::{Outcome, ShapesController};
pub use attestation::{AttestationProvider, AttestationResult};
pub use interception::{AttestationProtocol, InterceptedRequest, ProtocolRegistry, Session};
pub use transport::{HyperTransport, StubTransport, Transport};
pub use utils::config::EngineConfig;
pub use utils::errors::{EngineError, Result, TransportError};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
