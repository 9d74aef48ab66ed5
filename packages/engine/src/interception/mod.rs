// packages/engine/src/interception/mod.rs
//! Request interception layer
//!
//! - **Registry**: ordered protocols that may claim a request
//! - **Session**: dispatch point consulting the registry
//! - **HTTP Interceptor**: attaches an attestation token and re-issues
//! - **Event Relay**: forwards transport events to the waiting client
//! - **Request**: the request value, with its `handled` marker
//!
//! # Architecture
//!
//! ```text
//! Session::dispatch(request)
//!     │
//!     ├─ claimed   → HttpInterceptor::start
//!     │                 ├─ fetch token (blocking)
//!     │                 └─ internal Session::dispatch(stamped request)
//!     │                        └─ declined (handled) → transport
//!     │
//!     └─ unclaimed → Transport::execute → EventRelay → client
//! ```

pub mod client;
pub mod http_interceptor;
pub mod registry;
pub mod relay;
pub mod request;
pub mod session;

// Re-export commonly used types
pub use client::{ChannelClient, ClientEvent, ProtocolClient};
pub use http_interceptor::{AttestationProtocol, HttpInterceptor, InterceptPhase, InterceptorConfig};
pub use registry::{ProtocolContext, ProtocolFactory, ProtocolRegistry, UrlProtocol};
pub use relay::{EventRelay, LoadHandle, RelayPhase};
pub use request::{CachePolicy, CacheStoragePolicy, InterceptedRequest};
pub use session::{LoadingTask, Response, Session};
