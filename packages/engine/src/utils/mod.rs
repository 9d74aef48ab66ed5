// packages/engine/src/utils/mod.rs
//! Common utilities shared across the engine
//!
//! - **config**: Layered configuration (defaults, file, environment)
//! - **errors**: Engine and transport error types

pub mod config;
pub mod errors;

pub use self::config::EngineConfig;
pub use self::errors::{EngineError, Result, TransportError};
