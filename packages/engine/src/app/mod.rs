// packages/engine/src/app/mod.rs
//! Application layer driving the demo endpoints
//!
//! `GET /hello` goes out on a plain session. `GET /shapes` goes out on a
//! session whose registry holds the attestation protocol.

pub mod controller;

pub use controller::{Outcome, Shape, ShapesController, Verdict};
