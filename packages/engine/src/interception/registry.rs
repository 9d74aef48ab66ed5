// packages/engine/src/interception/registry.rs
//! Protocol registry
//!
//! Protocols are registered on an explicit registry that sessions are built
//! with, instead of a process-wide table. Every request a session dispatches
//! is offered to the registered protocols, newest first; the first one whose
//! `can_handle` returns true takes ownership of the load.

use crate::interception::client::ProtocolClient;
use crate::interception::request::InterceptedRequest;
use crate::transport::Transport;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, info};

/// One in-flight load owned by a protocol
pub trait UrlProtocol: Send + Sync {
    /// Begin loading, reporting to `client`
    ///
    /// May block (e.g. on attestation); sessions run it on a blocking
    /// worker. Failures are reported through `client`, never returned.
    fn start(&self, client: Arc<dyn ProtocolClient>);

    /// Cancel the load; idempotent
    fn stop(&self);
}

/// Decides which requests a protocol takes and creates its instances
pub trait ProtocolFactory: Send + Sync {
    fn name(&self) -> &str;

    /// Ownership predicate, evaluated for every dispatched request
    fn can_handle(&self, request: &InterceptedRequest) -> bool;

    fn canonicalize(&self, request: InterceptedRequest) -> InterceptedRequest {
        request
    }

    fn create(&self, request: InterceptedRequest, context: ProtocolContext) -> Arc<dyn UrlProtocol>;
}

/// What a protocol instance gets to build its internal session from
#[derive(Clone)]
pub struct ProtocolContext {
    pub registry: ProtocolRegistry,
    pub transport: Arc<dyn Transport>,
}

/// Ordered set of protocol factories
#[derive(Clone, Default)]
pub struct ProtocolRegistry {
    protocols: Arc<RwLock<Vec<Arc<dyn ProtocolFactory>>>>,
}

impl ProtocolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a protocol; it is consulted before earlier registrations
    pub fn register(&self, protocol: Arc<dyn ProtocolFactory>) {
        info!("Registering protocol: {}", protocol.name());
        self.protocols.write().push(protocol);
    }

    /// Remove every protocol named `name`; returns whether any was removed
    pub fn unregister(&self, name: &str) -> bool {
        let mut protocols = self.protocols.write();
        let before = protocols.len();
        protocols.retain(|p| p.name() != name);
        let removed = protocols.len() != before;
        if removed {
            info!("Unregistered protocol: {}", name);
        }
        removed
    }

    /// First protocol willing to take `request`
    pub fn resolve(&self, request: &InterceptedRequest) -> Option<Arc<dyn ProtocolFactory>> {
        let protocols = self.protocols.read();
        let found = protocols
            .iter()
            .rev()
            .find(|p| p.can_handle(request))
            .cloned();

        match &found {
            Some(p) => debug!("Protocol {} claims {} {}", p.name(), request.method(), request.uri()),
            None => debug!("No protocol claims {} {}", request.method(), request.uri()),
        }
        found
    }

    pub fn names(&self) -> Vec<String> {
        self.protocols
            .read()
            .iter()
            .map(|p| p.name().to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.protocols.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.protocols.read().is_empty()
    }
}
