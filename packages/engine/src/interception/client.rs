// packages/engine/src/interception/client.rs
//! Downstream client callback surface
//!
//! The client is whoever waits on the original request. It sees the same
//! event vocabulary whether the request went straight to the transport or
//! through a protocol.

use crate::interception::request::{CacheStoragePolicy, InterceptedRequest};
use crate::transport::ResponseMeta;
use crate::utils::errors::TransportError;
use bytes::Bytes;
use tokio::sync::mpsc;

/// Receives the lifecycle of one load
///
/// Calls arrive in transport order and stop after `on_finished` or
/// `on_failed`. A callback may stop its own load; nothing is delivered
/// after that.
pub trait ProtocolClient: Send + Sync {
    fn on_response(&self, response: &ResponseMeta, policy: CacheStoragePolicy);
    fn on_data(&self, data: Bytes);
    fn on_redirect(&self, request: &InterceptedRequest, response: &ResponseMeta);
    fn on_failed(&self, error: TransportError);
    fn on_finished(&self);
}

/// Callback rendered as a value
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Response {
        response: ResponseMeta,
        policy: CacheStoragePolicy,
    },
    Data(Bytes),
    Redirected {
        request: InterceptedRequest,
        response: ResponseMeta,
    },
    Failed(TransportError),
    Finished,
}

impl ClientEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ClientEvent::Failed(_) | ClientEvent::Finished)
    }
}

/// Client forwarding every callback into a channel
pub struct ChannelClient {
    tx: mpsc::UnboundedSender<ClientEvent>,
}

impl ChannelClient {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ClientEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn emit(&self, event: ClientEvent) {
        // Receiver gone means nobody is waiting on the load any more
        let _ = self.tx.send(event);
    }
}

impl ProtocolClient for ChannelClient {
    fn on_response(&self, response: &ResponseMeta, policy: CacheStoragePolicy) {
        self.emit(ClientEvent::Response {
            response: response.clone(),
            policy,
        });
    }

    fn on_data(&self, data: Bytes) {
        self.emit(ClientEvent::Data(data));
    }

    fn on_redirect(&self, request: &InterceptedRequest, response: &ResponseMeta) {
        self.emit(ClientEvent::Redirected {
            request: request.clone(),
            response: response.clone(),
        });
    }

    fn on_failed(&self, error: TransportError) {
        self.emit(ClientEvent::Failed(error));
    }

    fn on_finished(&self) {
        self.emit(ClientEvent::Finished);
    }
}
