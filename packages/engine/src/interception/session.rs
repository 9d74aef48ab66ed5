// packages/engine/src/interception/session.rs
//! Host session: the single dispatch point for requests
//!
//! A session offers each request to its registry. A claimed request is
//! handed to a protocol instance, started on a blocking worker because
//! protocols may block (attestation). Unclaimed requests go to the
//! session's transport through an `EventRelay`.

use crate::interception::client::{ChannelClient, ClientEvent, ProtocolClient};
use crate::interception::registry::{ProtocolContext, ProtocolRegistry, UrlProtocol};
use crate::interception::relay::{EventRelay, LoadHandle};
use crate::interception::request::InterceptedRequest;
use crate::transport::Transport;
use crate::utils::errors::{EngineError, Result, TransportError};
use bytes::{Bytes, BytesMut};
use http::{HeaderMap, StatusCode, Uri};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// A load started by `Session::dispatch`
pub enum LoadingTask {
    Direct(LoadHandle),
    Protocol(Arc<dyn UrlProtocol>),
}

impl LoadingTask {
    pub fn stop(&self) {
        match self {
            LoadingTask::Direct(handle) => handle.stop(),
            LoadingTask::Protocol(protocol) => protocol.stop(),
        }
    }

    pub fn is_intercepted(&self) -> bool {
        matches!(self, LoadingTask::Protocol(_))
    }
}

/// Fully collected response
#[derive(Debug, Clone)]
pub struct Response {
    pub url: Uri,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Response {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Dispatches requests through a registry onto a transport
#[derive(Clone)]
pub struct Session {
    registry: ProtocolRegistry,
    transport: Arc<dyn Transport>,
    request_timeout: Duration,
}

impl Session {
    pub fn new(registry: ProtocolRegistry, transport: Arc<dyn Transport>) -> Self {
        Self {
            registry,
            transport,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Session with no protocols: every request goes straight to `transport`
    pub fn plain(transport: Arc<dyn Transport>) -> Self {
        Self::new(ProtocolRegistry::new(), transport)
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &ProtocolRegistry {
        &self.registry
    }

    fn context(&self) -> ProtocolContext {
        ProtocolContext {
            registry: self.registry.clone(),
            transport: Arc::clone(&self.transport),
        }
    }

    /// Start loading `request`, reporting to `client`
    ///
    /// Must be called inside a tokio runtime.
    pub fn dispatch(&self, request: InterceptedRequest, client: Arc<dyn ProtocolClient>) -> LoadingTask {
        match self.registry.resolve(&request) {
            Some(factory) => {
                let request = factory.canonicalize(request);
                let protocol = factory.create(request, self.context());

                let starter = Arc::clone(&protocol);
                tokio::task::spawn_blocking(move || starter.start(client));

                LoadingTask::Protocol(protocol)
            }
            None => {
                let task = self.transport.execute(request.clone());
                debug!(task = %task.id, "Dispatching {} {} directly", request.method(), request.uri());
                LoadingTask::Direct(EventRelay::spawn(&request, client, task))
            }
        }
    }

    /// Load `request` and collect the whole response
    pub async fn data_task(&self, request: InterceptedRequest) -> Result<Response> {
        let (client, mut events) = ChannelClient::new();
        let task = self.dispatch(request, Arc::new(client));

        match tokio::time::timeout(self.request_timeout, collect_response(&mut events)).await {
            Ok(result) => result,
            Err(_) => {
                warn!("Load timed out after {:?}, stopping", self.request_timeout);
                task.stop();
                Err(EngineError::Timeout(self.request_timeout.as_millis() as u64))
            }
        }
    }
}

async fn collect_response(events: &mut mpsc::UnboundedReceiver<ClientEvent>) -> Result<Response> {
    let mut response = None;
    let mut body = BytesMut::new();
    let mut finished = false;

    while let Some(event) = events.recv().await {
        match event {
            ClientEvent::Response { response: meta, .. } => {
                response = Some(meta);
                body.clear();
            }
            ClientEvent::Data(bytes) => body.extend_from_slice(&bytes),
            ClientEvent::Redirected { request, .. } => {
                debug!("Redirected to {}", request.uri());
            }
            ClientEvent::Failed(error) => return Err(error.into()),
            ClientEvent::Finished => {
                finished = true;
                break;
            }
        }
    }

    if !finished {
        return Err(TransportError::Closed.into());
    }

    let meta = response.ok_or_else(|| {
        EngineError::InterceptionFailed("load finished without a response".to_string())
    })?;

    Ok(Response {
        url: meta.url,
        status: meta.status,
        headers: meta.headers,
        body: body.freeze(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{StubRoute, StubTransport};

    #[tokio::test]
    async fn test_plain_session_collects_response() {
        let stub = StubTransport::new();
        stub.add_route(
            StubRoute::ok("/hello", "")
                .with_chunks(vec![Bytes::from_static(b"Hello "), Bytes::from_static(b"World!")]),
        );
        let session = Session::plain(Arc::new(stub.clone()));

        let response = session
            .data_task(InterceptedRequest::get("https://demo.test/hello").unwrap())
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.text(), "Hello World!");
        assert_eq!(stub.requests().len(), 1);
        assert!(!stub.requests()[0].is_handled());
    }

    #[tokio::test]
    async fn test_failure_surfaces_as_error() {
        let stub = StubTransport::new();
        stub.add_route(StubRoute::failing("/down", TransportError::Connect("refused".into())));
        let session = Session::plain(Arc::new(stub));

        let result = session
            .data_task(InterceptedRequest::get("http://demo.test/down").unwrap())
            .await;
        assert!(matches!(
            result,
            Err(EngineError::Transport(TransportError::Connect(_)))
        ));
    }

    #[tokio::test]
    async fn test_redirect_body_comes_from_final_response() {
        let stub = StubTransport::new();
        stub.add_route(StubRoute::redirect("/old", StatusCode::MOVED_PERMANENTLY, "/new"));
        stub.add_route(StubRoute::ok("/new", "here"));
        let session = Session::plain(Arc::new(stub));

        let response = session
            .data_task(InterceptedRequest::get("http://demo.test/old").unwrap())
            .await
            .unwrap();
        assert_eq!(response.url.path(), "/new");
        assert_eq!(response.text(), "here");
    }

    #[tokio::test]
    async fn test_timeout_stops_load() {
        let stub = StubTransport::new();
        stub.add_route(StubRoute::ok("/slow", "late").with_chunk_delay(Duration::from_secs(5)));
        let session =
            Session::plain(Arc::new(stub)).with_request_timeout(Duration::from_millis(50));

        let result = session
            .data_task(InterceptedRequest::get("http://demo.test/slow").unwrap())
            .await;
        assert!(matches!(result, Err(EngineError::Timeout(50))));
    }
}
