// packages/engine/src/transport/stub.rs
//! In-memory transport serving canned responses by path
//!
//! Used by the demo binary in offline mode and by tests. Every executed
//! request is recorded so callers can inspect exactly what would have gone
//! on the wire.

use crate::interception::request::InterceptedRequest;
use crate::transport::{
    negotiate_trust, ResponseDisposition, ResponseMeta, TaskSender, Transport, TransportTask,
};
use crate::utils::errors::TransportError;
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, LOCATION};
use http::StatusCode;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Canned behaviour for one path
#[derive(Debug, Clone)]
pub struct StubRoute {
    /// Request path (e.g. "/shapes")
    pub path: String,

    pub status: StatusCode,

    /// Body, delivered as one `Data` event per chunk
    pub chunks: Vec<Bytes>,

    /// Header that must be present and not equal to the rejected value
    pub required_header: Option<(HeaderName, String)>,

    /// Redirect target sent in `Location`
    pub redirect_to: Option<String>,

    /// Fail the task instead of responding
    pub failure: Option<TransportError>,

    /// Pause before each chunk
    pub chunk_delay: Option<Duration>,
}

impl StubRoute {
    pub fn new(path: impl Into<String>, status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            path: path.into(),
            status,
            chunks: vec![body.into()],
            required_header: None,
            redirect_to: None,
            failure: None,
            chunk_delay: None,
        }
    }

    pub fn ok(path: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self::new(path, StatusCode::OK, body)
    }

    /// Answer with `status` and a `Location` header
    pub fn redirect(path: impl Into<String>, status: StatusCode, location: impl Into<String>) -> Self {
        let mut route = Self::new(path, status, Bytes::new());
        route.chunks.clear();
        route.redirect_to = Some(location.into());
        route
    }

    pub fn failing(path: impl Into<String>, error: TransportError) -> Self {
        let mut route = Self::new(path, StatusCode::OK, Bytes::new());
        route.failure = Some(error);
        route
    }

    pub fn with_chunks(mut self, chunks: Vec<Bytes>) -> Self {
        self.chunks = chunks;
        self
    }

    /// Reject with 401 unless `header` is present and not `rejected`
    pub fn requiring(mut self, header: HeaderName, rejected: impl Into<String>) -> Self {
        self.required_header = Some((header, rejected.into()));
        self
    }

    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }

    fn admits(&self, request: &InterceptedRequest) -> bool {
        match &self.required_header {
            Some((name, rejected)) => request
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|v| v != rejected)
                .unwrap_or(false),
            None => true,
        }
    }
}

/// Transport answering from a route table
#[derive(Clone)]
pub struct StubTransport {
    routes: Arc<RwLock<HashMap<String, StubRoute>>>,
    requests: Arc<Mutex<Vec<InterceptedRequest>>>,
    event_buffer: usize,
}

impl StubTransport {
    pub fn new() -> Self {
        Self {
            routes: Arc::new(RwLock::new(HashMap::new())),
            requests: Arc::new(Mutex::new(Vec::new())),
            event_buffer: 16,
        }
    }

    /// Routes mirroring the shapes demo server
    ///
    /// `/shapes` only answers when `token_header` carries something other
    /// than `fallback_token`.
    pub fn with_demo_routes(token_header: HeaderName, fallback_token: &str) -> Self {
        let stub = Self::new();
        stub.add_route(StubRoute::ok("/hello", "Hello World!"));
        stub.add_route(StubRoute::ok("/shapes", "circle").requiring(token_header, fallback_token));
        stub
    }

    pub fn with_event_buffer(mut self, event_buffer: usize) -> Self {
        self.event_buffer = event_buffer;
        self
    }

    pub fn add_route(&self, route: StubRoute) {
        info!("Adding stub route: {} -> {}", route.path, route.status);
        self.routes.write().insert(route.path.clone(), route);
    }

    pub fn remove_route(&self, path: &str) -> Option<StubRoute> {
        self.routes.write().remove(path)
    }

    pub fn lookup(&self, path: &str) -> Option<StubRoute> {
        self.routes.read().get(path).cloned()
    }

    /// Requests executed so far, in order
    pub fn requests(&self) -> Vec<InterceptedRequest> {
        self.requests.lock().clone()
    }

    async fn run_task(self, request: InterceptedRequest, sender: TaskSender) {
        let cancel = sender.cancel_token().clone();
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TransportError::Cancelled),
            result = self.serve(request, &sender) => result,
        };
        sender.finish(outcome).await;
    }

    async fn serve(
        &self,
        request: InterceptedRequest,
        sender: &TaskSender,
    ) -> Result<(), TransportError> {
        let mut current = request;

        loop {
            self.requests.lock().push(current.clone());
            negotiate_trust(sender, &current).await?;

            let path = current.uri().path().to_string();
            let route = self.lookup(&path);
            debug!("Stub serving {} {} (route: {})", current.method(), path, route.is_some());

            let Some(route) = route else {
                let meta = ResponseMeta::new(current.uri().clone(), StatusCode::NOT_FOUND);
                if sender.response(meta).await? == ResponseDisposition::Allow {
                    sender.data(Bytes::from_static(b"Not Found")).await?;
                }
                return Ok(());
            };

            if let Some(error) = route.failure.clone() {
                return Err(error);
            }

            if !route.admits(&current) {
                let meta = ResponseMeta::new(current.uri().clone(), StatusCode::UNAUTHORIZED);
                if sender.response(meta).await? == ResponseDisposition::Allow {
                    sender.data(Bytes::from_static(b"Unauthorized")).await?;
                }
                return Ok(());
            }

            let mut meta = ResponseMeta::new(current.uri().clone(), route.status);

            if let Some(location) = &route.redirect_to {
                let value = HeaderValue::from_str(location)
                    .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;
                meta.headers.insert(LOCATION, value);

                if let Some(next) = super::hyper_transport::redirect_target(&current, &meta)? {
                    match sender.redirect(meta.clone(), next).await? {
                        Some(follow) => {
                            current = follow;
                            continue;
                        }
                        None => debug!("Redirect declined by consumer"),
                    }
                }
            }

            if sender.response(meta).await? == ResponseDisposition::Cancel {
                return Err(TransportError::Cancelled);
            }

            for chunk in route.chunks {
                if let Some(delay) = route.chunk_delay {
                    tokio::time::sleep(delay).await;
                }
                sender.data(chunk).await?;
            }

            return Ok(());
        }
    }
}

impl Default for StubTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for StubTransport {
    fn execute(&self, request: InterceptedRequest) -> TransportTask {
        let (task, sender) = TransportTask::channel(self.event_buffer);
        tokio::spawn(self.clone().run_task(request, sender));
        task
    }
}
