// packages/engine/src/interception/http_interceptor.rs
//! Attestation-token interceptor
//!
//! Claims every request that has not been through it yet, fetches a token
//! for the request's host, injects it as a header and re-issues the request
//! on its own internal session. That session shares the registry, so the
//! re-issued request is offered to this protocol again and declined thanks
//! to the `handled` marker.

use crate::attestation::{AttestationProvider, AttestationResult};
use crate::interception::client::ProtocolClient;
use crate::interception::registry::{ProtocolContext, ProtocolFactory, UrlProtocol};
use crate::interception::request::InterceptedRequest;
use crate::interception::session::{LoadingTask, Session};
use crate::utils::config::{AttestationConfig, TokenFailurePolicy};
use crate::utils::errors::{EngineError, Result, TransportError};
use http::header::{HeaderName, HeaderValue};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, warn};
use ulid::Ulid;

/// Registry name of the attestation protocol
pub const PROTOCOL_NAME: &str = "attestation-token";

/// Header carrying the token unless configured otherwise
pub const TOKEN_HEADER: &str = "Approov-Token";

/// Value sent when no token could be obtained
pub const NO_TOKEN: &str = "NOTOKEN";

/// Configuration for the interceptor
#[derive(Debug, Clone)]
pub struct InterceptorConfig {
    /// Header the token is written to
    pub header: HeaderName,

    /// Header value when attestation fails or the URL has no host
    pub fallback_token: HeaderValue,

    /// Whether a failed attestation still lets the request out
    pub on_failure: TokenFailurePolicy,
}

impl Default for InterceptorConfig {
    fn default() -> Self {
        Self {
            header: HeaderName::from_static("approov-token"),
            fallback_token: HeaderValue::from_static(NO_TOKEN),
            on_failure: TokenFailurePolicy::Sentinel,
        }
    }
}

impl InterceptorConfig {
    pub fn from_attestation(config: &AttestationConfig) -> Result<Self> {
        let header = HeaderName::from_bytes(config.header.as_bytes()).map_err(|_| {
            EngineError::ConfigError(format!("Invalid token header: {}", config.header))
        })?;
        let fallback_token = HeaderValue::from_str(&config.fallback_token).map_err(|_| {
            EngineError::ConfigError(format!("Invalid fallback token: {}", config.fallback_token))
        })?;

        Ok(Self {
            header,
            fallback_token,
            on_failure: config.on_failure,
        })
    }
}

/// Factory side of the interceptor, registered on a `ProtocolRegistry`
pub struct AttestationProtocol {
    config: InterceptorConfig,
    provider: Arc<dyn AttestationProvider>,
}

impl AttestationProtocol {
    pub fn new(config: InterceptorConfig, provider: Arc<dyn AttestationProvider>) -> Self {
        info!(
            "Attestation protocol using header {} ({:?} on failure)",
            config.header, config.on_failure
        );
        Self { config, provider }
    }
}

impl ProtocolFactory for AttestationProtocol {
    fn name(&self) -> &str {
        PROTOCOL_NAME
    }

    fn can_handle(&self, request: &InterceptedRequest) -> bool {
        !request.is_handled()
    }

    fn create(&self, request: InterceptedRequest, context: ProtocolContext) -> Arc<dyn UrlProtocol> {
        Arc::new(HttpInterceptor::new(
            request,
            self.config.clone(),
            Arc::clone(&self.provider),
            context,
        ))
    }
}

/// Where an interceptor instance is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterceptPhase {
    Created,
    TokenFetchPending,
    /// Augmented request handed to the internal session
    Issued,
    /// Attestation failed under the abort policy
    Rejected,
    Stopped,
}

struct InterceptState {
    phase: InterceptPhase,
    task: Option<LoadingTask>,
}

/// One intercepted load
pub struct HttpInterceptor {
    id: Ulid,
    request: InterceptedRequest,
    config: InterceptorConfig,
    provider: Arc<dyn AttestationProvider>,
    session: Session,
    state: Mutex<InterceptState>,
}

impl HttpInterceptor {
    /// Create an interceptor with its own internal session
    pub fn new(
        request: InterceptedRequest,
        config: InterceptorConfig,
        provider: Arc<dyn AttestationProvider>,
        context: ProtocolContext,
    ) -> Self {
        Self {
            id: Ulid::new(),
            request,
            config,
            provider,
            session: Session::new(context.registry, context.transport),
            state: Mutex::new(InterceptState {
                phase: InterceptPhase::Created,
                task: None,
            }),
        }
    }

    pub fn phase(&self) -> InterceptPhase {
        self.state.lock().phase
    }

    /// Fetch a token for the request's host; blocks on the provider
    fn fetch_token(&self, request: &InterceptedRequest) -> Option<HeaderValue> {
        let Some(host) = request.host() else {
            warn!(id = %self.id, "Request {} has no host, no token fetched", request.uri());
            metrics::counter!("attestation_tokens_total", "outcome" => "no_host").increment(1);
            return None;
        };

        match self.provider.fetch_token(host) {
            AttestationResult::Success(token) => {
                metrics::counter!("attestation_tokens_total", "outcome" => "success").increment(1);
                match HeaderValue::from_str(&token) {
                    Ok(value) => {
                        debug!(id = %self.id, "Received token for {} ({} bytes)", host, token.len());
                        Some(value)
                    }
                    Err(_) => {
                        warn!(id = %self.id, "Token for {} is not a valid header value", host);
                        None
                    }
                }
            }
            AttestationResult::Failure => {
                metrics::counter!("attestation_tokens_total", "outcome" => "failure").increment(1);
                warn!(id = %self.id, "Token fetch failed for {}", host);
                None
            }
        }
    }
}

impl UrlProtocol for HttpInterceptor {
    fn start(&self, client: Arc<dyn ProtocolClient>) {
        {
            let mut state = self.state.lock();
            if state.phase != InterceptPhase::Created {
                debug!(id = %self.id, "Ignoring start in {:?}", state.phase);
                return;
            }
            state.phase = InterceptPhase::TokenFetchPending;
        }
        metrics::counter!("interceptor_requests_total").increment(1);
        debug!(id = %self.id, "Intercepted {} {}", self.request.method(), self.request.uri());

        let mut request = self.request.stamped();

        let value = match self.fetch_token(&request) {
            Some(token) => token,
            None => match self.config.on_failure {
                TokenFailurePolicy::Sentinel => self.config.fallback_token.clone(),
                TokenFailurePolicy::Abort => {
                    let host = request.host().unwrap_or("<no host>").to_string();
                    let rejected = {
                        let mut state = self.state.lock();
                        let pending = state.phase == InterceptPhase::TokenFetchPending;
                        if pending {
                            state.phase = InterceptPhase::Rejected;
                        }
                        pending
                    };
                    if rejected {
                        warn!(id = %self.id, "Aborting request to {} without token", host);
                        client.on_failed(TransportError::AttestationRejected(host));
                    }
                    return;
                }
            },
        };
        request.set_header(self.config.header.clone(), value);

        let mut state = self.state.lock();
        if state.phase != InterceptPhase::TokenFetchPending {
            debug!(id = %self.id, "Stopped during token fetch, not issuing");
            return;
        }
        state.phase = InterceptPhase::Issued;
        state.task = Some(self.session.dispatch(request, client));
    }

    fn stop(&self) {
        let task = {
            let mut state = self.state.lock();
            match state.phase {
                // Nothing issued yet and nothing pending
                InterceptPhase::Created => return,
                InterceptPhase::TokenFetchPending | InterceptPhase::Issued => {
                    state.phase = InterceptPhase::Stopped;
                }
                InterceptPhase::Rejected | InterceptPhase::Stopped => {}
            }
            state.task.take()
        };

        if let Some(task) = task {
            debug!(id = %self.id, "Stopping intercepted load");
            task.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attestation::StaticTokenProvider;
    use crate::interception::client::{ChannelClient, ClientEvent};
    use crate::interception::registry::ProtocolRegistry;
    use crate::interception::request::CacheStoragePolicy;
    use crate::transport::{ResponseMeta, StubRoute, StubTransport};
    use bytes::Bytes;
    use http::StatusCode;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn protocol(provider: Arc<dyn AttestationProvider>) -> AttestationProtocol {
        AttestationProtocol::new(InterceptorConfig::default(), provider)
    }

    fn context(stub: &StubTransport, protocol: AttestationProtocol) -> ProtocolContext {
        let registry = ProtocolRegistry::new();
        registry.register(Arc::new(protocol));
        ProtocolContext {
            registry,
            transport: Arc::new(stub.clone()),
        }
    }

    fn counting(token: AttestationResult, calls: Arc<AtomicUsize>) -> Arc<dyn AttestationProvider> {
        Arc::new(move |_host: &str| {
            calls.fetch_add(1, Ordering::SeqCst);
            token.clone()
        })
    }

    async fn drain(mut rx: tokio::sync::mpsc::UnboundedReceiver<ClientEvent>) -> Vec<ClientEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    proptest! {
        #[test]
        fn prop_marker_decides_ownership(path in "[a-z]{0,12}", handled in any::<bool>()) {
            let protocol = protocol(Arc::new(|_: &str| AttestationResult::Failure));
            let request = InterceptedRequest::get(&format!("https://demo.test/{}", path)).unwrap();
            let request = if handled { request.stamped() } else { request };
            prop_assert_eq!(protocol.can_handle(&request), !handled);
        }
    }

    #[test]
    fn test_canonicalize_is_identity() {
        let protocol = protocol(Arc::new(|_: &str| AttestationResult::Failure));
        let request = InterceptedRequest::get("https://Demo.Test:443/a/../b").unwrap();
        let canonical = protocol.canonicalize(request.clone());
        assert_eq!(canonical.uri(), request.uri());
    }

    #[test]
    fn test_config_from_attestation_settings() {
        let mut settings = AttestationConfig::default();
        settings.header = "X-Attest".to_string();
        settings.on_failure = TokenFailurePolicy::Abort;
        let config = InterceptorConfig::from_attestation(&settings).unwrap();
        assert_eq!(config.header, HeaderName::from_static("x-attest"));
        assert_eq!(config.fallback_token, NO_TOKEN);
        assert_eq!(config.on_failure, TokenFailurePolicy::Abort);

        settings.fallback_token = "bad\nvalue".to_string();
        assert!(InterceptorConfig::from_attestation(&settings).is_err());
    }

    #[tokio::test]
    async fn test_injects_token_and_fetches_once() {
        let stub = StubTransport::new();
        stub.add_route(StubRoute::ok("/shapes", "circle"));
        let calls = Arc::new(AtomicUsize::new(0));
        let provider = counting(AttestationResult::Success("abc".into()), Arc::clone(&calls));
        let ctx = context(&stub, protocol(Arc::clone(&provider)));

        let original = InterceptedRequest::get("https://demo.test/shapes").unwrap();
        let interceptor = Arc::new(HttpInterceptor::new(
            original.clone(),
            InterceptorConfig::default(),
            provider,
            ctx,
        ));

        let (client, rx) = ChannelClient::new();
        let starter = Arc::clone(&interceptor);
        tokio::task::spawn_blocking(move || starter.start(Arc::new(client)))
            .await
            .unwrap();
        assert_eq!(interceptor.phase(), InterceptPhase::Issued);

        let events = drain(rx).await;
        assert!(matches!(events.last(), Some(ClientEvent::Finished)));

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let sent = stub.requests();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].is_handled());
        assert_eq!(sent[0].headers()[TOKEN_HEADER], "abc");
        assert!(!original.is_handled());
    }

    #[tokio::test]
    async fn test_failure_sends_sentinel() {
        let stub = StubTransport::new();
        stub.add_route(StubRoute::ok("/shapes", "circle"));
        let provider: Arc<dyn AttestationProvider> = Arc::new(|_: &str| AttestationResult::Failure);
        let ctx = context(&stub, protocol(Arc::clone(&provider)));

        let interceptor = Arc::new(HttpInterceptor::new(
            InterceptedRequest::get("https://demo.test/shapes").unwrap(),
            InterceptorConfig::default(),
            provider,
            ctx,
        ));
        let (client, rx) = ChannelClient::new();
        let starter = Arc::clone(&interceptor);
        tokio::task::spawn_blocking(move || starter.start(Arc::new(client)))
            .await
            .unwrap();
        drain(rx).await;

        let sent = stub.requests();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].headers()[TOKEN_HEADER], NO_TOKEN);
    }

    #[tokio::test]
    async fn test_no_host_sends_sentinel_without_fetch() {
        let stub = StubTransport::new();
        stub.add_route(StubRoute::ok("/shapes", "circle"));
        let calls = Arc::new(AtomicUsize::new(0));
        let provider = counting(AttestationResult::Success("abc".into()), Arc::clone(&calls));
        let ctx = context(&stub, protocol(Arc::clone(&provider)));

        let interceptor = Arc::new(HttpInterceptor::new(
            InterceptedRequest::get("/shapes").unwrap(),
            InterceptorConfig::default(),
            provider,
            ctx,
        ));
        let (client, rx) = ChannelClient::new();
        let starter = Arc::clone(&interceptor);
        tokio::task::spawn_blocking(move || starter.start(Arc::new(client)))
            .await
            .unwrap();
        drain(rx).await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(stub.requests()[0].headers()[TOKEN_HEADER], NO_TOKEN);
    }

    #[tokio::test]
    async fn test_abort_policy_skips_network() {
        let stub = StubTransport::new();
        stub.add_route(StubRoute::ok("/shapes", "circle"));
        let provider: Arc<dyn AttestationProvider> = Arc::new(|_: &str| AttestationResult::Failure);
        let config = InterceptorConfig {
            on_failure: TokenFailurePolicy::Abort,
            ..InterceptorConfig::default()
        };
        let ctx = context(&stub, AttestationProtocol::new(config.clone(), Arc::clone(&provider)));

        let interceptor = Arc::new(HttpInterceptor::new(
            InterceptedRequest::get("https://demo.test/shapes").unwrap(),
            config,
            provider,
            ctx,
        ));
        let (client, rx) = ChannelClient::new();
        let starter = Arc::clone(&interceptor);
        tokio::task::spawn_blocking(move || starter.start(Arc::new(client)))
            .await
            .unwrap();

        let events = drain(rx).await;
        assert!(matches!(
            &events[..],
            [ClientEvent::Failed(TransportError::AttestationRejected(host))] if host == "demo.test"
        ));
        assert_eq!(interceptor.phase(), InterceptPhase::Rejected);
        assert!(stub.requests().is_empty());
    }

    #[tokio::test]
    async fn test_stop_before_start_is_noop() {
        let stub = StubTransport::new();
        stub.add_route(StubRoute::ok("/shapes", "circle"));
        let provider: Arc<dyn AttestationProvider> =
            Arc::new(|_: &str| AttestationResult::Success("abc".into()));
        let ctx = context(&stub, protocol(Arc::clone(&provider)));
        let interceptor = Arc::new(HttpInterceptor::new(
            InterceptedRequest::get("https://demo.test/shapes").unwrap(),
            InterceptorConfig::default(),
            provider,
            ctx,
        ));

        interceptor.stop();
        interceptor.stop();
        assert_eq!(interceptor.phase(), InterceptPhase::Created);

        // The load still runs normally afterwards
        let (client, rx) = ChannelClient::new();
        let starter = Arc::clone(&interceptor);
        tokio::task::spawn_blocking(move || starter.start(Arc::new(client)))
            .await
            .unwrap();

        let events = drain(rx).await;
        assert!(matches!(events.last(), Some(ClientEvent::Finished)));
        assert_eq!(stub.requests().len(), 1);
        assert_eq!(interceptor.phase(), InterceptPhase::Issued);
    }

    #[tokio::test]
    async fn test_stop_during_token_fetch_prevents_issue() {
        let stub = StubTransport::new();
        stub.add_route(StubRoute::ok("/shapes", "circle"));
        let provider: Arc<dyn AttestationProvider> = Arc::new(
            StaticTokenProvider::new("abc")
                .with_latency(Duration::from_millis(300)),
        );
        let ctx = context(&stub, protocol(Arc::clone(&provider)));
        let interceptor = Arc::new(HttpInterceptor::new(
            InterceptedRequest::get("https://demo.test/shapes").unwrap(),
            InterceptorConfig::default(),
            provider,
            ctx,
        ));

        let (client, rx) = ChannelClient::new();
        let starter = Arc::clone(&interceptor);
        let started = tokio::task::spawn_blocking(move || starter.start(Arc::new(client)));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(interceptor.phase(), InterceptPhase::TokenFetchPending);
        interceptor.stop();
        started.await.unwrap();

        assert_eq!(interceptor.phase(), InterceptPhase::Stopped);
        assert!(drain(rx).await.is_empty());
        assert!(stub.requests().is_empty());
    }

    #[tokio::test]
    async fn test_stop_after_issue_cancels_stream() {
        let stub = StubTransport::new();
        stub.add_route(
            StubRoute::ok("/shapes", "")
                .with_chunks(vec![Bytes::from_static(b"one"), Bytes::from_static(b"two")])
                .with_chunk_delay(Duration::from_millis(200)),
        );
        let provider: Arc<dyn AttestationProvider> =
            Arc::new(|_: &str| AttestationResult::Success("abc".into()));
        let ctx = context(&stub, protocol(Arc::clone(&provider)));
        let interceptor = Arc::new(HttpInterceptor::new(
            InterceptedRequest::get("http://demo.test/shapes").unwrap(),
            InterceptorConfig::default(),
            provider,
            ctx,
        ));

        let (client, mut rx) = ChannelClient::new();
        let starter = Arc::clone(&interceptor);
        tokio::task::spawn_blocking(move || starter.start(Arc::new(client)))
            .await
            .unwrap();

        match rx.recv().await {
            Some(ClientEvent::Response { response, .. }) => assert_eq!(response.status, StatusCode::OK),
            other => panic!("expected response, got {:?}", other),
        }

        interceptor.stop();
        assert_eq!(interceptor.phase(), InterceptPhase::Stopped);

        // Nothing after the stop: the channel closes without data
        assert!(rx.recv().await.is_none());
    }

    /// Client that stops the interceptor feeding it on the first chunk
    struct StopOnData {
        interceptor: Mutex<Option<Arc<HttpInterceptor>>>,
        seen: tokio::sync::mpsc::UnboundedSender<&'static str>,
    }

    impl ProtocolClient for StopOnData {
        fn on_response(&self, _response: &ResponseMeta, _policy: CacheStoragePolicy) {
            let _ = self.seen.send("response");
        }

        fn on_data(&self, _data: Bytes) {
            let interceptor = self.interceptor.lock().take();
            if let Some(interceptor) = interceptor {
                interceptor.stop();
            }
            let _ = self.seen.send("data");
        }

        fn on_redirect(&self, _request: &InterceptedRequest, _response: &ResponseMeta) {}

        fn on_failed(&self, _error: TransportError) {
            let _ = self.seen.send("failed");
        }

        fn on_finished(&self) {
            let _ = self.seen.send("finished");
        }
    }

    #[tokio::test]
    async fn test_client_can_stop_from_callback() {
        let stub = StubTransport::new();
        stub.add_route(
            StubRoute::ok("/shapes", "")
                .with_chunks(vec![Bytes::from_static(b"one"), Bytes::from_static(b"two")])
                .with_chunk_delay(Duration::from_millis(50)),
        );
        let provider: Arc<dyn AttestationProvider> =
            Arc::new(|_: &str| AttestationResult::Success("abc".into()));
        let ctx = context(&stub, protocol(Arc::clone(&provider)));
        let interceptor = Arc::new(HttpInterceptor::new(
            InterceptedRequest::get("http://demo.test/shapes").unwrap(),
            InterceptorConfig::default(),
            provider,
            ctx,
        ));

        let (seen, rx) = tokio::sync::mpsc::unbounded_channel();
        let client = Arc::new(StopOnData {
            interceptor: Mutex::new(Some(Arc::clone(&interceptor))),
            seen,
        });
        let starter = Arc::clone(&interceptor);
        let start_client: Arc<dyn ProtocolClient> = client;
        tokio::task::spawn_blocking(move || starter.start(start_client))
            .await
            .unwrap();

        let mut rx = rx;
        let seen = tokio::time::timeout(Duration::from_secs(3), async {
            let mut seen = Vec::new();
            while let Some(kind) = rx.recv().await {
                seen.push(kind);
            }
            seen
        })
        .await
        .expect("load ended after stop from on_data");

        assert_eq!(seen, vec!["response", "data"]);
        assert_eq!(interceptor.phase(), InterceptPhase::Stopped);
    }
}
