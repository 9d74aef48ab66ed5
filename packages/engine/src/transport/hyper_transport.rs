// packages/engine/src/transport/hyper_transport.rs
//! Network transport backed by the hyper client
//!
//! Each `HyperTransport` owns one pooled client. Redirects are resolved here
//! rather than inside hyper so every hop is visible to the consumer as a
//! `Redirect` event and can be followed, rewritten or declined.

use crate::interception::request::InterceptedRequest;
use crate::transport::{
    negotiate_trust, ResponseDisposition, ResponseMeta, TaskSender, Transport, TransportTask,
};
use crate::utils::config::TransportConfig;
use crate::utils::errors::TransportError;
use bytes::Bytes;
use http::{header, Method, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn, Instrument};

type HttpsClient = Client<HttpsConnector<HttpConnector>, Full<Bytes>>;

/// Transport executing requests over HTTP/1.1 and HTTP/2 with TLS
pub struct HyperTransport {
    client: HttpsClient,
    max_redirects: usize,
    event_buffer: usize,
    /// Cancelled on shutdown; every in-flight task watches it
    shutdown: CancellationToken,
}

impl HyperTransport {
    /// Create a transport with its own connection pool
    pub fn new(config: &TransportConfig) -> Self {
        let mut http = HttpConnector::new();
        http.enforce_http(false);
        http.set_connect_timeout(Some(config.connect_timeout()));

        let https = HttpsConnector::new_with_connector(http);
        let client = Client::builder(TokioExecutor::new()).build::<_, Full<Bytes>>(https);

        Self {
            client,
            max_redirects: config.max_redirects,
            event_buffer: config.event_buffer,
            shutdown: CancellationToken::new(),
        }
    }

    /// Invalidate the session; in-flight tasks end with `SessionInvalidated`
    pub fn shutdown(&self) {
        debug!("Invalidating hyper transport session");
        self.shutdown.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    async fn run_task(
        client: HttpsClient,
        request: InterceptedRequest,
        sender: TaskSender,
        shutdown: CancellationToken,
        max_redirects: usize,
    ) {
        let cancel = sender.cancel_token().clone();

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TransportError::Cancelled),
            _ = shutdown.cancelled() => {
                Err(TransportError::SessionInvalidated("transport shut down".to_string()))
            }
            result = Self::perform(&client, request, &sender, max_redirects) => result,
        };

        if let Err(e) = &outcome {
            debug!("Task ended with error: {}", e);
        }
        sender.finish(outcome).await;
    }

    async fn perform(
        client: &HttpsClient,
        request: InterceptedRequest,
        sender: &TaskSender,
        max_redirects: usize,
    ) -> Result<(), TransportError> {
        let mut current = request;
        let mut hops = 0;

        loop {
            negotiate_trust(sender, &current).await?;

            debug!("Sending {} {}", current.method(), current.uri());
            let response = client
                .request(current.to_http()?)
                .await
                .map_err(|e| TransportError::Connect(error_chain(&e)))?;

            let (parts, body) = response.into_parts();
            let meta = ResponseMeta {
                url: current.uri().clone(),
                status: parts.status,
                version: parts.version,
                headers: parts.headers,
            };

            if let Some(next) = redirect_target(&current, &meta)? {
                if hops >= max_redirects {
                    return Err(TransportError::TooManyRedirects(max_redirects));
                }
                hops += 1;
                debug!("Redirect {} -> {}", current.uri(), next.uri());

                match sender.redirect(meta.clone(), next).await? {
                    Some(follow) => {
                        current = follow;
                        continue;
                    }
                    None => debug!("Redirect declined, delivering {}", meta.status),
                }
            }

            if sender.response(meta).await? == ResponseDisposition::Cancel {
                return Err(TransportError::Cancelled);
            }

            let mut body = body;
            while let Some(frame) = body.frame().await {
                let frame = frame.map_err(|e| TransportError::Body(error_chain(&e)))?;
                if let Ok(data) = frame.into_data() {
                    if !data.is_empty() {
                        sender.data(data).await?;
                    }
                }
            }

            return Ok(());
        }
    }
}

impl Transport for HyperTransport {
    fn execute(&self, request: InterceptedRequest) -> TransportTask {
        let (task, sender) = TransportTask::channel(self.event_buffer);

        let span = tracing::debug_span!("transport_task", id = %task.id, uri = %request.uri());
        tokio::spawn(
            Self::run_task(
                self.client.clone(),
                request,
                sender,
                self.shutdown.clone(),
                self.max_redirects,
            )
            .instrument(span),
        );

        task
    }
}

impl Drop for HyperTransport {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Render an error with every `source()` below it
fn error_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

/// Work out the follow-up request for a 3xx response, if any
pub(crate) fn redirect_target(
    current: &InterceptedRequest,
    response: &ResponseMeta,
) -> Result<Option<InterceptedRequest>, TransportError> {
    let status = response.status;
    if !matches!(
        status,
        StatusCode::MOVED_PERMANENTLY
            | StatusCode::FOUND
            | StatusCode::SEE_OTHER
            | StatusCode::TEMPORARY_REDIRECT
            | StatusCode::PERMANENT_REDIRECT
    ) {
        return Ok(None);
    }

    let Some(location) = response.headers.get(header::LOCATION) else {
        warn!("{} without Location header", status);
        return Ok(None);
    };
    let location = location
        .to_str()
        .map_err(|e| TransportError::InvalidRequest(format!("Invalid Location header: {}", e)))?;

    let uri = resolve_location(current.uri(), location)?;

    let to_get = status == StatusCode::SEE_OTHER
        || (matches!(status, StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND)
            && current.method() == Method::POST);

    let next = if to_get && current.method() != Method::HEAD {
        current.redirected(uri, Method::GET, false)
    } else {
        current.redirected(uri, current.method().clone(), true)
    };

    Ok(Some(next))
}

fn resolve_location(base: &Uri, location: &str) -> Result<Uri, TransportError> {
    let invalid = |e: &dyn std::fmt::Display| {
        TransportError::InvalidRequest(format!("Invalid redirect target '{}': {}", location, e))
    };

    let target: Uri = location.parse().map_err(|e| invalid(&e))?;
    if target.scheme().is_some() {
        return Ok(target);
    }

    let scheme = base.scheme_str().unwrap_or("http");
    let authority = base
        .authority()
        .map(|a| a.as_str())
        .ok_or_else(|| invalid(&"base URL has no authority"))?;

    let joined = if location.starts_with("//") {
        format!("{}:{}", scheme, location)
    } else if location.starts_with('/') {
        format!("{}://{}{}", scheme, authority, location)
    } else {
        let dir = base
            .path()
            .rsplit_once('/')
            .map(|(dir, _)| dir)
            .unwrap_or("");
        format!("{}://{}{}/{}", scheme, authority, dir, location)
    };

    joined.parse().map_err(|e| invalid(&e))
}
