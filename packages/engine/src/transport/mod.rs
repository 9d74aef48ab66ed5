// packages/engine/src/transport/mod.rs
//! Transport contract
//!
//! A transport executes one request per task and reports what happens as a
//! stream of `TransportEvent`s. Events that need an answer (trust
//! challenges, response disposition, redirects) carry a `oneshot` reply.
//! If the consumer drops a reply the transport stops the task.
//!
//! - **HyperTransport**: real network through hyper
//! - **StubTransport**: in-memory route table for demos and tests
//!
//! ```text
//! Transport::execute(request)
//!     │
//!     └─ TransportTask { events, cancel }
//!            │
//!            ├─ Challenge → reply(disposition)
//!            ├─ Redirect  → reply(Some(follow) | None)
//!            ├─ Response  → reply(Allow | Cancel)
//!            ├─ Data*
//!            └─ Completed(None | Some(error)) | SessionInvalidated(error)
//! ```

pub mod hyper_transport;
pub mod stub;

pub use hyper_transport::HyperTransport;
pub use stub::{StubRoute, StubTransport};

use crate::interception::request::InterceptedRequest;
use crate::utils::errors::TransportError;
use bytes::Bytes;
use http::{HeaderMap, StatusCode, Uri, Version};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

/// Executes requests and reports their lifecycle as events
pub trait Transport: Send + Sync {
    /// Start executing `request`; must be called inside a tokio runtime
    fn execute(&self, request: InterceptedRequest) -> TransportTask;
}

/// Response metadata delivered before the body
#[derive(Debug, Clone)]
pub struct ResponseMeta {
    pub url: Uri,
    pub status: StatusCode,
    pub version: Version,
    pub headers: HeaderMap,
}

impl ResponseMeta {
    pub fn new(url: Uri, status: StatusCode) -> Self {
        Self {
            url,
            status,
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    ServerTrust,
}

/// Authentication challenge raised while connecting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthChallenge {
    pub host: String,
    pub method: AuthMethod,
}

impl AuthChallenge {
    pub fn server_trust(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            method: AuthMethod::ServerTrust,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeDisposition {
    /// Accept the presented credential (server trust)
    UseCredential,
    PerformDefaultHandling,
    CancelChallenge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseDisposition {
    /// Keep receiving the body
    Allow,
    Cancel,
}

/// Lifecycle events of a transport task
#[derive(Debug)]
pub enum TransportEvent {
    Challenge {
        challenge: AuthChallenge,
        reply: oneshot::Sender<ChallengeDisposition>,
    },
    Response {
        response: ResponseMeta,
        reply: oneshot::Sender<ResponseDisposition>,
    },
    Redirect {
        response: ResponseMeta,
        request: InterceptedRequest,
        reply: oneshot::Sender<Option<InterceptedRequest>>,
    },
    Data(Bytes),
    Completed(Option<TransportError>),
    SessionInvalidated(TransportError),
    BackgroundEventsFinished,
}

/// Consumer side of a running task
#[derive(Debug)]
pub struct TransportTask {
    pub id: Ulid,
    pub events: mpsc::Receiver<TransportEvent>,
    pub cancel: CancellationToken,
}

impl TransportTask {
    /// Create a task and the sender its producer writes to
    pub fn channel(buffer: usize) -> (TransportTask, TaskSender) {
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let id = Ulid::new();
        let task = TransportTask {
            id,
            events: rx,
            cancel: cancel.clone(),
        };
        (task, TaskSender { id, tx, cancel })
    }
}

/// Producer side of a running task
#[derive(Debug, Clone)]
pub struct TaskSender {
    pub id: Ulid,
    tx: mpsc::Sender<TransportEvent>,
    cancel: CancellationToken,
}

impl TaskSender {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Send an event; fails with `Cancelled` once the consumer is gone
    pub async fn send(&self, event: TransportEvent) -> Result<(), TransportError> {
        self.tx.send(event).await.map_err(|_| TransportError::Cancelled)
    }

    pub async fn data(&self, bytes: Bytes) -> Result<(), TransportError> {
        self.send(TransportEvent::Data(bytes)).await
    }

    pub async fn challenge(
        &self,
        challenge: AuthChallenge,
    ) -> Result<ChallengeDisposition, TransportError> {
        let (reply, rx) = oneshot::channel();
        self.send(TransportEvent::Challenge { challenge, reply }).await?;
        rx.await.map_err(|_| TransportError::Cancelled)
    }

    pub async fn response(
        &self,
        response: ResponseMeta,
    ) -> Result<ResponseDisposition, TransportError> {
        let (reply, rx) = oneshot::channel();
        self.send(TransportEvent::Response { response, reply }).await?;
        rx.await.map_err(|_| TransportError::Cancelled)
    }

    pub async fn redirect(
        &self,
        response: ResponseMeta,
        request: InterceptedRequest,
    ) -> Result<Option<InterceptedRequest>, TransportError> {
        let (reply, rx) = oneshot::channel();
        self.send(TransportEvent::Redirect {
            response,
            request,
            reply,
        })
        .await?;
        rx.await.map_err(|_| TransportError::Cancelled)
    }

    /// Deliver the terminal event for a finished task
    ///
    /// Cancellation by the consumer ends silently; there is nobody left to
    /// tell.
    pub async fn finish(&self, outcome: Result<(), TransportError>) {
        let event = match outcome {
            Ok(()) => TransportEvent::Completed(None),
            Err(TransportError::Cancelled) if self.is_cancelled() => return,
            Err(err @ TransportError::SessionInvalidated(_)) => {
                TransportEvent::SessionInvalidated(err)
            }
            Err(err) => TransportEvent::Completed(Some(err)),
        };
        let _ = self.tx.send(event).await;
    }
}

/// Answer a server-trust challenge, failing the task when it was refused
pub(crate) async fn negotiate_trust(
    sender: &TaskSender,
    request: &InterceptedRequest,
) -> Result<(), TransportError> {
    if request.uri().scheme_str() != Some("https") {
        return Ok(());
    }
    let host = request.host().unwrap_or_default().to_string();
    match sender.challenge(AuthChallenge::server_trust(host.clone())).await? {
        ChallengeDisposition::UseCredential | ChallengeDisposition::PerformDefaultHandling => Ok(()),
        ChallengeDisposition::CancelChallenge => Err(TransportError::TrustRejected(host)),
    }
}
