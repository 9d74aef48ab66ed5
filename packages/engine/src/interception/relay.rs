// packages/engine/src/interception/relay.rs
//! Event relay between a transport task and a downstream client
//!
//! One `EventRelay` per load. It answers the transport's prompts and
//! forwards everything else to the client, enforcing the lifecycle:
//!
//! ```text
//! Issued → Streaming* → Completed | Failed | Cancelled
//! ```
//!
//! Exactly one terminal transition happens. Once terminal, nothing more
//! reaches the client, including late events a transport may still emit.
//! After `stop()` returns no further callback starts, and a client may call
//! `stop()` from inside its own callbacks.

use crate::interception::client::ProtocolClient;
use crate::interception::request::{CacheStoragePolicy, InterceptedRequest};
use crate::transport::{
    ChallengeDisposition, ResponseDisposition, TransportEvent, TransportTask,
};
use crate::utils::errors::TransportError;
use parking_lot::{Mutex, ReentrantMutex};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, Instrument};
use ulid::Ulid;

/// Lifecycle phase of a relayed load
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayPhase {
    Issued,
    Streaming,
    Completed,
    Failed,
    Cancelled,
}

impl RelayPhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RelayPhase::Completed | RelayPhase::Failed | RelayPhase::Cancelled
        )
    }

    fn label(self) -> &'static str {
        match self {
            RelayPhase::Issued => "issued",
            RelayPhase::Streaming => "streaming",
            RelayPhase::Completed => "completed",
            RelayPhase::Failed => "failed",
            RelayPhase::Cancelled => "cancelled",
        }
    }
}

/// Phase plus the client it guards; the client is released on the
/// terminal transition
///
/// `inner` is only held for bookkeeping. Callbacks run under `delivery`,
/// which is reentrant: a client may stop its own load from inside a
/// callback, while `stop()` from any other thread waits for the callback in
/// progress to return.
struct RelayState {
    inner: Mutex<RelayInner>,
    delivery: ReentrantMutex<()>,
}

struct RelayInner {
    phase: RelayPhase,
    client: Option<Arc<dyn ProtocolClient>>,
}

impl RelayState {
    fn new(client: Arc<dyn ProtocolClient>) -> Self {
        Self {
            inner: Mutex::new(RelayInner {
                phase: RelayPhase::Issued,
                client: Some(client),
            }),
            delivery: ReentrantMutex::new(()),
        }
    }

    fn phase(&self) -> RelayPhase {
        self.inner.lock().phase
    }

    /// Run a non-terminal callback unless the load already ended
    fn forward(&self, kind: &'static str, f: impl FnOnce(&dyn ProtocolClient)) -> bool {
        let _delivering = self.delivery.lock();
        let client = {
            let mut inner = self.inner.lock();
            if inner.phase.is_terminal() {
                trace!("Dropping {} event after {:?}", kind, inner.phase);
                return false;
            }
            inner.phase = RelayPhase::Streaming;
            inner.client.clone()
        };

        if let Some(client) = client {
            f(client.as_ref());
        }
        metrics::counter!("relay_events_total", "kind" => kind).increment(1);
        true
    }

    /// Make the single terminal transition
    fn finish(&self, next: RelayPhase, f: impl FnOnce(&dyn ProtocolClient)) -> bool {
        let _delivering = self.delivery.lock();
        let client = {
            let mut inner = self.inner.lock();
            if inner.phase.is_terminal() {
                trace!("Ignoring {:?} after {:?}", next, inner.phase);
                return false;
            }
            inner.phase = next;
            inner.client.take()
        };

        if let Some(client) = client {
            f(client.as_ref());
        }
        metrics::counter!("relay_terminal_total", "phase" => next.label()).increment(1);
        true
    }

    fn cancel(&self) -> bool {
        self.finish(RelayPhase::Cancelled, |_| {})
    }
}

/// Handle on a relayed load
#[derive(Clone)]
pub struct LoadHandle {
    id: Ulid,
    cancel: CancellationToken,
    state: Arc<RelayState>,
}

impl LoadHandle {
    pub fn id(&self) -> Ulid {
        self.id
    }

    pub fn phase(&self) -> RelayPhase {
        self.state.phase()
    }

    /// Cancel the underlying task; no callbacks follow once this returns
    ///
    /// Safe to call repeatedly and after the load has ended.
    pub fn stop(&self) {
        if self.state.cancel() {
            debug!(id = %self.id, "Load cancelled");
        }
        self.cancel.cancel();
    }
}

enum Flow {
    Continue,
    Stop,
}

/// Forwards one transport task to one client
pub struct EventRelay {
    id: Ulid,
    storage_policy: CacheStoragePolicy,
    state: Arc<RelayState>,
}

impl EventRelay {
    /// Build a relay for `original`; its cache policy sets the storage policy
    pub fn new(original: &InterceptedRequest, client: Arc<dyn ProtocolClient>) -> Self {
        Self {
            id: Ulid::new(),
            storage_policy: CacheStoragePolicy::for_request(original.cache_policy()),
            state: Arc::new(RelayState::new(client)),
        }
    }

    /// Relay `task` on the current runtime and return a handle to it
    pub fn spawn(
        original: &InterceptedRequest,
        client: Arc<dyn ProtocolClient>,
        task: TransportTask,
    ) -> LoadHandle {
        let relay = Self::new(original, client);
        let handle = relay.handle(&task);
        let span = tracing::debug_span!("relay", id = %relay.id, task = %task.id);
        tokio::spawn(relay.run(task).instrument(span));
        handle
    }

    pub fn handle(&self, task: &TransportTask) -> LoadHandle {
        LoadHandle {
            id: self.id,
            cancel: task.cancel.clone(),
            state: Arc::clone(&self.state),
        }
    }

    /// Forward events until a terminal one, cancellation or channel close
    pub async fn run(self, task: TransportTask) {
        let TransportTask {
            mut events, cancel, ..
        } = task;

        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.state.cancel();
                    break;
                }
                event = events.recv() => event,
            };

            let Some(event) = event else {
                // Producer vanished without a terminal event
                self.state
                    .finish(RelayPhase::Failed, |c| c.on_failed(TransportError::Closed));
                break;
            };

            if let Flow::Stop = self.dispatch(event) {
                break;
            }
        }

        debug!("Relay finished in {:?}", self.state.phase());
    }

    fn dispatch(&self, event: TransportEvent) -> Flow {
        let policy = self.storage_policy;

        match event {
            TransportEvent::Challenge { challenge, reply } => {
                if self.state.phase().is_terminal() {
                    return Flow::Stop;
                }
                debug!("Accepting {:?} for {}", challenge.method, challenge.host);
                let _ = reply.send(ChallengeDisposition::UseCredential);
                Flow::Continue
            }
            TransportEvent::Response { response, reply } => {
                if !self
                    .state
                    .forward("response", |c| c.on_response(&response, policy))
                {
                    return Flow::Stop;
                }
                let _ = reply.send(ResponseDisposition::Allow);
                Flow::Continue
            }
            TransportEvent::Redirect {
                response,
                request,
                reply,
            } => {
                if !self
                    .state
                    .forward("redirect", |c| c.on_redirect(&request, &response))
                {
                    return Flow::Stop;
                }
                let _ = reply.send(Some(request));
                Flow::Continue
            }
            TransportEvent::Data(bytes) => {
                if self.state.forward("data", |c| c.on_data(bytes)) {
                    Flow::Continue
                } else {
                    Flow::Stop
                }
            }
            TransportEvent::Completed(None) | TransportEvent::BackgroundEventsFinished => {
                self.state.finish(RelayPhase::Completed, |c| c.on_finished());
                Flow::Stop
            }
            TransportEvent::Completed(Some(error)) | TransportEvent::SessionInvalidated(error) => {
                debug!("Relaying failure: {}", error);
                self.state.finish(RelayPhase::Failed, |c| c.on_failed(error));
                Flow::Stop
            }
        }
    }
}
