//! One live JSON-RPC session with an endpoint.
//!
//! A session owns the pending-request table for a single transport
//! connection. Exactly one dispatcher task consumes the transport's inbound
//! channel: it resolves responses by id (in any order), answers server pings,
//! and fans notifications out to subscribers. When the channel ends or
//! carries something unparseable, every pending call fails with
//! `Unavailable` and the session terminates for good; reconnecting means a
//! new session.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::errors::UpstreamError;
use super::transport::{Inbound, OpenedTransport, Transport};
use super::types::{
    classify, error_codes, error_response, success_response, Incoming, JsonRpcError,
    JsonRpcRequest, Notification,
};

type Waiter = oneshot::Sender<Result<Value, UpstreamError>>;

// ─── Subscribers ─────────────────────────────────────────────────────────────

/// Notification fan-out targets for one endpoint.
///
/// Owned by the endpoint rather than the session so subscriptions outlive
/// reconnects.
#[derive(Default)]
pub struct Subscribers {
    senders: StdMutex<Vec<mpsc::UnboundedSender<Notification>>>,
}

impl Subscribers {
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Notification> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        rx
    }

    /// Deliver to every live subscriber, dropping those that went away.
    pub fn publish(&self, notification: &Notification) {
        let mut senders = self.senders.lock().unwrap_or_else(|e| e.into_inner());
        senders.retain(|tx| tx.send(notification.clone()).is_ok());
    }

    pub fn len(&self) -> usize {
        self.senders.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ─── Session ─────────────────────────────────────────────────────────────────

struct SessionState {
    pending: HashMap<u64, Waiter>,
    /// Ids we stopped waiting for (timeout, cancel); late answers are dropped
    /// quietly instead of counting as unmatched.
    abandoned: HashSet<u64>,
    closed: Option<String>,
}

/// A correlated request/response session over one transport.
pub struct Session {
    endpoint: String,
    transport: Arc<dyn Transport>,
    next_id: AtomicU64,
    state: StdMutex<SessionState>,
    terminated: CancellationToken,
}

impl Session {
    /// Start a session over an opened transport and spawn its dispatcher.
    pub fn start(endpoint: &str, opened: OpenedTransport, subscribers: Arc<Subscribers>) -> Arc<Self> {
        let session = Arc::new(Session {
            endpoint: endpoint.to_string(),
            transport: opened.transport,
            next_id: AtomicU64::new(1),
            state: StdMutex::new(SessionState {
                pending: HashMap::new(),
                abandoned: HashSet::new(),
                closed: None,
            }),
            terminated: CancellationToken::new(),
        });

        tokio::spawn(dispatch(session.clone(), opened.inbound, subscribers));
        session
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed.is_some()
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    /// Resolves once the session has failed or been closed, with the reason.
    pub async fn terminated(&self) -> String {
        self.terminated.cancelled().await;
        self.lock()
            .closed
            .clone()
            .unwrap_or_else(|| "session closed".to_string())
    }

    /// Send a request and wait for its response.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
        cancel: Option<&CancellationToken>,
    ) -> Result<Value, UpstreamError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.lock();
            if let Some(reason) = &state.closed {
                return Err(UpstreamError::unavailable(&self.endpoint, reason.clone()));
            }
            state.pending.insert(id, tx);
        }

        let message = JsonRpcRequest::new(id, method, params).to_value();
        if let Err(e) = self.transport.send(&message).await {
            self.lock().pending.remove(&id);
            return Err(e);
        }

        tokio::select! {
            outcome = rx => outcome.unwrap_or_else(|_| {
                Err(UpstreamError::unavailable(&self.endpoint, "session dropped the request"))
            }),
            _ = tokio::time::sleep(timeout) => {
                self.abandon(id).await;
                Err(UpstreamError::Timeout {
                    endpoint: self.endpoint.clone(),
                    method: method.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
            _ = wait_cancelled(cancel) => {
                self.abandon(id).await;
                Err(UpstreamError::Cancelled {
                    endpoint: self.endpoint.clone(),
                    method: method.to_string(),
                })
            }
        }
    }

    /// Send a notification (no response expected).
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), UpstreamError> {
        let closed = self.lock().closed.clone();
        if let Some(reason) = closed {
            return Err(UpstreamError::unavailable(&self.endpoint, reason));
        }
        let notification = Notification::new(method, params);
        self.transport.send(&notification.to_message()).await
    }

    /// Close the transport and fail anything still pending.
    pub async fn close(&self) {
        self.fail("session closed");
        self.transport.close().await;
    }

    /// Stop waiting on `id` and tell the endpoint, best effort.
    async fn abandon(&self, id: u64) {
        let still_pending = {
            let mut state = self.lock();
            let removed = state.pending.remove(&id).is_some();
            if removed {
                state.abandoned.insert(id);
            }
            removed
        };
        if still_pending {
            let _ = self
                .notify(
                    "notifications/cancelled",
                    Some(json!({"requestId": id, "reason": "request abandoned by caller"})),
                )
                .await;
        }
    }

    /// Fail every pending call and mark the session terminated.
    fn fail(&self, reason: &str) {
        let waiters: Vec<Waiter> = {
            let mut state = self.lock();
            if state.closed.is_none() {
                state.closed = Some(reason.to_string());
            }
            state.pending.drain().map(|(_, w)| w).collect()
        };
        if !waiters.is_empty() {
            tracing::warn!(
                endpoint = %self.endpoint,
                pending = waiters.len(),
                reason,
                "failing pending calls"
            );
        }
        for waiter in waiters {
            let _ = waiter.send(Err(UpstreamError::unavailable(&self.endpoint, reason)));
        }
        self.terminated.cancel();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Route one response to its waiter. Returns false if nobody asked for it.
    fn resolve(&self, id: &Value, outcome: Result<Value, JsonRpcError>) -> bool {
        let Some(id) = id.as_u64() else {
            return false;
        };
        let waiter = {
            let mut state = self.lock();
            match state.pending.remove(&id) {
                Some(w) => Some(w),
                None => {
                    if state.abandoned.remove(&id) {
                        return true;
                    }
                    None
                }
            }
        };
        let Some(waiter) = waiter else {
            return false;
        };
        let result = outcome.map_err(|e| UpstreamError::ServerError {
            code: e.code,
            message: e.message,
            data: e.data,
        });
        let _ = waiter.send(result);
        true
    }

    fn fail_one(&self, id: &Value, error: UpstreamError) {
        let waiter = id.as_u64().and_then(|id| self.lock().pending.remove(&id));
        if let Some(waiter) = waiter {
            let _ = waiter.send(Err(error));
        }
    }
}

async fn wait_cancelled(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

// ─── Dispatcher ──────────────────────────────────────────────────────────────

async fn dispatch(
    session: Arc<Session>,
    mut inbound: mpsc::UnboundedReceiver<Inbound>,
    subscribers: Arc<Subscribers>,
) {
    let reason = loop {
        let item = tokio::select! {
            item = inbound.recv() => item,
            _ = session.terminated.cancelled() => break "session closed".to_string(),
        };
        let Some(item) = item else {
            break "transport dropped".to_string();
        };

        let message = match item {
            Inbound::Message(message) => message,
            Inbound::Malformed(reason) => break format!("malformed frame: {reason}"),
            Inbound::Closed(reason) => {
                break reason.unwrap_or_else(|| "endpoint channel closed".to_string())
            }
        };

        let id = message.get("id").cloned();
        match classify(message) {
            Incoming::Response { id, outcome } => {
                if !session.resolve(&id, outcome) {
                    break format!("response with unmatched id {id}");
                }
            }
            Incoming::Request { id, method, .. } => {
                let reply = if method == "ping" {
                    success_response(id, json!({}))
                } else {
                    error_response(
                        id,
                        JsonRpcError::new(
                            error_codes::METHOD_NOT_FOUND,
                            format!("Method not found: {method}"),
                        ),
                    )
                };
                if let Err(e) = session.transport.send(&reply).await {
                    tracing::debug!(endpoint = %session.endpoint, error = %e, "failed to answer server request");
                }
            }
            Incoming::Notification(notification) => {
                tracing::trace!(endpoint = %session.endpoint, method = %notification.method, "notification");
                subscribers.publish(&notification);
            }
            Incoming::Invalid(reason) => {
                if let Some(id) = id {
                    session.fail_one(
                        &id,
                        UpstreamError::MalformedFrame {
                            endpoint: session.endpoint.clone(),
                            reason: reason.clone(),
                        },
                    );
                }
                break format!("invalid message: {reason}");
            }
        }
    };

    tracing::info!(endpoint = %session.endpoint, reason = %reason, "session terminated");
    session.fail(&reason);
}

// ─── Tests ───────────────────────────────────────────────────────────────────
