//! Connection manager: owns every endpoint and its lifecycle.
//!
//! Each registered endpoint gets a slot holding its configuration, current
//! session, state and notification subscribers. The manager connects
//! endpoints, watches their sessions, and on failure marks them Degraded and
//! runs a single bounded-backoff reconnect loop per endpoint. Callers work
//! with [`EndpointHandle`]s and never see the transport underneath.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration;

use futures::stream::{self, Stream};
use serde_json::Value;
use tokio::sync::{broadcast, watch, Mutex};
use tokio_util::sync::CancellationToken;

use super::errors::UpstreamError;
use super::lifecycle::{self, format_stderr_suffix, BackoffPolicy};
use super::session::{Session, Subscribers};
use super::transport::Connector;
use super::types::{
    ConnectionState, EndpointConfig, EndpointEvent, Notification, TransportKind, UpstreamInfo,
};

/// Capacity of the lifecycle event broadcast.
const EVENT_CAPACITY: usize = 64;

/// Notifications from one endpoint. Unbounded; ends when the manager drops
/// the endpoint.
pub type NotificationStream = Pin<Box<dyn Stream<Item = Notification> + Send>>;

// ─── Endpoint Slot ───────────────────────────────────────────────────────────

struct EndpointSlot {
    config: EndpointConfig,
    state: watch::Sender<ConnectionState>,
    session: StdRwLock<Option<Arc<Session>>>,
    info: StdRwLock<Option<UpstreamInfo>>,
    subscribers: Arc<Subscribers>,
    /// Set while a reconnect loop owns this endpoint.
    reconnecting: AtomicBool,
    /// Serializes connection attempts.
    connecting: Mutex<()>,
}

impl EndpointSlot {
    fn new(config: EndpointConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            config,
            state,
            session: StdRwLock::new(None),
            info: StdRwLock::new(None),
            subscribers: Arc::new(Subscribers::default()),
            reconnecting: AtomicBool::new(false),
            connecting: Mutex::new(()),
        }
    }

    fn name(&self) -> &str {
        &self.config.name
    }

    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn set_state(&self, next: ConnectionState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            tracing::debug!(endpoint = %self.name(), from = %prev, to = %next, "endpoint state change");
        }
    }

    fn current_session(&self) -> Option<Arc<Session>> {
        self.session
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .filter(|s| !s.is_closed())
    }

    fn take_session(&self) -> Option<Arc<Session>> {
        self.session.write().unwrap_or_else(|e| e.into_inner()).take()
    }

    fn is_current(&self, session: &Arc<Session>) -> bool {
        self.session
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|s| Arc::ptr_eq(s, session))
    }
}

/// Reference to one registered endpoint.
#[derive(Clone)]
pub struct EndpointHandle {
    slot: Arc<EndpointSlot>,
}

impl EndpointHandle {
    pub fn name(&self) -> &str {
        self.slot.name()
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.slot.config
    }

    pub fn kind(&self) -> TransportKind {
        self.slot.config.kind()
    }

    pub fn state(&self) -> ConnectionState {
        self.slot.state()
    }

    /// What the endpoint reported at its last successful initialize.
    pub fn info(&self) -> Option<UpstreamInfo> {
        self.slot
            .info
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl std::fmt::Debug for EndpointHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointHandle")
            .field("name", &self.name())
            .field("state", &self.state())
            .finish()
    }
}

// ─── ConnectionManager ───────────────────────────────────────────────────────

struct ManagerInner {
    client_name: String,
    connector: Arc<dyn Connector>,
    backoff: BackoffPolicy,
    slots: StdRwLock<Vec<Arc<EndpointSlot>>>,
    events: broadcast::Sender<EndpointEvent>,
    shutdown: CancellationToken,
}

/// Owns all upstream endpoints. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl ConnectionManager {
    /// `client_name` is what we call ourselves in `initialize`.
    pub fn new(client_name: &str, connector: Arc<dyn Connector>, backoff: BackoffPolicy) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(ManagerInner {
                client_name: client_name.to_string(),
                connector,
                backoff,
                slots: StdRwLock::new(Vec::new()),
                events,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    // ─── Registry ────────────────────────────────────────────────────────

    /// Register an endpoint. It starts Disconnected.
    pub fn register(&self, config: EndpointConfig) -> Result<EndpointHandle, UpstreamError> {
        if config.name.trim().is_empty() {
            return Err(UpstreamError::ConfigError {
                reason: "endpoint name must not be empty".into(),
            });
        }
        let mut slots = self.inner.slots.write().unwrap_or_else(|e| e.into_inner());
        if slots.iter().any(|s| s.name() == config.name) {
            return Err(UpstreamError::ConfigError {
                reason: format!("endpoint '{}' is registered twice", config.name),
            });
        }
        let slot = Arc::new(EndpointSlot::new(config));
        slots.push(slot.clone());
        Ok(EndpointHandle { slot })
    }

    pub fn handle(&self, name: &str) -> Result<EndpointHandle, UpstreamError> {
        self.slot(name)
            .map(|slot| EndpointHandle { slot })
            .ok_or_else(|| UpstreamError::UnknownEndpoint {
                name: name.to_string(),
            })
    }

    /// All endpoints, in registration order.
    pub fn handles(&self) -> Vec<EndpointHandle> {
        self.slots()
            .into_iter()
            .map(|slot| EndpointHandle { slot })
            .collect()
    }

    pub fn state(&self, name: &str) -> Option<ConnectionState> {
        self.slot(name).map(|s| s.state())
    }

    /// Observe state changes of one endpoint.
    pub fn watch_state(&self, name: &str) -> Option<watch::Receiver<ConnectionState>> {
        self.slot(name).map(|s| s.state.subscribe())
    }

    pub fn info(&self, name: &str) -> Option<UpstreamInfo> {
        self.slot(name).and_then(|slot| EndpointHandle { slot }.info())
    }

    /// Lifecycle events for every endpoint.
    pub fn events(&self) -> broadcast::Receiver<EndpointEvent> {
        self.inner.events.subscribe()
    }

    fn slot(&self, name: &str) -> Option<Arc<EndpointSlot>> {
        self.inner
            .slots
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|s| s.name() == name)
            .cloned()
    }

    fn slots(&self) -> Vec<Arc<EndpointSlot>> {
        self.inner
            .slots
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn emit(&self, event: EndpointEvent) {
        // No receivers is fine.
        let _ = self.inner.events.send(event);
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Connect one endpoint and run the initialize exchange.
    ///
    /// On failure the reconnect loop takes over (unless the configuration
    /// itself is broken) and the error is returned.
    pub async fn connect(&self, name: &str) -> Result<EndpointHandle, UpstreamError> {
        let slot = self.slot(name).ok_or_else(|| UpstreamError::UnknownEndpoint {
            name: name.to_string(),
        })?;
        if self.inner.shutdown.is_cancelled() {
            return Err(UpstreamError::unavailable(name, "connection manager is shut down"));
        }
        if slot.state() == ConnectionState::Ready {
            return Ok(EndpointHandle { slot });
        }

        match self.establish(&slot).await {
            Ok(Some(session)) => {
                self.watch_session(slot.clone(), session);
                Ok(EndpointHandle { slot })
            }
            Ok(None) => Ok(EndpointHandle { slot }),
            Err(e) => {
                tracing::warn!(endpoint = %name, error = %e, "failed to connect endpoint");
                if matches!(e, UpstreamError::ConfigError { .. }) {
                    slot.set_state(ConnectionState::Closed);
                    self.emit(EndpointEvent::Closed {
                        endpoint: name.to_string(),
                    });
                } else {
                    slot.set_state(ConnectionState::Degraded);
                    self.emit(EndpointEvent::Degraded {
                        endpoint: name.to_string(),
                        reason: e.to_string(),
                    });
                    self.schedule_reconnect(slot);
                }
                Err(e)
            }
        }
    }

    /// Connect every registered endpoint concurrently.
    ///
    /// Partial success is normal; failures come back per endpoint.
    pub async fn connect_all(&self) -> (Vec<EndpointHandle>, Vec<(String, UpstreamError)>) {
        let names: Vec<String> = self.slots().iter().map(|s| s.name().to_string()).collect();
        let results =
            futures::future::join_all(names.iter().map(|name| self.connect(name))).await;

        let mut ready = Vec::new();
        let mut failed = Vec::new();
        for (name, result) in names.into_iter().zip(results) {
            match result {
                Ok(handle) => ready.push(handle),
                Err(e) => failed.push((name, e)),
            }
        }
        tracing::info!(
            ready = ready.len(),
            failed = failed.len(),
            "endpoint startup complete"
        );
        (ready, failed)
    }

    /// Bring a Closed endpoint back: clears the failure and connects again.
    pub async fn reset(&self, name: &str) -> Result<EndpointHandle, UpstreamError> {
        let slot = self.slot(name).ok_or_else(|| UpstreamError::UnknownEndpoint {
            name: name.to_string(),
        })?;
        if slot.state() == ConnectionState::Closed {
            tracing::info!(endpoint = %name, "resetting closed endpoint");
            slot.set_state(ConnectionState::Disconnected);
        }
        self.connect(name).await
    }

    /// Close every session and stop all reconnect loops.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        for slot in self.slots() {
            let session = slot.take_session();
            if let Some(session) = session {
                session.close().await;
            }
            if slot.state() != ConnectionState::Closed {
                slot.set_state(ConnectionState::Closed);
                self.emit(EndpointEvent::Closed {
                    endpoint: slot.name().to_string(),
                });
            }
        }
        tracing::info!("connection manager shut down");
    }

    /// Open a transport and initialize it. Returns the new session, or
    /// `None` if another caller connected the endpoint meanwhile.
    async fn establish(&self, slot: &Arc<EndpointSlot>) -> Result<Option<Arc<Session>>, UpstreamError> {
        let _guard = slot.connecting.lock().await;
        if slot.state() == ConnectionState::Ready && slot.current_session().is_some() {
            return Ok(None);
        }
        let name = slot.name();
        slot.set_state(ConnectionState::Connecting);

        let opened = self.inner.connector.open(&slot.config).await?;
        let session = Session::start(name, opened, slot.subscribers.clone());

        let info = match lifecycle::initialize(&session, &self.inner.client_name).await {
            Ok(info) => info,
            Err(e) => {
                let stderr = session.transport().diagnostics();
                session.close().await;
                return Err(match e {
                    UpstreamError::InitFailed { name, reason } => UpstreamError::InitFailed {
                        name,
                        reason: format!("{reason}{}", format_stderr_suffix(stderr.as_deref())),
                    },
                    other => other,
                });
            }
        };

        tracing::info!(
            endpoint = %name,
            protocol_version = info.protocol_version.as_deref().unwrap_or("unknown"),
            server = info
                .server_info
                .as_ref()
                .and_then(|s| s.name.as_deref())
                .unwrap_or("unknown"),
            "endpoint ready"
        );

        *slot.info.write().unwrap_or_else(|e| e.into_inner()) = Some(info);
        *slot.session.write().unwrap_or_else(|e| e.into_inner()) = Some(session.clone());
        slot.set_state(ConnectionState::Ready);
        self.emit(EndpointEvent::Ready {
            endpoint: name.to_string(),
        });
        Ok(Some(session))
    }

    /// Degrade the endpoint when `session` terminates.
    fn watch_session(&self, slot: Arc<EndpointSlot>, session: Arc<Session>) {
        let manager = self.clone();
        tokio::spawn(async move {
            let reason = tokio::select! {
                reason = session.terminated() => reason,
                _ = manager.inner.shutdown.cancelled() => return,
            };
            if manager.inner.shutdown.is_cancelled() || !slot.is_current(&session) {
                return;
            }
            slot.take_session();

            tracing::warn!(endpoint = %slot.name(), reason = %reason, "endpoint degraded");
            slot.set_state(ConnectionState::Degraded);
            manager.emit(EndpointEvent::Degraded {
                endpoint: slot.name().to_string(),
                reason,
            });
            manager.schedule_reconnect(slot);
            session.transport().close().await;
        });
    }

    /// Start the reconnect loop unless one is already running.
    fn schedule_reconnect(&self, slot: Arc<EndpointSlot>) {
        if slot
            .reconnecting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let manager = self.clone();
        tokio::spawn(async move { manager.reconnect_loop(slot).await });
    }

    async fn reconnect_loop(&self, slot: Arc<EndpointSlot>) {
        let policy = &self.inner.backoff;
        let name = slot.name().to_string();

        for attempt in 1..=policy.max_attempts {
            let delay = policy.jittered_delay(attempt);
            tracing::info!(
                endpoint = %name,
                attempt,
                max_attempts = policy.max_attempts,
                delay_ms = delay.as_millis() as u64,
                "scheduling reconnect"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.inner.shutdown.cancelled() => {
                    slot.reconnecting.store(false, Ordering::Release);
                    return;
                }
            }

            match self.establish(&slot).await {
                Ok(session) => {
                    slot.reconnecting.store(false, Ordering::Release);
                    if let Some(session) = session {
                        self.watch_session(slot, session);
                    }
                    tracing::info!(endpoint = %name, attempt, "endpoint reconnected");
                    return;
                }
                Err(e) => {
                    tracing::warn!(endpoint = %name, attempt, error = %e, "reconnect attempt failed");
                    slot.set_state(ConnectionState::Degraded);
                }
            }
        }

        tracing::error!(
            endpoint = %name,
            attempts = policy.max_attempts,
            "reconnect attempts exhausted, closing endpoint"
        );
        slot.set_state(ConnectionState::Closed);
        slot.reconnecting.store(false, Ordering::Release);
        self.emit(EndpointEvent::Closed { endpoint: name });
    }

    // ─── Calls ───────────────────────────────────────────────────────────

    /// Call `method` on an endpoint. `timeout` defaults to the endpoint's
    /// configured call timeout.
    pub async fn call(
        &self,
        handle: &EndpointHandle,
        method: &str,
        params: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value, UpstreamError> {
        self.call_with_cancel(handle, method, params, timeout, None)
            .await
    }

    /// Like [`call`](Self::call), but gives up when `cancel` fires and tells
    /// the endpoint so.
    pub async fn call_with_cancel(
        &self,
        handle: &EndpointHandle,
        method: &str,
        params: Option<Value>,
        timeout: Option<Duration>,
        cancel: Option<&CancellationToken>,
    ) -> Result<Value, UpstreamError> {
        let slot = &handle.slot;
        let session = slot.current_session().ok_or_else(|| {
            UpstreamError::unavailable(slot.name(), format!("endpoint is {}", slot.state()))
        })?;
        let timeout = timeout.unwrap_or(slot.config.call_timeout);
        tracing::debug!(endpoint = %slot.name(), method, "calling endpoint");
        session.request(method, params, timeout, cancel).await
    }

    pub async fn notify(
        &self,
        handle: &EndpointHandle,
        method: &str,
        params: Option<Value>,
    ) -> Result<(), UpstreamError> {
        let slot = &handle.slot;
        let session = slot.current_session().ok_or_else(|| {
            UpstreamError::unavailable(slot.name(), format!("endpoint is {}", slot.state()))
        })?;
        session.notify(method, params).await
    }

    /// Subscribe to the endpoint's notifications. Survives reconnects.
    pub fn subscribe(&self, handle: &EndpointHandle) -> NotificationStream {
        let rx = handle.slot.subscribers.subscribe();
        Box::pin(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|n| (n, rx))
        }))
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
