//! The front-facing hub.
//!
//! Serves one coherent MCP surface over all endpoints: waits for endpoints
//! during the handshake, routes namespaced calls to their owners, and relays
//! upstream notifications with identifiers rewritten into namespaced form.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration;

use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;

use super::errors::RouterError;
use super::handshake::{merge_features, negotiate_version, NegotiatedCapabilities};
use crate::catalog::{namespaced, Aggregator, CapabilityKind};
use crate::upstream::types::{
    classify, error_codes, error_response, success_response, Incoming, JsonRpcError,
};
use crate::upstream::{ConnectionManager, ConnectionState, EndpointEvent, Notification};

/// Capacity of the front-end notification broadcast.
const NOTIFICATION_CAPACITY: usize = 256;

/// How the hub presents itself.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub name: String,
    pub version: String,
    /// How long the handshake waits for endpoints to settle.
    pub ready_timeout: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            name: "switchyard".into(),
            version: env!("CARGO_PKG_VERSION").into(),
            ready_timeout: Duration::from_secs(30),
        }
    }
}

struct RouterInner {
    config: RouterConfig,
    manager: ConnectionManager,
    aggregator: Arc<Aggregator>,
    negotiated: StdRwLock<Option<NegotiatedCapabilities>>,
    handshake_lock: Mutex<()>,
    notifications: broadcast::Sender<Notification>,
    relays_started: AtomicBool,
    stop: CancellationToken,
}

/// Request router. Cheap to clone.
#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

impl Router {
    /// Every endpoint already registered with `manager` joins the catalog.
    pub fn new(manager: ConnectionManager, aggregator: Arc<Aggregator>, config: RouterConfig) -> Self {
        for handle in manager.handles() {
            aggregator.add_endpoint_config(handle.config());
        }
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Self {
            inner: Arc::new(RouterInner {
                config,
                manager,
                aggregator,
                negotiated: StdRwLock::new(None),
                handshake_lock: Mutex::new(()),
                notifications,
                relays_started: AtomicBool::new(false),
                stop: CancellationToken::new(),
            }),
        }
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.inner.manager
    }

    pub fn aggregator(&self) -> &Arc<Aggregator> {
        &self.inner.aggregator
    }

    pub fn config(&self) -> &RouterConfig {
        &self.inner.config
    }

    /// Outcome of the last handshake, if any.
    pub fn negotiated(&self) -> Option<NegotiatedCapabilities> {
        self.inner
            .negotiated
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Relayed notifications for front-end clients.
    pub fn notifications(&self) -> broadcast::Receiver<Notification> {
        self.inner.notifications.subscribe()
    }

    // ─── Handshake ───────────────────────────────────────────────────────

    /// Wait for endpoints, aggregate, and negotiate.
    ///
    /// `client_params` are the front-end `initialize` params; only their
    /// `protocolVersion` is consulted.
    pub async fn handshake(&self, client_params: &Value) -> NegotiatedCapabilities {
        let _guard = self.inner.handshake_lock.lock().await;
        let manager = &self.inner.manager;
        let handles = manager.handles();

        for handle in &handles {
            if handle.state() == ConnectionState::Disconnected {
                let manager = manager.clone();
                let name = handle.name().to_string();
                tokio::spawn(async move {
                    let _ = manager.connect(&name).await;
                });
            }
        }

        let deadline = tokio::time::Instant::now() + self.inner.config.ready_timeout;
        let waits = handles.iter().filter_map(|h| manager.watch_state(h.name())).map(|mut rx| async move {
            let _ = tokio::time::timeout_at(deadline, rx.wait_for(|s| s.is_settled())).await;
        });
        futures::future::join_all(waits).await;

        let mut ready = Vec::new();
        let mut excluded = Vec::new();
        for handle in &handles {
            if handle.state() == ConnectionState::Ready {
                ready.push(handle.clone());
            } else {
                tracing::warn!(endpoint = %handle.name(), state = %handle.state(), "endpoint excluded from handshake");
                excluded.push(handle.name().to_string());
            }
        }

        for handle in &ready {
            if let Err(e) = self.inner.aggregator.refresh(handle.name()).await {
                tracing::warn!(endpoint = %handle.name(), error = %e, "initial aggregation failed");
            }
        }

        let infos: Vec<_> = ready.iter().filter_map(|h| h.info()).collect();
        let reported: Vec<Option<String>> = ready
            .iter()
            .map(|h| h.info().and_then(|i| i.protocol_version))
            .collect();
        let client_version = client_params.get("protocolVersion").and_then(Value::as_str);

        let negotiated = NegotiatedCapabilities {
            protocol_version: negotiate_version(&reported, client_version).to_string(),
            capabilities: merge_features(infos.iter().map(|i| &i.capabilities)),
            endpoints: ready.iter().map(|h| h.name().to_string()).collect(),
            excluded,
        };
        tracing::info!(
            protocol_version = %negotiated.protocol_version,
            ready = negotiated.endpoints.len(),
            excluded = negotiated.excluded.len(),
            "handshake complete"
        );

        *self.inner.negotiated.write().unwrap_or_else(|e| e.into_inner()) = Some(negotiated.clone());
        self.start_relays();
        negotiated
    }

    fn ensure_ready(&self) -> Result<(), RouterError> {
        if self
            .inner
            .negotiated
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_none()
        {
            return Err(RouterError::NotReady);
        }
        Ok(())
    }

    // ─── Routing ─────────────────────────────────────────────────────────

    /// Call a namespaced tool.
    pub async fn route(&self, name: &str, arguments: Value) -> Result<Value, RouterError> {
        self.route_with_cancel(name, arguments, None).await
    }

    pub async fn route_with_cancel(
        &self,
        name: &str,
        arguments: Value,
        cancel: Option<&CancellationToken>,
    ) -> Result<Value, RouterError> {
        let (endpoint, params) = self.tool_request(name, arguments)?;
        self.call_owner(&endpoint, "tools/call", Some(params), cancel)
            .await
    }

    /// Fetch a namespaced prompt.
    pub async fn get_prompt(&self, name: &str, arguments: Option<Value>) -> Result<Value, RouterError> {
        let (endpoint, params) = self.prompt_request(name, arguments)?;
        self.call_owner(&endpoint, "prompts/get", Some(params), None)
            .await
    }

    /// Read a resource by its URI.
    pub async fn read_resource(&self, uri: &str) -> Result<Value, RouterError> {
        let endpoint = self.resource_owner(uri)?;
        self.call_owner(&endpoint, "resources/read", Some(json!({"uri": uri})), None)
            .await
    }

    /// Ask the owner of a prompt or resource for argument completions.
    ///
    /// `params.ref` names a namespaced prompt (`ref/prompt`) or a resource
    /// URI (`ref/resource`); the prompt name is rewritten to the original.
    pub async fn complete(&self, params: Value) -> Result<Value, RouterError> {
        self.ensure_ready()?;
        let mut params = params;
        let reference = params.get("ref").cloned().unwrap_or(Value::Null);
        let endpoint = match reference.get("type").and_then(Value::as_str) {
            Some("ref/prompt") => {
                let name = required_str(&reference, "name")?;
                let (endpoint, original) = {
                    let catalog = self.inner.aggregator.snapshot();
                    let entry = catalog
                        .lookup(CapabilityKind::Prompt, name)
                        .ok_or_else(|| RouterError::NotFound {
                            what: "prompt",
                            name: name.to_string(),
                        })?;
                    (entry.endpoint.clone(), entry.original.clone())
                };
                params["ref"]["name"] = Value::String(original);
                endpoint
            }
            Some("ref/resource") => self.resource_owner(required_str(&reference, "uri")?)?,
            _ => {
                return Err(RouterError::InvalidParams {
                    reason: "ref must be a ref/prompt or ref/resource".into(),
                })
            }
        };
        self.call_owner(&endpoint, "completion/complete", Some(params), None)
            .await
    }

    /// Forward `resources/subscribe` or `resources/unsubscribe` to the
    /// resource's owner.
    pub async fn subscription(&self, method: &str, uri: &str) -> Result<Value, RouterError> {
        let endpoint = self.resource_owner(uri)?;
        self.call_owner(&endpoint, method, Some(json!({"uri": uri})), None)
            .await
    }

    /// Set the log level on every endpoint that advertises logging.
    /// Endpoints that refuse are logged and skipped.
    pub async fn set_log_level(&self, level: &str) -> Result<Value, RouterError> {
        let endpoints = self
            .negotiated()
            .map(|n| n.endpoints)
            .ok_or(RouterError::NotReady)?;
        for endpoint in endpoints {
            let advertises = self
                .inner
                .manager
                .info(&endpoint)
                .is_some_and(|info| info.capabilities.get("logging").is_some());
            if !advertises {
                continue;
            }
            let params = json!({ "level": level });
            if let Err(e) = self.call_owner(&endpoint, "logging/setLevel", Some(params), None).await {
                tracing::warn!(endpoint = %endpoint, error = %e, "setLevel failed");
            }
        }
        Ok(json!({}))
    }

    fn tool_request(&self, name: &str, arguments: Value) -> Result<(String, Value), RouterError> {
        self.ensure_ready()?;
        let catalog = self.inner.aggregator.snapshot();
        let entry = catalog
            .lookup(CapabilityKind::Tool, name)
            .ok_or_else(|| RouterError::NotFound {
                what: "tool",
                name: name.to_string(),
            })?;
        tracing::debug!(tool = name, endpoint = %entry.endpoint, "routing tool call");
        let params = json!({"name": entry.original, "arguments": arguments});
        Ok((entry.endpoint.clone(), params))
    }

    fn prompt_request(&self, name: &str, arguments: Option<Value>) -> Result<(String, Value), RouterError> {
        self.ensure_ready()?;
        let catalog = self.inner.aggregator.snapshot();
        let entry = catalog
            .lookup(CapabilityKind::Prompt, name)
            .ok_or_else(|| RouterError::NotFound {
                what: "prompt",
                name: name.to_string(),
            })?;
        let mut params = json!({"name": entry.original});
        if let Some(arguments) = arguments {
            params["arguments"] = arguments;
        }
        Ok((entry.endpoint.clone(), params))
    }

    fn resource_owner(&self, uri: &str) -> Result<String, RouterError> {
        self.ensure_ready()?;
        let catalog = self.inner.aggregator.snapshot();
        catalog
            .resource_by_uri(uri)
            .map(str::to_string)
            .ok_or_else(|| RouterError::NotFound {
                what: "resource",
                name: uri.to_string(),
            })
    }

    /// Call an arbitrary method on a named endpoint, bypassing the catalog.
    pub async fn call_endpoint(
        &self,
        endpoint: &str,
        method: &str,
        params: Option<Value>,
        cancel: Option<&CancellationToken>,
    ) -> Result<Value, RouterError> {
        self.ensure_ready()?;
        self.call_owner(endpoint, method, params, cancel).await
    }

    async fn call_owner(
        &self,
        endpoint: &str,
        method: &str,
        params: Option<Value>,
        cancel: Option<&CancellationToken>,
    ) -> Result<Value, RouterError> {
        let manager = &self.inner.manager;
        let handle = manager
            .handle(endpoint)
            .map_err(|e| RouterError::upstream(endpoint, e))?;
        manager
            .call_with_cancel(&handle, method, params, None, cancel)
            .await
            .map_err(|e| RouterError::upstream(endpoint, e))
    }

    /// Presented items of one kind.
    pub fn list(&self, kind: CapabilityKind) -> Result<Vec<Value>, RouterError> {
        self.ensure_ready()?;
        Ok(self.inner.aggregator.snapshot().list(kind))
    }

    /// Re-aggregate every endpoint and tell clients.
    pub async fn refresh(&self) {
        for (endpoint, e) in self.inner.aggregator.refresh_all().await {
            tracing::warn!(endpoint = %endpoint, error = %e, "refresh failed");
        }
        self.emit(Notification::new("notifications/tools/list_changed", None));
    }

    /// Stop relays and shut every endpoint down.
    pub async fn shutdown(&self) {
        self.inner.stop.cancel();
        self.inner.manager.shutdown().await;
    }

    // ─── Notification Relay ──────────────────────────────────────────────

    fn emit(&self, notification: Notification) {
        let _ = self.inner.notifications.send(notification);
    }

    fn start_relays(&self) {
        if self.inner.relays_started.swap(true, Ordering::AcqRel) {
            return;
        }

        for handle in self.inner.manager.handles() {
            let router = self.clone();
            let mut stream = self.inner.manager.subscribe(&handle);
            let endpoint = handle.name().to_string();
            tokio::spawn(async move {
                loop {
                    let next = tokio::select! {
                        n = stream.next() => n,
                        _ = router.inner.stop.cancelled() => break,
                    };
                    let Some(notification) = next else { break };
                    router.relay(&endpoint, notification).await;
                }
            });
        }

        let router = self.clone();
        let mut events = self.inner.manager.events();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    e = events.recv() => e,
                    _ = router.inner.stop.cancelled() => break,
                };
                match event {
                    Ok(EndpointEvent::Ready { endpoint }) => {
                        if let Err(e) = router.inner.aggregator.refresh(&endpoint).await {
                            tracing::warn!(endpoint = %endpoint, error = %e, "re-aggregation failed");
                            continue;
                        }
                        router.emit(Notification::new("notifications/tools/list_changed", None));
                    }
                    Ok(EndpointEvent::Closed { endpoint }) => {
                        router.inner.aggregator.remove(&endpoint).await;
                        router.emit(Notification::new("notifications/tools/list_changed", None));
                    }
                    Ok(EndpointEvent::Degraded { .. }) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "endpoint events lagged, refreshing everything");
                        router.inner.aggregator.refresh_all().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// Forward one upstream notification to front-end subscribers.
    async fn relay(&self, endpoint: &str, notification: Notification) {
        if let Some(kind) = CapabilityKind::from_list_changed(&notification.method) {
            tracing::debug!(endpoint, %kind, "upstream listing changed");
            if let Err(e) = self.inner.aggregator.refresh(endpoint).await {
                tracing::warn!(endpoint, error = %e, "re-aggregation failed");
            }
            self.emit(Notification::new(&notification.method, None));
            return;
        }

        let catalog = self.inner.aggregator.snapshot();
        let mut params = match notification.params {
            Some(Value::Object(map)) => Value::Object(map),
            Some(other) => json!({ "value": other }),
            None => json!({}),
        };
        if let Some(original) = params.get("name").and_then(Value::as_str) {
            let renamed = catalog
                .namespaced_for(CapabilityKind::Tool, endpoint, original)
                .or_else(|| catalog.namespaced_for(CapabilityKind::Prompt, endpoint, original))
                .map(str::to_string)
                .unwrap_or_else(|| namespaced(endpoint, original));
            params["name"] = Value::String(renamed);
        }
        match params.get_mut("_meta") {
            Some(Value::Object(meta)) => {
                meta.insert("endpoint".into(), Value::String(endpoint.to_string()));
            }
            _ => params["_meta"] = json!({ "endpoint": endpoint }),
        }
        self.emit(Notification::new(&notification.method, Some(params)));
    }

    // ─── Front-End Protocol ──────────────────────────────────────────────

    /// Handle one front-end JSON-RPC message. Notifications get no reply.
    pub async fn handle_message(&self, message: Value) -> Option<Value> {
        self.handle_message_cancellable(message, None).await
    }

    /// Like [`handle_message`](Self::handle_message); `cancel` aborts a
    /// routed call in flight.
    pub async fn handle_message_cancellable(
        &self,
        message: Value,
        cancel: Option<&CancellationToken>,
    ) -> Option<Value> {
        match classify(message) {
            Incoming::Request { id, method, params } => {
                let params = params.unwrap_or(Value::Null);
                Some(match self.dispatch(&method, &params, cancel).await {
                    Ok(result) => success_response(id, result),
                    Err(e) => {
                        tracing::debug!(method = %method, error = %e, "request failed");
                        error_response(id, e.to_jsonrpc())
                    }
                })
            }
            Incoming::Notification(n) => {
                tracing::trace!(method = %n.method, "client notification");
                None
            }
            Incoming::Response { .. } => None,
            Incoming::Invalid(reason) => Some(error_response(
                Value::Null,
                JsonRpcError::new(error_codes::INVALID_REQUEST, reason),
            )),
        }
    }

    async fn dispatch(
        &self,
        method: &str,
        params: &Value,
        cancel: Option<&CancellationToken>,
    ) -> Result<Value, RouterError> {
        match method {
            "initialize" => {
                let negotiated = self.handshake(params).await;
                Ok(json!({
                    "protocolVersion": negotiated.protocol_version,
                    "capabilities": negotiated.capabilities,
                    "serverInfo": {
                        "name": self.inner.config.name,
                        "version": self.inner.config.version,
                    }
                }))
            }
            "ping" => Ok(json!({})),
            "tools/list" => Ok(json!({ "tools": self.list(CapabilityKind::Tool)? })),
            "prompts/list" => Ok(json!({ "prompts": self.list(CapabilityKind::Prompt)? })),
            "resources/list" => Ok(json!({ "resources": self.list(CapabilityKind::Resource)? })),
            "tools/call" => {
                let name = required_str(params, "name")?;
                let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));
                let (endpoint, upstream) = self.tool_request(name, arguments)?;
                self.call_owner(&endpoint, method, Some(with_meta(upstream, params)), cancel)
                    .await
            }
            "prompts/get" => {
                let name = required_str(params, "name")?;
                let (endpoint, upstream) = self.prompt_request(name, params.get("arguments").cloned())?;
                self.call_owner(&endpoint, method, Some(with_meta(upstream, params)), cancel)
                    .await
            }
            "resources/read" => {
                let uri = required_str(params, "uri")?;
                let endpoint = self.resource_owner(uri)?;
                let upstream = with_meta(json!({"uri": uri}), params);
                self.call_owner(&endpoint, method, Some(upstream), cancel)
                    .await
            }
            "resources/subscribe" | "resources/unsubscribe" => {
                let uri = required_str(params, "uri")?;
                self.subscription(method, uri).await
            }
            "completion/complete" => self.complete(params.clone()).await,
            "logging/setLevel" => {
                let level = required_str(params, "level")?;
                self.set_log_level(level).await
            }
            other => Err(RouterError::MethodNotFound {
                method: other.to_string(),
            }),
        }
    }
}

/// Carry the client's `_meta` (progress token included) onto an upstream
/// request so progress notifications stay correlated.
fn with_meta(mut upstream: Value, client: &Value) -> Value {
    if let Some(meta) = client.get("_meta") {
        upstream["_meta"] = meta.clone();
    }
    upstream
}

fn required_str<'a>(params: &'a Value, key: &str) -> Result<&'a str, RouterError> {
    params
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| RouterError::InvalidParams {
            reason: format!("missing string field '{key}'"),
        })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
