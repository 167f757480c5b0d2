//! In-process mock endpoints for tests.
//!
//! [`MockServer`] speaks framed JSON-RPC over a `tokio::io::duplex` pipe,
//! using the real framing code, so everything above the transport runs
//! unmodified. [`MockConnector`] hands out connections to registered mock
//! servers and lets tests kill them, take them offline and count attempts.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::errors::UpstreamError;
use super::framing::{write_frame, FrameReader};
use super::lifecycle::BackoffPolicy;
use super::transport::{Connector, FramedTransport, OpenedTransport};
use super::types::{error_codes, EndpointConfig, JsonRpcError};

/// Backoff without jitter: 1s, 2s, 4s, 8s; four attempts.
pub fn test_backoff() -> BackoffPolicy {
    BackoffPolicy {
        base: Duration::from_secs(1),
        max_delay: Duration::from_secs(30),
        max_attempts: 4,
        jitter: 0.0,
    }
}

type ToolHandler = Arc<dyn Fn(&str, &Value) -> Result<Value, JsonRpcError> + Send + Sync>;

// ─── MockServer ──────────────────────────────────────────────────────────────

struct MockState {
    protocol_version: Option<String>,
    capabilities: Value,
    tools: Vec<Value>,
    prompts: Vec<Value>,
    resources: Vec<Value>,
    handler: Option<ToolHandler>,
    call_delay: Duration,
    page_size: Option<usize>,
    unsupported: HashSet<String>,
}

/// A scriptable MCP server.
#[derive(Clone)]
pub struct MockServer {
    state: Arc<StdMutex<MockState>>,
    tool_calls: Arc<AtomicUsize>,
    methods: Arc<StdMutex<Vec<String>>>,
    requests: Arc<StdMutex<Vec<(String, Value)>>>,
}

impl Default for MockServer {
    fn default() -> Self {
        Self::new()
    }
}

impl MockServer {
    pub fn new() -> Self {
        Self {
            state: Arc::new(StdMutex::new(MockState {
                protocol_version: Some("2025-06-18".into()),
                capabilities: json!({"tools": {"listChanged": true}}),
                tools: Vec::new(),
                prompts: Vec::new(),
                resources: Vec::new(),
                handler: None,
                call_delay: Duration::ZERO,
                page_size: None,
                unsupported: HashSet::new(),
            })),
            tool_calls: Arc::new(AtomicUsize::new(0)),
            methods: Arc::new(StdMutex::new(Vec::new())),
            requests: Arc::new(StdMutex::new(Vec::new())),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// `None` omits `protocolVersion` from the initialize reply.
    pub fn with_version(self, version: impl Into<Option<&'static str>>) -> Self {
        self.lock().protocol_version = version.into().map(str::to_string);
        self
    }

    pub fn with_capabilities(self, capabilities: Value) -> Self {
        self.lock().capabilities = capabilities;
        self
    }

    pub fn with_tool(self, name: &str, description: &str) -> Self {
        self.lock().tools.push(json!({
            "name": name,
            "description": description,
            "inputSchema": {"type": "object", "properties": {}}
        }));
        self
    }

    pub fn with_prompt(self, name: &str) -> Self {
        self.lock().prompts.push(json!({"name": name, "description": format!("{name} prompt")}));
        self
    }

    pub fn with_resource(self, name: &str, uri: &str) -> Self {
        self.lock().resources.push(json!({"name": name, "uri": uri}));
        self
    }

    /// Custom `tools/call` behavior: `(tool name, arguments) -> result`.
    pub fn with_handler<F>(self, handler: F) -> Self
    where
        F: Fn(&str, &Value) -> Result<Value, JsonRpcError> + Send + Sync + 'static,
    {
        self.lock().handler = Some(Arc::new(handler));
        self
    }

    pub fn with_call_delay(self, delay: Duration) -> Self {
        self.lock().call_delay = delay;
        self
    }

    /// Paginate listings with `nextCursor`.
    pub fn with_page_size(self, size: usize) -> Self {
        self.lock().page_size = Some(size);
        self
    }

    /// Answer `method` with -32601.
    pub fn without_method(self, method: &str) -> Self {
        self.lock().unsupported.insert(method.to_string());
        self
    }

    /// Replace the advertised tools at runtime.
    pub fn set_tools(&self, names: &[&str]) {
        self.lock().tools = names
            .iter()
            .map(|n| json!({"name": n, "description": n, "inputSchema": {"type": "object"}}))
            .collect();
    }

    /// Number of `tools/call` requests received.
    pub fn tool_calls(&self) -> usize {
        self.tool_calls.load(Ordering::SeqCst)
    }

    /// Every method received, in order.
    pub fn methods(&self) -> Vec<String> {
        self.methods.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Params of the most recent request for `method`.
    pub fn last_params(&self, method: &str) -> Option<Value> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .rev()
            .find(|(m, _)| m == method)
            .map(|(_, p)| p.clone())
    }

    /// Serve one connection until the client hangs up or `stop` fires.
    async fn serve(
        self,
        io: DuplexStream,
        stop: CancellationToken,
        mut outbound: mpsc::UnboundedReceiver<Value>,
    ) {
        let (read, write) = tokio::io::split(io);
        let writer = Arc::new(Mutex::new(write));
        let mut frames = FrameReader::new(read);

        // Pushed messages get their own task; frame reads are not cancel safe.
        {
            let writer = writer.clone();
            let stop = stop.clone();
            tokio::spawn(async move {
                loop {
                    let message = tokio::select! {
                        m = outbound.recv() => m,
                        _ = stop.cancelled() => None,
                    };
                    let Some(message) = message else { break };
                    let _ = write_frame(&mut *writer.lock().await, &message).await;
                }
            });
        }

        loop {
            let frame = tokio::select! {
                f = frames.next_frame() => f,
                _ = stop.cancelled() => break,
            };
            let Ok(Some(message)) = frame else { break };
            let Some(method) = message.get("method").and_then(Value::as_str) else {
                continue; // response to something we sent
            };
            self.methods
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(method.to_string());
            let Some(id) = message.get("id").cloned() else {
                continue;
            };
            let server = self.clone();
            let writer = writer.clone();
            let stop = stop.clone();
            let method = method.to_string();
            let params = message.get("params").cloned().unwrap_or(Value::Null);
            self.requests
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push((method.clone(), params.clone()));
            tokio::spawn(async move {
                let reply = tokio::select! {
                    r = server.answer(&method, &params) => r,
                    _ = stop.cancelled() => return,
                };
                let envelope = match reply {
                    Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
                    Err(error) => json!({"jsonrpc": "2.0", "id": id, "error": error}),
                };
                let _ = write_frame(&mut *writer.lock().await, &envelope).await;
            });
        }
        // Client hung up: release the writer so the pipe closes.
        stop.cancel();
    }

    async fn answer(&self, method: &str, params: &Value) -> Result<Value, JsonRpcError> {
        if self.lock().unsupported.contains(method) {
            return Err(JsonRpcError::new(
                error_codes::METHOD_NOT_FOUND,
                format!("Method not found: {method}"),
            ));
        }
        match method {
            "initialize" => {
                let state = self.lock();
                let mut result = json!({
                    "capabilities": state.capabilities,
                    "serverInfo": {"name": "mock", "version": "0.0.1"}
                });
                if let Some(v) = &state.protocol_version {
                    result["protocolVersion"] = json!(v);
                }
                Ok(result)
            }
            "ping" => Ok(json!({})),
            "tools/list" => Ok(self.page("tools", |s| &s.tools, params)),
            "prompts/list" => Ok(self.page("prompts", |s| &s.prompts, params)),
            "resources/list" => Ok(self.page("resources", |s| &s.resources, params)),
            "tools/call" => {
                self.tool_calls.fetch_add(1, Ordering::SeqCst);
                let (delay, handler, known) = {
                    let state = self.lock();
                    let name = params["name"].as_str().unwrap_or_default();
                    let known = state.tools.iter().any(|t| t["name"] == name);
                    (state.call_delay, state.handler.clone(), known)
                };
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                let name = params["name"].as_str().unwrap_or_default();
                let arguments = params.get("arguments").cloned().unwrap_or(json!({}));
                match handler {
                    Some(handler) => handler(name, &arguments),
                    None if known => Ok(json!({
                        "content": [{"type": "text", "text": format!("{name} ok")}],
                        "isError": false
                    })),
                    None => Err(JsonRpcError::new(
                        error_codes::INVALID_PARAMS,
                        format!("unknown tool: {name}"),
                    )),
                }
            }
            "prompts/get" => Ok(json!({
                "description": params["name"],
                "messages": [{"role": "user", "content": {"type": "text", "text": "hi"}}]
            })),
            "resources/read" => Ok(json!({
                "contents": [{"uri": params["uri"], "text": "resource body"}]
            })),
            "resources/subscribe" | "resources/unsubscribe" | "logging/setLevel" => Ok(json!({})),
            "completion/complete" => Ok(json!({
                "completion": {"values": [format!("{}-value", params["argument"]["name"].as_str().unwrap_or("arg"))], "hasMore": false}
            })),
            other => Err(JsonRpcError::new(
                error_codes::METHOD_NOT_FOUND,
                format!("Method not found: {other}"),
            )),
        }
    }

    fn page(&self, key: &str, items: impl Fn(&MockState) -> &Vec<Value>, params: &Value) -> Value {
        let state = self.lock();
        let all = items(&state);
        let start = params
            .get("cursor")
            .and_then(Value::as_str)
            .and_then(|c| c.parse::<usize>().ok())
            .unwrap_or(0);
        let size = state.page_size.unwrap_or(usize::MAX);
        let end = start.saturating_add(size).min(all.len());
        let mut result = json!({ key: all[start.min(end)..end] });
        if end < all.len() {
            result["nextCursor"] = json!(end.to_string());
        }
        result
    }
}

// ─── MockConnector ───────────────────────────────────────────────────────────

struct LiveConnection {
    stop: CancellationToken,
    outbound: mpsc::UnboundedSender<Value>,
}

/// Connects endpoints to registered [`MockServer`]s by name.
#[derive(Default)]
pub struct MockConnector {
    servers: StdMutex<HashMap<String, MockServer>>,
    offline: StdMutex<HashSet<String>>,
    live: StdMutex<HashMap<String, LiveConnection>>,
    attempts: StdMutex<Vec<(String, Instant)>>,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add(&self, name: &str, server: MockServer) {
        self.servers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), server);
    }

    pub fn server(&self, name: &str) -> Option<MockServer> {
        self.servers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    /// While offline, connection attempts fail.
    pub fn set_offline(&self, name: &str, offline: bool) {
        let mut set = self.offline.lock().unwrap_or_else(|e| e.into_inner());
        if offline {
            set.insert(name.to_string());
        } else {
            set.remove(name);
        }
    }

    /// Drop the live connection, as if the process exited.
    pub fn kill(&self, name: &str) {
        if let Some(conn) = self
            .live
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name)
        {
            conn.stop.cancel();
        }
    }

    /// Write a raw message to the client side of the live connection.
    pub fn push(&self, name: &str, message: Value) {
        if let Some(conn) = self.live.lock().unwrap_or_else(|e| e.into_inner()).get(name) {
            let _ = conn.outbound.send(message);
        }
    }

    /// When each connection attempt for `name` happened.
    pub fn attempts(&self, name: &str) -> Vec<Instant> {
        self.attempts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, t)| *t)
            .collect()
    }

    pub async fn wait_for_attempts(&self, name: &str, count: usize) {
        while self.attempts(name).len() < count {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    pub async fn wait_for_calls(&self, name: &str, count: usize) {
        let Some(server) = self.server(name) else {
            return;
        };
        while server.tool_calls() < count {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(&self, config: &EndpointConfig) -> Result<OpenedTransport, UpstreamError> {
        let name = config.name.as_str();
        self.attempts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((name.to_string(), Instant::now()));

        if self
            .offline
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(name)
        {
            return Err(UpstreamError::SpawnFailed {
                name: name.to_string(),
                reason: "mock endpoint is offline".into(),
            });
        }
        let server = self.server(name).ok_or_else(|| UpstreamError::SpawnFailed {
            name: name.to_string(),
            reason: "no mock server registered".into(),
        })?;

        let (ours, theirs) = tokio::io::duplex(1 << 20);
        let stop = CancellationToken::new();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(server.serve(theirs, stop.clone(), rx));

        if let Some(old) = self.live.lock().unwrap_or_else(|e| e.into_inner()).insert(
            name.to_string(),
            LiveConnection { stop, outbound: tx },
        ) {
            old.stop.cancel();
        }

        let (read, write) = tokio::io::split(ours);
        Ok(FramedTransport::from_io(name, read, write))
    }
}
