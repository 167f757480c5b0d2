//! Shared types for the connection manager.
//!
//! JSON-RPC 2.0 envelopes, MCP initialize structures, endpoint configuration
//! and connection state.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

// ─── Protocol Versions ───────────────────────────────────────────────────────

/// Protocol revisions this hub understands, oldest first.
pub const PROTOCOL_VERSIONS: &[&str] = &["2024-11-05", "2025-03-26", "2025-06-18"];

/// Fallback revision used when any endpoint lacks a newer one.
pub const LEGACY_PROTOCOL_VERSION: &str = "2024-11-05";

/// Newest revision; offered in our own `initialize` requests.
pub const LATEST_PROTOCOL_VERSION: &str = "2025-06-18";

// ─── JSON-RPC 2.0 ───────────────────────────────────────────────────────────

/// JSON-RPC 2.0 request message.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC request.
    pub fn new(id: u64, method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }

    pub fn to_value(&self) -> Value {
        let mut message = json!({
            "jsonrpc": self.jsonrpc,
            "id": self.id,
            "method": self.method,
        });
        if let Some(params) = &self.params {
            message["params"] = params.clone();
        }
        message
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

/// A notification flowing from an endpoint to its subscribers (or from the
/// hub to its clients).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Notification {
    pub fn new(method: &str, params: Option<Value>) -> Self {
        Self {
            method: method.to_string(),
            params,
        }
    }

    /// Render as a JSON-RPC notification envelope.
    pub fn to_message(&self) -> Value {
        let mut message = json!({"jsonrpc": "2.0", "method": self.method});
        if let Some(params) = &self.params {
            message["params"] = params.clone();
        }
        message
    }
}

/// Classification of one inbound JSON-RPC message.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    /// A response to one of our requests.
    Response {
        id: Value,
        outcome: Result<Value, JsonRpcError>,
    },
    /// A request from the remote side that expects an answer.
    Request {
        id: Value,
        method: String,
        params: Option<Value>,
    },
    /// A fire-and-forget notification.
    Notification(Notification),
    /// Valid JSON, but not a JSON-RPC 2.0 message.
    Invalid(String),
}

/// Classify a parsed JSON value as a JSON-RPC message.
pub fn classify(message: Value) -> Incoming {
    let Value::Object(mut obj) = message else {
        return Incoming::Invalid("message is not a JSON object".into());
    };

    if obj.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
        return Incoming::Invalid("missing or wrong 'jsonrpc' version".into());
    }

    let params = obj.remove("params");
    match (obj.remove("id"), obj.remove("method")) {
        (Some(id), Some(Value::String(method))) => Incoming::Request { id, method, params },
        (None, Some(Value::String(method))) => Incoming::Notification(Notification { method, params }),
        (Some(id), None) => {
            if let Some(error) = obj.remove("error") {
                match serde_json::from_value::<JsonRpcError>(error) {
                    Ok(err) => Incoming::Response {
                        id,
                        outcome: Err(err),
                    },
                    Err(e) => Incoming::Invalid(format!("invalid error object: {e}")),
                }
            } else if let Some(result) = obj.remove("result") {
                Incoming::Response {
                    id,
                    outcome: Ok(result),
                }
            } else {
                Incoming::Invalid("response carries neither result nor error".into())
            }
        }
        _ => Incoming::Invalid("message has neither id nor method".into()),
    }
}

/// Build a success response envelope.
pub fn success_response(id: Value, result: Value) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "result": result})
}

/// Build an error response envelope.
pub fn error_response(id: Value, error: JsonRpcError) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "error": error})
}

// ─── MCP Initialize ──────────────────────────────────────────────────────────

/// MCP initialize response payload.
#[derive(Debug, Clone, Deserialize)]
pub struct InitializeResult {
    #[serde(default, alias = "protocolVersion")]
    pub protocol_version: Option<String>,
    #[serde(default)]
    pub capabilities: Value,
    #[serde(default, alias = "serverInfo")]
    pub server_info: Option<ServerInfo>,
}

/// Server info returned in the initialize response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: Option<String>,
    pub version: Option<String>,
}

/// What an endpoint told us about itself during initialization.
#[derive(Debug, Clone)]
pub struct UpstreamInfo {
    pub protocol_version: Option<String>,
    pub capabilities: Value,
    pub server_info: Option<ServerInfo>,
}

impl From<InitializeResult> for UpstreamInfo {
    fn from(result: InitializeResult) -> Self {
        Self {
            protocol_version: result.protocol_version,
            capabilities: result.capabilities,
            server_info: result.server_info,
        }
    }
}

// ─── Endpoints ───────────────────────────────────────────────────────────────

/// How an endpoint is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Child process speaking framed JSON-RPC over stdin/stdout.
    Process,
    /// HTTP POST for requests plus an event stream for server messages.
    Http,
}

/// Launch or connect parameters.
#[derive(Debug, Clone, PartialEq)]
pub enum EndpointTransport {
    Process {
        command: String,
        args: Vec<String>,
        env: BTreeMap<String, String>,
        cwd: Option<PathBuf>,
    },
    Http {
        url: String,
        headers: BTreeMap<String, String>,
    },
}

/// Default response timeout for calls to an endpoint.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// A configured upstream endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointConfig {
    /// Unique endpoint name; also the namespace prefix in the catalog.
    pub name: String,
    pub transport: EndpointTransport,
    /// Item names to keep (compared after sanitization). `None` keeps all.
    pub include: Option<Vec<String>>,
    /// Item names to drop (compared after sanitization).
    pub exclude: Option<Vec<String>>,
    pub call_timeout: Duration,
    /// Environment variable the credential provider reads a bearer token from.
    pub auth_token_env: Option<String>,
}

impl EndpointConfig {
    /// A process endpoint with no filters.
    pub fn process(name: &str, command: &str, args: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            transport: EndpointTransport::Process {
                command: command.to_string(),
                args: args.iter().map(|a| a.to_string()).collect(),
                env: BTreeMap::new(),
                cwd: None,
            },
            include: None,
            exclude: None,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            auth_token_env: None,
        }
    }

    /// An HTTP endpoint with no filters.
    pub fn http(name: &str, url: &str) -> Self {
        Self {
            name: name.to_string(),
            transport: EndpointTransport::Http {
                url: url.to_string(),
                headers: BTreeMap::new(),
            },
            include: None,
            exclude: None,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            auth_token_env: None,
        }
    }

    pub fn kind(&self) -> TransportKind {
        match self.transport {
            EndpointTransport::Process { .. } => TransportKind::Process,
            EndpointTransport::Http { .. } => TransportKind::Http,
        }
    }
}

/// Lifecycle state of an endpoint connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Ready,
    Degraded,
    Closed,
}

impl ConnectionState {
    /// Ready or permanently closed: the handshake stops waiting on it.
    pub fn is_settled(&self) -> bool {
        matches!(self, ConnectionState::Ready | ConnectionState::Closed)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Ready => "ready",
            ConnectionState::Degraded => "degraded",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Lifecycle events broadcast by the connection manager.
#[derive(Debug, Clone, PartialEq)]
pub enum EndpointEvent {
    /// Initial connect or reconnect completed.
    Ready { endpoint: String },
    /// The session failed; reconnection is scheduled.
    Degraded { endpoint: String, reason: String },
    /// Reconnect attempts are exhausted (or the hub shut down).
    Closed { endpoint: String },
}

// ─── Standard MCP Error Codes ────────────────────────────────────────────────

/// Well-known JSON-RPC / MCP error codes.
pub mod error_codes {
    /// Invalid JSON was received.
    pub const PARSE_ERROR: i64 = -32700;
    /// The JSON sent is not a valid Request object.
    pub const INVALID_REQUEST: i64 = -32600;
    /// The method does not exist or is not available.
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i64 = -32602;
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i64 = -32603;
    /// Upstream transport failed (hub extension).
    pub const UPSTREAM_UNAVAILABLE: i64 = -32001;
    /// Request received before `initialize` completed.
    pub const NOT_INITIALIZED: i64 = -32002;
    /// Upstream answered with a non-success HTTP status (hub extension).
    pub const HTTP_ERROR: i64 = -32003;
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_rpc_request_omits_missing_params() {
        let req = JsonRpcRequest::new(1, "initialize", None);
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"jsonrpc\":\"2.0\""));
        assert!(json.contains("\"id\":1"));
        assert!(!json.contains("params"));
        assert!(req.to_value().get("params").is_none());
    }

    #[test]
    fn test_classify_response_and_error() {
        let ok = classify(json!({"jsonrpc": "2.0", "id": 7, "result": {"tools": []}}));
        assert_eq!(
            ok,
            Incoming::Response {
                id: json!(7),
                outcome: Ok(json!({"tools": []}))
            }
        );

        let err = classify(json!({
            "jsonrpc": "2.0",
            "id": 2,
            "error": {"code": -32601, "message": "Method not found"}
        }));
        match err {
            Incoming::Response { outcome: Err(e), .. } => {
                assert_eq!(e.code, error_codes::METHOD_NOT_FOUND);
            }
            other => panic!("expected error response, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_request_and_notification() {
        let req = classify(json!({"jsonrpc": "2.0", "id": "a", "method": "ping"}));
        assert!(matches!(req, Incoming::Request { ref method, .. } if method == "ping"));

        let note = classify(json!({
            "jsonrpc": "2.0",
            "method": "notifications/tools/list_changed"
        }));
        assert!(matches!(note, Incoming::Notification(ref n) if n.params.is_none()));
    }

    #[test]
    fn test_classify_rejects_non_jsonrpc() {
        assert!(matches!(classify(json!([1, 2])), Incoming::Invalid(_)));
        assert!(matches!(
            classify(json!({"id": 1, "result": {}})),
            Incoming::Invalid(_)
        ));
        assert!(matches!(
            classify(json!({"jsonrpc": "2.0", "id": 1})),
            Incoming::Invalid(_)
        ));
    }

    #[test]
    fn test_initialize_result_aliases() {
        let value = json!({
            "protocolVersion": "2025-03-26",
            "capabilities": {"tools": {}},
            "serverInfo": {"name": "github", "version": "1.2.0"}
        });
        let init: InitializeResult = serde_json::from_value(value).unwrap();
        let info = UpstreamInfo::from(init);
        assert_eq!(info.protocol_version.as_deref(), Some("2025-03-26"));
        assert_eq!(info.server_info.unwrap().name.as_deref(), Some("github"));
    }

    #[test]
    fn test_protocol_version_table_is_ordered() {
        assert_eq!(PROTOCOL_VERSIONS.first(), Some(&LEGACY_PROTOCOL_VERSION));
        assert_eq!(PROTOCOL_VERSIONS.last(), Some(&LATEST_PROTOCOL_VERSION));
        let mut sorted = PROTOCOL_VERSIONS.to_vec();
        sorted.sort();
        assert_eq!(sorted, PROTOCOL_VERSIONS);
    }
}
