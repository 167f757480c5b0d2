//! Connection manager error types.

use thiserror::Error;

use crate::errors::ErrorKind;

/// Errors that can occur while talking to an upstream endpoint.
#[derive(Debug, Clone, Error)]
pub enum UpstreamError {
    /// The endpoint is not connected, exited, or is permanently closed.
    #[error("endpoint '{endpoint}' unavailable: {reason}")]
    Unavailable { endpoint: String, reason: String },

    /// A call did not receive a response in time.
    #[error("call '{method}' to '{endpoint}' timed out after {timeout_ms}ms")]
    Timeout {
        endpoint: String,
        method: String,
        timeout_ms: u64,
    },

    /// A frame or message from the endpoint could not be parsed.
    #[error("malformed frame from '{endpoint}': {reason}")]
    MalformedFrame { endpoint: String, reason: String },

    /// The endpoint process could not be started.
    #[error("failed to spawn endpoint '{name}': {reason}")]
    SpawnFailed { name: String, reason: String },

    /// The `initialize` exchange failed.
    #[error("endpoint '{name}' initialization failed: {reason}")]
    InitFailed { name: String, reason: String },

    /// The endpoint answered with a JSON-RPC error.
    #[error("server error [{code}]: {message}")]
    ServerError {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// The caller cancelled the call before a response arrived.
    #[error("call '{method}' to '{endpoint}' cancelled")]
    Cancelled { endpoint: String, method: String },

    /// No endpoint with this name is registered.
    #[error("unknown endpoint: '{name}'")]
    UnknownEndpoint { name: String },

    /// Endpoint configuration is invalid.
    #[error("config error: {reason}")]
    ConfigError { reason: String },
}

impl UpstreamError {
    /// Classify this error for recovery decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            UpstreamError::Unavailable { .. }
            | UpstreamError::SpawnFailed { .. }
            | UpstreamError::InitFailed { .. } => ErrorKind::UpstreamUnavailable,
            UpstreamError::Timeout { .. } => ErrorKind::Timeout,
            UpstreamError::MalformedFrame { .. } => ErrorKind::MalformedFrame,
            UpstreamError::ServerError { .. } => ErrorKind::DependencyFailed,
            UpstreamError::Cancelled { .. } => ErrorKind::Cancelled,
            UpstreamError::UnknownEndpoint { .. } => ErrorKind::NotFound,
            UpstreamError::ConfigError { .. } => ErrorKind::Config,
        }
    }

    pub(crate) fn unavailable(endpoint: &str, reason: impl Into<String>) -> Self {
        UpstreamError::Unavailable {
            endpoint: endpoint.to_string(),
            reason: reason.into(),
        }
    }
}
