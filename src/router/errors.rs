//! Request router error types.

use serde_json::json;
use thiserror::Error;

use crate::errors::ErrorKind;
use crate::upstream::types::{error_codes, JsonRpcError};
use crate::upstream::UpstreamError;

#[derive(Debug, Clone, Error)]
pub enum RouterError {
    /// A routed call arrived before the handshake completed.
    #[error("hub is not initialized")]
    NotReady,

    /// No catalog entry (or endpoint) carries this name.
    #[error("{what} not found: '{name}'")]
    NotFound { what: &'static str, name: String },

    /// The owning endpoint failed the call.
    #[error("endpoint '{endpoint}' failed: {source}")]
    Upstream {
        endpoint: String,
        #[source]
        source: UpstreamError,
    },

    /// Front-end request parameters are missing or mistyped.
    #[error("invalid params: {reason}")]
    InvalidParams { reason: String },

    #[error("Method not found: {method}")]
    MethodNotFound { method: String },
}

impl RouterError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RouterError::NotReady => ErrorKind::NotReady,
            RouterError::NotFound { .. } | RouterError::MethodNotFound { .. } => ErrorKind::NotFound,
            RouterError::Upstream { source, .. } => source.kind(),
            RouterError::InvalidParams { .. } => ErrorKind::SchemaViolation,
        }
    }

    /// JSON-RPC error object for front-end replies.
    pub fn to_jsonrpc(&self) -> JsonRpcError {
        match self {
            RouterError::NotReady => JsonRpcError::new(error_codes::NOT_INITIALIZED, self.to_string()),
            RouterError::NotFound { .. } | RouterError::InvalidParams { .. } => {
                JsonRpcError::new(error_codes::INVALID_PARAMS, self.to_string())
            }
            RouterError::MethodNotFound { .. } => {
                JsonRpcError::new(error_codes::METHOD_NOT_FOUND, self.to_string())
            }
            RouterError::Upstream {
                source: UpstreamError::ServerError { code, message, data },
                ..
            } => JsonRpcError {
                code: *code,
                message: message.clone(),
                data: data.clone(),
            },
            RouterError::Upstream { endpoint, source } => JsonRpcError {
                code: error_codes::INTERNAL_ERROR,
                message: self.to_string(),
                data: Some(json!({"endpoint": endpoint, "kind": source.kind()})),
            },
        }
    }

    pub(crate) fn upstream(endpoint: &str, source: UpstreamError) -> Self {
        match source {
            UpstreamError::UnknownEndpoint { name } => RouterError::NotFound {
                what: "endpoint",
                name,
            },
            source => RouterError::Upstream {
                endpoint: endpoint.to_string(),
                source,
            },
        }
    }
}
