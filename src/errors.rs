//! Shared error taxonomy.
//!
//! Every module defines its own `thiserror` enum, but all of them collapse
//! onto one [`ErrorKind`] so callers can decide how to recover without
//! matching on module-specific variants.

use serde::{Deserialize, Serialize};

/// Coarse classification of every failure the engine can surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The owning endpoint is not connected (exited, degraded, or closed).
    UpstreamUnavailable,
    /// The front-facing handshake has not completed yet.
    NotReady,
    /// A namespaced name or id is not known.
    NotFound,
    /// A per-call or per-step timeout elapsed.
    Timeout,
    /// The target's breaker is open; no call was attempted.
    CircuitOpen,
    /// A frame or message on an RPC channel could not be parsed.
    MalformedFrame,
    /// Untrusted input (workflow definition, planner hints) failed validation.
    SchemaViolation,
    /// The remote side answered, but with an error.
    DependencyFailed,
    /// The caller or the run cancelled the operation.
    Cancelled,
    /// The state store rejected a write or read.
    StoreUnavailable,
    /// Configuration is missing or invalid.
    Config,
}

impl ErrorKind {
    /// Stable string form, used in persisted step failures.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::UpstreamUnavailable => "upstream_unavailable",
            ErrorKind::NotReady => "not_ready",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Timeout => "timeout",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::MalformedFrame => "malformed_frame",
            ErrorKind::SchemaViolation => "schema_violation",
            ErrorKind::DependencyFailed => "dependency_failed",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::StoreUnavailable => "store_unavailable",
            ErrorKind::Config => "config",
        }
    }

    /// Whether a workflow step failing with this kind may spend retry budget.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            ErrorKind::UpstreamUnavailable
                | ErrorKind::Timeout
                | ErrorKind::DependencyFailed
                | ErrorKind::MalformedFrame
        )
    }

    /// Whether a failure of this kind counts towards a target's breaker.
    pub fn trips_breaker(&self) -> bool {
        matches!(
            self,
            ErrorKind::UpstreamUnavailable
                | ErrorKind::Timeout
                | ErrorKind::DependencyFailed
                | ErrorKind::MalformedFrame
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_caller_errors_are_not_retriable() {
        assert!(!ErrorKind::NotFound.is_retriable());
        assert!(!ErrorKind::NotReady.is_retriable());
        assert!(!ErrorKind::SchemaViolation.is_retriable());
        assert!(!ErrorKind::CircuitOpen.is_retriable());
        assert!(ErrorKind::Timeout.is_retriable());
        assert!(ErrorKind::UpstreamUnavailable.is_retriable());
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::CircuitOpen).unwrap();
        assert_eq!(json, "\"circuit_open\"");
        let back: ErrorKind = serde_json::from_str("\"upstream_unavailable\"").unwrap();
        assert_eq!(back, ErrorKind::UpstreamUnavailable);
    }
}
