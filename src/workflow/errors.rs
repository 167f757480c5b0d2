//! Workflow engine error types.

use std::time::Duration;

use thiserror::Error;

use crate::errors::ErrorKind;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum WorkflowError {
    /// A definition or planner hint list failed validation.
    #[error("invalid workflow: {reason}")]
    SchemaViolation { reason: String },

    #[error("run not found: '{run_id}'")]
    UnknownRun { run_id: String },

    #[error("step '{step}' not found in run '{run_id}'")]
    UnknownStep { run_id: String, step: String },

    /// The operation does not apply to the run in its current status.
    #[error("run '{run_id}' {reason}")]
    InvalidRunState { run_id: String, reason: String },

    /// The target's breaker rejected the call without attempting it.
    #[error("circuit open for '{target}', retry after {retry_after:?}")]
    CircuitOpen { target: String, retry_after: Duration },

    /// A guarded call was attempted and failed.
    #[error("call to '{target}' failed ({kind}): {message}")]
    CallFailed {
        target: String,
        kind: ErrorKind,
        message: String,
    },

    /// The store rejected a write; the run is no longer driven.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl WorkflowError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            WorkflowError::SchemaViolation { .. } | WorkflowError::InvalidRunState { .. } => {
                ErrorKind::SchemaViolation
            }
            WorkflowError::UnknownRun { .. } | WorkflowError::UnknownStep { .. } => ErrorKind::NotFound,
            WorkflowError::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            WorkflowError::CallFailed { kind, .. } => *kind,
            WorkflowError::Store(e) => e.kind(),
        }
    }

    pub(crate) fn schema(reason: impl Into<String>) -> Self {
        WorkflowError::SchemaViolation {
            reason: reason.into(),
        }
    }
}
