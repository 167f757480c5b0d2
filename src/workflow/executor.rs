//! Step execution seam.
//!
//! The engine hands each attempt to a [`StepExecutor`]. [`RouterExecutor`]
//! sends it through the hub: tool names go through the catalog, explicit
//! methods go straight to the named endpoint.

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::errors::ErrorKind;
use crate::router::Router;

use super::types::{CallSpec, StepFailure};

#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// Perform one attempt. Implementations should stop promptly once
    /// `cancel` fires and report [`ErrorKind::Cancelled`].
    async fn execute(&self, call: &CallSpec, cancel: &CancellationToken) -> Result<Value, StepFailure>;
}

pub struct RouterExecutor {
    router: Router,
}

impl RouterExecutor {
    pub fn new(router: Router) -> Self {
        Self { router }
    }
}

#[async_trait]
impl StepExecutor for RouterExecutor {
    async fn execute(&self, call: &CallSpec, cancel: &CancellationToken) -> Result<Value, StepFailure> {
        let result = match &call.method {
            None => {
                self.router
                    .route_with_cancel(&call.target, call.arguments.clone(), Some(cancel))
                    .await
            }
            Some(method) => {
                self.router
                    .call_endpoint(&call.target, method, Some(call.arguments.clone()), Some(cancel))
                    .await
            }
        };

        let value = result.map_err(|e| StepFailure::new(e.kind(), e.to_string()))?;
        if value.get("isError").and_then(Value::as_bool) == Some(true) {
            return Err(StepFailure::new(ErrorKind::DependencyFailed, tool_error_text(&value)));
        }
        Ok(value)
    }
}

/// First text block of a tool error result.
fn tool_error_text(result: &Value) -> String {
    result
        .get("content")
        .and_then(Value::as_array)
        .and_then(|blocks| {
            blocks
                .iter()
                .find_map(|b| b.get("text").and_then(Value::as_str))
        })
        .unwrap_or("tool reported an error")
        .to_string()
}
