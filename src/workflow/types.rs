//! Workflow data model: definitions, step and run states, and the
//! transition events that make up a run's durable log.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::ErrorKind;

/// Run identifier (uuid v4, hyphenated).
pub type RunId = String;

// ─── Definitions ─────────────────────────────────────────────────────────────

/// A named DAG of steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkflowDefinition {
    pub name: String,
    pub steps: Vec<StepDefinition>,
}

/// One node of the DAG.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepDefinition {
    pub id: String,
    pub call: CallSpec,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// A terminal failure of an optional step does not fail the run.
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Safe to re-execute if a crash interrupted it mid-call.
    #[serde(default)]
    pub idempotent: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl StepDefinition {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// What a step calls.
///
/// Without `method`, `target` is a namespaced tool name routed through the
/// catalog. With `method`, `target` names an endpoint and the method is
/// called on it directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CallSpec {
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default = "empty_object")]
    pub arguments: Value,
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

impl CallSpec {
    pub fn tool(target: &str, arguments: Value) -> Self {
        Self {
            target: target.to_string(),
            method: None,
            arguments,
        }
    }
}

/// Attempt budget and delays between attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay after the k-th failure is `backoff_ms[k-1]`; the last entry
    /// repeats.
    #[serde(default)]
    pub backoff_ms: Vec<u64>,
}

fn default_max_attempts() -> u32 {
    1
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: Vec::new(),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff_ms: &[u64]) -> Self {
        Self {
            max_attempts,
            backoff_ms: backoff_ms.to_vec(),
        }
    }

    /// Delay before the attempt that follows failure number `failures`.
    pub fn backoff_after(&self, failures: u32) -> Duration {
        let Some(last) = self.backoff_ms.len().checked_sub(1) else {
            return Duration::ZERO;
        };
        let idx = (failures.saturating_sub(1) as usize).min(last);
        Duration::from_millis(self.backoff_ms[idx])
    }
}

// ─── States ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Ready,
    Running,
    Succeeded,
    /// Failed with retry budget left; will become Ready again.
    Failed,
    FailedTerminal,
    Skipped,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::FailedTerminal | TaskState::Skipped
        )
    }

    /// Whether `self → next` is a legal step transition.
    pub fn can_transition_to(&self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Pending, Ready)
                | (Pending, Skipped)
                | (Ready, Running)
                | (Ready, Skipped)
                | (Ready, Failed)
                | (Ready, FailedTerminal)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, FailedTerminal)
                | (Running, Ready)
                | (Failed, Ready)
                | (Failed, FailedTerminal)
                | (Failed, Skipped)
        )
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskState::Pending => "pending",
            TaskState::Ready => "ready",
            TaskState::Running => "running",
            TaskState::Succeeded => "succeeded",
            TaskState::Failed => "failed",
            TaskState::FailedTerminal => "failed_terminal",
            TaskState::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
    Cancelled,
    TimedOut,
    /// A non-idempotent step was mid-call at a crash; an operator decides.
    AwaitingOperator,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Cancelled | RunStatus::TimedOut
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
            RunStatus::TimedOut => "timed_out",
            RunStatus::AwaitingOperator => "awaiting_operator",
        }
    }

    pub fn parse(s: &str) -> Option<RunStatus> {
        [
            RunStatus::Running,
            RunStatus::Succeeded,
            RunStatus::Failed,
            RunStatus::Cancelled,
            RunStatus::TimedOut,
            RunStatus::AwaitingOperator,
        ]
        .into_iter()
        .find(|status| status.as_str() == s)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an attempt failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepFailure {
    pub kind: ErrorKind,
    pub message: String,
}

impl StepFailure {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

// ─── Log Events ──────────────────────────────────────────────────────────────

/// One durable entry in a run's transition log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    RunCreated {
        definition: WorkflowDefinition,
        fingerprint: String,
    },
    StepTransition {
        step: String,
        from: TaskState,
        to: TaskState,
        /// Attempts started so far, including the current one.
        attempt: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<StepFailure>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<Value>,
    },
    RunStatusChanged {
        status: RunStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

/// A log entry as stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub seq: u64,
    pub run_id: RunId,
    pub at: DateTime<Utc>,
    pub event: RunEvent,
}

// ─── Snapshots ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepSnapshot {
    pub id: String,
    pub state: TaskState,
    pub attempts: u32,
    pub optional: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub last_error: Option<StepFailure>,
    pub output: Option<Value>,
}

/// Point-in-time view of a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSnapshot {
    pub run_id: RunId,
    pub name: String,
    pub status: RunStatus,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub steps: Vec<StepSnapshot>,
}

impl RunSnapshot {
    pub fn step(&self, id: &str) -> Option<&StepSnapshot> {
        self.steps.iter().find(|s| s.id == id)
    }
}

/// Listing row for a stored run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub name: String,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Operator verdict for a step left Running by a crash.
#[derive(Debug, Clone, PartialEq)]
pub enum OperatorResolution {
    Succeeded { output: Option<Value> },
    FailedTerminal { reason: String },
    /// Execute the step again.
    Retry,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_backoff_last_entry_repeats() {
        let policy = RetryPolicy::new(5, &[1000, 2000, 4000]);
        assert_eq!(policy.backoff_after(1), Duration::from_secs(1));
        assert_eq!(policy.backoff_after(2), Duration::from_secs(2));
        assert_eq!(policy.backoff_after(3), Duration::from_secs(4));
        assert_eq!(policy.backoff_after(9), Duration::from_secs(4));
        assert_eq!(RetryPolicy::default().backoff_after(1), Duration::ZERO);
    }

    #[test]
    fn test_step_defaults() {
        let step: StepDefinition = serde_json::from_value(json!({
            "id": "a",
            "call": {"target": "github_create_issue"}
        }))
        .unwrap();
        assert_eq!(step.retry.max_attempts, 1);
        assert!(!step.optional && !step.idempotent);
        assert_eq!(step.call.arguments, json!({}));
        assert!(step.timeout().is_none());
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let err = serde_json::from_value::<StepDefinition>(json!({
            "id": "a",
            "call": {"target": "x"},
            "retries": 3
        }));
        assert!(err.is_err());
    }

    #[test]
    fn test_event_wire_shape() {
        let event = RunEvent::StepTransition {
            step: "a".into(),
            from: TaskState::Running,
            to: TaskState::Failed,
            attempt: 1,
            error: Some(StepFailure::new(ErrorKind::Timeout, "slow")),
            output: None,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "step_transition");
        assert_eq!(value["to"], "failed");
        assert_eq!(value["error"]["kind"], "timeout");
        assert!(value.get("output").is_none());
    }

    #[test]
    fn test_transition_table() {
        assert!(TaskState::Pending.can_transition_to(TaskState::Skipped));
        assert!(TaskState::Failed.can_transition_to(TaskState::Ready));
        assert!(!TaskState::Running.can_transition_to(TaskState::Skipped));
        assert!(!TaskState::Succeeded.can_transition_to(TaskState::Ready));
    }

    #[test]
    fn test_run_status_round_trip_str() {
        assert_eq!(RunStatus::parse("timed_out"), Some(RunStatus::TimedOut));
        assert_eq!(RunStatus::parse("bogus"), None);
        assert!(RunStatus::Cancelled.is_terminal());
        assert!(!RunStatus::AwaitingOperator.is_terminal());
    }
}
