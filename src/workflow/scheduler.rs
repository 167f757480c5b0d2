//! In-memory run arena derived from the transition log.
//!
//! Steps live in a `Vec` in declaration order with an id → index map. The
//! arena only changes through [`RunIndex::apply`], which the engine calls
//! with events the store has already accepted, so replaying a log
//! reproduces the exact state the engine last acted on.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::errors::ErrorKind;

use super::errors::WorkflowError;
use super::types::{
    RunEvent, RunId, RunSnapshot, RunStatus, StepDefinition, StepFailure, StepSnapshot,
    StoredEvent, TaskState, WorkflowDefinition,
};

#[derive(Debug, Clone)]
pub struct StepRecord {
    pub definition: StepDefinition,
    pub state: TaskState,
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub last_error: Option<StepFailure>,
    pub output: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct RunIndex {
    run_id: RunId,
    definition: WorkflowDefinition,
    fingerprint: String,
    status: RunStatus,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
    steps: Vec<StepRecord>,
    by_id: HashMap<String, usize>,
    deps: Vec<Vec<usize>>,
}

impl RunIndex {
    /// Build the arena for a validated definition, every step Pending.
    pub fn new(run_id: &str, definition: WorkflowDefinition, fingerprint: String) -> Self {
        let by_id: HashMap<String, usize> = definition
            .steps
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id.clone(), i))
            .collect();
        let deps = definition
            .steps
            .iter()
            .map(|s| {
                s.depends_on
                    .iter()
                    .filter_map(|d| by_id.get(d).copied())
                    .collect()
            })
            .collect();
        let steps = definition
            .steps
            .iter()
            .map(|s| StepRecord {
                definition: s.clone(),
                state: TaskState::Pending,
                attempts: 0,
                started_at: None,
                updated_at: None,
                last_error: None,
                output: None,
            })
            .collect();

        Self {
            run_id: run_id.to_string(),
            definition,
            fingerprint,
            status: RunStatus::Running,
            created_at: None,
            updated_at: None,
            steps,
            by_id,
            deps,
        }
    }

    /// Rebuild a run from its stored log. The first entry must create it.
    pub fn replay(run_id: &str, log: &[StoredEvent]) -> Result<Self, WorkflowError> {
        let Some((first, rest)) = log.split_first() else {
            return Err(WorkflowError::UnknownRun {
                run_id: run_id.to_string(),
            });
        };
        let RunEvent::RunCreated {
            definition,
            fingerprint,
        } = &first.event
        else {
            return Err(corrupt(run_id, "log does not start with run_created"));
        };

        let mut index = RunIndex::new(run_id, definition.clone(), fingerprint.clone());
        index.created_at = Some(first.at);
        index.updated_at = Some(first.at);
        for stored in rest {
            index.apply(stored)?;
        }
        Ok(index)
    }

    /// Fold one accepted event into the arena.
    pub fn apply(&mut self, stored: &StoredEvent) -> Result<(), WorkflowError> {
        match &stored.event {
            RunEvent::RunCreated { .. } => {
                if self.created_at.is_some() {
                    return Err(corrupt(&self.run_id, "run created twice"));
                }
                self.created_at = Some(stored.at);
            }
            RunEvent::StepTransition {
                step,
                from,
                to,
                attempt,
                error,
                output,
            } => {
                let idx = self.index_of(step).ok_or_else(|| WorkflowError::UnknownStep {
                    run_id: self.run_id.clone(),
                    step: step.clone(),
                })?;
                let record = &mut self.steps[idx];
                if record.state != *from || !from.can_transition_to(*to) {
                    return Err(corrupt(
                        &self.run_id,
                        &format!(
                            "step '{step}' cannot go {from} -> {to} from {}",
                            record.state
                        ),
                    ));
                }
                record.state = *to;
                record.attempts = *attempt;
                if *to == TaskState::Running && record.started_at.is_none() {
                    record.started_at = Some(stored.at);
                }
                record.updated_at = Some(stored.at);
                if error.is_some() {
                    record.last_error = error.clone();
                }
                if output.is_some() {
                    record.output = output.clone();
                }
            }
            RunEvent::RunStatusChanged { status, .. } => {
                self.status = *status;
            }
        }
        self.updated_at = Some(stored.at);
        Ok(())
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn definition(&self) -> &WorkflowDefinition {
        &self.definition
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    /// Time of the `RunCreated` event.
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    pub fn index_of(&self, step: &str) -> Option<usize> {
        self.by_id.get(step).copied()
    }

    pub fn step(&self, idx: usize) -> &StepRecord {
        &self.steps[idx]
    }

    pub fn steps(&self) -> &[StepRecord] {
        &self.steps
    }

    /// Indices of steps in `state`, in declaration order.
    pub fn in_state(&self, state: TaskState) -> Vec<usize> {
        (0..self.steps.len())
            .filter(|&i| self.steps[i].state == state)
            .collect()
    }

    pub fn ready_steps(&self) -> Vec<usize> {
        self.in_state(TaskState::Ready)
    }

    /// Readiness and skip transitions implied by the current state.
    ///
    /// A Pending step becomes Ready once every dependency Succeeded, and is
    /// Skipped as soon as any dependency is Skipped or FailedTerminal
    /// (optional or not). Skips cascade one level per call; callers apply
    /// the result and ask again until nothing is left.
    pub fn pending_transitions(&self) -> Vec<RunEvent> {
        let mut events = Vec::new();
        for (i, record) in self.steps.iter().enumerate() {
            if record.state != TaskState::Pending {
                continue;
            }
            let blocked_by = self.deps[i].iter().find(|&&d| {
                matches!(
                    self.steps[d].state,
                    TaskState::Skipped | TaskState::FailedTerminal
                )
            });
            if let Some(&d) = blocked_by {
                let dep = &self.steps[d];
                events.push(RunEvent::StepTransition {
                    step: record.definition.id.clone(),
                    from: TaskState::Pending,
                    to: TaskState::Skipped,
                    attempt: record.attempts,
                    error: Some(StepFailure::new(
                        ErrorKind::DependencyFailed,
                        format!("dependency '{}' {}", dep.definition.id, dep.state),
                    )),
                    output: None,
                });
            } else if self.deps[i]
                .iter()
                .all(|&d| self.steps[d].state == TaskState::Succeeded)
            {
                events.push(RunEvent::StepTransition {
                    step: record.definition.id.clone(),
                    from: TaskState::Pending,
                    to: TaskState::Ready,
                    attempt: record.attempts,
                    error: None,
                    output: None,
                });
            }
        }
        events
    }

    /// The run's final status once every step is terminal.
    ///
    /// Any required FailedTerminal step fails the run. Skipped steps and
    /// optional failures do not.
    pub fn outcome(&self) -> Option<RunStatus> {
        if !self.steps.iter().all(|s| s.state.is_terminal()) {
            return None;
        }
        let required_failed = self
            .steps
            .iter()
            .any(|s| s.state == TaskState::FailedTerminal && !s.definition.optional);
        Some(if required_failed {
            RunStatus::Failed
        } else {
            RunStatus::Succeeded
        })
    }

    pub fn snapshot(&self) -> RunSnapshot {
        RunSnapshot {
            run_id: self.run_id.clone(),
            name: self.definition.name.clone(),
            status: self.status,
            created_at: self.created_at,
            updated_at: self.updated_at,
            steps: self
                .steps
                .iter()
                .map(|s| StepSnapshot {
                    id: s.definition.id.clone(),
                    state: s.state,
                    attempts: s.attempts,
                    optional: s.definition.optional,
                    started_at: s.started_at,
                    updated_at: s.updated_at,
                    last_error: s.last_error.clone(),
                    output: s.output.clone(),
                })
                .collect(),
        }
    }
}

fn corrupt(run_id: &str, reason: &str) -> WorkflowError {
    WorkflowError::InvalidRunState {
        run_id: run_id.to_string(),
        reason: format!("has an inconsistent log: {reason}"),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
