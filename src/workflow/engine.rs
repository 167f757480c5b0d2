//! Workflow engine.
//!
//! Drives runs over a [`RunIndex`] arena. Every transition is appended to
//! the state store first and folded into the arena only once the store
//! accepted it; a store failure stops the run where it stands.
//!
//! One task drives a run. Step attempts run on a `JoinSet` up to the
//! concurrency ceiling, each with a child of the run's cancellation token.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::errors::ErrorKind;
use crate::store::StateStore;

use super::breaker::{Admission, BreakerConfig, BreakerRegistry};
use super::definition::{fingerprint, validate};
use super::errors::WorkflowError;
use super::executor::StepExecutor;
use super::scheduler::RunIndex;
use super::types::{
    CallSpec, OperatorResolution, RunEvent, RunId, RunSnapshot, RunStatus, RunSummary,
    StepFailure, TaskState, WorkflowDefinition,
};

// ─── Config ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Step attempts in flight per run.
    pub concurrency: usize,
    pub breaker: BreakerConfig,
    /// Wall-clock budget per `execute` call.
    pub deadline: Option<Duration>,
    /// Fail an attempt with `CircuitOpen` instead of waiting out the cooldown.
    pub fail_fast_on_open_circuit: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            breaker: BreakerConfig::default(),
            deadline: None,
            fail_fast_on_open_circuit: false,
        }
    }
}

// ─── Engine ──────────────────────────────────────────────────────────────────

struct RunHandle {
    run_id: RunId,
    index: StdMutex<RunIndex>,
    cancel: CancellationToken,
    driving: AtomicBool,
}

impl RunHandle {
    fn new(index: RunIndex) -> Arc<Self> {
        Arc::new(Self {
            run_id: index.run_id().to_string(),
            index: StdMutex::new(index),
            cancel: CancellationToken::new(),
            driving: AtomicBool::new(false),
        })
    }

    fn index(&self) -> std::sync::MutexGuard<'_, RunIndex> {
        self.index.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Resets the driving flag when `execute` returns or is dropped.
struct DrivingGuard<'a>(&'a AtomicBool);

impl Drop for DrivingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Clone)]
pub struct WorkflowEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    config: EngineConfig,
    store: Arc<dyn StateStore>,
    executor: Arc<dyn StepExecutor>,
    breakers: BreakerRegistry,
    runs: StdMutex<HashMap<RunId, Arc<RunHandle>>>,
}

/// What a finished attempt reports back to the drive loop.
struct AttemptDone {
    idx: usize,
    target: String,
    probe: bool,
    result: Result<Value, StepFailure>,
}

/// Per-drive bookkeeping that does not survive a restart.
struct DriveState {
    tasks: JoinSet<AttemptDone>,
    /// Failed steps waiting out their backoff.
    retry_at: HashMap<usize, Instant>,
    /// Earliest moment a breaker-blocked Ready step may be admitted.
    circuit_wake: Option<Instant>,
}

enum Stop {
    Cancelled,
    Deadline,
}

impl WorkflowEngine {
    pub fn new(config: EngineConfig, store: Arc<dyn StateStore>, executor: Arc<dyn StepExecutor>) -> Self {
        let breakers = BreakerRegistry::new(config.breaker, store.clone());
        Self {
            inner: Arc::new(EngineInner {
                config,
                store,
                executor,
                breakers,
                runs: StdMutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn breakers(&self) -> &BreakerRegistry {
        &self.inner.breakers
    }

    // ─── Run API ─────────────────────────────────────────────────────────

    /// Validate a definition and persist a new run for it.
    pub fn start_run(&self, definition: WorkflowDefinition) -> Result<RunId, WorkflowError> {
        validate(&definition)?;
        let run_id = uuid::Uuid::new_v4().to_string();
        let fingerprint = fingerprint(&definition);

        let stored = self.inner.store.append(
            &run_id,
            &RunEvent::RunCreated {
                definition: definition.clone(),
                fingerprint: fingerprint.clone(),
            },
        )?;
        let mut index = RunIndex::new(&run_id, definition, fingerprint);
        index.apply(&stored)?;

        tracing::info!(run_id = %run_id, workflow = %index.definition().name, steps = index.steps().len(), "run created");
        self.runs().insert(run_id.clone(), RunHandle::new(index));
        Ok(run_id)
    }

    /// Start a run and drive it to completion.
    pub async fn run(&self, definition: WorkflowDefinition) -> Result<RunSnapshot, WorkflowError> {
        let run_id = self.start_run(definition)?;
        self.execute(&run_id).await
    }

    /// Drive a run until it settles, is cancelled, or hits the deadline.
    ///
    /// Runs that are already terminal or awaiting an operator are returned
    /// as they stand.
    pub async fn execute(&self, run_id: &str) -> Result<RunSnapshot, WorkflowError> {
        let handle = self.handle(run_id)?;
        if handle.driving.swap(true, Ordering::SeqCst) {
            return Err(WorkflowError::InvalidRunState {
                run_id: run_id.to_string(),
                reason: "is already executing".into(),
            });
        }
        let _guard = DrivingGuard(&handle.driving);

        let status = handle.index().status();
        if status != RunStatus::Running {
            return Ok(handle.index().snapshot());
        }

        tracing::info!(run_id, "executing run");
        let snapshot = self.drive(&handle).await?;
        tracing::info!(run_id, status = %snapshot.status, "run finished");
        Ok(snapshot)
    }

    /// Cancel a run. A run being executed winds down in its drive loop;
    /// an idle one is settled here.
    pub async fn cancel(&self, run_id: &str) -> Result<(), WorkflowError> {
        let handle = self.handle(run_id)?;
        handle.cancel.cancel();
        tracing::info!(run_id, "run cancellation requested");

        if handle.driving.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _guard = DrivingGuard(&handle.driving);
        if handle.index().status().is_terminal() {
            return Ok(());
        }
        let mut drive = DriveState {
            tasks: JoinSet::new(),
            retry_at: HashMap::new(),
            circuit_wake: None,
        };
        self.wind_down(&handle, &mut drive, Stop::Cancelled).await?;
        Ok(())
    }

    pub fn snapshot(&self, run_id: &str) -> Result<RunSnapshot, WorkflowError> {
        if let Some(handle) = self.runs().get(run_id).cloned() {
            return Ok(handle.index().snapshot());
        }
        let log = self.inner.store.load(run_id)?;
        Ok(RunIndex::replay(run_id, &log)?.snapshot())
    }

    pub fn list_runs(&self) -> Result<Vec<RunSummary>, WorkflowError> {
        Ok(self.inner.store.list_runs()?)
    }

    /// Drop a terminal run from memory and from the store.
    pub fn purge(&self, run_id: &str) -> Result<(), WorkflowError> {
        let snapshot = self.snapshot(run_id)?;
        if !snapshot.status.is_terminal() {
            return Err(WorkflowError::InvalidRunState {
                run_id: run_id.to_string(),
                reason: format!("is {} and cannot be purged", snapshot.status),
            });
        }
        self.inner.store.purge(run_id)?;
        self.runs().remove(run_id);
        tracing::info!(run_id, "run purged");
        Ok(())
    }

    /// Reload every non-terminal run after a restart.
    ///
    /// Breaker states are restored first. Steps left Running are reset to
    /// Ready when idempotent; otherwise the run waits for
    /// [`resolve_step`](Self::resolve_step). Returns the recovered run ids;
    /// pass them to [`execute`](Self::execute) to resume.
    pub fn recover(&self) -> Result<Vec<RunId>, WorkflowError> {
        self.inner.breakers.restore()?;

        let mut recovered = Vec::new();
        for summary in self.inner.store.list_runs()? {
            if summary.status.is_terminal() || self.runs().contains_key(&summary.run_id) {
                continue;
            }
            let handle = self.load(&summary.run_id)?;
            tracing::info!(
                run_id = %summary.run_id,
                status = %handle.index().status(),
                "run recovered"
            );
            recovered.push(summary.run_id);
        }
        Ok(recovered)
    }

    /// Record an operator's verdict for a step that was in flight at a
    /// crash. The run returns to Running once no such step is left.
    pub fn resolve_step(
        &self,
        run_id: &str,
        step: &str,
        resolution: OperatorResolution,
    ) -> Result<RunSnapshot, WorkflowError> {
        let handle = self.handle(run_id)?;
        let (idx, attempts) = {
            let index = handle.index();
            if index.status() != RunStatus::AwaitingOperator {
                return Err(WorkflowError::InvalidRunState {
                    run_id: run_id.to_string(),
                    reason: format!("is {}, not awaiting an operator", index.status()),
                });
            }
            let idx = index.index_of(step).ok_or_else(|| WorkflowError::UnknownStep {
                run_id: run_id.to_string(),
                step: step.to_string(),
            })?;
            if index.step(idx).state != TaskState::Running {
                return Err(WorkflowError::InvalidRunState {
                    run_id: run_id.to_string(),
                    reason: format!("step '{step}' is {}, not in flight", index.step(idx).state),
                });
            }
            (idx, index.step(idx).attempts)
        };

        let (to, error, output) = match resolution {
            OperatorResolution::Succeeded { output } => (TaskState::Succeeded, None, output),
            OperatorResolution::FailedTerminal { reason } => (
                TaskState::FailedTerminal,
                Some(StepFailure::new(ErrorKind::DependencyFailed, reason)),
                None,
            ),
            OperatorResolution::Retry => (TaskState::Ready, None, None),
        };
        self.transition(&handle, idx, to, attempts, error, output)?;
        tracing::info!(run_id, step, to = %to, "step resolved by operator");

        if handle.index().in_state(TaskState::Running).is_empty() {
            self.commit(
                &handle,
                RunEvent::RunStatusChanged {
                    status: RunStatus::Running,
                    reason: Some("resolved by operator".into()),
                },
            )?;
        }
        let snapshot = handle.index().snapshot();
        Ok(snapshot)
    }

    /// One breaker-guarded call outside any run.
    pub async fn guarded_call(&self, call: &CallSpec) -> Result<Value, WorkflowError> {
        let breakers = &self.inner.breakers;
        let admission = breakers.admit(&call.target)?;
        if let Admission::Rejected { retry_after } = admission {
            return Err(WorkflowError::CircuitOpen {
                target: call.target.clone(),
                retry_after,
            });
        }

        let result = self
            .inner
            .executor
            .execute(call, &CancellationToken::new())
            .await;
        match result {
            Ok(value) => {
                breakers.record_success(&call.target, admission == Admission::Probe)?;
                Ok(value)
            }
            Err(failure) => {
                self.record_breaker_failure(&call.target, admission == Admission::Probe, &failure)?;
                Err(WorkflowError::CallFailed {
                    target: call.target.clone(),
                    kind: failure.kind,
                    message: failure.message,
                })
            }
        }
    }

    // ─── Drive Loop ──────────────────────────────────────────────────────

    async fn drive(&self, handle: &Arc<RunHandle>) -> Result<RunSnapshot, WorkflowError> {
        let config = &self.inner.config;
        let deadline = config.deadline.map(|budget| {
            let created_at = handle.index().created_at();
            let used = created_at
                .and_then(|at| (chrono::Utc::now() - at).to_std().ok())
                .unwrap_or_default();
            Instant::now() + budget.saturating_sub(used)
        });
        let stop = handle.cancel.child_token();

        let mut drive = DriveState {
            tasks: JoinSet::new(),
            retry_at: HashMap::new(),
            circuit_wake: None,
        };
        // Backoff timers are not persisted; failed steps found here retry now.
        let now = Instant::now();
        let failed = handle.index().in_state(TaskState::Failed);
        for idx in failed {
            drive.retry_at.insert(idx, now);
        }

        loop {
            if handle.cancel.is_cancelled() {
                return self.wind_down(handle, &mut drive, Stop::Cancelled).await;
            }
            if deadline.is_some_and(|at| Instant::now() >= at) {
                stop.cancel();
                return self.wind_down(handle, &mut drive, Stop::Deadline).await;
            }

            self.settle(handle)?;
            self.release_due_retries(handle, &mut drive)?;

            if drive.tasks.is_empty() && drive.retry_at.is_empty() {
                let outcome = handle.index().outcome();
                if let Some(status) = outcome {
                    self.commit(
                        handle,
                        RunEvent::RunStatusChanged {
                            status,
                            reason: None,
                        },
                    )?;
                    return Ok(handle.index().snapshot());
                }
            }

            if self.dispatch(handle, &mut drive, &stop)? {
                // Fail-fast rejections changed step states; settle again.
                continue;
            }

            let wake = drive
                .retry_at
                .values()
                .copied()
                .chain(drive.circuit_wake)
                .min();
            if drive.tasks.is_empty() && wake.is_none() {
                return Err(WorkflowError::InvalidRunState {
                    run_id: handle.run_id.clone(),
                    reason: "stalled with no runnable step".into(),
                });
            }

            tokio::select! {
                biased;
                _ = handle.cancel.cancelled() => {
                    return self.wind_down(handle, &mut drive, Stop::Cancelled).await;
                }
                _ = sleep_until_opt(deadline) => {
                    stop.cancel();
                    return self.wind_down(handle, &mut drive, Stop::Deadline).await;
                }
                Some(joined) = drive.tasks.join_next(), if !drive.tasks.is_empty() => {
                    match joined {
                        Ok(done) => self.finish_attempt(handle, &mut drive, done)?,
                        Err(e) => tracing::error!(run_id = %handle.run_id, error = %e, "step task panicked"),
                    }
                }
                _ = sleep_until_opt(wake) => {}
            }
        }
    }

    /// Apply readiness and skip transitions until none are left.
    fn settle(&self, handle: &RunHandle) -> Result<(), WorkflowError> {
        loop {
            let events = handle.index().pending_transitions();
            if events.is_empty() {
                return Ok(());
            }
            for event in events {
                self.commit(handle, event)?;
            }
        }
    }

    fn release_due_retries(&self, handle: &RunHandle, drive: &mut DriveState) -> Result<(), WorkflowError> {
        let now = Instant::now();
        let mut due: Vec<usize> = drive
            .retry_at
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(idx, _)| *idx)
            .collect();
        due.sort_unstable();
        for idx in due {
            let attempts = handle.index().step(idx).attempts;
            self.transition(handle, idx, TaskState::Ready, attempts, None, None)?;
            drive.retry_at.remove(&idx);
        }
        Ok(())
    }

    /// Start Ready steps in declaration order up to the ceiling. Returns
    /// whether a fail-fast rejection changed any step state.
    fn dispatch(
        &self,
        handle: &RunHandle,
        drive: &mut DriveState,
        stop: &CancellationToken,
    ) -> Result<bool, WorkflowError> {
        let config = &self.inner.config;
        let mut changed = false;
        drive.circuit_wake = None;

        let ready = handle.index().ready_steps();
        for idx in ready {
            if drive.tasks.len() >= config.concurrency.max(1) {
                break;
            }
            let step = handle.index().step(idx).clone();
            let target = step.definition.call.target.clone();
            let attempt = step.attempts + 1;

            match self.inner.breakers.admit(&target)? {
                Admission::Rejected { retry_after } if config.fail_fast_on_open_circuit => {
                    let failure = StepFailure::new(
                        ErrorKind::CircuitOpen,
                        format!("circuit open for '{target}'"),
                    );
                    self.fail_attempt(handle, drive, idx, attempt, failure, retry_after)?;
                    changed = true;
                }
                Admission::Rejected { retry_after } => {
                    let at = Instant::now() + retry_after;
                    drive.circuit_wake = Some(drive.circuit_wake.map_or(at, |w| w.min(at)));
                    tracing::debug!(run_id = %handle.run_id, step = %step.definition.id, target = %target, "waiting for breaker cooldown");
                }
                admission => {
                    self.transition(handle, idx, TaskState::Running, attempt, None, None)?;
                    tracing::debug!(run_id = %handle.run_id, step = %step.definition.id, attempt, "step started");

                    let executor = self.inner.executor.clone();
                    let call = step.definition.call.clone();
                    let timeout = step.definition.timeout();
                    let token = stop.child_token();
                    let probe = admission == Admission::Probe;
                    drive.tasks.spawn(async move {
                        let result = run_attempt(executor, call, timeout, token).await;
                        AttemptDone {
                            idx,
                            target,
                            probe,
                            result,
                        }
                    });
                }
            }
        }
        Ok(changed)
    }

    fn finish_attempt(
        &self,
        handle: &RunHandle,
        drive: &mut DriveState,
        done: AttemptDone,
    ) -> Result<(), WorkflowError> {
        let (step_id, attempt) = {
            let index = handle.index();
            let step = index.step(done.idx);
            (step.definition.id.clone(), step.attempts)
        };

        match done.result {
            Ok(output) => {
                self.inner.breakers.record_success(&done.target, done.probe)?;
                self.transition(handle, done.idx, TaskState::Succeeded, attempt, None, Some(output))?;
                tracing::info!(run_id = %handle.run_id, step = %step_id, attempt, "step succeeded");
            }
            Err(failure) => {
                self.record_breaker_failure(&done.target, done.probe, &failure)?;
                tracing::warn!(
                    run_id = %handle.run_id,
                    step = %step_id,
                    attempt,
                    kind = %failure.kind,
                    error = %failure.message,
                    "step attempt failed"
                );
                self.fail_attempt(handle, drive, done.idx, attempt, failure, Duration::ZERO)?;
            }
        }
        Ok(())
    }

    /// Record a failed attempt: Failed with a retry timer while budget and
    /// kind allow, FailedTerminal otherwise.
    fn fail_attempt(
        &self,
        handle: &RunHandle,
        drive: &mut DriveState,
        idx: usize,
        attempt: u32,
        failure: StepFailure,
        min_delay: Duration,
    ) -> Result<(), WorkflowError> {
        let (max_attempts, backoff) = {
            let index = handle.index();
            let retry = &index.step(idx).definition.retry;
            (retry.max_attempts, retry.backoff_after(attempt))
        };
        let retriable = failure.kind.is_retriable() || failure.kind == ErrorKind::CircuitOpen;

        if retriable && attempt < max_attempts {
            self.transition(handle, idx, TaskState::Failed, attempt, Some(failure), None)?;
            drive
                .retry_at
                .insert(idx, Instant::now() + backoff.max(min_delay));
        } else {
            self.transition(handle, idx, TaskState::FailedTerminal, attempt, Some(failure), None)?;
        }
        Ok(())
    }

    fn record_breaker_failure(
        &self,
        target: &str,
        probe: bool,
        failure: &StepFailure,
    ) -> Result<(), WorkflowError> {
        let breakers = &self.inner.breakers;
        if failure.kind.trips_breaker() {
            breakers.record_failure(target, probe)?;
        } else if probe {
            breakers.release_probe(target);
        }
        Ok(())
    }

    /// Settle a run that was cancelled or ran out of time: collect in-flight
    /// attempts, skip everything not started, and record the status.
    async fn wind_down(
        &self,
        handle: &RunHandle,
        drive: &mut DriveState,
        stop: Stop,
    ) -> Result<RunSnapshot, WorkflowError> {
        let (status, reason, kind) = match stop {
            Stop::Cancelled => (RunStatus::Cancelled, "cancelled", ErrorKind::Cancelled),
            Stop::Deadline => (RunStatus::TimedOut, "run deadline exceeded", ErrorKind::Timeout),
        };
        tracing::warn!(run_id = %handle.run_id, in_flight = drive.tasks.len(), reason, "run stopping");

        while let Some(joined) = drive.tasks.join_next().await {
            let Ok(done) = joined else { continue };
            let attempt = handle.index().step(done.idx).attempts;
            match done.result {
                Ok(output) => {
                    self.inner.breakers.record_success(&done.target, done.probe)?;
                    self.transition(handle, done.idx, TaskState::Succeeded, attempt, None, Some(output))?;
                }
                Err(failure) => {
                    self.record_breaker_failure(&done.target, done.probe, &failure)?;
                    let failure = if failure.kind == ErrorKind::Cancelled {
                        StepFailure::new(kind, reason)
                    } else {
                        failure
                    };
                    self.transition(handle, done.idx, TaskState::FailedTerminal, attempt, Some(failure), None)?;
                }
            }
        }
        drive.retry_at.clear();

        let (unstarted, in_flight) = {
            let index = handle.index();
            let unstarted: Vec<usize> = (0..index.steps().len())
                .filter(|&i| {
                    matches!(
                        index.step(i).state,
                        TaskState::Pending | TaskState::Ready | TaskState::Failed
                    )
                })
                .collect();
            (unstarted, index.in_state(TaskState::Running))
        };
        for idx in unstarted {
            let attempts = handle.index().step(idx).attempts;
            self.transition(
                handle,
                idx,
                TaskState::Skipped,
                attempts,
                Some(StepFailure::new(kind, reason)),
                None,
            )?;
        }
        // Left Running by a crash and never resolved.
        for idx in in_flight {
            let attempts = handle.index().step(idx).attempts;
            self.transition(
                handle,
                idx,
                TaskState::FailedTerminal,
                attempts,
                Some(StepFailure::new(kind, reason)),
                None,
            )?;
        }

        self.commit(
            handle,
            RunEvent::RunStatusChanged {
                status,
                reason: Some(reason.to_string()),
            },
        )?;
        Ok(handle.index().snapshot())
    }

    // ─── Persistence ─────────────────────────────────────────────────────

    /// Persist an event, then fold it into the arena.
    fn commit(&self, handle: &RunHandle, event: RunEvent) -> Result<(), WorkflowError> {
        let stored = self.inner.store.append(&handle.run_id, &event)?;
        handle.index().apply(&stored)
    }

    fn transition(
        &self,
        handle: &RunHandle,
        idx: usize,
        to: TaskState,
        attempt: u32,
        error: Option<StepFailure>,
        output: Option<Value>,
    ) -> Result<(), WorkflowError> {
        let (step, from) = {
            let index = handle.index();
            let record = index.step(idx);
            (record.definition.id.clone(), record.state)
        };
        self.commit(
            handle,
            RunEvent::StepTransition {
                step,
                from,
                to,
                attempt,
                error,
                output,
            },
        )
    }

    fn runs(&self) -> std::sync::MutexGuard<'_, HashMap<RunId, Arc<RunHandle>>> {
        self.inner.runs.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn handle(&self, run_id: &str) -> Result<Arc<RunHandle>, WorkflowError> {
        if let Some(handle) = self.runs().get(run_id).cloned() {
            return Ok(handle);
        }
        self.load(run_id)
    }

    /// Replay a run from the store into memory, resolving steps a crash
    /// left in flight.
    fn load(&self, run_id: &str) -> Result<Arc<RunHandle>, WorkflowError> {
        let log = self.inner.store.load(run_id)?;
        let handle = RunHandle::new(RunIndex::replay(run_id, &log)?);

        if handle.index().status() == RunStatus::Running {
            let in_flight = handle.index().in_state(TaskState::Running);
            let mut blocked = Vec::new();
            for idx in in_flight {
                let (id, idempotent, attempts) = {
                    let index = handle.index();
                    let step = index.step(idx);
                    (step.definition.id.clone(), step.definition.idempotent, step.attempts)
                };
                if idempotent {
                    self.transition(&handle, idx, TaskState::Ready, attempts, None, None)?;
                    tracing::info!(run_id, step = %id, "re-queued idempotent step after crash");
                } else {
                    blocked.push(id);
                }
            }
            if !blocked.is_empty() {
                tracing::warn!(run_id, steps = ?blocked, "non-idempotent steps were in flight; awaiting operator");
                self.commit(
                    &handle,
                    RunEvent::RunStatusChanged {
                        status: RunStatus::AwaitingOperator,
                        reason: Some(format!("in flight at crash: {}", blocked.join(", "))),
                    },
                )?;
            }
        }

        let mut runs = self.runs();
        let handle = runs.entry(run_id.to_string()).or_insert(handle).clone();
        Ok(handle)
    }
}

/// One attempt with the step's own timeout. On timeout the call is
/// cancelled and allowed to tell its endpoint before the failure returns.
async fn run_attempt(
    executor: Arc<dyn StepExecutor>,
    call: CallSpec,
    timeout: Option<Duration>,
    token: CancellationToken,
) -> Result<Value, StepFailure> {
    let attempt = executor.execute(&call, &token);
    tokio::pin!(attempt);

    let Some(timeout) = timeout else {
        return attempt.await;
    };
    tokio::select! {
        result = &mut attempt => result,
        _ = tokio::time::sleep(timeout) => {
            token.cancel();
            let _ = attempt.await;
            Err(StepFailure::new(
                ErrorKind::Timeout,
                format!("step timed out after {}ms", timeout.as_millis()),
            ))
        }
    }
}

async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStateStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    type Script = VecDeque<Result<Value, StepFailure>>;

    /// Executor scripted per target. Unscripted calls succeed.
    #[derive(Default)]
    struct ScriptedExecutor {
        scripts: StdMutex<HashMap<String, Script>>,
        delays: StdMutex<HashMap<String, Duration>>,
        calls: StdMutex<Vec<(String, Instant)>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        cancelled: AtomicUsize,
    }

    impl ScriptedExecutor {
        fn script(&self, target: &str, results: Vec<Result<Value, StepFailure>>) {
            self.scripts
                .lock()
                .unwrap()
                .insert(target.to_string(), results.into());
        }

        fn delay(&self, target: &str, delay: Duration) {
            self.delays.lock().unwrap().insert(target.to_string(), delay);
        }

        fn calls_to(&self, target: &str) -> Vec<Instant> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(t, _)| t == target)
                .map(|(_, at)| *at)
                .collect()
        }
    }

    #[async_trait]
    impl StepExecutor for ScriptedExecutor {
        async fn execute(&self, call: &CallSpec, cancel: &CancellationToken) -> Result<Value, StepFailure> {
            self.calls
                .lock()
                .unwrap()
                .push((call.target.clone(), Instant::now()));
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);

            let delay = self.delays.lock().unwrap().get(&call.target).copied();
            let result = match delay {
                Some(delay) => tokio::select! {
                    _ = tokio::time::sleep(delay) => None,
                    _ = cancel.cancelled() => {
                        self.cancelled.fetch_add(1, Ordering::SeqCst);
                        Some(Err(StepFailure::new(ErrorKind::Cancelled, "cancelled")))
                    }
                },
                None => None,
            };
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if let Some(result) = result {
                return result;
            }

            self.scripts
                .lock()
                .unwrap()
                .get_mut(&call.target)
                .and_then(|s| s.pop_front())
                .unwrap_or_else(|| Ok(json!({"target": call.target})))
        }
    }

    fn fail(kind: ErrorKind) -> Result<Value, StepFailure> {
        Err(StepFailure::new(kind, "boom"))
    }

    fn definition(steps: Value) -> WorkflowDefinition {
        serde_json::from_value(json!({"name": "test", "steps": steps})).unwrap()
    }

    fn engine_with(
        config: EngineConfig,
    ) -> (WorkflowEngine, Arc<ScriptedExecutor>, Arc<InMemoryStateStore>) {
        let executor = Arc::new(ScriptedExecutor::default());
        let store = Arc::new(InMemoryStateStore::new());
        let engine = WorkflowEngine::new(config, store.clone(), executor.clone());
        (engine, executor, store)
    }

    fn engine() -> (WorkflowEngine, Arc<ScriptedExecutor>, Arc<InMemoryStateStore>) {
        engine_with(EngineConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_with_backoff_then_success() {
        let (engine, executor, _store) = engine();
        executor.script(
            "flaky",
            vec![fail(ErrorKind::Timeout), fail(ErrorKind::UpstreamUnavailable)],
        );
        let started = Instant::now();
        let snapshot = engine
            .run(definition(json!([{
                "id": "a",
                "call": {"target": "flaky"},
                "retry": {"max_attempts": 3, "backoff_ms": [1000, 2000, 4000]}
            }])))
            .await
            .unwrap();

        assert_eq!(snapshot.status, RunStatus::Succeeded);
        let step = snapshot.step("a").unwrap();
        assert_eq!(step.state, TaskState::Succeeded);
        assert_eq!(step.attempts, 3);
        assert!(started.elapsed() >= Duration::from_secs(3));

        let calls = executor.calls_to("flaky");
        assert_eq!(calls.len(), 3);
        assert!(calls[1] - calls[0] >= Duration::from_secs(1));
        assert!(calls[2] - calls[1] >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retriable_failure_is_terminal() {
        let (engine, executor, _store) = engine();
        executor.script("gone", vec![fail(ErrorKind::NotFound)]);
        let snapshot = engine
            .run(definition(json!([{
                "id": "a",
                "call": {"target": "gone"},
                "retry": {"max_attempts": 5}
            }])))
            .await
            .unwrap();
        assert_eq!(snapshot.status, RunStatus::Failed);
        assert_eq!(snapshot.step("a").unwrap().attempts, 1);
        assert_eq!(executor.calls_to("gone").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_opens_and_admits_one_probe() {
        let (engine, executor, _store) = engine();
        executor.script("svc", (0..5).map(|_| fail(ErrorKind::Timeout)).collect());
        let call = CallSpec::tool("svc", json!({}));

        for _ in 0..5 {
            let err = engine.guarded_call(&call).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Timeout);
        }
        let err = engine.guarded_call(&call).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CircuitOpen);
        assert_eq!(executor.calls_to("svc").len(), 5);

        tokio::time::advance(Duration::from_secs(30)).await;
        executor.delay("svc", Duration::from_secs(1));
        let probe = {
            let engine = engine.clone();
            let call = call.clone();
            tokio::spawn(async move { engine.guarded_call(&call).await })
        };
        tokio::task::yield_now().await;
        let concurrent = engine.guarded_call(&call).await.unwrap_err();
        assert_eq!(concurrent.kind(), ErrorKind::CircuitOpen);

        probe.await.unwrap().unwrap();
        assert_eq!(executor.calls_to("svc").len(), 6);
        engine.guarded_call(&call).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_step_waits_out_open_breaker() {
        let (engine, executor, _store) = engine();
        executor.script("svc", (0..5).map(|_| fail(ErrorKind::Timeout)).collect());
        let call = CallSpec::tool("svc", json!({}));
        for _ in 0..5 {
            let _ = engine.guarded_call(&call).await;
        }

        let started = Instant::now();
        let snapshot = engine
            .run(definition(json!([{"id": "a", "call": {"target": "svc"}}])))
            .await
            .unwrap();
        assert_eq!(snapshot.status, RunStatus::Succeeded);
        assert!(started.elapsed() >= Duration::from_secs(30));
        assert_eq!(executor.calls_to("svc").len(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fail_fast_on_open_breaker() {
        let (engine, executor, _store) = engine_with(EngineConfig {
            fail_fast_on_open_circuit: true,
            ..EngineConfig::default()
        });
        executor.script("svc", (0..5).map(|_| fail(ErrorKind::Timeout)).collect());
        let call = CallSpec::tool("svc", json!({}));
        for _ in 0..5 {
            let _ = engine.guarded_call(&call).await;
        }

        let snapshot = engine
            .run(definition(json!([{"id": "a", "call": {"target": "svc"}}])))
            .await
            .unwrap();
        assert_eq!(snapshot.status, RunStatus::Failed);
        let step = snapshot.step("a").unwrap();
        assert_eq!(step.last_error.as_ref().unwrap().kind, ErrorKind::CircuitOpen);
        assert_eq!(executor.calls_to("svc").len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_optional_failure_skips_only_its_dependents() {
        let (engine, executor, _store) = engine();
        executor.script("b", vec![fail(ErrorKind::DependencyFailed)]);
        let snapshot = engine
            .run(definition(json!([
                {"id": "a", "call": {"target": "a"}},
                {"id": "b", "call": {"target": "b"}, "depends_on": ["a"], "optional": true},
                {"id": "c", "call": {"target": "c"}, "depends_on": ["b"]},
                {"id": "d", "call": {"target": "d"}, "depends_on": ["a"]}
            ])))
            .await
            .unwrap();

        assert_eq!(snapshot.step("a").unwrap().state, TaskState::Succeeded);
        assert_eq!(snapshot.step("b").unwrap().state, TaskState::FailedTerminal);
        assert_eq!(snapshot.step("c").unwrap().state, TaskState::Skipped);
        assert_eq!(snapshot.step("d").unwrap().state, TaskState::Succeeded);
        assert_eq!(snapshot.status, RunStatus::Succeeded);
        assert!(executor.calls_to("c").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_required_failure_lets_other_branches_finish() {
        let (engine, executor, _store) = engine();
        executor.script("bad", vec![fail(ErrorKind::DependencyFailed)]);
        executor.delay("slow", Duration::from_secs(5));
        let snapshot = engine
            .run(definition(json!([
                {"id": "bad", "call": {"target": "bad"}},
                {"id": "after", "call": {"target": "after"}, "depends_on": ["bad"]},
                {"id": "slow", "call": {"target": "slow"}}
            ])))
            .await
            .unwrap();
        assert_eq!(snapshot.status, RunStatus::Failed);
        assert_eq!(snapshot.step("after").unwrap().state, TaskState::Skipped);
        assert_eq!(snapshot.step("slow").unwrap().state, TaskState::Succeeded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_ceiling() {
        let (engine, executor, _store) = engine();
        let steps: Vec<Value> = (0..6)
            .map(|i| json!({"id": format!("s{i}"), "call": {"target": "work"}}))
            .collect();
        executor.delay("work", Duration::from_secs(1));
        let snapshot = engine.run(definition(Value::Array(steps))).await.unwrap();
        assert_eq!(snapshot.status, RunStatus::Succeeded);
        assert_eq!(executor.max_in_flight.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_step_timeout_cancels_call() {
        let (engine, executor, _store) = engine();
        executor.delay("hang", Duration::from_secs(600));
        let snapshot = engine
            .run(definition(json!([{"id": "a", "call": {"target": "hang"}, "timeout_ms": 100}])))
            .await
            .unwrap();
        let step = snapshot.step("a").unwrap();
        assert_eq!(step.state, TaskState::FailedTerminal);
        assert_eq!(step.last_error.as_ref().unwrap().kind, ErrorKind::Timeout);
        assert_eq!(executor.cancelled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_skips_unstarted_steps() {
        let (engine, executor, _store) = engine();
        executor.delay("long", Duration::from_secs(600));
        let run_id = engine
            .start_run(definition(json!([
                {"id": "a", "call": {"target": "long"}},
                {"id": "b", "call": {"target": "x"}, "depends_on": ["a"]}
            ])))
            .unwrap();

        let driver = {
            let engine = engine.clone();
            let run_id = run_id.clone();
            tokio::spawn(async move { engine.execute(&run_id).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        engine.cancel(&run_id).await.unwrap();

        let snapshot = driver.await.unwrap().unwrap();
        assert_eq!(snapshot.status, RunStatus::Cancelled);
        let a = snapshot.step("a").unwrap();
        assert_eq!(a.state, TaskState::FailedTerminal);
        assert_eq!(a.last_error.as_ref().unwrap().kind, ErrorKind::Cancelled);
        let b = snapshot.step("b").unwrap();
        assert_eq!(b.state, TaskState::Skipped);
        assert_eq!(b.last_error.as_ref().unwrap().message, "cancelled");
        assert_eq!(executor.cancelled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_times_out_run() {
        let (engine, executor, _store) = engine_with(EngineConfig {
            deadline: Some(Duration::from_secs(5)),
            ..EngineConfig::default()
        });
        executor.delay("long", Duration::from_secs(60));
        let snapshot = engine
            .run(definition(json!([{"id": "a", "call": {"target": "long"}}])))
            .await
            .unwrap();
        assert_eq!(snapshot.status, RunStatus::TimedOut);
        assert_eq!(
            snapshot.step("a").unwrap().last_error.as_ref().unwrap().kind,
            ErrorKind::Timeout
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_failure_is_fatal_and_not_applied() {
        let (engine, executor, store) = engine();
        executor.delay("a", Duration::from_secs(1));
        let run_id = engine
            .start_run(definition(json!([{"id": "a", "call": {"target": "a"}}])))
            .unwrap();

        let driver = {
            let engine = engine.clone();
            let run_id = run_id.clone();
            tokio::spawn(async move { engine.execute(&run_id).await })
        };
        tokio::time::sleep(Duration::from_millis(500)).await;
        store.fail_writes(true);

        let err = driver.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StoreUnavailable);
        let snapshot = engine.snapshot(&run_id).unwrap();
        assert_eq!(snapshot.step("a").unwrap().state, TaskState::Running);
        assert_eq!(snapshot.status, RunStatus::Running);
    }

    /// Leaves `step` Running in the store as if the process died mid-call.
    fn crashed_run(store: &Arc<InMemoryStateStore>, idempotent: bool) -> RunId {
        let executor = Arc::new(ScriptedExecutor::default());
        let engine = WorkflowEngine::new(EngineConfig::default(), store.clone(), executor);
        let run_id = engine
            .start_run(definition(json!([
                {"id": "a", "call": {"target": "a"}, "idempotent": idempotent},
                {"id": "b", "call": {"target": "b"}, "depends_on": ["a"]}
            ])))
            .unwrap();
        let handle = engine.handle(&run_id).unwrap();
        engine.settle(&handle).unwrap();
        engine
            .transition(&handle, 0, TaskState::Running, 1, None, None)
            .unwrap();
        run_id
    }

    #[tokio::test(start_paused = true)]
    async fn test_recover_reruns_idempotent_step() {
        let store = Arc::new(InMemoryStateStore::new());
        let run_id = crashed_run(&store, true);

        let executor = Arc::new(ScriptedExecutor::default());
        let engine = WorkflowEngine::new(EngineConfig::default(), store.clone(), executor.clone());
        assert_eq!(engine.recover().unwrap(), vec![run_id.clone()]);

        let snapshot = engine.execute(&run_id).await.unwrap();
        assert_eq!(snapshot.status, RunStatus::Succeeded);
        assert_eq!(snapshot.step("a").unwrap().attempts, 2);
        assert_eq!(executor.calls_to("a").len(), 1);
        assert_eq!(store.list_runs().unwrap()[0].status, RunStatus::Succeeded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recover_waits_for_operator() {
        let store = Arc::new(InMemoryStateStore::new());
        let run_id = crashed_run(&store, false);

        let executor = Arc::new(ScriptedExecutor::default());
        let engine = WorkflowEngine::new(EngineConfig::default(), store, executor.clone());
        engine.recover().unwrap();

        let snapshot = engine.execute(&run_id).await.unwrap();
        assert_eq!(snapshot.status, RunStatus::AwaitingOperator);
        assert!(executor.calls_to("a").is_empty());

        let resolved = engine
            .resolve_step(
                &run_id,
                "a",
                OperatorResolution::Succeeded {
                    output: Some(json!({"issue": 42})),
                },
            )
            .unwrap();
        assert_eq!(resolved.status, RunStatus::Running);

        let snapshot = engine.execute(&run_id).await.unwrap();
        assert_eq!(snapshot.status, RunStatus::Succeeded);
        assert_eq!(snapshot.step("a").unwrap().output, Some(json!({"issue": 42})));
        assert!(executor.calls_to("a").is_empty());
        assert_eq!(executor.calls_to("b").len(), 1);
    }

    #[tokio::test]
    async fn test_resumed_run_keeps_original_deadline() {
        let config = EngineConfig {
            deadline: Some(Duration::from_millis(100)),
            ..EngineConfig::default()
        };
        let store = Arc::new(InMemoryStateStore::new());
        let first = WorkflowEngine::new(config.clone(), store.clone(), Arc::new(ScriptedExecutor::default()));
        let run_id = first
            .start_run(definition(json!([{"id": "a", "call": {"target": "a"}}])))
            .unwrap();
        drop(first);

        tokio::time::sleep(Duration::from_millis(150)).await;

        let executor = Arc::new(ScriptedExecutor::default());
        let engine = WorkflowEngine::new(config, store, executor.clone());
        assert_eq!(engine.recover().unwrap(), vec![run_id.clone()]);

        let snapshot = engine.execute(&run_id).await.unwrap();
        assert_eq!(snapshot.status, RunStatus::TimedOut);
        assert!(executor.calls_to("a").is_empty());
        assert_eq!(snapshot.step("a").unwrap().state, TaskState::Skipped);
    }

    #[tokio::test]
    async fn test_purge_requires_terminal_run() {
        let (engine, _executor, store) = engine();
        let run_id = engine
            .start_run(definition(json!([{"id": "a", "call": {"target": "a"}}])))
            .unwrap();
        let err = engine.purge(&run_id).unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidRunState { .. }));

        engine.execute(&run_id).await.unwrap();
        engine.purge(&run_id).unwrap();
        assert!(store.list_runs().unwrap().is_empty());
        assert_eq!(engine.snapshot(&run_id).unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_invalid_definition_is_rejected() {
        let (engine, _executor, store) = engine();
        let err = engine
            .start_run(definition(json!([
                {"id": "a", "call": {"target": "a"}, "depends_on": ["b"]},
                {"id": "b", "call": {"target": "b"}, "depends_on": ["a"]}
            ])))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SchemaViolation);
        assert!(store.list_runs().unwrap().is_empty());
    }
}
