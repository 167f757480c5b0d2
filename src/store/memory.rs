//! In-memory state store for tests and ephemeral runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use chrono::Utc;

use super::errors::StoreError;
use super::StateStore;
use crate::workflow::breaker::BreakerTransition;
use crate::workflow::types::{RunEvent, RunStatus, RunSummary, StoredEvent};

#[derive(Default)]
struct Inner {
    next_seq: u64,
    /// Insertion order of runs.
    order: Vec<String>,
    runs: HashMap<String, RunSummary>,
    logs: HashMap<String, Vec<StoredEvent>>,
    breakers: Vec<BreakerTransition>,
}

#[derive(Default)]
pub struct InMemoryStateStore {
    inner: Mutex<Inner>,
    fail_writes: AtomicBool,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail with `Unavailable` until cleared.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable {
                reason: "writes disabled".into(),
            });
        }
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl StateStore for InMemoryStateStore {
    fn append(&self, run_id: &str, event: &RunEvent) -> Result<StoredEvent, StoreError> {
        self.check_writable()?;
        let at = Utc::now();
        let mut inner = self.lock();

        match event {
            RunEvent::RunCreated { definition, .. } => {
                if !inner.runs.contains_key(run_id) {
                    inner.order.push(run_id.to_string());
                }
                inner.runs.insert(
                    run_id.to_string(),
                    RunSummary {
                        run_id: run_id.to_string(),
                        name: definition.name.clone(),
                        status: RunStatus::Running,
                        created_at: at,
                        updated_at: at,
                    },
                );
            }
            RunEvent::RunStatusChanged { status, .. } => {
                if let Some(run) = inner.runs.get_mut(run_id) {
                    run.status = *status;
                    run.updated_at = at;
                }
            }
            RunEvent::StepTransition { .. } => {
                if let Some(run) = inner.runs.get_mut(run_id) {
                    run.updated_at = at;
                }
            }
        }

        inner.next_seq += 1;
        let stored = StoredEvent {
            seq: inner.next_seq,
            run_id: run_id.to_string(),
            at,
            event: event.clone(),
        };
        inner
            .logs
            .entry(run_id.to_string())
            .or_default()
            .push(stored.clone());
        Ok(stored)
    }

    fn load(&self, run_id: &str) -> Result<Vec<StoredEvent>, StoreError> {
        Ok(self.lock().logs.get(run_id).cloned().unwrap_or_default())
    }

    fn list_runs(&self) -> Result<Vec<RunSummary>, StoreError> {
        let inner = self.lock();
        Ok(inner
            .order
            .iter()
            .filter_map(|id| inner.runs.get(id).cloned())
            .collect())
    }

    fn purge(&self, run_id: &str) -> Result<bool, StoreError> {
        self.check_writable()?;
        let mut inner = self.lock();
        inner.order.retain(|id| id != run_id);
        inner.logs.remove(run_id);
        Ok(inner.runs.remove(run_id).is_some())
    }

    fn append_breaker(&self, transition: &BreakerTransition) -> Result<(), StoreError> {
        self.check_writable()?;
        self.lock().breakers.push(transition.clone());
        Ok(())
    }

    fn load_breakers(&self) -> Result<Vec<BreakerTransition>, StoreError> {
        Ok(self.lock().breakers.clone())
    }
}
