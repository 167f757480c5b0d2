//! State Store.
//!
//! Durable, append-only log of run transitions and breaker flips. The
//! workflow engine appends every transition here before applying it in
//! memory, and rebuilds runs from the log on recovery.
//!
//! The trait is synchronous: both backends answer from local state, and
//! callers hold no async locks across a store call.

pub mod errors;
pub mod memory;
pub mod sqlite;

pub use errors::StoreError;
pub use memory::InMemoryStateStore;
pub use sqlite::SqliteStateStore;

use crate::workflow::breaker::BreakerTransition;
use crate::workflow::types::{RunEvent, RunSummary, StoredEvent};

/// Durability contract for workflow state.
pub trait StateStore: Send + Sync {
    /// Append one event to a run's log and return it as stored.
    ///
    /// A `RunCreated` event registers the run; `RunStatusChanged` updates
    /// the status shown by [`list_runs`](Self::list_runs).
    fn append(&self, run_id: &str, event: &RunEvent) -> Result<StoredEvent, StoreError>;

    /// The run's log in append order. Unknown runs yield an empty log.
    fn load(&self, run_id: &str) -> Result<Vec<StoredEvent>, StoreError>;

    /// Every stored run, oldest first.
    fn list_runs(&self) -> Result<Vec<RunSummary>, StoreError>;

    /// Drop a run and its log. Returns whether the run existed.
    fn purge(&self, run_id: &str) -> Result<bool, StoreError>;

    fn append_breaker(&self, transition: &BreakerTransition) -> Result<(), StoreError>;

    /// Every breaker flip in append order.
    fn load_breakers(&self) -> Result<Vec<BreakerTransition>, StoreError>;
}
