//! Workflow Engine.
//!
//! Executes DAGs of routed calls with per-step retry budgets, per-target
//! circuit breakers, cancellation, a run deadline, and crash recovery
//! from the durable transition log in [`crate::store`].

pub mod breaker;
pub mod definition;
pub mod engine;
pub mod errors;
pub mod executor;
pub mod plan;
pub mod scheduler;
pub mod types;

pub use breaker::{Admission, BreakerConfig, BreakerRegistry, BreakerTransition, CircuitState};
pub use definition::{fingerprint, load_definition, validate};
pub use engine::{EngineConfig, WorkflowEngine};
pub use errors::WorkflowError;
pub use executor::{RouterExecutor, StepExecutor};
pub use plan::{definition_from_hints, definition_from_text};
pub use scheduler::RunIndex;
pub use types::{
    CallSpec, OperatorResolution, RetryPolicy, RunEvent, RunId, RunSnapshot, RunStatus,
    RunSummary, StepDefinition, StepFailure, StepSnapshot, StoredEvent, TaskState,
    WorkflowDefinition,
};
