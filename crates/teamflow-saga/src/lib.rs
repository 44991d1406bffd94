//! Saga execution for multi-step workflows with compensating rollback.
//!
//! A saga is an ordered list of steps, each pairing an async forward action
//! with a compensation. Steps run one after another; if one fails for good
//! (after its retries and within its timeout), every step that already
//! succeeded is compensated in reverse order. Runs report typed events,
//! produce a serializable execution record and can persist it as a JSON
//! snapshot.

mod builder;
mod compensation;
mod config;
mod context;
mod error;
mod event;
mod executor;
mod orchestrator;
mod record;
mod saga;
mod step;
mod store;

pub use builder::SagaBuilder;
pub use config::{
    DEFAULT_COMPENSATION_TIMEOUT, DEFAULT_RETRY_DELAY, DEFAULT_STEP_TIMEOUT, ExecutorConfig,
    ExecutorOptions,
};
pub use context::SagaContext;
pub use error::{
    BoxError, CompensationError, DefinitionError, ExecuteError, OrchestratorError, StepError,
    StoreError,
};
pub use event::{CompensationOutcome, SagaEvent, SagaObserver};
pub use executor::SagaExecutor;
pub use orchestrator::{OrchestratorEvent, SagaOrchestrator};
pub use record::{SagaExecutionRecord, SagaStatus, StepExecutionRecord, StepStatus};
pub use saga::{FailureCallback, SagaDefinition, SuccessCallback};
pub use step::{
    ActionFn, Compensation, CompensationFn, LoggedCompensation, NoCompensation, SagaAction,
    StepContext, StepDefinition, StepOptions, action_fn, compensation_fn,
};
pub use store::{FileStateStore, SagaStateSummary, StateStore, list_saga_states, load_saga_state};
