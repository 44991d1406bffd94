use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::record::SagaStatus;

/// Error type returned by step actions and compensations.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Structural problem in a saga definition, detected before any step runs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum DefinitionError {
    #[error("saga must have an id")]
    MissingId,

    #[error("saga '{saga_id}' must have at least one step")]
    NoSteps { saga_id: String },

    #[error("saga '{saga_id}' contains a step without an id")]
    MissingStepId { saga_id: String },

    #[error("duplicate step id '{step_id}'")]
    DuplicateStepId { step_id: String },

    #[error("step '{step_id}' must have {handler} handler")]
    MissingHandler {
        step_id: String,
        handler: &'static str,
    },

    #[error("step '{step_id}' depends on unknown step '{dependency}'")]
    UnknownDependency { step_id: String, dependency: String },
}

/// Why a step's forward action did not succeed.
///
/// Recorded on the step and, for the step that ends the forward pass, on the
/// saga record. Also handed to every compensation as the triggering error.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", rename_all_fields = "camelCase")]
#[non_exhaustive]
pub enum StepError {
    /// The action returned an error.
    #[error("step '{step_id}' failed: {message}")]
    Execution { step_id: String, message: String },

    /// An attempt did not finish within the step timeout.
    #[error("step '{step_id}' timed out after {timeout_ms}ms")]
    Timeout { step_id: String, timeout_ms: u64 },

    /// A declared dependency did not reach `succeeded`.
    #[error("dependency '{dependency}' not satisfied for step '{step_id}'")]
    DependencyUnmet { step_id: String, dependency: String },

    /// The action panicked. Never retried.
    #[error("step '{step_id}' panicked: {message}")]
    Panicked { step_id: String, message: String },
}

impl StepError {
    /// Id of the step this error belongs to.
    #[must_use]
    pub fn step_id(&self) -> &str {
        match self {
            Self::Execution { step_id, .. }
            | Self::Timeout { step_id, .. }
            | Self::DependencyUnmet { step_id, .. }
            | Self::Panicked { step_id, .. } => step_id,
        }
    }

    /// Whether another attempt may be made after this error.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Execution { .. } | Self::Timeout { .. })
    }
}

/// Error from a failed compensation.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", rename_all_fields = "camelCase")]
#[non_exhaustive]
pub enum CompensationError {
    #[error("compensation failed for step '{step_id}': {message}")]
    Failed { step_id: String, message: String },

    #[error("compensation for step '{step_id}' timed out after {timeout_ms}ms")]
    Timeout { step_id: String, timeout_ms: u64 },
}

/// Misuse of a [`SagaExecutor`](crate::SagaExecutor) run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ExecuteError {
    #[error("cannot execute saga '{saga_id}' in {status} state")]
    AlreadyExecuted { saga_id: String, status: SagaStatus },

    #[error("saga '{saga_id}' is {status}; its record is read-only")]
    Finished { saga_id: String, status: SagaStatus },
}

/// Error reading or writing saga snapshots.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    #[error("saga id '{saga_id}' cannot be used as a snapshot file name")]
    InvalidSagaId { saga_id: String },

    #[error("failed to create state directory '{path}'")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize snapshot for saga '{saga_id}'")]
    Serialize {
        saga_id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to write snapshot '{path}'")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read snapshot '{path}'")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse snapshot '{path}'")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to list state directory '{path}'")]
    ReadDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Error from [`SagaOrchestrator`](crate::SagaOrchestrator).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum OrchestratorError {
    #[error("saga not found: {saga_id}")]
    SagaNotFound { saga_id: String },

    #[error("invalid saga definition")]
    Definition(#[from] DefinitionError),

    #[error("saga execution rejected")]
    Execute(#[from] ExecuteError),
}

/// Render an error and its whole source chain on one line.
pub(crate) fn describe(error: &(dyn std::error::Error + 'static)) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
