use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::{CompensationError, StepError};
use crate::record::{SagaExecutionRecord, StepExecutionRecord};

/// Outcome of compensating one step, reported with [`SagaEvent::Compensated`].
#[derive(Debug, Clone, PartialEq)]
pub struct CompensationOutcome {
    pub step_id: String,
    pub result: Result<Value, CompensationError>,
}

/// Lifecycle event emitted by a [`SagaExecutor`](crate::SagaExecutor).
///
/// Records carried by events are snapshots taken at emission time.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum SagaEvent {
    Started {
        record: Box<SagaExecutionRecord>,
    },
    StepStarted {
        step_id: String,
        record: StepExecutionRecord,
    },
    /// An attempt failed and another one follows after the retry delay.
    StepRetry {
        step_id: String,
        /// 1-based number of the attempt that just failed.
        attempt: u32,
        max_retries: u32,
        error: StepError,
    },
    StepSucceeded {
        step_id: String,
        output: Value,
        record: StepExecutionRecord,
    },
    StepFailed {
        step_id: String,
        error: StepError,
        record: StepExecutionRecord,
    },
    Failed {
        record: Box<SagaExecutionRecord>,
    },
    Compensating {
        record: Box<SagaExecutionRecord>,
    },
    CompensatingStep {
        step_id: String,
        record: StepExecutionRecord,
    },
    StepCompensated {
        step_id: String,
        result: Value,
        record: StepExecutionRecord,
    },
    CompensationFailed {
        step_id: String,
        error: CompensationError,
        record: StepExecutionRecord,
    },
    Compensated {
        record: Box<SagaExecutionRecord>,
        outcomes: Vec<CompensationOutcome>,
    },
    Succeeded {
        record: Box<SagaExecutionRecord>,
    },
    /// A step action panicked; compensation follows.
    Error {
        error: StepError,
        record: Box<SagaExecutionRecord>,
    },
}

impl SagaEvent {
    /// Kebab-case event name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Started { .. } => "started",
            Self::StepStarted { .. } => "step-started",
            Self::StepRetry { .. } => "step-retry",
            Self::StepSucceeded { .. } => "step-succeeded",
            Self::StepFailed { .. } => "step-failed",
            Self::Failed { .. } => "failed",
            Self::Compensating { .. } => "compensating",
            Self::CompensatingStep { .. } => "compensating-step",
            Self::StepCompensated { .. } => "step-compensated",
            Self::CompensationFailed { .. } => "compensation-failed",
            Self::Compensated { .. } => "compensated",
            Self::Succeeded { .. } => "succeeded",
            Self::Error { .. } => "error",
        }
    }

    /// Step the event is about, for step-level events.
    #[must_use]
    pub fn step_id(&self) -> Option<&str> {
        match self {
            Self::StepStarted { step_id, .. }
            | Self::StepRetry { step_id, .. }
            | Self::StepSucceeded { step_id, .. }
            | Self::StepFailed { step_id, .. }
            | Self::CompensatingStep { step_id, .. }
            | Self::StepCompensated { step_id, .. }
            | Self::CompensationFailed { step_id, .. } => Some(step_id),
            _ => None,
        }
    }

    /// Saga record snapshot, for saga-level events.
    #[must_use]
    pub fn saga_record(&self) -> Option<&SagaExecutionRecord> {
        match self {
            Self::Started { record }
            | Self::Failed { record }
            | Self::Compensating { record }
            | Self::Compensated { record, .. }
            | Self::Succeeded { record }
            | Self::Error { record, .. } => Some(&**record),
            _ => None,
        }
    }
}

/// Receives every event of a saga run, synchronously and in order.
pub trait SagaObserver: Send + Sync {
    fn on_event(&self, event: &SagaEvent);
}

/// Forwards events into a channel. A closed receiver is ignored.
impl SagaObserver for mpsc::UnboundedSender<SagaEvent> {
    fn on_event(&self, event: &SagaEvent) {
        let _ = self.send(event.clone());
    }
}
