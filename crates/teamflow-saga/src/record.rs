use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::SagaContext;
use crate::error::{CompensationError, StepError};

/// Status of a saga run.
///
/// `pending → running → {succeeded | failed → compensating → compensated}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SagaStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Compensating,
    Compensated,
}

impl SagaStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Compensating => "compensating",
            Self::Compensated => "compensated",
        }
    }

    /// Whether `next` is a legal successor of this status.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running | Self::Failed)
                | (Self::Running, Self::Succeeded | Self::Failed)
                | (Self::Failed, Self::Compensating)
                | (Self::Compensating, Self::Compensated)
        )
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Compensated)
    }

    /// Running forward or rolling back.
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::Compensating)
    }
}

impl fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a single step.
///
/// `pending → running → {succeeded | failed}`,
/// `succeeded → compensating → {compensated | compensation_failed}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Compensating,
    Compensated,
    CompensationFailed,
}

impl StepStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Compensating => "compensating",
            Self::Compensated => "compensated",
            Self::CompensationFailed => "compensation_failed",
        }
    }

    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Running, Self::Succeeded | Self::Failed)
                | (Self::Succeeded, Self::Compensating)
                | (Self::Compensating, Self::Compensated | Self::CompensationFailed)
        )
    }

    fn symbol(self) -> &'static str {
        match self {
            Self::Pending => "·",
            Self::Running => "…",
            Self::Succeeded => "✓",
            Self::Failed => "✗",
            Self::Compensating => "↻",
            Self::Compensated => "↩",
            Self::CompensationFailed => "⚠",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution record of one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepExecutionRecord {
    pub step_id: String,
    pub step_name: String,
    pub status: StepStatus,
    pub output: Option<Value>,
    pub error: Option<StepError>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub compensation_start_time: Option<DateTime<Utc>>,
    pub compensation_end_time: Option<DateTime<Utc>>,
    pub compensation_result: Option<Value>,
    pub compensation_error: Option<CompensationError>,
    /// Failed attempts before success, or every attempt made when the step failed.
    pub retry_attempts: u32,
}

impl StepExecutionRecord {
    pub(crate) fn new(step_id: &str, step_name: &str) -> Self {
        Self {
            step_id: step_id.to_string(),
            step_name: step_name.to_string(),
            status: StepStatus::Pending,
            output: None,
            error: None,
            start_time: None,
            end_time: None,
            compensation_start_time: None,
            compensation_end_time: None,
            compensation_result: None,
            compensation_error: None,
            retry_attempts: 0,
        }
    }

    fn advance(&mut self, next: StepStatus) {
        debug_assert!(
            self.status.can_transition_to(next),
            "illegal step transition {} -> {next} for '{}'",
            self.status,
            self.step_id
        );
        self.status = next;
    }

    pub(crate) fn record_start(&mut self) {
        self.advance(StepStatus::Running);
        self.start_time = Some(Utc::now());
    }

    pub(crate) fn record_success(&mut self, output: Value, retry_attempts: u32) {
        self.advance(StepStatus::Succeeded);
        self.output = Some(output);
        self.retry_attempts = retry_attempts;
        self.end_time = Some(Utc::now());
    }

    pub(crate) fn record_failure(&mut self, error: StepError, retry_attempts: u32) {
        self.advance(StepStatus::Failed);
        self.error = Some(error);
        self.retry_attempts = retry_attempts;
        self.end_time = Some(Utc::now());
    }

    pub(crate) fn record_compensation_start(&mut self) {
        self.advance(StepStatus::Compensating);
        self.compensation_start_time = Some(Utc::now());
    }

    pub(crate) fn record_compensated(&mut self, result: Value) {
        self.advance(StepStatus::Compensated);
        self.compensation_result = Some(result);
        self.compensation_end_time = Some(Utc::now());
    }

    pub(crate) fn record_compensation_failed(&mut self, error: CompensationError) {
        self.advance(StepStatus::CompensationFailed);
        self.compensation_error = Some(error);
        self.compensation_end_time = Some(Utc::now());
    }
}

/// Execution record of a whole saga run.
///
/// This is also the persisted snapshot format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SagaExecutionRecord {
    pub saga_id: String,
    pub saga_name: Option<String>,
    pub status: SagaStatus,
    pub step_records: Vec<StepExecutionRecord>,
    pub context: SagaContext,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub failed_step_id: Option<String>,
    pub error: Option<StepError>,
}

impl SagaExecutionRecord {
    pub(crate) fn new(
        saga_id: &str,
        saga_name: Option<&str>,
        step_records: Vec<StepExecutionRecord>,
        context: SagaContext,
    ) -> Self {
        Self {
            saga_id: saga_id.to_string(),
            saga_name: saga_name.map(str::to_string),
            status: SagaStatus::Pending,
            step_records,
            context,
            start_time: None,
            end_time: None,
            failed_step_id: None,
            error: None,
        }
    }

    pub(crate) fn advance(&mut self, next: SagaStatus) {
        debug_assert!(
            self.status.can_transition_to(next),
            "illegal saga transition {} -> {next} for '{}'",
            self.status,
            self.saga_id
        );
        self.status = next;
        if next.is_terminal() {
            self.end_time = Some(Utc::now());
        }
    }

    #[must_use]
    pub fn step(&self, step_id: &str) -> Option<&StepExecutionRecord> {
        self.step_records.iter().find(|r| r.step_id == step_id)
    }

    pub(crate) fn step_mut(&mut self, index: usize) -> &mut StepExecutionRecord {
        &mut self.step_records[index]
    }

    /// One line per step, prefixed with a status marker.
    #[must_use]
    pub fn summary(&self) -> String {
        let mut lines = vec![format!("saga {}: {}", self.saga_id, self.status)];
        for record in &self.step_records {
            let mut line = format!("  {} {}", record.status.symbol(), record.step_id);
            if record.retry_attempts > 0 {
                line.push_str(&format!(" (retries: {})", record.retry_attempts));
            }
            lines.push(line);
        }
        if let Some(error) = &self.error {
            lines.push(format!("error: {error}"));
        }
        lines.join("\n")
    }
}
