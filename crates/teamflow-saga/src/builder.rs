use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};

use crate::config::DEFAULT_COMPENSATION_TIMEOUT;
use crate::context::SagaContext;
use crate::error::{DefinitionError, StepError};
use crate::record::SagaExecutionRecord;
use crate::saga::SagaDefinition;
use crate::step::{Compensation, SagaAction, StepDefinition, StepOptions};

/// Fluent builder for [`SagaDefinition`].
///
/// `build()` only checks that the saga has an id and at least one step.
/// Duplicate step ids, missing handlers and unknown dependencies are reported
/// by [`SagaExecutor::new`](crate::SagaExecutor::new).
///
/// ```
/// use serde_json::json;
/// use teamflow_saga::{BoxError, NoCompensation, SagaBuilder, StepContext, StepOptions, action_fn};
///
/// let saga = SagaBuilder::new()
///     .id("deploy")
///     .name("Deploy service")
///     .step(
///         "create-db",
///         action_fn(|_ctx: StepContext| async { Ok::<_, BoxError>(json!({ "db": "primary" })) }),
///         NoCompensation,
///         StepOptions::new().retry_count(2),
///     )
///     .build()
///     .expect("valid saga");
///
/// assert_eq!(saga.steps().len(), 1);
/// ```
#[derive(Default)]
pub struct SagaBuilder {
    id: Option<String>,
    name: Option<String>,
    steps: Vec<StepDefinition>,
    on_success: Option<crate::saga::SuccessCallback>,
    on_failure: Option<crate::saga::FailureCallback>,
    continue_on_compensation_failure: bool,
    compensation_timeout: Option<Duration>,
    metadata: Map<String, Value>,
}

impl SagaBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Append a step.
    #[must_use]
    pub fn step(
        self,
        id: impl Into<String>,
        action: impl SagaAction + 'static,
        compensate: impl Compensation + 'static,
        options: StepOptions,
    ) -> Self {
        let step = StepDefinition::new(id)
            .with_action(action)
            .with_compensation(compensate)
            .with_options(options);
        self.push_step(step)
    }

    /// Append a step assembled elsewhere.
    #[must_use]
    pub fn push_step(mut self, step: StepDefinition) -> Self {
        self.steps.push(step);
        self
    }

    #[must_use]
    pub fn on_success<F>(mut self, callback: F) -> Self
    where
        F: Fn(&SagaExecutionRecord, &SagaContext) + Send + Sync + 'static,
    {
        self.on_success = Some(Arc::new(callback));
        self
    }

    #[must_use]
    pub fn on_failure<F>(mut self, callback: F) -> Self
    where
        F: Fn(&SagaExecutionRecord, Option<&str>, Option<&StepError>) + Send + Sync + 'static,
    {
        self.on_failure = Some(Arc::new(callback));
        self
    }

    /// Keep compensating older steps after one compensation fails.
    #[must_use]
    pub fn continue_on_compensation_failure(mut self, continue_on_failure: bool) -> Self {
        self.continue_on_compensation_failure = continue_on_failure;
        self
    }

    #[must_use]
    pub fn compensation_timeout(mut self, timeout: Duration) -> Self {
        self.compensation_timeout = Some(timeout);
        self
    }

    /// Merge `metadata` into the saga's metadata.
    #[must_use]
    pub fn metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata.extend(metadata);
        self
    }

    /// Build the saga definition.
    ///
    /// # Errors
    ///
    /// Returns `DefinitionError::MissingId` if no non-empty id was set and
    /// `DefinitionError::NoSteps` if no step was added.
    pub fn build(self) -> Result<SagaDefinition, DefinitionError> {
        let id = match self.id {
            Some(id) if !id.is_empty() => id,
            _ => return Err(DefinitionError::MissingId),
        };
        if self.steps.is_empty() {
            return Err(DefinitionError::NoSteps { saga_id: id });
        }

        Ok(SagaDefinition {
            id,
            name: self.name,
            steps: self.steps,
            on_success: self.on_success,
            on_failure: self.on_failure,
            continue_on_compensation_failure: self.continue_on_compensation_failure,
            compensation_timeout: self
                .compensation_timeout
                .unwrap_or(DEFAULT_COMPENSATION_TIMEOUT),
            metadata: self.metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::error::BoxError;
    use crate::step::{NoCompensation, StepContext, action_fn};

    fn returning(value: Value) -> impl SagaAction {
        action_fn(move |_ctx: StepContext| {
            let value = value.clone();
            async move { Ok::<_, BoxError>(value) }
        })
    }

    #[test]
    fn builder_creates_saga_with_steps_in_order() -> anyhow::Result<()> {
        let saga = SagaBuilder::new()
            .id("test-saga-1")
            .name("Test Saga")
            .step("step1", returning(json!("result1")), NoCompensation, StepOptions::new())
            .step("step2", returning(json!("result2")), NoCompensation, StepOptions::new())
            .build()?;

        assert_eq!(saga.id(), "test-saga-1");
        assert_eq!(saga.name(), Some("Test Saga"));
        assert_eq!(saga.steps().len(), 2);
        assert_eq!(saga.steps()[0].id(), "step1");
        assert_eq!(saga.steps()[1].id(), "step2");
        Ok(())
    }

    #[test]
    fn builder_rejects_missing_id() {
        let result = SagaBuilder::new()
            .step("step1", returning(json!(1)), NoCompensation, StepOptions::new())
            .build();

        assert_eq!(result.err(), Some(DefinitionError::MissingId));
    }

    #[test]
    fn builder_rejects_empty_id() {
        let result = SagaBuilder::new()
            .id("")
            .step("step1", returning(json!(1)), NoCompensation, StepOptions::new())
            .build();

        assert_eq!(result.err(), Some(DefinitionError::MissingId));
    }

    #[test]
    fn builder_rejects_saga_without_steps() {
        let result = SagaBuilder::new().id("empty").build();

        assert_eq!(
            result.err(),
            Some(DefinitionError::NoSteps {
                saga_id: "empty".to_string()
            })
        );
    }

    #[test]
    fn builder_applies_step_options() -> anyhow::Result<()> {
        let saga = SagaBuilder::new()
            .id("options")
            .step(
                "step1",
                returning(json!(1)),
                NoCompensation,
                StepOptions::new()
                    .name("Custom Step Name")
                    .timeout(Duration::from_secs(5))
                    .retry_count(3)
                    .retry_delay(Duration::from_secs(1)),
            )
            .build()?;

        let step = &saga.steps()[0];
        assert_eq!(step.name(), "Custom Step Name");
        assert_eq!(step.timeout(), Some(Duration::from_secs(5)));
        assert_eq!(step.retry_count(), Some(3));
        assert_eq!(step.retry_delay(), Some(Duration::from_secs(1)));
        Ok(())
    }

    #[test]
    fn builder_does_not_check_duplicates_or_dependencies() -> anyhow::Result<()> {
        let saga = SagaBuilder::new()
            .id("deferred")
            .step("a", returning(json!(1)), NoCompensation, StepOptions::new())
            .step(
                "a",
                returning(json!(2)),
                NoCompensation,
                StepOptions::new().depends_on(["ghost"]),
            )
            .build()?;

        assert_eq!(saga.steps().len(), 2);
        Ok(())
    }

    #[test]
    fn builder_defaults_policy_and_merges_metadata() -> anyhow::Result<()> {
        let mut first = Map::new();
        first.insert("owner".to_string(), json!("team-a"));
        let mut second = Map::new();
        second.insert("phase".to_string(), json!(5));

        let saga = SagaBuilder::new()
            .id("meta")
            .step("a", returning(json!(1)), NoCompensation, StepOptions::new())
            .metadata(first)
            .metadata(second)
            .build()?;

        assert!(!saga.continue_on_compensation_failure());
        assert_eq!(saga.compensation_timeout(), DEFAULT_COMPENSATION_TIMEOUT);
        assert_eq!(saga.metadata().get("owner"), Some(&json!("team-a")));
        assert_eq!(saga.metadata().get("phase"), Some(&json!(5)));
        Ok(())
    }

    #[test]
    fn builder_records_policy_overrides() -> anyhow::Result<()> {
        let saga = SagaBuilder::new()
            .id("policy")
            .step("a", returning(json!(1)), NoCompensation, StepOptions::new())
            .continue_on_compensation_failure(true)
            .compensation_timeout(Duration::from_millis(500))
            .on_success(|_record, _ctx| {})
            .on_failure(|_record, _failed, _error| {})
            .build()?;

        assert!(saga.continue_on_compensation_failure());
        assert_eq!(saga.compensation_timeout(), Duration::from_millis(500));
        assert!(saga.on_success.is_some());
        assert!(saga.on_failure.is_some());
        Ok(())
    }
}
