use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};

use crate::context::SagaContext;
use crate::error::{DefinitionError, StepError};
use crate::record::SagaExecutionRecord;
use crate::step::StepDefinition;

/// Called once when every step succeeded.
pub type SuccessCallback = Arc<dyn Fn(&SagaExecutionRecord, &SagaContext) + Send + Sync>;

/// Called once after compensation finished, with the failed step id and its error.
pub type FailureCallback =
    Arc<dyn Fn(&SagaExecutionRecord, Option<&str>, Option<&StepError>) + Send + Sync>;

/// A built saga: an ordered list of steps plus rollback policy.
///
/// Immutable once built. Cheap to clone; handlers and callbacks are shared.
#[derive(Clone)]
pub struct SagaDefinition {
    pub(crate) id: String,
    pub(crate) name: Option<String>,
    pub(crate) steps: Vec<StepDefinition>,
    pub(crate) on_success: Option<SuccessCallback>,
    pub(crate) on_failure: Option<FailureCallback>,
    pub(crate) continue_on_compensation_failure: bool,
    pub(crate) compensation_timeout: Duration,
    pub(crate) metadata: Map<String, Value>,
}

impl SagaDefinition {
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    #[must_use]
    pub fn steps(&self) -> &[StepDefinition] {
        &self.steps
    }

    #[must_use]
    pub fn step(&self, step_id: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.id() == step_id)
    }

    #[must_use]
    pub fn continue_on_compensation_failure(&self) -> bool {
        self.continue_on_compensation_failure
    }

    #[must_use]
    pub fn compensation_timeout(&self) -> Duration {
        self.compensation_timeout
    }

    #[must_use]
    pub fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }

    /// Graph checks deferred from `build()`: step ids present and unique,
    /// every dependency declared. Handlers are resolved when the executor
    /// prepares its steps.
    pub(crate) fn validate(&self) -> Result<(), DefinitionError> {
        if self.id.is_empty() {
            return Err(DefinitionError::MissingId);
        }
        if self.steps.is_empty() {
            return Err(DefinitionError::NoSteps {
                saga_id: self.id.clone(),
            });
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            if step.id().is_empty() {
                return Err(DefinitionError::MissingStepId {
                    saga_id: self.id.clone(),
                });
            }
            if !seen.insert(step.id()) {
                return Err(DefinitionError::DuplicateStepId {
                    step_id: step.id().to_string(),
                });
            }
        }

        for step in &self.steps {
            if let Some(dependency) = step.depends_on().iter().find(|d| !seen.contains(d.as_str()))
            {
                return Err(DefinitionError::UnknownDependency {
                    step_id: step.id().to_string(),
                    dependency: dependency.clone(),
                });
            }
        }

        Ok(())
    }
}

impl fmt::Debug for SagaDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SagaDefinition")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("steps", &self.steps)
            .field("has_on_success", &self.on_success.is_some())
            .field("has_on_failure", &self.on_failure.is_some())
            .field(
                "continue_on_compensation_failure",
                &self.continue_on_compensation_failure,
            )
            .field("compensation_timeout", &self.compensation_timeout)
            .field("metadata", &self.metadata)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::builder::SagaBuilder;
    use crate::error::BoxError;
    use crate::step::{NoCompensation, StepContext, StepOptions, action_fn};

    fn noop_step(id: &str) -> StepDefinition {
        StepDefinition::new(id)
            .with_action(action_fn(|_ctx: StepContext| async {
                Ok::<_, BoxError>(json!(null))
            }))
            .with_compensation(NoCompensation)
    }

    fn saga_with(steps: Vec<StepDefinition>) -> Result<SagaDefinition, DefinitionError> {
        steps
            .into_iter()
            .fold(SagaBuilder::new().id("saga"), SagaBuilder::push_step)
            .build()
    }

    #[test]
    fn valid_definition_passes() -> anyhow::Result<()> {
        let saga = saga_with(vec![
            noop_step("a"),
            noop_step("b").with_options(StepOptions::new().depends_on(["a"])),
        ])?;

        assert_eq!(saga.validate(), Ok(()));
        Ok(())
    }

    #[test]
    fn duplicate_step_id_is_rejected() -> anyhow::Result<()> {
        let saga = saga_with(vec![noop_step("a"), noop_step("a")])?;

        assert_eq!(
            saga.validate(),
            Err(DefinitionError::DuplicateStepId {
                step_id: "a".to_string()
            })
        );
        Ok(())
    }

    #[test]
    fn empty_step_id_is_rejected() -> anyhow::Result<()> {
        let saga = saga_with(vec![noop_step("")])?;

        assert!(matches!(
            saga.validate(),
            Err(DefinitionError::MissingStepId { .. })
        ));
        Ok(())
    }

    #[test]
    fn unknown_dependency_is_rejected_even_when_declared_later() -> anyhow::Result<()> {
        let saga = saga_with(vec![
            noop_step("a").with_options(StepOptions::new().depends_on(["b"])),
            noop_step("b").with_options(StepOptions::new().depends_on(["ghost"])),
        ])?;

        assert_eq!(
            saga.validate(),
            Err(DefinitionError::UnknownDependency {
                step_id: "b".to_string(),
                dependency: "ghost".to_string(),
            })
        );
        Ok(())
    }
}
