use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use serde_json::Value;
use tracing::{debug, error, info};

use crate::error::{CompensationError, StepError, describe};
use crate::event::{CompensationOutcome, SagaEvent};
use crate::executor::{PreparedStep, SagaExecutor, as_millis, panic_message};
use crate::record::{SagaStatus, StepStatus};
use crate::step::StepContext;

impl SagaExecutor {
    /// Roll back every succeeded step, newest first, then finish the saga as
    /// `compensated`.
    pub(crate) async fn compensate(&self, cause: StepError) {
        let timeout = self
            .config
            .compensation_timeout()
            .unwrap_or(self.definition.compensation_timeout());
        let continue_on_failure = self
            .config
            .continue_on_compensation_failure()
            .unwrap_or(self.definition.continue_on_compensation_failure());

        let (snapshot, to_compensate) = {
            let mut record = self.record.lock();
            record.advance(SagaStatus::Compensating);
            let succeeded: Vec<usize> = record
                .step_records
                .iter()
                .enumerate()
                .filter(|(_, r)| r.status == StepStatus::Succeeded)
                .map(|(index, _)| index)
                .collect();
            (record.clone(), succeeded)
        };

        info!(
            saga_id = %self.saga_id(),
            steps = to_compensate.len(),
            "compensating saga"
        );
        self.emit(SagaEvent::Compensating {
            record: Box::new(snapshot),
        });

        let mut outcomes = Vec::with_capacity(to_compensate.len());
        for index in to_compensate.into_iter().rev() {
            let outcome = self.compensate_step(index, &cause, timeout).await;
            let failed = outcome.result.is_err();
            outcomes.push(outcome);

            if failed && !continue_on_failure {
                break;
            }
        }

        let record = {
            let mut record = self.record.lock();
            record.advance(SagaStatus::Compensated);
            record.clone()
        };

        info!(
            saga_id = %self.saga_id(),
            failed_step_id = record.failed_step_id.as_deref().unwrap_or_default(),
            "saga compensated"
        );
        self.emit(SagaEvent::Compensated {
            record: Box::new(record.clone()),
            outcomes,
        });

        if let Some(on_failure) = &self.definition.on_failure {
            on_failure(
                &record,
                record.failed_step_id.as_deref(),
                record.error.as_ref(),
            );
        }
    }

    async fn compensate_step(
        &self,
        index: usize,
        cause: &StepError,
        timeout: Duration,
    ) -> CompensationOutcome {
        let step = &self.steps[index];

        let (started, ctx, output) = {
            let mut record = self.record.lock();
            let ctx = self.step_context(&record, &step.definition);
            let step_record = record.step_mut(index);
            step_record.record_compensation_start();
            let output = step_record.output.clone().unwrap_or(Value::Null);
            (step_record.clone(), ctx, output)
        };

        debug!(saga_id = %self.saga_id(), step_id = %step.id(), "compensating step");
        self.emit(SagaEvent::CompensatingStep {
            step_id: step.id().to_string(),
            record: started,
        });

        let result = run_compensation(step, ctx, output, cause.clone(), timeout).await;

        let finished = {
            let mut record = self.record.lock();
            let step_record = record.step_mut(index);
            match &result {
                Ok(value) => step_record.record_compensated(value.clone()),
                Err(e) => step_record.record_compensation_failed(e.clone()),
            }
            step_record.clone()
        };

        match &result {
            Ok(value) => {
                debug!(saga_id = %self.saga_id(), step_id = %step.id(), "step compensated");
                self.emit(SagaEvent::StepCompensated {
                    step_id: step.id().to_string(),
                    result: value.clone(),
                    record: finished,
                });
            }
            Err(e) => {
                error!(
                    saga_id = %self.saga_id(),
                    step_id = %step.id(),
                    error = %e,
                    "compensation failed"
                );
                self.emit(SagaEvent::CompensationFailed {
                    step_id: step.id().to_string(),
                    error: e.clone(),
                    record: finished,
                });
            }
        }

        CompensationOutcome {
            step_id: step.id().to_string(),
            result,
        }
    }
}

async fn run_compensation(
    step: &PreparedStep,
    ctx: StepContext,
    output: Value,
    cause: StepError,
    timeout: Duration,
) -> Result<Value, CompensationError> {
    let run = AssertUnwindSafe(step.compensate.compensate(ctx, output, cause)).catch_unwind();

    match tokio::time::timeout(timeout, run).await {
        Ok(Ok(Ok(value))) => Ok(value),
        Ok(Ok(Err(e))) => Err(CompensationError::Failed {
            step_id: step.id().to_string(),
            message: describe(&*e),
        }),
        Ok(Err(payload)) => Err(CompensationError::Failed {
            step_id: step.id().to_string(),
            message: format!("panicked: {}", panic_message(payload.as_ref())),
        }),
        Err(_) => Err(CompensationError::Timeout {
            step_id: step.id().to_string(),
            timeout_ms: as_millis(timeout),
        }),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::builder::SagaBuilder;
    use crate::config::{ExecutorConfig, ExecutorOptions};
    use crate::error::BoxError;
    use crate::step::{StepOptions, action_fn, compensation_fn};

    #[tokio::test(start_paused = true)]
    async fn config_overrides_definition_compensation_policy() -> anyhow::Result<()> {
        let saga = SagaBuilder::new()
            .id("policy")
            .step(
                "slow-undo",
                action_fn(|_ctx: StepContext| async { Ok::<_, BoxError>(json!(1)) }),
                compensation_fn(|_ctx, _output, _cause| async {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok::<_, BoxError>(json!("undone"))
                }),
                StepOptions::new(),
            )
            .step(
                "fails",
                action_fn(|_ctx: StepContext| async { Err::<Value, BoxError>("boom".into()) }),
                compensation_fn(|_ctx, _output, _cause| async { Ok::<_, BoxError>(Value::Null) }),
                StepOptions::new(),
            )
            .compensation_timeout(Duration::from_secs(5))
            .build()?;
        let config = ExecutorConfig::new().with_compensation_timeout(Duration::from_millis(50));

        let executor = SagaExecutor::new(saga, ExecutorOptions::new().with_config(config))?;
        let record = executor.execute().await?;

        let undo = record.step("slow-undo").map(|r| r.compensation_error.clone());
        assert_eq!(
            undo,
            Some(Some(CompensationError::Timeout {
                step_id: "slow-undo".to_string(),
                timeout_ms: 50,
            }))
        );
        assert_eq!(record.status, SagaStatus::Compensated);
        Ok(())
    }

    fn explode() -> Result<Value, BoxError> {
        panic!("undo exploded")
    }

    #[tokio::test]
    async fn compensation_panic_is_recorded_as_failure() -> anyhow::Result<()> {
        let saga = SagaBuilder::new()
            .id("panicky-undo")
            .step(
                "a",
                action_fn(|_ctx: StepContext| async { Ok::<_, BoxError>(json!(1)) }),
                compensation_fn(|_ctx, _output, _cause| async { explode() }),
                StepOptions::new(),
            )
            .step(
                "b",
                action_fn(|_ctx: StepContext| async { Err::<Value, BoxError>("boom".into()) }),
                compensation_fn(|_ctx, _output, _cause| async { Ok::<_, BoxError>(Value::Null) }),
                StepOptions::new(),
            )
            .build()?;

        let executor = SagaExecutor::new(saga, ExecutorOptions::new())?;
        let record = executor.execute().await?;

        let step = record.step("a").map(|r| (r.status, r.compensation_error.clone()));
        assert_eq!(
            step,
            Some((
                StepStatus::CompensationFailed,
                Some(CompensationError::Failed {
                    step_id: "a".to_string(),
                    message: "panicked: undo exploded".to_string(),
                })
            ))
        );
        Ok(())
    }
}
