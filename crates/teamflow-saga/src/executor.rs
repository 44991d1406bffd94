use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::{ExecutorConfig, ExecutorOptions};
use crate::context::{SagaContext, result_key};
use crate::error::{DefinitionError, ExecuteError, StepError, describe};
use crate::event::{SagaEvent, SagaObserver};
use crate::record::{SagaExecutionRecord, SagaStatus, StepExecutionRecord, StepStatus};
use crate::saga::SagaDefinition;
use crate::step::{Compensation, SagaAction, StepContext, StepDefinition};
use crate::store::{FileStateStore, StateStore};

/// A step with its handlers resolved and config fallbacks applied.
pub(crate) struct PreparedStep {
    pub(crate) definition: StepDefinition,
    pub(crate) action: Arc<dyn SagaAction>,
    pub(crate) compensate: Arc<dyn Compensation>,
    timeout: Duration,
    retry_count: u32,
    retry_delay: Duration,
}

impl PreparedStep {
    fn new(step: &StepDefinition, config: &ExecutorConfig) -> Result<Self, DefinitionError> {
        let missing = |handler| DefinitionError::MissingHandler {
            step_id: step.id().to_string(),
            handler,
        };
        let action = step.action().cloned().ok_or_else(|| missing("an action"))?;
        let compensate = step
            .compensation()
            .cloned()
            .ok_or_else(|| missing("a compensate"))?;

        Ok(Self {
            definition: step.clone(),
            action,
            compensate,
            timeout: step.timeout().unwrap_or(config.step_timeout()),
            retry_count: step.retry_count().unwrap_or(config.retry_count()),
            retry_delay: step.retry_delay().unwrap_or(config.retry_delay()),
        })
    }

    pub(crate) fn id(&self) -> &str {
        self.definition.id()
    }
}

/// Runs one saga definition exactly once.
///
/// Steps run sequentially in declaration order. When a step fails for good,
/// every step that succeeded before it is compensated in reverse order. The
/// returned record always describes a terminal run; its `status` tells the
/// outcome.
///
/// All methods take `&self`, so the executor can be shared behind an `Arc`
/// and inspected while `execute()` is in flight.
pub struct SagaExecutor {
    pub(crate) definition: SagaDefinition,
    pub(crate) config: ExecutorConfig,
    pub(crate) steps: Vec<PreparedStep>,
    pub(crate) record: Mutex<SagaExecutionRecord>,
    observers: RwLock<Vec<Arc<dyn SagaObserver>>>,
    store: Option<Arc<dyn StateStore>>,
}

impl SagaExecutor {
    /// Validate `definition` and prepare a pending run.
    ///
    /// # Errors
    ///
    /// Returns a `DefinitionError` for duplicate or empty step ids, missing
    /// handlers, or dependencies on undeclared steps.
    pub fn new(definition: SagaDefinition, options: ExecutorOptions) -> Result<Self, DefinitionError> {
        definition.validate()?;

        let ExecutorOptions {
            config,
            initial_context,
        } = options;

        let steps = definition
            .steps()
            .iter()
            .map(|step| PreparedStep::new(step, &config))
            .collect::<Result<Vec<_>, _>>()?;

        let step_records = definition
            .steps()
            .iter()
            .map(|step| StepExecutionRecord::new(step.id(), step.name()))
            .collect();
        let record = SagaExecutionRecord::new(
            definition.id(),
            definition.name(),
            step_records,
            initial_context,
        );

        let store = config
            .state_dir()
            .map(|dir| Arc::new(FileStateStore::new(dir)) as Arc<dyn StateStore>);

        Ok(Self {
            definition,
            config,
            steps,
            record: Mutex::new(record),
            observers: RwLock::new(Vec::new()),
            store,
        })
    }

    /// Persist snapshots through `store` instead of the configured state directory.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn saga_id(&self) -> &str {
        self.definition.id()
    }

    #[must_use]
    pub fn definition(&self) -> &SagaDefinition {
        &self.definition
    }

    #[must_use]
    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Snapshot of the execution record.
    #[must_use]
    pub fn status(&self) -> SagaExecutionRecord {
        self.record.lock().clone()
    }

    /// Snapshot of one step's record.
    #[must_use]
    pub fn step_status(&self, step_id: &str) -> Option<StepExecutionRecord> {
        self.record.lock().step(step_id).cloned()
    }

    /// Snapshot of the shared context.
    #[must_use]
    pub fn context(&self) -> SagaContext {
        self.record.lock().context.clone()
    }

    /// Shallow-merge `partial` into the shared context.
    ///
    /// Steps see the change from the next step on; a running step keeps the
    /// snapshot it was started with.
    ///
    /// # Errors
    ///
    /// Returns `ExecuteError::Finished` once the saga has succeeded or been
    /// compensated. The context is left untouched.
    pub fn update_context(&self, partial: Map<String, Value>) -> Result<(), ExecuteError> {
        let mut record = self.record.lock();
        if record.status.is_terminal() {
            warn!(
                saga_id = %record.saga_id,
                status = %record.status,
                "ignoring context update on finished saga"
            );
            return Err(ExecuteError::Finished {
                saga_id: record.saga_id.clone(),
                status: record.status,
            });
        }
        record.context.merge(partial);
        Ok(())
    }

    /// Register an observer for every later event.
    pub fn add_observer(&self, observer: Arc<dyn SagaObserver>) {
        self.observers.write().push(observer);
    }

    /// Receive every later event on an unbounded channel.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SagaEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.add_observer(Arc::new(tx));
        rx
    }

    /// Run the saga.
    ///
    /// # Errors
    ///
    /// Returns `ExecuteError::AlreadyExecuted` if this executor has already
    /// been started. Step and compensation failures are not errors here;
    /// they are reported in the returned record.
    pub async fn execute(&self) -> Result<SagaExecutionRecord, ExecuteError> {
        let started = {
            let mut record = self.record.lock();
            if record.status != SagaStatus::Pending {
                return Err(ExecuteError::AlreadyExecuted {
                    saga_id: record.saga_id.clone(),
                    status: record.status,
                });
            }
            record.advance(SagaStatus::Running);
            record.start_time = Some(Utc::now());
            record.clone()
        };

        info!(
            saga_id = %self.saga_id(),
            steps = self.steps.len(),
            "starting saga"
        );
        self.emit(SagaEvent::Started {
            record: Box::new(started),
        });

        match self.run_forward().await {
            Ok(()) => self.finish_succeeded(),
            Err(cause) => {
                self.finish_failed(&cause);
                self.compensate(cause).await;
            }
        }

        self.persist();
        Ok(self.status())
    }

    async fn run_forward(&self) -> Result<(), StepError> {
        for (index, step) in self.steps.iter().enumerate() {
            self.run_step(index, step).await?;
        }
        Ok(())
    }

    async fn run_step(&self, index: usize, step: &PreparedStep) -> Result<(), StepError> {
        let started = {
            let mut record = self.record.lock();
            let step_record = record.step_mut(index);
            step_record.record_start();
            step_record.clone()
        };
        debug!(saga_id = %self.saga_id(), step_id = %step.id(), "starting step");
        self.emit(SagaEvent::StepStarted {
            step_id: step.id().to_string(),
            record: started,
        });

        let ctx = {
            let record = self.record.lock();
            if let Some(error) = unmet_dependency(&record, &step.definition) {
                drop(record);
                return Err(self.fail_step(index, error, 0));
            }
            self.step_context(&record, &step.definition)
        };

        let max_attempts = step.retry_count.saturating_add(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.attempt(step, ctx.clone()).await {
                Ok(output) => {
                    self.succeed_step(index, output, attempt - 1);
                    return Ok(());
                }
                Err(error) if error.is_retryable() && attempt < max_attempts => {
                    warn!(
                        saga_id = %self.saga_id(),
                        step_id = %step.id(),
                        attempt,
                        max_retries = step.retry_count,
                        error = %error,
                        "step attempt failed, retrying"
                    );
                    self.emit(SagaEvent::StepRetry {
                        step_id: step.id().to_string(),
                        attempt,
                        max_retries: step.retry_count,
                        error,
                    });
                    tokio::time::sleep(step.retry_delay).await;
                }
                Err(error) => return Err(self.fail_step(index, error, attempt)),
            }
        }
    }

    /// One attempt, raced against the step timeout. Panics become errors.
    async fn attempt(&self, step: &PreparedStep, ctx: StepContext) -> Result<Value, StepError> {
        let run = AssertUnwindSafe(step.action.execute(ctx)).catch_unwind();

        match tokio::time::timeout(step.timeout, run).await {
            Ok(Ok(Ok(output))) => Ok(output),
            Ok(Ok(Err(e))) => Err(StepError::Execution {
                step_id: step.id().to_string(),
                message: describe(&*e),
            }),
            Ok(Err(payload)) => Err(StepError::Panicked {
                step_id: step.id().to_string(),
                message: panic_message(payload.as_ref()),
            }),
            Err(_) => {
                warn!(
                    saga_id = %self.saga_id(),
                    step_id = %step.id(),
                    timeout_ms = as_millis(step.timeout),
                    "step attempt timed out"
                );
                Err(StepError::Timeout {
                    step_id: step.id().to_string(),
                    timeout_ms: as_millis(step.timeout),
                })
            }
        }
    }

    fn succeed_step(&self, index: usize, output: Value, retry_attempts: u32) {
        let (step_id, finished) = {
            let mut record = self.record.lock();
            let step_record = record.step_mut(index);
            step_record.record_success(output.clone(), retry_attempts);
            let finished = step_record.clone();
            let step_id = finished.step_id.clone();
            record.context.insert(result_key(&step_id), output.clone());
            (step_id, finished)
        };

        debug!(
            saga_id = %self.saga_id(),
            step_id = %step_id,
            retry_attempts,
            "step succeeded"
        );
        self.emit(SagaEvent::StepSucceeded {
            step_id,
            output,
            record: finished,
        });
    }

    fn fail_step(&self, index: usize, error: StepError, attempts: u32) -> StepError {
        let finished = {
            let mut record = self.record.lock();
            let step_record = record.step_mut(index);
            step_record.record_failure(error.clone(), attempts);
            step_record.clone()
        };

        error!(
            saga_id = %self.saga_id(),
            step_id = %error.step_id(),
            attempts,
            error = %error,
            "step failed"
        );
        self.emit(SagaEvent::StepFailed {
            step_id: finished.step_id.clone(),
            error: error.clone(),
            record: finished,
        });
        error
    }

    fn finish_succeeded(&self) {
        let record = {
            let mut record = self.record.lock();
            record.advance(SagaStatus::Succeeded);
            record.clone()
        };

        info!(saga_id = %self.saga_id(), "saga succeeded");
        self.emit(SagaEvent::Succeeded {
            record: Box::new(record.clone()),
        });

        if let Some(on_success) = &self.definition.on_success {
            on_success(&record, &record.context);
        }
    }

    fn finish_failed(&self, cause: &StepError) {
        if matches!(cause, StepError::Panicked { .. }) {
            self.emit(SagaEvent::Error {
                error: cause.clone(),
                record: Box::new(self.status()),
            });
        }

        let record = {
            let mut record = self.record.lock();
            record.failed_step_id = Some(cause.step_id().to_string());
            record.error = Some(cause.clone());
            record.advance(SagaStatus::Failed);
            record.clone()
        };

        error!(
            saga_id = %self.saga_id(),
            failed_step_id = %cause.step_id(),
            error = %cause,
            "saga failed"
        );
        self.emit(SagaEvent::Failed {
            record: Box::new(record),
        });
    }

    /// Context handed to a step: the current shared context plus outputs of
    /// every step that produced one.
    pub(crate) fn step_context(
        &self,
        record: &SagaExecutionRecord,
        step: &StepDefinition,
    ) -> StepContext {
        let previous_results: HashMap<String, Value> = record
            .step_records
            .iter()
            .filter_map(|r| r.output.clone().map(|output| (r.step_id.clone(), output)))
            .collect();

        StepContext::new(
            self.saga_id(),
            step,
            record.context.clone(),
            previous_results,
        )
    }

    pub(crate) fn emit(&self, event: SagaEvent) {
        let observers = self.observers.read().clone();
        for observer in &observers {
            observer.on_event(&event);
        }
    }

    fn persist(&self) {
        if !self.config.persist_state() {
            return;
        }
        let Some(store) = &self.store else {
            return;
        };

        let record = self.status();
        match store.save(&record) {
            Ok(()) => debug!(saga_id = %record.saga_id, "saga state persisted"),
            Err(e) => warn!(
                saga_id = %record.saga_id,
                error = %describe(&e),
                "failed to persist saga state"
            ),
        }
    }
}

fn unmet_dependency(record: &SagaExecutionRecord, step: &StepDefinition) -> Option<StepError> {
    step.depends_on()
        .iter()
        .find(|dependency| {
            record
                .step(dependency)
                .is_none_or(|r| r.status != StepStatus::Succeeded)
        })
        .map(|dependency| StepError::DependencyUnmet {
            step_id: step.id().to_string(),
            dependency: dependency.clone(),
        })
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

pub(crate) fn as_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::builder::SagaBuilder;
    use crate::error::BoxError;
    use crate::step::{NoCompensation, StepOptions, action_fn};

    fn constant(value: Value) -> impl SagaAction {
        action_fn(move |_ctx: StepContext| {
            let value = value.clone();
            async move { Ok::<_, BoxError>(value) }
        })
    }

    fn single_step_saga() -> SagaDefinition {
        SagaBuilder::new()
            .id("unit")
            .step("only", constant(json!(7)), NoCompensation, StepOptions::new())
            .build()
            .expect("valid saga")
    }

    #[test]
    fn step_settings_override_config() -> anyhow::Result<()> {
        let config = ExecutorConfig::new()
            .with_step_timeout(Duration::from_secs(9))
            .with_retry_count(5)
            .with_retry_delay(Duration::from_secs(2));
        let saga = SagaBuilder::new()
            .id("precedence")
            .step(
                "custom",
                constant(json!(1)),
                NoCompensation,
                StepOptions::new()
                    .timeout(Duration::from_millis(50))
                    .retry_count(1),
            )
            .step("inherits", constant(json!(2)), NoCompensation, StepOptions::new())
            .build()?;

        let executor = SagaExecutor::new(saga, ExecutorOptions::new().with_config(config))?;

        let custom = &executor.steps[0];
        assert_eq!(custom.timeout, Duration::from_millis(50));
        assert_eq!(custom.retry_count, 1);
        assert_eq!(custom.retry_delay, Duration::from_secs(2));
        let inherits = &executor.steps[1];
        assert_eq!(inherits.timeout, Duration::from_secs(9));
        assert_eq!(inherits.retry_count, 5);
        Ok(())
    }

    #[test]
    fn new_executor_is_pending_with_initial_context() -> anyhow::Result<()> {
        let context: SagaContext = [("user", json!("alice"))].into_iter().collect();
        let executor = SagaExecutor::new(
            single_step_saga(),
            ExecutorOptions::new().with_initial_context(context),
        )?;

        let status = executor.status();
        assert_eq!(status.status, SagaStatus::Pending);
        assert!(status.start_time.is_none());
        assert_eq!(executor.context().get("user"), Some(&json!("alice")));
        assert_eq!(
            executor.step_status("only").map(|r| r.status),
            Some(StepStatus::Pending)
        );
        Ok(())
    }

    #[test]
    fn update_context_merges_shallowly() -> anyhow::Result<()> {
        let executor = SagaExecutor::new(single_step_saga(), ExecutorOptions::new())?;
        let mut partial = Map::new();
        partial.insert("region".to_string(), json!("eu"));

        executor.update_context(partial)?;

        assert_eq!(executor.context().get("region"), Some(&json!("eu")));
        Ok(())
    }

    #[tokio::test]
    async fn finished_record_rejects_context_updates() -> anyhow::Result<()> {
        let executor = SagaExecutor::new(single_step_saga(), ExecutorOptions::new())?;
        let terminal = executor.execute().await?;
        let mut partial = Map::new();
        partial.insert("onlyResult".to_string(), json!("tampered"));

        let result = executor.update_context(partial);

        assert_eq!(
            result,
            Err(ExecuteError::Finished {
                saga_id: "unit".to_string(),
                status: SagaStatus::Succeeded,
            })
        );
        assert_eq!(executor.context().get("onlyResult"), Some(&json!(7)));
        assert_eq!(executor.status().context, terminal.context);
        Ok(())
    }

    #[test]
    fn missing_action_is_rejected_at_construction() -> anyhow::Result<()> {
        let saga = SagaBuilder::new()
            .id("handlers")
            .push_step(StepDefinition::new("a").with_compensation(NoCompensation))
            .build()?;

        let result = SagaExecutor::new(saga, ExecutorOptions::new());

        assert_eq!(
            result.err(),
            Some(DefinitionError::MissingHandler {
                step_id: "a".to_string(),
                handler: "an action",
            })
        );
        Ok(())
    }

    #[test]
    fn missing_compensation_is_rejected_at_construction() -> anyhow::Result<()> {
        let saga = SagaBuilder::new()
            .id("handlers")
            .push_step(StepDefinition::new("a").with_action(constant(json!(1))))
            .build()?;

        let result = SagaExecutor::new(saga, ExecutorOptions::new());

        assert!(matches!(
            result,
            Err(DefinitionError::MissingHandler {
                handler: "a compensate",
                ..
            })
        ));
        Ok(())
    }

    #[test]
    fn invalid_graph_is_rejected_at_construction() -> anyhow::Result<()> {
        let saga = SagaBuilder::new()
            .id("graph")
            .step(
                "a",
                constant(json!(1)),
                NoCompensation,
                StepOptions::new().depends_on(["missing"]),
            )
            .build()?;

        let result = SagaExecutor::new(saga, ExecutorOptions::new());

        assert!(matches!(
            result,
            Err(DefinitionError::UnknownDependency { .. })
        ));
        Ok(())
    }

    #[test]
    fn panic_message_handles_common_payloads() {
        let literal: Box<dyn Any + Send> = Box::new("static");
        let owned: Box<dyn Any + Send> = Box::new(String::from("owned"));
        let other: Box<dyn Any + Send> = Box::new(42_u8);

        assert_eq!(panic_message(literal.as_ref()), "static");
        assert_eq!(panic_message(owned.as_ref()), "owned");
        assert_eq!(panic_message(other.as_ref()), "unknown panic payload");
    }

    #[tokio::test]
    async fn second_execute_is_rejected() -> anyhow::Result<()> {
        let executor = SagaExecutor::new(single_step_saga(), ExecutorOptions::new())?;

        let record = executor.execute().await?;
        let again = executor.execute().await;

        assert_eq!(record.status, SagaStatus::Succeeded);
        assert_eq!(
            again.err(),
            Some(ExecuteError::AlreadyExecuted {
                saga_id: "unit".to_string(),
                status: SagaStatus::Succeeded,
            })
        );
        Ok(())
    }
}
