use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

use crate::context::SagaContext;
use crate::error::{BoxError, StepError};

/// Forward action of a saga step.
///
/// Receives a snapshot of the saga context and returns the step output. The
/// executor may drop the returned future when the step timeout expires, so
/// work that must not be interrupted halfway should not be split across
/// `.await` points without its own cleanup.
#[async_trait]
pub trait SagaAction: Send + Sync {
    /// Run the action.
    ///
    /// # Errors
    ///
    /// Returns an error if the action fails; the executor may retry it.
    async fn execute(&self, ctx: StepContext) -> Result<Value, BoxError>;
}

/// Compensating action that undoes a succeeded step.
#[async_trait]
pub trait Compensation: Send + Sync {
    /// Undo the step's effects.
    ///
    /// `output` is what the step's action returned; `cause` is the error that
    /// triggered the rollback.
    ///
    /// # Errors
    ///
    /// Returns an error if compensation fails. The step is then recorded as
    /// `compensation_failed`.
    async fn compensate(
        &self,
        ctx: StepContext,
        output: Value,
        cause: StepError,
    ) -> Result<Value, BoxError>;
}

/// Adapter turning an async closure into a [`SagaAction`].
pub struct ActionFn<F>(F);

/// Wrap `f` as a [`SagaAction`].
pub fn action_fn<F, Fut>(f: F) -> ActionFn<F>
where
    F: Fn(StepContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, BoxError>> + Send + 'static,
{
    ActionFn(f)
}

#[async_trait]
impl<F, Fut> SagaAction for ActionFn<F>
where
    F: Fn(StepContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, BoxError>> + Send + 'static,
{
    async fn execute(&self, ctx: StepContext) -> Result<Value, BoxError> {
        (self.0)(ctx).await
    }
}

/// Adapter turning an async closure into a [`Compensation`].
pub struct CompensationFn<F>(F);

/// Wrap `f` as a [`Compensation`].
pub fn compensation_fn<F, Fut>(f: F) -> CompensationFn<F>
where
    F: Fn(StepContext, Value, StepError) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, BoxError>> + Send + 'static,
{
    CompensationFn(f)
}

#[async_trait]
impl<F, Fut> Compensation for CompensationFn<F>
where
    F: Fn(StepContext, Value, StepError) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, BoxError>> + Send + 'static,
{
    async fn compensate(
        &self,
        ctx: StepContext,
        output: Value,
        cause: StepError,
    ) -> Result<Value, BoxError> {
        (self.0)(ctx, output, cause).await
    }
}

/// Compensation for read-only steps: does nothing and succeeds.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCompensation;

#[async_trait]
impl Compensation for NoCompensation {
    async fn compensate(
        &self,
        _ctx: StepContext,
        _output: Value,
        _cause: StepError,
    ) -> Result<Value, BoxError> {
        Ok(Value::Null)
    }
}

/// Compensation that logs before and after delegating to `inner`.
pub struct LoggedCompensation<C> {
    label: String,
    inner: C,
}

impl<C: Compensation> LoggedCompensation<C> {
    pub fn new(label: impl Into<String>, inner: C) -> Self {
        Self {
            label: label.into(),
            inner,
        }
    }
}

#[async_trait]
impl<C: Compensation> Compensation for LoggedCompensation<C> {
    async fn compensate(
        &self,
        ctx: StepContext,
        output: Value,
        cause: StepError,
    ) -> Result<Value, BoxError> {
        info!(label = %self.label, step_id = %ctx.step_id(), "rolling back");
        let result = self.inner.compensate(ctx, output, cause).await?;
        info!(label = %self.label, "rolled back");
        Ok(result)
    }
}

/// View of the saga handed to a step's action or compensation.
#[derive(Debug, Clone)]
pub struct StepContext {
    saga_id: String,
    step_id: String,
    step_name: String,
    context: SagaContext,
    previous_results: HashMap<String, Value>,
}

impl StepContext {
    pub(crate) fn new(
        saga_id: &str,
        step: &StepDefinition,
        context: SagaContext,
        previous_results: HashMap<String, Value>,
    ) -> Self {
        Self {
            saga_id: saga_id.to_string(),
            step_id: step.id().to_string(),
            step_name: step.name().to_string(),
            context,
            previous_results,
        }
    }

    #[must_use]
    pub fn saga_id(&self) -> &str {
        &self.saga_id
    }

    #[must_use]
    pub fn step_id(&self) -> &str {
        &self.step_id
    }

    #[must_use]
    pub fn step_name(&self) -> &str {
        &self.step_name
    }

    /// Saga context as of the moment this step started.
    #[must_use]
    pub fn context(&self) -> &SagaContext {
        &self.context
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.context.get(key)
    }

    /// Output recorded by an earlier step.
    #[must_use]
    pub fn previous_step_result(&self, step_id: &str) -> Option<&Value> {
        self.previous_results.get(step_id)
    }
}

/// Optional per-step settings accepted by [`SagaBuilder::step`](crate::SagaBuilder::step).
#[derive(Debug, Clone, Default)]
pub struct StepOptions {
    name: Option<String>,
    timeout: Option<Duration>,
    retry_count: Option<u32>,
    retry_delay: Option<Duration>,
    depends_on: Vec<String>,
}

impl StepOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = Some(retry_count);
        self
    }

    #[must_use]
    pub fn retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = Some(retry_delay);
        self
    }

    #[must_use]
    pub fn depends_on<I, S>(mut self, step_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(step_ids.into_iter().map(Into::into));
        self
    }
}

/// One step of a saga: a forward action paired with its compensation.
///
/// Handlers are optional here so that definitions can be assembled piece by
/// piece; the executor rejects a step missing either one.
#[derive(Clone)]
pub struct StepDefinition {
    id: String,
    name: String,
    action: Option<Arc<dyn SagaAction>>,
    compensate: Option<Arc<dyn Compensation>>,
    timeout: Option<Duration>,
    retry_count: Option<u32>,
    retry_delay: Option<Duration>,
    depends_on: Vec<String>,
}

impl StepDefinition {
    /// Step with the given id, displayed under the same name.
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            action: None,
            compensate: None,
            timeout: None,
            retry_count: None,
            retry_delay: None,
            depends_on: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_action(mut self, action: impl SagaAction + 'static) -> Self {
        self.action = Some(Arc::new(action));
        self
    }

    #[must_use]
    pub fn with_compensation(mut self, compensate: impl Compensation + 'static) -> Self {
        self.compensate = Some(Arc::new(compensate));
        self
    }

    #[must_use]
    pub fn with_options(mut self, options: StepOptions) -> Self {
        if let Some(name) = options.name {
            self.name = name;
        }
        self.timeout = options.timeout;
        self.retry_count = options.retry_count;
        self.retry_delay = options.retry_delay;
        self.depends_on = options.depends_on;
        self
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn action(&self) -> Option<&Arc<dyn SagaAction>> {
        self.action.as_ref()
    }

    #[must_use]
    pub fn compensation(&self) -> Option<&Arc<dyn Compensation>> {
        self.compensate.as_ref()
    }

    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    #[must_use]
    pub fn retry_count(&self) -> Option<u32> {
        self.retry_count
    }

    #[must_use]
    pub fn retry_delay(&self) -> Option<Duration> {
        self.retry_delay
    }

    #[must_use]
    pub fn depends_on(&self) -> &[String] {
        &self.depends_on
    }
}

impl fmt::Debug for StepDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepDefinition")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("has_action", &self.action.is_some())
            .field("has_compensation", &self.compensate.is_some())
            .field("timeout", &self.timeout)
            .field("retry_count", &self.retry_count)
            .field("retry_delay", &self.retry_delay)
            .field("depends_on", &self.depends_on)
            .finish()
    }
}
