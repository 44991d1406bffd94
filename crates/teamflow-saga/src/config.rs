use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::context::SagaContext;

pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_COMPENSATION_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Executor policy.
///
/// Per-step settings win over `step_timeout`, `retry_count` and
/// `retry_delay`. `compensation_timeout` and
/// `continue_on_compensation_failure` fall back to the saga definition when
/// unset. Snapshots are written only when `persist_state` is on and a state
/// directory is configured.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    step_timeout: Duration,
    compensation_timeout: Option<Duration>,
    retry_count: u32,
    retry_delay: Duration,
    continue_on_compensation_failure: Option<bool>,
    persist_state: bool,
    state_dir: Option<PathBuf>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            step_timeout: DEFAULT_STEP_TIMEOUT,
            compensation_timeout: None,
            retry_count: 0,
            retry_delay: DEFAULT_RETRY_DELAY,
            continue_on_compensation_failure: None,
            persist_state: true,
            state_dir: None,
        }
    }
}

impl ExecutorConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn step_timeout(&self) -> Duration {
        self.step_timeout
    }

    #[must_use]
    pub fn compensation_timeout(&self) -> Option<Duration> {
        self.compensation_timeout
    }

    #[must_use]
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    #[must_use]
    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    #[must_use]
    pub fn continue_on_compensation_failure(&self) -> Option<bool> {
        self.continue_on_compensation_failure
    }

    #[must_use]
    pub fn persist_state(&self) -> bool {
        self.persist_state
    }

    #[must_use]
    pub fn state_dir(&self) -> Option<&Path> {
        self.state_dir.as_deref()
    }

    #[must_use]
    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_compensation_timeout(mut self, timeout: Duration) -> Self {
        self.compensation_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    #[must_use]
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    #[must_use]
    pub fn with_continue_on_compensation_failure(mut self, continue_on_failure: bool) -> Self {
        self.continue_on_compensation_failure = Some(continue_on_failure);
        self
    }

    #[must_use]
    pub fn with_persist_state(mut self, persist: bool) -> Self {
        self.persist_state = persist;
        self
    }

    #[must_use]
    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = Some(dir.into());
        self
    }
}

/// Arguments for [`SagaExecutor::new`](crate::SagaExecutor::new).
#[derive(Debug, Clone, Default)]
pub struct ExecutorOptions {
    pub config: ExecutorConfig,
    pub initial_context: SagaContext,
}

impl ExecutorOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn with_initial_context(mut self, context: SagaContext) -> Self {
        self.initial_context = context;
        self
    }
}
