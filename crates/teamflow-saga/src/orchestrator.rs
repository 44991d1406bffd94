use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::config::{ExecutorConfig, ExecutorOptions};
use crate::context::SagaContext;
use crate::error::OrchestratorError;
use crate::event::{SagaEvent, SagaObserver};
use crate::executor::SagaExecutor;
use crate::record::{SagaExecutionRecord, SagaStatus};
use crate::saga::SagaDefinition;

const DEFAULT_EVENT_CAPACITY: usize = 256;

/// An executor event tagged with the saga it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorEvent {
    pub saga_id: String,
    pub event: SagaEvent,
}

/// Registry of saga definitions that runs them by id.
///
/// Each `execute` call gets a fresh executor, so the same definition can run
/// many times and several sagas can run concurrently. The executor of the
/// latest run of each id stays reachable through [`Self::executor`], both
/// while it runs and after it finishes.
pub struct SagaOrchestrator {
    sagas: RwLock<IndexMap<String, SagaDefinition>>,
    executors: RwLock<IndexMap<String, Arc<SagaExecutor>>>,
    events: broadcast::Sender<OrchestratorEvent>,
}

impl Default for SagaOrchestrator {
    fn default() -> Self {
        Self::with_event_capacity(DEFAULT_EVENT_CAPACITY)
    }
}

impl SagaOrchestrator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Orchestrator whose event channel buffers `capacity` events per
    /// subscriber before lagging receivers start missing them.
    #[must_use]
    pub fn with_event_capacity(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            sagas: RwLock::new(IndexMap::new()),
            executors: RwLock::new(IndexMap::new()),
            events,
        }
    }

    /// Register `definition` under its id, replacing any earlier definition.
    pub fn register(&self, definition: SagaDefinition) {
        let saga_id = definition.id().to_string();
        debug!(saga_id = %saga_id, "registering saga");
        self.sagas.write().insert(saga_id, definition);
    }

    /// Ids of registered sagas in registration order.
    #[must_use]
    pub fn registered(&self) -> Vec<String> {
        self.sagas.read().keys().cloned().collect()
    }

    #[must_use]
    pub fn definition(&self, saga_id: &str) -> Option<SagaDefinition> {
        self.sagas.read().get(saga_id).cloned()
    }

    /// Receive events of every saga started after this call.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.events.subscribe()
    }

    /// Run the saga registered under `saga_id`.
    ///
    /// # Errors
    ///
    /// Returns `OrchestratorError::SagaNotFound` for an unregistered id and
    /// `OrchestratorError::Definition` if the definition fails validation.
    pub async fn execute(
        &self,
        saga_id: &str,
        initial_context: SagaContext,
        config: ExecutorConfig,
    ) -> Result<SagaExecutionRecord, OrchestratorError> {
        let definition =
            self.definition(saga_id)
                .ok_or_else(|| OrchestratorError::SagaNotFound {
                    saga_id: saga_id.to_string(),
                })?;

        let options = ExecutorOptions {
            config,
            initial_context,
        };
        let executor = Arc::new(SagaExecutor::new(definition, options)?);
        executor.add_observer(Arc::new(Forwarder {
            saga_id: saga_id.to_string(),
            events: self.events.clone(),
        }));
        self.executors
            .write()
            .insert(saga_id.to_string(), Arc::clone(&executor));

        info!(saga_id = %saga_id, "orchestrating saga");
        Ok(executor.execute().await?)
    }

    /// Executor of the latest run of `saga_id`.
    #[must_use]
    pub fn executor(&self, saga_id: &str) -> Option<Arc<SagaExecutor>> {
        self.executors.read().get(saga_id).cloned()
    }

    /// Sagas currently running forward or compensating.
    #[must_use]
    pub fn active_sagas(&self) -> Vec<(String, SagaStatus)> {
        self.executors
            .read()
            .iter()
            .map(|(id, executor)| (id.clone(), executor.status().status))
            .filter(|(_, status)| status.is_active())
            .collect()
    }

    /// Status of the latest run of `saga_id`.
    #[must_use]
    pub fn last_status(&self, saga_id: &str) -> Option<SagaStatus> {
        self.executor(saga_id).map(|executor| executor.status().status)
    }
}

/// Tags executor events with the saga id.
struct Forwarder {
    saga_id: String,
    events: broadcast::Sender<OrchestratorEvent>,
}

impl SagaObserver for Forwarder {
    fn on_event(&self, event: &SagaEvent) {
        // No subscribers is fine.
        let _ = self.events.send(OrchestratorEvent {
            saga_id: self.saga_id.clone(),
            event: event.clone(),
        });
    }
}
