//! Wiring for the four ports plus the scheduler's own runtime state, shared
//! behind an `Arc` so every handler and the dispatcher see the same
//! instances (spec §5, §6).

use std::sync::Arc;

use crate::concurrency::AdmissionController;
use crate::config::SchedulerConfig;
use crate::dispatcher::lock::ExecutionLock;
use crate::ports::{EventBus, ExecutionRepository, Queue, StageBuilder, TaskRunner};

/// Everything a handler needs besides the message it was invoked with.
/// Cheap to clone: it's a handful of `Arc`s.
#[derive(Clone)]
pub struct Context {
    pub repository: Arc<dyn ExecutionRepository>,
    pub queue: Arc<dyn Queue>,
    pub event_bus: Arc<dyn EventBus>,
    pub stage_builder: Arc<dyn StageBuilder>,
    pub task_runner: Arc<dyn TaskRunner>,
    pub config: SchedulerConfig,
    pub admission: Arc<AdmissionController>,
    pub lock: Arc<ExecutionLock>,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Context {
    pub fn new(
        repository: Arc<dyn ExecutionRepository>,
        queue: Arc<dyn Queue>,
        event_bus: Arc<dyn EventBus>,
        stage_builder: Arc<dyn StageBuilder>,
        task_runner: Arc<dyn TaskRunner>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            repository,
            queue,
            event_bus,
            stage_builder,
            task_runner,
            config,
            admission: Arc::new(AdmissionController::new()),
            lock: Arc::new(ExecutionLock::new()),
        }
    }
}
