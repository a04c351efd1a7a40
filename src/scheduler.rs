//! Top-level construction: wires the four ports and the scheduler
//! configuration into a [`Context`] and exposes the dispatcher loop as a
//! single async method, the way an embedder actually drives this crate.

use std::sync::Arc;

use crate::config::SchedulerConfig;
use crate::context::Context;
use crate::dispatcher;
use crate::errors::SchedulerResult;
use crate::ports::{EventBus, ExecutionRepository, Queue, StageBuilder, TaskRunner};

/// The scheduler's runtime handle. Construct once per process and call
/// [`Scheduler::run_forever`] (or drive [`Scheduler::tick`] yourself from a
/// worker pool).
#[derive(Clone)]
pub struct Scheduler {
    context: Context,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler").finish_non_exhaustive()
    }
}

impl Scheduler {
    pub fn new(
        repository: Arc<dyn ExecutionRepository>,
        queue: Arc<dyn Queue>,
        event_bus: Arc<dyn EventBus>,
        stage_builder: Arc<dyn StageBuilder>,
        task_runner: Arc<dyn TaskRunner>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            context: Context::new(
                repository,
                queue,
                event_bus,
                stage_builder,
                task_runner,
                config,
            ),
        }
    }

    /// Process exactly one message, if one is available. Returns `false`
    /// when the queue was empty.
    pub async fn tick(&self) -> SchedulerResult<bool> {
        dispatcher::run_once(&self.context).await
    }

    /// Poll continuously, sleeping `idle_delay` between empty polls. Runs
    /// until the process is killed or the queue returns a non-transient
    /// error; callers that want graceful shutdown should race this against
    /// a cancellation signal instead of calling it directly.
    pub async fn run_forever(&self, idle_delay: std::time::Duration) -> SchedulerResult<()> {
        loop {
            if !self.tick().await? {
                tokio::time::sleep(idle_delay).await;
            }
        }
    }

    pub fn context(&self) -> &Context {
        &self.context
    }
}
