//! Task contract port (spec §4.4, §6): the one method a task implementation
//! must provide.

use async_trait::async_trait;

use crate::errors::PortError;
use crate::model::{StageExecution, TaskResult};

/// A single unit of work within a stage. `execute` is called once per
/// RunTask delivery; implementations must be safe to call more than once for
/// the same task attempt (at-least-once delivery, spec §4.1) and should
/// treat `stage.context` as read-only input, returning any writes via
/// `TaskResult::context_delta`.
#[async_trait]
pub trait Task: Send + Sync {
    async fn execute(&self, stage: &StageExecution, task_id: u32) -> Result<TaskResult, PortError>;
}

/// Resolves a task's `implementing_type` to a concrete [`Task`].
pub trait TaskRunner: Send + Sync {
    fn resolve(&self, implementing_type: &str) -> Result<std::sync::Arc<dyn Task>, PortError>;
}
