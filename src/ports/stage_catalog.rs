//! Stage catalog port (spec §4.3, §6): resolves a stage's `stage_type` to
//! the builder that knows its task graph and synthetic children.

use async_trait::async_trait;

use crate::errors::PortError;
use crate::model::{StageExecution, TaskExecution};

/// A stage type's definition: its own task graph plus optional synthetic
/// before/after stage specs. Implementations of [`StageBuilder`] return
/// these; the graph expander (spec §4.3) turns them into materialized
/// [`StageExecution`]s.
#[derive(Debug, Clone)]
pub struct StageSpec {
    pub stage_type: String,
    pub context: serde_json::Value,
}

/// Resolves a `stage_type` string to its task graph and synthetic children.
/// One implementation per deployment, covering every stage type the
/// pipeline definitions in that deployment can reference.
#[async_trait]
pub trait StageBuilder: Send + Sync {
    /// The tasks that make up this stage type, in execution order.
    fn task_graph(&self, stage_type: &str) -> Result<Vec<TaskExecution>, PortError>;

    /// Specs for synthetic stages to run before this stage's own tasks.
    fn before_stages(&self, stage: &StageExecution) -> Result<Vec<StageSpec>, PortError>;

    /// Specs for synthetic stages to run after this stage's own tasks.
    fn after_stages(&self, stage: &StageExecution) -> Result<Vec<StageSpec>, PortError>;

    /// Hook invoked on CancelStage for a RUNNING stage (spec §4.5, invariant
    /// 6: only called when the stage was actually running). Default no-op
    /// for stage types with nothing external to tear down.
    async fn cancel(&self, _stage: &StageExecution) -> Result<(), PortError> {
        Ok(())
    }

    /// Whether an operator is allowed to manually skip this stage type.
    fn can_manually_skip(&self, _stage_type: &str) -> bool {
        true
    }

    /// Opportunity to rewrite a stage's context before RestartStage
    /// re-enters it (e.g. clearing a cached target revision).
    fn prepare_stage_for_restart(&self, stage: &mut StageExecution) {
        let _ = stage;
    }
}
