//! Stage graph expansion (spec §4.3, C3): on-demand materialization of a
//! stage's synthetic before/after/parallel children, driven by the stage
//! catalog. Expansion happens once per stage, on its first StartStage, and
//! is flagged via `synthetics_expanded` so a restart or redelivery yields
//! the identical shape instead of synthesizing a second copy.

use uuid::Uuid;

use crate::errors::{SchedulerError, SchedulerResult};
use crate::model::{PipelineExecution, StageExecution, SyntheticStageOwner};
use crate::ports::stage_catalog::StageSpec;
use crate::ports::StageBuilder;

/// Materializes `before_stages`/`after_stages` for `stage_id` into real
/// [`StageExecution`]s, appending them to the execution and recording their
/// ids on the parent. Idempotent: a stage with `synthetics_expanded` already
/// set is left untouched.
pub fn expand_before_stages(
    execution: &mut PipelineExecution,
    stage_id: Uuid,
    builder: &dyn StageBuilder,
) -> SchedulerResult<Vec<Uuid>> {
    let stage = execution.require_stage(stage_id)?;
    if stage.synthetics_expanded {
        return Ok(stage.before_stage_ids.clone());
    }
    let specs = builder
        .before_stages(stage)
        .map_err(SchedulerError::from)?;
    let ids = materialize(execution, stage_id, SyntheticStageOwner::StageBefore, specs, builder)?;
    let parent = execution.require_stage_mut(stage_id)?;
    parent.before_stage_ids = ids.clone();
    parent.synthetics_expanded = true;
    Ok(ids)
}

/// Materializes `after_stages` for `stage_id`. Called once the stage's own
/// tasks (and before-block) have completed; see `after_block_started` on
/// [`StageExecution`].
pub fn expand_after_stages(
    execution: &mut PipelineExecution,
    stage_id: Uuid,
    builder: &dyn StageBuilder,
) -> SchedulerResult<Vec<Uuid>> {
    let stage = execution.require_stage(stage_id)?;
    if !stage.after_stage_ids.is_empty() {
        return Ok(stage.after_stage_ids.clone());
    }
    let specs = builder
        .after_stages(stage)
        .map_err(SchedulerError::from)?;
    let ids = materialize(execution, stage_id, SyntheticStageOwner::StageAfter, specs, builder)?;
    execution.require_stage_mut(stage_id)?.after_stage_ids = ids.clone();
    Ok(ids)
}

fn materialize(
    execution: &mut PipelineExecution,
    parent_id: Uuid,
    owner: SyntheticStageOwner,
    specs: Vec<StageSpec>,
    builder: &dyn StageBuilder,
) -> SchedulerResult<Vec<Uuid>> {
    let mut ids = Vec::with_capacity(specs.len());
    for (i, spec) in specs.into_iter().enumerate() {
        let id = Uuid::new_v4();
        let ref_id = format!("{parent_id}-{owner_tag}-{i}", owner_tag = owner_tag(owner));
        let mut child = StageExecution::new(id, ref_id, spec.stage_type.clone());
        child.context = spec.context;
        child.parent_stage_id = Some(parent_id);
        child.synthetic_stage_owner = Some(owner);
        child.tasks = builder
            .task_graph(&spec.stage_type)
            .map_err(SchedulerError::from)?;
        ids.push(id);
        execution.stages.push(child);
    }
    Ok(ids)
}

fn owner_tag(owner: SyntheticStageOwner) -> &'static str {
    match owner {
        SyntheticStageOwner::StageBefore => "before",
        SyntheticStageOwner::StageAfter => "after",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ExecutionType, TaskExecution};

    struct FixedBuilder;

    #[async_trait::async_trait]
    impl StageBuilder for FixedBuilder {
        fn task_graph(
            &self,
            stage_type: &str,
        ) -> Result<Vec<TaskExecution>, crate::errors::PortError> {
            Ok(vec![TaskExecution::new(0, "run", stage_type)])
        }

        fn before_stages(
            &self,
            _stage: &StageExecution,
        ) -> Result<Vec<StageSpec>, crate::errors::PortError> {
            Ok(vec![StageSpec {
                stage_type: "findImage".into(),
                context: serde_json::json!({}),
            }])
        }

        fn after_stages(
            &self,
            _stage: &StageExecution,
        ) -> Result<Vec<StageSpec>, crate::errors::PortError> {
            Ok(vec![])
        }
    }

    fn exec_with_deploy_stage() -> (PipelineExecution, Uuid) {
        let mut exec = PipelineExecution::new(Uuid::new_v4(), "app", ExecutionType::Pipeline);
        let stage = StageExecution::new(Uuid::new_v4(), "deploy", "deploy");
        let id = stage.id;
        exec.stages.push(stage);
        (exec, id)
    }

    #[test]
    fn expand_before_stages_appends_and_links_children() {
        let (mut exec, stage_id) = exec_with_deploy_stage();
        let builder = FixedBuilder;
        let ids = expand_before_stages(&mut exec, stage_id, &builder).unwrap();
        assert_eq!(ids.len(), 1);
        assert_eq!(exec.stages.len(), 2);
        let child = exec.stage(ids[0]).unwrap();
        assert_eq!(child.parent_stage_id, Some(stage_id));
        assert_eq!(child.stage_type, "findImage");
    }

    #[test]
    fn expand_before_stages_is_idempotent_once_flagged() {
        let (mut exec, stage_id) = exec_with_deploy_stage();
        exec.require_stage_mut(stage_id).unwrap().synthetics_expanded = true;
        let builder = FixedBuilder;
        let ids = expand_before_stages(&mut exec, stage_id, &builder).unwrap();
        assert!(ids.is_empty());
        assert_eq!(exec.stages.len(), 1);
    }
}
