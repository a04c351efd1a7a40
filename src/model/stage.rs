//! Stage execution entity (spec §3, §4.3, §4.5).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::status::Status;
use super::task::TaskExecution;

/// Which side of the parent's own tasks a synthetic stage runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyntheticStageOwner {
    StageBefore,
    StageAfter,
}

/// Who last touched a stage via a manual operation, and when.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastModified {
    pub user: String,
    pub at: DateTime<Utc>,
}

/// Context keys the engine recognizes explicitly (spec §3.1 typed
/// accessors). Everything else in `context` round-trips opaquely.
const CTX_MANUAL_SKIP: &str = "manualSkip";
const CTX_COMPLETE_OTHER_BRANCHES_THEN_FAIL: &str = "completeOtherBranchesThenFail";

/// One node in the execution DAG: a bundle of tasks plus synthetic children.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageExecution {
    /// Unique within the owning execution.
    pub id: Uuid,
    /// Stable id the pipeline author uses to wire `requisite_stage_ref_ids`.
    pub ref_id: String,
    /// Resolves to a builder in the stage catalog.
    pub stage_type: String,
    pub name: String,
    #[serde(default)]
    pub context: serde_json::Value,
    #[serde(default)]
    pub requisite_stage_ref_ids: Vec<String>,
    pub parent_stage_id: Option<Uuid>,
    pub synthetic_stage_owner: Option<SyntheticStageOwner>,
    #[serde(default)]
    pub tasks: Vec<TaskExecution>,
    pub status: Status,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub last_modified: Option<LastModified>,

    /// Ids of materialized `beforeStages` children, in author order.
    #[serde(default)]
    pub before_stage_ids: Vec<Uuid>,
    /// Ids of materialized `afterStages` children, in author order.
    #[serde(default)]
    pub after_stage_ids: Vec<Uuid>,
    /// Ids of materialized parallel-peer children, in author order.
    #[serde(default)]
    pub parallel_stage_ids: Vec<Uuid>,
    /// Expansion (spec §4.3) happens once, on first StartStage; this flags it
    /// done so restart yields the same shape instead of re-expanding.
    #[serde(default)]
    pub synthetics_expanded: bool,
    /// Set once the before-block has completed and the parent has moved on
    /// to its own tasks (ContinueParentStage, spec §4.5).
    #[serde(default)]
    pub before_block_complete: bool,
    /// Set once the after-block has been started (so CompleteStage doesn't
    /// start it twice on redelivery).
    #[serde(default)]
    pub after_block_started: bool,
}

impl StageExecution {
    pub fn new(id: Uuid, ref_id: impl Into<String>, stage_type: impl Into<String>) -> Self {
        Self {
            id,
            ref_id: ref_id.into(),
            stage_type: stage_type.into(),
            name: String::new(),
            context: serde_json::Value::Object(Default::default()),
            requisite_stage_ref_ids: Vec::new(),
            parent_stage_id: None,
            synthetic_stage_owner: None,
            tasks: Vec::new(),
            status: Status::NotStarted,
            start_time: None,
            end_time: None,
            last_modified: None,
            before_stage_ids: Vec::new(),
            after_stage_ids: Vec::new(),
            parallel_stage_ids: Vec::new(),
            synthetics_expanded: false,
            before_block_complete: false,
            after_block_started: false,
        }
    }

    pub fn is_synthetic(&self) -> bool {
        self.parent_stage_id.is_some()
    }

    pub fn is_top_level(&self) -> bool {
        self.parent_stage_id.is_none()
    }

    pub fn manual_skip(&self) -> bool {
        self.context
            .get(CTX_MANUAL_SKIP)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    pub fn complete_other_branches_then_fail(&self) -> bool {
        self.context
            .get(CTX_COMPLETE_OTHER_BRANCHES_THEN_FAIL)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    pub fn set_complete_other_branches_then_fail(&mut self, value: bool) {
        if let serde_json::Value::Object(map) = &mut self.context {
            map.insert(
                CTX_COMPLETE_OTHER_BRANCHES_THEN_FAIL.to_string(),
                serde_json::Value::Bool(value),
            );
        }
    }

    /// The stage's first task, if any (RunTask/StartTask entry point).
    pub fn first_task(&self) -> Option<&TaskExecution> {
        self.tasks.first()
    }

    pub fn task(&self, task_id: u32) -> Option<&TaskExecution> {
        self.tasks.iter().find(|t| t.id == task_id)
    }

    pub fn task_mut(&mut self, task_id: u32) -> Option<&mut TaskExecution> {
        self.tasks.iter_mut().find(|t| t.id == task_id)
    }

    /// The task immediately after `task_id` in stage order, if any.
    pub fn next_task(&self, task_id: u32) -> Option<&TaskExecution> {
        let idx = self.tasks.iter().position(|t| t.id == task_id)?;
        self.tasks.get(idx + 1)
    }

    /// All tasks terminal (invariant 3a, spec §3).
    pub fn all_tasks_terminal(&self) -> bool {
        self.tasks.iter().all(|t| t.status.is_terminal())
    }

    /// Index of the loop head task for a REDIRECT fired at `redirect_task_id`
    /// (the nearest preceding task with `loop_start = true`, inclusive of
    /// `redirect_task_id` itself per spec §4.4/§9: "from the loopStart task
    /// up to and including this task").
    pub fn loop_range_for_redirect(&self, redirect_task_id: u32) -> Vec<u32> {
        let Some(redirect_idx) = self.tasks.iter().position(|t| t.id == redirect_task_id) else {
            return Vec::new();
        };
        let loop_start_idx = self.tasks[..=redirect_idx]
            .iter()
            .rposition(|t| t.loop_start)
            .unwrap_or(redirect_idx);
        self.tasks[loop_start_idx..=redirect_idx]
            .iter()
            .map(|t| t.id)
            .collect()
    }

    /// Worst task status, folding FAILED_CONTINUE as non-fatal, used to
    /// derive the stage's own completion status (spec §4.5 CompleteStage).
    pub fn worst_task_status(&self) -> Option<Status> {
        self.tasks
            .iter()
            .map(|t| t.status)
            .max_by_key(Self::status_severity)
    }

    fn status_severity(status: &Status) -> u8 {
        match status {
            Status::NotStarted => 0,
            Status::Running | Status::Paused => 1,
            Status::Succeeded | Status::Skipped => 2,
            Status::FailedContinue => 3,
            Status::Stopped => 4,
            Status::Canceled => 5,
            Status::Terminal => 6,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage_with_tasks(specs: &[(&str, bool)]) -> StageExecution {
        let mut stage = StageExecution::new(Uuid::new_v4(), "r1", "deploy");
        for (i, (name, loop_start)) in specs.iter().enumerate() {
            stage
                .tasks
                .push(TaskExecution::new(i as u32, *name, "noop").with_loop_start(*loop_start));
        }
        stage
    }

    #[test]
    fn loop_range_for_redirect_includes_loop_start_through_redirect_task() {
        let stage = stage_with_tasks(&[
            ("bootstrap", false),
            ("determineTarget", true),
            ("disable", false),
            ("deploy", false),
            ("enable", false),
        ]);
        let range = stage.loop_range_for_redirect(4); // "enable"
        assert_eq!(range, vec![1, 2, 3, 4]);
    }

    #[test]
    fn loop_range_with_no_preceding_loop_start_is_just_the_task() {
        let stage = stage_with_tasks(&[("only", false)]);
        let range = stage.loop_range_for_redirect(0);
        assert_eq!(range, vec![0]);
    }

    #[test]
    fn manual_skip_reads_context_flag() {
        let mut stage = StageExecution::new(Uuid::new_v4(), "r1", "deploy");
        assert!(!stage.manual_skip());
        stage.context = serde_json::json!({"manualSkip": true});
        assert!(stage.manual_skip());
    }

    #[test]
    fn complete_other_branches_then_fail_roundtrips() {
        let mut stage = StageExecution::new(Uuid::new_v4(), "r1", "deploy");
        assert!(!stage.complete_other_branches_then_fail());
        stage.set_complete_other_branches_then_fail(true);
        assert!(stage.complete_other_branches_then_fail());
    }

    #[test]
    fn worst_task_status_folds_failed_continue_below_terminal() {
        let mut stage = stage_with_tasks(&[("a", false), ("b", false)]);
        stage.tasks[0].status = Status::FailedContinue;
        stage.tasks[1].status = Status::Succeeded;
        assert_eq!(stage.worst_task_status(), Some(Status::FailedContinue));

        stage.tasks[1].status = Status::Terminal;
        assert_eq!(stage.worst_task_status(), Some(Status::Terminal));
    }
}
