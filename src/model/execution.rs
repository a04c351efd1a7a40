//! Pipeline execution entity and DAG traversal helpers (spec §3, §4.5, §4.6).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use super::stage::StageExecution;
use super::status::Status;
use crate::errors::{SchedulerError, SchedulerResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionType {
    Pipeline,
    Orchestration,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Authentication {
    pub user: Option<String>,
    #[serde(default)]
    pub allowed_accounts: Vec<String>,
}

/// One concrete run of a pipeline definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineExecution {
    pub id: Uuid,
    pub application: String,
    pub execution_type: ExecutionType,
    /// Groups re-runs of the same definition; drives concurrency admission.
    pub pipeline_config_id: Option<String>,
    pub stages: Vec<StageExecution>,
    pub status: Status,
    /// When this execution was submitted, independent of `start_time`
    /// (which is only set once it admits and actually starts running).
    /// Orders the waiting queue for a `pipelineConfigId` (spec §4.7 Purge).
    #[serde(default)]
    pub submitted_at: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub origin: Option<String>,
    #[serde(default)]
    pub authentication: Authentication,
    #[serde(default)]
    pub limit_concurrent: bool,
    #[serde(default)]
    pub keep_waiting_pipelines: bool,
    /// Unknown fields from an older engine version round-trip verbatim
    /// (spec §6, "submitted pipeline shape").
    #[serde(default, flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl PipelineExecution {
    pub fn new(id: Uuid, application: impl Into<String>, execution_type: ExecutionType) -> Self {
        Self {
            id,
            application: application.into(),
            execution_type,
            pipeline_config_id: None,
            stages: Vec::new(),
            status: Status::NotStarted,
            submitted_at: Utc::now(),
            start_time: None,
            end_time: None,
            origin: None,
            authentication: Authentication::default(),
            limit_concurrent: false,
            keep_waiting_pipelines: true,
            extra: serde_json::Map::new(),
        }
    }

    pub fn stage(&self, id: Uuid) -> Option<&StageExecution> {
        self.stages.iter().find(|s| s.id == id)
    }

    pub fn stage_mut(&mut self, id: Uuid) -> Option<&mut StageExecution> {
        self.stages.iter_mut().find(|s| s.id == id)
    }

    pub fn stage_by_ref_id(&self, ref_id: &str) -> Option<&StageExecution> {
        self.stages.iter().find(|s| s.ref_id == ref_id)
    }

    pub fn require_stage(&self, id: Uuid) -> SchedulerResult<&StageExecution> {
        self.stage(id).ok_or(SchedulerError::StageNotFound {
            execution_id: self.id,
            stage_id: id,
        })
    }

    pub fn require_stage_mut(&mut self, id: Uuid) -> SchedulerResult<&mut StageExecution> {
        let execution_id = self.id;
        self.stage_mut(id).ok_or(SchedulerError::StageNotFound {
            execution_id,
            stage_id: id,
        })
    }

    /// Stages with no parent; these participate in the execution's status
    /// derivation (spec §3, "top-level stage").
    pub fn top_level_stages(&self) -> impl Iterator<Item = &StageExecution> {
        self.stages.iter().filter(|s| s.is_top_level())
    }

    /// Top-level roots of the DAG: empty `requisite_stage_ref_ids` (spec §4.6
    /// StartExecution step: "enqueue StartStage for every stage with empty
    /// requisiteStageRefIds").
    pub fn top_level_roots(&self) -> Vec<Uuid> {
        self.top_level_stages()
            .filter(|s| s.requisite_stage_ref_ids.is_empty())
            .map(|s| s.id)
            .collect()
    }

    /// Top-level stages directly downstream of `ref_id` (i.e. whose
    /// requisites include it), in pipeline-definition order (spec §4.5 tie-
    /// break rule).
    pub fn downstream_of(&self, ref_id: &str) -> Vec<Uuid> {
        self.top_level_stages()
            .filter(|s| s.requisite_stage_ref_ids.iter().any(|r| r == ref_id))
            .map(|s| s.id)
            .collect()
    }

    /// Whether every requisite of `stage_id` has reached a stage-complete
    /// status (SUCCEEDED, FAILED_CONTINUE, SKIPPED).
    pub fn upstreams_complete(&self, stage_id: Uuid) -> bool {
        let Some(stage) = self.stage(stage_id) else {
            return false;
        };
        stage.requisite_stage_ref_ids.iter().all(|req| {
            self.stage_by_ref_id(req)
                .is_some_and(|s| s.status.is_stage_complete())
        })
    }

    /// Detects a cycle in the top-level refId dependency graph (invariant 1,
    /// spec §3). Returns the offending refIds if one is found.
    pub fn detect_cycle(&self) -> Option<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            InProgress,
            Done,
        }

        let stages: Vec<&StageExecution> = self.top_level_stages().collect();
        let mut marks: HashMap<&str, Mark> = stages
            .iter()
            .map(|s| (s.ref_id.as_str(), Mark::Unvisited))
            .collect();

        fn visit<'a>(
            ref_id: &'a str,
            stages: &[&'a StageExecution],
            marks: &mut HashMap<&'a str, Mark>,
            path: &mut Vec<String>,
        ) -> bool {
            match marks.get(ref_id) {
                Some(Mark::Done) => return false,
                Some(Mark::InProgress) => return true,
                _ => {}
            }
            marks.insert(ref_id, Mark::InProgress);
            path.push(ref_id.to_string());
            if let Some(stage) = stages.iter().find(|s| s.ref_id == ref_id) {
                for req in &stage.requisite_stage_ref_ids {
                    if visit(req, stages, marks, path) {
                        return true;
                    }
                }
            }
            path.pop();
            marks.insert(ref_id, Mark::Done);
            false
        }

        let mut path = Vec::new();
        for s in &stages {
            if visit(&s.ref_id, &stages, &mut marks, &mut path) {
                return Some(path);
            }
        }
        None
    }

    /// Derives the final execution status from top-level stages, per the
    /// rule in spec §4.6 CompleteExecution. Returns `None` when some branch
    /// is still running or pending with complete upstreams — the caller
    /// should re-queue rather than finalize.
    pub fn derive_final_status(&self) -> Option<Status> {
        let top_level: Vec<&StageExecution> = self.top_level_stages().collect();

        if top_level.is_empty() {
            return Some(Status::Succeeded);
        }

        if top_level.iter().any(|s| s.status == Status::Terminal) {
            return Some(Status::Terminal);
        }

        let any_canceled = top_level.iter().any(|s| s.status == Status::Canceled);
        if any_canceled {
            return Some(Status::Canceled);
        }

        let all_settled = top_level.iter().all(|s| s.status.is_terminal());
        if !all_settled {
            return None;
        }

        let any_stopped_fail_other_branches = top_level
            .iter()
            .any(|s| s.status == Status::Stopped && s.complete_other_branches_then_fail());
        if any_stopped_fail_other_branches {
            return Some(Status::Terminal);
        }

        let all_succeedish = top_level.iter().all(|s| {
            matches!(
                s.status,
                Status::Succeeded | Status::Skipped | Status::FailedContinue | Status::Stopped
            )
        });
        if all_succeedish {
            return Some(Status::Succeeded);
        }

        None
    }

    /// Every stage reachable transitively below `stage_id` (children of
    /// synthetics), used when cancelling a whole branch.
    pub fn descendants(&self, stage_id: Uuid) -> Vec<Uuid> {
        let mut out = Vec::new();
        let mut frontier = vec![stage_id];
        let mut seen: HashSet<Uuid> = HashSet::new();
        while let Some(id) = frontier.pop() {
            if !seen.insert(id) {
                continue;
            }
            for s in &self.stages {
                if s.parent_stage_id == Some(id) {
                    out.push(s.id);
                    frontier.push(s.id);
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::stage::StageExecution;

    fn stage(ref_id: &str, reqs: &[&str]) -> StageExecution {
        let mut s = StageExecution::new(Uuid::new_v4(), ref_id, "deploy");
        s.requisite_stage_ref_ids = reqs.iter().map(|r| r.to_string()).collect();
        s
    }

    #[test]
    fn detects_no_cycle_in_linear_chain() {
        let mut exec = PipelineExecution::new(Uuid::new_v4(), "app", ExecutionType::Pipeline);
        exec.stages.push(stage("a", &[]));
        exec.stages.push(stage("b", &["a"]));
        assert!(exec.detect_cycle().is_none());
    }

    #[test]
    fn detects_cycle() {
        let mut exec = PipelineExecution::new(Uuid::new_v4(), "app", ExecutionType::Pipeline);
        exec.stages.push(stage("a", &["b"]));
        exec.stages.push(stage("b", &["a"]));
        assert!(exec.detect_cycle().is_some());
    }

    #[test]
    fn top_level_roots_have_no_requisites() {
        let mut exec = PipelineExecution::new(Uuid::new_v4(), "app", ExecutionType::Pipeline);
        let a = stage("a", &[]);
        let a_id = a.id;
        exec.stages.push(a);
        exec.stages.push(stage("b", &["a"]));
        assert_eq!(exec.top_level_roots(), vec![a_id]);
    }

    #[test]
    fn derive_final_status_succeeded_when_all_stage_complete() {
        let mut exec = PipelineExecution::new(Uuid::new_v4(), "app", ExecutionType::Pipeline);
        let mut a = stage("a", &[]);
        a.status = Status::Succeeded;
        let mut b = stage("b", &["a"]);
        b.status = Status::FailedContinue;
        exec.stages.push(a);
        exec.stages.push(b);
        assert_eq!(exec.derive_final_status(), Some(Status::Succeeded));
    }

    #[test]
    fn derive_final_status_terminal_beats_canceled() {
        let mut exec = PipelineExecution::new(Uuid::new_v4(), "app", ExecutionType::Pipeline);
        let mut a = stage("a", &[]);
        a.status = Status::Terminal;
        let mut b = stage("b", &[]);
        b.status = Status::Canceled;
        exec.stages.push(a);
        exec.stages.push(b);
        assert_eq!(exec.derive_final_status(), Some(Status::Terminal));
    }

    #[test]
    fn derive_final_status_none_while_branch_running() {
        let mut exec = PipelineExecution::new(Uuid::new_v4(), "app", ExecutionType::Pipeline);
        let mut a = stage("a", &[]);
        a.status = Status::Succeeded;
        let b = stage("b", &[]); // still NOT_STARTED
        exec.stages.push(a);
        exec.stages.push(b);
        assert_eq!(exec.derive_final_status(), None);
    }

    #[test]
    fn derive_final_status_stopped_with_complete_other_branches_then_fail_is_terminal() {
        let mut exec = PipelineExecution::new(Uuid::new_v4(), "app", ExecutionType::Pipeline);
        let mut a = stage("a", &[]);
        a.status = Status::Stopped;
        a.set_complete_other_branches_then_fail(true);
        let mut b = stage("b", &[]);
        b.status = Status::Succeeded;
        exec.stages.push(a);
        exec.stages.push(b);
        assert_eq!(exec.derive_final_status(), Some(Status::Terminal));
    }

    #[test]
    fn derive_final_status_empty_stage_list_succeeds_immediately() {
        let exec = PipelineExecution::new(Uuid::new_v4(), "app", ExecutionType::Pipeline);
        assert_eq!(exec.derive_final_status(), Some(Status::Succeeded));
    }
}
