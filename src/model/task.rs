//! Task execution entity and the task-contract result type (spec §3, §4.4, §6).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::status::Status;

/// The non-persisted signal space a task implementation's `execute()` can
/// return (spec §4.4). `Redirect` never becomes a persisted [`Status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskOutcomeStatus {
    Succeeded,
    Running,
    Terminal,
    Redirect,
    Paused,
    Canceled,
    Skipped,
}

/// `TaskResult` from the task contract (spec §6): `execute(stage) ->
/// TaskResult{status, contextDelta, outputs}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub status: TaskOutcomeStatus,
    #[serde(default)]
    pub context_delta: Option<serde_json::Value>,
    #[serde(default)]
    pub outputs: Option<serde_json::Value>,
    /// Populated when `status == Running`; re-queue delay for the next RunTask.
    #[serde(default, with = "duration_millis_opt")]
    pub backoff_period: Option<Duration>,
    /// Populated when `status == Terminal`; the failure reason.
    #[serde(default)]
    pub reason: Option<String>,
    /// The only permitted write to a task's deadline (spec §4.4).
    #[serde(default)]
    pub deadline_extension: Option<DateTime<Utc>>,
}

impl TaskResult {
    pub fn succeeded(outputs: Option<serde_json::Value>) -> Self {
        Self {
            status: TaskOutcomeStatus::Succeeded,
            context_delta: None,
            outputs,
            backoff_period: None,
            reason: None,
            deadline_extension: None,
        }
    }

    pub fn running(backoff_period: Duration) -> Self {
        Self {
            status: TaskOutcomeStatus::Running,
            context_delta: None,
            outputs: None,
            backoff_period: Some(backoff_period),
            reason: None,
            deadline_extension: None,
        }
    }

    pub fn terminal(reason: impl Into<String>) -> Self {
        Self {
            status: TaskOutcomeStatus::Terminal,
            context_delta: None,
            outputs: None,
            backoff_period: None,
            reason: Some(reason.into()),
            deadline_extension: None,
        }
    }

    pub fn redirect() -> Self {
        Self {
            status: TaskOutcomeStatus::Redirect,
            context_delta: None,
            outputs: None,
            backoff_period: None,
            reason: None,
            deadline_extension: None,
        }
    }
}

mod duration_millis_opt {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(v: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(d) => s.serialize_some(&d.as_millis()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let ms: Option<u64> = Option::deserialize(d)?;
        Ok(ms.map(Duration::from_millis))
    }
}

/// A single task within a [`StageExecution`](super::stage::StageExecution).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskExecution {
    /// Ordinal position within the owning stage.
    pub id: u32,
    pub name: String,
    /// Resolves to a task implementation via the task runner port.
    pub implementing_type: String,
    pub status: Status,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Marks the head of a repeatable sub-sequence for REDIRECT loops.
    #[serde(default)]
    pub loop_start: bool,
    /// Marks this as the last task in the stage.
    #[serde(default)]
    pub stage_end: bool,
    /// When true, a TERMINAL outcome is recorded as FAILED_CONTINUE while
    /// the original outcome is preserved in `original_status`.
    #[serde(default)]
    pub continue_on_failure: bool,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, with = "duration_secs_opt")]
    pub timeout: Option<Duration>,
    pub deadline: Option<DateTime<Utc>>,
    /// The pre-continueOnFailure-substitution outcome, preserved for
    /// introspection per spec §4.4.
    pub original_status: Option<Status>,
}

mod duration_secs_opt {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(v: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(d) => s.serialize_some(&d.as_secs()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let secs: Option<u64> = Option::deserialize(d)?;
        Ok(secs.map(Duration::from_secs))
    }
}

impl TaskExecution {
    pub fn new(id: u32, name: impl Into<String>, implementing_type: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            implementing_type: implementing_type.into(),
            status: Status::NotStarted,
            start_time: None,
            end_time: None,
            loop_start: false,
            stage_end: false,
            continue_on_failure: false,
            attempts: 0,
            timeout: None,
            deadline: None,
            original_status: None,
        }
    }

    pub fn with_loop_start(mut self, loop_start: bool) -> Self {
        self.loop_start = loop_start;
        self
    }

    pub fn with_continue_on_failure(mut self, continue_on_failure: bool) -> Self {
        self.continue_on_failure = continue_on_failure;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Reset this task (and only this task) to NOT_STARTED, as REDIRECT's
    /// loop-range reset does for each task in the range (spec §4.4, §9).
    pub fn reset_for_redirect(&mut self) {
        self.status = Status::NotStarted;
        self.start_time = None;
        self.end_time = None;
        self.deadline = None;
        self.original_status = None;
    }

    /// Whether `RunTask`'s deadline check (spec §4.4) should fire a synthetic
    /// timeout for the given instant.
    pub fn is_past_deadline(&self, now: DateTime<Utc>) -> bool {
        self.deadline.is_some_and(|d| now >= d)
    }
}
