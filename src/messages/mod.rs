//! Message taxonomy (spec §4.1, C1): the closed set of commands and events
//! exchanged through the queue, organized into execution/stage/task tiers.

pub mod execution;
pub mod stage;
pub mod task;

pub use execution::{
    CancelExecution, CompleteExecution, RescheduleExecution, ResumeExecution, StartExecution,
    StartWaitingExecutions,
};
pub use stage::{
    AbortStage, CancelStage, CompleteStage, ContinueParentStage, PauseStage, RestartStage,
    ResumeStage, SkipStage, StartStage,
};
pub use task::{CompleteTask, InvalidTask, PauseTask, ResumeTask, RunTask, StartTask};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Execution-tier messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ExecutionMessage {
    StartExecution(StartExecution),
    CompleteExecution(CompleteExecution),
    CancelExecution(CancelExecution),
    ResumeExecution(ResumeExecution),
    StartWaitingExecutions(StartWaitingExecutions),
    RescheduleExecution(RescheduleExecution),
}

/// Stage-tier messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StageMessage {
    StartStage(StartStage),
    CompleteStage(CompleteStage),
    SkipStage(SkipStage),
    AbortStage(AbortStage),
    CancelStage(CancelStage),
    RestartStage(RestartStage),
    PauseStage(PauseStage),
    ResumeStage(ResumeStage),
    ContinueParentStage(ContinueParentStage),
}

/// Task-tier messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TaskMessage {
    StartTask(StartTask),
    RunTask(RunTask),
    CompleteTask(CompleteTask),
    PauseTask(PauseTask),
    ResumeTask(ResumeTask),
    InvalidTask(InvalidTask),
}

/// The closed tagged sum of every message the dispatcher can route (spec
/// §4.1, §9 "explicit dispatch table ... message kinds are a closed tagged
/// sum").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SchedulerMessage {
    Execution(ExecutionMessage),
    Stage(StageMessage),
    Task(TaskMessage),
}

/// `(messageKind, executionId, stageId?, taskId?)` — duplicates collapse to
/// the same key (spec §3, §4.1, GLOSSARY).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdempotencyKey {
    pub kind: &'static str,
    pub execution_id: Uuid,
    pub stage_id: Option<Uuid>,
    pub task_id: Option<u32>,
}

impl SchedulerMessage {
    /// Short tag used for dispatch-table lookups, logging, and idempotency
    /// keys.
    pub fn kind(&self) -> &'static str {
        match self {
            SchedulerMessage::Execution(m) => match m {
                ExecutionMessage::StartExecution(_) => "StartExecution",
                ExecutionMessage::CompleteExecution(_) => "CompleteExecution",
                ExecutionMessage::CancelExecution(_) => "CancelExecution",
                ExecutionMessage::ResumeExecution(_) => "ResumeExecution",
                ExecutionMessage::StartWaitingExecutions(_) => "StartWaitingExecutions",
                ExecutionMessage::RescheduleExecution(_) => "RescheduleExecution",
            },
            SchedulerMessage::Stage(m) => match m {
                StageMessage::StartStage(_) => "StartStage",
                StageMessage::CompleteStage(_) => "CompleteStage",
                StageMessage::SkipStage(_) => "SkipStage",
                StageMessage::AbortStage(_) => "AbortStage",
                StageMessage::CancelStage(_) => "CancelStage",
                StageMessage::RestartStage(_) => "RestartStage",
                StageMessage::PauseStage(_) => "PauseStage",
                StageMessage::ResumeStage(_) => "ResumeStage",
                StageMessage::ContinueParentStage(_) => "ContinueParentStage",
            },
            SchedulerMessage::Task(m) => match m {
                TaskMessage::StartTask(_) => "StartTask",
                TaskMessage::RunTask(_) => "RunTask",
                TaskMessage::CompleteTask(_) => "CompleteTask",
                TaskMessage::PauseTask(_) => "PauseTask",
                TaskMessage::ResumeTask(_) => "ResumeTask",
                TaskMessage::InvalidTask(_) => "InvalidTask",
            },
        }
    }

    pub fn execution_id(&self) -> Uuid {
        match self {
            SchedulerMessage::Execution(m) => match m {
                ExecutionMessage::StartExecution(m) => m.execution_id,
                ExecutionMessage::CompleteExecution(m) => m.execution_id,
                ExecutionMessage::CancelExecution(m) => m.execution_id,
                ExecutionMessage::ResumeExecution(m) => m.execution_id,
                ExecutionMessage::StartWaitingExecutions(_) => Uuid::nil(),
                ExecutionMessage::RescheduleExecution(m) => m.execution_id,
            },
            SchedulerMessage::Stage(m) => match m {
                StageMessage::StartStage(m) => m.execution_id,
                StageMessage::CompleteStage(m) => m.execution_id,
                StageMessage::SkipStage(m) => m.execution_id,
                StageMessage::AbortStage(m) => m.execution_id,
                StageMessage::CancelStage(m) => m.execution_id,
                StageMessage::RestartStage(m) => m.execution_id,
                StageMessage::PauseStage(m) => m.execution_id,
                StageMessage::ResumeStage(m) => m.execution_id,
                StageMessage::ContinueParentStage(m) => m.execution_id,
            },
            SchedulerMessage::Task(m) => match m {
                TaskMessage::StartTask(m) => m.execution_id,
                TaskMessage::RunTask(m) => m.execution_id,
                TaskMessage::CompleteTask(m) => m.execution_id,
                TaskMessage::PauseTask(m) => m.execution_id,
                TaskMessage::ResumeTask(m) => m.execution_id,
                TaskMessage::InvalidTask(m) => m.execution_id,
            },
        }
    }

    pub fn stage_id(&self) -> Option<Uuid> {
        match self {
            SchedulerMessage::Execution(_) => None,
            SchedulerMessage::Stage(m) => Some(match m {
                StageMessage::StartStage(m) => m.stage_id,
                StageMessage::CompleteStage(m) => m.stage_id,
                StageMessage::SkipStage(m) => m.stage_id,
                StageMessage::AbortStage(m) => m.stage_id,
                StageMessage::CancelStage(m) => m.stage_id,
                StageMessage::RestartStage(m) => m.stage_id,
                StageMessage::PauseStage(m) => m.stage_id,
                StageMessage::ResumeStage(m) => m.stage_id,
                StageMessage::ContinueParentStage(m) => m.parent_stage_id,
            }),
            SchedulerMessage::Task(m) => Some(match m {
                TaskMessage::StartTask(m) => m.stage_id,
                TaskMessage::RunTask(m) => m.stage_id,
                TaskMessage::CompleteTask(m) => m.stage_id,
                TaskMessage::PauseTask(m) => m.stage_id,
                TaskMessage::ResumeTask(m) => m.stage_id,
                TaskMessage::InvalidTask(m) => m.stage_id,
            }),
        }
    }

    pub fn task_id(&self) -> Option<u32> {
        match self {
            SchedulerMessage::Task(m) => Some(match m {
                TaskMessage::StartTask(m) => m.task_id,
                TaskMessage::RunTask(m) => m.task_id,
                TaskMessage::CompleteTask(m) => m.task_id,
                TaskMessage::PauseTask(m) => m.task_id,
                TaskMessage::ResumeTask(m) => m.task_id,
                TaskMessage::InvalidTask(m) => m.task_id,
            }),
            _ => None,
        }
    }

    pub fn idempotency_key(&self) -> IdempotencyKey {
        IdempotencyKey {
            kind: self.kind(),
            execution_id: self.execution_id(),
            stage_id: self.stage_id(),
            task_id: self.task_id(),
        }
    }
}

/// A monotonically-incremented redelivery counter maintained by the queue
/// transport (spec §4.1). The dispatcher copies the transport-reported count
/// onto the envelope so handlers that need it (message-level backoff, §4.8)
/// don't have to reach back into the transport.
pub trait AttemptsAttribute {
    fn attempts(&self) -> u32;
}

/// A message as delivered by the queue, paired with its transport-reported
/// attempt count.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub message: SchedulerMessage,
    pub attempts: u32,
}

impl AttemptsAttribute for Envelope {
    fn attempts(&self) -> u32 {
        self.attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idempotency_key_identifies_task_messages_by_full_tuple() {
        let execution_id = Uuid::new_v4();
        let stage_id = Uuid::new_v4();
        let msg = SchedulerMessage::Task(TaskMessage::StartTask(StartTask {
            execution_id,
            stage_id,
            task_id: 2,
        }));
        let key = msg.idempotency_key();
        assert_eq!(key.kind, "StartTask");
        assert_eq!(key.execution_id, execution_id);
        assert_eq!(key.stage_id, Some(stage_id));
        assert_eq!(key.task_id, Some(2));
    }

    #[test]
    fn duplicate_messages_collapse_to_the_same_key() {
        let execution_id = Uuid::new_v4();
        let stage_id = Uuid::new_v4();
        let a = SchedulerMessage::Stage(StageMessage::CompleteStage(CompleteStage {
            execution_id,
            stage_id,
        }));
        let b = a.clone();
        assert_eq!(a.idempotency_key(), b.idempotency_key());
    }
}
