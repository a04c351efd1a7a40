//! Task driver state machine (spec §4.4, C5): NOT_STARTED → RUNNING →
//! terminal-ish outcome, including the REDIRECT loop-range reset and the
//! FAILED_CONTINUE substitution.

use chrono::Utc;
use tracing::{info, warn};

use crate::context::Context;
use crate::errors::{SchedulerError, SchedulerResult};
use crate::messages::{
    CompleteTask, RunTask, SchedulerMessage, StartTask, TaskMessage,
};
use crate::model::{Status, TaskExecution, TaskOutcomeStatus, TaskResult};
use crate::ports::SchedulerEvent;

/// `StartTask`: mark the task RUNNING, stamp its deadline, and kick off the
/// first `RunTask`.
pub async fn start_task(
    ctx: &Context,
    msg: &StartTask,
) -> SchedulerResult<Vec<SchedulerMessage>> {
    let mut execution = ctx.repository.retrieve(msg.execution_id).await?;
    let stage = execution.require_stage_mut(msg.stage_id)?;
    let task = stage
        .task_mut(msg.task_id)
        .ok_or(SchedulerError::TaskNotFound {
            stage_id: msg.stage_id,
            task_id: msg.task_id,
        })?;

    if task.status != Status::NotStarted {
        return Ok(Vec::new());
    }

    let now = Utc::now();
    task.status = Status::Running;
    task.start_time = Some(now);
    task.attempts = 0;
    let timeout = task.timeout.unwrap_or(ctx.config.default_task_timeout);
    task.deadline = Some(now + chrono::Duration::from_std(timeout).unwrap_or_default());

    ctx.repository.store(&execution).await?;
    let _ = ctx
        .event_bus
        .publish(SchedulerEvent::TaskStarted {
            execution_id: msg.execution_id,
            stage_id: msg.stage_id,
            task_id: msg.task_id,
            at: now,
        })
        .await;

    Ok(vec![SchedulerMessage::Task(TaskMessage::RunTask(RunTask {
        execution_id: msg.execution_id,
        stage_id: msg.stage_id,
        task_id: msg.task_id,
    }))])
}

/// `RunTask`: the repeatable unit of work. Checks the deadline, then invokes
/// the resolved [`Task`](crate::ports::Task) implementation. A `Running`
/// outcome re-queues itself after `backoffPeriod`; every other outcome
/// becomes a `CompleteTask`.
pub async fn run_task(ctx: &Context, msg: &RunTask) -> SchedulerResult<Vec<SchedulerMessage>> {
    let mut execution = ctx.repository.retrieve(msg.execution_id).await?;
    let now = Utc::now();

    let (implementing_type, past_deadline) = {
        let stage = execution.require_stage(msg.stage_id)?;
        let task = stage
            .task(msg.task_id)
            .ok_or(SchedulerError::TaskNotFound {
                stage_id: msg.stage_id,
                task_id: msg.task_id,
            })?;
        (task.implementing_type.clone(), task.is_past_deadline(now))
    };

    if past_deadline {
        warn!(execution_id = %msg.execution_id, stage_id = %msg.stage_id, task_id = msg.task_id, "task exceeded its deadline");
        return Ok(vec![complete_task_message(
            msg,
            TaskResult::terminal("task exceeded its deadline"),
        )]);
    }

    {
        let stage = execution.require_stage_mut(msg.stage_id)?;
        if let Some(task) = stage.task_mut(msg.task_id) {
            task.attempts += 1;
        }
    }
    ctx.repository.store(&execution).await?;

    let stage = execution.require_stage(msg.stage_id)?;
    let task_impl = ctx.task_runner.resolve(&implementing_type)?;
    let result = task_impl.execute(stage, msg.task_id).await?;

    match result.status {
        TaskOutcomeStatus::Running => {
            let delay = result.backoff_period.unwrap_or_default();
            ctx.queue
                .push(
                    SchedulerMessage::Task(TaskMessage::RunTask(msg.clone())),
                    Some(delay),
                )
                .await?;
            Ok(Vec::new())
        }
        _ => Ok(vec![complete_task_message(msg, result)]),
    }
}

fn complete_task_message(msg: &RunTask, result: TaskResult) -> SchedulerMessage {
    SchedulerMessage::Task(TaskMessage::CompleteTask(CompleteTask {
        execution_id: msg.execution_id,
        stage_id: msg.stage_id,
        task_id: msg.task_id,
        result,
    }))
}

/// `PauseTask`: freeze a running task awaiting manual resume.
pub async fn pause_task(
    ctx: &Context,
    msg: &crate::messages::PauseTask,
) -> SchedulerResult<Vec<SchedulerMessage>> {
    let mut execution = ctx.repository.retrieve(msg.execution_id).await?;
    let stage = execution.require_stage_mut(msg.stage_id)?;
    if let Some(task) = stage.task_mut(msg.task_id) {
        if task.status == Status::Running {
            task.status = Status::Paused;
        }
    }
    ctx.repository.store(&execution).await?;
    Ok(Vec::new())
}

/// `ResumeTask`: un-pause and re-enter the run loop.
pub async fn resume_task(
    ctx: &Context,
    msg: &crate::messages::ResumeTask,
) -> SchedulerResult<Vec<SchedulerMessage>> {
    let mut execution = ctx.repository.retrieve(msg.execution_id).await?;
    let stage = execution.require_stage_mut(msg.stage_id)?;
    if let Some(task) = stage.task_mut(msg.task_id) {
        if task.status == Status::Paused {
            task.status = Status::Running;
        }
    }
    ctx.repository.store(&execution).await?;
    Ok(vec![SchedulerMessage::Task(TaskMessage::RunTask(RunTask {
        execution_id: msg.execution_id,
        stage_id: msg.stage_id,
        task_id: msg.task_id,
    }))])
}

/// `CompleteTask`: apply the task-contract result to persisted state and
/// decide what happens next — advance to the next task, redirect the loop
/// range, or hand control back to the owning stage.
pub async fn complete_task(
    ctx: &Context,
    msg: &CompleteTask,
) -> SchedulerResult<Vec<SchedulerMessage>> {
    let mut execution = ctx.repository.retrieve(msg.execution_id).await?;
    let now = Utc::now();

    if msg.result.status == TaskOutcomeStatus::Redirect {
        let range = {
            let stage = execution.require_stage(msg.stage_id)?;
            stage.loop_range_for_redirect(msg.task_id)
        };
        let loop_start_id = *range.first().unwrap_or(&msg.task_id);
        let stage = execution.require_stage_mut(msg.stage_id)?;
        for task_id in &range {
            if let Some(task) = stage.task_mut(*task_id) {
                task.reset_for_redirect();
            }
        }
        ctx.repository.store(&execution).await?;
        return Ok(vec![SchedulerMessage::Task(TaskMessage::StartTask(
            StartTask {
                execution_id: msg.execution_id,
                stage_id: msg.stage_id,
                task_id: loop_start_id,
            },
        ))]);
    }

    let (next_task_id, stage_end, final_status) = {
        let stage = execution.require_stage_mut(msg.stage_id)?;
        if let Some(delta) = &msg.result.context_delta {
            merge_context(&mut stage.context, delta);
        }
        let next_task_id = stage.next_task(msg.task_id).map(|t| t.id);
        let stage_end = stage
            .task(msg.task_id)
            .map(|t| t.stage_end)
            .unwrap_or(false);

        let task = stage
            .task_mut(msg.task_id)
            .ok_or(SchedulerError::TaskNotFound {
                stage_id: msg.stage_id,
                task_id: msg.task_id,
            })?;
        task.end_time = Some(now);

        let final_status = apply_outcome(task, &msg.result);
        (next_task_id, stage_end, final_status)
    };

    ctx.repository.store(&execution).await?;
    let _ = ctx
        .event_bus
        .publish(SchedulerEvent::TaskComplete {
            execution_id: msg.execution_id,
            stage_id: msg.stage_id,
            task_id: msg.task_id,
            status: final_status,
            at: now,
        })
        .await;

    if final_status.is_stage_complete() && !stage_end {
        if let Some(next_task_id) = next_task_id {
            return Ok(vec![SchedulerMessage::Task(TaskMessage::StartTask(
                StartTask {
                    execution_id: msg.execution_id,
                    stage_id: msg.stage_id,
                    task_id: next_task_id,
                },
            ))]);
        }
    }

    info!(execution_id = %msg.execution_id, stage_id = %msg.stage_id, task_id = msg.task_id, status = %final_status, "task sequence ended, handing off to stage");
    Ok(vec![SchedulerMessage::Stage(
        crate::messages::StageMessage::CompleteStage(crate::messages::CompleteStage {
            execution_id: msg.execution_id,
            stage_id: msg.stage_id,
        }),
    )])
}

/// Applies a [`TaskResult`] to its owning [`TaskExecution`], performing the
/// continueOnFailure substitution (spec §4.4: a TERMINAL outcome on a task
/// with `continueOnFailure` is recorded as FAILED_CONTINUE, with the real
/// outcome preserved in `original_status`). Returns the status actually
/// recorded.
fn apply_outcome(task: &mut TaskExecution, result: &TaskResult) -> Status {
    let mapped = match result.status {
        TaskOutcomeStatus::Succeeded => Status::Succeeded,
        TaskOutcomeStatus::Terminal => Status::Terminal,
        TaskOutcomeStatus::Paused => Status::Paused,
        TaskOutcomeStatus::Canceled => Status::Canceled,
        TaskOutcomeStatus::Skipped => Status::Skipped,
        TaskOutcomeStatus::Running | TaskOutcomeStatus::Redirect => unreachable!(
            "Running/Redirect are handled before apply_outcome is reached"
        ),
    };

    if mapped == Status::Terminal && task.continue_on_failure {
        task.original_status = Some(Status::Terminal);
        task.status = Status::FailedContinue;
    } else {
        task.status = mapped;
    }
    task.status
}

fn merge_context(context: &mut serde_json::Value, delta: &serde_json::Value) {
    if let (serde_json::Value::Object(base), serde_json::Value::Object(delta)) =
        (context, delta)
    {
        for (k, v) in delta {
            base.insert(k.clone(), v.clone());
        }
    }
}
