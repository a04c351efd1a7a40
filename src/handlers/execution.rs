//! Execution controller (spec §4.6, §4.10, C7): admission, top-level
//! fan-out, and final status derivation.

use chrono::Utc;
use uuid::Uuid;

use crate::context::Context;
use crate::errors::SchedulerResult;
use crate::messages::{
    CancelExecution, CompleteExecution, RescheduleExecution, ResumeExecution, SchedulerMessage,
    StageMessage, StartExecution, StartStage, StartWaitingExecutions,
};
use crate::model::Status;
use crate::ports::SchedulerEvent;

/// A pipeline with `limitConcurrent` set admits only one running execution
/// per `pipelineConfigId` at a time — this mirrors the boolean
/// "limit concurrent executions" toggle on a real pipeline config rather
/// than an arbitrary numeric slot count.
const LIMIT_CONCURRENT_SLOTS: u32 = 1;

/// `StartExecution`: admission, cycle check, and enqueuing every root stage.
pub async fn start_execution(
    ctx: &Context,
    msg: &StartExecution,
) -> SchedulerResult<Vec<SchedulerMessage>> {
    let mut execution = ctx.repository.retrieve(msg.execution_id).await?;
    if execution.status != Status::NotStarted {
        return Ok(Vec::new());
    }

    if let Some(path) = execution.detect_cycle() {
        execution.status = Status::Terminal;
        execution.end_time = Some(Utc::now());
        ctx.repository.store(&execution).await?;
        tracing::warn!(execution_id = %msg.execution_id, cycle = ?path, "refusing to start execution with a dependency cycle");
        return Ok(Vec::new());
    }

    if execution.limit_concurrent {
        let Some(config_id) = execution.pipeline_config_id.clone() else {
            return Ok(Vec::new());
        };
        if !ctx.admission.try_admit(&config_id, LIMIT_CONCURRENT_SLOTS) {
            // Stay NOT_STARTED; StartWaitingExecutions will pick this up once
            // a slot frees.
            return Ok(Vec::new());
        }
    }

    let now = Utc::now();
    execution.status = Status::Running;
    execution.start_time = Some(now);
    let roots = execution.top_level_roots();
    ctx.repository.store(&execution).await?;
    let _ = ctx
        .event_bus
        .publish(SchedulerEvent::ExecutionStarted {
            execution_id: msg.execution_id,
            at: now,
        })
        .await;

    Ok(roots
        .into_iter()
        .map(|stage_id| {
            SchedulerMessage::Stage(StageMessage::StartStage(StartStage {
                execution_id: msg.execution_id,
                stage_id,
            }))
        })
        .collect())
}

/// `CompleteExecution`: re-derives the final status from top-level stages;
/// a `None` result means some branch is still pending and this is a no-op
/// (the handler that completed that branch will re-fire this message). A
/// non-SUCCEEDED finalization also cancels whatever top-level stages are
/// still RUNNING, so a TERMINAL/CANCELED verdict reached from one branch
/// doesn't leave an unrelated sibling branch running forever.
pub async fn complete_execution(
    ctx: &Context,
    msg: &CompleteExecution,
) -> SchedulerResult<Vec<SchedulerMessage>> {
    let mut execution = ctx.repository.retrieve(msg.execution_id).await?;
    if execution.status.is_terminal() {
        return Ok(Vec::new());
    }

    let Some(status) = execution.derive_final_status() else {
        return Ok(Vec::new());
    };

    let still_running: Vec<Uuid> = if status != Status::Succeeded {
        execution
            .top_level_stages()
            .filter(|s| s.status == Status::Running)
            .map(|s| s.id)
            .collect()
    } else {
        Vec::new()
    };

    execution.status = status;
    execution.end_time = Some(Utc::now());
    let config_id = execution.pipeline_config_id.clone();
    let limit_concurrent = execution.limit_concurrent;
    let keep_waiting_pipelines = execution.keep_waiting_pipelines;
    ctx.repository.store(&execution).await?;
    let _ = ctx
        .event_bus
        .publish(SchedulerEvent::ExecutionComplete {
            execution_id: msg.execution_id,
            status,
            at: Utc::now(),
        })
        .await;

    let mut outbox: Vec<SchedulerMessage> = still_running
        .into_iter()
        .map(|stage_id| {
            SchedulerMessage::Stage(StageMessage::CancelStage(crate::messages::CancelStage {
                execution_id: msg.execution_id,
                stage_id,
            }))
        })
        .collect();

    if limit_concurrent {
        if let Some(config_id) = config_id {
            ctx.admission.release(&config_id);
            outbox.push(SchedulerMessage::Execution(
                crate::messages::ExecutionMessage::StartWaitingExecutions(
                    StartWaitingExecutions {
                        pipeline_config_id: config_id,
                        purge_queue: !keep_waiting_pipelines,
                    },
                ),
            ));
        }
    }
    Ok(outbox)
}

/// `CancelExecution`: the top-level abort signal. Pushes AbortStage for
/// every running top-level stage rather than flipping the execution to
/// CANCELED directly — the normal finalization path (each AbortStage marking
/// its stage TERMINAL, then CompleteExecution re-deriving the final status)
/// is what actually converges the execution to a terminal status.
pub async fn cancel_execution(
    ctx: &Context,
    msg: &CancelExecution,
) -> SchedulerResult<Vec<SchedulerMessage>> {
    let execution = ctx.repository.retrieve(msg.execution_id).await?;
    if execution.status.is_terminal() {
        return Ok(Vec::new());
    }
    Ok(execution
        .top_level_stages()
        .filter(|s| s.status == Status::Running)
        .map(|s| {
            SchedulerMessage::Stage(StageMessage::AbortStage(crate::messages::AbortStage {
                execution_id: msg.execution_id,
                stage_id: s.id,
            }))
        })
        .collect())
}

/// `ResumeExecution`: resumes every PAUSED stage.
pub async fn resume_execution(
    ctx: &Context,
    msg: &ResumeExecution,
) -> SchedulerResult<Vec<SchedulerMessage>> {
    let execution = ctx.repository.retrieve(msg.execution_id).await?;
    Ok(execution
        .stages
        .iter()
        .filter(|s| s.status == Status::Paused)
        .map(|s| {
            SchedulerMessage::Stage(StageMessage::ResumeStage(crate::messages::ResumeStage {
                execution_id: msg.execution_id,
                stage_id: s.id,
            }))
        })
        .collect())
}

/// `StartWaitingExecutions`: admits the next queued execution for a
/// `pipelineConfigId`, or — with `purgeQueue` — truncates the waiting queue
/// to its newest entry (CANCELing the rest; spec §9 open question: purged
/// waiting executions are marked CANCELED, not silently discarded) and
/// promotes that survivor if a slot is free (spec §4.7 Purge).
pub async fn start_waiting_executions(
    ctx: &Context,
    msg: &StartWaitingExecutions,
) -> SchedulerResult<Vec<SchedulerMessage>> {
    let waiting = ctx
        .repository
        .retrieve_waiting_for_config(&msg.pipeline_config_id)
        .await?;

    let survivor = if msg.purge_queue {
        let Some((&newest, stale)) = waiting.split_last() else {
            return Ok(Vec::new());
        };
        for &execution_id in stale {
            let mut execution = ctx.repository.retrieve(execution_id).await?;
            if !execution.status.is_terminal() {
                execution.status = Status::Canceled;
                execution.end_time = Some(Utc::now());
                ctx.repository.store(&execution).await?;
            }
        }
        Some(newest)
    } else {
        waiting.first().copied()
    };

    if let Some(next) = survivor {
        let running = ctx
            .repository
            .count_running_for_config(&msg.pipeline_config_id)
            .await?;
        if running < LIMIT_CONCURRENT_SLOTS {
            return Ok(vec![SchedulerMessage::Execution(
                crate::messages::ExecutionMessage::StartExecution(StartExecution {
                    execution_id: next,
                }),
            )]);
        }
    }
    Ok(Vec::new())
}

/// `RescheduleExecution`: recovery hook for an execution whose in-flight
/// task messages were lost (e.g. a crashed worker). Re-issues `RunTask` for
/// every task still RUNNING.
pub async fn reschedule_execution(
    ctx: &Context,
    msg: &RescheduleExecution,
) -> SchedulerResult<Vec<SchedulerMessage>> {
    let execution = ctx.repository.retrieve(msg.execution_id).await?;
    let mut outbox = Vec::new();
    for stage in &execution.stages {
        if stage.status != Status::Running {
            continue;
        }
        for task in &stage.tasks {
            if task.status == Status::Running {
                outbox.push(SchedulerMessage::Task(crate::messages::TaskMessage::RunTask(
                    crate::messages::RunTask {
                        execution_id: msg.execution_id,
                        stage_id: stage.id,
                        task_id: task.id,
                    },
                )));
            }
        }
    }
    Ok(outbox)
}
