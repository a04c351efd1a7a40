//! Handler dispatcher (spec §4.2, C4): the single entry point that reads a
//! message off the queue, serializes it against its execution via an
//! advisory lock, and routes it to the matching lifecycle handler.

pub mod lock;

use std::time::Duration;

use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::context::Context;
use crate::errors::{SchedulerError, SchedulerResult};
use crate::messages::{
    CancelStage, ExecutionMessage, SchedulerMessage, StageMessage, StartWaitingExecutions,
    TaskMessage,
};
use crate::model::Status;
use crate::ports::SchedulerEvent;

pub mod handlers {
    pub use crate::handlers::*;
}

/// Reads one message from the queue and dispatches it to completion,
/// including backoff re-queue / Invalid-marker conversion on failure.
/// Returns `true` if a message was processed, `false` if the queue was
/// empty (callers typically loop on this with their own idle sleep).
pub async fn run_once(ctx: &Context) -> SchedulerResult<bool> {
    let Some((message, handle)) = ctx.queue.poll().await? else {
        return Ok(false);
    };

    let attempts = ctx.queue.attempts(handle.as_ref()).await?;
    let execution_id = message.execution_id();
    let kind = message.kind();

    let span = info_span!("dispatch", %execution_id, message_kind = kind, attempts);
    async {
        let acquired = ctx.lock.try_acquire(
            execution_id,
            chrono::Utc::now(),
            ctx.config.dispatcher_lock_ttl,
        );
        if !acquired {
            warn!("execution locked by another in-flight handler, re-queuing");
            ctx.queue
                .nack(handle, Some(Duration::from_secs(1)))
                .await?;
            return Ok(());
        }

        let outcome = dispatch(ctx, &message).await;
        ctx.lock.release(execution_id);

        match outcome {
            Ok(follow_ups) => {
                ctx.queue.ack(handle).await?;
                for follow_up in follow_ups {
                    ctx.queue.push(follow_up, None).await?;
                }
            }
            Err(err) if err.is_transient() => {
                if crate::retry::exhausted(&ctx.config, attempts) {
                    error!(error = %err, "message exhausted retry attempts, forcing execution terminal");
                    if let Err(force_err) = force_terminal_on_exhaustion(ctx, execution_id, kind, &err).await {
                        error!(error = %force_err, "failed to force execution terminal after retry exhaustion");
                    }
                    ctx.queue.ack(handle).await?;
                } else {
                    let delay = crate::retry::message_retry_delay(&ctx.config, attempts);
                    warn!(error = %err, delay_ms = delay.as_millis() as u64, "transient failure, re-queuing");
                    ctx.queue.nack(handle, Some(delay)).await?;
                }
            }
            Err(err) => {
                error!(error = %err, "non-transient failure, dropping message as invalid");
                ctx.queue.ack(handle).await?;
            }
        }

        Ok(())
    }
    .instrument(span)
    .await?;

    info!("message processed");
    Ok(true)
}

/// A message that exhausted its retry budget would otherwise sit acked-away
/// forever with its execution stuck RUNNING (spec §4.8). Forces the
/// execution to TERMINAL instead, stamping a synthetic reason, and pushes
/// `CancelStage` for any top-level stage still RUNNING so the rest of the
/// DAG has a chance to converge — mirroring `complete_execution`'s own
/// non-SUCCEEDED sibling-cancel.
async fn force_terminal_on_exhaustion(
    ctx: &Context,
    execution_id: Uuid,
    message_kind: &str,
    err: &SchedulerError,
) -> SchedulerResult<()> {
    let mut execution = ctx.repository.retrieve(execution_id).await?;
    if execution.status.is_terminal() {
        return Ok(());
    }

    let still_running: Vec<Uuid> = execution
        .top_level_stages()
        .filter(|s| s.status == Status::Running)
        .map(|s| s.id)
        .collect();

    execution.status = Status::Terminal;
    execution.end_time = Some(chrono::Utc::now());
    execution.extra.insert(
        "terminationReason".into(),
        serde_json::Value::String(format!(
            "{message_kind} exhausted retry attempts: {err}"
        )),
    );
    let config_id = execution.pipeline_config_id.clone();
    let limit_concurrent = execution.limit_concurrent;
    let keep_waiting_pipelines = execution.keep_waiting_pipelines;
    ctx.repository.store(&execution).await?;
    let _ = ctx
        .event_bus
        .publish(SchedulerEvent::ExecutionComplete {
            execution_id,
            status: Status::Terminal,
            at: chrono::Utc::now(),
        })
        .await;

    for stage_id in still_running {
        ctx.queue
            .push(
                SchedulerMessage::Stage(StageMessage::CancelStage(CancelStage {
                    execution_id,
                    stage_id,
                })),
                None,
            )
            .await?;
    }

    if limit_concurrent {
        if let Some(config_id) = config_id {
            ctx.admission.release(&config_id);
            ctx.queue
                .push(
                    SchedulerMessage::Execution(ExecutionMessage::StartWaitingExecutions(
                        StartWaitingExecutions {
                            pipeline_config_id: config_id,
                            purge_queue: !keep_waiting_pipelines,
                        },
                    )),
                    None,
                )
                .await?;
        }
    }
    Ok(())
}

async fn dispatch(
    ctx: &Context,
    message: &SchedulerMessage,
) -> SchedulerResult<Vec<SchedulerMessage>> {
    match message {
        SchedulerMessage::Execution(m) => match m {
            ExecutionMessage::StartExecution(m) => handlers::execution::start_execution(ctx, m).await,
            ExecutionMessage::CompleteExecution(m) => {
                handlers::execution::complete_execution(ctx, m).await
            }
            ExecutionMessage::CancelExecution(m) => handlers::execution::cancel_execution(ctx, m).await,
            ExecutionMessage::ResumeExecution(m) => handlers::execution::resume_execution(ctx, m).await,
            ExecutionMessage::StartWaitingExecutions(m) => {
                handlers::execution::start_waiting_executions(ctx, m).await
            }
            ExecutionMessage::RescheduleExecution(m) => {
                handlers::execution::reschedule_execution(ctx, m).await
            }
        },
        SchedulerMessage::Stage(m) => match m {
            StageMessage::StartStage(m) => handlers::stage::start_stage(ctx, m).await,
            StageMessage::CompleteStage(m) => handlers::stage::complete_stage(ctx, m).await,
            StageMessage::SkipStage(m) => handlers::stage::skip_stage(ctx, m).await,
            StageMessage::AbortStage(m) => handlers::stage::abort_stage(ctx, m).await,
            StageMessage::CancelStage(m) => handlers::stage::cancel_stage(ctx, m).await,
            StageMessage::ContinueParentStage(m) => {
                handlers::stage::continue_parent_stage(ctx, m).await
            }
            StageMessage::RestartStage(m) => handlers::stage::restart_stage(ctx, m).await,
            StageMessage::PauseStage(m) => handlers::stage::pause_stage(ctx, m).await,
            StageMessage::ResumeStage(m) => handlers::stage::resume_stage(ctx, m).await,
        },
        SchedulerMessage::Task(m) => match m {
            TaskMessage::StartTask(m) => handlers::task::start_task(ctx, m).await,
            TaskMessage::RunTask(m) => handlers::task::run_task(ctx, m).await,
            TaskMessage::CompleteTask(m) => handlers::task::complete_task(ctx, m).await,
            TaskMessage::PauseTask(m) => handlers::task::pause_task(ctx, m).await,
            TaskMessage::ResumeTask(m) => handlers::task::resume_task(ctx, m).await,
            TaskMessage::InvalidTask(m) => {
                warn!(execution_id = %m.execution_id, stage_id = %m.stage_id, task_id = m.task_id, reason = %m.reason, "task marked invalid");
                Ok(Vec::new())
            }
        },
    }
}
