//! Stage controller (spec §4.5, C6): StartStage/CompleteStage/SkipStage/
//! AbortStage/CancelStage/ContinueParentStage, plus the before/after
//! synthetic-stage handoff.

use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use crate::context::Context;
use crate::errors::{SchedulerError, SchedulerResult};
use crate::graph;
use crate::messages::{
    AbortStage, CancelStage, CompleteStage, ContinueParentStage, SchedulerMessage, SkipStage,
    StageMessage, StartStage, TaskMessage,
};
use crate::model::{PipelineExecution, Status};
use crate::ports::SchedulerEvent;

/// `StartStage`: expand the before-block if needed, then either fan out to
/// it or begin the stage's own tasks.
pub async fn start_stage(ctx: &Context, msg: &StartStage) -> SchedulerResult<Vec<SchedulerMessage>> {
    let mut execution = ctx.repository.retrieve(msg.execution_id).await?;
    {
        let stage = execution.require_stage(msg.stage_id)?;
        if stage.status != Status::NotStarted {
            return Ok(Vec::new());
        }
    }

    let before_ids = match graph::expand_before_stages(&mut execution, msg.stage_id, ctx.stage_builder.as_ref()) {
        Ok(ids) => ids,
        Err(err) if err.is_configuration_failure() => {
            return mark_stage_terminal_for_configuration_failure(ctx, &mut execution, msg.execution_id, msg.stage_id, &err).await;
        }
        Err(err) => return Err(err),
    };

    let now = Utc::now();
    let stage = execution.require_stage_mut(msg.stage_id)?;
    stage.status = Status::Running;
    stage.start_time = Some(now);

    let mut outbox = Vec::new();

    if !before_ids.is_empty() {
        for before_id in &before_ids {
            outbox.push(start_stage_message(msg.execution_id, *before_id));
        }
    } else {
        outbox.extend(enter_own_tasks(&mut execution, msg.execution_id, msg.stage_id)?);
    }

    ctx.repository.store(&execution).await?;
    let _ = ctx
        .event_bus
        .publish(SchedulerEvent::StageStarted {
            execution_id: msg.execution_id,
            stage_id: msg.stage_id,
            at: now,
        })
        .await;

    Ok(outbox)
}

/// Begin a stage's own task sequence, or — if it has none — skip straight to
/// completion (spec §9: zero-task stage with nonempty beforeStages still
/// runs its before-block, then completes immediately).
fn enter_own_tasks(
    execution: &mut PipelineExecution,
    execution_id: Uuid,
    stage_id: Uuid,
) -> SchedulerResult<Vec<SchedulerMessage>> {
    let stage = execution.require_stage(stage_id)?;
    if let Some(first) = stage.first_task() {
        let task_id = first.id;
        Ok(vec![SchedulerMessage::Task(TaskMessage::StartTask(
            crate::messages::StartTask {
                execution_id,
                stage_id,
                task_id,
            },
        ))])
    } else {
        Ok(vec![SchedulerMessage::Stage(StageMessage::CompleteStage(
            CompleteStage {
                execution_id,
                stage_id,
            },
        ))])
    }
}

fn start_stage_message(execution_id: Uuid, stage_id: Uuid) -> SchedulerMessage {
    SchedulerMessage::Stage(StageMessage::StartStage(StartStage {
        execution_id,
        stage_id,
    }))
}

/// `CompleteStage`: fires once every own task is terminal. Expands and
/// fans out to the after-block on first arrival; finalizes the stage once
/// there's no after-block left to run.
pub async fn complete_stage(
    ctx: &Context,
    msg: &CompleteStage,
) -> SchedulerResult<Vec<SchedulerMessage>> {
    let mut execution = ctx.repository.retrieve(msg.execution_id).await?;

    {
        let stage = execution.require_stage(msg.stage_id)?;
        if stage.status.is_terminal() || !stage.all_tasks_terminal() {
            return Ok(Vec::new());
        }
    }

    if !execution.require_stage(msg.stage_id)?.after_block_started {
        let after_ids = match graph::expand_after_stages(&mut execution, msg.stage_id, ctx.stage_builder.as_ref()) {
            Ok(ids) => ids,
            Err(err) if err.is_configuration_failure() => {
                return mark_stage_terminal_for_configuration_failure(ctx, &mut execution, msg.execution_id, msg.stage_id, &err).await;
            }
            Err(err) => return Err(err),
        };
        execution.require_stage_mut(msg.stage_id)?.after_block_started = true;

        if !after_ids.is_empty() {
            ctx.repository.store(&execution).await?;
            return Ok(after_ids
                .into_iter()
                .map(|id| start_stage_message(msg.execution_id, id))
                .collect());
        }
    }

    let outbox = finalize_stage(&mut execution, msg.execution_id, msg.stage_id)?;
    ctx.repository.store(&execution).await?;
    let status = execution.require_stage(msg.stage_id)?.status;
    let _ = ctx
        .event_bus
        .publish(SchedulerEvent::StageComplete {
            execution_id: msg.execution_id,
            stage_id: msg.stage_id,
            status,
            at: Utc::now(),
        })
        .await;
    Ok(outbox)
}

/// Records the stage's terminal status (worst of its own tasks) and decides
/// what happens next: hand control back to a synthetic parent, or — for a
/// top-level stage — enqueue downstream stages and a completion check.
fn finalize_stage(
    execution: &mut PipelineExecution,
    execution_id: Uuid,
    stage_id: Uuid,
) -> SchedulerResult<Vec<SchedulerMessage>> {
    let now = Utc::now();
    let (is_synthetic, parent_id, is_top_level, ref_id, worst, complete_others_then_fail) = {
        let stage = execution.require_stage_mut(stage_id)?;
        let worst = stage.worst_task_status().unwrap_or(Status::Succeeded);
        let complete_others_then_fail = stage.complete_other_branches_then_fail();
        // A fatal stage carrying completeOtherBranchesThenFail is recorded as
        // STOPPED rather than its raw TERMINAL/CANCELED status, so
        // `derive_final_status` waits for every sibling to settle before
        // folding to TERMINAL (spec §4.5) instead of finalizing on this
        // stage alone.
        stage.status = if worst.is_fatal() && complete_others_then_fail {
            Status::Stopped
        } else {
            worst
        };
        stage.end_time = Some(now);
        (
            stage.is_synthetic(),
            stage.parent_stage_id,
            stage.is_top_level(),
            stage.ref_id.clone(),
            worst,
            complete_others_then_fail,
        )
    };

    if is_synthetic {
        let parent_id = parent_id.expect("synthetic stage always has a parent");
        return Ok(vec![SchedulerMessage::Stage(
            StageMessage::ContinueParentStage(ContinueParentStage {
                execution_id,
                parent_stage_id: parent_id,
            }),
        )]);
    }

    if !is_top_level {
        return Ok(Vec::new());
    }

    let complete_execution = SchedulerMessage::Execution(
        crate::messages::ExecutionMessage::CompleteExecution(
            crate::messages::CompleteExecution { execution_id },
        ),
    );

    if worst.is_fatal() {
        // On TERMINAL/CANCELED: cancel running siblings and force the
        // finalization path, unless the stage asked to let its siblings run
        // to completion before the execution is marked TERMINAL.
        let mut outbox = Vec::new();
        if !complete_others_then_fail {
            for sibling in execution.top_level_stages() {
                if sibling.id != stage_id && sibling.status == Status::Running {
                    outbox.push(SchedulerMessage::Stage(StageMessage::CancelStage(
                        CancelStage {
                            execution_id,
                            stage_id: sibling.id,
                        },
                    )));
                }
            }
        }
        outbox.push(complete_execution);
        return Ok(outbox);
    }

    let mut outbox = Vec::new();
    for downstream_id in execution.downstream_of(&ref_id) {
        if execution.upstreams_complete(downstream_id) {
            outbox.push(start_stage_message(execution_id, downstream_id));
        }
    }
    outbox.push(complete_execution);
    Ok(outbox)
}

/// Stage builder lookup failed for this stage's type (spec §7: configuration
/// failure). Marks the stage TERMINAL with a synthetic reason recorded in its
/// context, then hands off exactly as AbortStage would — without a
/// CancelStage, since nothing external ever started running.
async fn mark_stage_terminal_for_configuration_failure(
    ctx: &Context,
    execution: &mut PipelineExecution,
    execution_id: Uuid,
    stage_id: Uuid,
    err: &SchedulerError,
) -> SchedulerResult<Vec<SchedulerMessage>> {
    let (is_synthetic, parent_id) = {
        let stage = execution.require_stage_mut(stage_id)?;
        stage.status = Status::Terminal;
        stage.end_time = Some(Utc::now());
        if let serde_json::Value::Object(map) = &mut stage.context {
            map.insert("terminationReason".into(), serde_json::Value::String(err.to_string()));
        }
        (stage.is_synthetic(), stage.parent_stage_id)
    };
    ctx.repository.store(execution).await?;
    tracing::warn!(%execution_id, %stage_id, error = %err, "stage builder lookup failed, marking stage terminal");

    if is_synthetic {
        let parent_id = parent_id.expect("synthetic stage always has a parent");
        Ok(vec![SchedulerMessage::Stage(StageMessage::ContinueParentStage(
            ContinueParentStage {
                execution_id,
                parent_stage_id: parent_id,
            },
        ))])
    } else {
        Ok(vec![SchedulerMessage::Execution(
            crate::messages::ExecutionMessage::CompleteExecution(
                crate::messages::CompleteExecution { execution_id },
            ),
        )])
    }
}

/// `ContinueParentStage`: fired when a before- or after-block child
/// completes. Advances the parent once every sibling under the same block
/// has reached a stage-complete status.
pub async fn continue_parent_stage(
    ctx: &Context,
    msg: &ContinueParentStage,
) -> SchedulerResult<Vec<SchedulerMessage>> {
    let mut execution = ctx.repository.retrieve(msg.execution_id).await?;
    let parent = execution.require_stage(msg.parent_stage_id)?;

    let before_complete = parent
        .before_stage_ids
        .iter()
        .all(|id| execution.stage(*id).is_some_and(|s| s.status.is_stage_complete() || s.status.is_fatal()));
    let before_failed = parent
        .before_stage_ids
        .iter()
        .any(|id| execution.stage(*id).is_some_and(|s| s.status.is_fatal()));
    let before_block_complete = parent.before_block_complete;
    let after_started = parent.after_block_started;

    if !before_block_complete && before_complete {
        if before_failed {
            let outbox = finalize_stage(&mut execution, msg.execution_id, msg.parent_stage_id)?;
            ctx.repository.store(&execution).await?;
            return Ok(outbox);
        }
        execution
            .require_stage_mut(msg.parent_stage_id)?
            .before_block_complete = true;
        let outbox = enter_own_tasks(&mut execution, msg.execution_id, msg.parent_stage_id)?;
        ctx.repository.store(&execution).await?;
        return Ok(outbox);
    }

    if after_started {
        let parent = execution.require_stage(msg.parent_stage_id)?;
        let after_complete = parent
            .after_stage_ids
            .iter()
            .all(|id| execution.stage(*id).is_some_and(|s| s.status.is_terminal()));
        if after_complete {
            let outbox = finalize_stage(&mut execution, msg.execution_id, msg.parent_stage_id)?;
            ctx.repository.store(&execution).await?;
            return Ok(outbox);
        }
    }

    Ok(Vec::new())
}

/// `SkipStage`: manual skip, only honored when the stage hasn't started and
/// its builder's `canManuallySkip` gate authorizes it (spec §4.5, §7). A
/// denied gate is "judgment not yet given" — the stage is left untouched
/// rather than treated as an error.
pub async fn skip_stage(ctx: &Context, msg: &SkipStage) -> SchedulerResult<Vec<SchedulerMessage>> {
    let mut execution = ctx.repository.retrieve(msg.execution_id).await?;
    let stage = execution.require_stage_mut(msg.stage_id)?;
    if stage.status != Status::NotStarted {
        return Ok(Vec::new());
    }
    if !ctx.stage_builder.can_manually_skip(&stage.stage_type) {
        return Ok(Vec::new());
    }
    stage.status = Status::Skipped;
    stage.start_time = Some(Utc::now());
    stage.end_time = Some(Utc::now());
    let is_top_level = stage.is_top_level();
    let ref_id = stage.ref_id.clone();
    ctx.repository.store(&execution).await?;

    if !is_top_level {
        return Ok(Vec::new());
    }
    let mut outbox: Vec<SchedulerMessage> = execution
        .downstream_of(&ref_id)
        .into_iter()
        .filter(|id| execution.upstreams_complete(*id))
        .map(|id| start_stage_message(msg.execution_id, id))
        .collect();
    outbox.push(SchedulerMessage::Execution(
        crate::messages::ExecutionMessage::CompleteExecution(
            crate::messages::CompleteExecution {
                execution_id: msg.execution_id,
            },
        ),
    ));
    Ok(outbox)
}

/// `AbortStage`: mark the stage TERMINAL immediately, push a CancelStage
/// side-effect signal, then hand control to whatever completes it next — the
/// synthetic parent's handoff protocol, or execution finalization for a
/// top-level stage.
pub async fn abort_stage(ctx: &Context, msg: &AbortStage) -> SchedulerResult<Vec<SchedulerMessage>> {
    let mut execution = ctx.repository.retrieve(msg.execution_id).await?;
    let (is_terminal, is_synthetic, parent_id) = {
        let stage = execution.require_stage(msg.stage_id)?;
        (stage.status.is_terminal(), stage.is_synthetic(), stage.parent_stage_id)
    };
    if is_terminal {
        return Ok(Vec::new());
    }

    {
        let stage = execution.require_stage_mut(msg.stage_id)?;
        stage.status = Status::Terminal;
        stage.end_time = Some(Utc::now());
    }
    ctx.repository.store(&execution).await?;

    let mut outbox = vec![SchedulerMessage::Stage(StageMessage::CancelStage(
        CancelStage {
            execution_id: msg.execution_id,
            stage_id: msg.stage_id,
        },
    ))];
    if is_synthetic {
        let parent_id = parent_id.expect("synthetic stage always has a parent");
        outbox.push(SchedulerMessage::Stage(StageMessage::ContinueParentStage(
            ContinueParentStage {
                execution_id: msg.execution_id,
                parent_stage_id: parent_id,
            },
        )));
    } else {
        outbox.push(SchedulerMessage::Execution(
            crate::messages::ExecutionMessage::CompleteExecution(
                crate::messages::CompleteExecution {
                    execution_id: msg.execution_id,
                },
            ),
        ));
    }
    Ok(outbox)
}

/// `PauseStage`: freeze a running stage and every task currently executing
/// under it.
pub async fn pause_stage(
    ctx: &Context,
    msg: &crate::messages::PauseStage,
) -> SchedulerResult<Vec<SchedulerMessage>> {
    let mut execution = ctx.repository.retrieve(msg.execution_id).await?;
    let stage = execution.require_stage_mut(msg.stage_id)?;
    if stage.status != Status::Running {
        return Ok(Vec::new());
    }
    stage.status = Status::Paused;
    let running_tasks: Vec<u32> = stage
        .tasks
        .iter()
        .filter(|t| t.status == Status::Running)
        .map(|t| t.id)
        .collect();
    ctx.repository.store(&execution).await?;

    Ok(running_tasks
        .into_iter()
        .map(|task_id| {
            SchedulerMessage::Task(TaskMessage::PauseTask(crate::messages::PauseTask {
                execution_id: msg.execution_id,
                stage_id: msg.stage_id,
                task_id,
            }))
        })
        .collect())
}

/// `ResumeStage`: un-pause a stage and resume its paused tasks.
pub async fn resume_stage(
    ctx: &Context,
    msg: &crate::messages::ResumeStage,
) -> SchedulerResult<Vec<SchedulerMessage>> {
    let mut execution = ctx.repository.retrieve(msg.execution_id).await?;
    let stage = execution.require_stage_mut(msg.stage_id)?;
    if stage.status != Status::Paused {
        return Ok(Vec::new());
    }
    stage.status = Status::Running;
    let paused_tasks: Vec<u32> = stage
        .tasks
        .iter()
        .filter(|t| t.status == Status::Paused)
        .map(|t| t.id)
        .collect();
    ctx.repository.store(&execution).await?;

    Ok(paused_tasks
        .into_iter()
        .map(|task_id| {
            SchedulerMessage::Task(TaskMessage::ResumeTask(crate::messages::ResumeTask {
                execution_id: msg.execution_id,
                stage_id: msg.stage_id,
                task_id,
            }))
        })
        .collect())
}

/// `RestartStage`: re-enter a previously-completed top-level stage from
/// scratch, after giving the catalog a chance to rewrite its context (e.g.
/// clearing a cached target revision). Synthetic children from the prior
/// attempt are discarded; the graph expander will re-materialize them.
pub async fn restart_stage(
    ctx: &Context,
    msg: &crate::messages::RestartStage,
) -> SchedulerResult<Vec<SchedulerMessage>> {
    let mut execution = ctx.repository.retrieve(msg.execution_id).await?;
    let prior_children: Vec<Uuid> = execution.descendants(msg.stage_id);

    {
        let stage = execution.require_stage_mut(msg.stage_id)?;
        if !stage.status.is_terminal() && stage.status != Status::Stopped {
            return Ok(Vec::new());
        }
        ctx.stage_builder.prepare_stage_for_restart(stage);
        stage.status = Status::NotStarted;
        stage.start_time = None;
        stage.end_time = None;
        stage.before_stage_ids.clear();
        stage.after_stage_ids.clear();
        stage.parallel_stage_ids.clear();
        stage.synthetics_expanded = false;
        stage.before_block_complete = false;
        stage.after_block_started = false;
        for task in &mut stage.tasks {
            task.reset_for_redirect();
        }
    }
    execution.stages.retain(|s| !prior_children.contains(&s.id));

    ctx.repository.store(&execution).await?;
    Ok(vec![start_stage_message(msg.execution_id, msg.stage_id)])
}

/// `CancelStage`: a pure side-effect signal telling an external operation to
/// abort — it never mutates stage status or enqueues further messages. Stage
/// state transitions are driven entirely by the corresponding
/// CompleteStage/AbortStage. A no-op for SUCCEEDED, NOT_STARTED, or a stage
/// whose builder has nothing to cancel (the default `cancel()` hook).
pub async fn cancel_stage(ctx: &Context, msg: &CancelStage) -> SchedulerResult<Vec<SchedulerMessage>> {
    let execution = ctx.repository.retrieve(msg.execution_id).await?;
    let Some(stage) = execution.stage(msg.stage_id) else {
        return Ok(Vec::new());
    };
    if !matches!(
        stage.status,
        Status::Running | Status::Canceled | Status::Terminal
    ) {
        return Ok(Vec::new());
    }
    if let Err(err) = ctx.stage_builder.cancel(stage).await {
        info!(execution_id = %msg.execution_id, stage_id = %msg.stage_id, error = %err, "stage cancel hook failed, continuing");
    }
    Ok(Vec::new())
}
