//! End-to-end scenarios driving the dispatcher against the in-memory
//! reference ports: a single-stage happy path, a fan-out/fan-in DAG, a
//! task-level retry, a REDIRECT loop, and a cancellation cascade.

use std::sync::Arc;
use std::time::Duration;

use pipeline_scheduler::config::SchedulerConfig;
use pipeline_scheduler::messages::{
    ExecutionMessage, SchedulerMessage, StartExecution,
};
use pipeline_scheduler::model::{ExecutionType, PipelineExecution, Status, StageExecution, TaskExecution};
use pipeline_scheduler::ports::Queue;
use pipeline_scheduler::testing::{FixedStageCatalog, FixedTaskRunner, InMemoryEventBus, InMemoryQueue, InMemoryRepository, NoopTask};
use pipeline_scheduler::Scheduler;
use uuid::Uuid;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn scheduler_with(
    repository: Arc<InMemoryRepository>,
    stage_catalog: FixedStageCatalog,
    task_runner: FixedTaskRunner,
) -> Scheduler {
    init_tracing();
    Scheduler::new(
        repository,
        Arc::new(InMemoryQueue::new()),
        Arc::new(InMemoryEventBus::new()),
        Arc::new(stage_catalog),
        Arc::new(task_runner),
        SchedulerConfig::default(),
    )
}

/// Drains the dispatcher loop until the queue goes empty or `max_ticks` is
/// hit (a safety net against an accidental infinite loop in a broken test).
async fn drain(scheduler: &Scheduler, max_ticks: usize) {
    for _ in 0..max_ticks {
        if !scheduler.tick().await.unwrap() {
            return;
        }
    }
    panic!("drain exceeded max_ticks without the queue going empty");
}

#[tokio::test]
async fn single_stage_single_task_runs_to_succeeded() {
    let repository = Arc::new(InMemoryRepository::new());
    let catalog = FixedStageCatalog::new()
        .with_tasks("deploy", vec![TaskExecution::new(0, "run", "noop").with_loop_start(true)]);
    let runner = FixedTaskRunner::new().with_task("noop", Arc::new(NoopTask));

    let mut exec = PipelineExecution::new(Uuid::new_v4(), "app", ExecutionType::Pipeline);
    let stage = StageExecution::new(Uuid::new_v4(), "deploy", "deploy");
    exec.stages.push(stage);
    let execution_id = exec.id;
    repository.insert(exec);

    let scheduler = scheduler_with(repository.clone(), catalog, runner);
    scheduler
        .context()
        .queue
        .push(
            SchedulerMessage::Execution(ExecutionMessage::StartExecution(StartExecution {
                execution_id,
            })),
            None,
        )
        .await
        .unwrap();

    drain(&scheduler, 50).await;

    let finished = repository.retrieve(execution_id).await.unwrap();
    assert_eq!(finished.status, Status::Succeeded);
    assert_eq!(finished.stages[0].status, Status::Succeeded);
}

#[tokio::test]
async fn diamond_dag_waits_for_both_branches_before_completing() {
    let repository = Arc::new(InMemoryRepository::new());
    let catalog = FixedStageCatalog::new()
        .with_tasks("noop-stage", vec![TaskExecution::new(0, "run", "noop")]);
    let runner = FixedTaskRunner::new().with_task("noop", Arc::new(NoopTask));

    let mut exec = PipelineExecution::new(Uuid::new_v4(), "app", ExecutionType::Pipeline);
    let root = StageExecution::new(Uuid::new_v4(), "root", "noop-stage");
    let mut left = StageExecution::new(Uuid::new_v4(), "left", "noop-stage");
    left.requisite_stage_ref_ids = vec!["root".into()];
    let mut right = StageExecution::new(Uuid::new_v4(), "right", "noop-stage");
    right.requisite_stage_ref_ids = vec!["root".into()];
    let mut join = StageExecution::new(Uuid::new_v4(), "join", "noop-stage");
    join.requisite_stage_ref_ids = vec!["left".into(), "right".into()];
    exec.stages.extend([root, left, right, join]);
    let execution_id = exec.id;
    repository.insert(exec);

    let scheduler = scheduler_with(repository.clone(), catalog, runner);
    scheduler
        .context()
        .queue
        .push(
            SchedulerMessage::Execution(ExecutionMessage::StartExecution(StartExecution {
                execution_id,
            })),
            None,
        )
        .await
        .unwrap();

    drain(&scheduler, 100).await;

    let finished = repository.retrieve(execution_id).await.unwrap();
    assert_eq!(finished.status, Status::Succeeded);
    assert!(finished.stages.iter().all(|s| s.status == Status::Succeeded));
}

#[tokio::test]
async fn task_returning_running_reschedules_itself_before_completing() {
    use async_trait::async_trait;
    use pipeline_scheduler::errors::PortError;
    use pipeline_scheduler::model::TaskResult;
    use pipeline_scheduler::ports::Task;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct EventuallySucceeds {
        remaining: AtomicU32,
    }

    #[async_trait]
    impl Task for EventuallySucceeds {
        async fn execute(
            &self,
            _stage: &StageExecution,
            _task_id: u32,
        ) -> Result<TaskResult, PortError> {
            if self.remaining.fetch_sub(1, Ordering::SeqCst) > 1 {
                Ok(TaskResult::running(Duration::from_millis(5)))
            } else {
                Ok(TaskResult::succeeded(None))
            }
        }
    }

    let repository = Arc::new(InMemoryRepository::new());
    let catalog = FixedStageCatalog::new()
        .with_tasks("deploy", vec![TaskExecution::new(0, "poll", "poll")]);
    let runner = FixedTaskRunner::new().with_task(
        "poll",
        Arc::new(EventuallySucceeds {
            remaining: AtomicU32::new(3),
        }),
    );

    let mut exec = PipelineExecution::new(Uuid::new_v4(), "app", ExecutionType::Pipeline);
    exec.stages.push(StageExecution::new(Uuid::new_v4(), "deploy", "deploy"));
    let execution_id = exec.id;
    repository.insert(exec);

    let scheduler = scheduler_with(repository.clone(), catalog, runner);
    scheduler
        .context()
        .queue
        .push(
            SchedulerMessage::Execution(ExecutionMessage::StartExecution(StartExecution {
                execution_id,
            })),
            None,
        )
        .await
        .unwrap();

    for _ in 0..200 {
        scheduler.tick().await.unwrap();
        let snapshot = repository.retrieve(execution_id).await.unwrap();
        if snapshot.status == Status::Succeeded {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("execution never reached SUCCEEDED");
}

#[tokio::test]
async fn redirect_resets_the_loop_range_and_reruns_it() {
    use async_trait::async_trait;
    use pipeline_scheduler::errors::PortError;
    use pipeline_scheduler::model::TaskResult;
    use pipeline_scheduler::ports::Task;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct RedirectsOnce {
        calls: AtomicU32,
    }

    #[async_trait]
    impl Task for RedirectsOnce {
        async fn execute(
            &self,
            _stage: &StageExecution,
            task_id: u32,
        ) -> Result<TaskResult, PortError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            // The "check" task (id 1) redirects back to the loop start on its
            // first visit, then succeeds on the second pass.
            if task_id == 1 && call == 1 {
                Ok(TaskResult::redirect())
            } else {
                Ok(TaskResult::succeeded(None))
            }
        }
    }

    let repository = Arc::new(InMemoryRepository::new());
    let catalog = FixedStageCatalog::new().with_tasks(
        "deploy",
        vec![
            TaskExecution::new(0, "determineTarget", "step").with_loop_start(true),
            TaskExecution::new(1, "check", "step"),
        ],
    );
    let runner = FixedTaskRunner::new().with_task(
        "step",
        Arc::new(RedirectsOnce {
            calls: AtomicU32::new(0),
        }),
    );

    let mut exec = PipelineExecution::new(Uuid::new_v4(), "app", ExecutionType::Pipeline);
    exec.stages.push(StageExecution::new(Uuid::new_v4(), "deploy", "deploy"));
    let execution_id = exec.id;
    repository.insert(exec);

    let scheduler = scheduler_with(repository.clone(), catalog, runner);
    scheduler
        .context()
        .queue
        .push(
            SchedulerMessage::Execution(ExecutionMessage::StartExecution(StartExecution {
                execution_id,
            })),
            None,
        )
        .await
        .unwrap();

    drain(&scheduler, 100).await;

    let finished = repository.retrieve(execution_id).await.unwrap();
    assert_eq!(finished.status, Status::Succeeded);
}

#[tokio::test]
async fn cancel_execution_aborts_running_stages_to_terminal() {
    let repository = Arc::new(InMemoryRepository::new());
    let catalog = FixedStageCatalog::new();
    let runner = FixedTaskRunner::new();

    let mut exec = PipelineExecution::new(Uuid::new_v4(), "app", ExecutionType::Pipeline);
    let mut stage = StageExecution::new(Uuid::new_v4(), "deploy", "deploy");
    stage.status = Status::Running;
    stage.start_time = Some(chrono::Utc::now());
    exec.stages.push(stage);
    exec.status = Status::Running;
    let execution_id = exec.id;
    repository.insert(exec);

    let scheduler = scheduler_with(repository.clone(), catalog, runner);
    scheduler
        .context()
        .queue
        .push(
            SchedulerMessage::Execution(ExecutionMessage::CancelExecution(
                pipeline_scheduler::messages::CancelExecution { execution_id },
            )),
            None,
        )
        .await
        .unwrap();

    drain(&scheduler, 20).await;

    let finished = repository.retrieve(execution_id).await.unwrap();
    assert_eq!(finished.status, Status::Terminal);
    assert_eq!(finished.stages[0].status, Status::Terminal);
}

#[tokio::test]
async fn unresolvable_stage_type_marks_the_stage_terminal() {
    use async_trait::async_trait;
    use pipeline_scheduler::errors::PortError;
    use pipeline_scheduler::ports::stage_catalog::StageSpec;
    use pipeline_scheduler::ports::StageBuilder;

    struct NoSuchBuilder;

    #[async_trait]
    impl StageBuilder for NoSuchBuilder {
        fn task_graph(&self, _stage_type: &str) -> Result<Vec<TaskExecution>, PortError> {
            Ok(Vec::new())
        }

        fn before_stages(&self, stage: &StageExecution) -> Result<Vec<StageSpec>, PortError> {
            Err(PortError::Catalog(format!(
                "no builder registered for '{}'",
                stage.stage_type
            )))
        }

        fn after_stages(&self, _stage: &StageExecution) -> Result<Vec<StageSpec>, PortError> {
            Ok(Vec::new())
        }
    }

    let repository = Arc::new(InMemoryRepository::new());
    let runner = FixedTaskRunner::new();

    let mut exec = PipelineExecution::new(Uuid::new_v4(), "app", ExecutionType::Pipeline);
    exec.stages
        .push(StageExecution::new(Uuid::new_v4(), "deploy", "unknownType"));
    let execution_id = exec.id;
    repository.insert(exec);

    init_tracing();
    let scheduler = Scheduler::new(
        repository.clone(),
        Arc::new(InMemoryQueue::new()),
        Arc::new(InMemoryEventBus::new()),
        Arc::new(NoSuchBuilder),
        Arc::new(runner),
        SchedulerConfig::default(),
    );
    scheduler
        .context()
        .queue
        .push(
            SchedulerMessage::Execution(ExecutionMessage::StartExecution(StartExecution {
                execution_id,
            })),
            None,
        )
        .await
        .unwrap();

    drain(&scheduler, 20).await;

    let finished = repository.retrieve(execution_id).await.unwrap();
    assert_eq!(finished.status, Status::Terminal);
    assert_eq!(finished.stages[0].status, Status::Terminal);
    assert!(finished.stages[0].context.get("terminationReason").is_some());
}

#[tokio::test]
async fn skip_stage_denied_by_the_builder_leaves_the_stage_untouched() {
    use async_trait::async_trait;
    use pipeline_scheduler::errors::PortError;
    use pipeline_scheduler::ports::stage_catalog::StageSpec;
    use pipeline_scheduler::ports::StageBuilder;

    struct NoManualSkip;

    #[async_trait]
    impl StageBuilder for NoManualSkip {
        fn task_graph(&self, _stage_type: &str) -> Result<Vec<TaskExecution>, PortError> {
            Ok(Vec::new())
        }

        fn before_stages(&self, _stage: &StageExecution) -> Result<Vec<StageSpec>, PortError> {
            Ok(Vec::new())
        }

        fn after_stages(&self, _stage: &StageExecution) -> Result<Vec<StageSpec>, PortError> {
            Ok(Vec::new())
        }

        fn can_manually_skip(&self, _stage_type: &str) -> bool {
            false
        }
    }

    let repository = Arc::new(InMemoryRepository::new());
    let runner = FixedTaskRunner::new();

    let mut exec = PipelineExecution::new(Uuid::new_v4(), "app", ExecutionType::Pipeline);
    let stage = StageExecution::new(Uuid::new_v4(), "manualJudgment", "manualJudgment");
    let stage_id = stage.id;
    exec.stages.push(stage);
    let execution_id = exec.id;
    repository.insert(exec);

    init_tracing();
    let scheduler = Scheduler::new(
        repository.clone(),
        Arc::new(InMemoryQueue::new()),
        Arc::new(InMemoryEventBus::new()),
        Arc::new(NoManualSkip),
        Arc::new(runner),
        SchedulerConfig::default(),
    );
    scheduler
        .context()
        .queue
        .push(
            SchedulerMessage::Stage(pipeline_scheduler::messages::StageMessage::SkipStage(
                pipeline_scheduler::messages::SkipStage {
                    execution_id,
                    stage_id,
                },
            )),
            None,
        )
        .await
        .unwrap();

    drain(&scheduler, 5).await;

    let finished = repository.retrieve(execution_id).await.unwrap();
    assert_eq!(finished.stages[0].status, Status::NotStarted);
}

#[tokio::test]
async fn stopped_branch_with_complete_others_then_fail_forces_terminal() {
    let repository = Arc::new(InMemoryRepository::new());
    let catalog = FixedStageCatalog::new();
    let runner = FixedTaskRunner::new();

    let mut exec = PipelineExecution::new(Uuid::new_v4(), "app", ExecutionType::Pipeline);
    let mut stopped = StageExecution::new(Uuid::new_v4(), "a", "deploy");
    stopped.status = Status::Stopped;
    stopped.start_time = Some(chrono::Utc::now());
    stopped.end_time = Some(chrono::Utc::now());
    stopped.context = serde_json::json!({"completeOtherBranchesThenFail": true});
    let mut succeeded = StageExecution::new(Uuid::new_v4(), "b", "deploy");
    succeeded.status = Status::Succeeded;
    succeeded.start_time = Some(chrono::Utc::now());
    succeeded.end_time = Some(chrono::Utc::now());
    exec.stages.push(stopped);
    exec.stages.push(succeeded);
    exec.status = Status::Running;
    let execution_id = exec.id;
    repository.insert(exec);

    let scheduler = scheduler_with(repository.clone(), catalog, runner);
    scheduler
        .context()
        .queue
        .push(
            SchedulerMessage::Execution(ExecutionMessage::CompleteExecution(
                pipeline_scheduler::messages::CompleteExecution { execution_id },
            )),
            None,
        )
        .await
        .unwrap();

    drain(&scheduler, 5).await;

    let finished = repository.retrieve(execution_id).await.unwrap();
    assert_eq!(finished.status, Status::Terminal);
}

#[tokio::test]
async fn complete_execution_cancels_running_siblings_on_non_success_finalization() {
    use async_trait::async_trait;
    use pipeline_scheduler::errors::PortError;
    use pipeline_scheduler::ports::stage_catalog::StageSpec;
    use pipeline_scheduler::ports::StageBuilder;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct RecordsCancel {
        canceled: Arc<AtomicBool>,
    }

    #[async_trait]
    impl StageBuilder for RecordsCancel {
        fn task_graph(&self, _stage_type: &str) -> Result<Vec<TaskExecution>, PortError> {
            Ok(Vec::new())
        }

        fn before_stages(&self, _stage: &StageExecution) -> Result<Vec<StageSpec>, PortError> {
            Ok(Vec::new())
        }

        fn after_stages(&self, _stage: &StageExecution) -> Result<Vec<StageSpec>, PortError> {
            Ok(Vec::new())
        }

        async fn cancel(&self, _stage: &StageExecution) -> Result<(), PortError> {
            self.canceled.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    let repository = Arc::new(InMemoryRepository::new());
    let runner = FixedTaskRunner::new();
    let canceled = Arc::new(AtomicBool::new(false));

    let mut exec = PipelineExecution::new(Uuid::new_v4(), "app", ExecutionType::Pipeline);
    let mut failed = StageExecution::new(Uuid::new_v4(), "a", "deploy");
    failed.status = Status::Terminal;
    failed.start_time = Some(chrono::Utc::now());
    failed.end_time = Some(chrono::Utc::now());
    let mut still_running = StageExecution::new(Uuid::new_v4(), "b", "deploy");
    still_running.status = Status::Running;
    still_running.start_time = Some(chrono::Utc::now());
    exec.stages.push(failed);
    exec.stages.push(still_running);
    exec.status = Status::Running;
    let execution_id = exec.id;
    repository.insert(exec);

    init_tracing();
    let scheduler = Scheduler::new(
        repository.clone(),
        Arc::new(InMemoryQueue::new()),
        Arc::new(InMemoryEventBus::new()),
        Arc::new(RecordsCancel {
            canceled: canceled.clone(),
        }),
        Arc::new(runner),
        SchedulerConfig::default(),
    );
    scheduler
        .context()
        .queue
        .push(
            SchedulerMessage::Execution(ExecutionMessage::CompleteExecution(
                pipeline_scheduler::messages::CompleteExecution { execution_id },
            )),
            None,
        )
        .await
        .unwrap();

    drain(&scheduler, 5).await;

    let finished = repository.retrieve(execution_id).await.unwrap();
    assert_eq!(finished.status, Status::Terminal);
    assert!(canceled.load(Ordering::SeqCst));
}

#[tokio::test]
async fn empty_stage_list_completes_immediately() {
    let repository = Arc::new(InMemoryRepository::new());
    let exec = PipelineExecution::new(Uuid::new_v4(), "app", ExecutionType::Pipeline);
    let execution_id = exec.id;
    repository.insert(exec);

    let scheduler = scheduler_with(
        repository.clone(),
        FixedStageCatalog::new(),
        FixedTaskRunner::new(),
    );
    scheduler
        .context()
        .queue
        .push(
            SchedulerMessage::Execution(ExecutionMessage::StartExecution(StartExecution {
                execution_id,
            })),
            None,
        )
        .await
        .unwrap();

    drain(&scheduler, 10).await;

    let finished = repository.retrieve(execution_id).await.unwrap();
    assert_eq!(finished.status, Status::Succeeded);
}

#[tokio::test]
async fn fan_out_with_one_branch_terminal_cancels_the_other_and_ends_terminal() {
    use async_trait::async_trait;
    use pipeline_scheduler::errors::PortError;
    use pipeline_scheduler::model::TaskResult;
    use pipeline_scheduler::ports::Task;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FailsImmediately;

    #[async_trait]
    impl Task for FailsImmediately {
        async fn execute(
            &self,
            _stage: &StageExecution,
            _task_id: u32,
        ) -> Result<TaskResult, PortError> {
            Ok(TaskResult::terminal("left branch blew up"))
        }
    }

    struct SlowSucceeds {
        remaining: AtomicU32,
    }

    #[async_trait]
    impl Task for SlowSucceeds {
        async fn execute(
            &self,
            _stage: &StageExecution,
            _task_id: u32,
        ) -> Result<TaskResult, PortError> {
            if self.remaining.fetch_sub(1, Ordering::SeqCst) > 1 {
                Ok(TaskResult::running(Duration::from_millis(20)))
            } else {
                Ok(TaskResult::succeeded(None))
            }
        }
    }

    let repository = Arc::new(InMemoryRepository::new());
    let catalog = FixedStageCatalog::new()
        .with_tasks("root-stage", vec![TaskExecution::new(0, "run", "noop")])
        .with_tasks("left-stage", vec![TaskExecution::new(0, "run", "fails")])
        .with_tasks("right-stage", vec![TaskExecution::new(0, "run", "slow")]);
    let runner = FixedTaskRunner::new()
        .with_task("noop", Arc::new(NoopTask))
        .with_task("fails", Arc::new(FailsImmediately))
        .with_task(
            "slow",
            Arc::new(SlowSucceeds {
                remaining: AtomicU32::new(50),
            }),
        );

    let mut exec = PipelineExecution::new(Uuid::new_v4(), "app", ExecutionType::Pipeline);
    let root = StageExecution::new(Uuid::new_v4(), "root", "root-stage");
    let mut left = StageExecution::new(Uuid::new_v4(), "left", "left-stage");
    left.requisite_stage_ref_ids = vec!["root".into()];
    let mut right = StageExecution::new(Uuid::new_v4(), "right", "right-stage");
    right.requisite_stage_ref_ids = vec!["root".into()];
    exec.stages.extend([root, left, right]);
    let execution_id = exec.id;
    repository.insert(exec);

    let scheduler = scheduler_with(repository.clone(), catalog, runner);
    scheduler
        .context()
        .queue
        .push(
            SchedulerMessage::Execution(ExecutionMessage::StartExecution(StartExecution {
                execution_id,
            })),
            None,
        )
        .await
        .unwrap();

    for _ in 0..300 {
        scheduler.tick().await.unwrap();
        let snapshot = repository.retrieve(execution_id).await.unwrap();
        if snapshot.status.is_terminal() {
            assert_eq!(snapshot.status, Status::Terminal);
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("execution never reached a terminal status");
}

#[tokio::test]
async fn concurrent_submissions_with_limit_concurrent_purge_keeps_the_newest_waiter() {
    let repository = Arc::new(InMemoryRepository::new());
    let catalog = FixedStageCatalog::new()
        .with_tasks("deploy", vec![TaskExecution::new(0, "run", "noop")]);
    let runner = FixedTaskRunner::new().with_task("noop", Arc::new(NoopTask));

    let config_id = "shared-config";
    let make_execution = || {
        let mut exec = PipelineExecution::new(Uuid::new_v4(), "app", ExecutionType::Pipeline);
        exec.pipeline_config_id = Some(config_id.into());
        exec.limit_concurrent = true;
        exec.keep_waiting_pipelines = false;
        exec.stages.push(StageExecution::new(Uuid::new_v4(), "deploy", "deploy"));
        exec
    };

    let e1 = make_execution();
    let e1_id = e1.id;
    repository.insert(e1);
    let e2 = make_execution();
    let e2_id = e2.id;
    repository.insert(e2);
    let e3 = make_execution();
    let e3_id = e3.id;
    repository.insert(e3);

    let scheduler = scheduler_with(repository.clone(), catalog, runner);

    // E1, E2, E3 are submitted in order against the same config; only E1
    // admits. E2 and E3 both land in the waiting queue. With
    // keepWaitingPipelines=false, E1's own completion purges that queue
    // down to its newest entry (E3) and promotes it; E2 never runs.
    for execution_id in [e1_id, e2_id, e3_id] {
        scheduler
            .context()
            .queue
            .push(
                SchedulerMessage::Execution(ExecutionMessage::StartExecution(StartExecution {
                    execution_id,
                })),
                None,
            )
            .await
            .unwrap();
    }
    drain(&scheduler, 60).await;

    let e1_final = repository.retrieve(e1_id).await.unwrap();
    assert_eq!(e1_final.status, Status::Succeeded);
    let e2_final = repository.retrieve(e2_id).await.unwrap();
    assert_eq!(e2_final.status, Status::Canceled);
    let e3_final = repository.retrieve(e3_id).await.unwrap();
    assert_eq!(e3_final.status, Status::Succeeded);
}

#[tokio::test]
async fn complete_other_branches_then_fail_waits_for_siblings_before_finalizing() {
    use async_trait::async_trait;
    use pipeline_scheduler::errors::PortError;
    use pipeline_scheduler::model::TaskResult;
    use pipeline_scheduler::ports::Task;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FailsImmediately;

    #[async_trait]
    impl Task for FailsImmediately {
        async fn execute(
            &self,
            _stage: &StageExecution,
            _task_id: u32,
        ) -> Result<TaskResult, PortError> {
            Ok(TaskResult::terminal("flagged branch blew up"))
        }
    }

    struct SlowSucceeds {
        remaining: AtomicU32,
    }

    #[async_trait]
    impl Task for SlowSucceeds {
        async fn execute(
            &self,
            _stage: &StageExecution,
            _task_id: u32,
        ) -> Result<TaskResult, PortError> {
            if self.remaining.fetch_sub(1, Ordering::SeqCst) > 1 {
                Ok(TaskResult::running(Duration::from_millis(5)))
            } else {
                Ok(TaskResult::succeeded(None))
            }
        }
    }

    let repository = Arc::new(InMemoryRepository::new());
    let catalog = FixedStageCatalog::new()
        .with_tasks("a-stage", vec![TaskExecution::new(0, "run", "fails")])
        .with_tasks("b-stage", vec![TaskExecution::new(0, "run", "slow")]);
    let runner = FixedTaskRunner::new()
        .with_task("fails", Arc::new(FailsImmediately))
        .with_task(
            "slow",
            Arc::new(SlowSucceeds {
                remaining: AtomicU32::new(10),
            }),
        );

    let mut exec = PipelineExecution::new(Uuid::new_v4(), "app", ExecutionType::Pipeline);
    let mut a = StageExecution::new(Uuid::new_v4(), "a", "a-stage");
    a.set_complete_other_branches_then_fail(true);
    let b = StageExecution::new(Uuid::new_v4(), "b", "b-stage");
    exec.stages.extend([a, b]);
    let execution_id = exec.id;
    repository.insert(exec);

    let scheduler = scheduler_with(repository.clone(), catalog, runner);
    scheduler
        .context()
        .queue
        .push(
            SchedulerMessage::Execution(ExecutionMessage::StartExecution(StartExecution {
                execution_id,
            })),
            None,
        )
        .await
        .unwrap();

    // Drive past the point where `a` would finalize alone: it must not
    // force the execution TERMINAL while `b` is still RUNNING.
    for _ in 0..5 {
        scheduler.tick().await.unwrap();
    }
    let mid = repository.retrieve(execution_id).await.unwrap();
    assert_ne!(mid.status, Status::Terminal);

    for _ in 0..200 {
        scheduler.tick().await.unwrap();
        let snapshot = repository.retrieve(execution_id).await.unwrap();
        if snapshot.status.is_terminal() {
            assert_eq!(snapshot.status, Status::Terminal);
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("execution never reached a terminal status");
}

#[tokio::test]
async fn message_retry_exhaustion_forces_the_execution_terminal() {
    use async_trait::async_trait;
    use pipeline_scheduler::errors::PortError;
    use pipeline_scheduler::model::TaskResult;
    use pipeline_scheduler::ports::Task;

    struct AlwaysTransientlyFails;

    #[async_trait]
    impl Task for AlwaysTransientlyFails {
        async fn execute(
            &self,
            _stage: &StageExecution,
            _task_id: u32,
        ) -> Result<TaskResult, PortError> {
            Err(PortError::Persistence {
                operation: "execute".into(),
                reason: "simulated storage outage".into(),
            })
        }
    }

    let repository = Arc::new(InMemoryRepository::new());
    let catalog = FixedStageCatalog::new()
        .with_tasks("deploy", vec![TaskExecution::new(0, "run", "flaky")]);
    let runner = FixedTaskRunner::new().with_task("flaky", Arc::new(AlwaysTransientlyFails));

    let mut exec = PipelineExecution::new(Uuid::new_v4(), "app", ExecutionType::Pipeline);
    exec.stages.push(StageExecution::new(Uuid::new_v4(), "deploy", "deploy"));
    let execution_id = exec.id;
    repository.insert(exec);

    let config = SchedulerConfig::builder()
        .message_retry_max_attempts(3)
        .message_retry_base_delay(Duration::from_millis(0))
        .message_retry_max_delay(Duration::from_millis(0))
        .build();
    init_tracing();
    let scheduler = Scheduler::new(
        repository.clone(),
        Arc::new(InMemoryQueue::new()),
        Arc::new(InMemoryEventBus::new()),
        Arc::new(catalog),
        Arc::new(runner),
        config,
    );
    scheduler
        .context()
        .queue
        .push(
            SchedulerMessage::Execution(ExecutionMessage::StartExecution(StartExecution {
                execution_id,
            })),
            None,
        )
        .await
        .unwrap();

    for _ in 0..100 {
        scheduler.tick().await.unwrap();
        let snapshot = repository.retrieve(execution_id).await.unwrap();
        if snapshot.status.is_terminal() {
            assert_eq!(snapshot.status, Status::Terminal);
            assert!(snapshot.extra.get("terminationReason").is_some());
            return;
        }
    }
    panic!("execution never reached a terminal status after retry exhaustion");
}
