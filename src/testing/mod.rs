//! In-memory reference implementations of every port (spec §6, C14), gated
//! behind the `test-utils` feature. These back the crate's own test suite
//! and give embedders a fast starting point before wiring real persistence
//! and a real queue transport.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::errors::PortError;
use crate::messages::SchedulerMessage;
use crate::model::{PipelineExecution, StageExecution, TaskExecution};
use crate::ports::event_bus::SchedulerEvent;
use crate::ports::queue::MessageHandle;
use crate::ports::stage_catalog::StageSpec;
use crate::ports::task_runner::Task;
use crate::ports::{EventBus, ExecutionRepository, Queue, StageBuilder, TaskRunner};

/// A process-local store keyed by execution id. No optimistic locking: the
/// dispatcher's advisory per-execution lock is assumed to already serialize
/// writers, as it does in this crate's own handler dispatch loop.
#[derive(Debug, Default)]
pub struct InMemoryRepository {
    executions: DashMap<Uuid, PipelineExecution>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, execution: PipelineExecution) {
        self.executions.insert(execution.id, execution);
    }
}

#[async_trait]
impl ExecutionRepository for InMemoryRepository {
    async fn retrieve(&self, execution_id: Uuid) -> Result<PipelineExecution, PortError> {
        self.executions
            .get(&execution_id)
            .map(|e| e.clone())
            .ok_or_else(|| PortError::Persistence {
                operation: "retrieve".into(),
                reason: format!("no execution {execution_id}"),
            })
    }

    async fn store(&self, execution: &PipelineExecution) -> Result<(), PortError> {
        self.executions.insert(execution.id, execution.clone());
        Ok(())
    }

    async fn retrieve_waiting_for_config(
        &self,
        pipeline_config_id: &str,
    ) -> Result<Vec<Uuid>, PortError> {
        let mut waiting: Vec<(Uuid, chrono::DateTime<chrono::Utc>)> = self
            .executions
            .iter()
            .filter(|e| {
                e.pipeline_config_id.as_deref() == Some(pipeline_config_id)
                    && e.status == crate::model::Status::NotStarted
            })
            .map(|e| (e.id, e.submitted_at))
            .collect();
        waiting.sort_by_key(|(_, t)| *t);
        Ok(waiting.into_iter().map(|(id, _)| id).collect())
    }

    async fn count_running_for_config(
        &self,
        pipeline_config_id: &str,
    ) -> Result<u32, PortError> {
        Ok(self
            .executions
            .iter()
            .filter(|e| {
                e.pipeline_config_id.as_deref() == Some(pipeline_config_id)
                    && e.status == crate::model::Status::Running
            })
            .count() as u32)
    }
}

#[derive(Debug)]
struct InMemoryHandle(u64);
impl MessageHandle for InMemoryHandle {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

struct QueuedEntry {
    id: u64,
    message: SchedulerMessage,
    attempts: u32,
    ready_at: std::time::Instant,
}

/// A FIFO in-process queue with delayed-delivery and attempt tracking, used
/// in place of a real transport in tests. Delivered-but-unacked messages
/// move into `in_flight` so `nack` can re-queue them without the caller
/// having to carry the payload back itself.
pub struct InMemoryQueue {
    entries: Mutex<VecDeque<QueuedEntry>>,
    in_flight: DashMap<u64, (SchedulerMessage, u32)>,
    next_id: std::sync::atomic::AtomicU64,
}

impl std::fmt::Debug for InMemoryQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryQueue").finish_non_exhaustive()
    }
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            in_flight: DashMap::new(),
            next_id: std::sync::atomic::AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl Queue for InMemoryQueue {
    async fn push(
        &self,
        message: SchedulerMessage,
        delay: Option<std::time::Duration>,
    ) -> Result<(), PortError> {
        let id = self
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let ready_at = std::time::Instant::now() + delay.unwrap_or_default();
        self.entries.lock().await.push_back(QueuedEntry {
            id,
            message,
            attempts: 0,
            ready_at,
        });
        Ok(())
    }

    async fn poll(&self) -> Result<Option<(SchedulerMessage, Box<dyn MessageHandle>)>, PortError> {
        let mut entries = self.entries.lock().await;
        let now = std::time::Instant::now();
        let pos = entries.iter().position(|e| e.ready_at <= now);
        let Some(pos) = pos else {
            return Ok(None);
        };
        let entry = entries.remove(pos).expect("index just checked");
        let attempts = entry.attempts + 1;
        self.in_flight
            .insert(entry.id, (entry.message.clone(), attempts));
        Ok(Some((entry.message, Box::new(InMemoryHandle(entry.id)))))
    }

    async fn ack(&self, handle: Box<dyn MessageHandle>) -> Result<(), PortError> {
        if let Some(id) = handle_id(handle.as_ref()) {
            self.in_flight.remove(&id);
        }
        Ok(())
    }

    async fn nack(
        &self,
        handle: Box<dyn MessageHandle>,
        delay: Option<std::time::Duration>,
    ) -> Result<(), PortError> {
        let id = handle_id(handle.as_ref())
            .ok_or_else(|| PortError::Queue("unrecognized handle type".into()))?;
        let Some((_, (message, attempts))) = self.in_flight.remove(&id) else {
            return Ok(());
        };
        let ready_at = std::time::Instant::now() + delay.unwrap_or_default();
        self.entries.lock().await.push_back(QueuedEntry {
            id,
            message,
            attempts,
            ready_at,
        });
        Ok(())
    }

    async fn attempts(&self, handle: &dyn MessageHandle) -> Result<u32, PortError> {
        let id = handle_id(handle)
            .ok_or_else(|| PortError::Queue("unrecognized handle type".into()))?;
        Ok(self.in_flight.get(&id).map(|e| e.1).unwrap_or(1))
    }
}

fn handle_id(handle: &dyn MessageHandle) -> Option<u64> {
    handle.as_any().downcast_ref::<InMemoryHandle>().map(|h| h.0)
}

/// A publish-and-remember event bus for assertions in tests.
#[derive(Debug, Default)]
pub struct InMemoryEventBus {
    pub events: Mutex<Vec<SchedulerEvent>>,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(&self, event: SchedulerEvent) -> Result<(), PortError> {
        self.events.lock().await.push(event);
        Ok(())
    }
}

/// A stage catalog backed by a static map from `stage_type` to its task
/// graph and synthetic children, set up by the test that constructs it.
#[derive(Debug, Default)]
pub struct FixedStageCatalog {
    graphs: DashMap<String, Vec<TaskExecution>>,
    befores: DashMap<String, Vec<StageSpec>>,
    afters: DashMap<String, Vec<StageSpec>>,
}

impl FixedStageCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tasks(self, stage_type: impl Into<String>, tasks: Vec<TaskExecution>) -> Self {
        self.graphs.insert(stage_type.into(), tasks);
        self
    }

    pub fn with_before(self, stage_type: impl Into<String>, specs: Vec<StageSpec>) -> Self {
        self.befores.insert(stage_type.into(), specs);
        self
    }

    pub fn with_after(self, stage_type: impl Into<String>, specs: Vec<StageSpec>) -> Self {
        self.afters.insert(stage_type.into(), specs);
        self
    }
}

#[async_trait]
impl StageBuilder for FixedStageCatalog {
    fn task_graph(&self, stage_type: &str) -> Result<Vec<TaskExecution>, PortError> {
        Ok(self
            .graphs
            .get(stage_type)
            .map(|g| g.clone())
            .unwrap_or_default())
    }

    fn before_stages(&self, stage: &StageExecution) -> Result<Vec<StageSpec>, PortError> {
        Ok(self
            .befores
            .get(&stage.stage_type)
            .map(|s| s.clone())
            .unwrap_or_default())
    }

    fn after_stages(&self, stage: &StageExecution) -> Result<Vec<StageSpec>, PortError> {
        Ok(self
            .afters
            .get(&stage.stage_type)
            .map(|s| s.clone())
            .unwrap_or_default())
    }
}

/// A task runner resolving `implementing_type` to a closure-backed [`Task`],
/// registered by the test that constructs it.
#[derive(Default)]
pub struct FixedTaskRunner {
    tasks: DashMap<String, Arc<dyn Task>>,
}

impl std::fmt::Debug for FixedTaskRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixedTaskRunner").finish_non_exhaustive()
    }
}

impl FixedTaskRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_task(self, implementing_type: impl Into<String>, task: Arc<dyn Task>) -> Self {
        self.tasks.insert(implementing_type.into(), task);
        self
    }
}

impl TaskRunner for FixedTaskRunner {
    fn resolve(&self, implementing_type: &str) -> Result<Arc<dyn Task>, PortError> {
        self.tasks
            .get(implementing_type)
            .map(|t| t.clone())
            .ok_or_else(|| PortError::Task(format!("no task registered for '{implementing_type}'")))
    }
}

/// A [`Task`] that always succeeds immediately, with no outputs. Handy for
/// tests that only care about stage/execution plumbing.
pub struct NoopTask;

#[async_trait]
impl Task for NoopTask {
    async fn execute(
        &self,
        _stage: &StageExecution,
        _task_id: u32,
    ) -> Result<crate::model::TaskResult, PortError> {
        Ok(crate::model::TaskResult::succeeded(None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ExecutionType;

    #[tokio::test]
    async fn repository_round_trips_an_execution() {
        let repo = InMemoryRepository::new();
        let exec = PipelineExecution::new(Uuid::new_v4(), "app", ExecutionType::Pipeline);
        let id = exec.id;
        repo.insert(exec);
        let fetched = repo.retrieve(id).await.unwrap();
        assert_eq!(fetched.id, id);
    }

    #[tokio::test]
    async fn queue_respects_delay_before_becoming_pollable() {
        let queue = InMemoryQueue::new();
        let msg = SchedulerMessage::Execution(crate::messages::ExecutionMessage::StartExecution(
            crate::messages::StartExecution {
                execution_id: Uuid::new_v4(),
            },
        ));
        queue
            .push(msg, Some(std::time::Duration::from_millis(50)))
            .await
            .unwrap();
        assert!(queue.poll().await.unwrap().is_none());
        tokio::time::sleep(std::time::Duration::from_millis(60)).await;
        assert!(queue.poll().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn event_bus_records_published_events() {
        let bus = InMemoryEventBus::new();
        bus.publish(SchedulerEvent::ExecutionStarted {
            execution_id: Uuid::new_v4(),
            at: chrono::Utc::now(),
        })
        .await
        .unwrap();
        assert_eq!(bus.events.lock().await.len(), 1);
    }
}
