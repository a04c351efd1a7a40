//! Error taxonomy for the scheduler core and the ports it depends on.
//!
//! Two enums: [`SchedulerError`] is the core's own failure surface; [`PortError`]
//! is raised by the external collaborators (persistence, queue, event bus,
//! stage catalog) and gets folded into `SchedulerError` at the boundary where
//! a handler calls out to one.

use uuid::Uuid;

/// Result alias used throughout the scheduler core.
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Failures the scheduler itself can raise while advancing execution state.
///
/// Every variant maps to one of the error kinds enumerated in the error
/// handling design: `Transient` re-queues with backoff, `Invalid` emits an
/// Invalid{Execution,Stage,Task} marker and acks the original message,
/// `Configuration` marks the affected stage TERMINAL without crashing the
/// dispatcher.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("execution {execution_id} not found")]
    ExecutionNotFound { execution_id: Uuid },

    #[error("stage {stage_id} not found in execution {execution_id}")]
    StageNotFound { execution_id: Uuid, stage_id: Uuid },

    #[error("task {task_id} not found in stage {stage_id}")]
    TaskNotFound { stage_id: Uuid, task_id: u32 },

    #[error("no stage builder registered for stage type '{stage_type}'")]
    BuilderNotFound { stage_type: String },

    #[error("illegal transition for {entity}: {from} -> {to}")]
    IllegalTransition {
        entity: String,
        from: String,
        to: String,
    },

    #[error("dependency cycle detected among stage refIds: {0:?}")]
    CyclicDependency(Vec<String>),

    #[error("transient failure, retry: {0}")]
    Transient(String),

    #[error("malformed or unresolvable message: {0}")]
    Invalid(String),

    #[error("port failure: {0}")]
    Port(#[from] PortError),
}

impl SchedulerError {
    /// Whether this error should trigger a re-queue-with-backoff rather than
    /// an Invalid marker.
    pub fn is_transient(&self) -> bool {
        matches!(self, SchedulerError::Transient(_))
            || matches!(self, SchedulerError::Port(p) if p.is_transient())
    }

    /// Whether this is a "stage builder not found"-style configuration
    /// failure: the stage should be marked TERMINAL rather than treated as
    /// an Invalid-message drop or retried as transient.
    pub fn is_configuration_failure(&self) -> bool {
        matches!(self, SchedulerError::BuilderNotFound { .. })
            || matches!(self, SchedulerError::Port(PortError::Catalog(_)))
    }
}

/// Failures raised by the four external collaborators (§6: persistence,
/// queue, event bus, stage catalog).
#[derive(Debug, thiserror::Error)]
pub enum PortError {
    #[error("persistence error during {operation}: {reason}")]
    Persistence { operation: String, reason: String },

    #[error("queue transport error: {0}")]
    Queue(String),

    #[error("event bus publish failed: {0}")]
    EventBus(String),

    #[error("stage catalog lookup failed: {0}")]
    Catalog(String),

    #[error("task implementation failed: {0}")]
    Task(String),
}

impl PortError {
    fn is_transient(&self) -> bool {
        // Persistence and queue hiccups are transient by nature; catalog and
        // task-implementation lookup failures are configuration problems,
        // handled as Invalid/Configuration failures instead.
        matches!(self, PortError::Persistence { .. } | PortError::Queue(_))
    }
}
