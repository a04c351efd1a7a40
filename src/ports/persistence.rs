//! Execution repository port (spec §6): the persistence boundary the core
//! drives but never implements directly.

use async_trait::async_trait;
use uuid::Uuid;

use crate::errors::PortError;
use crate::model::PipelineExecution;

/// Durable storage for pipeline executions. A real implementation backs this
/// with a database and whatever optimistic-locking scheme keeps concurrent
/// handlers from clobbering each other's writes; the core only requires that
/// `store` be atomic per execution.
#[async_trait]
pub trait ExecutionRepository: Send + Sync {
    async fn retrieve(&self, execution_id: Uuid) -> Result<PipelineExecution, PortError>;

    /// Persist the full execution document. Implementations are free to diff
    /// against the stored version; the core always writes the whole entity.
    async fn store(&self, execution: &PipelineExecution) -> Result<(), PortError>;

    /// Every execution currently QUEUED (awaiting concurrency admission) for
    /// a given pipeline config, oldest first (spec §4.10 StartWaitingExecutions).
    async fn retrieve_waiting_for_config(
        &self,
        pipeline_config_id: &str,
    ) -> Result<Vec<Uuid>, PortError>;

    /// Count of executions currently RUNNING for a given pipeline config
    /// (spec §4.10 concurrency admission).
    async fn count_running_for_config(
        &self,
        pipeline_config_id: &str,
    ) -> Result<u32, PortError>;
}
