//! Event publication port (spec §4.9, C12): a fire-and-forget broadcast of
//! state transitions, independent of the message queue that drives them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::PortError;
use crate::model::Status;

/// Notable state transitions the scheduler publishes as they happen.
/// Subscribers (UIs, audit logs, webhooks) consume these independently of
/// the message queue driving the state machine itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SchedulerEvent {
    ExecutionStarted {
        execution_id: Uuid,
        at: DateTime<Utc>,
    },
    ExecutionComplete {
        execution_id: Uuid,
        status: Status,
        at: DateTime<Utc>,
    },
    StageStarted {
        execution_id: Uuid,
        stage_id: Uuid,
        at: DateTime<Utc>,
    },
    StageComplete {
        execution_id: Uuid,
        stage_id: Uuid,
        status: Status,
        at: DateTime<Utc>,
    },
    TaskStarted {
        execution_id: Uuid,
        stage_id: Uuid,
        task_id: u32,
        at: DateTime<Utc>,
    },
    TaskComplete {
        execution_id: Uuid,
        stage_id: Uuid,
        task_id: u32,
        status: Status,
        at: DateTime<Utc>,
    },
}

/// Publishes [`SchedulerEvent`]s. Failures here never roll back a state
/// transition already persisted; handlers log and continue (spec §4.9).
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, event: SchedulerEvent) -> Result<(), PortError>;
}
