//! Execution-tier messages (spec §4.1).

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartExecution {
    pub execution_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteExecution {
    pub execution_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelExecution {
    pub execution_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeExecution {
    pub execution_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartWaitingExecutions {
    pub pipeline_config_id: String,
    pub purge_queue: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RescheduleExecution {
    pub execution_id: Uuid,
}
