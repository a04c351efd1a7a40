//! Stage-tier messages (spec §4.1).

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartStage {
    pub execution_id: Uuid,
    pub stage_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteStage {
    pub execution_id: Uuid,
    pub stage_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkipStage {
    pub execution_id: Uuid,
    pub stage_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbortStage {
    pub execution_id: Uuid,
    pub stage_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelStage {
    pub execution_id: Uuid,
    pub stage_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestartStage {
    pub execution_id: Uuid,
    pub stage_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PauseStage {
    pub execution_id: Uuid,
    pub stage_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeStage {
    pub execution_id: Uuid,
    pub stage_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContinueParentStage {
    pub execution_id: Uuid,
    pub parent_stage_id: Uuid,
}
