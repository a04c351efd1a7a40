//! Task-tier messages (spec §4.1).

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartTask {
    pub execution_id: Uuid,
    pub stage_id: Uuid,
    pub task_id: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunTask {
    pub execution_id: Uuid,
    pub stage_id: Uuid,
    pub task_id: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteTask {
    pub execution_id: Uuid,
    pub stage_id: Uuid,
    pub task_id: u32,
    pub result: crate::model::TaskResult,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PauseTask {
    pub execution_id: Uuid,
    pub stage_id: Uuid,
    pub task_id: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeTask {
    pub execution_id: Uuid,
    pub stage_id: Uuid,
    pub task_id: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvalidTask {
    pub execution_id: Uuid,
    pub stage_id: Uuid,
    pub task_id: u32,
    pub reason: String,
}
