//! Executor callbacks: task responses and progress.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::{TaskProgress, TaskResponse};
use crate::error::EngineResult;
use crate::state::AppState;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResponseAck {
    /// `false` when the task was unknown, already answered or stale.
    pub accepted: bool,
}

/// POST /api/tasks/{task_id}/response
pub async fn response(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
    Json(body): Json<TaskResponse>,
) -> EngineResult<Json<TaskResponseAck>> {
    let accepted = state.orchestrator.on_task_response(task_id, body).await?;
    if !accepted {
        tracing::debug!(task_id = %task_id, "Task response dropped");
    }
    Ok(Json(TaskResponseAck { accepted }))
}

/// POST /api/tasks/{task_id}/progress
pub async fn progress(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
    Json(body): Json<TaskProgress>,
) -> EngineResult<StatusCode> {
    state.orchestrator.on_task_progress(task_id, body).await?;
    Ok(StatusCode::ACCEPTED)
}
