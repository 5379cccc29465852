//! Interrupt API handlers.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use uuid::Uuid;

use crate::engine::{Interrupt, InterruptRequest};
use crate::error::EngineResult;
use crate::state::AppState;

/// Register an interrupt. It is applied asynchronously; poll the list for
/// its final state.
///
/// POST /api/executions/{id}/interrupts
pub async fn register(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<InterruptRequest>,
) -> EngineResult<(StatusCode, Json<Interrupt>)> {
    let interrupt = state.orchestrator.register_interrupt(id, request).await?;
    Ok((StatusCode::ACCEPTED, Json(interrupt)))
}

/// Interrupts of an execution in registration order.
///
/// GET /api/executions/{id}/interrupts
pub async fn list(State(state): State<AppState>, Path(id): Path<Uuid>) -> EngineResult<Json<Vec<Interrupt>>> {
    let detail = state.orchestrator.get_execution_detail(id).await?;
    Ok(Json(detail.interrupts))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::Request;
    use serde_json::json;
    use tower::ServiceExt;

    use super::*;
    use crate::engine::{InterruptState, InterruptType, TriggerMetadata};
    use crate::handlers::{router, test_support};
    use crate::plan::parse_plan;

    #[tokio::test]
    async fn test_register_and_list_interrupts() {
        let (state, _rx) = test_support::state();
        let execution = state
            .orchestrator
            .start_execution(parse_plan(test_support::PLAN_YAML).unwrap(), TriggerMetadata::default())
            .await
            .unwrap();
        let app = router(state);

        let response = app
            .clone()
            .oneshot(
                Request::post(format!("/api/executions/{}/interrupts", execution.uuid))
                    .header("content-type", "application/json")
                    .body(Body::from(json!({"type": "ABORT_ALL"}).to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let interrupt: Interrupt = serde_json::from_slice(&body).unwrap();
        assert_eq!(interrupt.interrupt_type, InterruptType::AbortAll);

        let mut listed = Vec::new();
        for _ in 0..300 {
            let response = app
                .clone()
                .oneshot(
                    Request::get(format!("/api/executions/{}/interrupts", execution.uuid))
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
            listed = serde_json::from_slice::<Vec<Interrupt>>(&body).unwrap();
            if listed.iter().all(|i| i.state == InterruptState::ProcessedSuccessfully) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].uuid, interrupt.uuid);
        assert_eq!(listed[0].state, InterruptState::ProcessedSuccessfully);
    }

    #[tokio::test]
    async fn test_node_interrupt_without_node_is_rejected() {
        let (state, _rx) = test_support::state();
        let execution = state
            .orchestrator
            .start_execution(parse_plan(test_support::PLAN_YAML).unwrap(), TriggerMetadata::default())
            .await
            .unwrap();

        let response = router(state)
            .oneshot(
                Request::post(format!("/api/executions/{}/interrupts", execution.uuid))
                    .header("content-type", "application/json")
                    .body(Body::from(json!({"type": "RETRY"}).to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
