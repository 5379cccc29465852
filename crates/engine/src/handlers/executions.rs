//! Execution API handlers.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::engine::{ExecutionDetail, PlanExecution, TriggerMetadata};
use crate::error::{EngineError, EngineResult};
use crate::plan::{parse_plan, Plan};
use crate::state::AppState;

/// Body of `POST /api/executions`. Exactly one of `plan` or `planYaml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartExecutionRequest {
    #[serde(default)]
    pub plan: Option<Plan>,
    #[serde(default)]
    pub plan_yaml: Option<String>,
    #[serde(default)]
    pub metadata: Option<TriggerMetadata>,
}

impl StartExecutionRequest {
    fn into_parts(self) -> EngineResult<(Plan, TriggerMetadata)> {
        let plan = match (self.plan, self.plan_yaml) {
            (Some(plan), None) => plan,
            (None, Some(yaml)) => parse_plan(&yaml)?,
            (Some(_), Some(_)) => {
                return Err(EngineError::InvalidRequest(
                    "give either plan or planYaml, not both".to_string(),
                ))
            }
            (None, None) => {
                return Err(EngineError::InvalidRequest("plan or planYaml is required".to_string()))
            }
        };
        Ok((plan, self.metadata.unwrap_or_default()))
    }
}

/// Start a plan execution.
///
/// POST /api/executions
pub async fn start(
    State(state): State<AppState>,
    Json(request): Json<StartExecutionRequest>,
) -> EngineResult<(StatusCode, Json<PlanExecution>)> {
    let (plan, metadata) = request.into_parts()?;
    let execution = state.orchestrator.start_execution(plan, metadata).await?;
    Ok((StatusCode::CREATED, Json(execution)))
}

/// Execution with its node executions and interrupts.
///
/// GET /api/executions/{id}
pub async fn get(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> EngineResult<Json<ExecutionDetail>> {
    Ok(Json(state.orchestrator.get_execution_detail(id).await?))
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::json;
    use tower::ServiceExt;

    use super::*;
    use crate::engine::Status;
    use crate::handlers::{router, test_support};

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_start_and_get_execution() {
        let (state, _rx) = test_support::state();
        let app = router(state);

        let response = app
            .clone()
            .oneshot(post_json(
                "/api/executions",
                json!({"planYaml": test_support::PLAN_YAML, "metadata": {"triggeredBy": "alice"}}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let execution: PlanExecution = serde_json::from_slice(&body).unwrap();
        assert_eq!(execution.status, Status::Running);
        assert_eq!(execution.metadata.triggered_by, "alice");

        let response = app
            .oneshot(
                Request::get(format!("/api/executions/{}", execution.uuid))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let detail: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(detail["execution"]["uuid"], json!(execution.uuid));
        assert!(detail["nodes"].as_array().is_some_and(|n| !n.is_empty()));
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_plan() {
        let (state, _rx) = test_support::state();
        let broken = test_support::PLAN_YAML.replace("startNodeId: pipeline", "startNodeId: nowhere");
        let response = router(state)
            .oneshot(post_json("/api/executions", json!({"planYaml": broken})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn test_start_requires_a_plan() {
        let (state, _rx) = test_support::state();
        let response = router(state)
            .oneshot(post_json("/api/executions", json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_get_unknown_execution() {
        let (state, _rx) = test_support::state();
        let response = router(state)
            .oneshot(
                Request::get(format!("/api/executions/{}", Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
