//! HTTP handlers for the pipeline engine API.
//!
//! Executions are started and inspected here, operators register interrupts,
//! and executors report task responses and progress.

pub mod executions;
pub mod health;
pub mod interrupts;
pub mod tasks;

use axum::{
    routing::{get, post},
    Router,
};

use crate::state::AppState;

/// All API routes over `state`.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/api/health", get(health::api_health))
        .route("/api/executions", post(executions::start))
        .route("/api/executions/{id}", get(executions::get))
        .route(
            "/api/executions/{id}/interrupts",
            post(interrupts::register).get(interrupts::list),
        )
        .route("/api/tasks/{task_id}/response", post(tasks::response))
        .route("/api/tasks/{task_id}/progress", post(tasks::progress))
        .with_state(state)
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use tokio::sync::mpsc;

    use crate::config::EngineConfig;
    use crate::engine::{ChannelTransport, Orchestrator, TransportMessage};
    use crate::state::AppState;
    use crate::store::MemoryStore;

    /// State over an in-memory store with background processing running.
    pub fn state() -> (AppState, mpsc::UnboundedReceiver<TransportMessage>) {
        let (transport, rx) = ChannelTransport::new();
        let config = EngineConfig::default();
        let (orchestrator, work) = Orchestrator::builder(Arc::new(MemoryStore::new()), Arc::new(transport))
            .config(&config)
            .build();
        orchestrator.spawn_background(work);
        (AppState::new(orchestrator, config, false), rx)
    }

    pub const PLAN_YAML: &str = r#"
uuid: http
startNodeId: pipeline
nodes:
  - uuid: pipeline
    identifier: pipeline
    stepType: PIPELINE
    group: PIPELINE
    children: [build]
  - uuid: build
    identifier: build
    stepType: TASK
    group: STEP
"#;
}
