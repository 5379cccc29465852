//! Shared application state for the HTTP surface.

use std::sync::Arc;

use crate::config::EngineConfig;
use crate::engine::Orchestrator;

/// Handed to every handler through axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Orchestrator,

    pub config: Arc<EngineConfig>,

    /// Whether task dispatch goes over NATS.
    pub nats: bool,

    /// Server start time for uptime calculation
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(orchestrator: Orchestrator, config: EngineConfig, nats: bool) -> Self {
        Self {
            orchestrator,
            config: Arc::new(config),
            nats,
            start_time: std::time::Instant::now(),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
