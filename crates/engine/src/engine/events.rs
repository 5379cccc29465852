//! Transition events for audit and telemetry consumers.
//!
//! Delivery is at-least-once; consumers de-duplicate on
//! `(node_execution_id, to, timestamp)`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::engine::status::Status;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionEvent {
    pub plan_execution_id: Uuid,
    /// `None` for plan execution transitions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_execution_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    pub from: Status,
    pub to: Status,
    pub timestamp: DateTime<Utc>,
}

/// Receives every committed transition. Must not block.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: &TransitionEvent);
}

/// Writes transitions to the tracing log.
pub struct LogSink;

impl EventSink for LogSink {
    fn publish(&self, event: &TransitionEvent) {
        match event.node_execution_id {
            Some(node_execution_id) => tracing::info!(
                plan_execution_id = %event.plan_execution_id,
                node_execution_id = %node_execution_id,
                node_id = event.node_id.as_deref().unwrap_or(""),
                from = %event.from,
                to = %event.to,
                "Node transition"
            ),
            None => tracing::info!(
                plan_execution_id = %event.plan_execution_id,
                from = %event.from,
                to = %event.to,
                "Plan execution transition"
            ),
        }
    }
}

/// In-process fan-out to any number of subscribers.
#[derive(Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<TransitionEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransitionEvent> {
        self.tx.subscribe()
    }
}

impl EventSink for BroadcastSink {
    fn publish(&self, event: &TransitionEvent) {
        // No subscribers is fine.
        let _ = self.tx.send(event.clone());
    }
}

/// Forwards to several sinks.
#[derive(Clone, Default)]
pub struct EventSinks {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl EventSinks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl EventSink for EventSinks {
    fn publish(&self, event: &TransitionEvent) {
        for sink in &self.sinks {
            sink.publish(event);
        }
    }
}
