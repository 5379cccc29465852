//! NATS task transport and transition event publisher.
//!
//! Executors consume task requests from the `pipeline_tasks` stream, call
//! the engine back over HTTP with responses and progress, and listen on the
//! cancel subject for tasks that are no longer wanted.

use async_nats::jetstream::{self, Context};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::engine::dispatch::{TaskRequest, TaskTransport};
use crate::engine::events::{EventSink, TransitionEvent};
use crate::error::{EngineError, EngineResult};

/// Subject task requests are published to.
pub const TASK_SUBJECT: &str = "pipeline.tasks";

/// JetStream stream holding task requests.
pub const TASK_STREAM: &str = "pipeline_tasks";

/// Core subject for cancellations.
pub const CANCEL_SUBJECT: &str = "pipeline.tasks.cancel";

/// Core subject for transition events.
pub const TRANSITION_SUBJECT: &str = "pipeline.transitions";

#[derive(Debug, Error)]
pub enum NatsError {
    #[error("JetStream error: {0}")]
    JetStream(String),

    #[error("Publish error: {0}")]
    Publish(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<NatsError> for EngineError {
    fn from(err: NatsError) -> Self {
        match err {
            NatsError::Serialization(e) => EngineError::Serialization(e),
            other => EngineError::Nats(other.to_string()),
        }
    }
}

/// Cancellation notice sent to executors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelNotification {
    pub task_id: Uuid,
}

/// Task transport over NATS JetStream.
#[derive(Clone)]
pub struct NatsTaskTransport {
    client: async_nats::Client,
    js: Context,
    subject: String,
}

impl NatsTaskTransport {
    /// Create the transport, creating the task stream if it is missing.
    pub async fn new(client: async_nats::Client) -> Result<Self, NatsError> {
        let js = jetstream::new(client.clone());
        Self::ensure_stream(&js, TASK_STREAM, TASK_SUBJECT).await?;
        Ok(Self {
            client,
            js,
            subject: TASK_SUBJECT.to_string(),
        })
    }

    async fn ensure_stream(js: &Context, stream: &str, subject: &str) -> Result<(), NatsError> {
        match js.get_stream(stream).await {
            Ok(_) => {
                tracing::debug!(stream = %stream, "Using existing NATS stream");
                Ok(())
            }
            Err(_) => {
                let config = jetstream::stream::Config {
                    name: stream.to_string(),
                    subjects: vec![subject.to_string()],
                    max_age: std::time::Duration::from_secs(3600),
                    storage: jetstream::stream::StorageType::File,
                    ..Default::default()
                };

                js.create_stream(config)
                    .await
                    .map_err(|e| NatsError::JetStream(e.to_string()))?;

                tracing::info!(stream = %stream, subject = %subject, "Created NATS stream");
                Ok(())
            }
        }
    }

    async fn publish_request(&self, request: &TaskRequest) -> Result<(), NatsError> {
        let payload = serde_json::to_vec(request)?;
        self.js
            .publish(self.subject.clone(), payload.into())
            .await
            .map_err(|e| NatsError::Publish(e.to_string()))?
            .await
            .map_err(|e| NatsError::Publish(e.to_string()))?;

        tracing::debug!(
            task_id = %request.task_id,
            node_execution_id = %request.node_execution_id,
            task_type = %request.task_type,
            "Published task request"
        );
        Ok(())
    }

    async fn publish_cancel(&self, task_id: Uuid) -> Result<(), NatsError> {
        let payload = serde_json::to_vec(&CancelNotification { task_id })?;
        self.client
            .publish(CANCEL_SUBJECT, payload.into())
            .await
            .map_err(|e| NatsError::Publish(e.to_string()))?;
        tracing::debug!(task_id = %task_id, "Published task cancellation");
        Ok(())
    }
}

#[async_trait]
impl TaskTransport for NatsTaskTransport {
    async fn send(&self, request: &TaskRequest) -> EngineResult<()> {
        self.publish_request(request).await.map_err(|e| match e {
            NatsError::Publish(msg) | NatsError::JetStream(msg) => EngineError::Dispatch(msg),
            other => other.into(),
        })
    }

    async fn cancel(&self, task_id: Uuid) -> EngineResult<()> {
        Ok(self.publish_cancel(task_id).await?)
    }
}

/// Publishes every transition to [`TRANSITION_SUBJECT`] without waiting.
#[derive(Clone)]
pub struct NatsEventSink {
    client: async_nats::Client,
}

impl NatsEventSink {
    pub fn new(client: async_nats::Client) -> Self {
        Self { client }
    }
}

impl EventSink for NatsEventSink {
    fn publish(&self, event: &TransitionEvent) {
        let payload = match serde_json::to_vec(event) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to encode transition event");
                return;
            }
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("No runtime to publish transition event on");
            return;
        };
        let client = self.client.clone();
        handle.spawn(async move {
            if let Err(e) = client.publish(TRANSITION_SUBJECT, payload.into()).await {
                tracing::warn!(error = %e, "Failed to publish transition event");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_notification_serialization() {
        let task_id = Uuid::new_v4();
        let json = serde_json::to_string(&CancelNotification { task_id }).unwrap();
        assert_eq!(json, format!(r#"{{"taskId":"{}"}}"#, task_id));

        let back: CancelNotification = serde_json::from_str(&json).unwrap();
        assert_eq!(back.task_id, task_id);
    }

    #[test]
    fn test_nats_errors_map_to_engine_errors() {
        let err: EngineError = NatsError::Publish("no responders".into()).into();
        assert!(matches!(err, EngineError::Nats(_)));
        assert!(err.is_transient());

        let bad = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: EngineError = NatsError::Serialization(bad).into();
        assert!(matches!(err, EngineError::Serialization(_)));
    }
}
