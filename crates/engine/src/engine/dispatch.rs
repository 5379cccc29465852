//! Task dispatch gateway.
//!
//! Hands task requests to out-of-process executors through a
//! [`TaskTransport`] and tracks the outstanding task of each suspended node.
//! Outstanding tasks are persisted so callbacks and expiries still resolve
//! after a restart.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use uuid::Uuid;

use crate::engine::execution::NodeExecution;
use crate::engine::failure::FailureInfo;
use crate::engine::status::Status;
use crate::engine::steps::TaskSpec;
use crate::engine::transition::RetryPolicy;
use crate::engine::work::{Work, WorkQueue};
use crate::error::{EngineError, EngineResult};
use crate::store::ExecutionStore;

/// Message sent to an executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRequest {
    pub task_id: Uuid,
    pub node_execution_id: Uuid,
    pub plan_execution_id: Uuid,
    pub task_type: String,
    pub payload: serde_json::Value,
    pub expires_at: DateTime<Utc>,
}

/// Executor reply for a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResponse {
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureInfo>,
}

impl TaskResponse {
    /// Response synthesized when a task outlives its expiry.
    pub fn expired(task_id: Uuid) -> Self {
        Self {
            status: Status::Expired,
            outputs: None,
            failure: Some(FailureInfo::expired(format!(
                "task {} timed out waiting for a response",
                task_id
            ))),
        }
    }
}

/// Freeform progress update; `data` is base64.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskProgress {
    pub data: String,
}

impl TaskProgress {
    /// Decoded payload. JSON when it parses as JSON, a string otherwise.
    pub fn decode(&self) -> EngineResult<serde_json::Value> {
        let bytes = BASE64
            .decode(self.data.as_bytes())
            .map_err(|e| EngineError::InvalidRequest(format!("progress is not base64: {}", e)))?;
        match serde_json::from_slice(&bytes) {
            Ok(value) => Ok(value),
            Err(_) => Ok(serde_json::Value::String(
                String::from_utf8_lossy(&bytes).into_owned(),
            )),
        }
    }
}

/// Persisted record of a dispatched task awaiting its response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutstandingTask {
    pub task_id: Uuid,
    pub node_execution_id: Uuid,
    pub plan_execution_id: Uuid,
    /// Node attempt the task was dispatched for.
    pub attempt: u32,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait TaskTransport: Send + Sync {
    async fn send(&self, request: &TaskRequest) -> EngineResult<()>;

    /// Tell executors a task is no longer wanted. Best effort.
    async fn cancel(&self, task_id: Uuid) -> EngineResult<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportMessage {
    Request(TaskRequest),
    Cancel(Uuid),
}

/// In-process transport backed by a channel.
#[derive(Clone)]
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<TransportMessage>,
}

impl ChannelTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TransportMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl TaskTransport for ChannelTransport {
    async fn send(&self, request: &TaskRequest) -> EngineResult<()> {
        self.tx
            .send(TransportMessage::Request(request.clone()))
            .map_err(|_| EngineError::Dispatch("task channel closed".to_string()))
    }

    async fn cancel(&self, task_id: Uuid) -> EngineResult<()> {
        self.tx
            .send(TransportMessage::Cancel(task_id))
            .map_err(|_| EngineError::Dispatch("task channel closed".to_string()))
    }
}

#[derive(Clone)]
pub struct TaskGateway {
    store: Arc<dyn ExecutionStore>,
    transport: Arc<dyn TaskTransport>,
    retry: RetryPolicy,
    work: WorkQueue,
    timers: Arc<Mutex<HashMap<Uuid, AbortHandle>>>,
}

impl TaskGateway {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        transport: Arc<dyn TaskTransport>,
        retry: RetryPolicy,
        work: WorkQueue,
    ) -> Self {
        Self {
            store,
            transport,
            retry,
            work,
            timers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Dispatch a task for `node` and return its id.
    ///
    /// Idempotent per node attempt: a second call returns the task already
    /// outstanding instead of sending another one.
    pub async fn dispatch(
        &self,
        node: &NodeExecution,
        spec: TaskSpec,
        timeout: Duration,
    ) -> EngineResult<Uuid> {
        if let Some(existing) = self.store.task_for_node(node.uuid).await? {
            if existing.attempt == node.attempt() {
                tracing::debug!(
                    node_execution_id = %node.uuid,
                    task_id = %existing.task_id,
                    "Task already outstanding"
                );
                return Ok(existing.task_id);
            }
            tracing::warn!(
                node_execution_id = %node.uuid,
                task_id = %existing.task_id,
                "Dropping task left over from a previous attempt"
            );
            self.store.resolve_task(existing.task_id).await?;
        }

        let now = Utc::now();
        let expires_at = now
            + chrono::Duration::from_std(timeout)
                .map_err(|e| EngineError::InvalidRequest(format!("invalid task timeout: {}", e)))?;
        let task = OutstandingTask {
            task_id: Uuid::new_v4(),
            node_execution_id: node.uuid,
            plan_execution_id: node.plan_execution_id,
            attempt: node.attempt(),
            expires_at,
            created_at: now,
        };

        let inserted = self
            .retry
            .retry("register task", || self.store.insert_task(&task))
            .await?;
        if !inserted {
            // Lost a race with a concurrent dispatch of the same attempt.
            return self
                .store
                .task_for_node(node.uuid)
                .await?
                .map(|t| t.task_id)
                .ok_or_else(|| EngineError::Conflict(format!("task for node {}", node.uuid)));
        }

        let request = TaskRequest {
            task_id: task.task_id,
            node_execution_id: node.uuid,
            plan_execution_id: node.plan_execution_id,
            task_type: spec.task_type,
            payload: spec.payload,
            expires_at,
        };

        if let Err(e) = self
            .retry
            .retry("send task", || self.transport.send(&request))
            .await
        {
            tracing::error!(task_id = %task.task_id, error = %e, "Task dispatch failed");
            self.store.resolve_task(task.task_id).await?;
            return Err(EngineError::Dispatch(e.to_string()));
        }

        self.arm(task.task_id, timeout);
        tracing::info!(
            plan_execution_id = %node.plan_execution_id,
            node_execution_id = %node.uuid,
            task_id = %task.task_id,
            task_type = %request.task_type,
            "Task dispatched"
        );
        Ok(task.task_id)
    }

    /// The task if it is still outstanding. Reading does not resolve it.
    pub async fn outstanding(&self, task_id: Uuid) -> EngineResult<Option<OutstandingTask>> {
        self.store.get_task(task_id).await
    }

    /// Drop an answered task and its expiry timer. `false` if it was already gone.
    pub async fn resolve(&self, task_id: Uuid) -> EngineResult<bool> {
        let resolved = self.store.resolve_task(task_id).await?;
        self.disarm(task_id);
        Ok(resolved.is_some())
    }

    /// Resolve a task whose expiry passed.
    pub async fn expire(&self, task_id: Uuid) -> EngineResult<Option<OutstandingTask>> {
        self.disarm(task_id);
        let resolved = self.store.resolve_task(task_id).await?;
        if resolved.is_some() {
            tracing::warn!(task_id = %task_id, "Task expired");
            if let Err(e) = self.transport.cancel(task_id).await {
                tracing::warn!(task_id = %task_id, error = %e, "Failed to cancel expired task");
            }
        }
        Ok(resolved)
    }

    /// Drop the outstanding task of a node, if any, and notify executors.
    pub async fn cancel_for_node(&self, node_execution_id: Uuid) -> EngineResult<()> {
        let Some(task) = self.store.task_for_node(node_execution_id).await? else {
            return Ok(());
        };
        if self.store.resolve_task(task.task_id).await?.is_none() {
            return Ok(());
        }
        self.disarm(task.task_id);
        tracing::info!(node_execution_id = %node_execution_id, task_id = %task.task_id, "Task cancelled");
        if let Err(e) = self.transport.cancel(task.task_id).await {
            tracing::warn!(task_id = %task.task_id, error = %e, "Failed to notify task cancellation");
        }
        Ok(())
    }

    pub async fn has_outstanding(&self, node_execution_id: Uuid) -> EngineResult<bool> {
        Ok(self.store.task_for_node(node_execution_id).await?.is_some())
    }

    /// Re-arm expiry timers of persisted outstanding tasks.
    pub async fn recover(&self) -> EngineResult<usize> {
        let tasks = self.store.outstanding_tasks().await?;
        let now = Utc::now();
        for task in &tasks {
            let remaining = (task.expires_at - now).to_std().unwrap_or(Duration::ZERO);
            self.arm(task.task_id, remaining);
        }
        Ok(tasks.len())
    }

    fn arm(&self, task_id: Uuid, after: Duration) {
        let handle = self.work.push_after(Work::TaskExpired { task_id }, after);
        let mut timers = self.timers.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(previous) = timers.insert(task_id, handle) {
            previous.abort();
        }
    }

    fn disarm(&self, task_id: Uuid) {
        let mut timers = self.timers.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(handle) = timers.remove(&task_id) {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ambiance::Ambiance;
    use crate::plan::{NodeGroup, PlanNode};
    use crate::store::MemoryStore;
    use serde_json::json;

    fn node() -> NodeExecution {
        let plan_node = PlanNode::new("t", "deploy", "TASK", NodeGroup::Step);
        NodeExecution::queued(
            &plan_node,
            &Ambiance::root(Uuid::new_v4(), "plan", "MANUAL"),
            "deploy".into(),
            None,
        )
    }

    fn spec() -> TaskSpec {
        TaskSpec {
            task_type: "deploy".into(),
            payload: json!({"image": "svc:1"}),
        }
    }

    fn gateway() -> (
        TaskGateway,
        mpsc::UnboundedReceiver<TransportMessage>,
        crate::engine::work::WorkReceiver,
    ) {
        let (transport, rx) = ChannelTransport::new();
        let (work, work_rx) = WorkQueue::new();
        let gateway = TaskGateway::new(
            Arc::new(MemoryStore::new()),
            Arc::new(transport),
            RetryPolicy::default(),
            work,
        );
        (gateway, rx, work_rx)
    }

    #[tokio::test]
    async fn test_at_most_one_outstanding_task() {
        let (gateway, mut rx, _work) = gateway();
        let n = node();

        let first = gateway.dispatch(&n, spec(), Duration::from_secs(60)).await.unwrap();
        let second = gateway.dispatch(&n, spec(), Duration::from_secs(60)).await.unwrap();
        assert_eq!(first, second);

        assert!(matches!(rx.recv().await, Some(TransportMessage::Request(r)) if r.task_id == first));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_task_outstanding_until_resolved() {
        let (gateway, _rx, _work) = gateway();
        let n = node();
        let task_id = gateway.dispatch(&n, spec(), Duration::from_secs(60)).await.unwrap();

        let task = gateway.outstanding(task_id).await.unwrap().unwrap();
        assert_eq!(task.node_execution_id, n.uuid);
        assert!(gateway.outstanding(task_id).await.unwrap().is_some());

        assert!(gateway.resolve(task_id).await.unwrap());
        assert!(!gateway.resolve(task_id).await.unwrap());
        assert!(gateway.outstanding(task_id).await.unwrap().is_none());
        assert!(gateway.outstanding(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_timer_fires() {
        let (gateway, _rx, mut work) = gateway();
        let n = node();
        let task_id = gateway.dispatch(&n, spec(), Duration::from_secs(10)).await.unwrap();

        let fired = work.recv().await;
        assert_eq!(fired, Some(Work::TaskExpired { task_id }));
        assert!(gateway.expire(task_id).await.unwrap().is_some());
        assert!(gateway.expire(task_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cancel_for_node_notifies_transport() {
        let (gateway, mut rx, _work) = gateway();
        let n = node();
        let task_id = gateway.dispatch(&n, spec(), Duration::from_secs(60)).await.unwrap();
        let _ = rx.recv().await;

        gateway.cancel_for_node(n.uuid).await.unwrap();
        assert_eq!(rx.recv().await, Some(TransportMessage::Cancel(task_id)));
        assert!(!gateway.has_outstanding(n.uuid).await.unwrap());
    }

    #[test]
    fn test_progress_decode() {
        let progress = TaskProgress {
            data: BASE64.encode(br#"{"percent":40}"#),
        };
        assert_eq!(progress.decode().unwrap(), json!({"percent": 40}));

        let text = TaskProgress {
            data: BASE64.encode(b"halfway"),
        };
        assert_eq!(text.decode().unwrap(), json!("halfway"));

        let bad = TaskProgress { data: "%%%".into() };
        assert!(bad.decode().is_err());
    }
}
