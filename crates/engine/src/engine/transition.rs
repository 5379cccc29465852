//! Persisted transitions with compare-and-swap and bounded retry.
//!
//! Every mutation of a plan or node execution is a read-modify-write loop:
//! load the row, apply the mutation, write it back conditional on the status
//! and version that were read. A lost race re-reads and re-applies; the
//! mutation may retract once the change no longer makes sense. Transient
//! store errors back off exponentially and give up after `max_attempts`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use crate::engine::events::{EventSink, TransitionEvent};
use crate::engine::execution::{NodeExecution, PlanExecution};
use crate::engine::status::Status;
use crate::error::{EngineError, EngineResult};
use crate::store::ExecutionStore;

/// Write conflicts tolerated per transient attempt before giving up.
const CONFLICTS_PER_ATTEMPT: u32 = 8;

/// Bounded exponential backoff.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(2),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay after the `attempt`-th failure (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let delay = self.initial_backoff.mul_f64(exp);
        delay.min(self.max_backoff)
    }

    /// Run `op`, retrying transient errors.
    pub async fn retry<T, F, Fut>(&self, what: &str, mut op: F) -> EngineResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = EngineResult<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt);
                    tracing::warn!(error = %e, attempt, delay_ms = delay.as_millis() as u64, what, "Retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Stamp timestamps for a status change.
fn stamp(start_ts: &mut Option<chrono::DateTime<Utc>>, end_ts: &mut Option<chrono::DateTime<Utc>>, to: Status) {
    let now = Utc::now();
    if to == Status::Running && start_ts.is_none() {
        *start_ts = Some(now);
    }
    if to.is_terminal() {
        *end_ts = Some(now);
    }
}

/// Store access that applies the CAS loop and emits transition events.
#[derive(Clone)]
pub struct Persistence {
    store: Arc<dyn ExecutionStore>,
    retry: RetryPolicy,
    events: Arc<dyn EventSink>,
}

impl Persistence {
    pub fn new(store: Arc<dyn ExecutionStore>, retry: RetryPolicy, events: Arc<dyn EventSink>) -> Self {
        Self { store, retry, events }
    }

    pub fn store(&self) -> &Arc<dyn ExecutionStore> {
        &self.store
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn emit(&self, event: TransitionEvent) {
        self.events.publish(&event);
    }

    /// Apply `mutate` to a node execution.
    ///
    /// `mutate` returns `false` to retract; the result is then `Ok(None)`.
    pub async fn update_node<F>(&self, id: Uuid, mut mutate: F) -> EngineResult<Option<NodeExecution>>
    where
        F: FnMut(&mut NodeExecution) -> bool + Send,
    {
        let mut attempt = 1;
        let mut conflicts = 0;
        let mut last_error = String::new();

        while attempt <= self.retry.max_attempts {
            let current = match self.store.get_node_execution(id).await {
                Ok(Some(node)) => node,
                Ok(None) => return Err(EngineError::NotFound(format!("node execution {}", id))),
                Err(e) if e.is_transient() => {
                    last_error = e.to_string();
                    tokio::time::sleep(self.retry.delay_for(attempt)).await;
                    attempt += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };

            let mut next = current.clone();
            if !mutate(&mut next) {
                return Ok(None);
            }
            next.version = current.version + 1;

            match self
                .store
                .update_node_execution(&next, current.status, current.version)
                .await
            {
                Ok(true) => {
                    if next.status != current.status {
                        self.emit(TransitionEvent {
                            plan_execution_id: next.plan_execution_id,
                            node_execution_id: Some(next.uuid),
                            node_id: Some(next.plan_node_id.clone()),
                            from: current.status,
                            to: next.status,
                            timestamp: Utc::now(),
                        });
                    }
                    return Ok(Some(next));
                }
                Ok(false) => {
                    conflicts += 1;
                    last_error = "write conflict".to_string();
                    tracing::debug!(node_execution_id = %id, conflicts, "Write conflict, re-reading");
                    if conflicts % CONFLICTS_PER_ATTEMPT == 0 {
                        attempt += 1;
                    }
                    tokio::task::yield_now().await;
                }
                Err(e) if e.is_transient() => {
                    tracing::warn!(node_execution_id = %id, error = %e, attempt, "Transient store error");
                    last_error = e.to_string();
                    tokio::time::sleep(self.retry.delay_for(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }

        tracing::error!(node_execution_id = %id, error = %last_error, "Persistence retries exhausted");
        Err(EngineError::PersistenceExhausted(format!(
            "node execution {}: {}",
            id, last_error
        )))
    }

    /// Move a node to `to` if the edge is allowed, applying `mutate` alongside.
    ///
    /// Retracts (returns `Ok(None)`) when the node already left its prior
    /// status, so late or duplicate callers are harmless.
    pub async fn transition_node<F>(
        &self,
        id: Uuid,
        to: Status,
        mut mutate: F,
    ) -> EngineResult<Option<NodeExecution>>
    where
        F: FnMut(&mut NodeExecution) + Send,
    {
        self.update_node(id, |node| {
            if !node.status.can_transition_to(to) {
                return false;
            }
            node.status = to;
            stamp(&mut node.start_ts, &mut node.end_ts, to);
            mutate(node);
            true
        })
        .await
    }

    /// Apply `mutate` to a plan execution.
    pub async fn update_plan<F>(&self, id: Uuid, mut mutate: F) -> EngineResult<Option<PlanExecution>>
    where
        F: FnMut(&mut PlanExecution) -> bool + Send,
    {
        let mut attempt = 1;
        let mut conflicts = 0;
        let mut last_error = String::new();

        while attempt <= self.retry.max_attempts {
            let current = match self.store.get_plan_execution(id).await {
                Ok(Some(execution)) => execution,
                Ok(None) => return Err(EngineError::NotFound(format!("plan execution {}", id))),
                Err(e) if e.is_transient() => {
                    last_error = e.to_string();
                    tokio::time::sleep(self.retry.delay_for(attempt)).await;
                    attempt += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };

            let mut next = current.clone();
            if !mutate(&mut next) {
                return Ok(None);
            }
            next.version = current.version + 1;

            match self
                .store
                .update_plan_execution(&next, current.status, current.version)
                .await
            {
                Ok(true) => {
                    if next.status != current.status {
                        self.emit(TransitionEvent {
                            plan_execution_id: next.uuid,
                            node_execution_id: None,
                            node_id: None,
                            from: current.status,
                            to: next.status,
                            timestamp: Utc::now(),
                        });
                    }
                    return Ok(Some(next));
                }
                Ok(false) => {
                    conflicts += 1;
                    last_error = "write conflict".to_string();
                    if conflicts % CONFLICTS_PER_ATTEMPT == 0 {
                        attempt += 1;
                    }
                    tokio::task::yield_now().await;
                }
                Err(e) if e.is_transient() => {
                    tracing::warn!(plan_execution_id = %id, error = %e, attempt, "Transient store error");
                    last_error = e.to_string();
                    tokio::time::sleep(self.retry.delay_for(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }

        tracing::error!(plan_execution_id = %id, error = %last_error, "Persistence retries exhausted");
        Err(EngineError::PersistenceExhausted(format!(
            "plan execution {}: {}",
            id, last_error
        )))
    }

    /// Move a plan execution to `to` if the edge is allowed.
    pub async fn transition_plan<F>(
        &self,
        id: Uuid,
        to: Status,
        mut mutate: F,
    ) -> EngineResult<Option<PlanExecution>>
    where
        F: FnMut(&mut PlanExecution) + Send,
    {
        self.update_plan(id, |execution| {
            if !execution.status.can_transition_to(to) {
                return false;
            }
            execution.status = to;
            if to.is_terminal() {
                execution.end_ts = Some(Utc::now());
            }
            mutate(execution);
            true
        })
        .await
    }
}
