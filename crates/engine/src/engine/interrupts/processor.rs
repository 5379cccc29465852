//! Interrupt consumer.
//!
//! Polls REGISTERED interrupts, groups them by target (plan execution plus
//! optional node) and applies each group in registration order. Different
//! targets are processed concurrently. A target is owned by at most one
//! PROCESSING interrupt at a time.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::Notify;
use uuid::Uuid;

use super::{Interrupt, InterruptState, InterruptType};
use crate::engine::execution::{InterruptEffect, NodeExecution, PlanExecution};
use crate::engine::failure::{FailureInfo, FailureType};
use crate::engine::orchestrator::{node_lock_key, plan_lock_key, Orchestrator};
use crate::engine::status::Status;
use crate::engine::work::Work;
use crate::error::EngineResult;
use crate::result_ext::ResultExt;
use crate::store::ExecutionStore;

/// `Err` carries the reason an interrupt could not be applied.
type Outcome = Result<(), String>;

pub struct InterruptConsumer {
    orchestrator: Orchestrator,
    signal: Arc<Notify>,
    poll_interval: Duration,
}

impl InterruptConsumer {
    pub fn new(orchestrator: Orchestrator) -> Self {
        let signal = orchestrator.interrupt_signal();
        let poll_interval = orchestrator.settings().interrupt_poll_interval;
        Self {
            orchestrator,
            signal,
            poll_interval,
        }
    }

    /// Consume interrupts until the task is dropped.
    pub async fn run(self) {
        tracing::info!(
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "Interrupt consumer started"
        );
        loop {
            self.process_pending().await.log_and_discard("processing interrupts");
            tokio::select! {
                _ = self.signal.notified() => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    /// Apply every REGISTERED interrupt. Returns how many were processed.
    pub async fn process_pending(&self) -> EngineResult<usize> {
        let registered = self
            .orchestrator
            .store()
            .interrupts_in_state(InterruptState::Registered)
            .await?;
        if registered.is_empty() {
            return Ok(0);
        }

        let mut targets: Vec<((Uuid, Option<Uuid>), Vec<Interrupt>)> = Vec::new();
        for interrupt in registered {
            let key = (interrupt.plan_execution_id, interrupt.node_execution_id);
            match targets.iter_mut().find(|(k, _)| *k == key) {
                Some((_, batch)) => batch.push(interrupt),
                None => targets.push((key, vec![interrupt])),
            }
        }

        let results = join_all(
            targets
                .into_iter()
                .map(|((plan, node), batch)| self.process_target(plan, node, batch)),
        )
        .await;

        let mut processed = 0;
        for result in results {
            match result {
                Ok(n) => processed += n,
                Err(e) => tracing::error!(error = %e, "Interrupt target failed"),
            }
        }
        Ok(processed)
    }

    /// Reset interrupts left PROCESSING by a crash so they run again.
    pub(crate) async fn requeue_processing(store: &dyn ExecutionStore) -> EngineResult<usize> {
        let stuck = store.interrupts_in_state(InterruptState::Processing).await?;
        let mut requeued = 0;
        for mut interrupt in stuck {
            interrupt.state = InterruptState::Registered;
            if store
                .update_interrupt(&interrupt, InterruptState::Processing)
                .await?
            {
                requeued += 1;
            }
        }
        Ok(requeued)
    }

    async fn process_target(
        &self,
        plan_execution_id: Uuid,
        node_execution_id: Option<Uuid>,
        batch: Vec<Interrupt>,
    ) -> EngineResult<usize> {
        let key = match node_execution_id {
            Some(id) => node_lock_key(id),
            None => plan_lock_key(plan_execution_id),
        };
        let _guard = self.orchestrator.locks().lock(key).await;

        if self
            .orchestrator
            .store()
            .has_processing_interrupt(plan_execution_id, node_execution_id)
            .await?
        {
            tracing::debug!(
                plan_execution_id = %plan_execution_id,
                node_execution_id = ?node_execution_id,
                "Target busy, deferring interrupts"
            );
            return Ok(0);
        }

        let mut processed = 0;
        for interrupt in batch {
            if self.process_one(interrupt).await? {
                processed += 1;
            }
        }
        Ok(processed)
    }

    async fn process_one(&self, interrupt: Interrupt) -> EngineResult<bool> {
        let store = self.orchestrator.store();
        let mut claimed = interrupt;
        claimed.state = InterruptState::Processing;
        if !store
            .update_interrupt(&claimed, InterruptState::Registered)
            .await?
        {
            return Ok(false);
        }

        let (state, outcome) = match self.apply(&claimed).await {
            Ok(Ok(())) => (InterruptState::ProcessedSuccessfully, None),
            Ok(Err(reason)) => (InterruptState::ProcessedUnsuccessfully, Some(reason)),
            Err(e) => {
                tracing::error!(interrupt_id = %claimed.uuid, error = %e, "Interrupt failed");
                (InterruptState::ProcessedUnsuccessfully, Some(e.to_string()))
            }
        };

        let mut done = claimed.clone();
        done.state = state;
        done.processed_at = Some(Utc::now());
        done.outcome = outcome;
        self.orchestrator
            .persistence()
            .retry_policy()
            .retry("finish interrupt", || {
                store.update_interrupt(&done, InterruptState::Processing)
            })
            .await?;

        match &done.outcome {
            None => tracing::info!(
                plan_execution_id = %done.plan_execution_id,
                interrupt_id = %done.uuid,
                interrupt_type = %done.interrupt_type,
                "Interrupt applied"
            ),
            Some(reason) => tracing::warn!(
                plan_execution_id = %done.plan_execution_id,
                interrupt_id = %done.uuid,
                interrupt_type = %done.interrupt_type,
                reason = %reason,
                "Interrupt not applied"
            ),
        }
        Ok(true)
    }

    async fn apply(&self, interrupt: &Interrupt) -> EngineResult<Outcome> {
        let execution = self
            .orchestrator
            .plan_execution(interrupt.plan_execution_id)
            .await?;
        if execution.status.is_terminal() {
            return Ok(Err(format!("plan execution already {}", execution.status)));
        }
        let effect = InterruptEffect {
            interrupt_id: interrupt.uuid,
            interrupt_type: interrupt.interrupt_type,
            applied_at: Utc::now(),
        };

        match interrupt.interrupt_type {
            InterruptType::AbortAll => return self.abort_all(&execution, effect).await,
            InterruptType::PauseAll => return self.pause_all(&execution).await,
            InterruptType::ResumeAll => return self.resume_all(&execution).await,
            _ => {}
        }

        let Some(node_id) = interrupt.node_execution_id else {
            return Ok(Err("interrupt has no target node".to_string()));
        };
        let Some(node) = self.orchestrator.store().get_node_execution(node_id).await? else {
            return Ok(Err(format!("node execution {} not found", node_id)));
        };

        match interrupt.interrupt_type {
            InterruptType::Abort => self.abort(&node, effect).await,
            InterruptType::Pause => self.pause(&node, effect).await,
            InterruptType::Resume => self.resume(&node, effect).await,
            InterruptType::Retry => self.retry(&node, interrupt, effect).await,
            InterruptType::MarkExpired => {
                self.mark(
                    &node,
                    Status::Expired,
                    FailureInfo::expired("marked expired by interrupt"),
                    effect,
                )
                .await
            }
            InterruptType::MarkFailed => {
                self.mark(
                    &node,
                    Status::Failed,
                    FailureInfo::new("marked failed by interrupt", FailureType::UserMarkedFailure),
                    effect,
                )
                .await
            }
            InterruptType::AbortAll | InterruptType::PauseAll | InterruptType::ResumeAll => {
                Ok(Err("plan-scoped interrupt given a node".to_string()))
            }
        }
    }

    async fn abort_all(&self, execution: &PlanExecution, effect: InterruptEffect) -> EngineResult<Outcome> {
        let roots = self
            .orchestrator
            .store()
            .children_of(execution.uuid, None)
            .await?;
        for root in &roots {
            self.orchestrator.abort_descendants(root).await?;
            self.orchestrator.abort_node(root.uuid, Some(effect.clone())).await?;
        }
        let aborted = self
            .orchestrator
            .persistence()
            .transition_plan(execution.uuid, Status::Aborted, |_| {})
            .await?;
        Ok(match aborted {
            Some(_) => {
                tracing::warn!(plan_execution_id = %execution.uuid, "Plan execution aborted");
                Ok(())
            }
            None => Err("plan execution finished first".to_string()),
        })
    }

    async fn pause_all(&self, execution: &PlanExecution) -> EngineResult<Outcome> {
        let paused = self
            .orchestrator
            .persistence()
            .transition_plan(execution.uuid, Status::Suspended, |_| {})
            .await?;
        Ok(match paused {
            Some(_) => Ok(()),
            None => Err(format!("plan execution is {}", execution.status)),
        })
    }

    async fn resume_all(&self, execution: &PlanExecution) -> EngineResult<Outcome> {
        if execution.status != Status::Suspended {
            return Ok(Err(format!("plan execution is {}", execution.status)));
        }
        let resumed = self
            .orchestrator
            .persistence()
            .transition_plan(execution.uuid, Status::Running, |_| {})
            .await?;
        if resumed.is_none() {
            return Ok(Err("plan execution changed before resume".to_string()));
        }
        self.orchestrator.reconcile(execution.uuid).await?;
        Ok(Ok(()))
    }

    async fn abort(&self, node: &NodeExecution, effect: InterruptEffect) -> EngineResult<Outcome> {
        if node.status.is_terminal() {
            return Ok(Err(format!("node execution already {}", node.status)));
        }
        self.orchestrator.abort_descendants(node).await?;
        let aborted = self.orchestrator.abort_node(node.uuid, Some(effect)).await?;
        self.orchestrator.push(Work::ResumeParent {
            plan_execution_id: node.plan_execution_id,
            parent_id: node.parent_id,
        });
        Ok(if aborted {
            Ok(())
        } else {
            Err("node execution finished first".to_string())
        })
    }

    async fn pause(&self, node: &NodeExecution, effect: InterruptEffect) -> EngineResult<Outcome> {
        if node.status.is_terminal() {
            return Ok(Err(format!("node execution already {}", node.status)));
        }
        let paused = self
            .orchestrator
            .persistence()
            .update_node(node.uuid, |n| {
                if n.status.is_terminal() {
                    return false;
                }
                n.paused = true;
                n.interrupt_history.push(effect.clone());
                true
            })
            .await?;
        Ok(match paused {
            Some(_) => Ok(()),
            None => Err("node execution finished first".to_string()),
        })
    }

    /// Clears the pause flag, also on a node that finished while paused.
    async fn resume(&self, node: &NodeExecution, effect: InterruptEffect) -> EngineResult<Outcome> {
        if !node.paused {
            return Ok(Err("node execution is not paused".to_string()));
        }
        let resumed = self
            .orchestrator
            .persistence()
            .update_node(node.uuid, |n| {
                if !n.paused {
                    return false;
                }
                n.paused = false;
                n.interrupt_history.push(effect.clone());
                true
            })
            .await?;
        if resumed.is_none() {
            return Ok(Err("node execution is not paused".to_string()));
        }
        self.orchestrator.reconcile(node.plan_execution_id).await?;
        Ok(Ok(()))
    }

    async fn retry(
        &self,
        node: &NodeExecution,
        interrupt: &Interrupt,
        effect: InterruptEffect,
    ) -> EngineResult<Outcome> {
        if !node.status.is_retryable() {
            return Ok(Err(format!(
                "node execution is {}; only FAILED, ERRORED or EXPIRED can be retried",
                node.status
            )));
        }
        if let Some(parent_id) = node.parent_id {
            if let Some(parent) = self.orchestrator.store().get_node_execution(parent_id).await? {
                if parent.status.is_terminal() {
                    return Ok(Err(format!("parent execution already {}", parent.status)));
                }
            }
        }
        if let Some(next) = self.orchestrator.successor(node).await? {
            return Ok(Err(format!(
                "node execution already advanced to {} ({})",
                next.identifier, next.status
            )));
        }

        let wait_secs = interrupt.config.wait_secs.unwrap_or(0);
        let not_before = (wait_secs > 0).then(|| Utc::now() + chrono::Duration::seconds(wait_secs as i64));
        let retried = self
            .orchestrator
            .persistence()
            .update_node(node.uuid, |n| {
                if !n.begin_retry(not_before) {
                    return false;
                }
                n.interrupt_history.push(effect.clone());
                true
            })
            .await?;
        let Some(retried) = retried else {
            return Ok(Err("node execution changed before retry".to_string()));
        };

        tracing::info!(
            node_execution_id = %retried.uuid,
            attempt = retried.attempt(),
            wait_secs,
            "Node re-queued for retry"
        );
        self.orchestrator.push(Work::Start {
            node_execution_id: retried.uuid,
        });
        Ok(Ok(()))
    }

    async fn mark(
        &self,
        node: &NodeExecution,
        to: Status,
        failure: FailureInfo,
        effect: InterruptEffect,
    ) -> EngineResult<Outcome> {
        if node.status.is_terminal() {
            return Ok(Err(format!("node execution already {}", node.status)));
        }
        let marked = self
            .orchestrator
            .force_terminal(node, to, failure, Some(effect))
            .await?;
        Ok(if marked {
            Ok(())
        } else {
            Err("node execution finished first".to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::interrupts::InterruptRequest;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_requeue_processing() {
        let store = MemoryStore::new();
        let plan_execution_id = Uuid::new_v4();

        let mut stuck = InterruptRequest::new(InterruptType::PauseAll, None).into_interrupt(plan_execution_id);
        stuck.state = InterruptState::Processing;
        store.insert_interrupt(&stuck).await.unwrap();
        let done = {
            let mut i = InterruptRequest::new(InterruptType::ResumeAll, None).into_interrupt(plan_execution_id);
            i.state = InterruptState::ProcessedSuccessfully;
            i
        };
        store.insert_interrupt(&done).await.unwrap();

        let requeued = InterruptConsumer::requeue_processing(&store).await.unwrap();
        assert_eq!(requeued, 1);

        let registered = store
            .interrupts_in_state(InterruptState::Registered)
            .await
            .unwrap();
        assert_eq!(registered.len(), 1);
        assert_eq!(registered[0].uuid, stuck.uuid);
        assert!(!store.has_processing_interrupt(plan_execution_id, None).await.unwrap());
    }
}
