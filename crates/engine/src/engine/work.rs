//! Work items driven by the orchestrator.
//!
//! Handlers never call each other directly. Each step of progress is a work
//! item pushed on this queue and picked up by the driver loop, so independent
//! subtrees make progress concurrently and no handler recurses.

use std::time::Duration;

use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Work {
    /// Evaluate conditions, facilitate and move a QUEUED node to RUNNING.
    Start { node_execution_id: Uuid },
    /// Act on the execution mode of a RUNNING node.
    Execute { node_execution_id: Uuid },
    /// Run the adviser chain of a terminal node.
    Advance { node_execution_id: Uuid },
    /// Re-check a parent's children; `None` finalizes the plan execution.
    ResumeParent {
        plan_execution_id: Uuid,
        parent_id: Option<Uuid>,
    },
    /// A dispatched task reached its expiry.
    TaskExpired { task_id: Uuid },
    /// A node deadline passed for the given attempt.
    NodeExpired { node_execution_id: Uuid, attempt: u32 },
}

pub type WorkReceiver = mpsc::UnboundedReceiver<Work>;

#[derive(Clone)]
pub struct WorkQueue {
    tx: mpsc::UnboundedSender<Work>,
}

impl WorkQueue {
    pub fn new() -> (Self, WorkReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn push(&self, work: Work) {
        if let Err(e) = self.tx.send(work) {
            tracing::warn!(work = ?e.0, "Work queue closed, dropping work item");
        }
    }

    /// Push `work` once `delay` has elapsed.
    pub fn push_after(&self, work: Work, delay: Duration) -> tokio::task::AbortHandle {
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.push(work);
        })
        .abort_handle()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_push_and_receive() {
        let (queue, mut rx) = WorkQueue::new();
        let id = Uuid::new_v4();
        queue.push(Work::Start { node_execution_id: id });
        assert_eq!(rx.recv().await, Some(Work::Start { node_execution_id: id }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_after_delay() {
        let (queue, mut rx) = WorkQueue::new();
        let id = Uuid::new_v4();
        queue.push_after(Work::Advance { node_execution_id: id }, Duration::from_secs(30));

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert!(rx.try_recv().is_err());

        let work = rx.recv().await;
        assert_eq!(work, Some(Work::Advance { node_execution_id: id }));
    }
}
