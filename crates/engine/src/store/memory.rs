//! In-memory store for embedding and tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::ExecutionStore;
use crate::engine::dispatch::OutstandingTask;
use crate::engine::execution::{NodeExecution, PlanExecution};
use crate::engine::interrupts::{Interrupt, InterruptState};
use crate::engine::outputs::SweepingOutput;
use crate::engine::status::Status;
use crate::error::{EngineError, EngineResult};
use crate::plan::Plan;

#[derive(Default)]
struct State {
    plans: HashMap<String, Plan>,
    plan_executions: HashMap<Uuid, PlanExecution>,
    nodes: HashMap<Uuid, NodeExecution>,
    /// Node ids in insertion order.
    node_order: Vec<Uuid>,
    /// Interrupts in registration order.
    interrupts: Vec<Interrupt>,
    outputs: HashMap<(Uuid, String, String), SweepingOutput>,
    tasks: HashMap<Uuid, OutstandingTask>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<State>,
    failures: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` operations with a transient store error.
    pub fn inject_failures(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    fn check(&self) -> EngineResult<()> {
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match injected {
            Ok(_) => Err(EngineError::Store("injected failure".to_string())),
            Err(_) => Ok(()),
        }
    }
}

#[async_trait]
impl ExecutionStore for MemoryStore {
    async fn insert_plan(&self, plan: &Plan) -> EngineResult<()> {
        self.check()?;
        let mut state = self.state.write().await;
        state
            .plans
            .entry(plan.uuid.clone())
            .or_insert_with(|| plan.clone());
        Ok(())
    }

    async fn get_plan(&self, plan_id: &str) -> EngineResult<Option<Plan>> {
        self.check()?;
        Ok(self.state.read().await.plans.get(plan_id).cloned())
    }

    async fn insert_plan_execution(&self, execution: &PlanExecution) -> EngineResult<()> {
        self.check()?;
        let mut state = self.state.write().await;
        if state.plan_executions.contains_key(&execution.uuid) {
            return Err(EngineError::AlreadyExists(format!(
                "plan execution {}",
                execution.uuid
            )));
        }
        state.plan_executions.insert(execution.uuid, execution.clone());
        Ok(())
    }

    async fn get_plan_execution(&self, id: Uuid) -> EngineResult<Option<PlanExecution>> {
        self.check()?;
        Ok(self.state.read().await.plan_executions.get(&id).cloned())
    }

    async fn update_plan_execution(
        &self,
        execution: &PlanExecution,
        expected_status: Status,
        expected_version: u64,
    ) -> EngineResult<bool> {
        self.check()?;
        let mut state = self.state.write().await;
        match state.plan_executions.get_mut(&execution.uuid) {
            Some(current)
                if current.status == expected_status && current.version == expected_version =>
            {
                *current = execution.clone();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(EngineError::NotFound(format!("plan execution {}", execution.uuid))),
        }
    }

    async fn active_plan_executions(&self) -> EngineResult<Vec<PlanExecution>> {
        self.check()?;
        let state = self.state.read().await;
        let mut active: Vec<_> = state
            .plan_executions
            .values()
            .filter(|e| !e.status.is_terminal())
            .cloned()
            .collect();
        active.sort_by_key(|e| e.start_ts);
        Ok(active)
    }

    async fn insert_node_execution(&self, node: &NodeExecution) -> EngineResult<()> {
        self.check()?;
        let mut state = self.state.write().await;
        if state.nodes.contains_key(&node.uuid) {
            return Err(EngineError::AlreadyExists(format!("node execution {}", node.uuid)));
        }
        state.nodes.insert(node.uuid, node.clone());
        state.node_order.push(node.uuid);
        Ok(())
    }

    async fn get_node_execution(&self, id: Uuid) -> EngineResult<Option<NodeExecution>> {
        self.check()?;
        Ok(self.state.read().await.nodes.get(&id).cloned())
    }

    async fn update_node_execution(
        &self,
        node: &NodeExecution,
        expected_status: Status,
        expected_version: u64,
    ) -> EngineResult<bool> {
        self.check()?;
        let mut state = self.state.write().await;
        match state.nodes.get_mut(&node.uuid) {
            Some(current)
                if current.status == expected_status && current.version == expected_version =>
            {
                *current = node.clone();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(EngineError::NotFound(format!("node execution {}", node.uuid))),
        }
    }

    async fn node_executions(&self, plan_execution_id: Uuid) -> EngineResult<Vec<NodeExecution>> {
        self.check()?;
        let state = self.state.read().await;
        Ok(state
            .node_order
            .iter()
            .filter_map(|id| state.nodes.get(id))
            .filter(|n| n.plan_execution_id == plan_execution_id)
            .cloned()
            .collect())
    }

    async fn children_of(
        &self,
        plan_execution_id: Uuid,
        parent_id: Option<Uuid>,
    ) -> EngineResult<Vec<NodeExecution>> {
        self.check()?;
        let state = self.state.read().await;
        Ok(state
            .node_order
            .iter()
            .filter_map(|id| state.nodes.get(id))
            .filter(|n| n.plan_execution_id == plan_execution_id && n.parent_id == parent_id)
            .cloned()
            .collect())
    }

    async fn insert_interrupt(&self, interrupt: &Interrupt) -> EngineResult<()> {
        self.check()?;
        self.state.write().await.interrupts.push(interrupt.clone());
        Ok(())
    }

    async fn interrupts_in_state(&self, state_filter: InterruptState) -> EngineResult<Vec<Interrupt>> {
        self.check()?;
        let state = self.state.read().await;
        Ok(state
            .interrupts
            .iter()
            .filter(|i| i.state == state_filter)
            .cloned()
            .collect())
    }

    async fn interrupts_for_plan(&self, plan_execution_id: Uuid) -> EngineResult<Vec<Interrupt>> {
        self.check()?;
        let state = self.state.read().await;
        Ok(state
            .interrupts
            .iter()
            .filter(|i| i.plan_execution_id == plan_execution_id)
            .cloned()
            .collect())
    }

    async fn update_interrupt(
        &self,
        interrupt: &Interrupt,
        expected_state: InterruptState,
    ) -> EngineResult<bool> {
        self.check()?;
        let mut state = self.state.write().await;
        match state.interrupts.iter_mut().find(|i| i.uuid == interrupt.uuid) {
            Some(current) if current.state == expected_state => {
                *current = interrupt.clone();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(EngineError::NotFound(format!("interrupt {}", interrupt.uuid))),
        }
    }

    async fn has_processing_interrupt(
        &self,
        plan_execution_id: Uuid,
        node_execution_id: Option<Uuid>,
    ) -> EngineResult<bool> {
        self.check()?;
        let state = self.state.read().await;
        Ok(state.interrupts.iter().any(|i| {
            i.state == InterruptState::Processing
                && i.plan_execution_id == plan_execution_id
                && i.node_execution_id == node_execution_id
        }))
    }

    async fn insert_output(&self, output: &SweepingOutput) -> EngineResult<()> {
        self.check()?;
        let mut state = self.state.write().await;
        let key = (
            output.plan_execution_id,
            output.scope.clone(),
            output.name.clone(),
        );
        if let Some(existing) = state.outputs.get(&key) {
            if !existing.overridable {
                return Err(EngineError::AlreadyExists(format!(
                    "sweeping output '{}'",
                    output.name
                )));
            }
        }
        state.outputs.insert(key, output.clone());
        Ok(())
    }

    async fn find_output(
        &self,
        plan_execution_id: Uuid,
        scope: &str,
        name: &str,
    ) -> EngineResult<Option<SweepingOutput>> {
        self.check()?;
        let state = self.state.read().await;
        Ok(state
            .outputs
            .get(&(plan_execution_id, scope.to_string(), name.to_string()))
            .cloned())
    }

    async fn insert_task(&self, task: &OutstandingTask) -> EngineResult<bool> {
        self.check()?;
        let mut state = self.state.write().await;
        if state
            .tasks
            .values()
            .any(|t| t.node_execution_id == task.node_execution_id)
        {
            return Ok(false);
        }
        state.tasks.insert(task.task_id, task.clone());
        Ok(true)
    }

    async fn resolve_task(&self, task_id: Uuid) -> EngineResult<Option<OutstandingTask>> {
        self.check()?;
        Ok(self.state.write().await.tasks.remove(&task_id))
    }

    async fn get_task(&self, task_id: Uuid) -> EngineResult<Option<OutstandingTask>> {
        self.check()?;
        Ok(self.state.read().await.tasks.get(&task_id).cloned())
    }

    async fn task_for_node(&self, node_execution_id: Uuid) -> EngineResult<Option<OutstandingTask>> {
        self.check()?;
        let state = self.state.read().await;
        Ok(state
            .tasks
            .values()
            .find(|t| t.node_execution_id == node_execution_id)
            .cloned())
    }

    async fn outstanding_tasks(&self) -> EngineResult<Vec<OutstandingTask>> {
        self.check()?;
        let state = self.state.read().await;
        let mut tasks: Vec<_> = state.tasks.values().cloned().collect();
        tasks.sort_by_key(|t| t.created_at);
        Ok(tasks)
    }

    async fn ping(&self) -> bool {
        true
    }
}
