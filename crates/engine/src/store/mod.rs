//! Durable execution state.
//!
//! The engine never keeps authoritative state in memory: everything it needs
//! to resume after a crash goes through [`ExecutionStore`]. Updates are
//! conditional on the expected status and version so that concurrent writers
//! are linearized by the store.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use uuid::Uuid;

use crate::engine::dispatch::OutstandingTask;
use crate::engine::execution::{NodeExecution, PlanExecution};
use crate::engine::interrupts::{Interrupt, InterruptState};
use crate::engine::outputs::SweepingOutput;
use crate::engine::status::Status;
use crate::error::EngineResult;
use crate::plan::Plan;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Store a plan. Re-inserting the same plan id is a no-op.
    async fn insert_plan(&self, plan: &Plan) -> EngineResult<()>;

    async fn get_plan(&self, plan_id: &str) -> EngineResult<Option<Plan>>;

    async fn insert_plan_execution(&self, execution: &PlanExecution) -> EngineResult<()>;

    async fn get_plan_execution(&self, id: Uuid) -> EngineResult<Option<PlanExecution>>;

    /// Replace the row if it still has `expected_status` and `expected_version`.
    ///
    /// Returns `false` when another writer got there first.
    async fn update_plan_execution(
        &self,
        execution: &PlanExecution,
        expected_status: Status,
        expected_version: u64,
    ) -> EngineResult<bool>;

    /// Plan executions that are not terminal yet.
    async fn active_plan_executions(&self) -> EngineResult<Vec<PlanExecution>>;

    async fn insert_node_execution(&self, node: &NodeExecution) -> EngineResult<()>;

    async fn get_node_execution(&self, id: Uuid) -> EngineResult<Option<NodeExecution>>;

    /// Replace the row if it still has `expected_status` and `expected_version`.
    async fn update_node_execution(
        &self,
        node: &NodeExecution,
        expected_status: Status,
        expected_version: u64,
    ) -> EngineResult<bool>;

    /// All node executions of a plan execution, in creation order.
    async fn node_executions(&self, plan_execution_id: Uuid) -> EngineResult<Vec<NodeExecution>>;

    /// Direct children of `parent_id` (top-level nodes for `None`), in creation order.
    async fn children_of(
        &self,
        plan_execution_id: Uuid,
        parent_id: Option<Uuid>,
    ) -> EngineResult<Vec<NodeExecution>>;

    async fn insert_interrupt(&self, interrupt: &Interrupt) -> EngineResult<()>;

    /// Interrupts in `state` across all plan executions, in registration order.
    async fn interrupts_in_state(&self, state: InterruptState) -> EngineResult<Vec<Interrupt>>;

    async fn interrupts_for_plan(&self, plan_execution_id: Uuid) -> EngineResult<Vec<Interrupt>>;

    async fn update_interrupt(
        &self,
        interrupt: &Interrupt,
        expected_state: InterruptState,
    ) -> EngineResult<bool>;

    /// Whether an interrupt for exactly this target is PROCESSING.
    async fn has_processing_interrupt(
        &self,
        plan_execution_id: Uuid,
        node_execution_id: Option<Uuid>,
    ) -> EngineResult<bool>;

    /// Write an output. Fails with `AlreadyExists` unless the stored entry is overridable.
    async fn insert_output(&self, output: &SweepingOutput) -> EngineResult<()>;

    async fn find_output(
        &self,
        plan_execution_id: Uuid,
        scope: &str,
        name: &str,
    ) -> EngineResult<Option<SweepingOutput>>;

    /// Register an outstanding task. Returns `false` if the node already has one.
    async fn insert_task(&self, task: &OutstandingTask) -> EngineResult<bool>;

    /// Atomically remove and return a task. `None` if unknown or already resolved.
    async fn resolve_task(&self, task_id: Uuid) -> EngineResult<Option<OutstandingTask>>;

    async fn get_task(&self, task_id: Uuid) -> EngineResult<Option<OutstandingTask>>;

    async fn task_for_node(&self, node_execution_id: Uuid) -> EngineResult<Option<OutstandingTask>>;

    async fn outstanding_tasks(&self) -> EngineResult<Vec<OutstandingTask>>;

    /// Cheap liveness probe.
    async fn ping(&self) -> bool;
}
