//! Step handlers and their registry.
//!
//! Concrete step business logic lives outside the engine. A handler only
//! describes how its step type plugs in: which execution modes it supports,
//! how to run synchronously, how to build a task request, and how to map a
//! task response or the outcome of its children.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::engine::dispatch::TaskResponse;
use crate::engine::execution::NodeExecution;
use crate::engine::facilitator::{ExecutionMode, FacilitatorType};
use crate::engine::failure::{FailureInfo, FailureType};
use crate::engine::status::{reduce_statuses, Status};
use crate::error::{EngineError, EngineResult};
use crate::plan::PlanNode;

/// Inputs available to a handler.
pub struct StepContext<'a> {
    pub node: &'a NodeExecution,
    pub plan_node: &'a PlanNode,
    /// Step parameters after template rendering.
    pub parameters: &'a serde_json::Value,
}

/// Outcome reported by a handler.
#[derive(Debug, Clone, PartialEq)]
pub struct StepResponse {
    pub status: Status,
    pub failure_info: Option<FailureInfo>,
    pub outputs: Option<serde_json::Value>,
    pub rolled_back: bool,
}

impl StepResponse {
    pub fn succeeded(outputs: Option<serde_json::Value>) -> Self {
        Self {
            status: Status::Succeeded,
            failure_info: None,
            outputs,
            rolled_back: false,
        }
    }

    pub fn failed(status: Status, failure_info: FailureInfo) -> Self {
        Self {
            status,
            failure_info: Some(failure_info),
            outputs: None,
            rolled_back: false,
        }
    }
}

/// Work handed to an executor.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskSpec {
    pub task_type: String,
    pub payload: serde_json::Value,
}

#[async_trait]
pub trait StepHandler: Send + Sync {
    /// Key matched against `PlanNode::step_type`.
    fn step_type(&self) -> &str;

    fn supported_modes(&self) -> &'static [ExecutionMode];

    /// Facilitators tried when the node declares none.
    fn default_facilitators(&self) -> Vec<FacilitatorType> {
        self.supported_modes()
            .iter()
            .map(|mode| match mode {
                ExecutionMode::Sync => FacilitatorType::Sync,
                ExecutionMode::Async => FacilitatorType::Async,
                ExecutionMode::Task => FacilitatorType::Task,
                ExecutionMode::Child => FacilitatorType::Child,
                ExecutionMode::Children => FacilitatorType::Children,
            })
            .collect()
    }

    async fn execute_sync(&self, _ctx: &StepContext<'_>) -> EngineResult<StepResponse> {
        Err(EngineError::InvalidRequest(format!(
            "step type {} cannot run synchronously",
            self.step_type()
        )))
    }

    fn task_request(&self, _ctx: &StepContext<'_>) -> EngineResult<TaskSpec> {
        Err(EngineError::InvalidRequest(format!(
            "step type {} does not dispatch tasks",
            self.step_type()
        )))
    }

    fn handle_task_response(&self, response: &TaskResponse) -> StepResponse {
        let failure_info = response.failure.clone().or_else(|| {
            response.status.is_broke().then(|| {
                FailureInfo::new(
                    format!("task finished with {}", response.status),
                    FailureType::UnknownFailure,
                )
            })
        });
        StepResponse {
            status: response.status,
            failure_info,
            outputs: response.outputs.clone(),
            rolled_back: false,
        }
    }

    fn handle_children_response(&self, children: &[NodeExecution]) -> StepResponse {
        aggregate_children(children)
    }
}

/// Reduce children into the parent's outcome.
///
/// `rolled_back` holds when a rollback chain ran and every rollback node
/// succeeded, or when a broke child was itself rolled back.
pub fn aggregate_children(children: &[NodeExecution]) -> StepResponse {
    let forward = children.iter().filter(|c| c.rollback.is_none());
    let status = reduce_statuses(forward.map(|c| (c.status, c.failure_ignored)));

    let rollback_nodes: Vec<_> = children.iter().filter(|c| c.rollback.is_some()).collect();
    let rolled_back = (!rollback_nodes.is_empty()
        && rollback_nodes.iter().all(|c| c.status == Status::Succeeded))
        || children.iter().any(|c| c.rolled_back && c.status.is_broke());

    let failure_info = status.is_broke().then(|| {
        let failed: Vec<_> = children
            .iter()
            .filter(|c| c.status.is_broke() && !c.failure_ignored)
            .collect();
        let mut info = FailureInfo {
            error_message: format!(
                "{} child execution(s) ended {}",
                failed.len().max(1),
                status
            ),
            failure_data: Vec::new(),
        };
        for child in failed {
            if let Some(child_info) = &child.failure_info {
                info.failure_data.extend(child_info.failure_data.iter().cloned());
            }
        }
        info
    });

    StepResponse {
        status,
        failure_info,
        outputs: None,
        rolled_back,
    }
}

/// Succeeds immediately; `stepParameters.outputs` becomes the node output.
pub struct NoopStep;

#[async_trait]
impl StepHandler for NoopStep {
    fn step_type(&self) -> &str {
        "NOOP"
    }

    fn supported_modes(&self) -> &'static [ExecutionMode] {
        &[ExecutionMode::Sync]
    }

    async fn execute_sync(&self, ctx: &StepContext<'_>) -> EngineResult<StepResponse> {
        Ok(StepResponse::succeeded(ctx.parameters.get("outputs").cloned()))
    }
}

/// Forwards resolved parameters to an executor.
///
/// The task type is `stepParameters.taskType`, defaulting to the node identifier.
pub struct TaskStep;

#[async_trait]
impl StepHandler for TaskStep {
    fn step_type(&self) -> &str {
        "TASK"
    }

    fn supported_modes(&self) -> &'static [ExecutionMode] {
        &[ExecutionMode::Task, ExecutionMode::Async]
    }

    fn task_request(&self, ctx: &StepContext<'_>) -> EngineResult<TaskSpec> {
        let task_type = ctx
            .parameters
            .get("taskType")
            .and_then(|v| v.as_str())
            .unwrap_or(&ctx.plan_node.identifier)
            .to_string();
        Ok(TaskSpec {
            task_type,
            payload: ctx.parameters.clone(),
        })
    }
}

/// Container nodes (pipeline, stage, step group, section, strategy).
pub struct SectionStep {
    step_type: String,
}

impl SectionStep {
    pub fn new(step_type: &str) -> Self {
        Self {
            step_type: step_type.to_string(),
        }
    }
}

#[async_trait]
impl StepHandler for SectionStep {
    fn step_type(&self) -> &str {
        &self.step_type
    }

    fn supported_modes(&self) -> &'static [ExecutionMode] {
        &[ExecutionMode::Child, ExecutionMode::Children]
    }
}

/// Registry of step handlers keyed by step type.
pub struct StepRegistry {
    handlers: HashMap<String, Arc<dyn StepHandler>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// NOOP, TASK and the section types.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(NoopStep);
        registry.register(TaskStep);
        for section in ["PIPELINE", "STAGE", "STEP_GROUP", "SECTION", "STRATEGY"] {
            registry.register(SectionStep::new(section));
        }
        registry
    }

    pub fn register<H: StepHandler + 'static>(&mut self, handler: H) {
        let key = handler.step_type().to_string();
        self.handlers.insert(key, Arc::new(handler));
    }

    pub fn get(&self, step_type: &str) -> Option<Arc<dyn StepHandler>> {
        self.handlers.get(step_type).cloned()
    }

    pub fn has(&self, step_type: &str) -> bool {
        self.handlers.contains_key(step_type)
    }

    pub fn list(&self) -> Vec<&str> {
        self.handlers.keys().map(|s| s.as_str()).collect()
    }
}

impl Default for StepRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl std::fmt::Debug for StepRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepRegistry")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}
