//! Facilitators decide how a node executes.
//!
//! Facilitation is a pure function of the node's declared facilitator
//! obtainments, its plan definition and the capabilities of its step
//! handler. The first applicable facilitator in declaration order wins.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::steps::StepHandler;
use crate::error::{EngineError, EngineResult};
use crate::plan::PlanNode;

/// Facilitator kinds a plan node can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FacilitatorType {
    Sync,
    Async,
    Task,
    Child,
    Children,
}

/// How a node is driven to completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionMode {
    /// Runs in-process to completion.
    Sync,
    /// Handed to an executor; suspended until the callback.
    Async,
    /// Handed to an executor as a task; suspended until the callback.
    Task,
    /// Runs exactly one child chain.
    Child,
    /// Runs several children, possibly strategy-expanded.
    Children,
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sync => write!(f, "SYNC"),
            Self::Async => write!(f, "ASYNC"),
            Self::Task => write!(f, "TASK"),
            Self::Child => write!(f, "CHILD"),
            Self::Children => write!(f, "CHILDREN"),
        }
    }
}

/// Continuation recorded once the execution mode has been acted on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutableResponse {
    Sync,
    #[serde(rename_all = "camelCase")]
    Task { task_id: Uuid },
    #[serde(rename_all = "camelCase")]
    Async { task_id: Uuid },
    #[serde(rename_all = "camelCase")]
    Child { child_id: Uuid },
    #[serde(rename_all = "camelCase")]
    Children {
        children: Vec<Uuid>,
        /// 0 means unbounded.
        max_concurrency: usize,
        /// Number of children released so far.
        cursor: usize,
    },
}

impl ExecutableResponse {
    pub fn task_id(&self) -> Option<Uuid> {
        match self {
            ExecutableResponse::Task { task_id } | ExecutableResponse::Async { task_id } => {
                Some(*task_id)
            }
            _ => None,
        }
    }
}

pub trait Facilitator: Send + Sync {
    fn facilitator_type(&self) -> FacilitatorType;

    fn mode(&self) -> ExecutionMode;

    fn applies(&self, node: &PlanNode, handler: &dyn StepHandler) -> bool;
}

/// Built-in facilitator for each [`FacilitatorType`].
pub struct ModeFacilitator {
    kind: FacilitatorType,
}

impl ModeFacilitator {
    pub fn new(kind: FacilitatorType) -> Self {
        Self { kind }
    }
}

impl Facilitator for ModeFacilitator {
    fn facilitator_type(&self) -> FacilitatorType {
        self.kind
    }

    fn mode(&self) -> ExecutionMode {
        match self.kind {
            FacilitatorType::Sync => ExecutionMode::Sync,
            FacilitatorType::Async => ExecutionMode::Async,
            FacilitatorType::Task => ExecutionMode::Task,
            FacilitatorType::Child => ExecutionMode::Child,
            FacilitatorType::Children => ExecutionMode::Children,
        }
    }

    fn applies(&self, node: &PlanNode, handler: &dyn StepHandler) -> bool {
        let supported = handler.supported_modes().contains(&self.mode());
        match self.kind {
            FacilitatorType::Sync | FacilitatorType::Async | FacilitatorType::Task => supported,
            FacilitatorType::Child => {
                supported && node.children.len() == 1 && node.strategy.is_none()
            }
            FacilitatorType::Children => {
                supported && (node.strategy.is_some() || !node.children.is_empty())
            }
        }
    }
}

/// Registry of facilitators keyed by type.
pub struct FacilitatorRegistry {
    facilitators: HashMap<FacilitatorType, Arc<dyn Facilitator>>,
}

impl FacilitatorRegistry {
    pub fn new() -> Self {
        Self {
            facilitators: HashMap::new(),
        }
    }

    /// Registry with the five built-in facilitators.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for kind in [
            FacilitatorType::Sync,
            FacilitatorType::Async,
            FacilitatorType::Task,
            FacilitatorType::Child,
            FacilitatorType::Children,
        ] {
            registry.register(ModeFacilitator::new(kind));
        }
        registry
    }

    pub fn register<F: Facilitator + 'static>(&mut self, facilitator: F) {
        self.facilitators
            .insert(facilitator.facilitator_type(), Arc::new(facilitator));
    }

    pub fn has(&self, kind: FacilitatorType) -> bool {
        self.facilitators.contains_key(&kind)
    }

    /// Pick the execution mode for `node`.
    pub fn facilitate(
        &self,
        node: &PlanNode,
        handler: &dyn StepHandler,
    ) -> EngineResult<ExecutionMode> {
        let declared = if node.facilitator_obtainments.is_empty() {
            handler.default_facilitators()
        } else {
            node.facilitator_obtainments.clone()
        };

        declared
            .iter()
            .filter_map(|kind| self.facilitators.get(kind))
            .find(|f| f.applies(node, handler))
            .map(|f| f.mode())
            .ok_or_else(|| EngineError::NoFacilitator(node.identifier.clone()))
    }
}

impl Default for FacilitatorRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::steps::{NoopStep, SectionStep, TaskStep};
    use crate::engine::strategy::StrategyConfig;
    use crate::plan::NodeGroup;

    #[test]
    fn test_sync_step_facilitated_sync() {
        let registry = FacilitatorRegistry::with_builtins();
        let node = PlanNode::new("n", "noop", "NOOP", NodeGroup::Step);
        assert_eq!(registry.facilitate(&node, &NoopStep).unwrap(), ExecutionMode::Sync);
    }

    #[test]
    fn test_section_single_child_is_child_mode() {
        let registry = FacilitatorRegistry::with_builtins();
        let mut node = PlanNode::new("s", "stage", "STAGE", NodeGroup::Stage);
        node.children = vec!["a".into()];
        let handler = SectionStep::new("STAGE");
        assert_eq!(registry.facilitate(&node, &handler).unwrap(), ExecutionMode::Child);

        node.children.push("b".into());
        assert_eq!(registry.facilitate(&node, &handler).unwrap(), ExecutionMode::Children);
    }

    #[test]
    fn test_strategy_node_is_children_mode() {
        let registry = FacilitatorRegistry::with_builtins();
        let mut node = PlanNode::new("s", "matrix", "STRATEGY", NodeGroup::Strategy);
        node.children = vec!["a".into()];
        node.strategy = Some(StrategyConfig::Parallelism {
            count: 2,
            max_concurrency: None,
        });
        let handler = SectionStep::new("STRATEGY");
        assert_eq!(registry.facilitate(&node, &handler).unwrap(), ExecutionMode::Children);
    }

    #[test]
    fn test_declaration_order_wins() {
        let registry = FacilitatorRegistry::with_builtins();
        let mut node = PlanNode::new("t", "deploy", "TASK", NodeGroup::Step);
        node.facilitator_obtainments = vec![FacilitatorType::Async, FacilitatorType::Task];
        assert_eq!(registry.facilitate(&node, &TaskStep).unwrap(), ExecutionMode::Async);
    }

    #[test]
    fn test_no_applicable_facilitator() {
        let registry = FacilitatorRegistry::with_builtins();
        let mut node = PlanNode::new("n", "noop", "NOOP", NodeGroup::Step);
        node.facilitator_obtainments = vec![FacilitatorType::Child];
        let err = registry.facilitate(&node, &NoopStep).unwrap_err();
        assert!(matches!(err, EngineError::NoFacilitator(ref id) if id == "noop"));
    }

    #[test]
    fn test_executable_response_shape() {
        let task_id = Uuid::new_v4();
        let resp = ExecutableResponse::Task { task_id };
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["type"], "TASK");
        assert_eq!(json["taskId"], task_id.to_string());
        assert_eq!(resp.task_id(), Some(task_id));
    }
}
