//! Adviser chain.
//!
//! When a node reaches a terminal status its advisers are consulted in
//! declaration order. The first adviser whose `can_advise` holds decides the
//! next control action; with no applicable adviser the chain ends.

pub mod abort;
pub mod ignore;
pub mod next_step;
pub mod retry;
pub mod rollback;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::engine::execution::NodeExecution;
use crate::engine::failure::{FailureInfo, FailureType};
use crate::engine::outputs::SweepingOutputService;
use crate::engine::status::Status;
use crate::error::EngineResult;
use crate::plan::PlanNode;

pub use abort::OnFailAbortAdviser;
pub use ignore::OnFailIgnoreAdviser;
pub use next_step::NextStepAdviser;
pub use retry::RetryAdviser;
pub use rollback::OnFailRollbackAdviser;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdviserType {
    NextStep,
    OnFailRollback,
    Retry,
    OnFailIgnore,
    OnFailAbort,
}

impl std::fmt::Display for AdviserType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NextStep => "NEXT_STEP",
            Self::OnFailRollback => "ON_FAIL_ROLLBACK",
            Self::Retry => "RETRY",
            Self::OnFailIgnore => "ON_FAIL_IGNORE",
            Self::OnFailAbort => "ON_FAIL_ABORT",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RollbackStrategy {
    StageRollback,
    StepGroupRollback,
    Unknown,
}

impl RollbackStrategy {
    /// Parse a name as written in pipeline YAML (`StageRollback`).
    ///
    /// The serialized form (`STAGE_ROLLBACK`) is accepted too. Anything else,
    /// including `Unknown`, resolves to `None`.
    pub fn from_yaml_name(name: &str) -> Option<Self> {
        match name {
            "StageRollback" | "STAGE_ROLLBACK" => Some(Self::StageRollback),
            "StepGroupRollback" | "STEP_GROUP_ROLLBACK" => Some(Self::StepGroupRollback),
            _ => None,
        }
    }

    /// Legacy repair action codes that imply a rollback.
    pub fn from_repair_action_code(code: RepairActionCode) -> Option<Self> {
        match code {
            RepairActionCode::StageRollback => Some(Self::StageRollback),
            RepairActionCode::StepGroupRollback => Some(Self::StepGroupRollback),
            _ => None,
        }
    }

    pub fn yaml_name(self) -> &'static str {
        match self {
            Self::StageRollback => "StageRollback",
            Self::StepGroupRollback => "StepGroupRollback",
            Self::Unknown => "Unknown",
        }
    }
}

/// What to do once retries are used up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RepairActionCode {
    MarkAsFailed,
    Ignore,
    EndExecution,
    StageRollback,
    StepGroupRollback,
}

fn default_repair_action() -> RepairActionCode {
    RepairActionCode::MarkAsFailed
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NextStepParameters {
    pub next_node_id: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnFailRollbackParameters {
    /// YAML name of the strategy; `StageRollback` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
    #[serde(default)]
    pub strategy_to_uuid: HashMap<RollbackStrategy, String>,
    /// Empty applies to every broke status.
    #[serde(default)]
    pub applicable_failure_types: Vec<FailureType>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryAdviserParameters {
    pub retry_count: u32,
    /// Wait before each retry; the last entry repeats.
    #[serde(default)]
    pub wait_intervals_secs: Vec<u64>,
    #[serde(default)]
    pub applicable_failure_types: Vec<FailureType>,
    #[serde(default = "default_repair_action")]
    pub repair_action_after_retries: RepairActionCode,
    /// Rollback targets for the rollback repair actions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback: Option<OnFailRollbackParameters>,
    /// Where IGNORE proceeds to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_node_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnFailIgnoreParameters {
    #[serde(default)]
    pub applicable_failure_types: Vec<FailureType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_node_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnFailAbortParameters {
    #[serde(default)]
    pub applicable_failure_types: Vec<FailureType>,
}

/// Typed adviser configuration declared on a plan node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdviserObtainment {
    NextStep(NextStepParameters),
    OnFailRollback(OnFailRollbackParameters),
    Retry(RetryAdviserParameters),
    OnFailIgnore(OnFailIgnoreParameters),
    OnFailAbort(OnFailAbortParameters),
}

impl AdviserObtainment {
    pub fn adviser_type(&self) -> AdviserType {
        match self {
            Self::NextStep(_) => AdviserType::NextStep,
            Self::OnFailRollback(_) => AdviserType::OnFailRollback,
            Self::Retry(_) => AdviserType::Retry,
            Self::OnFailIgnore(_) => AdviserType::OnFailIgnore,
            Self::OnFailAbort(_) => AdviserType::OnFailAbort,
        }
    }

    /// Plan node ids this configuration points at.
    pub fn referenced_nodes(&self) -> Vec<&str> {
        fn rollback_targets(p: &OnFailRollbackParameters) -> Vec<&str> {
            let mut targets: Vec<&str> = p.strategy_to_uuid.values().map(|s| s.as_str()).collect();
            targets.sort_unstable();
            targets
        }
        match self {
            Self::NextStep(p) => vec![p.next_node_id.as_str()],
            Self::OnFailRollback(p) => rollback_targets(p),
            Self::Retry(p) => {
                let mut targets = p.rollback.as_ref().map(rollback_targets).unwrap_or_default();
                targets.extend(p.next_node_id.as_deref());
                targets
            }
            Self::OnFailIgnore(p) => p.next_node_id.as_deref().into_iter().collect(),
            Self::OnFailAbort(_) => Vec::new(),
        }
    }
}

/// Control action decided by an adviser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdviserResponse {
    /// Create the sibling `next_node_id`.
    #[serde(rename_all = "camelCase")]
    NextStep {
        next_node_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rollback: Option<RollbackStrategy>,
        #[serde(default)]
        ignore_failure: bool,
    },
    /// Retry the node after `wait_secs`.
    #[serde(rename_all = "camelCase")]
    Retry { wait_secs: u64 },
    /// Abort the whole plan execution.
    EndPlan,
    /// Nothing follows; resume the parent.
    #[serde(rename_all = "camelCase")]
    EndChain {
        #[serde(default)]
        ignore_failure: bool,
    },
}

impl AdviserResponse {
    pub fn end_chain() -> Self {
        AdviserResponse::EndChain {
            ignore_failure: false,
        }
    }

    pub fn ignores_failure(&self) -> bool {
        matches!(
            self,
            AdviserResponse::NextStep {
                ignore_failure: true,
                ..
            } | AdviserResponse::EndChain {
                ignore_failure: true
            }
        )
    }
}

/// Input to an adviser.
pub struct AdvisingEvent<'a> {
    pub node: &'a NodeExecution,
    pub plan_node: &'a PlanNode,
    pub to_status: Status,
    pub failure_info: Option<&'a FailureInfo>,
}

impl<'a> AdvisingEvent<'a> {
    pub fn new(node: &'a NodeExecution, plan_node: &'a PlanNode) -> Self {
        Self {
            node,
            plan_node,
            to_status: node.status,
            failure_info: node.failure_info.as_ref(),
        }
    }

    /// Target of the node's first NEXT_STEP obtainment.
    pub fn declared_next_step(&self) -> Option<&'a str> {
        self.plan_node
            .adviser_obtainments
            .iter()
            .find_map(|o| match o {
                AdviserObtainment::NextStep(p) => Some(p.next_node_id.as_str()),
                _ => None,
            })
    }
}

#[async_trait]
pub trait Adviser: Send + Sync {
    fn adviser_type(&self) -> AdviserType;

    fn can_advise(&self, event: &AdvisingEvent<'_>, obtainment: &AdviserObtainment) -> bool;

    async fn on_advise_event(
        &self,
        event: &AdvisingEvent<'_>,
        obtainment: &AdviserObtainment,
    ) -> EngineResult<AdviserResponse>;
}

/// Registry of advisers keyed by type.
pub struct AdviserRegistry {
    advisers: HashMap<AdviserType, Arc<dyn Adviser>>,
}

impl AdviserRegistry {
    pub fn new() -> Self {
        Self {
            advisers: HashMap::new(),
        }
    }

    pub fn with_builtins(outputs: SweepingOutputService) -> Self {
        let mut registry = Self::new();
        registry.register(NextStepAdviser);
        registry.register(OnFailRollbackAdviser::new(outputs.clone()));
        registry.register(RetryAdviser::new(outputs));
        registry.register(OnFailIgnoreAdviser);
        registry.register(OnFailAbortAdviser);
        registry
    }

    pub fn register<A: Adviser + 'static>(&mut self, adviser: A) {
        self.advisers.insert(adviser.adviser_type(), Arc::new(adviser));
    }

    pub fn get(&self, kind: AdviserType) -> Option<Arc<dyn Adviser>> {
        self.advisers.get(&kind).cloned()
    }

    /// Run the chain: the first applicable adviser decides.
    pub async fn advise(&self, event: &AdvisingEvent<'_>) -> EngineResult<AdviserResponse> {
        for obtainment in &event.plan_node.adviser_obtainments {
            let Some(adviser) = self.advisers.get(&obtainment.adviser_type()) else {
                tracing::warn!(
                    adviser_type = %obtainment.adviser_type(),
                    node_id = %event.plan_node.uuid,
                    "No adviser registered for type"
                );
                continue;
            };
            if adviser.can_advise(event, obtainment) {
                let response = adviser.on_advise_event(event, obtainment).await?;
                tracing::debug!(
                    node_execution_id = %event.node.uuid,
                    adviser_type = %obtainment.adviser_type(),
                    response = ?response,
                    "Adviser applied"
                );
                return Ok(response);
            }
        }
        Ok(AdviserResponse::end_chain())
    }
}

impl std::fmt::Debug for AdviserRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdviserRegistry")
            .field("advisers", &self.advisers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::engine::ambiance::{Ambiance, Level};
    use crate::plan::NodeGroup;
    use uuid::Uuid;

    /// A step node nested in a stage, with the given status.
    pub fn staged_node(plan_node: &PlanNode, status: Status) -> NodeExecution {
        let stage = Ambiance::root(Uuid::new_v4(), "plan", "MANUAL").child(Level {
            runtime_id: Uuid::new_v4(),
            setup_id: "stage".into(),
            identifier: "stage".into(),
            group: NodeGroup::Stage,
            strategy: None,
        });
        let mut node = NodeExecution::queued(plan_node, &stage, plan_node.identifier.clone(), None);
        node.status = status;
        node
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::failure::FailureInfo;
    use crate::plan::NodeGroup;
    use crate::store::MemoryStore;

    #[test]
    fn test_obtainment_yaml_shape() {
        let yaml = r#"
- type: ON_FAIL_ROLLBACK
  strategy: StageRollback
  strategyToUuid:
    STAGE_ROLLBACK: rollback-entry
  applicableFailureTypes: [CONNECTIVITY_FAILURE]
- type: NEXT_STEP
  nextNodeId: c
"#;
        let obtainments: Vec<AdviserObtainment> = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(obtainments[0].adviser_type(), AdviserType::OnFailRollback);
        assert_eq!(obtainments[0].referenced_nodes(), vec!["rollback-entry"]);
        assert_eq!(obtainments[1].referenced_nodes(), vec!["c"]);
    }

    #[test]
    fn test_rollback_strategy_names() {
        assert_eq!(
            RollbackStrategy::from_yaml_name("StageRollback"),
            Some(RollbackStrategy::StageRollback)
        );
        assert_eq!(
            RollbackStrategy::from_yaml_name("StepGroupRollback"),
            Some(RollbackStrategy::StepGroupRollback)
        );
        assert_eq!(RollbackStrategy::from_yaml_name("Unknown"), None);
        assert_eq!(RollbackStrategy::from_yaml_name("Bogus"), None);
        assert_eq!(
            RollbackStrategy::from_repair_action_code(RepairActionCode::StepGroupRollback),
            Some(RollbackStrategy::StepGroupRollback)
        );
        assert_eq!(RollbackStrategy::from_repair_action_code(RepairActionCode::Ignore), None);
    }

    #[tokio::test]
    async fn test_first_applicable_adviser_wins() {
        let registry =
            AdviserRegistry::with_builtins(SweepingOutputService::new(Arc::new(MemoryStore::new())));
        let mut plan_node = PlanNode::new("b", "b", "TASK", NodeGroup::Step);
        plan_node.adviser_obtainments = vec![
            AdviserObtainment::OnFailAbort(OnFailAbortParameters {
                applicable_failure_types: vec![FailureType::AuthenticationFailure],
            }),
            AdviserObtainment::OnFailIgnore(OnFailIgnoreParameters::default()),
            AdviserObtainment::NextStep(NextStepParameters {
                next_node_id: "c".into(),
            }),
        ];

        let mut node = test_support::staged_node(&plan_node, Status::Failed);
        node.failure_info = Some(FailureInfo::new("down", FailureType::ConnectivityFailure));
        let response = registry.advise(&AdvisingEvent::new(&node, &plan_node)).await.unwrap();
        assert_eq!(
            response,
            AdviserResponse::NextStep {
                next_node_id: "c".into(),
                rollback: None,
                ignore_failure: true,
            }
        );

        node.status = Status::Succeeded;
        node.failure_info = None;
        let response = registry.advise(&AdvisingEvent::new(&node, &plan_node)).await.unwrap();
        assert!(matches!(response, AdviserResponse::NextStep { ignore_failure: false, .. }));
    }

    #[tokio::test]
    async fn test_no_adviser_ends_chain() {
        let registry =
            AdviserRegistry::with_builtins(SweepingOutputService::new(Arc::new(MemoryStore::new())));
        let plan_node = PlanNode::new("b", "b", "TASK", NodeGroup::Step);
        let node = test_support::staged_node(&plan_node, Status::Failed);
        let response = registry.advise(&AdvisingEvent::new(&node, &plan_node)).await.unwrap();
        assert_eq!(response, AdviserResponse::end_chain());
    }
}
