//! Plan type definitions.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::engine::advisers::AdviserObtainment;
use crate::engine::facilitator::FacilitatorType;
use crate::engine::strategy::StrategyConfig;

/// Structural role of a plan node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeGroup {
    Pipeline,
    Stage,
    StepGroup,
    Step,
    Strategy,
    Section,
}

impl std::fmt::Display for NodeGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pipeline => write!(f, "PIPELINE"),
            Self::Stage => write!(f, "STAGE"),
            Self::StepGroup => write!(f, "STEP_GROUP"),
            Self::Step => write!(f, "STEP"),
            Self::Strategy => write!(f, "STRATEGY"),
            Self::Section => write!(f, "SECTION"),
        }
    }
}

/// Node deadline. The node is marked EXPIRED once it has been running this long.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeoutObtainment {
    pub timeout_secs: u64,
}

/// One node of a compiled plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanNode {
    /// Unique id within the plan.
    pub uuid: String,

    /// Human readable identifier (`deploy`, `approval`).
    pub identifier: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Key into the step registry.
    pub step_type: String,

    pub group: NodeGroup,

    #[serde(default)]
    pub step_parameters: serde_json::Value,

    /// Advisers consulted in declaration order.
    #[serde(default)]
    pub adviser_obtainments: Vec<AdviserObtainment>,

    /// Facilitators tried in declaration order. Empty uses the step handler's defaults.
    #[serde(default)]
    pub facilitator_obtainments: Vec<FacilitatorType>,

    /// Child node ids. A CHILD facilitator runs the first as a chain; CHILDREN runs all.
    #[serde(default)]
    pub children: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_condition: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when_condition: Option<String>,

    #[serde(default)]
    pub timeout_obtainments: Vec<TimeoutObtainment>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<StrategyConfig>,
}

impl PlanNode {
    pub fn new(uuid: &str, identifier: &str, step_type: &str, group: NodeGroup) -> Self {
        Self {
            uuid: uuid.to_string(),
            identifier: identifier.to_string(),
            name: None,
            step_type: step_type.to_string(),
            group,
            step_parameters: serde_json::Value::Null,
            adviser_obtainments: Vec::new(),
            facilitator_obtainments: Vec::new(),
            children: Vec::new(),
            skip_condition: None,
            when_condition: None,
            timeout_obtainments: Vec::new(),
            strategy: None,
        }
    }

    /// Shortest declared node timeout.
    pub fn timeout(&self) -> Option<std::time::Duration> {
        self.timeout_obtainments
            .iter()
            .map(|t| t.timeout_secs)
            .min()
            .map(std::time::Duration::from_secs)
    }
}

/// Immutable compiled plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    pub uuid: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    pub start_node_id: String,

    pub nodes: Vec<PlanNode>,
}

impl Plan {
    pub fn node(&self, uuid: &str) -> Option<&PlanNode> {
        self.nodes.iter().find(|n| n.uuid == uuid)
    }

    pub fn start_node(&self) -> Option<&PlanNode> {
        self.node(&self.start_node_id)
    }

    /// Node lookup table keyed by uuid.
    pub fn index(&self) -> HashMap<&str, &PlanNode> {
        self.nodes.iter().map(|n| (n.uuid.as_str(), n)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_plan_node_deserialize_defaults() {
        let node: PlanNode = serde_json::from_value(json!({
            "uuid": "n1",
            "identifier": "build",
            "stepType": "TASK",
            "group": "STEP"
        }))
        .unwrap();
        assert!(node.children.is_empty());
        assert!(node.adviser_obtainments.is_empty());
        assert!(node.timeout().is_none());
    }

    #[test]
    fn test_shortest_timeout_wins() {
        let mut node = PlanNode::new("n1", "build", "TASK", NodeGroup::Step);
        node.timeout_obtainments = vec![
            TimeoutObtainment { timeout_secs: 60 },
            TimeoutObtainment { timeout_secs: 10 },
        ];
        assert_eq!(node.timeout(), Some(std::time::Duration::from_secs(10)));
    }

    #[test]
    fn test_group_display() {
        assert_eq!(NodeGroup::StepGroup.to_string(), "STEP_GROUP");
        let json = serde_json::to_string(&NodeGroup::StepGroup).unwrap();
        assert_eq!(json, "\"STEP_GROUP\"");
    }
}
