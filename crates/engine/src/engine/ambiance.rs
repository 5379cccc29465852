//! Execution context carried by every node execution.
//!
//! An ambiance is the path from the plan execution down to one node
//! execution. Each level records the runtime id (node execution id) and the
//! plan node it was created from. Scope keys for sweeping outputs are built
//! from runtime id prefixes, so a value written at some level is visible to
//! every descendant of that level.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::strategy::StrategyMetadata;
use crate::plan::NodeGroup;

/// One level of the execution path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Level {
    /// Node execution id at this level.
    pub runtime_id: Uuid,
    /// Plan node id this level was created from.
    pub setup_id: String,
    pub identifier: String,
    pub group: NodeGroup,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<StrategyMetadata>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ambiance {
    pub plan_execution_id: Uuid,
    pub plan_id: String,
    #[serde(default)]
    pub levels: Vec<Level>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub trigger_type: String,
}

impl Ambiance {
    pub fn root(plan_execution_id: Uuid, plan_id: &str, trigger_type: &str) -> Self {
        Self {
            plan_execution_id,
            plan_id: plan_id.to_string(),
            levels: Vec::new(),
            correlation_id: None,
            trigger_type: trigger_type.to_string(),
        }
    }

    /// Context for a node one level below the current one.
    pub fn child(&self, level: Level) -> Self {
        let mut next = self.clone();
        next.levels.push(level);
        next
    }

    /// Context for a node on the same level, replacing the last level.
    pub fn sibling(&self, level: Level) -> Self {
        let mut next = self.clone();
        next.levels.pop();
        next.levels.push(level);
        next
    }

    pub fn current_level(&self) -> Option<&Level> {
        self.levels.last()
    }

    pub fn depth(&self) -> usize {
        self.levels.len()
    }

    /// Scope key of the first `depth` levels. Depth 0 is the plan execution scope.
    pub fn scope_key_at(&self, depth: usize) -> String {
        self.levels
            .iter()
            .take(depth)
            .map(|l| l.runtime_id.to_string())
            .collect::<Vec<_>>()
            .join("/")
    }

    /// Scope key of the full path, ending at the current node.
    pub fn scope_key(&self) -> String {
        self.scope_key_at(self.levels.len())
    }

    /// Scope of the node's enclosing level (shared with its siblings).
    pub fn enclosing_scope_key(&self) -> String {
        self.scope_key_at(self.levels.len().saturating_sub(1))
    }

    /// Scope of the nearest level of `group`, or `None` if no level matches.
    pub fn scope_key_for_group(&self, group: NodeGroup) -> Option<String> {
        self.levels
            .iter()
            .rposition(|l| l.group == group)
            .map(|idx| self.scope_key_at(idx + 1))
    }

    /// Candidate scope keys from the full path up to the plan execution scope.
    pub fn scope_chain(&self) -> Vec<String> {
        (0..=self.levels.len())
            .rev()
            .map(|depth| self.scope_key_at(depth))
            .collect()
    }

    /// Strategy values bound along the path; inner levels win.
    pub fn strategy_values(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut values = serde_json::Map::new();
        for meta in self.levels.iter().filter_map(|l| l.strategy.as_ref()) {
            for (k, v) in &meta.values {
                values.insert(k.clone(), v.clone());
            }
        }
        values
    }

    /// Innermost strategy metadata on the path.
    pub fn strategy(&self) -> Option<&StrategyMetadata> {
        self.levels.iter().rev().find_map(|l| l.strategy.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn level(group: NodeGroup, identifier: &str) -> Level {
        Level {
            runtime_id: Uuid::new_v4(),
            setup_id: format!("{}-setup", identifier),
            identifier: identifier.to_string(),
            group,
            strategy: None,
        }
    }

    #[test]
    fn test_child_and_sibling_levels() {
        let root = Ambiance::root(Uuid::new_v4(), "plan", "MANUAL");
        let pipeline = root.child(level(NodeGroup::Pipeline, "pipeline"));
        let stage = pipeline.child(level(NodeGroup::Stage, "deploy"));
        let step_a = stage.child(level(NodeGroup::Step, "a"));
        let step_b = step_a.sibling(level(NodeGroup::Step, "b"));

        assert_eq!(step_a.depth(), 3);
        assert_eq!(step_b.depth(), 3);
        assert_eq!(step_b.current_level().unwrap().identifier, "b");
        assert_eq!(step_a.enclosing_scope_key(), step_b.enclosing_scope_key());
        assert_ne!(step_a.scope_key(), step_b.scope_key());
    }

    #[test]
    fn test_scope_for_group() {
        let root = Ambiance::root(Uuid::new_v4(), "plan", "MANUAL");
        let stage = root
            .child(level(NodeGroup::Pipeline, "pipeline"))
            .child(level(NodeGroup::Stage, "deploy"));
        let step = stage.child(level(NodeGroup::Step, "a"));

        assert_eq!(step.scope_key_for_group(NodeGroup::Stage), Some(stage.scope_key()));
        assert_eq!(step.scope_key_for_group(NodeGroup::StepGroup), None);
    }

    #[test]
    fn test_scope_chain_walks_to_root() {
        let root = Ambiance::root(Uuid::new_v4(), "plan", "MANUAL");
        let step = root
            .child(level(NodeGroup::Stage, "s"))
            .child(level(NodeGroup::Step, "a"));
        let chain = step.scope_chain();
        assert_eq!(chain.len(), 3);
        assert_eq!(chain[0], step.scope_key());
        assert_eq!(chain[2], "");
    }
}
