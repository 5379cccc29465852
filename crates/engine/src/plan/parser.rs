//! Plan parsing and structural validation.
//!
//! Plans arrive as JSON or YAML documents produced by the plan compiler.
//! Validation runs before any execution row is created; a failure is an
//! input error reported to the caller.

use std::collections::HashSet;

use crate::error::{EngineError, EngineResult};
use crate::plan::types::Plan;

/// Parse a JSON or YAML document into a validated plan.
pub fn parse_plan(content: &str) -> EngineResult<Plan> {
    let trimmed = content.trim_start();
    let plan: Plan = if trimmed.starts_with('{') {
        serde_json::from_str(content).map_err(|e| EngineError::InvalidPlan(e.to_string()))?
    } else {
        serde_yaml::from_str(content)?
    };

    validate_plan(&plan)?;

    Ok(plan)
}

/// Validate node ids, the start node, and every node reference.
pub fn validate_plan(plan: &Plan) -> EngineResult<()> {
    if plan.uuid.trim().is_empty() {
        return Err(EngineError::InvalidPlan("Plan uuid must not be empty".to_string()));
    }

    if plan.nodes.is_empty() {
        return Err(EngineError::InvalidPlan("Plan has no nodes".to_string()));
    }

    let mut seen = HashSet::new();
    for node in &plan.nodes {
        if !seen.insert(node.uuid.as_str()) {
            return Err(EngineError::InvalidPlan(format!(
                "Duplicate node id: {}",
                node.uuid
            )));
        }
    }

    if !seen.contains(plan.start_node_id.as_str()) {
        return Err(EngineError::InvalidPlan(format!(
            "Start node '{}' does not exist",
            plan.start_node_id
        )));
    }

    for node in &plan.nodes {
        for child in &node.children {
            if !seen.contains(child.as_str()) {
                return Err(EngineError::InvalidPlan(format!(
                    "Node '{}': child '{}' does not exist",
                    node.identifier, child
                )));
            }
            if child == &node.uuid {
                return Err(EngineError::InvalidPlan(format!(
                    "Node '{}' lists itself as a child",
                    node.identifier
                )));
            }
        }

        for obtainment in &node.adviser_obtainments {
            for target in obtainment.referenced_nodes() {
                if !seen.contains(target) {
                    return Err(EngineError::InvalidPlan(format!(
                        "Node '{}': {} adviser references unknown node '{}'",
                        node.identifier,
                        obtainment.adviser_type(),
                        target
                    )));
                }
            }
        }

        if node.strategy.is_some() && node.children.is_empty() {
            return Err(EngineError::InvalidPlan(format!(
                "Node '{}': strategy requires a child node to expand",
                node.identifier
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_YAML: &str = r#"
uuid: plan-1
name: deploy-service
startNodeId: pipeline
nodes:
  - uuid: pipeline
    identifier: pipeline
    stepType: PIPELINE
    group: PIPELINE
    children: [stage]
  - uuid: stage
    identifier: deploy
    stepType: STAGE
    group: STAGE
    children: [build]
  - uuid: build
    identifier: build
    stepType: TASK
    group: STEP
    stepParameters:
      image: "svc:{{ trigger.tag }}"
    adviserObtainments:
      - type: NEXT_STEP
        nextNodeId: verify
  - uuid: verify
    identifier: verify
    stepType: NOOP
    group: STEP
"#;

    #[test]
    fn test_parse_yaml_plan() {
        let plan = parse_plan(SAMPLE_YAML).unwrap();
        assert_eq!(plan.uuid, "plan-1");
        assert_eq!(plan.nodes.len(), 4);
        assert_eq!(plan.start_node().unwrap().identifier, "pipeline");
        assert_eq!(plan.node("build").unwrap().adviser_obtainments.len(), 1);
    }

    #[test]
    fn test_parse_json_plan() {
        let json = r#"{"uuid":"p","startNodeId":"a","nodes":[{"uuid":"a","identifier":"a","stepType":"NOOP","group":"STEP"}]}"#;
        let plan = parse_plan(json).unwrap();
        assert_eq!(plan.start_node_id, "a");
    }

    #[test]
    fn test_missing_start_node() {
        let yaml = SAMPLE_YAML.replace("startNodeId: pipeline", "startNodeId: nope");
        let err = parse_plan(&yaml).unwrap_err();
        assert!(err.to_string().contains("Start node 'nope'"));
    }

    #[test]
    fn test_duplicate_node_id() {
        let yaml = SAMPLE_YAML.replace("uuid: verify", "uuid: build");
        let err = parse_plan(&yaml).unwrap_err();
        assert!(err.to_string().contains("Duplicate node id"));
    }

    #[test]
    fn test_unknown_adviser_target() {
        let yaml = SAMPLE_YAML.replace("nextNodeId: verify", "nextNodeId: ghost");
        let err = parse_plan(&yaml).unwrap_err();
        assert!(matches!(err, EngineError::InvalidPlan(_)));
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_unknown_child() {
        let yaml = SAMPLE_YAML.replace("children: [build]", "children: [missing]");
        assert!(parse_plan(&yaml).is_err());
    }
}
