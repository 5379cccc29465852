//! Template context for conditions and step parameters.

use serde_json::json;

use crate::engine::execution::{NodeExecution, TriggerMetadata};
use crate::error::EngineResult;
use crate::plan::PlanNode;
use crate::template::TemplateRenderer;

#[derive(Default)]
pub struct ConditionEvaluator {
    renderer: TemplateRenderer,
}

impl ConditionEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Variables visible to templates rendered for `node`.
    ///
    /// `trigger` is the trigger payload, `inputs` the merged input set,
    /// `matrix` the strategy values bound along the ambiance and `strategy`
    /// the innermost iteration.
    pub fn context(metadata: &TriggerMetadata, node: &NodeExecution) -> serde_json::Value {
        let strategy = node
            .ambiance
            .strategy()
            .map(|s| json!({ "iteration": s.iteration, "total": s.total }))
            .unwrap_or(serde_json::Value::Null);
        json!({
            "trigger": metadata.payload,
            "inputs": metadata.inputs,
            "matrix": node.ambiance.strategy_values(),
            "strategy": strategy,
            "node": {
                "identifier": node.identifier,
                "attempt": node.attempt(),
            },
        })
    }

    /// Whether the node is skipped: the skip condition holds or the when condition does not.
    pub fn should_skip(&self, plan_node: &PlanNode, context: &serde_json::Value) -> EngineResult<bool> {
        if let Some(skip) = &plan_node.skip_condition {
            if self.renderer.evaluate_condition(skip, context)? {
                return Ok(true);
            }
        }
        if let Some(when) = &plan_node.when_condition {
            if !self.renderer.evaluate_condition(when, context)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn render_parameters(
        &self,
        plan_node: &PlanNode,
        context: &serde_json::Value,
    ) -> EngineResult<serde_json::Value> {
        self.renderer.render_value(&plan_node.step_parameters, context)
    }

    pub fn renderer(&self) -> &TemplateRenderer {
        &self.renderer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ambiance::Ambiance;
    use crate::engine::strategy::StrategyMetadata;
    use crate::plan::NodeGroup;
    use uuid::Uuid;

    fn matrix_node(region: &str) -> (PlanNode, NodeExecution) {
        let mut plan_node = PlanNode::new("d", "deploy", "TASK", NodeGroup::Step);
        plan_node.step_parameters = json!({"target": "{{ matrix.region }}", "n": "{{ strategy.iteration }}"});
        let mut values = serde_json::Map::new();
        values.insert("region".into(), json!(region));
        let node = NodeExecution::queued(
            &plan_node,
            &Ambiance::root(Uuid::new_v4(), "plan", "MANUAL"),
            format!("deploy_{}", region),
            Some(StrategyMetadata {
                iteration: 1,
                total: 2,
                values,
                identifier_postfix: format!("_{}", region),
            }),
        );
        (plan_node, node)
    }

    #[test]
    fn test_render_with_matrix_values() {
        let evaluator = ConditionEvaluator::new();
        let (plan_node, node) = matrix_node("eu");
        let ctx = ConditionEvaluator::context(&TriggerMetadata::default(), &node);
        let params = evaluator.render_parameters(&plan_node, &ctx).unwrap();
        assert_eq!(params["target"], "eu");
        assert_eq!(params["n"], 1);
    }

    #[test]
    fn test_skip_and_when_conditions() {
        let evaluator = ConditionEvaluator::new();
        let (mut plan_node, node) = matrix_node("us");
        let mut meta = TriggerMetadata::default();
        meta.inputs.insert("env".into(), json!("prod"));
        let ctx = ConditionEvaluator::context(&meta, &node);

        assert!(!evaluator.should_skip(&plan_node, &ctx).unwrap());

        plan_node.skip_condition = Some("matrix.region == 'us'".into());
        assert!(evaluator.should_skip(&plan_node, &ctx).unwrap());

        plan_node.skip_condition = None;
        plan_node.when_condition = Some("{{ inputs.env == 'staging' }}".into());
        assert!(evaluator.should_skip(&plan_node, &ctx).unwrap());

        plan_node.when_condition = Some("inputs.env == 'prod'".into());
        assert!(!evaluator.should_skip(&plan_node, &ctx).unwrap());
    }
}
