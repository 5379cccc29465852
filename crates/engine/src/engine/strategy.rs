//! Looping and matrix expansion.
//!
//! A node with a strategy runs its first child once per combination. The
//! expander produces the ordered child specs; the orchestrator creates the
//! rows and releases at most `max_concurrency` of them at a time.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::plan::PlanNode;
use crate::template::TemplateRenderer;

/// Strategy configuration attached to a plan node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StrategyConfig {
    #[serde(rename_all = "camelCase")]
    Matrix {
        axes: Vec<MatrixAxis>,
        /// Combinations to drop; each entry matches on every key it names.
        #[serde(default)]
        exclude: Vec<serde_json::Map<String, serde_json::Value>>,
        #[serde(default)]
        max_concurrency: Option<usize>,
    },
    #[serde(rename_all = "camelCase")]
    Repeat {
        #[serde(default)]
        times: Option<usize>,
        /// Literal list, or a template evaluating to one.
        #[serde(default)]
        items: Option<serde_json::Value>,
        #[serde(default)]
        max_concurrency: Option<usize>,
    },
    #[serde(rename_all = "camelCase")]
    Parallelism {
        count: usize,
        #[serde(default)]
        max_concurrency: Option<usize>,
    },
    #[serde(other)]
    Unsupported,
}

impl StrategyConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            StrategyConfig::Matrix { .. } => "MATRIX",
            StrategyConfig::Repeat { .. } => "REPEAT",
            StrategyConfig::Parallelism { .. } => "PARALLELISM",
            StrategyConfig::Unsupported => "UNSUPPORTED",
        }
    }

    /// Instances allowed to run at once; 0 means unbounded.
    pub fn max_concurrency(&self) -> usize {
        match self {
            StrategyConfig::Matrix { max_concurrency, .. }
            | StrategyConfig::Repeat { max_concurrency, .. }
            | StrategyConfig::Parallelism { max_concurrency, .. } => max_concurrency.unwrap_or(0),
            StrategyConfig::Unsupported => 0,
        }
    }
}

/// One matrix dimension. `values` is a list or a template evaluating to one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatrixAxis {
    pub name: String,
    pub values: serde_json::Value,
}

/// Per-instance strategy information stored on the ambiance level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyMetadata {
    pub iteration: usize,
    pub total: usize,
    #[serde(default)]
    pub values: serde_json::Map<String, serde_json::Value>,
    pub identifier_postfix: String,
}

/// One child execution to create.
#[derive(Debug, Clone, PartialEq)]
pub struct ChildSpec {
    pub plan_node_id: String,
    pub strategy: Option<StrategyMetadata>,
}

/// Result of expanding a node.
#[derive(Debug, Clone, PartialEq)]
pub struct Expansion {
    pub children: Vec<ChildSpec>,
    /// 0 means unbounded.
    pub max_concurrency: usize,
}

#[derive(Default)]
pub struct StrategyExpander {
    renderer: TemplateRenderer,
}

impl StrategyExpander {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expand `node` under `config`. `context` resolves templated axis values.
    pub fn expand(
        &self,
        node: &PlanNode,
        config: &StrategyConfig,
        context: &serde_json::Value,
    ) -> EngineResult<Expansion> {
        let child = node.children.first().ok_or_else(|| {
            EngineError::InvalidPlan(format!("strategy node {} has no child", node.uuid))
        })?;

        let (combinations, max_concurrency) = match config {
            StrategyConfig::Matrix {
                axes,
                exclude,
                max_concurrency,
            } => {
                let mut resolved = Vec::with_capacity(axes.len());
                for axis in axes {
                    resolved.push((axis.name.clone(), self.resolve_list(&axis.values, context)?));
                }
                let combos = cartesian(&resolved)
                    .into_iter()
                    .filter(|combo| !exclude.iter().any(|ex| matches_exclusion(combo, ex)))
                    .collect::<Vec<_>>();
                (combos, *max_concurrency)
            }
            StrategyConfig::Repeat {
                times,
                items,
                max_concurrency,
            } => {
                let combos = match (items, times) {
                    (Some(items), _) => self
                        .resolve_list(items, context)?
                        .into_iter()
                        .map(|item| vec![("item".to_string(), item)])
                        .collect(),
                    (None, Some(times)) => vec![Vec::new(); *times],
                    (None, None) => {
                        return Err(EngineError::InvalidPlan(format!(
                            "repeat strategy on {} needs times or items",
                            node.uuid
                        )))
                    }
                };
                (combos, *max_concurrency)
            }
            StrategyConfig::Parallelism {
                count,
                max_concurrency,
            } => (vec![Vec::new(); *count], *max_concurrency),
            StrategyConfig::Unsupported => {
                return Err(EngineError::StrategyNotSupported(format!(
                    "node {} declares an unknown strategy type",
                    node.uuid
                )))
            }
        };

        let total = combinations.len();
        let mut postfixes = Postfixes::default();
        let children = combinations
            .into_iter()
            .enumerate()
            .map(|(iteration, values)| {
                let identifier_postfix = postfixes.next(iteration, &values);
                ChildSpec {
                    plan_node_id: child.clone(),
                    strategy: Some(StrategyMetadata {
                        iteration,
                        total,
                        values: values.into_iter().collect(),
                        identifier_postfix,
                    }),
                }
            })
            .collect();

        Ok(Expansion {
            children,
            max_concurrency: max_concurrency.unwrap_or(0),
        })
    }

    fn resolve_list(
        &self,
        raw: &serde_json::Value,
        context: &serde_json::Value,
    ) -> EngineResult<Vec<serde_json::Value>> {
        let value = match raw {
            serde_json::Value::String(template) => {
                self.renderer.render_to_value(template, context)?
            }
            other => other.clone(),
        };
        match value {
            serde_json::Value::Array(items) => Ok(items),
            serde_json::Value::Null => Ok(Vec::new()),
            other => Err(EngineError::InvalidPlan(format!(
                "strategy values must be a list, got {}",
                other
            ))),
        }
    }
}

/// Axis-ordered values of one combination.
type Combination = Vec<(String, serde_json::Value)>;

/// Cartesian product, first axis varying slowest.
fn cartesian(axes: &[(String, Vec<serde_json::Value>)]) -> Vec<Combination> {
    let mut combos: Vec<Combination> = vec![Vec::new()];
    for (name, values) in axes {
        let mut next = Vec::with_capacity(combos.len() * values.len());
        for combo in &combos {
            for value in values {
                let mut extended = combo.clone();
                extended.push((name.clone(), value.clone()));
                next.push(extended);
            }
        }
        combos = next;
    }
    combos
}

fn matches_exclusion(
    combo: &Combination,
    exclusion: &serde_json::Map<String, serde_json::Value>,
) -> bool {
    !exclusion.is_empty()
        && exclusion
            .iter()
            .all(|(k, v)| combo.iter().any(|(name, value)| name == k && value == v))
}

/// Identifier postfixes: `_<values>` when every value is scalar, `_<index>`
/// otherwise, with a counter appended on collisions.
#[derive(Default)]
struct Postfixes {
    seen: std::collections::HashMap<String, usize>,
}

impl Postfixes {
    fn next(&mut self, index: usize, values: &Combination) -> String {
        let scalars: Option<Vec<String>> = values
            .iter()
            .map(|(_, v)| match v {
                serde_json::Value::String(s) => Some(s.clone()),
                serde_json::Value::Number(n) => Some(n.to_string()),
                serde_json::Value::Bool(b) => Some(b.to_string()),
                _ => None,
            })
            .collect();
        let base = match scalars {
            Some(parts) if !parts.is_empty() => format!("_{}", parts.join("_")),
            _ => format!("_{}", index),
        };
        let count = self.seen.entry(base.clone()).or_insert(0);
        *count += 1;
        if *count == 1 {
            base
        } else {
            format!("{}_{}", base, *count - 1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::NodeGroup;
    use serde_json::json;

    fn strategy_node() -> PlanNode {
        PlanNode {
            children: vec!["deploy".to_string()],
            ..PlanNode::new("strategy", "deploy_matrix", "STRATEGY", NodeGroup::Strategy)
        }
    }

    fn matrix(value: serde_json::Value) -> StrategyConfig {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_matrix_first_axis_slowest() {
        let config = matrix(json!({
            "type": "MATRIX",
            "axes": [
                {"name": "os", "values": ["linux", "mac"]},
                {"name": "arch", "values": ["x64", "arm"]}
            ],
            "maxConcurrency": 2
        }));
        let expansion = StrategyExpander::new()
            .expand(&strategy_node(), &config, &json!({}))
            .unwrap();

        assert_eq!(expansion.max_concurrency, 2);
        let postfixes: Vec<_> = expansion
            .children
            .iter()
            .map(|c| c.strategy.as_ref().unwrap().identifier_postfix.clone())
            .collect();
        assert_eq!(postfixes, vec!["_linux_x64", "_linux_arm", "_mac_x64", "_mac_arm"]);
        assert!(expansion.children.iter().all(|c| c.plan_node_id == "deploy"));
        assert_eq!(expansion.children[3].strategy.as_ref().unwrap().total, 4);
    }

    #[test]
    fn test_matrix_exclude_and_template_values() {
        let config = matrix(json!({
            "type": "MATRIX",
            "axes": [
                {"name": "region", "values": "{{ inputs.regions }}"},
                {"name": "tier", "values": [1, 2]}
            ],
            "exclude": [{"region": "eu", "tier": 2}]
        }));
        let ctx = json!({"inputs": {"regions": ["us", "eu"]}});
        let expansion = StrategyExpander::new()
            .expand(&strategy_node(), &config, &ctx)
            .unwrap();
        assert_eq!(expansion.children.len(), 3);
        assert_eq!(expansion.max_concurrency, 0);
    }

    #[test]
    fn test_non_scalar_values_use_index_and_dedupe() {
        let config = matrix(json!({
            "type": "MATRIX",
            "axes": [{"name": "cfg", "values": [{"a": 1}, {"a": 2}]}]
        }));
        let expansion = StrategyExpander::new()
            .expand(&strategy_node(), &config, &json!({}))
            .unwrap();
        let first = expansion.children[0].strategy.as_ref().unwrap();
        assert_eq!(first.identifier_postfix, "_0");

        let mut postfixes = Postfixes::default();
        let values = vec![("v".to_string(), json!("x"))];
        assert_eq!(postfixes.next(0, &values), "_x");
        assert_eq!(postfixes.next(1, &values), "_x_1");
    }

    #[test]
    fn test_repeat_items_and_parallelism() {
        let repeat = matrix(json!({"type": "REPEAT", "items": ["a", "b", "c"]}));
        let expansion = StrategyExpander::new()
            .expand(&strategy_node(), &repeat, &json!({}))
            .unwrap();
        assert_eq!(expansion.children.len(), 3);
        assert_eq!(expansion.children[1].strategy.as_ref().unwrap().values["item"], "b");

        let parallel = matrix(json!({"type": "PARALLELISM", "count": 2, "maxConcurrency": 1}));
        let expansion = StrategyExpander::new()
            .expand(&strategy_node(), &parallel, &json!({}))
            .unwrap();
        assert_eq!(expansion.children.len(), 2);
        assert_eq!(expansion.children[1].strategy.as_ref().unwrap().identifier_postfix, "_1");
    }

    #[test]
    fn test_unsupported_strategy_fails_fast() {
        let config = matrix(json!({"type": "FOR_EACH_CLUSTER"}));
        assert_eq!(config, StrategyConfig::Unsupported);
        let result = StrategyExpander::new().expand(&strategy_node(), &config, &json!({}));
        assert!(matches!(result, Err(EngineError::StrategyNotSupported(_))));
    }

    #[test]
    fn test_empty_matrix_yields_no_children() {
        let config = matrix(json!({
            "type": "MATRIX",
            "axes": [{"name": "region", "values": []}]
        }));
        let expansion = StrategyExpander::new()
            .expand(&strategy_node(), &config, &json!({}))
            .unwrap();
        assert!(expansion.children.is_empty());
    }
}
