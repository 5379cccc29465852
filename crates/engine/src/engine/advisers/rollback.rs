//! ON_FAIL_ROLLBACK: divert a broke node into its rollback chain.

use async_trait::async_trait;

use super::{
    Adviser, AdviserObtainment, AdviserResponse, AdviserType, AdvisingEvent,
    OnFailRollbackParameters, RollbackStrategy,
};
use crate::engine::failure::failure_types_match;
use crate::engine::outputs::SweepingOutputService;
use crate::error::{EngineError, EngineResult};
use crate::plan::NodeGroup;

/// Sweeping output recording which rollback strategy is in effect.
pub const USE_ROLLBACK_STRATEGY: &str = "useRollbackStrategy";

pub struct OnFailRollbackAdviser {
    outputs: SweepingOutputService,
}

impl OnFailRollbackAdviser {
    pub fn new(outputs: SweepingOutputService) -> Self {
        Self { outputs }
    }
}

#[async_trait]
impl Adviser for OnFailRollbackAdviser {
    fn adviser_type(&self) -> AdviserType {
        AdviserType::OnFailRollback
    }

    fn can_advise(&self, event: &AdvisingEvent<'_>, obtainment: &AdviserObtainment) -> bool {
        let AdviserObtainment::OnFailRollback(params) = obtainment else {
            return false;
        };
        event.to_status.is_broke()
            && failure_types_match(&params.applicable_failure_types, event.failure_info)
    }

    async fn on_advise_event(
        &self,
        event: &AdvisingEvent<'_>,
        obtainment: &AdviserObtainment,
    ) -> EngineResult<AdviserResponse> {
        let AdviserObtainment::OnFailRollback(params) = obtainment else {
            return Err(EngineError::Internal(format!(
                "ON_FAIL_ROLLBACK adviser given {} configuration",
                obtainment.adviser_type()
            )));
        };
        let strategy = match &params.strategy {
            None => RollbackStrategy::StageRollback,
            Some(name) => RollbackStrategy::from_yaml_name(name).ok_or_else(|| {
                EngineError::InvalidPlan(format!("unknown rollback strategy '{}'", name))
            })?,
        };
        advise_rollback(&self.outputs, event, params, strategy).await
    }
}

/// Resolve `strategy` to its entry node and record the choice.
pub(crate) async fn advise_rollback(
    outputs: &SweepingOutputService,
    event: &AdvisingEvent<'_>,
    params: &OnFailRollbackParameters,
    strategy: RollbackStrategy,
) -> EngineResult<AdviserResponse> {
    let target = params.strategy_to_uuid.get(&strategy).ok_or_else(|| {
        EngineError::InvalidPlan(format!(
            "node '{}' has no {} rollback target",
            event.plan_node.identifier,
            strategy.yaml_name()
        ))
    })?;

    let group = match strategy {
        RollbackStrategy::StepGroupRollback => NodeGroup::StepGroup,
        _ => NodeGroup::Stage,
    };
    let value = serde_json::json!(strategy);
    let ambiance = &event.node.ambiance;
    let written = match outputs
        .consume(ambiance, USE_ROLLBACK_STRATEGY, value.clone(), Some(group))
        .await
    {
        Err(EngineError::InvalidRequest(_)) => {
            outputs.consume(ambiance, USE_ROLLBACK_STRATEGY, value, None).await
        }
        other => other,
    };
    match written {
        Ok(()) | Err(EngineError::AlreadyExists(_)) => {}
        Err(e) => return Err(e),
    }

    tracing::info!(
        node_execution_id = %event.node.uuid,
        strategy = strategy.yaml_name(),
        target = %target,
        "Rolling back"
    );
    Ok(AdviserResponse::NextStep {
        next_node_id: target.clone(),
        rollback: Some(strategy),
        ignore_failure: false,
    })
}
