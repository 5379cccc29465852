use async_trait::async_trait;

use super::{Adviser, AdviserObtainment, AdviserResponse, AdviserType, AdvisingEvent};
use crate::engine::failure::failure_types_match;
use crate::error::EngineResult;

/// Turns a local failure into an abort of the whole execution.
pub struct OnFailAbortAdviser;

#[async_trait]
impl Adviser for OnFailAbortAdviser {
    fn adviser_type(&self) -> AdviserType {
        AdviserType::OnFailAbort
    }

    fn can_advise(&self, event: &AdvisingEvent<'_>, obtainment: &AdviserObtainment) -> bool {
        let AdviserObtainment::OnFailAbort(params) = obtainment else {
            return false;
        };
        event.to_status.is_broke()
            && failure_types_match(&params.applicable_failure_types, event.failure_info)
    }

    async fn on_advise_event(
        &self,
        event: &AdvisingEvent<'_>,
        _obtainment: &AdviserObtainment,
    ) -> EngineResult<AdviserResponse> {
        tracing::warn!(
            plan_execution_id = %event.node.plan_execution_id,
            node_execution_id = %event.node.uuid,
            "Failure aborts the plan execution"
        );
        Ok(AdviserResponse::EndPlan)
    }
}
