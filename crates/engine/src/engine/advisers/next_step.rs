use async_trait::async_trait;

use super::{Adviser, AdviserObtainment, AdviserResponse, AdviserType, AdvisingEvent};
use crate::error::{EngineError, EngineResult};

/// Proceeds to the configured sibling when the node did not break.
pub struct NextStepAdviser;

#[async_trait]
impl Adviser for NextStepAdviser {
    fn adviser_type(&self) -> AdviserType {
        AdviserType::NextStep
    }

    fn can_advise(&self, event: &AdvisingEvent<'_>, _obtainment: &AdviserObtainment) -> bool {
        !event.to_status.is_broke() || event.node.failure_ignored
    }

    async fn on_advise_event(
        &self,
        event: &AdvisingEvent<'_>,
        obtainment: &AdviserObtainment,
    ) -> EngineResult<AdviserResponse> {
        let AdviserObtainment::NextStep(params) = obtainment else {
            return Err(EngineError::Internal(format!(
                "NEXT_STEP adviser given {} configuration",
                obtainment.adviser_type()
            )));
        };
        Ok(AdviserResponse::NextStep {
            next_node_id: params.next_node_id.clone(),
            // A rollback chain stays a rollback chain.
            rollback: event.node.rollback,
            ignore_failure: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::advisers::test_support::staged_node;
    use crate::engine::advisers::{NextStepParameters, RollbackStrategy};
    use crate::engine::status::Status;
    use crate::plan::{NodeGroup, PlanNode};

    fn obtainment() -> AdviserObtainment {
        AdviserObtainment::NextStep(NextStepParameters {
            next_node_id: "next".into(),
        })
    }

    #[test]
    fn test_only_non_broke_statuses() {
        let plan_node = PlanNode::new("a", "a", "NOOP", NodeGroup::Step);
        for (status, expected) in [
            (Status::Succeeded, true),
            (Status::Skipped, true),
            (Status::Failed, false),
            (Status::Expired, false),
            (Status::Aborted, false),
        ] {
            let node = staged_node(&plan_node, status);
            let event = AdvisingEvent::new(&node, &plan_node);
            assert_eq!(NextStepAdviser.can_advise(&event, &obtainment()), expected, "{}", status);
        }
    }

    #[tokio::test]
    async fn test_rollback_marker_carries_over() {
        let plan_node = PlanNode::new("r1", "r1", "NOOP", NodeGroup::Step);
        let mut node = staged_node(&plan_node, Status::Succeeded);
        node.rollback = Some(RollbackStrategy::StageRollback);
        let event = AdvisingEvent::new(&node, &plan_node);
        let response = NextStepAdviser.on_advise_event(&event, &obtainment()).await.unwrap();
        assert_eq!(
            response,
            AdviserResponse::NextStep {
                next_node_id: "next".into(),
                rollback: Some(RollbackStrategy::StageRollback),
                ignore_failure: false,
            }
        );
    }
}
