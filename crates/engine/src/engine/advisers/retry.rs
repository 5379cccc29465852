//! RETRY: re-run a broke node a bounded number of times, then repair.

use async_trait::async_trait;

use super::rollback::advise_rollback;
use super::{
    Adviser, AdviserObtainment, AdviserResponse, AdviserType, AdvisingEvent, RepairActionCode,
    RetryAdviserParameters, RollbackStrategy,
};
use crate::engine::failure::failure_types_match;
use crate::engine::outputs::SweepingOutputService;
use crate::engine::status::Status;
use crate::error::{EngineError, EngineResult};

pub struct RetryAdviser {
    outputs: SweepingOutputService,
}

impl RetryAdviser {
    pub fn new(outputs: SweepingOutputService) -> Self {
        Self { outputs }
    }

    async fn repair(
        &self,
        event: &AdvisingEvent<'_>,
        params: &RetryAdviserParameters,
    ) -> EngineResult<AdviserResponse> {
        match params.repair_action_after_retries {
            RepairActionCode::MarkAsFailed => Ok(AdviserResponse::end_chain()),
            RepairActionCode::EndExecution => Ok(AdviserResponse::EndPlan),
            RepairActionCode::Ignore => {
                let next = params.next_node_id.as_deref().or_else(|| event.declared_next_step());
                Ok(match next {
                    Some(next_node_id) => AdviserResponse::NextStep {
                        next_node_id: next_node_id.to_string(),
                        rollback: None,
                        ignore_failure: true,
                    },
                    None => AdviserResponse::EndChain {
                        ignore_failure: true,
                    },
                })
            }
            code @ (RepairActionCode::StageRollback | RepairActionCode::StepGroupRollback) => {
                let strategy = RollbackStrategy::from_repair_action_code(code)
                    .unwrap_or(RollbackStrategy::StageRollback);
                let rollback = params.rollback.as_ref().ok_or_else(|| {
                    EngineError::InvalidPlan(format!(
                        "node '{}' retries into a rollback without rollback targets",
                        event.plan_node.identifier
                    ))
                })?;
                advise_rollback(&self.outputs, event, rollback, strategy).await
            }
        }
    }
}

#[async_trait]
impl Adviser for RetryAdviser {
    fn adviser_type(&self) -> AdviserType {
        AdviserType::Retry
    }

    fn can_advise(&self, event: &AdvisingEvent<'_>, obtainment: &AdviserObtainment) -> bool {
        let AdviserObtainment::Retry(params) = obtainment else {
            return false;
        };
        event.to_status.is_broke()
            && event.to_status != Status::Aborted
            && failure_types_match(&params.applicable_failure_types, event.failure_info)
    }

    async fn on_advise_event(
        &self,
        event: &AdvisingEvent<'_>,
        obtainment: &AdviserObtainment,
    ) -> EngineResult<AdviserResponse> {
        let AdviserObtainment::Retry(params) = obtainment else {
            return Err(EngineError::Internal(format!(
                "RETRY adviser given {} configuration",
                obtainment.adviser_type()
            )));
        };

        let attempt = event.node.attempt();
        if attempt < params.retry_count {
            let wait_secs = params
                .wait_intervals_secs
                .get(attempt as usize)
                .or_else(|| params.wait_intervals_secs.last())
                .copied()
                .unwrap_or(0);
            tracing::info!(
                node_execution_id = %event.node.uuid,
                attempt = attempt + 1,
                retry_count = params.retry_count,
                wait_secs,
                "Retrying node"
            );
            return Ok(AdviserResponse::Retry { wait_secs });
        }

        tracing::info!(
            node_execution_id = %event.node.uuid,
            repair_action = ?params.repair_action_after_retries,
            "Retries exhausted"
        );
        self.repair(event, params).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::advisers::test_support::staged_node;
    use crate::engine::advisers::{NextStepParameters, OnFailRollbackParameters};
    use crate::engine::execution::NodeExecution;
    use crate::plan::{NodeGroup, PlanNode};
    use crate::store::MemoryStore;
    use std::sync::Arc;

    fn adviser() -> RetryAdviser {
        RetryAdviser::new(SweepingOutputService::new(Arc::new(MemoryStore::new())))
    }

    fn retry(count: u32, waits: Vec<u64>, repair: RepairActionCode) -> RetryAdviserParameters {
        RetryAdviserParameters {
            retry_count: count,
            wait_intervals_secs: waits,
            applicable_failure_types: vec![],
            repair_action_after_retries: repair,
            rollback: None,
            next_node_id: None,
        }
    }

    fn with_attempts(node: &mut NodeExecution, n: u32) {
        for _ in 0..n {
            node.status = Status::Failed;
            node.begin_retry(None);
        }
        node.status = Status::Failed;
    }

    #[tokio::test]
    async fn test_wait_intervals_per_attempt() {
        let plan_node = PlanNode::new("b", "b", "TASK", NodeGroup::Step);
        let obtainment =
            AdviserObtainment::Retry(retry(3, vec![1, 5], RepairActionCode::MarkAsFailed));

        let mut node = staged_node(&plan_node, Status::Failed);
        let mut waits = Vec::new();
        for attempt in 0..3 {
            with_attempts(&mut node, if attempt == 0 { 0 } else { 1 });
            let event = AdvisingEvent::new(&node, &plan_node);
            match adviser().on_advise_event(&event, &obtainment).await.unwrap() {
                AdviserResponse::Retry { wait_secs } => waits.push(wait_secs),
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(waits, vec![1, 5, 5]);

        with_attempts(&mut node, 1);
        let event = AdvisingEvent::new(&node, &plan_node);
        let response = adviser().on_advise_event(&event, &obtainment).await.unwrap();
        assert_eq!(response, AdviserResponse::end_chain());
    }

    #[tokio::test]
    async fn test_repair_actions() {
        let mut plan_node = PlanNode::new("b", "b", "TASK", NodeGroup::Step);
        plan_node.adviser_obtainments = vec![AdviserObtainment::NextStep(NextStepParameters {
            next_node_id: "c".into(),
        })];
        let node = staged_node(&plan_node, Status::Failed);
        let event = AdvisingEvent::new(&node, &plan_node);

        let end = AdviserObtainment::Retry(retry(0, vec![], RepairActionCode::EndExecution));
        assert_eq!(adviser().on_advise_event(&event, &end).await.unwrap(), AdviserResponse::EndPlan);

        let ignore = AdviserObtainment::Retry(retry(0, vec![], RepairActionCode::Ignore));
        assert_eq!(
            adviser().on_advise_event(&event, &ignore).await.unwrap(),
            AdviserResponse::NextStep {
                next_node_id: "c".into(),
                rollback: None,
                ignore_failure: true,
            }
        );

        let mut params = retry(0, vec![], RepairActionCode::StageRollback);
        let mut rollback = OnFailRollbackParameters::default();
        rollback
            .strategy_to_uuid
            .insert(RollbackStrategy::StageRollback, "rb".into());
        params.rollback = Some(rollback);
        let response = adviser()
            .on_advise_event(&event, &AdviserObtainment::Retry(params))
            .await
            .unwrap();
        assert!(matches!(
            response,
            AdviserResponse::NextStep { rollback: Some(RollbackStrategy::StageRollback), .. }
        ));

        let missing = AdviserObtainment::Retry(retry(0, vec![], RepairActionCode::StepGroupRollback));
        assert!(adviser().on_advise_event(&event, &missing).await.is_err());
    }

    #[test]
    fn test_aborted_is_not_retried() {
        let plan_node = PlanNode::new("b", "b", "TASK", NodeGroup::Step);
        let node = staged_node(&plan_node, Status::Aborted);
        let obtainment = AdviserObtainment::Retry(retry(3, vec![], RepairActionCode::MarkAsFailed));
        assert!(!adviser().can_advise(&AdvisingEvent::new(&node, &plan_node), &obtainment));
    }
}
