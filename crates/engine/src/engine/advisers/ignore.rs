use async_trait::async_trait;

use super::{Adviser, AdviserObtainment, AdviserResponse, AdviserType, AdvisingEvent};
use crate::engine::failure::failure_types_match;
use crate::engine::status::Status;
use crate::error::{EngineError, EngineResult};

/// Treats matching failures as ignored and carries on.
///
/// Proceeds to its own `nextNodeId`, else to the node's NEXT_STEP target,
/// else ends the chain with the failure ignored.
pub struct OnFailIgnoreAdviser;

#[async_trait]
impl Adviser for OnFailIgnoreAdviser {
    fn adviser_type(&self) -> AdviserType {
        AdviserType::OnFailIgnore
    }

    fn can_advise(&self, event: &AdvisingEvent<'_>, obtainment: &AdviserObtainment) -> bool {
        let AdviserObtainment::OnFailIgnore(params) = obtainment else {
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
        let AdviserObtainment::OnFailIgnore(params) = obtainment else {
            return Err(EngineError::Internal(format!(
                "ON_FAIL_IGNORE adviser given {} configuration",
                obtainment.adviser_type()
            )));
        };
        tracing::info!(
            node_execution_id = %event.node.uuid,
            status = %event.to_status,
            "Ignoring failure"
        );
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
}
