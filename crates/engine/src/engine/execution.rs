//! Persisted execution records.
//!
//! `PlanExecution` and `NodeExecution` are the only mutable state of the
//! engine. Every change goes through a compare-and-swap on `version`, see
//! [`crate::engine::transition`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::advisers::{AdviserResponse, RollbackStrategy};
use crate::engine::ambiance::{Ambiance, Level};
use crate::engine::facilitator::{ExecutableResponse, ExecutionMode};
use crate::engine::failure::FailureInfo;
use crate::engine::interrupts::InterruptType;
use crate::engine::status::Status;
use crate::plan::PlanNode;

/// Who or what started an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerMetadata {
    #[serde(default = "default_triggered_by")]
    pub triggered_by: String,
    #[serde(default = "default_trigger_type")]
    pub trigger_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub inputs: serde_json::Map<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

fn default_triggered_by() -> String {
    "system".to_string()
}

fn default_trigger_type() -> String {
    "MANUAL".to_string()
}

impl Default for TriggerMetadata {
    fn default() -> Self {
        Self {
            triggered_by: default_triggered_by(),
            trigger_type: default_trigger_type(),
            payload: serde_json::Value::Null,
            inputs: serde_json::Map::new(),
            correlation_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanExecution {
    pub uuid: Uuid,
    pub plan_id: String,
    pub status: Status,
    pub start_ts: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_ts: Option<DateTime<Utc>>,
    pub metadata: TriggerMetadata,
    #[serde(default)]
    pub rolled_back: bool,
    #[serde(default)]
    pub version: u64,
}

impl PlanExecution {
    pub fn new(plan_id: &str, metadata: TriggerMetadata) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            plan_id: plan_id.to_string(),
            status: Status::Running,
            start_ts: Utc::now(),
            end_ts: None,
            metadata,
            rolled_back: false,
            version: 0,
        }
    }
}

/// Interrupt applied to a node, kept for audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterruptEffect {
    pub interrupt_id: Uuid,
    pub interrupt_type: InterruptType,
    pub applied_at: DateTime<Utc>,
}

/// Archived outcome of a previous attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptRecord {
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_ts: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_ts: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_info: Option<FailureInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executable_response: Option<ExecutableResponse>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeExecution {
    pub uuid: Uuid,
    pub plan_execution_id: Uuid,
    pub plan_node_id: String,
    /// Plan identifier plus any strategy postfix.
    pub identifier: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<Uuid>,
    /// Attempt of the parent this row belongs to.
    #[serde(default)]
    pub parent_attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_id: Option<Uuid>,
    /// Attempt of the predecessor whose advice created this row.
    #[serde(default)]
    pub previous_attempt: u32,
    pub ambiance: Ambiance,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<ExecutionMode>,
    #[serde(default)]
    pub resolved_parameters: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executable_response: Option<ExecutableResponse>,
    #[serde(default)]
    pub interrupt_history: Vec<InterruptEffect>,
    #[serde(default)]
    pub retry_attempts: Vec<AttemptRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_ts: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_ts: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_info: Option<FailureInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<serde_json::Value>,
    /// Released for execution. Strategy instances beyond the concurrency
    /// limit start out not ready.
    #[serde(default)]
    pub ready: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_before: Option<DateTime<Utc>>,
    #[serde(default)]
    pub paused: bool,
    /// The adviser chain ran for the current attempt.
    #[serde(default)]
    pub advised: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adviser_response: Option<AdviserResponse>,
    #[serde(default)]
    pub awaiting_retry: bool,
    #[serde(default)]
    pub failure_ignored: bool,
    /// Set on rollback chain nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback: Option<RollbackStrategy>,
    #[serde(default)]
    pub rolled_back: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<serde_json::Value>,
    #[serde(default)]
    pub version: u64,
    pub created_at: DateTime<Utc>,
}

impl NodeExecution {
    /// New QUEUED execution of `plan_node`, one level below `parent_ambiance`.
    pub fn queued(
        plan_node: &PlanNode,
        parent_ambiance: &Ambiance,
        identifier: String,
        strategy: Option<crate::engine::strategy::StrategyMetadata>,
    ) -> Self {
        let uuid = Uuid::new_v4();
        let level = Level {
            runtime_id: uuid,
            setup_id: plan_node.uuid.clone(),
            identifier: identifier.clone(),
            group: plan_node.group,
            strategy,
        };
        Self {
            uuid,
            plan_execution_id: parent_ambiance.plan_execution_id,
            plan_node_id: plan_node.uuid.clone(),
            identifier,
            parent_id: None,
            parent_attempt: 0,
            previous_id: None,
            previous_attempt: 0,
            ambiance: parent_ambiance.child(level),
            status: Status::Queued,
            mode: None,
            resolved_parameters: serde_json::Value::Null,
            executable_response: None,
            interrupt_history: Vec::new(),
            retry_attempts: Vec::new(),
            start_ts: None,
            end_ts: None,
            expires_at: None,
            failure_info: None,
            outputs: None,
            ready: true,
            not_before: None,
            paused: false,
            advised: false,
            adviser_response: None,
            awaiting_retry: false,
            failure_ignored: false,
            rollback: None,
            rolled_back: false,
            progress: None,
            version: 0,
            created_at: Utc::now(),
        }
    }

    /// Number of archived attempts; identifies the current attempt.
    pub fn attempt(&self) -> u32 {
        self.retry_attempts.len() as u32
    }

    /// Terminal, advised, and not waiting on a retry.
    pub fn is_concluded(&self) -> bool {
        self.status.is_terminal() && self.advised && !self.awaiting_retry
    }

    /// Whether `other` was created by the advice of this node's current attempt.
    pub fn is_followed_by(&self, other: &NodeExecution) -> bool {
        other.previous_id == Some(self.uuid) && other.previous_attempt == self.attempt()
    }

    /// QUEUED execution of `plan_node` that follows this one on the same level.
    ///
    /// The sibling inherits the parent, the parent attempt and any strategy
    /// binding of this node.
    pub fn next_sibling(&self, plan_node: &PlanNode) -> NodeExecution {
        let strategy = self
            .ambiance
            .current_level()
            .and_then(|level| level.strategy.clone());
        let postfix = strategy
            .as_ref()
            .map(|s| s.identifier_postfix.clone())
            .unwrap_or_default();
        let mut parent_ambiance = self.ambiance.clone();
        parent_ambiance.levels.pop();

        let mut next = NodeExecution::queued(
            plan_node,
            &parent_ambiance,
            format!("{}{}", plan_node.identifier, postfix),
            strategy,
        );
        next.parent_id = self.parent_id;
        next.parent_attempt = self.parent_attempt;
        next.previous_id = Some(self.uuid);
        next.previous_attempt = self.attempt();
        next
    }

    /// Archive the current attempt and reset to QUEUED.
    ///
    /// Only FAILED, ERRORED and EXPIRED attempts can be retried.
    pub fn begin_retry(&mut self, not_before: Option<DateTime<Utc>>) -> bool {
        if !self.status.is_retryable() {
            return false;
        }
        self.retry_attempts.push(AttemptRecord {
            status: self.status,
            start_ts: self.start_ts,
            end_ts: self.end_ts,
            failure_info: self.failure_info.take(),
            executable_response: self.executable_response.take(),
        });
        self.status = Status::Queued;
        self.mode = None;
        self.start_ts = None;
        self.end_ts = None;
        self.expires_at = None;
        self.outputs = None;
        self.progress = None;
        self.ready = true;
        self.not_before = not_before;
        self.advised = false;
        self.adviser_response = None;
        self.awaiting_retry = false;
        self.failure_ignored = false;
        self.rolled_back = false;
        true
    }
}
