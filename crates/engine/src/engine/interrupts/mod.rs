//! Externally injected control signals.
//!
//! Registering an interrupt only enqueues it; the [`processor`] consumes
//! REGISTERED interrupts in creation order per target and forces the
//! corresponding transition, bypassing normal advising.

pub mod processor;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};

pub use processor::InterruptConsumer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InterruptType {
    AbortAll,
    Abort,
    PauseAll,
    Pause,
    ResumeAll,
    Resume,
    Retry,
    MarkExpired,
    MarkFailed,
}

impl InterruptType {
    /// Whether the interrupt targets the whole plan execution.
    pub fn is_plan_scoped(self) -> bool {
        matches!(
            self,
            InterruptType::AbortAll | InterruptType::PauseAll | InterruptType::ResumeAll
        )
    }
}

impl std::fmt::Display for InterruptType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::AbortAll => "ABORT_ALL",
            Self::Abort => "ABORT",
            Self::PauseAll => "PAUSE_ALL",
            Self::Pause => "PAUSE",
            Self::ResumeAll => "RESUME_ALL",
            Self::Resume => "RESUME",
            Self::Retry => "RETRY",
            Self::MarkExpired => "MARK_EXPIRED",
            Self::MarkFailed => "MARK_FAILED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InterruptState {
    Registered,
    Processing,
    ProcessedSuccessfully,
    ProcessedUnsuccessfully,
}

impl InterruptState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Registered => "REGISTERED",
            Self::Processing => "PROCESSING",
            Self::ProcessedSuccessfully => "PROCESSED_SUCCESSFULLY",
            Self::ProcessedUnsuccessfully => "PROCESSED_UNSUCCESSFULLY",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IssuedBy {
    User,
    Adviser,
    Timeout,
    System,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterruptConfig {
    pub issued_by: IssuedBy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuer_id: Option<String>,
    /// Delay before a RETRY restarts the node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Interrupt {
    pub uuid: Uuid,
    #[serde(rename = "type")]
    pub interrupt_type: InterruptType,
    pub plan_execution_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_execution_id: Option<Uuid>,
    pub state: InterruptState,
    pub config: InterruptConfig,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,
    /// Why processing did not succeed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
}

/// Request to register an interrupt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterruptRequest {
    #[serde(rename = "type")]
    pub interrupt_type: InterruptType,
    #[serde(default)]
    pub node_execution_id: Option<Uuid>,
    #[serde(default = "default_issued_by")]
    pub issued_by: IssuedBy,
    #[serde(default)]
    pub issuer_id: Option<String>,
    #[serde(default)]
    pub wait_secs: Option<u64>,
}

fn default_issued_by() -> IssuedBy {
    IssuedBy::User
}

impl InterruptRequest {
    pub fn new(interrupt_type: InterruptType, node_execution_id: Option<Uuid>) -> Self {
        Self {
            interrupt_type,
            node_execution_id,
            issued_by: IssuedBy::User,
            issuer_id: None,
            wait_secs: None,
        }
    }

    pub fn issued_by(mut self, issued_by: IssuedBy) -> Self {
        self.issued_by = issued_by;
        self
    }

    pub fn wait_secs(mut self, wait: u64) -> Self {
        self.wait_secs = Some(wait);
        self
    }

    /// Plan-scoped types take no node; node-scoped types require one.
    pub fn validate(&self) -> EngineResult<()> {
        match (self.interrupt_type.is_plan_scoped(), self.node_execution_id) {
            (true, Some(_)) => Err(EngineError::InvalidRequest(format!(
                "{} targets the whole execution and takes no node",
                self.interrupt_type
            ))),
            (false, None) => Err(EngineError::InvalidRequest(format!(
                "{} requires a node execution id",
                self.interrupt_type
            ))),
            _ => Ok(()),
        }
    }

    pub fn into_interrupt(self, plan_execution_id: Uuid) -> Interrupt {
        Interrupt {
            uuid: Uuid::new_v4(),
            interrupt_type: self.interrupt_type,
            plan_execution_id,
            node_execution_id: self.node_execution_id,
            state: InterruptState::Registered,
            config: InterruptConfig {
                issued_by: self.issued_by,
                issuer_id: self.issuer_id,
                wait_secs: self.wait_secs,
            },
            created_at: Utc::now(),
            processed_at: None,
            outcome: None,
        }
    }
}
