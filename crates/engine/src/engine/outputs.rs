//! Sweeping outputs: a scope-addressed blackboard shared across nodes.
//!
//! A value is written at a scope (a prefix of the writer's ambiance) and is
//! readable by every node at or below that scope. Resolution walks from the
//! reader's own scope up to the plan execution scope and returns the
//! nearest match.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::ambiance::Ambiance;
use crate::error::{EngineError, EngineResult};
use crate::plan::NodeGroup;
use crate::store::ExecutionStore;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepingOutput {
    pub plan_execution_id: Uuid,
    pub scope: String,
    pub name: String,
    pub value: serde_json::Value,
    pub overridable: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct SweepingOutputService {
    store: Arc<dyn ExecutionStore>,
}

impl SweepingOutputService {
    pub fn new(store: Arc<dyn ExecutionStore>) -> Self {
        Self { store }
    }

    /// Write-once output.
    ///
    /// Without a group the value lands in the writer's enclosing scope, shared
    /// with its siblings. With a group it lands at the nearest level of that
    /// group. Returns `AlreadyExists` on a second write to the same key.
    pub async fn consume(
        &self,
        ambiance: &Ambiance,
        name: &str,
        value: serde_json::Value,
        group: Option<NodeGroup>,
    ) -> EngineResult<()> {
        let scope = Self::scope_for(ambiance, group)?;
        self.write(ambiance, scope, name, value, false).await
    }

    /// Output that later writes to the same key may replace.
    pub async fn consume_overridable(
        &self,
        ambiance: &Ambiance,
        name: &str,
        value: serde_json::Value,
        group: Option<NodeGroup>,
    ) -> EngineResult<()> {
        let scope = Self::scope_for(ambiance, group)?;
        self.write(ambiance, scope, name, value, true).await
    }

    /// Nearest value visible from `ambiance`, if any.
    pub async fn resolve_optional(
        &self,
        ambiance: &Ambiance,
        name: &str,
    ) -> EngineResult<Option<serde_json::Value>> {
        for scope in ambiance.scope_chain() {
            if let Some(found) = self
                .store
                .find_output(ambiance.plan_execution_id, &scope, name)
                .await?
            {
                return Ok(Some(found.value));
            }
        }
        Ok(None)
    }

    /// Like [`resolve_optional`](Self::resolve_optional) but absence is an error.
    pub async fn resolve(&self, ambiance: &Ambiance, name: &str) -> EngineResult<serde_json::Value> {
        self.resolve_optional(ambiance, name)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("sweeping output '{}'", name)))
    }

    fn scope_for(ambiance: &Ambiance, group: Option<NodeGroup>) -> EngineResult<String> {
        match group {
            None => Ok(ambiance.enclosing_scope_key()),
            Some(group) => ambiance.scope_key_for_group(group).ok_or_else(|| {
                EngineError::InvalidRequest(format!("no {} level in the current ambiance", group))
            }),
        }
    }

    async fn write(
        &self,
        ambiance: &Ambiance,
        scope: String,
        name: &str,
        value: serde_json::Value,
        overridable: bool,
    ) -> EngineResult<()> {
        let output = SweepingOutput {
            plan_execution_id: ambiance.plan_execution_id,
            scope,
            name: name.to_string(),
            value,
            overridable,
            created_at: Utc::now(),
        };
        self.store.insert_output(&output).await?;
        tracing::debug!(
            plan_execution_id = %output.plan_execution_id,
            scope = %output.scope,
            name = %output.name,
            "Sweeping output written"
        );
        Ok(())
    }
}
