//! PostgreSQL store.
//!
//! Records are kept as JSONB bodies next to the columns the engine filters
//! on. Conditional updates compare the indexed `status` and `version`
//! columns so concurrent writers are linearized by the database.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::PgPool;
use uuid::Uuid;

use super::ExecutionStore;
use crate::config::DatabaseConfig;
use crate::engine::dispatch::OutstandingTask;
use crate::engine::execution::{NodeExecution, PlanExecution};
use crate::engine::interrupts::{Interrupt, InterruptState};
use crate::engine::outputs::SweepingOutput;
use crate::engine::status::Status;
use crate::error::{EngineError, EngineResult};
use crate::plan::Plan;

const SCHEMA: &[&str] = &[
    "CREATE SCHEMA IF NOT EXISTS pipeline",
    r#"
    CREATE TABLE IF NOT EXISTS pipeline.plan (
        id          TEXT PRIMARY KEY,
        body        JSONB NOT NULL,
        created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS pipeline.plan_execution (
        id          UUID PRIMARY KEY,
        plan_id     TEXT NOT NULL,
        status      TEXT NOT NULL,
        version     BIGINT NOT NULL,
        start_ts    TIMESTAMPTZ NOT NULL,
        body        JSONB NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS plan_execution_status_idx ON pipeline.plan_execution (status)",
    r#"
    CREATE TABLE IF NOT EXISTS pipeline.node_execution (
        id                 UUID PRIMARY KEY,
        seq                BIGSERIAL,
        plan_execution_id  UUID NOT NULL,
        parent_id          UUID,
        status             TEXT NOT NULL,
        version            BIGINT NOT NULL,
        body               JSONB NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS node_execution_parent_idx ON pipeline.node_execution (plan_execution_id, parent_id)",
    r#"
    CREATE TABLE IF NOT EXISTS pipeline.interrupt (
        id                 UUID PRIMARY KEY,
        seq                BIGSERIAL,
        plan_execution_id  UUID NOT NULL,
        node_execution_id  UUID,
        state              TEXT NOT NULL,
        body               JSONB NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS interrupt_state_idx ON pipeline.interrupt (state, seq)",
    r#"
    CREATE TABLE IF NOT EXISTS pipeline.sweeping_output (
        plan_execution_id  UUID NOT NULL,
        scope              TEXT NOT NULL,
        name               TEXT NOT NULL,
        overridable        BOOLEAN NOT NULL,
        body               JSONB NOT NULL,
        PRIMARY KEY (plan_execution_id, scope, name)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS pipeline.outstanding_task (
        task_id            UUID PRIMARY KEY,
        node_execution_id  UUID NOT NULL UNIQUE,
        created_at         TIMESTAMPTZ NOT NULL,
        body               JSONB NOT NULL
    )
    "#,
];

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool for `config`. Call [`PgStore::migrate`] before first use.
    pub async fn connect(config: &DatabaseConfig) -> EngineResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout))
            .connect_with(config.connect_options()?)
            .await?;

        tracing::info!(
            target = %config.describe(),
            max_connections = config.max_connections,
            "Database connection pool created"
        );
        Ok(Self::new(pool))
    }

    /// Create the schema and tables if missing.
    pub async fn migrate(&self) -> EngineResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        tracing::info!("Pipeline schema ready");
        Ok(())
    }
}

#[async_trait]
impl ExecutionStore for PgStore {
    async fn insert_plan(&self, plan: &Plan) -> EngineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO pipeline.plan (id, body)
            VALUES ($1, $2)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&plan.uuid)
        .bind(Json(plan))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_plan(&self, plan_id: &str) -> EngineResult<Option<Plan>> {
        let row: Option<(Json<Plan>,)> =
            sqlx::query_as("SELECT body FROM pipeline.plan WHERE id = $1")
                .bind(plan_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(body,)| body.0))
    }

    async fn insert_plan_execution(&self, execution: &PlanExecution) -> EngineResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO pipeline.plan_execution (id, plan_id, status, version, start_ts, body)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(execution.uuid)
        .bind(&execution.plan_id)
        .bind(execution.status.as_str())
        .bind(execution.version as i64)
        .bind(execution.start_ts)
        .bind(Json(execution))
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(EngineError::AlreadyExists(format!(
                "plan execution {}",
                execution.uuid
            )));
        }
        Ok(())
    }

    async fn get_plan_execution(&self, id: Uuid) -> EngineResult<Option<PlanExecution>> {
        let row: Option<(Json<PlanExecution>,)> =
            sqlx::query_as("SELECT body FROM pipeline.plan_execution WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(body,)| body.0))
    }

    async fn update_plan_execution(
        &self,
        execution: &PlanExecution,
        expected_status: Status,
        expected_version: u64,
    ) -> EngineResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE pipeline.plan_execution
            SET status = $2, version = $3, body = $4
            WHERE id = $1 AND status = $5 AND version = $6
            "#,
        )
        .bind(execution.uuid)
        .bind(execution.status.as_str())
        .bind(execution.version as i64)
        .bind(Json(execution))
        .bind(expected_status.as_str())
        .bind(expected_version as i64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn active_plan_executions(&self) -> EngineResult<Vec<PlanExecution>> {
        let rows: Vec<(Json<PlanExecution>,)> = sqlx::query_as(
            r#"
            SELECT body FROM pipeline.plan_execution
            WHERE status IN ('QUEUED', 'RUNNING', 'SUSPENDED')
            ORDER BY start_ts
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(body,)| body.0).collect())
    }

    async fn insert_node_execution(&self, node: &NodeExecution) -> EngineResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO pipeline.node_execution (id, plan_execution_id, parent_id, status, version, body)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(node.uuid)
        .bind(node.plan_execution_id)
        .bind(node.parent_id)
        .bind(node.status.as_str())
        .bind(node.version as i64)
        .bind(Json(node))
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(EngineError::AlreadyExists(format!("node execution {}", node.uuid)));
        }
        Ok(())
    }

    async fn get_node_execution(&self, id: Uuid) -> EngineResult<Option<NodeExecution>> {
        let row: Option<(Json<NodeExecution>,)> =
            sqlx::query_as("SELECT body FROM pipeline.node_execution WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(body,)| body.0))
    }

    async fn update_node_execution(
        &self,
        node: &NodeExecution,
        expected_status: Status,
        expected_version: u64,
    ) -> EngineResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE pipeline.node_execution
            SET status = $2, version = $3, body = $4
            WHERE id = $1 AND status = $5 AND version = $6
            "#,
        )
        .bind(node.uuid)
        .bind(node.status.as_str())
        .bind(node.version as i64)
        .bind(Json(node))
        .bind(expected_status.as_str())
        .bind(expected_version as i64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn node_executions(&self, plan_execution_id: Uuid) -> EngineResult<Vec<NodeExecution>> {
        let rows: Vec<(Json<NodeExecution>,)> = sqlx::query_as(
            "SELECT body FROM pipeline.node_execution WHERE plan_execution_id = $1 ORDER BY seq",
        )
        .bind(plan_execution_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(body,)| body.0).collect())
    }

    async fn children_of(
        &self,
        plan_execution_id: Uuid,
        parent_id: Option<Uuid>,
    ) -> EngineResult<Vec<NodeExecution>> {
        let rows: Vec<(Json<NodeExecution>,)> = sqlx::query_as(
            r#"
            SELECT body FROM pipeline.node_execution
            WHERE plan_execution_id = $1 AND parent_id IS NOT DISTINCT FROM $2
            ORDER BY seq
            "#,
        )
        .bind(plan_execution_id)
        .bind(parent_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(body,)| body.0).collect())
    }

    async fn insert_interrupt(&self, interrupt: &Interrupt) -> EngineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO pipeline.interrupt (id, plan_execution_id, node_execution_id, state, body)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(interrupt.uuid)
        .bind(interrupt.plan_execution_id)
        .bind(interrupt.node_execution_id)
        .bind(interrupt.state.as_str())
        .bind(Json(interrupt))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn interrupts_in_state(&self, state: InterruptState) -> EngineResult<Vec<Interrupt>> {
        let rows: Vec<(Json<Interrupt>,)> =
            sqlx::query_as("SELECT body FROM pipeline.interrupt WHERE state = $1 ORDER BY seq")
                .bind(state.as_str())
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(body,)| body.0).collect())
    }

    async fn interrupts_for_plan(&self, plan_execution_id: Uuid) -> EngineResult<Vec<Interrupt>> {
        let rows: Vec<(Json<Interrupt>,)> = sqlx::query_as(
            "SELECT body FROM pipeline.interrupt WHERE plan_execution_id = $1 ORDER BY seq",
        )
        .bind(plan_execution_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(body,)| body.0).collect())
    }

    async fn update_interrupt(
        &self,
        interrupt: &Interrupt,
        expected_state: InterruptState,
    ) -> EngineResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE pipeline.interrupt
            SET state = $2, body = $3
            WHERE id = $1 AND state = $4
            "#,
        )
        .bind(interrupt.uuid)
        .bind(interrupt.state.as_str())
        .bind(Json(interrupt))
        .bind(expected_state.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn has_processing_interrupt(
        &self,
        plan_execution_id: Uuid,
        node_execution_id: Option<Uuid>,
    ) -> EngineResult<bool> {
        let (exists,): (bool,) = sqlx::query_as(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM pipeline.interrupt
                WHERE plan_execution_id = $1
                  AND node_execution_id IS NOT DISTINCT FROM $2
                  AND state = 'PROCESSING'
            )
            "#,
        )
        .bind(plan_execution_id)
        .bind(node_execution_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn insert_output(&self, output: &SweepingOutput) -> EngineResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO pipeline.sweeping_output (plan_execution_id, scope, name, overridable, body)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (plan_execution_id, scope, name) DO UPDATE
            SET overridable = EXCLUDED.overridable, body = EXCLUDED.body
            WHERE pipeline.sweeping_output.overridable
            "#,
        )
        .bind(output.plan_execution_id)
        .bind(&output.scope)
        .bind(&output.name)
        .bind(output.overridable)
        .bind(Json(output))
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(EngineError::AlreadyExists(format!(
                "sweeping output '{}'",
                output.name
            )));
        }
        Ok(())
    }

    async fn find_output(
        &self,
        plan_execution_id: Uuid,
        scope: &str,
        name: &str,
    ) -> EngineResult<Option<SweepingOutput>> {
        let row: Option<(Json<SweepingOutput>,)> = sqlx::query_as(
            r#"
            SELECT body FROM pipeline.sweeping_output
            WHERE plan_execution_id = $1 AND scope = $2 AND name = $3
            "#,
        )
        .bind(plan_execution_id)
        .bind(scope)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(body,)| body.0))
    }

    async fn insert_task(&self, task: &OutstandingTask) -> EngineResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO pipeline.outstanding_task (task_id, node_execution_id, created_at, body)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(task.task_id)
        .bind(task.node_execution_id)
        .bind(task.created_at)
        .bind(Json(task))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn resolve_task(&self, task_id: Uuid) -> EngineResult<Option<OutstandingTask>> {
        let row: Option<(Json<OutstandingTask>,)> = sqlx::query_as(
            "DELETE FROM pipeline.outstanding_task WHERE task_id = $1 RETURNING body",
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(body,)| body.0))
    }

    async fn get_task(&self, task_id: Uuid) -> EngineResult<Option<OutstandingTask>> {
        let row: Option<(Json<OutstandingTask>,)> =
            sqlx::query_as("SELECT body FROM pipeline.outstanding_task WHERE task_id = $1")
                .bind(task_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(body,)| body.0))
    }

    async fn task_for_node(&self, node_execution_id: Uuid) -> EngineResult<Option<OutstandingTask>> {
        let row: Option<(Json<OutstandingTask>,)> = sqlx::query_as(
            "SELECT body FROM pipeline.outstanding_task WHERE node_execution_id = $1",
        )
        .bind(node_execution_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(body,)| body.0))
    }

    async fn outstanding_tasks(&self) -> EngineResult<Vec<OutstandingTask>> {
        let rows: Vec<(Json<OutstandingTask>,)> =
            sqlx::query_as("SELECT body FROM pipeline.outstanding_task ORDER BY created_at")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(body,)| body.0).collect())
    }

    async fn ping(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }
}
