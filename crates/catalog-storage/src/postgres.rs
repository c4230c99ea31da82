//! Postgres implementation of [`StateStore`].

use async_trait::async_trait;
use catalog_core::{
    AssetId, AssetMaterialization, AssetStalePartition, AuditLogEntry, AutoRunClaim, EngineError,
    ErrorKind, EventTrigger, ExecutionHistoryEvent, FailureReason, JobBundle, JobBundleVersion,
    RunStatus, Schedule, Step, StepStatus, TriggerDelivery, WorkflowDefinition, WorkflowRun,
    WorkflowRunStep,
};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use crate::store::{ClaimedSchedule, ClaimedStep, NewDefinition, NewRun, StateStore};

#[derive(Clone)]
pub struct PostgresStateStore {
    pool: PgPool,
}

impl PostgresStateStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn connect(database_url: &str) -> Result<Self, EngineError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(db_err)?;
        crate::migrations::run(&pool).await.map_err(db_err)?;
        Ok(Self::new(pool))
    }
}

fn db_err(e: sqlx::Error) -> EngineError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            EngineError::conflict(format!("unique constraint violated: {db}"))
        }
        sqlx::Error::RowNotFound => EngineError::not_found("row not found"),
        other => EngineError::new(ErrorKind::Transient, other.to_string()),
    }
}

fn json_err(e: serde_json::Error) -> EngineError {
    EngineError::new(ErrorKind::Fatal, format!("corrupt stored payload: {e}"))
}

fn definition_from_row(row: &sqlx::postgres::PgRow) -> Result<WorkflowDefinition, EngineError> {
    Ok(WorkflowDefinition {
        id: row.try_get("id").map_err(db_err)?,
        slug: row.try_get("slug").map_err(db_err)?,
        name: row.try_get("name").map_err(db_err)?,
        version: row.try_get("version").map_err(db_err)?,
        description: row.try_get("description").map_err(db_err)?,
        steps: serde_json::from_value(row.try_get("steps").map_err(db_err)?).map_err(json_err)?,
        triggers: serde_json::from_value(row.try_get("triggers").map_err(db_err)?)
            .map_err(json_err)?,
        parameters_schema: row.try_get("parameters_schema").map_err(db_err)?,
        default_parameters: row.try_get("default_parameters").map_err(db_err)?,
        output_schema: row.try_get("output_schema").map_err(db_err)?,
        metadata: row.try_get("metadata").map_err(db_err)?,
        dag: serde_json::from_value(row.try_get("dag").map_err(db_err)?).map_err(json_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        updated_at: row.try_get("updated_at").map_err(db_err)?,
    })
}

fn run_from_row(row: &sqlx::postgres::PgRow) -> Result<WorkflowRun, EngineError> {
    let status_text: String = row.try_get("status").map_err(db_err)?;
    let triggered_by_text: String = row.try_get("triggered_by").map_err(db_err)?;
    let trigger_json: Option<serde_json::Value> = row.try_get("trigger").map_err(db_err)?;
    Ok(WorkflowRun {
        id: row.try_get("id").map_err(db_err)?,
        workflow_definition_id: row.try_get("workflow_definition_id").map_err(db_err)?,
        status: parse_enum(&status_text)?,
        parameters: row.try_get("parameters").map_err(db_err)?,
        context: row.try_get("context").map_err(db_err)?,
        output: row.try_get("output").map_err(db_err)?,
        error_message: row.try_get("error_message").map_err(db_err)?,
        current_step_id: row.try_get("current_step_id").map_err(db_err)?,
        current_step_index: row.try_get("current_step_index").map_err(db_err)?,
        metrics: row.try_get("metrics").map_err(db_err)?,
        triggered_by: parse_enum(&triggered_by_text)?,
        trigger: trigger_json
            .map(serde_json::from_value)
            .transpose()
            .map_err(json_err)?,
        partition_key: row.try_get("partition_key").map_err(db_err)?,
        run_key: row.try_get("run_key").map_err(db_err)?,
        run_key_normalized: row.try_get("run_key_normalized").map_err(db_err)?,
        claim_owner: row.try_get("claim_owner").map_err(db_err)?,
        started_at: row.try_get("started_at").map_err(db_err)?,
        completed_at: row.try_get("completed_at").map_err(db_err)?,
        duration_ms: row.try_get("duration_ms").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        updated_at: row.try_get("updated_at").map_err(db_err)?,
    })
}

fn run_step_from_row(row: &sqlx::postgres::PgRow) -> Result<WorkflowRunStep, EngineError> {
    let status_text: String = row.try_get("status").map_err(db_err)?;
    let failure_text: Option<String> = row.try_get("failure_reason").map_err(db_err)?;
    Ok(WorkflowRunStep {
        id: row.try_get("id").map_err(db_err)?,
        workflow_run_id: row.try_get("workflow_run_id").map_err(db_err)?,
        step_id: row.try_get("step_id").map_err(db_err)?,
        fanout_index: row.try_get("fanout_index").map_err(db_err)?,
        parent_step_id: row.try_get("parent_step_id").map_err(db_err)?,
        template_step_id: row.try_get("template_step_id").map_err(db_err)?,
        status: parse_enum(&status_text)?,
        attempt: row.try_get::<i32, _>("attempt").map_err(db_err)? as u32,
        max_attempts: row.try_get::<i32, _>("max_attempts").map_err(db_err)? as u32,
        retry_count: row.try_get::<i32, _>("retry_count").map_err(db_err)? as u32,
        claim_owner: row.try_get("claim_owner").map_err(db_err)?,
        claimed_at: row.try_get("claimed_at").map_err(db_err)?,
        heartbeat_at: row.try_get("heartbeat_at").map_err(db_err)?,
        job_run_id: row.try_get("job_run_id").map_err(db_err)?,
        input: row.try_get("input").map_err(db_err)?,
        output: row.try_get("output").map_err(db_err)?,
        failure_reason: failure_text.map(|t| parse_enum(&t)).transpose()?,
        error_message: row.try_get("error_message").map_err(db_err)?,
        started_at: row.try_get("started_at").map_err(db_err)?,
        completed_at: row.try_get("completed_at").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        updated_at: row.try_get("updated_at").map_err(db_err)?,
    })
}

fn parse_enum<T: serde::de::DeserializeOwned>(text: &str) -> Result<T, EngineError> {
    serde_json::from_value(serde_json::Value::String(text.to_string())).map_err(json_err)
}

fn enum_str<T: serde::Serialize>(value: &T) -> Result<String, EngineError> {
    match serde_json::to_value(value).map_err(json_err)? {
        serde_json::Value::String(s) => Ok(s),
        other => Err(EngineError::fatal(format!(
            "expected enum to serialize to a string, got {other}"
        ))),
    }
}

#[async_trait]
impl StateStore for PostgresStateStore {
    #[instrument(skip(self, input))]
    async fn create_definition(
        &self,
        input: NewDefinition,
    ) -> Result<WorkflowDefinition, EngineError> {
        let id = Uuid::now_v7();
        let next_version: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(version), 0) + 1 FROM workflow_definitions WHERE slug = $1",
        )
        .bind(&input.slug)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        let steps_json = serde_json::to_value(&input.steps).map_err(json_err)?;
        let triggers_json = serde_json::to_value(&input.triggers).map_err(json_err)?;
        let dag_json = serde_json::to_value(&input.dag).map_err(json_err)?;

        let row = sqlx::query(
            r#"
            INSERT INTO workflow_definitions
                (id, slug, name, version, description, steps, triggers,
                 parameters_schema, default_parameters, output_schema, dag)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(&input.slug)
        .bind(&input.name)
        .bind(next_version)
        .bind(&input.description)
        .bind(&steps_json)
        .bind(&triggers_json)
        .bind(&input.parameters_schema)
        .bind(&input.default_parameters)
        .bind(&input.output_schema)
        .bind(&dag_json)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        definition_from_row(&row)
    }

    async fn get_definition(&self, id: Uuid) -> Result<WorkflowDefinition, EngineError> {
        let row = sqlx::query("SELECT * FROM workflow_definitions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or_else(|| EngineError::not_found(format!("definition {id} not found")))?;
        definition_from_row(&row)
    }

    async fn get_latest_definition_by_slug(
        &self,
        slug: &str,
    ) -> Result<WorkflowDefinition, EngineError> {
        let row = sqlx::query(
            "SELECT * FROM workflow_definitions WHERE slug = $1 ORDER BY version DESC LIMIT 1",
        )
        .bind(slug)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or_else(|| EngineError::not_found(format!("definition '{slug}' not found")))?;
        definition_from_row(&row)
    }

    #[instrument(skip(self, input))]
    async fn create_run(&self, input: NewRun) -> Result<WorkflowRun, EngineError> {
        let id = Uuid::now_v7();
        let triggered_by_text = enum_str(&input.triggered_by)?;
        let trigger_json = input
            .trigger
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(json_err)?;

        let row = sqlx::query(
            r#"
            INSERT INTO workflow_runs
                (id, workflow_definition_id, status, run_key, run_key_normalized,
                 parameters, triggered_by, trigger, partition_key, context)
            VALUES ($1, $2, 'pending', $3, $4, $5, $6, $7, $8, $9)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(input.workflow_definition_id)
        .bind(&input.run_key)
        .bind(&input.run_key_normalized)
        .bind(&input.parameters)
        .bind(&triggered_by_text)
        .bind(&trigger_json)
        .bind(&input.partition_key)
        .bind(&input.context)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                EngineError::conflict("an active run already exists for this run key")
                    .with_detail(serde_json::json!({
                        "workflowDefinitionId": input.workflow_definition_id,
                        "runKeyNormalized": input.run_key_normalized,
                    }))
            }
            _ => db_err(e),
        })?;

        run_from_row(&row)
    }

    async fn get_run(&self, id: Uuid) -> Result<WorkflowRun, EngineError> {
        let row = sqlx::query("SELECT * FROM workflow_runs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or_else(|| EngineError::not_found(format!("run {id} not found")))?;
        run_from_row(&row)
    }

    async fn list_active_run_ids(&self, limit: u32) -> Result<Vec<Uuid>, EngineError> {
        let rows = sqlx::query(
            r#"
            SELECT id FROM workflow_runs
            WHERE status IN ('pending', 'running')
            ORDER BY created_at
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(|row| row.try_get::<Uuid, _>("id").map_err(db_err)).collect()
    }

    async fn create_run_steps(
        &self,
        run_id: Uuid,
        steps: Vec<WorkflowRunStep>,
    ) -> Result<(), EngineError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for step in steps {
            let status_text = enum_str(&step.status)?;
            sqlx::query(
                r#"
                INSERT INTO workflow_run_steps
                    (id, workflow_run_id, step_id, fanout_index, status, max_attempts)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(step.id)
            .bind(run_id)
            .bind(&step.step_id)
            .bind(step.fanout_index)
            .bind(&status_text)
            .bind(step.max_attempts as i32)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn get_run_steps(&self, run_id: Uuid) -> Result<Vec<WorkflowRunStep>, EngineError> {
        let rows = sqlx::query(
            "SELECT * FROM workflow_run_steps WHERE workflow_run_id = $1 ORDER BY step_id, fanout_index NULLS FIRST",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(run_step_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn claim_ready_steps(
        &self,
        run_id: Uuid,
        limit: u32,
    ) -> Result<Vec<ClaimedStep>, EngineError> {
        // Dependencies are resolved by the orchestrator before calling this
        // (it knows the DAG); this claims the given run's `pending` steps
        // that are not already claimed, `FOR UPDATE SKIP LOCKED`.
        let rows = sqlx::query(
            r#"
            WITH claimable AS (
                SELECT id FROM workflow_run_steps
                WHERE workflow_run_id = $1 AND status = 'pending' AND claim_owner IS NULL
                ORDER BY step_id, fanout_index NULLS FIRST
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE workflow_run_steps t
            SET status = 'running', claimed_at = now(), heartbeat_at = now(),
                started_at = COALESCE(t.started_at, now()), attempt = attempt + 1
            FROM claimable c
            WHERE t.id = c.id
            RETURNING t.*
            "#,
        )
        .bind(run_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let definition_steps = {
            let run = self.get_run(run_id).await?;
            let def = self.get_definition(run.workflow_definition_id).await?;
            def.steps
        };

        rows.iter()
            .map(|row| {
                let step = run_step_from_row(row)?;
                let definition_step = definition_steps
                    .iter()
                    .find(|s| s.id == step.step_id)
                    .cloned()
                    .ok_or_else(|| {
                        EngineError::fatal(format!(
                            "run step '{}' has no matching definition step",
                            step.step_id
                        ))
                    })?;
                Ok(ClaimedStep {
                    step,
                    definition_step,
                })
            })
            .collect()
    }

    async fn update_step_status(
        &self,
        step_id: Uuid,
        status: StepStatus,
        output: Option<serde_json::Value>,
        failure: Option<FailureReason>,
        error_message: Option<String>,
    ) -> Result<(), EngineError> {
        let status_text = enum_str(&status)?;
        let failure_text = failure.map(|f| enum_str(&f)).transpose()?;
        let completed = status.is_terminal();
        sqlx::query(
            r#"
            UPDATE workflow_run_steps
            SET status = $2,
                output = COALESCE($3, output),
                failure_reason = $4,
                error_message = $5,
                completed_at = CASE WHEN $6 THEN now() ELSE completed_at END,
                claim_owner = CASE WHEN $6 THEN NULL ELSE claim_owner END
            WHERE id = $1
            "#,
        )
        .bind(step_id)
        .bind(&status_text)
        .bind(&output)
        .bind(&failure_text)
        .bind(&error_message)
        .bind(completed)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn heartbeat_step(&self, step_id: Uuid, claim_owner: &str) -> Result<bool, EngineError> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_run_steps
            SET heartbeat_at = now(), claim_owner = $2
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(step_id)
        .bind(claim_owner)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn schedule_retry(&self, step_id: Uuid, retry_count: u32) -> Result<(), EngineError> {
        sqlx::query(
            r#"
            UPDATE workflow_run_steps
            SET status = 'pending',
                retry_count = $2,
                claim_owner = NULL,
                failure_reason = NULL,
                error_message = NULL
            WHERE id = $1
            "#,
        )
        .bind(step_id)
        .bind(retry_count as i32)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn reclaim_stale_steps(&self, stale_after_ms: i64) -> Result<Vec<Uuid>, EngineError> {
        let rows = sqlx::query(
            r#"
            UPDATE workflow_run_steps
            SET status = 'pending', claim_owner = NULL
            WHERE status = 'running'
              AND heartbeat_at < now() - ($1 * interval '1 millisecond')
            RETURNING id
            "#,
        )
        .bind(stale_after_ms as f64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(|r| r.try_get("id").map_err(db_err)).collect()
    }

    #[instrument(skip(self, history_event))]
    async fn finalize_run(
        &self,
        run_id: Uuid,
        status: RunStatus,
        error_message: Option<String>,
        output: Option<serde_json::Value>,
        history_event: ExecutionHistoryEvent,
    ) -> Result<WorkflowRun, EngineError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let status_text = enum_str(&status)?;

        let row = sqlx::query(
            r#"
            UPDATE workflow_runs
            SET status = $2, error_message = $3, current_step_id = NULL,
                output = COALESCE($4, output),
                completed_at = now()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(run_id)
        .bind(&status_text)
        .bind(&error_message)
        .bind(&output)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        let _ = row;

        let row = sqlx::query("SELECT * FROM workflow_runs WHERE id = $1")
            .bind(run_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err)?;

        let event_type_text = enum_str(&history_event.event_type)?;
        sqlx::query(
            r#"
            INSERT INTO workflow_execution_history
                (id, workflow_run_id, workflow_run_step_id, event_type, payload)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(history_event.id)
        .bind(run_id)
        .bind(history_event.workflow_run_step_id)
        .bind(&event_type_text)
        .bind(&history_event.payload)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        run_from_row(&row)
    }

    async fn set_run_current_step(
        &self,
        run_id: Uuid,
        current_step_id: Option<String>,
    ) -> Result<(), EngineError> {
        sqlx::query("UPDATE workflow_runs SET current_step_id = $2, status = 'running', started_at = COALESCE(started_at, now()) WHERE id = $1")
            .bind(run_id)
            .bind(&current_step_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn claim_run(&self, run_id: Uuid, claim_owner: &str) -> Result<WorkflowRun, EngineError> {
        let row = sqlx::query(
            r#"
            UPDATE workflow_runs
            SET claim_owner = $2,
                status = CASE WHEN status = 'pending' THEN 'running' ELSE status END,
                started_at = COALESCE(started_at, now())
            WHERE id = $1 AND (claim_owner IS NULL OR claim_owner = $2)
            RETURNING *
            "#,
        )
        .bind(run_id)
        .bind(claim_owner)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        match row {
            Some(row) => run_from_row(&row),
            None => {
                let existing = sqlx::query("SELECT claim_owner FROM workflow_runs WHERE id = $1")
                    .bind(run_id)
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(db_err)?;
                match existing {
                    None => Err(EngineError::not_found(format!("run {run_id} not found"))),
                    Some(row) => {
                        let owner: Option<String> = row.try_get("claim_owner").map_err(db_err)?;
                        Err(EngineError::conflict(format!(
                            "run {run_id} is already claimed by {}",
                            owner.unwrap_or_default()
                        )))
                    }
                }
            }
        }
    }

    #[instrument(skip(self, materialization))]
    async fn record_materialization(
        &self,
        materialization: AssetMaterialization,
    ) -> Result<(), EngineError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        sqlx::query(
            r#"
            INSERT INTO workflow_run_step_assets
                (id, workflow_definition_id, workflow_run_id, workflow_run_step_id,
                 step_id, asset_id, partition_key, payload, asset_schema, freshness,
                 produced_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (workflow_run_step_id, asset_id, COALESCE(partition_key, ''))
            DO UPDATE SET payload = EXCLUDED.payload, produced_at = EXCLUDED.produced_at,
                          updated_at = now()
            "#,
        )
        .bind(materialization.id)
        .bind(materialization.workflow_definition_id)
        .bind(materialization.workflow_run_id)
        .bind(materialization.workflow_run_step_id)
        .bind(&materialization.step_id)
        .bind(materialization.asset_id.as_str())
        .bind(&materialization.partition_key)
        .bind(&materialization.payload)
        .bind(&materialization.asset_schema)
        .bind(
            materialization
                .freshness
                .as_ref()
                .map(serde_json::to_value)
                .transpose()
                .map_err(json_err)?,
        )
        .bind(materialization.produced_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        sqlx::query(
            "DELETE FROM asset_stale_partitions WHERE workflow_definition_id = $1 AND asset_id = $2 AND partition_key = $3",
        )
        .bind(materialization.workflow_definition_id)
        .bind(materialization.asset_id.as_str())
        .bind(materialization.partition_key.clone().unwrap_or_default())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn get_latest_materialization(
        &self,
        workflow_definition_id: Uuid,
        asset_id: &AssetId,
        partition_key: Option<&str>,
    ) -> Result<Option<AssetMaterialization>, EngineError> {
        let row = sqlx::query(
            r#"
            SELECT * FROM workflow_run_step_assets
            WHERE workflow_definition_id = $1 AND asset_id = $2
              AND COALESCE(partition_key, '') = COALESCE($3, '')
            ORDER BY produced_at DESC, created_at DESC
            LIMIT 1
            "#,
        )
        .bind(workflow_definition_id)
        .bind(asset_id.as_str())
        .bind(partition_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.map(|row| {
            Ok::<_, EngineError>(AssetMaterialization {
                id: row.try_get("id").map_err(db_err)?,
                workflow_definition_id: row.try_get("workflow_definition_id").map_err(db_err)?,
                workflow_run_id: row.try_get("workflow_run_id").map_err(db_err)?,
                workflow_run_step_id: row.try_get("workflow_run_step_id").map_err(db_err)?,
                step_id: row.try_get("step_id").map_err(db_err)?,
                asset_id: AssetId::parse(row.try_get::<String, _>("asset_id").map_err(db_err)?)?,
                partition_key: row.try_get("partition_key").map_err(db_err)?,
                payload: row.try_get("payload").map_err(db_err)?,
                asset_schema: row.try_get("asset_schema").map_err(db_err)?,
                freshness: row
                    .try_get::<Option<serde_json::Value>, _>("freshness")
                    .map_err(db_err)?
                    .map(serde_json::from_value)
                    .transpose()
                    .map_err(json_err)?,
                produced_at: row.try_get("produced_at").map_err(db_err)?,
                updated_at: row.try_get("updated_at").map_err(db_err)?,
                created_at: row.try_get("created_at").map_err(db_err)?,
            })
        })
        .transpose()
    }

    async fn mark_stale(&self, stale: AssetStalePartition) -> Result<(), EngineError> {
        sqlx::query(
            r#"
            INSERT INTO asset_stale_partitions
                (workflow_definition_id, asset_id, partition_key, requested_by, requested_at, note)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (workflow_definition_id, asset_id, partition_key)
            DO UPDATE SET requested_by = EXCLUDED.requested_by, requested_at = EXCLUDED.requested_at,
                          note = EXCLUDED.note
            "#,
        )
        .bind(stale.workflow_definition_id)
        .bind(stale.asset_id.as_str())
        .bind(stale.partition_key.clone().unwrap_or_default())
        .bind(&stale.requested_by)
        .bind(stale.requested_at)
        .bind(&stale.note)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn clear_stale(
        &self,
        workflow_definition_id: Uuid,
        asset_id: &AssetId,
        partition_key: Option<&str>,
    ) -> Result<(), EngineError> {
        sqlx::query(
            "DELETE FROM asset_stale_partitions WHERE workflow_definition_id = $1 AND asset_id = $2 AND partition_key = $3",
        )
        .bind(workflow_definition_id)
        .bind(asset_id.as_str())
        .bind(partition_key.unwrap_or(""))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn list_stale(
        &self,
        workflow_definition_id: Uuid,
    ) -> Result<Vec<AssetStalePartition>, EngineError> {
        let rows = sqlx::query(
            "SELECT * FROM asset_stale_partitions WHERE workflow_definition_id = $1",
        )
        .bind(workflow_definition_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter()
            .map(|row| {
                Ok(AssetStalePartition {
                    workflow_definition_id: row.try_get("workflow_definition_id").map_err(db_err)?,
                    asset_id: AssetId::parse(row.try_get::<String, _>("asset_id").map_err(db_err)?)?,
                    partition_key: {
                        let pk: String = row.try_get("partition_key").map_err(db_err)?;
                        if pk.is_empty() { None } else { Some(pk) }
                    },
                    requested_by: row.try_get("requested_by").map_err(db_err)?,
                    requested_at: row.try_get("requested_at").map_err(db_err)?,
                    note: row.try_get("note").map_err(db_err)?,
                })
            })
            .collect()
    }

    async fn upsert_bundle(
        &self,
        slug: &str,
        display_name: &str,
        description: Option<&str>,
    ) -> Result<JobBundle, EngineError> {
        let row = sqlx::query(
            r#"
            INSERT INTO job_bundles (id, slug, display_name, description)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (slug) DO UPDATE SET updated_at = now()
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(slug)
        .bind(display_name)
        .bind(description)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        bundle_from_row(&row)
    }

    #[instrument(skip(self, version))]
    async fn publish_bundle_version(
        &self,
        version: JobBundleVersion,
    ) -> Result<JobBundleVersion, EngineError> {
        let status_text = enum_str(&version.status)?;
        let storage_text = enum_str(&version.artifact_storage)?;
        let capability_flags_json =
            serde_json::to_value(&version.capability_flags).map_err(json_err)?;

        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let row = sqlx::query(
            r#"
            INSERT INTO job_bundle_versions
                (id, bundle_id, slug, version, manifest, checksum, capability_flags,
                 artifact_storage, artifact_path, artifact_content_type, artifact_size,
                 artifact_data, immutable, status, published_by, published_by_kind,
                 published_by_token_hash, published_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            RETURNING *
            "#,
        )
        .bind(version.id)
        .bind(version.bundle_id)
        .bind(&version.slug)
        .bind(version.version)
        .bind(&version.manifest)
        .bind(&version.checksum)
        .bind(&capability_flags_json)
        .bind(&storage_text)
        .bind(&version.artifact_path)
        .bind(&version.artifact_content_type)
        .bind(version.artifact_size)
        .bind(&version.artifact_data)
        .bind(version.immutable)
        .bind(&status_text)
        .bind(&version.published_by)
        .bind(&version.published_by_kind)
        .bind(&version.published_by_token_hash)
        .bind(version.published_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                EngineError::conflict("bundle version already published").with_detail(
                    serde_json::json!({"slug": version.slug, "version": version.version}),
                )
            }
            _ => db_err(e),
        })?;

        if version.status == catalog_core::BundleStatus::Published {
            sqlx::query(
                "UPDATE job_bundles SET latest_version = GREATEST(COALESCE(latest_version, 0), $2), updated_at = now() WHERE id = $1",
            )
            .bind(version.bundle_id)
            .bind(version.version)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        bundle_version_from_row(&row)
    }

    async fn delete_bundle_version(&self, slug: &str, version: i64) -> Result<(), EngineError> {
        let bundle = self.get_bundle(slug).await?;
        sqlx::query("DELETE FROM job_bundle_versions WHERE bundle_id = $1 AND version = $2")
            .bind(bundle.id)
            .bind(version)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn get_bundle(&self, slug: &str) -> Result<JobBundle, EngineError> {
        let row = sqlx::query("SELECT * FROM job_bundles WHERE slug = $1")
            .bind(slug)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or_else(|| EngineError::not_found(format!("bundle '{slug}' not found")))?;
        bundle_from_row(&row)
    }

    async fn get_latest_published_bundle_version(
        &self,
        slug: &str,
    ) -> Result<JobBundleVersion, EngineError> {
        let bundle = self.get_bundle(slug).await?;
        let row = sqlx::query(
            "SELECT * FROM job_bundle_versions WHERE bundle_id = $1 AND status = 'published' ORDER BY version DESC LIMIT 1",
        )
        .bind(bundle.id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or_else(|| {
            EngineError::not_found(format!("no published version for bundle '{slug}'"))
        })?;
        bundle_version_from_row(&row)
    }

    async fn get_pinned_bundle_version(
        &self,
        slug: &str,
        version: i64,
    ) -> Result<JobBundleVersion, EngineError> {
        let bundle = self.get_bundle(slug).await?;
        let row = sqlx::query("SELECT * FROM job_bundle_versions WHERE bundle_id = $1 AND version = $2")
            .bind(bundle.id)
            .bind(version)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or_else(|| {
                EngineError::not_found(format!("bundle '{slug}' has no version {version}"))
            })?;
        bundle_version_from_row(&row)
    }

    async fn upsert_schedule(&self, schedule: Schedule) -> Result<Schedule, EngineError> {
        let row = sqlx::query(
            r#"
            INSERT INTO schedules
                (id, workflow_definition_id, cron, timezone, start_window, end_window,
                 catch_up, next_run_at, last_materialized_window, catchup_cursor)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (id) DO UPDATE SET
                cron = EXCLUDED.cron, timezone = EXCLUDED.timezone,
                next_run_at = EXCLUDED.next_run_at,
                last_materialized_window = EXCLUDED.last_materialized_window,
                catchup_cursor = EXCLUDED.catchup_cursor
            RETURNING *
            "#,
        )
        .bind(schedule.id)
        .bind(schedule.workflow_definition_id)
        .bind(&schedule.cron)
        .bind(&schedule.timezone)
        .bind(schedule.start_window)
        .bind(schedule.end_window)
        .bind(schedule.catch_up)
        .bind(schedule.next_run_at)
        .bind(schedule.last_materialized_window)
        .bind(schedule.catchup_cursor)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        schedule_from_row(&row)
    }

    async fn claim_due_schedules(&self, limit: u32) -> Result<Vec<ClaimedSchedule>, EngineError> {
        let rows = sqlx::query(
            r#"
            WITH due AS (
                SELECT id FROM schedules
                WHERE next_run_at <= now()
                ORDER BY next_run_at
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            SELECT schedules.* FROM schedules JOIN due ON schedules.id = due.id
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter()
            .map(|row| Ok(ClaimedSchedule { schedule: schedule_from_row(row)? }))
            .collect()
    }

    async fn create_event_trigger(&self, trigger: EventTrigger) -> Result<EventTrigger, EngineError> {
        let row = sqlx::query(
            r#"
            INSERT INTO event_triggers
                (id, workflow_definition_id, event_type, event_source, predicate, throttle_ms,
                 failure_threshold, paused, paused_reason, last_fired_at, consecutive_failures)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING *
            "#,
        )
        .bind(trigger.id)
        .bind(trigger.workflow_definition_id)
        .bind(&trigger.event_type)
        .bind(&trigger.event_source)
        .bind(&trigger.predicate)
        .bind(trigger.throttle_ms as i64)
        .bind(trigger.failure_threshold as i32)
        .bind(trigger.paused)
        .bind(&trigger.paused_reason)
        .bind(trigger.last_fired_at)
        .bind(trigger.consecutive_failures as i32)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        event_trigger_from_row(&row)
    }

    async fn update_event_trigger(&self, trigger: EventTrigger) -> Result<EventTrigger, EngineError> {
        let row = sqlx::query(
            r#"
            UPDATE event_triggers
            SET paused = $2, paused_reason = $3, last_fired_at = $4, consecutive_failures = $5
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(trigger.id)
        .bind(trigger.paused)
        .bind(&trigger.paused_reason)
        .bind(trigger.last_fired_at)
        .bind(trigger.consecutive_failures as i32)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or_else(|| EngineError::not_found(format!("event trigger {} not found", trigger.id)))?;
        event_trigger_from_row(&row)
    }

    async fn list_event_triggers_for_type(
        &self,
        event_type: &str,
    ) -> Result<Vec<EventTrigger>, EngineError> {
        let rows = sqlx::query("SELECT * FROM event_triggers WHERE event_type = $1")
            .bind(event_type)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter().map(event_trigger_from_row).collect()
    }

    async fn record_trigger_delivery(&self, delivery: TriggerDelivery) -> Result<(), EngineError> {
        let status_text = enum_str(&delivery.status)?;
        sqlx::query(
            r#"
            INSERT INTO trigger_deliveries
                (id, event_trigger_id, event_id, status, workflow_run_id, error_message)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(delivery.id)
        .bind(delivery.event_trigger_id)
        .bind(delivery.event_id)
        .bind(&status_text)
        .bind(delivery.workflow_run_id)
        .bind(&delivery.error_message)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn append_history_event(&self, event: ExecutionHistoryEvent) -> Result<(), EngineError> {
        let event_type_text = enum_str(&event.event_type)?;
        sqlx::query(
            r#"
            INSERT INTO workflow_execution_history
                (id, workflow_run_id, workflow_run_step_id, event_type, payload)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(event.id)
        .bind(event.workflow_run_id)
        .bind(event.workflow_run_step_id)
        .bind(&event_type_text)
        .bind(&event.payload)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn list_history_for_run(
        &self,
        run_id: Uuid,
    ) -> Result<Vec<ExecutionHistoryEvent>, EngineError> {
        let rows = sqlx::query(
            "SELECT * FROM workflow_execution_history WHERE workflow_run_id = $1 ORDER BY created_at",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter()
            .map(|row| {
                Ok(ExecutionHistoryEvent {
                    id: row.try_get("id").map_err(db_err)?,
                    workflow_run_id: row.try_get("workflow_run_id").map_err(db_err)?,
                    workflow_run_step_id: row.try_get("workflow_run_step_id").map_err(db_err)?,
                    event_type: parse_enum(&row.try_get::<String, _>("event_type").map_err(db_err)?)?,
                    payload: row.try_get("payload").map_err(db_err)?,
                    created_at: row.try_get("created_at").map_err(db_err)?,
                })
            })
            .collect()
    }

    async fn append_audit_entry(&self, entry: AuditLogEntry) -> Result<(), EngineError> {
        let status_text = enum_str(&entry.status)?;
        sqlx::query(
            r#"
            INSERT INTO audit_logs (id, actor, action, resource, status, scopes, metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(entry.id)
        .bind(&entry.actor)
        .bind(&entry.action)
        .bind(&entry.resource)
        .bind(&status_text)
        .bind(serde_json::to_value(&entry.scopes).map_err(json_err)?)
        .bind(&entry.metadata)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn list_latest_definitions(&self) -> Result<Vec<WorkflowDefinition>, EngineError> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT ON (slug) *
            FROM workflow_definitions
            ORDER BY slug, version DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(definition_from_row).collect()
    }

    async fn list_runs_since(&self, since: DateTime<Utc>) -> Result<Vec<WorkflowRun>, EngineError> {
        let rows = sqlx::query("SELECT * FROM workflow_runs WHERE created_at >= $1 ORDER BY created_at")
            .bind(since)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter().map(run_from_row).collect()
    }

    #[instrument(skip(self, claim))]
    async fn upsert_auto_run_claim(&self, claim: AutoRunClaim) -> Result<AutoRunClaim, EngineError> {
        let row = sqlx::query(
            r#"
            INSERT INTO workflow_auto_run_claims
                (id, workflow_definition_id, asset_id, partition_key, workflow_run_id,
                 consecutive_failures, next_eligible_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (workflow_definition_id, asset_id, partition_key) DO UPDATE SET
                workflow_run_id = EXCLUDED.workflow_run_id,
                consecutive_failures = EXCLUDED.consecutive_failures,
                next_eligible_at = EXCLUDED.next_eligible_at,
                updated_at = now()
            RETURNING *
            "#,
        )
        .bind(claim.id)
        .bind(claim.workflow_definition_id)
        .bind(claim.asset_id.as_str())
        .bind(claim.partition_key.clone().unwrap_or_default())
        .bind(claim.workflow_run_id)
        .bind(claim.consecutive_failures as i32)
        .bind(claim.next_eligible_at)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        auto_run_claim_from_row(&row)
    }

    async fn get_auto_run_claim(
        &self,
        workflow_definition_id: Uuid,
        asset_id: &AssetId,
        partition_key: Option<&str>,
    ) -> Result<Option<AutoRunClaim>, EngineError> {
        let row = sqlx::query(
            r#"
            SELECT * FROM workflow_auto_run_claims
            WHERE workflow_definition_id = $1 AND asset_id = $2 AND partition_key = $3
            "#,
        )
        .bind(workflow_definition_id)
        .bind(asset_id.as_str())
        .bind(partition_key.unwrap_or(""))
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(auto_run_claim_from_row).transpose()
    }
}

fn auto_run_claim_from_row(row: &sqlx::postgres::PgRow) -> Result<AutoRunClaim, EngineError> {
    Ok(AutoRunClaim {
        id: row.try_get("id").map_err(db_err)?,
        workflow_definition_id: row.try_get("workflow_definition_id").map_err(db_err)?,
        asset_id: AssetId::parse(row.try_get::<String, _>("asset_id").map_err(db_err)?)?,
        partition_key: {
            let pk: String = row.try_get("partition_key").map_err(db_err)?;
            if pk.is_empty() { None } else { Some(pk) }
        },
        workflow_run_id: row.try_get("workflow_run_id").map_err(db_err)?,
        consecutive_failures: row.try_get::<i32, _>("consecutive_failures").map_err(db_err)? as u32,
        next_eligible_at: row.try_get("next_eligible_at").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        updated_at: row.try_get("updated_at").map_err(db_err)?,
    })
}

fn bundle_from_row(row: &sqlx::postgres::PgRow) -> Result<JobBundle, EngineError> {
    Ok(JobBundle {
        id: row.try_get("id").map_err(db_err)?,
        slug: row.try_get("slug").map_err(db_err)?,
        display_name: row.try_get("display_name").map_err(db_err)?,
        description: row.try_get("description").map_err(db_err)?,
        latest_version: row.try_get("latest_version").map_err(db_err)?,
    })
}

fn bundle_version_from_row(row: &sqlx::postgres::PgRow) -> Result<JobBundleVersion, EngineError> {
    Ok(JobBundleVersion {
        id: row.try_get("id").map_err(db_err)?,
        bundle_id: row.try_get("bundle_id").map_err(db_err)?,
        slug: row.try_get("slug").map_err(db_err)?,
        version: row.try_get("version").map_err(db_err)?,
        manifest: row.try_get("manifest").map_err(db_err)?,
        checksum: row.try_get("checksum").map_err(db_err)?,
        capability_flags: serde_json::from_value(
            row.try_get("capability_flags").map_err(db_err)?,
        )
        .map_err(json_err)?,
        artifact_storage: parse_enum(
            &row.try_get::<String, _>("artifact_storage").map_err(db_err)?,
        )?,
        artifact_path: row.try_get("artifact_path").map_err(db_err)?,
        artifact_content_type: row.try_get("artifact_content_type").map_err(db_err)?,
        artifact_size: row.try_get("artifact_size").map_err(db_err)?,
        artifact_data: row.try_get("artifact_data").map_err(db_err)?,
        immutable: row.try_get("immutable").map_err(db_err)?,
        status: parse_enum(&row.try_get::<String, _>("status").map_err(db_err)?)?,
        published_by: row.try_get("published_by").map_err(db_err)?,
        published_by_kind: row.try_get("published_by_kind").map_err(db_err)?,
        published_by_token_hash: row.try_get("published_by_token_hash").map_err(db_err)?,
        published_at: row.try_get("published_at").map_err(db_err)?,
        deprecated_at: row.try_get("deprecated_at").map_err(db_err)?,
    })
}

fn schedule_from_row(row: &sqlx::postgres::PgRow) -> Result<Schedule, EngineError> {
    Ok(Schedule {
        id: row.try_get("id").map_err(db_err)?,
        workflow_definition_id: row.try_get("workflow_definition_id").map_err(db_err)?,
        cron: row.try_get("cron").map_err(db_err)?,
        timezone: row.try_get("timezone").map_err(db_err)?,
        start_window: row.try_get("start_window").map_err(db_err)?,
        end_window: row.try_get("end_window").map_err(db_err)?,
        catch_up: row.try_get("catch_up").map_err(db_err)?,
        next_run_at: row.try_get("next_run_at").map_err(db_err)?,
        last_materialized_window: row.try_get("last_materialized_window").map_err(db_err)?,
        catchup_cursor: row.try_get("catchup_cursor").map_err(db_err)?,
    })
}

fn event_trigger_from_row(row: &sqlx::postgres::PgRow) -> Result<EventTrigger, EngineError> {
    Ok(EventTrigger {
        id: row.try_get("id").map_err(db_err)?,
        workflow_definition_id: row.try_get("workflow_definition_id").map_err(db_err)?,
        event_type: row.try_get("event_type").map_err(db_err)?,
        event_source: row.try_get("event_source").map_err(db_err)?,
        predicate: row.try_get("predicate").map_err(db_err)?,
        throttle_ms: row.try_get::<i64, _>("throttle_ms").map_err(db_err)? as u64,
        failure_threshold: row.try_get::<i32, _>("failure_threshold").map_err(db_err)? as u32,
        paused: row.try_get("paused").map_err(db_err)?,
        paused_reason: row.try_get("paused_reason").map_err(db_err)?,
        last_fired_at: row.try_get("last_fired_at").map_err(db_err)?,
        consecutive_failures: row.try_get::<i32, _>("consecutive_failures").map_err(db_err)? as u32,
    })
}
