//! Hand-rolled migration runner.
//!
//! Deliberately not `sqlx::migrate!`: each entry here is `(id, sql)`,
//! applied in order inside its own transaction, with `id` recorded in
//! `schema_migrations` so a restart skips what already ran. This mirrors
//! the literal requirement that migrations be idempotent and individually
//! transactional rather than relying on sqlx's own migration table format.

use sqlx::PgPool;

pub const MIGRATIONS: &[(&str, &str)] = &[
    ("0001_schema_migrations", r#"
        CREATE TABLE IF NOT EXISTS schema_migrations (
            id TEXT PRIMARY KEY,
            applied_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
    "#),
    ("0002_workflow_definitions", r#"
        CREATE TABLE IF NOT EXISTS workflow_definitions (
            id UUID PRIMARY KEY,
            slug TEXT NOT NULL,
            name TEXT NOT NULL,
            version BIGINT NOT NULL,
            description TEXT,
            steps JSONB NOT NULL,
            triggers JSONB NOT NULL DEFAULT '[]',
            parameters_schema JSONB,
            default_parameters JSONB NOT NULL DEFAULT '{}',
            output_schema JSONB,
            metadata JSONB NOT NULL DEFAULT '{}',
            dag JSONB NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            UNIQUE (slug, version)
        )
    "#),
    ("0003_workflow_runs", r#"
        CREATE TABLE IF NOT EXISTS workflow_runs (
            id UUID PRIMARY KEY,
            workflow_definition_id UUID NOT NULL REFERENCES workflow_definitions(id),
            status TEXT NOT NULL,
            run_key TEXT,
            run_key_normalized TEXT,
            parameters JSONB NOT NULL DEFAULT '{}',
            context JSONB NOT NULL DEFAULT '{}',
            output JSONB,
            error_message TEXT,
            current_step_index INTEGER,
            metrics JSONB,
            triggered_by TEXT NOT NULL,
            trigger JSONB,
            partition_key TEXT,
            claim_owner TEXT,
            current_step_id TEXT,
            started_at TIMESTAMPTZ,
            completed_at TIMESTAMPTZ,
            duration_ms BIGINT,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
    "#),
    ("0004_workflow_runs_run_key_unique", r#"
        CREATE UNIQUE INDEX IF NOT EXISTS workflow_runs_active_run_key_idx
        ON workflow_runs (workflow_definition_id, run_key_normalized)
        WHERE status IN ('pending', 'running') AND run_key_normalized IS NOT NULL
    "#),
    ("0005_workflow_run_steps", r#"
        CREATE TABLE IF NOT EXISTS workflow_run_steps (
            id UUID PRIMARY KEY,
            workflow_run_id UUID NOT NULL REFERENCES workflow_runs(id),
            step_id TEXT NOT NULL,
            fanout_index INTEGER,
            parent_step_id UUID,
            template_step_id TEXT,
            status TEXT NOT NULL,
            attempt INTEGER NOT NULL DEFAULT 0,
            max_attempts INTEGER NOT NULL DEFAULT 1,
            retry_count INTEGER NOT NULL DEFAULT 0,
            claim_owner TEXT,
            claimed_at TIMESTAMPTZ,
            heartbeat_at TIMESTAMPTZ,
            job_run_id UUID,
            input JSONB,
            output JSONB,
            failure_reason TEXT,
            error_message TEXT,
            started_at TIMESTAMPTZ,
            completed_at TIMESTAMPTZ,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            UNIQUE (workflow_run_id, step_id, fanout_index)
        )
    "#),
    ("0006_workflow_asset_declarations", r#"
        CREATE TABLE IF NOT EXISTS workflow_asset_declarations (
            workflow_definition_id UUID NOT NULL REFERENCES workflow_definitions(id),
            step_id TEXT NOT NULL,
            direction TEXT NOT NULL,
            asset_id TEXT NOT NULL,
            asset_schema JSONB,
            freshness JSONB,
            auto_materialize JSONB,
            partitioning JSONB,
            UNIQUE (workflow_definition_id, step_id, direction, asset_id)
        )
    "#),
    ("0007_workflow_run_step_assets", r#"
        CREATE TABLE IF NOT EXISTS workflow_run_step_assets (
            id UUID PRIMARY KEY,
            workflow_definition_id UUID NOT NULL,
            workflow_run_id UUID NOT NULL REFERENCES workflow_runs(id),
            workflow_run_step_id UUID NOT NULL REFERENCES workflow_run_steps(id),
            step_id TEXT NOT NULL,
            asset_id TEXT NOT NULL,
            partition_key TEXT,
            payload JSONB,
            asset_schema JSONB,
            freshness JSONB,
            produced_at TIMESTAMPTZ NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            UNIQUE (workflow_run_step_id, asset_id, COALESCE(partition_key, ''))
        )
    "#),
    ("0008_asset_stale_partitions", r#"
        CREATE TABLE IF NOT EXISTS asset_stale_partitions (
            workflow_definition_id UUID NOT NULL,
            asset_id TEXT NOT NULL,
            partition_key TEXT NOT NULL DEFAULT '',
            requested_by TEXT NOT NULL,
            requested_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            note TEXT,
            PRIMARY KEY (workflow_definition_id, asset_id, partition_key)
        )
    "#),
    ("0009_asset_partition_parameters", r#"
        CREATE TABLE IF NOT EXISTS asset_partition_parameters (
            workflow_definition_id UUID NOT NULL,
            asset_id TEXT NOT NULL,
            partition_key TEXT NOT NULL,
            parameters JSONB NOT NULL,
            source TEXT NOT NULL,
            PRIMARY KEY (workflow_definition_id, asset_id, partition_key)
        )
    "#),
    ("0010_job_bundles", r#"
        CREATE TABLE IF NOT EXISTS job_bundles (
            id UUID PRIMARY KEY,
            slug TEXT NOT NULL UNIQUE,
            display_name TEXT NOT NULL,
            description TEXT,
            latest_version BIGINT,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
    "#),
    ("0011_job_bundle_versions", r#"
        CREATE TABLE IF NOT EXISTS job_bundle_versions (
            id UUID PRIMARY KEY,
            bundle_id UUID NOT NULL REFERENCES job_bundles(id),
            slug TEXT NOT NULL,
            version BIGINT NOT NULL,
            manifest JSONB NOT NULL DEFAULT '{}',
            checksum TEXT NOT NULL,
            capability_flags JSONB NOT NULL DEFAULT '[]',
            artifact_storage TEXT NOT NULL CHECK (artifact_storage IN ('local', 's3')),
            artifact_path TEXT NOT NULL,
            artifact_content_type TEXT,
            artifact_size BIGINT,
            artifact_data BYTEA,
            immutable BOOLEAN NOT NULL DEFAULT true,
            status TEXT NOT NULL CHECK (status IN ('published', 'deprecated')),
            published_by TEXT,
            published_by_kind TEXT,
            published_by_token_hash TEXT,
            published_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            deprecated_at TIMESTAMPTZ,
            UNIQUE (bundle_id, version)
        )
    "#),
    ("0012_schedules", r#"
        CREATE TABLE IF NOT EXISTS schedules (
            id UUID PRIMARY KEY,
            workflow_definition_id UUID NOT NULL REFERENCES workflow_definitions(id),
            cron TEXT NOT NULL,
            timezone TEXT NOT NULL DEFAULT 'UTC',
            start_window TIMESTAMPTZ,
            end_window TIMESTAMPTZ,
            catch_up BOOLEAN NOT NULL DEFAULT false,
            next_run_at TIMESTAMPTZ NOT NULL,
            last_materialized_window TIMESTAMPTZ,
            catchup_cursor TIMESTAMPTZ
        )
    "#),
    ("0013_event_triggers", r#"
        CREATE TABLE IF NOT EXISTS event_triggers (
            id UUID PRIMARY KEY,
            workflow_definition_id UUID NOT NULL REFERENCES workflow_definitions(id),
            event_type TEXT NOT NULL,
            event_source TEXT,
            predicate JSONB,
            throttle_ms BIGINT NOT NULL DEFAULT 0,
            failure_threshold INTEGER NOT NULL DEFAULT 5,
            paused BOOLEAN NOT NULL DEFAULT false,
            paused_reason TEXT,
            last_fired_at TIMESTAMPTZ,
            consecutive_failures INTEGER NOT NULL DEFAULT 0,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
    "#),
    ("0014_trigger_deliveries", r#"
        CREATE TABLE IF NOT EXISTS trigger_deliveries (
            id UUID PRIMARY KEY,
            event_trigger_id UUID NOT NULL REFERENCES event_triggers(id),
            event_id UUID NOT NULL,
            status TEXT NOT NULL,
            workflow_run_id UUID,
            error_message TEXT,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
    "#),
    ("0015_workflow_execution_history", r#"
        CREATE TABLE IF NOT EXISTS workflow_execution_history (
            id UUID PRIMARY KEY,
            workflow_run_id UUID NOT NULL REFERENCES workflow_runs(id),
            workflow_run_step_id UUID,
            event_type TEXT NOT NULL,
            payload JSONB NOT NULL DEFAULT '{}',
            created_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
    "#),
    ("0016_audit_logs", r#"
        CREATE TABLE IF NOT EXISTS audit_logs (
            id UUID PRIMARY KEY,
            actor TEXT NOT NULL,
            action TEXT NOT NULL,
            resource TEXT NOT NULL,
            status TEXT NOT NULL,
            scopes JSONB NOT NULL DEFAULT '[]',
            metadata JSONB NOT NULL DEFAULT '{}',
            created_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
    "#),
    ("0017_workflow_event_producer_samples", r#"
        CREATE TABLE IF NOT EXISTS workflow_event_producer_samples (
            id UUID PRIMARY KEY,
            event_type TEXT NOT NULL,
            source TEXT NOT NULL,
            sample_payload JSONB NOT NULL,
            observed_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
    "#),
    ("0018_workflow_auto_run_claims", r#"
        CREATE TABLE IF NOT EXISTS workflow_auto_run_claims (
            id UUID PRIMARY KEY,
            workflow_definition_id UUID NOT NULL REFERENCES workflow_definitions(id),
            asset_id TEXT NOT NULL,
            partition_key TEXT NOT NULL DEFAULT '',
            workflow_run_id UUID REFERENCES workflow_runs(id),
            consecutive_failures INTEGER NOT NULL DEFAULT 0,
            next_eligible_at TIMESTAMPTZ,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            UNIQUE (workflow_definition_id, asset_id, partition_key)
        )
    "#),
];

pub async fn run(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS schema_migrations (id TEXT PRIMARY KEY, applied_at TIMESTAMPTZ NOT NULL DEFAULT now())",
    )
    .execute(pool)
    .await?;

    for (id, sql) in MIGRATIONS {
        let already_applied: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM schema_migrations WHERE id = $1)")
                .bind(id)
                .fetch_one(pool)
                .await?;
        if already_applied {
            continue;
        }

        let mut tx = pool.begin().await?;
        sqlx::query(sql).execute(&mut *tx).await?;
        sqlx::query("INSERT INTO schema_migrations (id) VALUES ($1) ON CONFLICT DO NOTHING")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        tracing::info!(migration = id, "applied migration");
    }

    Ok(())
}
