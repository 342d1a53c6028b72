//! Schema migrations: an embedded-SQL, versioned-table runner scoped down to
//! the tables this service owns.

use crate::client::DatabaseClient;
use anyhow::{Context, Result};
use tracing::info;

/// One forward-only migration. Covers `AutomationSchedule`,
/// `AutomationRun`, `AutomationLog`, `FicheCache`, `Recording`, `Audit`,
/// `AuditConfig`, plus the durable-step checkpoint table owned by
/// `automation-events`.
const MIGRATIONS: &[(&str, &str)] = &[
    ("0001_schema_migrations", SCHEMA_MIGRATIONS_TABLE),
    ("0002_automation_schedule", AUTOMATION_SCHEDULE_TABLE),
    ("0003_automation_run", AUTOMATION_RUN_TABLE),
    ("0004_automation_log", AUTOMATION_LOG_TABLE),
    ("0005_audit_config", AUDIT_CONFIG_TABLE),
    ("0006_fiche_cache", FICHE_CACHE_TABLE),
    ("0007_recording", RECORDING_TABLE),
    ("0008_audit", AUDIT_TABLE),
    ("0009_workflow_checkpoint", WORKFLOW_CHECKPOINT_TABLE),
];

const SCHEMA_MIGRATIONS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS schema_migrations (
        id TEXT PRIMARY KEY,
        applied_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
"#;

const AUTOMATION_SCHEDULE_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS automation_schedule (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        is_active BOOLEAN NOT NULL DEFAULT true,
        schedule_type TEXT NOT NULL,
        cron_expression TEXT,
        timezone TEXT NOT NULL,
        time_of_day TEXT,
        day_of_week SMALLINT,
        day_of_month SMALLINT,
        selection JSONB NOT NULL,
        stage_flags JSONB NOT NULL,
        failure_policy JSONB NOT NULL,
        notifications JSONB NOT NULL,
        last_run_at TIMESTAMPTZ,
        last_run_status TEXT
    )
"#;

const AUTOMATION_RUN_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS automation_run (
        id BIGSERIAL PRIMARY KEY,
        schedule_id TEXT NOT NULL REFERENCES automation_schedule(id),
        status TEXT NOT NULL,
        started_at TIMESTAMPTZ NOT NULL,
        completed_at TIMESTAMPTZ,
        duration_ms BIGINT,
        total_fiches INT NOT NULL DEFAULT 0,
        successful_fiches INT NOT NULL DEFAULT 0,
        failed_fiches INT NOT NULL DEFAULT 0,
        ignored_fiches INT NOT NULL DEFAULT 0,
        transcriptions_run INT NOT NULL DEFAULT 0,
        audits_run INT NOT NULL DEFAULT 0,
        error_message TEXT,
        result_summary JSONB NOT NULL DEFAULT '{"successful":[],"failed":[],"ignored":[]}',
        payload_snapshot JSONB NOT NULL DEFAULT '{}'
    )
"#;

const AUTOMATION_LOG_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS automation_log (
        id BIGSERIAL PRIMARY KEY,
        run_id BIGINT NOT NULL REFERENCES automation_run(id),
        level TEXT NOT NULL,
        message TEXT NOT NULL,
        metadata JSONB NOT NULL DEFAULT '{}',
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
"#;

const AUDIT_CONFIG_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS audit_config (
        id TEXT PRIMARY KEY,
        system_prompt TEXT NOT NULL,
        control_steps JSONB NOT NULL DEFAULT '[]',
        is_automatic BOOLEAN NOT NULL DEFAULT false
    )
"#;

const FICHE_CACHE_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS fiche_cache (
        id BIGSERIAL PRIMARY KEY,
        fiche_id TEXT NOT NULL UNIQUE,
        cle TEXT,
        groupe TEXT,
        details_success BOOLEAN,
        details_message TEXT,
        recordings_count INT,
        has_recordings BOOLEAN NOT NULL DEFAULT false,
        raw_data JSONB NOT NULL DEFAULT '{}',
        expires_at TIMESTAMPTZ
    )
"#;

const RECORDING_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS recording (
        id BIGSERIAL PRIMARY KEY,
        fiche_cache_id BIGINT NOT NULL REFERENCES fiche_cache(id),
        external_url TEXT NOT NULL,
        has_transcription BOOLEAN NOT NULL DEFAULT false,
        transcription_id TEXT,
        UNIQUE (fiche_cache_id, external_url)
    )
"#;

const AUDIT_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS audit (
        id BIGSERIAL PRIMARY KEY,
        fiche_cache_id BIGINT NOT NULL REFERENCES fiche_cache(id),
        audit_config_id TEXT NOT NULL REFERENCES audit_config(id),
        status TEXT NOT NULL,
        automation_run_id BIGINT REFERENCES automation_run(id),
        is_latest BOOLEAN NOT NULL DEFAULT false,
        error_message TEXT,
        result JSONB NOT NULL DEFAULT '{}'
    )
"#;

/// Owned by `automation-events`'s durable-step runtime: memoized
/// results keyed by the logical step name within a run. `run_id` is
/// intentionally NOT a foreign key into `automation_run(id)`: the
/// `StepContext` driving one event's execution is constructed with a
/// provisional, deterministically-derived id before the real `Run` row
/// exists (see `automation-service`'s `process_run_event`), so this column
/// only needs to be a stable per-execution namespace key, not a valid
/// reference.
const WORKFLOW_CHECKPOINT_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS workflow_checkpoint (
        run_id BIGINT NOT NULL,
        step_name TEXT NOT NULL,
        result JSONB NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        PRIMARY KEY (run_id, step_name)
    )
"#;

pub struct MigrationManager<'a> {
    client: &'a DatabaseClient,
}

impl<'a> MigrationManager<'a> {
    pub fn new(client: &'a DatabaseClient) -> Self {
        Self { client }
    }

    pub async fn run_pending(&self) -> Result<Vec<String>> {
        let mut applied = Vec::new();
        for (id, ddl) in MIGRATIONS {
            sqlx::query(ddl)
                .execute(self.client.pool())
                .await
                .with_context(|| format!("failed applying migration {id}"))?;

            if *id != "0001_schema_migrations" {
                sqlx::query(
                    "INSERT INTO schema_migrations (id) VALUES ($1) ON CONFLICT (id) DO NOTHING",
                )
                .bind(id)
                .execute(self.client.pool())
                .await
                .with_context(|| format!("failed recording migration {id}"))?;
            }
            applied.push((*id).to_string());
        }
        info!(count = applied.len(), "migrations applied");
        Ok(applied)
    }
}
