//! Row types as they exist in Postgres, and the conversions into
//! `automation-contracts` domain types. Keeping these separate (rather than
//! deriving `sqlx::FromRow` directly on the domain types) means a schema
//! column rename never leaks into the wire-level contracts shared with
//! `automation-workers`/`automation-orchestrator`.

use automation_contracts::*;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::FromRow;

#[derive(Debug, FromRow)]
pub struct ScheduleRow {
    pub id: String,
    pub name: String,
    pub is_active: bool,
    pub schedule_type: String,
    pub cron_expression: Option<String>,
    pub timezone: String,
    pub time_of_day: Option<String>,
    pub day_of_week: Option<i16>,
    pub day_of_month: Option<i16>,
    pub selection: Value,
    pub stage_flags: Value,
    pub failure_policy: Value,
    pub notifications: Value,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_run_status: Option<String>,
}

impl ScheduleRow {
    pub fn into_domain(self) -> Result<Schedule, serde_json::Error> {
        Ok(Schedule {
            id: ScheduleId::from(self.id),
            name: self.name,
            is_active: self.is_active,
            schedule_type: parse_schedule_type(&self.schedule_type),
            cron_expression: self.cron_expression,
            timezone: self.timezone,
            structured_fields: StructuredCronFields {
                time_of_day: self.time_of_day,
                day_of_week: self.day_of_week.map(|v| v as u8),
                day_of_month: self.day_of_month.map(|v| v as u8),
            },
            selection: serde_json::from_value(self.selection)?,
            stage_flags: serde_json::from_value(self.stage_flags)?,
            failure_policy: serde_json::from_value(self.failure_policy)?,
            notifications: serde_json::from_value(self.notifications)?,
            last_run_at: self.last_run_at,
            last_run_status: self
                .last_run_status
                .as_deref()
                .map(parse_last_run_status),
        })
    }
}

fn parse_schedule_type(value: &str) -> ScheduleType {
    match value {
        "DAILY" => ScheduleType::Daily,
        "WEEKLY" => ScheduleType::Weekly,
        "MONTHLY" => ScheduleType::Monthly,
        "CRON" => ScheduleType::Cron,
        _ => ScheduleType::Manual,
    }
}

fn parse_last_run_status(value: &str) -> LastRunStatus {
    match value {
        "completed" => LastRunStatus::Completed,
        "partial" => LastRunStatus::Partial,
        "failed" => LastRunStatus::Failed,
        _ => LastRunStatus::Running,
    }
}

pub fn last_run_status_db_str(status: LastRunStatus) -> &'static str {
    match status {
        LastRunStatus::Running => "running",
        LastRunStatus::Completed => "completed",
        LastRunStatus::Partial => "partial",
        LastRunStatus::Failed => "failed",
    }
}

pub fn run_status_db_str(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Running => "running",
        RunStatus::Completed => "completed",
        RunStatus::Partial => "partial",
        RunStatus::Failed => "failed",
    }
}

pub fn parse_run_status(value: &str) -> RunStatus {
    match value {
        "completed" => RunStatus::Completed,
        "partial" => RunStatus::Partial,
        "failed" => RunStatus::Failed,
        _ => RunStatus::Running,
    }
}

#[derive(Debug, FromRow)]
pub struct RunRow {
    pub id: i64,
    pub schedule_id: String,
    pub status: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub total_fiches: i32,
    pub successful_fiches: i32,
    pub failed_fiches: i32,
    pub ignored_fiches: i32,
    pub transcriptions_run: i32,
    pub audits_run: i32,
    pub error_message: Option<String>,
    pub result_summary: Value,
    pub payload_snapshot: Value,
}

impl RunRow {
    pub fn into_domain(self) -> Result<Run, serde_json::Error> {
        Ok(Run {
            id: BigId(self.id),
            schedule_id: ScheduleId::from(self.schedule_id),
            status: parse_run_status(&self.status),
            started_at: self.started_at,
            completed_at: self.completed_at,
            duration_ms: self.duration_ms,
            total_fiches: self.total_fiches,
            successful_fiches: self.successful_fiches,
            failed_fiches: self.failed_fiches,
            ignored_fiches: self.ignored_fiches,
            transcriptions_run: self.transcriptions_run,
            audits_run: self.audits_run,
            error_message: self.error_message,
            result_summary: serde_json::from_value(self.result_summary)?,
            payload_snapshot: self.payload_snapshot,
        })
    }
}

#[derive(Debug, FromRow)]
pub struct FicheCacheRow {
    pub id: i64,
    pub fiche_id: String,
    pub cle: Option<String>,
    pub groupe: Option<String>,
    pub details_success: Option<bool>,
    pub details_message: Option<String>,
    pub recordings_count: Option<i32>,
    pub has_recordings: bool,
    pub raw_data: Value,
    pub expires_at: Option<DateTime<Utc>>,
}

impl FicheCacheRow {
    pub fn into_domain(self) -> FicheCache {
        FicheCache {
            id: BigId(self.id),
            fiche_id: FicheId::from(self.fiche_id),
            cle: self.cle,
            groupe: self.groupe,
            details_success: self.details_success,
            details_message: self.details_message,
            recordings_count: self.recordings_count,
            has_recordings: self.has_recordings,
            raw_data: self.raw_data,
            expires_at: self.expires_at,
        }
    }
}

#[derive(Debug, FromRow)]
pub struct RecordingRow {
    pub id: i64,
    pub fiche_cache_id: i64,
    pub external_url: String,
    pub has_transcription: bool,
    pub transcription_id: Option<String>,
}

impl RecordingRow {
    pub fn into_domain(self) -> Recording {
        Recording {
            id: BigId(self.id),
            fiche_cache_id: BigId(self.fiche_cache_id),
            external_url: self.external_url,
            has_transcription: self.has_transcription,
            transcription_id: self.transcription_id,
        }
    }
}

pub fn audit_status_db_str(status: AuditStatus) -> &'static str {
    match status {
        AuditStatus::Pending => "pending",
        AuditStatus::Running => "running",
        AuditStatus::Completed => "completed",
        AuditStatus::Failed => "failed",
    }
}

pub fn parse_audit_status(value: &str) -> AuditStatus {
    match value {
        "running" => AuditStatus::Running,
        "completed" => AuditStatus::Completed,
        "failed" => AuditStatus::Failed,
        _ => AuditStatus::Pending,
    }
}
