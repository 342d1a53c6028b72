//! Event bus payloads and deterministic id construction.

use crate::ids::{AuditConfigId, FicheId, RunId, ScheduleId};
use crate::schedule::TranscriptionPriority;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// `automation/run` (in).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationRunEvent {
    pub schedule_id: ScheduleId,
    pub due_at: Option<DateTime<Utc>>,
    pub override_fiche_selection: Option<Vec<FicheId>>,
}

/// `fiche/fetch` (out -> Fiche-Worker). Mirrors the Fiche-Worker contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FicheFetchEvent {
    pub fiche_id: FicheId,
    pub audit_config_id: Option<AuditConfigId>,
    pub schedule_id: ScheduleId,
    pub run_id: RunId,
    pub run_transcription: bool,
    pub run_audits: bool,
    pub max_recordings: u32,
    pub only_with_recordings: bool,
    pub use_rlm: bool,
}

/// `fiche/transcribe` (out -> transcription engine).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FicheTranscribeEvent {
    pub fiche_id: FicheId,
    pub run_id: RunId,
    pub recording_external_url: String,
    pub priority: TranscriptionPriority,
}

/// `audit/run` (out -> audit engine).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRunEvent {
    pub fiche_id: FicheId,
    pub audit_config_id: AuditConfigId,
    pub run_id: RunId,
}

/// `automation/completed` / `automation/failed` (out).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationTerminalEvent {
    pub run_id: RunId,
    pub schedule_id: ScheduleId,
    pub status: crate::run::RunStatus,
}

/// Realtime pub/sub channel event names, keyed by
/// `job_id = "automation-run-<runId>"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RealtimeEventKind {
    RunStarted,
    RunSelection,
    RunProgress,
    RunCompleted,
    RunFailed,
}

impl RealtimeEventKind {
    pub fn channel_name(self) -> &'static str {
        match self {
            RealtimeEventKind::RunStarted => "automation.run.started",
            RealtimeEventKind::RunSelection => "automation.run.selection",
            RealtimeEventKind::RunProgress => "automation.run.progress",
            RealtimeEventKind::RunCompleted => "automation.run.completed",
            RealtimeEventKind::RunFailed => "automation.run.failed",
        }
    }
}

pub fn realtime_job_id(run_id: RunId) -> String {
    format!("automation-run-{}", run_id)
}

/// Webhook notification payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub schedule_id: ScheduleId,
    pub schedule_name: String,
    pub run_id: RunId,
    pub status: crate::run::RunStatus,
    pub duration_seconds: f64,
    pub total_fiches: i32,
    pub successful_fiches: i32,
    pub failed_fiches: i32,
    pub ignored_fiches: i32,
    pub transcriptions_run: i32,
    pub audits_run: i32,
    pub failures: Vec<crate::run::FicheOutcome>,
}

/// Deterministic id construction for at-most-once dispatch. A retried
/// dispatch wave uses `-retry-<n>` suffixes; every call site that dispatches
/// a retry wave must increment its retry counter before building this id,
/// never after, so the dedup id is observable.
pub fn deterministic_event_id(run_id: RunId, stage: &str, fiche_id: &str, retry: u32) -> String {
    if retry == 0 {
        format!("run-{}-{}-{}", run_id, stage, fiche_id)
    } else {
        format!("run-{}-{}-{}-retry-{}", run_id, stage, fiche_id, retry)
    }
}

/// `automation-schedule-<id>-<dueAtMs>`.
pub fn deterministic_schedule_run_id(schedule_id: &ScheduleId, due_at: DateTime<Utc>) -> String {
    format!("automation-schedule-{}-{}", schedule_id, due_at.timestamp_millis())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_event_id_without_retry_has_no_suffix() {
        let id = deterministic_event_id(RunId(1), "fetch", "A", 0);
        assert_eq!(id, "run-1-fetch-A");
    }

    #[test]
    fn deterministic_event_id_with_retry_has_suffix() {
        let id = deterministic_event_id(RunId(1), "fetch", "A", 2);
        assert_eq!(id, "run-1-fetch-A-retry-2");
    }

    #[test]
    fn schedule_run_id_is_stable_for_same_due_at() {
        let schedule_id = ScheduleId::from("s1");
        let due_at = DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let a = deterministic_schedule_run_id(&schedule_id, due_at);
        let b = deterministic_schedule_run_id(&schedule_id, due_at);
        assert_eq!(a, b);
    }
}
