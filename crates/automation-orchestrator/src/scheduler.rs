//! The Scheduler: a single cron-tick entry point that decides which
//! schedules are due, reconciles stale `running` Runs, and emits
//! `automation/run` events.
//!
//! Scheduler tick is single-flight (function-level concurrency limit = 1).
//! `Scheduler::tick` enforces this itself with an internal mutex rather than
//! relying on the caller (a cron driver in `automation-service`) to never
//! overlap invocations.

use crate::cron::compute_due_at;
use automation_contracts::{
    deterministic_schedule_run_id, AutomationError, AutomationRunEvent, LastRunStatus, Schedule,
    ScheduleId,
};
use automation_config::OrchestrationConfig;
use automation_database::Repository;
use automation_events::{EventBus, OutboundEvent};
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// One tick's outcome, returned for logging/metrics by the caller.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SchedulerTickReport {
    pub evaluated: usize,
    pub reconciled_stale: Vec<ScheduleId>,
    pub dispatched: Vec<ScheduleId>,
    pub newly_published: usize,
}

pub struct Scheduler<'a> {
    repository: &'a Repository,
    event_bus: &'a dyn EventBus,
    config: &'a OrchestrationConfig,
    /// Single-flight guard. Held for the whole tick, not just the
    /// dispatch step, so a slow tick can never overlap the next one.
    single_flight: Mutex<()>,
}

impl<'a> Scheduler<'a> {
    pub fn new(
        repository: &'a Repository,
        event_bus: &'a dyn EventBus,
        config: &'a OrchestrationConfig,
    ) -> Self {
        Self {
            repository,
            event_bus,
            config,
            single_flight: Mutex::new(()),
        }
    }

    /// Run once per cron tick (default every minute).
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<SchedulerTickReport, AutomationError> {
        let _guard = self.single_flight.lock().await;

        let schedules = self
            .repository
            .load_active_schedules()
            .await
            .map_err(|e| AutomationError::Repository(e.to_string()))?;

        let mut report = SchedulerTickReport {
            evaluated: schedules.len(),
            ..Default::default()
        };
        let mut due_events = Vec::new();

        for schedule in &schedules {
            match self.evaluate_one(schedule, now).await? {
                Evaluation::Skipped => {}
                Evaluation::Reconciled => report.reconciled_stale.push(schedule.id.clone()),
                Evaluation::ReconciledAndDue { due_at } => {
                    report.reconciled_stale.push(schedule.id.clone());
                    due_events.push(self.build_run_event(schedule, due_at));
                    report.dispatched.push(schedule.id.clone());
                }
                Evaluation::Due { due_at } => {
                    due_events.push(self.build_run_event(schedule, due_at));
                    report.dispatched.push(schedule.id.clone());
                }
            }
        }

        // Emit all due `automation/run` events in one call, chunked to
        // respect provider send limits.
        report.newly_published = self
            .event_bus
            .publish_chunked(due_events, self.config.send_event_chunk_size as usize)
            .await?;

        // Immediately mark each dispatched schedule lastRunAt=dueAt,
        // lastRunStatus=running before returning, to close the race with
        // the next tick. Done after publish so a crash between publish and
        // this write merely re-fires an already-deduped
        // event on the next tick rather than silently dropping the run.
        for schedule in &schedules {
            if !report.dispatched.contains(&schedule.id) {
                continue;
            }
            if let Some(due_at) = self.dispatched_due_at(schedule, now).await? {
                self.repository
                    .mark_schedule_triggered(&schedule.id, due_at)
                    .await
                    .map_err(|e| AutomationError::Repository(e.to_string()))?;
            }
        }

        Ok(report)
    }

    async fn evaluate_one(
        &self,
        schedule: &Schedule,
        now: DateTime<Utc>,
    ) -> Result<Evaluation, AutomationError> {
        let is_stale = schedule.last_run_status == Some(LastRunStatus::Running)
            && is_stale_running(schedule, now, self.config.stale_threshold_ms());

        if schedule.last_run_status == Some(LastRunStatus::Running) && !is_stale {
            // Non-overlap: a running Run younger than the stale threshold
            // blocks this schedule outright.
            return Ok(Evaluation::Skipped);
        }

        let mut reconciled = false;
        if is_stale {
            let age_minutes = schedule
                .last_run_at
                .map(|last| (now - last).num_minutes())
                .unwrap_or(0);
            let reason = format!("marked stale by scheduler after {age_minutes}m");
            warn!(schedule_id = %schedule.id, age_minutes, "reconciling stale running run");
            self.repository
                .mark_stale_runs_for_schedule(&schedule.id, now, &reason)
                .await
                .map_err(|e| AutomationError::Repository(e.to_string()))?;
            self.repository
                .update_schedule_last_run_status(&schedule.id, LastRunStatus::Failed)
                .await
                .map_err(|e| AutomationError::Repository(e.to_string()))?;
            reconciled = true;
            // Proceed to evaluate due-ness in the same tick.
        }

        let due_at = due_at_for(schedule, self.config.scheduler_window_minutes, now)?;
        Ok(match (reconciled, due_at) {
            (true, Some(due_at)) => {
                info!(schedule_id = %schedule.id, %due_at, "schedule is due (after stale reconciliation)");
                Evaluation::ReconciledAndDue { due_at }
            }
            (true, None) => Evaluation::Reconciled,
            (false, Some(due_at)) => {
                info!(schedule_id = %schedule.id, %due_at, "schedule is due");
                Evaluation::Due { due_at }
            }
            (false, None) => Evaluation::Skipped,
        })
    }

    /// Re-derives the `due_at` used to build the dispatched event so the
    /// post-publish `mark_schedule_triggered` write uses the exact same
    /// timestamp as the event id - recomputing instead of threading it
    /// through `SchedulerTickReport` keeps that report a plain value type.
    async fn dispatched_due_at(
        &self,
        schedule: &Schedule,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, AutomationError> {
        due_at_for(schedule, self.config.scheduler_window_minutes, now)
    }

    fn build_run_event(&self, schedule: &Schedule, due_at: DateTime<Utc>) -> OutboundEvent {
        let event = AutomationRunEvent {
            schedule_id: schedule.id.clone(),
            due_at: Some(due_at),
            override_fiche_selection: None,
        };
        let id = deterministic_schedule_run_id(&schedule.id, due_at);
        OutboundEvent::new(id, "automation/run", serde_json::to_value(&event).unwrap_or_default())
    }
}

enum Evaluation {
    Skipped,
    Reconciled,
    Due { due_at: DateTime<Utc> },
    ReconciledAndDue { due_at: DateTime<Utc> },
}

/// age = now - lastRunAt; stale once age >= the stale threshold.
/// Pure so it is unit-testable without a repository.
fn is_stale_running(schedule: &Schedule, now: DateTime<Utc>, stale_threshold_ms: i64) -> bool {
    let last_run_at = schedule.last_run_at.unwrap_or(now);
    (now - last_run_at).num_milliseconds() >= stale_threshold_ms
}

/// Resolves the effective cron expression, finds the most recent fire time
/// inside the trailing window, and gates on `lastRunAt < dueAt`. Pure aside
/// from the cron/timezone computation in [`compute_due_at`], so the
/// due-ness decision itself is testable without a repository or event bus.
fn due_at_for(
    schedule: &Schedule,
    window_minutes: u32,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, AutomationError> {
    if !schedule.is_auto_triggerable() || !schedule.has_required_fields_for_type() {
        return Ok(None);
    }
    let due_at = match compute_due_at(schedule, window_minutes, now)? {
        Some(due_at) => due_at,
        None => return Ok(None),
    };
    let already_run = schedule.last_run_at.map(|last| last >= due_at).unwrap_or(false);
    if already_run {
        return Ok(None);
    }
    Ok(Some(due_at))
}

#[cfg(test)]
mod tests {
    use super::*;
    use automation_contracts::{
        DateRange, FailurePolicy, NotificationSettings, ScheduleType, SelectionMode, SelectionSpec,
        StageFlags, StructuredCronFields, TranscriptionPriority,
    };
    use chrono::TimeZone;

    fn daily_schedule(id: &str) -> Schedule {
        Schedule {
            id: ScheduleId::from(id),
            name: "nightly".to_string(),
            is_active: true,
            schedule_type: ScheduleType::Daily,
            cron_expression: None,
            timezone: "UTC".to_string(),
            structured_fields: StructuredCronFields {
                time_of_day: Some("02:00".to_string()),
                day_of_week: None,
                day_of_month: None,
            },
            selection: SelectionSpec {
                mode: SelectionMode::Api,
                date_range: Some(DateRange::Yesterday),
                fiche_ids: vec![],
                group_filter: None,
                only_with_recordings: false,
                only_unaudited: false,
                max_fiches: None,
                max_recordings_per_fiche: None,
                use_rlm: false,
            },
            stage_flags: StageFlags {
                run_transcription: true,
                skip_if_transcribed: true,
                transcription_priority: TranscriptionPriority::Normal,
                run_audits: true,
                use_automatic_audits: true,
                specific_audit_config_ids: vec![],
            },
            failure_policy: FailurePolicy::default(),
            notifications: NotificationSettings::default(),
            last_run_at: None,
            last_run_status: None,
        }
    }

    #[test]
    fn manual_schedules_are_never_due() {
        let mut schedule = daily_schedule("s1");
        schedule.schedule_type = ScheduleType::Manual;
        let now = chrono::Utc.with_ymd_and_hms(2026, 1, 1, 2, 5, 0).unwrap();
        assert_eq!(due_at_for(&schedule, 20, now).unwrap(), None);
    }

    #[test]
    fn schedule_missing_required_fields_is_never_due() {
        let mut schedule = daily_schedule("s1");
        schedule.structured_fields.time_of_day = None;
        let now = chrono::Utc.with_ymd_and_hms(2026, 1, 1, 2, 5, 0).unwrap();
        assert_eq!(due_at_for(&schedule, 20, now).unwrap(), None);
    }

    #[test]
    fn due_once_inside_the_window_then_not_due_again_after_last_run_at_advances() {
        let mut schedule = daily_schedule("s1");
        let now = chrono::Utc.with_ymd_and_hms(2026, 1, 1, 2, 5, 0).unwrap();
        let due = due_at_for(&schedule, 20, now).unwrap();
        assert!(due.is_some());

        // At-most-once dispatch: once lastRunAt is advanced to (or past)
        // that fire time, the same tick parameters never fire it again.
        schedule.last_run_at = due;
        assert_eq!(due_at_for(&schedule, 20, now).unwrap(), None);
    }

    #[test]
    fn not_due_outside_the_trailing_window() {
        let schedule = daily_schedule("s1");
        let now = chrono::Utc.with_ymd_and_hms(2026, 1, 1, 3, 0, 0).unwrap();
        assert_eq!(due_at_for(&schedule, 5, now).unwrap(), None);
    }

    #[test]
    fn running_schedule_younger_than_stale_threshold_is_not_stale() {
        let mut schedule = daily_schedule("s1");
        let now = chrono::Utc.with_ymd_and_hms(2026, 1, 1, 8, 0, 0).unwrap();
        schedule.last_run_at = Some(now - chrono::Duration::hours(1));
        schedule.last_run_status = Some(LastRunStatus::Running);
        assert!(!is_stale_running(&schedule, now, 5 * 60 * 60 * 1000));
    }

    #[test]
    fn running_schedule_older_than_stale_threshold_is_stale() {
        // lastRunAt=now-6h, staleThreshold=5h30m.
        let mut schedule = daily_schedule("s1");
        let now = chrono::Utc.with_ymd_and_hms(2026, 1, 1, 8, 0, 0).unwrap();
        schedule.last_run_at = Some(now - chrono::Duration::hours(6));
        schedule.last_run_status = Some(LastRunStatus::Running);
        let threshold_ms = 5 * 60 * 60 * 1000 + 30 * 60 * 1000;
        assert!(is_stale_running(&schedule, now, threshold_ms));
    }

    #[test]
    fn report_default_is_empty() {
        let report = SchedulerTickReport::default();
        assert_eq!(report.evaluated, 0);
        assert!(report.dispatched.is_empty());
    }
}
