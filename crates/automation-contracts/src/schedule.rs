//! The `Schedule` entity and its nested configuration.

use crate::ids::{AuditConfigId, FicheId, ScheduleId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ScheduleType {
    Manual,
    Daily,
    Weekly,
    Monthly,
    Cron,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranscriptionPriority {
    Low,
    Normal,
    High,
}

impl Default for TranscriptionPriority {
    fn default() -> Self {
        TranscriptionPriority::Normal
    }
}

/// The last observed status of the schedule's most recent run. Mirrors
/// `Run.status` with an additional transient `Running` value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LastRunStatus {
    Running,
    Completed,
    Partial,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectionMode {
    Manual,
    Api,
}

/// A date-range selector for API-mode selection. `Custom` carries explicit
/// bounds; the named variants are resolved relative to "now" in the
/// schedule's timezone at run time (see `automation-orchestrator::dates`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DateRange {
    Today,
    Yesterday,
    Last7Days,
    Last30Days,
    Custom { start: String, end: String },
}

/// `Schedule.selection`: what the run operates over.
///
/// Null numeric limits are stored as `None`/unset, never silently coerced to
/// zero: older rows with null numeric limits are treated as unset, not zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionSpec {
    pub mode: SelectionMode,
    pub date_range: Option<DateRange>,
    /// Explicit fiche ids for `mode == Manual`.
    #[serde(default)]
    pub fiche_ids: Vec<FicheId>,
    /// Restrict to these `groupe` codes; `None` means no restriction.
    #[serde(default)]
    pub group_filter: Option<Vec<String>>,
    #[serde(default)]
    pub only_with_recordings: bool,
    #[serde(default)]
    pub only_unaudited: bool,
    pub max_fiches: Option<u32>,
    pub max_recordings_per_fiche: Option<u32>,
    #[serde(default)]
    pub use_rlm: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageFlags {
    pub run_transcription: bool,
    pub skip_if_transcribed: bool,
    #[serde(default)]
    pub transcription_priority: TranscriptionPriority,
    pub run_audits: bool,
    pub use_automatic_audits: bool,
    #[serde(default)]
    pub specific_audit_config_ids: Vec<AuditConfigId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FailurePolicy {
    pub continue_on_error: bool,
    pub retry_failed: bool,
    pub max_retries: u32,
}

impl Default for FailurePolicy {
    fn default() -> Self {
        Self {
            continue_on_error: true,
            retry_failed: true,
            max_retries: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NotificationSettings {
    pub notify_on_complete: bool,
    pub notify_on_error: bool,
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub notify_emails: Vec<String>,
}

/// Structured cron parameters used when `scheduleType != Cron`: exactly one
/// of `cronExpression` or structured fields is used per type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StructuredCronFields {
    pub time_of_day: Option<String>,
    pub day_of_week: Option<u8>,
    pub day_of_month: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub id: ScheduleId,
    pub name: String,
    pub is_active: bool,
    pub schedule_type: ScheduleType,
    pub cron_expression: Option<String>,
    pub timezone: String,
    #[serde(flatten)]
    pub structured_fields: StructuredCronFields,
    pub selection: SelectionSpec,
    pub stage_flags: StageFlags,
    pub failure_policy: FailurePolicy,
    pub notifications: NotificationSettings,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_run_status: Option<LastRunStatus>,
}

impl Schedule {
    /// `MANUAL` schedules are never auto-triggered.
    pub fn is_auto_triggerable(&self) -> bool {
        self.is_active && self.schedule_type != ScheduleType::Manual
    }

    /// Rejects schedules missing required fields for their type (e.g.
    /// `DAILY` without `timeOfDay`).
    pub fn has_required_fields_for_type(&self) -> bool {
        match self.schedule_type {
            ScheduleType::Manual => true,
            ScheduleType::Cron => self.cron_expression.is_some(),
            ScheduleType::Daily => self.structured_fields.time_of_day.is_some(),
            ScheduleType::Weekly => {
                self.structured_fields.time_of_day.is_some()
                    && self.structured_fields.day_of_week.is_some()
            }
            ScheduleType::Monthly => {
                self.structured_fields.time_of_day.is_some()
                    && self.structured_fields.day_of_month.is_some()
            }
        }
    }
}

impl PartialEq for ScheduleType {
    fn eq(&self, other: &Self) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}
impl Eq for ScheduleType {}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_schedule(schedule_type: ScheduleType) -> Schedule {
        Schedule {
            id: ScheduleId::from("sched-1"),
            name: "Nightly QA".into(),
            is_active: true,
            schedule_type,
            cron_expression: None,
            timezone: "Europe/Paris".into(),
            structured_fields: StructuredCronFields::default(),
            selection: SelectionSpec {
                mode: SelectionMode::Api,
                date_range: Some(DateRange::Yesterday),
                fiche_ids: vec![],
                group_filter: None,
                only_with_recordings: true,
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
    fn manual_schedules_are_never_auto_triggered() {
        let s = base_schedule(ScheduleType::Manual);
        assert!(!s.is_auto_triggerable());
    }

    #[test]
    fn daily_requires_time_of_day() {
        let mut s = base_schedule(ScheduleType::Daily);
        assert!(!s.has_required_fields_for_type());
        s.structured_fields.time_of_day = Some("02:00".into());
        assert!(s.has_required_fields_for_type());
    }

    #[test]
    fn cron_requires_expression() {
        let mut s = base_schedule(ScheduleType::Cron);
        assert!(!s.has_required_fields_for_type());
        s.cron_expression = Some("0 2 * * *".into());
        assert!(s.has_required_fields_for_type());
    }

    #[test]
    fn null_numeric_limits_stay_unset() {
        let s = base_schedule(ScheduleType::Daily);
        assert_eq!(s.selection.max_fiches, None);
        let json = serde_json::to_string(&s.selection).unwrap();
        let back: SelectionSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(back.max_fiches, None);
    }
}
