//! Turns a Schedule's type-specific fields into a cron expression and
//! resolves the most recent due fire time.

use automation_contracts::{AutomationError, Schedule, ScheduleType};
use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;
use std::str::FromStr;

/// `Manual` schedules are never auto-triggered, so they have
/// no effective cron expression at all; `Cron` uses the stored expression
/// verbatim; `Daily`/`Weekly`/`Monthly` synthesize one from `timeOfDay` plus
/// `dayOfWeek`/`dayOfMonth`.
pub fn resolve_effective_cron_expression(schedule: &Schedule) -> Result<String, AutomationError> {
    match schedule.schedule_type {
        ScheduleType::Manual => Err(AutomationError::Config(
            "manual schedules have no cron expression".to_string(),
        )),
        ScheduleType::Cron => schedule
            .cron_expression
            .clone()
            .map(|expr| normalize_cron_expression(&expr))
            .ok_or_else(|| AutomationError::Config("cron schedule missing cronExpression".to_string())),
        ScheduleType::Daily => {
            let (minute, hour) = parse_time_of_day(schedule.structured_fields.time_of_day.as_deref())?;
            Ok(format!("0 {minute} {hour} * * *"))
        }
        ScheduleType::Weekly => {
            let (minute, hour) = parse_time_of_day(schedule.structured_fields.time_of_day.as_deref())?;
            let day_of_week = schedule.structured_fields.day_of_week.ok_or_else(|| {
                AutomationError::Config("weekly schedule missing dayOfWeek".to_string())
            })?;
            Ok(format!("0 {minute} {hour} * * {day_of_week}"))
        }
        ScheduleType::Monthly => {
            let (minute, hour) = parse_time_of_day(schedule.structured_fields.time_of_day.as_deref())?;
            let day_of_month = schedule.structured_fields.day_of_month.ok_or_else(|| {
                AutomationError::Config("monthly schedule missing dayOfMonth".to_string())
            })?;
            Ok(format!("0 {minute} {hour} {day_of_month} * *"))
        }
    }
}

/// `HH:MM` -> `(minute, hour)`, the order the sec-first cron strings above
/// need them in.
fn parse_time_of_day(time_of_day: Option<&str>) -> Result<(u32, u32), AutomationError> {
    let time_of_day = time_of_day
        .ok_or_else(|| AutomationError::Config("schedule missing timeOfDay".to_string()))?;
    let (hour, minute) = time_of_day.split_once(':').ok_or_else(|| {
        AutomationError::Config(format!("timeOfDay {time_of_day:?} is not HH:MM"))
    })?;
    let hour: u32 = hour
        .parse()
        .map_err(|_| AutomationError::Config(format!("invalid hour in timeOfDay {time_of_day:?}")))?;
    let minute: u32 = minute
        .parse()
        .map_err(|_| AutomationError::Config(format!("invalid minute in timeOfDay {time_of_day:?}")))?;
    Ok((minute, hour))
}

/// The `cron` crate requires a seconds field; user-supplied 5-field
/// expressions (the POSIX convention `cronExpression` is stored in) get a
/// leading `0 ` so they mean "at second zero" rather than failing to parse.
pub fn normalize_cron_expression(expression: &str) -> String {
    let field_count = expression.split_whitespace().count();
    if field_count == 5 {
        format!("0 {expression}")
    } else {
        expression.to_string()
    }
}

/// The most recent fire time within the trailing window that is still
/// <= now, evaluated in the schedule's timezone. Returns
/// `None` if nothing fired inside the window, so the caller can treat it as
/// not due rather than an error.
pub fn compute_due_at(
    schedule: &Schedule,
    window_minutes: u32,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, AutomationError> {
    let expression = resolve_effective_cron_expression(schedule)?;
    let cron_schedule = CronSchedule::from_str(&expression)
        .map_err(|e| AutomationError::Config(format!("invalid cron expression {expression:?}: {e}")))?;

    let tz: Tz = schedule
        .timezone
        .parse()
        .map_err(|_| AutomationError::Config(format!("invalid timezone {:?}", schedule.timezone)))?;

    let now_tz = now.with_timezone(&tz);
    let window_start = now_tz - chrono::Duration::minutes(window_minutes as i64);

    let due = cron_schedule
        .after(&window_start)
        .take_while(|fire| *fire <= now_tz)
        .last();

    Ok(due.map(|fire| fire.with_timezone(&Utc)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use automation_contracts::{
        DateRange, FailurePolicy, NotificationSettings, ScheduleId, SelectionMode, SelectionSpec,
        StageFlags, StructuredCronFields, TranscriptionPriority,
    };

    fn base_schedule(schedule_type: ScheduleType) -> Schedule {
        Schedule {
            id: ScheduleId::from("s1"),
            name: "nightly".to_string(),
            is_active: true,
            schedule_type,
            cron_expression: None,
            timezone: "UTC".to_string(),
            structured_fields: StructuredCronFields {
                time_of_day: Some("02:30".to_string()),
                day_of_week: Some(1),
                day_of_month: Some(15),
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
    fn manual_schedules_have_no_cron_expression() {
        let schedule = base_schedule(ScheduleType::Manual);
        assert!(resolve_effective_cron_expression(&schedule).is_err());
    }

    #[test]
    fn daily_builds_seconds_first_expression() {
        let schedule = base_schedule(ScheduleType::Daily);
        assert_eq!(resolve_effective_cron_expression(&schedule).unwrap(), "0 30 2 * * *");
    }

    #[test]
    fn weekly_includes_day_of_week() {
        let schedule = base_schedule(ScheduleType::Weekly);
        assert_eq!(resolve_effective_cron_expression(&schedule).unwrap(), "0 30 2 * * 1");
    }

    #[test]
    fn monthly_includes_day_of_month() {
        let schedule = base_schedule(ScheduleType::Monthly);
        assert_eq!(resolve_effective_cron_expression(&schedule).unwrap(), "0 30 2 15 * *");
    }

    #[test]
    fn five_field_cron_expressions_get_a_leading_seconds_field() {
        assert_eq!(normalize_cron_expression("*/5 * * * *"), "0 */5 * * * *");
        assert_eq!(normalize_cron_expression("0 */5 * * * *"), "0 */5 * * * *");
    }

    #[test]
    fn compute_due_at_finds_the_most_recent_fire_inside_the_window() {
        let mut schedule = base_schedule(ScheduleType::Cron);
        schedule.cron_expression = Some("*/5 * * * *".to_string());
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 12, 6, 0).unwrap();
        let due = compute_due_at(&schedule, 20, now).unwrap();
        assert_eq!(due, Some(Utc.with_ymd_and_hms(2026, 1, 1, 12, 5, 0).unwrap()));
    }

    #[test]
    fn compute_due_at_returns_none_when_nothing_fired_in_window() {
        let mut schedule = base_schedule(ScheduleType::Cron);
        schedule.cron_expression = Some("0 0 1 1 *".to_string());
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 12, 6, 0).unwrap();
        let due = compute_due_at(&schedule, 5, now).unwrap();
        assert_eq!(due, None);
    }
}
