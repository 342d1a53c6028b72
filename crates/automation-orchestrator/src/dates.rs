//! Resolves a schedule's `selection.dateRange` into the ordered list of
//! calendar days the Run-Orchestrator's API-mode path operates over. For
//! example, a DAILY 02:00 Europe/Paris schedule with `dateRange=yesterday`
//! resolves to `dates=["09/03/2025"]` when it fires on 2025-03-10.

use automation_contracts::{AutomationError, DateRange};
use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;

/// Resolves `date_range` to an ascending list of local calendar dates, as
/// observed at `now` in `timezone`. Dates are day-of-month in the
/// schedule's own timezone, not UTC — a schedule in `Europe/Paris` firing
/// just after midnight still resolves "yesterday" against the Paris date.
pub fn resolve_date_range(
    date_range: &DateRange,
    timezone: &str,
    now: DateTime<Utc>,
) -> Result<Vec<NaiveDate>, AutomationError> {
    let tz: Tz = timezone
        .parse()
        .map_err(|_| AutomationError::Config(format!("invalid timezone: {timezone}")))?;
    let today = now.with_timezone(&tz).date_naive();

    let dates = match date_range {
        DateRange::Today => vec![today],
        DateRange::Yesterday => vec![today - chrono::Duration::days(1)],
        DateRange::Last7Days => ascending_range(today - chrono::Duration::days(6), today),
        DateRange::Last30Days => ascending_range(today - chrono::Duration::days(29), today),
        DateRange::Custom { start, end } => {
            let start = parse_iso_date(start)?;
            let end = parse_iso_date(end)?;
            if end < start {
                return Err(AutomationError::Config(
                    "custom date range end precedes start".to_string(),
                ));
            }
            ascending_range(start, end)
        }
    };

    Ok(dates)
}

fn ascending_range(start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
    let mut dates = Vec::new();
    let mut cursor = start;
    while cursor <= end {
        dates.push(cursor);
        cursor += chrono::Duration::days(1);
    }
    dates
}

fn parse_iso_date(value: &str) -> Result<NaiveDate, AutomationError> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map_err(|_| AutomationError::Config(format!("invalid custom date range bound: {value}")))
}

/// `DD/MM/YYYY`, the CRM's documented date format.
pub fn format_ddmmyyyy(date: NaiveDate) -> String {
    date.format("%d/%m/%Y").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(iso: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(iso).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn yesterday_resolves_against_the_schedule_local_date() {
        // 2025-03-10T02:07+01:00 Paris is 2025-03-10T01:07 UTC.
        let now = at("2025-03-10T01:07:00Z");
        let dates = resolve_date_range(&DateRange::Yesterday, "Europe/Paris", now).unwrap();
        assert_eq!(dates.len(), 1);
        assert_eq!(format_ddmmyyyy(dates[0]), "09/03/2025");
    }

    #[test]
    fn last_7_days_includes_today_and_is_ascending() {
        let now = at("2025-03-10T12:00:00Z");
        let dates = resolve_date_range(&DateRange::Last7Days, "UTC", now).unwrap();
        assert_eq!(dates.len(), 7);
        assert!(dates.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(dates.last().unwrap().to_string(), "2025-03-10");
    }

    #[test]
    fn custom_range_rejects_inverted_bounds() {
        let now = at("2025-03-10T12:00:00Z");
        let range = DateRange::Custom {
            start: "2025-03-10".to_string(),
            end: "2025-03-01".to_string(),
        };
        assert!(resolve_date_range(&range, "UTC", now).is_err());
    }
}
