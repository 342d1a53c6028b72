//! Run lifecycle and append-only RunLog.

use crate::models::{parse_run_status, run_status_db_str, RunRow};
use crate::repository::{Repository, RepositoryError};
use automation_contracts::{BigId, ResultSummary, Run, RunId, RunLog, RunStatus, ScheduleId};
use chrono::{DateTime, Utc};

const SELECT_RUN: &str = r#"
    SELECT id, schedule_id, status, started_at, completed_at, duration_ms,
           total_fiches, successful_fiches, failed_fiches, ignored_fiches,
           transcriptions_run, audits_run, error_message, result_summary,
           payload_snapshot
    FROM automation_run
"#;

impl Repository {
    /// Creates a Run row with status running.
    pub async fn create_run(
        &self,
        schedule_id: &ScheduleId,
        started_at: DateTime<Utc>,
        payload_snapshot: serde_json::Value,
    ) -> Result<Run, RepositoryError> {
        let row: RunRow = sqlx::query_as(&format!(
            "INSERT INTO automation_run (schedule_id, status, started_at, payload_snapshot)
             VALUES ($1, 'running', $2, $3)
             RETURNING id, schedule_id, status, started_at, completed_at, duration_ms,
                       total_fiches, successful_fiches, failed_fiches, ignored_fiches,
                       transcriptions_run, audits_run, error_message, result_summary,
                       payload_snapshot"
        ))
        .bind(schedule_id.as_str())
        .bind(started_at)
        .bind(payload_snapshot)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.into_domain()?)
    }

    pub async fn get_run(&self, run_id: RunId) -> Result<Option<Run>, RepositoryError> {
        let row: Option<RunRow> = sqlx::query_as(&format!("{SELECT_RUN} WHERE id = $1"))
            .bind(run_id.get())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| r.into_domain().map_err(RepositoryError::from))
            .transpose()
    }

    pub async fn append_run_log(&self, log: &RunLog) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO automation_log (run_id, level, message, metadata, created_at)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(log.run_id.get())
        .bind(match log.level {
            automation_contracts::LogLevel::Debug => "debug",
            automation_contracts::LogLevel::Info => "info",
            automation_contracts::LogLevel::Warning => "warning",
            automation_contracts::LogLevel::Error => "error",
        })
        .bind(&log.message)
        .bind(&log.metadata)
        .bind(log.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Writes final counts, resultSummary, and duration onto the Run row.
    /// This method covers the Run side; the caller additionally calls
    /// [`Repository::update_schedule_last_run_status`]. Transactional: the
    /// counts, summary, and status are written atomically. `continue_on_error`
    /// is the schedule's `failurePolicy.continueOnError`, needed here because
    /// [`ResultSummary::derive_status`] can't see the policy on its own.
    pub async fn finalize_run(
        &self,
        run_id: RunId,
        result_summary: ResultSummary,
        transcriptions_run: i32,
        audits_run: i32,
        error_message: Option<String>,
        completed_at: DateTime<Utc>,
        continue_on_error: bool,
    ) -> Result<Run, RepositoryError> {
        let status = result_summary.derive_status(continue_on_error);
        let total = result_summary.total() as i32;
        let successful = result_summary.successful.len() as i32;
        let failed = result_summary.failed.len() as i32;
        let ignored = result_summary.ignored.len() as i32;
        let summary_json = serde_json::to_value(&result_summary)?;

        let mut tx = self.pool.begin().await?;

        let started_at: DateTime<Utc> =
            sqlx::query_scalar("SELECT started_at FROM automation_run WHERE id = $1")
                .bind(run_id.get())
                .fetch_one(&mut *tx)
                .await?;
        let duration_ms = (completed_at - started_at).num_milliseconds();

        let row: RunRow = sqlx::query_as(
            "UPDATE automation_run
             SET status = $2, completed_at = $3, duration_ms = $4, total_fiches = $5,
                 successful_fiches = $6, failed_fiches = $7, ignored_fiches = $8,
                 transcriptions_run = $9, audits_run = $10, error_message = $11,
                 result_summary = $12
             WHERE id = $1
             RETURNING id, schedule_id, status, started_at, completed_at, duration_ms,
                       total_fiches, successful_fiches, failed_fiches, ignored_fiches,
                       transcriptions_run, audits_run, error_message, result_summary,
                       payload_snapshot",
        )
        .bind(run_id.get())
        .bind(run_status_db_str(status))
        .bind(completed_at)
        .bind(duration_ms)
        .bind(total)
        .bind(successful)
        .bind(failed)
        .bind(ignored)
        .bind(transcriptions_run)
        .bind(audits_run)
        .bind(&error_message)
        .bind(&summary_json)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(row.into_domain()?)
    }

    /// Reconciles a stuck `running` Run to `failed` once it is older than
    /// `stale_before`.
    pub async fn mark_stale_runs_for_schedule(
        &self,
        schedule_id: &ScheduleId,
        stale_before: DateTime<Utc>,
        reason: &str,
    ) -> Result<Vec<BigId>, RepositoryError> {
        let ids: Vec<(i64,)> = sqlx::query_as(
            "UPDATE automation_run
             SET status = 'failed', completed_at = now(), error_message = $3
             WHERE schedule_id = $1 AND status = 'running' AND started_at < $2
             RETURNING id",
        )
        .bind(schedule_id.as_str())
        .bind(stale_before)
        .bind(reason)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids.into_iter().map(|(id,)| BigId(id)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_status_db_str_round_trips() {
        assert_eq!(run_status_db_str(RunStatus::Partial), "partial");
        assert_eq!(parse_run_status("partial"), RunStatus::Partial);
    }
}
