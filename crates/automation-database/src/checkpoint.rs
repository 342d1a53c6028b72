//! The `workflow_checkpoint` table backing the Durable-Step Runtime's
//! `run`/`invoke` memoization: one row per `(runId, stepName)`, written once
//! and never overwritten, so replaying a step after a crash returns the
//! original result instead of re-executing a side effect.

use crate::repository::{Repository, RepositoryError};
use automation_contracts::RunId;

impl Repository {
    pub async fn load_checkpoint(
        &self,
        run_id: RunId,
        step_name: &str,
    ) -> Result<Option<serde_json::Value>, RepositoryError> {
        let row: Option<(serde_json::Value,)> = sqlx::query_as(
            "SELECT result FROM workflow_checkpoint WHERE run_id = $1 AND step_name = $2",
        )
        .bind(run_id.get())
        .bind(step_name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(value,)| value))
    }

    /// Idempotent: a second writer racing to memoize the same step name is a
    /// no-op, and the row's original value (whichever writer won) is
    /// authoritative from then on.
    pub async fn save_checkpoint(
        &self,
        run_id: RunId,
        step_name: &str,
        result: &serde_json::Value,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO workflow_checkpoint (run_id, step_name, result)
             VALUES ($1, $2, $3)
             ON CONFLICT (run_id, step_name) DO NOTHING",
        )
        .bind(run_id.get())
        .bind(step_name)
        .bind(result)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
