//! Audit inserts and the `isLatest` flip, plus the grouped status counts the
//! Run-Orchestrator polls as the audit fan-in gate.

use crate::models::{audit_status_db_str, parse_audit_status};
use crate::repository::{Repository, RepositoryError};
use automation_contracts::{Audit, AuditConfigId, AuditStatus, BigId, FicheCacheId, RunId};

impl Repository {
    /// Inserting a new Audit for a fiche must flip the previous latest row
    /// for that (`ficheCacheId`, `auditConfigId`) pair to `isLatest=false`
    /// in the same transaction, so at most one row is ever latest per
    /// fiche/config pair.
    pub async fn insert_audit(
        &self,
        fiche_cache_id: FicheCacheId,
        audit_config_id: &AuditConfigId,
        automation_run_id: Option<RunId>,
    ) -> Result<Audit, RepositoryError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "UPDATE audit SET is_latest = false
             WHERE fiche_cache_id = $1 AND audit_config_id = $2 AND is_latest = true",
        )
        .bind(fiche_cache_id.get())
        .bind(audit_config_id.as_str())
        .execute(&mut *tx)
        .await?;

        let row: (i64, i64, String, String, Option<i64>, bool, Option<String>, serde_json::Value) =
            sqlx::query_as(
                "INSERT INTO audit (fiche_cache_id, audit_config_id, status, automation_run_id, is_latest)
                 VALUES ($1, $2, 'pending', $3, true)
                 RETURNING id, fiche_cache_id, audit_config_id, status, automation_run_id, is_latest, error_message, result",
            )
            .bind(fiche_cache_id.get())
            .bind(audit_config_id.as_str())
            .bind(automation_run_id.map(|id| id.get()))
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(Audit {
            id: BigId(row.0),
            fiche_cache_id: BigId(row.1),
            audit_config_id: AuditConfigId::from(row.2),
            status: parse_audit_status(&row.3),
            automation_run_id: row.4.map(BigId),
            is_latest: row.5,
            error_message: row.6,
            result: row.7,
        })
    }

    pub async fn update_audit_status(
        &self,
        audit_id: BigId,
        status: AuditStatus,
        error_message: Option<String>,
        result: Option<serde_json::Value>,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            "UPDATE audit SET status = $2, error_message = $3, result = COALESCE($4, result)
             WHERE id = $1",
        )
        .bind(audit_id.get())
        .bind(audit_status_db_str(status))
        .bind(error_message)
        .bind(result)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Whether a fiche already has a completed latest audit for
    /// `audit_config_id`, independent of any particular Run. Backs a
    /// selection's `onlyUnaudited` filter.
    pub async fn has_completed_audit(
        &self,
        fiche_cache_id: FicheCacheId,
        audit_config_id: &AuditConfigId,
    ) -> Result<bool, RepositoryError> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT status FROM audit
             WHERE fiche_cache_id = $1 AND audit_config_id = $2 AND is_latest = true",
        )
        .bind(fiche_cache_id.get())
        .bind(audit_config_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row
            .map(|(status,)| parse_audit_status(&status) == AuditStatus::Completed)
            .unwrap_or(false))
    }

    /// The audit gate's readiness query: rows grouped by `(ficheCacheId,
    /// status)`, restricted to `automationRunId = runId` and
    /// `isLatest = true`. A fiche can have one row per dispatched
    /// `auditConfigId`, so this returns every row rather than collapsing to
    /// one status per fiche; the caller compares `completed + failed`
    /// against the effective config-id set's size to decide readiness.
    pub async fn audit_gate_rows(
        &self,
        run_id: RunId,
        fiche_cache_ids: &[FicheCacheId],
    ) -> Result<Vec<(FicheCacheId, AuditStatus)>, RepositoryError> {
        if fiche_cache_ids.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<i64> = fiche_cache_ids.iter().map(|id| id.get()).collect();
        let rows: Vec<(i64, String)> = sqlx::query_as(
            "SELECT fiche_cache_id, status FROM audit
             WHERE automation_run_id = $1 AND is_latest = true AND fiche_cache_id = ANY($2)",
        )
        .bind(run_id.get())
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, status)| (automation_contracts::BigId(id), parse_audit_status(&status)))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses_stop_the_gate_poll() {
        assert!(AuditStatus::Completed.is_terminal());
        assert!(AuditStatus::Failed.is_terminal());
        assert!(!AuditStatus::Running.is_terminal());
    }
}
