//! FicheCache upserts and Recording reads, including the grouped counts the
//! Day-Worker/Run-Orchestrator use as fan-in gates.

use crate::models::{FicheCacheRow, RecordingRow};
use crate::repository::{Repository, RepositoryError};
use automation_contracts::{AutomationError, BigId, FicheCache, FicheId, Recording};
use std::collections::HashMap;

const SELECT_FICHE_CACHE: &str = r#"
    SELECT id, fiche_id, cle, groupe, details_success, details_message,
           recordings_count, has_recordings, raw_data, expires_at
    FROM fiche_cache
"#;

impl Repository {
    pub async fn get_fiche_cache(
        &self,
        fiche_id: &FicheId,
    ) -> Result<Option<FicheCache>, RepositoryError> {
        let row: Option<FicheCacheRow> =
            sqlx::query_as(&format!("{SELECT_FICHE_CACHE} WHERE fiche_id = $1"))
                .bind(fiche_id.as_str())
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(FicheCacheRow::into_domain))
    }

    /// Batched form of [`Repository::get_fiche_cache`], used by the
    /// Run-Orchestrator's fiche-details gate to read the whole targeted set
    /// in one round trip instead of one query per fiche.
    pub async fn get_fiche_caches(
        &self,
        fiche_ids: &[FicheId],
    ) -> Result<Vec<FicheCache>, RepositoryError> {
        if fiche_ids.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<String> = fiche_ids.iter().map(|f| f.as_str().to_string()).collect();
        let rows: Vec<FicheCacheRow> =
            sqlx::query_as(&format!("{SELECT_FICHE_CACHE} WHERE fiche_id = ANY($1)"))
                .bind(&ids)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(FicheCacheRow::into_domain).collect())
    }

    /// Writers must perform upserts keyed by `ficheId`, never overwriting a
    /// full-details row with a sales-list-only row. The monotonicity guard
    /// is enforced here, inside the same statement that performs the write,
    /// so a racing sales-list refresh can never clobber a row a concurrent
    /// fiche-details fetch already completed.
    pub async fn upsert_fiche_cache(&self, incoming: &FicheCache) -> Result<FicheCache, RepositoryError> {
        let existing = self.get_fiche_cache(&incoming.fiche_id).await?;
        if let Some(existing) = &existing {
            if existing.would_regress(incoming.is_full_details()) {
                return Ok(existing.clone());
            }
        }

        let row: FicheCacheRow = sqlx::query_as(&format!(
            "INSERT INTO fiche_cache (fiche_id, cle, groupe, details_success, details_message,
                                       recordings_count, has_recordings, raw_data, expires_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
             ON CONFLICT (fiche_id) DO UPDATE SET
                cle = EXCLUDED.cle,
                groupe = EXCLUDED.groupe,
                details_success = EXCLUDED.details_success,
                details_message = EXCLUDED.details_message,
                recordings_count = EXCLUDED.recordings_count,
                has_recordings = EXCLUDED.has_recordings,
                raw_data = EXCLUDED.raw_data,
                expires_at = EXCLUDED.expires_at
             RETURNING {cols}",
            cols = "id, fiche_id, cle, groupe, details_success, details_message, \
                    recordings_count, has_recordings, raw_data, expires_at"
        ))
        .bind(incoming.fiche_id.as_str())
        .bind(&incoming.cle)
        .bind(&incoming.groupe)
        .bind(incoming.details_success)
        .bind(&incoming.details_message)
        .bind(incoming.recordings_count)
        .bind(incoming.has_recordings)
        .bind(&incoming.raw_data)
        .bind(incoming.expires_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.into_domain())
    }

    /// Marks a fiche permanently absent from the CRM (`NOT_FOUND_MARKER`):
    /// `detailsSuccess=false`,
    /// `detailsMessage=NOT_FOUND`. Terminal; never upserted over again by
    /// [`Repository::upsert_fiche_cache`]'s regression guard since
    /// `is_full_details()` is false on both sides, so ordinary sales-list
    /// refreshes simply no-op against it.
    pub async fn mark_fiche_not_found(&self, fiche_id: &FicheId) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO fiche_cache (fiche_id, details_success, details_message)
             VALUES ($1, false, $2)
             ON CONFLICT (fiche_id) DO UPDATE SET
                details_success = false, details_message = $2",
        )
        .bind(fiche_id.as_str())
        .bind(AutomationError::NOT_FOUND_MARKER)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_recordings(
        &self,
        fiche_cache_id: BigId,
    ) -> Result<Vec<Recording>, RepositoryError> {
        let rows: Vec<RecordingRow> = sqlx::query_as(
            "SELECT id, fiche_cache_id, external_url, has_transcription, transcription_id
             FROM recording WHERE fiche_cache_id = $1",
        )
        .bind(fiche_cache_id.get())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(RecordingRow::into_domain).collect())
    }

    pub async fn upsert_recording(&self, recording: &Recording) -> Result<Recording, RepositoryError> {
        let row: RecordingRow = sqlx::query_as(
            "INSERT INTO recording (fiche_cache_id, external_url, has_transcription, transcription_id)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (fiche_cache_id, external_url) DO UPDATE SET
                has_transcription = EXCLUDED.has_transcription,
                transcription_id = EXCLUDED.transcription_id
             RETURNING id, fiche_cache_id, external_url, has_transcription, transcription_id",
        )
        .bind(recording.fiche_cache_id.get())
        .bind(&recording.external_url)
        .bind(recording.has_transcription)
        .bind(&recording.transcription_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into_domain())
    }

    /// The transcription gate's readiness query: per `ficheCacheId`,
    /// whether every associated recording has a transcription. A fiche with
    /// zero recordings is trivially transcribed (vacuous truth over an
    /// empty set).
    pub async fn transcription_gate_status(
        &self,
        fiche_cache_ids: &[BigId],
    ) -> Result<HashMap<i64, bool>, RepositoryError> {
        if fiche_cache_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let ids: Vec<i64> = fiche_cache_ids.iter().map(|id| id.get()).collect();
        let rows: Vec<(i64, i64, i64)> = sqlx::query_as(
            "SELECT fiche_cache_id, count(*) AS total,
                    count(*) FILTER (WHERE has_transcription) AS transcribed
             FROM recording
             WHERE fiche_cache_id = ANY($1)
             GROUP BY fiche_cache_id",
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;

        let mut result: HashMap<i64, bool> =
            fiche_cache_ids.iter().map(|id| (id.get(), true)).collect();
        for (fiche_cache_id, total, transcribed) in rows {
            result.insert(fiche_cache_id, total == transcribed);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_marker_matches_contract_constant() {
        assert_eq!(AutomationError::NOT_FOUND_MARKER, "NOT_FOUND");
    }
}
