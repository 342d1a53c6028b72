//! `AuditConfig` reads. Read-only at run time: the orchestrator only ever
//! resolves the effective audit-config id set, never mutates these rows.

use crate::repository::{Repository, RepositoryError};
use automation_contracts::{AuditConfig, AuditConfigId, ControlStep};

impl Repository {
    pub async fn get_audit_config(
        &self,
        id: &AuditConfigId,
    ) -> Result<Option<AuditConfig>, RepositoryError> {
        let row: Option<(String, String, serde_json::Value, bool)> = sqlx::query_as(
            "SELECT id, system_prompt, control_steps, is_automatic FROM audit_config WHERE id = $1",
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(id, system_prompt, control_steps, is_automatic)| {
            let control_steps: Vec<ControlStep> = serde_json::from_value(control_steps)?;
            Ok(AuditConfig {
                id: AuditConfigId::from(id),
                system_prompt,
                control_steps,
                is_automatic,
            })
        })
        .transpose()
        .map_err(|e: serde_json::Error| RepositoryError::Decode(e))
    }

    /// When `useAutomaticAudits` is set, the set of configs flagged
    /// automatic.
    pub async fn list_automatic_audit_config_ids(&self) -> Result<Vec<AuditConfigId>, RepositoryError> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT id FROM audit_config WHERE is_automatic = true")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(id,)| AuditConfigId::from(id)).collect())
    }
}

#[cfg(test)]
mod tests {
    use automation_contracts::AuditConfigId;

    #[test]
    fn audit_config_id_is_opaque() {
        let id = AuditConfigId::from("cfg-1");
        assert_eq!(id.as_str(), "cfg-1");
    }
}
