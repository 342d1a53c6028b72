//! `FicheCache`, `Recording`, `Audit`, and `AuditConfig` entities.

use crate::error::AutomationError;
use crate::ids::{AuditConfigId, AuditId, FicheCacheId, FicheId, RecordingId, RunId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// `FicheCache` state machine:
/// `absent -> sales-list-only -> full-details` (forward-only), or
/// `absent -> NOT_FOUND` (terminal marker).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FicheCache {
    pub id: FicheCacheId,
    pub fiche_id: FicheId,
    pub cle: Option<String>,
    pub groupe: Option<String>,
    pub details_success: Option<bool>,
    pub details_message: Option<String>,
    pub recordings_count: Option<i32>,
    pub has_recordings: bool,
    pub raw_data: serde_json::Value,
    pub expires_at: Option<DateTime<Utc>>,
}

impl FicheCache {
    /// Sales-list-only rows carry summary fields only; `groupe` and
    /// `recordingsCount` are not authoritative until `isFullDetails`.
    pub fn is_full_details(&self) -> bool {
        self.groupe.is_some() && self.recordings_count.is_some()
    }

    pub fn is_sales_list_only(&self) -> bool {
        !self.is_full_details() && !self.is_not_found()
    }

    pub fn is_not_found(&self) -> bool {
        self.details_success == Some(false)
            && self.details_message.as_deref() == Some(AutomationError::NOT_FOUND_MARKER)
    }

    /// Writers must perform upserts keyed by `ficheId`, never overwriting a
    /// full-details row with a sales-list-only row. This is the monotonicity
    /// check the Repository Layer's upsert consults before writing.
    pub fn would_regress(&self, incoming_is_full_details: bool) -> bool {
        self.is_full_details() && !incoming_is_full_details
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recording {
    pub id: RecordingId,
    pub fiche_cache_id: FicheCacheId,
    pub external_url: String,
    pub has_transcription: bool,
    pub transcription_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl AuditStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, AuditStatus::Completed | AuditStatus::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Audit {
    pub id: AuditId,
    pub fiche_cache_id: FicheCacheId,
    pub audit_config_id: AuditConfigId,
    pub status: AuditStatus,
    pub automation_run_id: Option<RunId>,
    pub is_latest: bool,
    pub error_message: Option<String>,
    pub result: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlSeverity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlStep {
    pub order: u32,
    pub weight: f64,
    pub keywords: Vec<String>,
    pub severity: ControlSeverity,
}

/// Read-only at run time: the orchestrator never mutates this, it only
/// resolves the effective id set consulted by the audit gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    pub id: AuditConfigId,
    pub system_prompt: String,
    pub control_steps: Vec<ControlStep>,
    pub is_automatic: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sales_list_only() -> FicheCache {
        FicheCache {
            id: FicheCacheId(1),
            fiche_id: FicheId::from("F1"),
            cle: None,
            groupe: None,
            details_success: None,
            details_message: None,
            recordings_count: None,
            has_recordings: false,
            raw_data: serde_json::json!({}),
            expires_at: None,
        }
    }

    #[test]
    fn sales_list_only_row_is_not_full_details() {
        let fc = sales_list_only();
        assert!(fc.is_sales_list_only());
        assert!(!fc.is_full_details());
    }

    #[test]
    fn full_details_row_never_regresses() {
        let mut fc = sales_list_only();
        fc.groupe = Some("G1".into());
        fc.recordings_count = Some(2);
        assert!(fc.is_full_details());
        assert!(fc.would_regress(false));
        assert!(!fc.would_regress(true));
    }

    #[test]
    fn not_found_marker_is_terminal() {
        let mut fc = sales_list_only();
        fc.details_success = Some(false);
        fc.details_message = Some(AutomationError::NOT_FOUND_MARKER.to_string());
        assert!(fc.is_not_found());
        assert!(!fc.is_full_details());
    }
}
