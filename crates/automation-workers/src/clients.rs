//! The three external collaborators this workspace coordinates but does
//! not implement: the CRM-like sales API, the per-recording transcription
//! engine, and the per-transcript audit engine. They are treated as
//! invocable worker functions with contracts only — their business logic
//! (how the CRM selects a sales list, how the engine transcribes audio, how
//! an audit is scored) stays out of this workspace. What does live here: the trait each
//! collaborator is called through, a minimal `reqwest` adapter speaking a
//! plain JSON contract for whichever concrete service sits behind it, and
//! an in-memory fake used by the test suite.

use async_trait::async_trait;
use automation_contracts::{AuditConfigId, AutomationError, FicheId, RunId, TranscriptionPriority};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// One row of a day's sales list: summary fields only (a "sales-list-only"
/// FicheCache).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SalesListEntry {
    pub fiche_id: FicheId,
    pub cle: Option<String>,
    pub groupe: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingSummary {
    pub external_url: String,
}

/// Authoritative fiche projection (a "full-details" FicheCache).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FicheDetails {
    pub fiche_id: FicheId,
    pub cle: Option<String>,
    pub groupe: Option<String>,
    pub recordings: Vec<RecordingSummary>,
    pub raw_data: serde_json::Value,
}

#[async_trait]
pub trait CrmClient: Send + Sync {
    async fn fetch_sales_list(&self, date: NaiveDate) -> Result<Vec<SalesListEntry>, AutomationError>;

    /// Returns `Err(AutomationError::TerminalNotFound)` for the CRM
    /// NOT_FOUND marker; any other error is classified `TransientExternal`
    /// by the caller's retry wrapper.
    async fn fetch_fiche_details(&self, fiche_id: &FicheId) -> Result<FicheDetails, AutomationError>;
}

#[async_trait]
pub trait TranscriptionEngine: Send + Sync {
    /// Transcribes one recording. Returns the engine's transcription id.
    async fn transcribe(
        &self,
        run_id: RunId,
        fiche_id: &FicheId,
        recording_external_url: &str,
        priority: TranscriptionPriority,
    ) -> Result<String, AutomationError>;
}

#[async_trait]
pub trait AuditEngine: Send + Sync {
    async fn run_audit(
        &self,
        run_id: RunId,
        fiche_id: &FicheId,
        audit_config_id: &AuditConfigId,
    ) -> Result<serde_json::Value, AutomationError>;
}

/// Thin `reqwest`-backed adapters for the three collaborators. Each one
/// speaks a small JSON contract against a configurable base URL; none of
/// them retry or circuit-break themselves; callers (Day-Worker,
/// Fiche-Worker) wrap every call in [`automation_resilience::retry`] and,
/// for the CRM, a shared [`automation_resilience::CircuitBreaker`].
#[derive(Debug, Clone)]
pub struct HttpCrmClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpCrmClient {
    pub fn new(base_url: impl Into<String>, timeout: std::time::Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("failed to build CRM http client");
        Self {
            client,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl CrmClient for HttpCrmClient {
    async fn fetch_sales_list(&self, date: NaiveDate) -> Result<Vec<SalesListEntry>, AutomationError> {
        let url = format!("{}/sales-list", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .get(&url)
            .query(&[("date", date.format("%Y-%m-%d").to_string())])
            .send()
            .await
            .map_err(crm_transient)?;

        if !response.status().is_success() {
            return Err(crm_status_error(response.status()));
        }
        response
            .json::<Vec<SalesListEntry>>()
            .await
            .map_err(crm_transient)
    }

    async fn fetch_fiche_details(&self, fiche_id: &FicheId) -> Result<FicheDetails, AutomationError> {
        let url = format!(
            "{}/fiches/{}",
            self.base_url.trim_end_matches('/'),
            fiche_id.as_str()
        );
        let response = self.client.get(&url).send().await.map_err(crm_transient)?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(AutomationError::TerminalNotFound);
        }
        if !response.status().is_success() {
            return Err(crm_status_error(response.status()));
        }
        response.json::<FicheDetails>().await.map_err(crm_transient)
    }
}

fn crm_transient(e: reqwest::Error) -> AutomationError {
    AutomationError::TransientExternal {
        service: "crm".to_string(),
        message: e.to_string(),
    }
}

fn crm_status_error(status: reqwest::StatusCode) -> AutomationError {
    AutomationError::TransientExternal {
        service: "crm".to_string(),
        message: format!("unexpected status {status}"),
    }
}

#[derive(Debug, Clone)]
pub struct HttpTranscriptionEngine {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTranscriptionEngine {
    pub fn new(base_url: impl Into<String>, timeout: std::time::Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("failed to build transcription http client");
        Self {
            client,
            base_url: base_url.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TranscribeResponse {
    transcription_id: String,
}

#[async_trait]
impl TranscriptionEngine for HttpTranscriptionEngine {
    async fn transcribe(
        &self,
        run_id: RunId,
        fiche_id: &FicheId,
        recording_external_url: &str,
        priority: TranscriptionPriority,
    ) -> Result<String, AutomationError> {
        let url = format!("{}/transcribe", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({
                "run_id": run_id,
                "fiche_id": fiche_id,
                "recording_url": recording_external_url,
                "priority": priority,
            }))
            .send()
            .await
            .map_err(|e| transient("transcription", e))?;

        if !response.status().is_success() {
            return Err(status_error("transcription", response.status()));
        }
        let body: TranscribeResponse = response
            .json()
            .await
            .map_err(|e| transient("transcription", e))?;
        Ok(body.transcription_id)
    }
}

#[derive(Debug, Clone)]
pub struct HttpAuditEngine {
    client: reqwest::Client,
    base_url: String,
}

impl HttpAuditEngine {
    pub fn new(base_url: impl Into<String>, timeout: std::time::Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("failed to build audit http client");
        Self {
            client,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl AuditEngine for HttpAuditEngine {
    async fn run_audit(
        &self,
        run_id: RunId,
        fiche_id: &FicheId,
        audit_config_id: &AuditConfigId,
    ) -> Result<serde_json::Value, AutomationError> {
        let url = format!("{}/audit", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({
                "run_id": run_id,
                "fiche_id": fiche_id,
                "audit_config_id": audit_config_id,
            }))
            .send()
            .await
            .map_err(|e| transient("audit", e))?;

        if !response.status().is_success() {
            return Err(status_error("audit", response.status()));
        }
        response.json().await.map_err(|e| transient("audit", e))
    }
}

fn transient(service: &str, e: reqwest::Error) -> AutomationError {
    AutomationError::TransientExternal {
        service: service.to_string(),
        message: e.to_string(),
    }
}

fn status_error(service: &str, status: reqwest::StatusCode) -> AutomationError {
    AutomationError::TransientExternal {
        service: service.to_string(),
        message: format!("unexpected status {status}"),
    }
}

#[cfg(test)]
pub mod fakes {
    use super::*;
    use dashmap::DashMap;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Always-succeeds fake CRM: every fiche has `recordings_per_fiche`
    /// recordings, unless the id is in `not_found`.
    pub struct FakeCrmClient {
        pub recordings_per_fiche: usize,
        pub not_found: Vec<String>,
        pub sales_list: DashMap<NaiveDate, Vec<SalesListEntry>>,
    }

    impl FakeCrmClient {
        pub fn new(recordings_per_fiche: usize) -> Self {
            Self {
                recordings_per_fiche,
                not_found: Vec::new(),
                sales_list: DashMap::new(),
            }
        }
    }

    #[async_trait]
    impl CrmClient for FakeCrmClient {
        async fn fetch_sales_list(&self, date: NaiveDate) -> Result<Vec<SalesListEntry>, AutomationError> {
            Ok(self.sales_list.get(&date).map(|v| v.clone()).unwrap_or_default())
        }

        async fn fetch_fiche_details(&self, fiche_id: &FicheId) -> Result<FicheDetails, AutomationError> {
            if self.not_found.iter().any(|id| id == fiche_id.as_str()) {
                return Err(AutomationError::TerminalNotFound);
            }
            Ok(FicheDetails {
                fiche_id: fiche_id.clone(),
                cle: Some("token".to_string()),
                groupe: Some("G1".to_string()),
                recordings: (0..self.recordings_per_fiche)
                    .map(|i| RecordingSummary {
                        external_url: format!("https://recordings.example/{fiche_id}/{i}"),
                    })
                    .collect(),
                raw_data: serde_json::json!({}),
            })
        }
    }

    pub struct FakeTranscriptionEngine {
        pub counter: AtomicU64,
        pub fails_urls: Vec<String>,
    }

    impl FakeTranscriptionEngine {
        pub fn new() -> Self {
            Self {
                counter: AtomicU64::new(0),
                fails_urls: Vec::new(),
            }
        }
    }

    #[async_trait]
    impl TranscriptionEngine for FakeTranscriptionEngine {
        async fn transcribe(
            &self,
            _run_id: RunId,
            _fiche_id: &FicheId,
            recording_external_url: &str,
            _priority: TranscriptionPriority,
        ) -> Result<String, AutomationError> {
            if self.fails_urls.iter().any(|u| u == recording_external_url) {
                return Err(AutomationError::TransientExternal {
                    service: "transcription".to_string(),
                    message: "engine dropped the job".to_string(),
                });
            }
            let id = self.counter.fetch_add(1, Ordering::SeqCst);
            Ok(format!("transcript-{id}"))
        }
    }

    pub struct FakeAuditEngine;

    #[async_trait]
    impl AuditEngine for FakeAuditEngine {
        async fn run_audit(
            &self,
            _run_id: RunId,
            _fiche_id: &FicheId,
            _audit_config_id: &AuditConfigId,
        ) -> Result<serde_json::Value, AutomationError> {
            Ok(serde_json::json!({"score": 1.0}))
        }
    }
}
