//! The Fiche-Worker: processes one fiche end-to-end through its six
//! strictly-ordered stages, each a checkpointed step so a crash mid-fiche
//! resumes rather than re-running completed stages.

use crate::clients::{AuditEngine, CrmClient, TranscriptionEngine};
use automation_config::OrchestrationConfig;
use automation_contracts::{
    deterministic_event_id, AuditConfigId, AutomationError, FicheCache, FicheId, RunId,
    ScheduleId, TranscriptionPriority,
};
use automation_database::Repository;
use automation_events::StepContext;
use automation_resilience::{retry, RetryConfig};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct FicheWorkerInput {
    pub fiche_id: FicheId,
    pub audit_config_id: Option<AuditConfigId>,
    pub schedule_id: ScheduleId,
    pub run_id: RunId,
    pub run_transcription: bool,
    pub skip_if_transcribed: bool,
    pub transcription_priority: TranscriptionPriority,
    pub run_audits: bool,
    pub max_recordings: u32,
    pub only_with_recordings: bool,
    pub group_filter: Option<Vec<String>>,
    pub retry: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FicheOutcomeStatus {
    Success,
    Failed,
    Ignored,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FicheWorkerOutput {
    pub fiche_id: FicheId,
    pub status: FicheOutcomeStatus,
    pub error: Option<String>,
    pub recordings_count: Option<i32>,
}

impl FicheWorkerOutput {
    fn ignored(fiche_id: FicheId, reason: impl Into<String>) -> Self {
        Self {
            fiche_id,
            status: FicheOutcomeStatus::Ignored,
            error: Some(reason.into()),
            recordings_count: None,
        }
    }

    pub(crate) fn failed(fiche_id: FicheId, reason: impl Into<String>) -> Self {
        Self {
            fiche_id,
            status: FicheOutcomeStatus::Failed,
            error: Some(reason.into()),
            recordings_count: None,
        }
    }

    fn success(fiche_id: FicheId, recordings_count: i32) -> Self {
        Self {
            fiche_id,
            status: FicheOutcomeStatus::Success,
            error: None,
            recordings_count: Some(recordings_count),
        }
    }
}

pub struct FicheWorker<'a> {
    pub repository: &'a Repository,
    pub crm: &'a dyn CrmClient,
    pub transcription: &'a dyn TranscriptionEngine,
    pub audit: &'a dyn AuditEngine,
    pub config: &'a OrchestrationConfig,
}

impl<'a> FicheWorker<'a> {
    pub fn new(
        repository: &'a Repository,
        crm: &'a dyn CrmClient,
        transcription: &'a dyn TranscriptionEngine,
        audit: &'a dyn AuditEngine,
        config: &'a OrchestrationConfig,
    ) -> Self {
        Self {
            repository,
            crm,
            transcription,
            audit,
            config,
        }
    }

    /// Runs every stage for one fiche.
    pub async fn process(
        &self,
        ctx: &StepContext,
        input: FicheWorkerInput,
    ) -> Result<FicheWorkerOutput, AutomationError> {
        // Stage 1: ensure details cached.
        let fiche_cache = match self.ensure_details_cached(ctx, &input).await {
            Ok(cache) => cache,
            Err(AutomationError::TerminalNotFound) => {
                self.repository
                    .mark_fiche_not_found(&input.fiche_id)
                    .await?;
                return Ok(FicheWorkerOutput::ignored(
                    input.fiche_id,
                    "Fiche not found (404)",
                ));
            }
            Err(e) => return Ok(FicheWorkerOutput::failed(input.fiche_id, e.to_string())),
        };

        // Stage 2: group filter.
        if let Some(allowed) = &input.group_filter {
            if !allowed.is_empty() {
                let groupe = fiche_cache.groupe.as_deref();
                if groupe.map(|g| !allowed.iter().any(|a| a == g)).unwrap_or(true) {
                    return Ok(FicheWorkerOutput::ignored(
                        input.fiche_id,
                        "Groupe not selected",
                    ));
                }
            }
        }

        // Stage 3: recording policy.
        let recordings_count = fiche_cache.recordings_count.unwrap_or(0);
        let ceiling = self.config.max_recordings_per_fiche.min(input.max_recordings);
        if recordings_count as u32 > ceiling {
            return Ok(FicheWorkerOutput::ignored(
                input.fiche_id,
                "Too many recordings",
            ));
        }
        if recordings_count == 0 && input.only_with_recordings {
            return Ok(FicheWorkerOutput::ignored(input.fiche_id, "No recordings"));
        }

        // Stage 4: transcribe.
        let mut stage_error = None;
        if input.run_transcription && recordings_count > 0 {
            if let Err(e) = self.transcribe_recordings(ctx, &input).await {
                stage_error.get_or_insert(e.to_string());
            }
        }

        // Stage 5: audit.
        if input.run_audits {
            if let Some(audit_config_id) = &input.audit_config_id {
                if let Err(e) = self.run_primary_audit(ctx, &input, &fiche_cache, audit_config_id).await {
                    stage_error.get_or_insert(e.to_string());
                }
            }
        }

        // Stage 6: classify.
        match stage_error {
            Some(reason) => Ok(FicheWorkerOutput::failed(input.fiche_id, reason)),
            None => Ok(FicheWorkerOutput::success(input.fiche_id, recordings_count)),
        }
    }

    /// Stage 1, exposed `pub` so the Run-Orchestrator's legacy fiche-details
    /// gate can dispatch it directly instead of duplicating the
    /// cache-read / CRM-fetch / upsert sequence.
    pub async fn ensure_details_cached(
        &self,
        ctx: &StepContext,
        input: &FicheWorkerInput,
    ) -> Result<FicheCache, AutomationError> {
        if let Some(existing) = self.repository.get_fiche_cache(&input.fiche_id).await? {
            if existing.is_full_details() {
                return Ok(existing);
            }
            if existing.is_not_found() {
                return Err(AutomationError::TerminalNotFound);
            }
        }

        let step_name = format!("fetch-details-{}", input.fiche_id);
        let fiche_id = input.fiche_id.clone();
        let details = ctx
            .run(&step_name, move || {
                let crm = self.crm;
                let fiche_id = fiche_id.clone();
                async move {
                    retry("crm.fetch_fiche_details", RetryConfig::crm_default(), move || {
                        let fiche_id = fiche_id.clone();
                        async move { crm.fetch_fiche_details(&fiche_id).await }
                    })
                    .await
                }
            })
            .await?;

        let incoming = FicheCache {
            id: automation_contracts::BigId(0),
            fiche_id: input.fiche_id.clone(),
            cle: details.cle,
            groupe: details.groupe,
            details_success: Some(true),
            details_message: None,
            recordings_count: Some(details.recordings.len() as i32),
            has_recordings: !details.recordings.is_empty(),
            raw_data: details.raw_data,
            expires_at: None,
        };

        self.repository.upsert_fiche_cache(&incoming).await?;

        for recording in details.recordings {
            let stored = self.repository.get_fiche_cache(&input.fiche_id).await?;
            if let Some(stored) = stored {
                self.repository
                    .upsert_recording(&automation_contracts::Recording {
                        id: automation_contracts::BigId(0),
                        fiche_cache_id: stored.id,
                        external_url: recording.external_url,
                        has_transcription: false,
                        transcription_id: None,
                    })
                    .await?;
            }
        }

        self.repository
            .get_fiche_cache(&input.fiche_id)
            .await?
            .ok_or_else(|| AutomationError::Repository("fiche cache vanished after upsert".to_string()))
    }

    async fn transcribe_recordings(
        &self,
        ctx: &StepContext,
        input: &FicheWorkerInput,
    ) -> Result<(), AutomationError> {
        let fiche_cache = self
            .repository
            .get_fiche_cache(&input.fiche_id)
            .await?
            .ok_or_else(|| AutomationError::Repository("fiche cache missing at transcribe stage".to_string()))?;

        dispatch_pending_transcriptions(
            ctx,
            self.repository,
            self.transcription,
            input.run_id,
            &input.fiche_id,
            fiche_cache.id,
            input.skip_if_transcribed,
            input.transcription_priority,
            input.retry,
        )
        .await?;

        let stall_ready = ctx
            .poll_until(
                &format!("transcription-wait-{}", input.fiche_id),
                self.config.transcription_gate.max_polls(),
                Duration::from_secs(self.config.transcription_gate.poll_interval_seconds),
                || {
                    let fiche_cache_id = fiche_cache.id;
                    async move {
                        let recordings = self.repository.list_recordings(fiche_cache_id).await?;
                        let total = recordings.len();
                        let done = recordings.iter().filter(|r| r.has_transcription).count();
                        Ok((done == total, total - done))
                    }
                },
            )
            .await?;

        if !stall_ready {
            return Err(AutomationError::StageIncomplete(
                "Transcription incomplete (timeout/stall)".to_string(),
            ));
        }
        Ok(())
    }

    async fn run_primary_audit(
        &self,
        ctx: &StepContext,
        input: &FicheWorkerInput,
        fiche_cache: &FicheCache,
        audit_config_id: &AuditConfigId,
    ) -> Result<(), AutomationError> {
        run_audit_stage(
            ctx,
            self.repository,
            self.audit,
            input.run_id,
            &input.fiche_id,
            fiche_cache.id,
            audit_config_id,
            input.retry,
        )
        .await
    }
}

/// Dispatches transcription for every pending recording of one fiche,
/// driven by the transcription gate. Each recording
/// gets its own checkpointed step keyed by its row id, since a fiche can
/// carry more than one recording and the step name must stay unique per
/// recording rather than collapsing onto a single per-fiche key.
pub async fn dispatch_pending_transcriptions(
    ctx: &StepContext,
    repository: &Repository,
    transcription: &dyn TranscriptionEngine,
    run_id: RunId,
    fiche_id: &FicheId,
    fiche_cache_id: automation_contracts::FicheCacheId,
    skip_if_transcribed: bool,
    priority: TranscriptionPriority,
    retry: u32,
) -> Result<(), AutomationError> {
    let recordings = repository.list_recordings(fiche_cache_id).await?;
    let pending: Vec<_> = recordings
        .into_iter()
        .filter(|r| !skip_if_transcribed || !r.has_transcription)
        .collect();

    for recording in &pending {
        let event_id = deterministic_event_id(run_id, "transcribe", fiche_id.as_str(), retry);
        let event_id = format!("{event_id}-{}", recording.id);
        let transcription_id = ctx
            .run(&format!("transcribe-{event_id}"), || async {
                transcription
                    .transcribe(run_id, fiche_id, &recording.external_url, priority)
                    .await
            })
            .await?;

        repository
            .upsert_recording(&automation_contracts::Recording {
                transcription_id: Some(transcription_id),
                has_transcription: true,
                ..recording.clone()
            })
            .await?;
    }

    Ok(())
}

/// One (fiche, auditConfigId) audit: insert the pending row, run the
/// engine, flip to completed/failed. The fiche's own processing runs this
/// once for the schedule's primary config; the audit gate dispatches it
/// again per additional config id in the effective set, since multi-config
/// runs are dispatched by the Orchestrator rather than the worker.
pub async fn run_audit_stage(
    ctx: &StepContext,
    repository: &Repository,
    audit: &dyn AuditEngine,
    run_id: RunId,
    fiche_id: &FicheId,
    fiche_cache_id: automation_contracts::FicheCacheId,
    audit_config_id: &AuditConfigId,
    retry: u32,
) -> Result<(), AutomationError> {
    let audit_row = repository
        .insert_audit(fiche_cache_id, audit_config_id, Some(run_id))
        .await?;

    repository
        .update_audit_status(audit_row.id, automation_contracts::AuditStatus::Running, None, None)
        .await?;

    let event_id = deterministic_event_id(run_id, "audit", fiche_id.as_str(), retry);
    let event_id = format!("{event_id}-{audit_config_id}");
    let result = ctx
        .run(&format!("audit-{event_id}"), || async {
            audit.run_audit(run_id, fiche_id, audit_config_id).await
        })
        .await;

    match result {
        Ok(value) => {
            repository
                .update_audit_status(
                    audit_row.id,
                    automation_contracts::AuditStatus::Completed,
                    None,
                    Some(value),
                )
                .await?;
            Ok(())
        }
        Err(e) => {
            repository
                .update_audit_status(
                    audit_row.id,
                    automation_contracts::AuditStatus::Failed,
                    Some(e.to_string()),
                    None,
                )
                .await?;
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::fakes::{FakeAuditEngine, FakeCrmClient, FakeTranscriptionEngine};
    use automation_database::Repository;
    use automation_events::{InMemoryEventBus, StepContext};
    use std::sync::Arc;

    fn input(fiche_id: &str) -> FicheWorkerInput {
        FicheWorkerInput {
            fiche_id: FicheId::from(fiche_id),
            audit_config_id: Some(AuditConfigId::from("cfg-1")),
            schedule_id: ScheduleId::from("s1"),
            run_id: RunId::from(1),
            run_transcription: true,
            skip_if_transcribed: true,
            transcription_priority: TranscriptionPriority::Normal,
            run_audits: true,
            max_recordings: 50,
            only_with_recordings: false,
            group_filter: None,
            retry: 0,
        }
    }

    // `Repository` is a concrete struct with no trait, so the gate scenarios
    // that actually touch it cannot run against an in-memory fake; these
    // tests cover only the pure classification helpers, and
    // `construct_worker_compiles` below just pins the constructor shapes.
    #[test]
    fn ignored_outcome_carries_its_reason() {
        let outcome = FicheWorkerOutput::ignored(FicheId::from("X"), "Fiche not found (404)");
        assert_eq!(outcome.status, FicheOutcomeStatus::Ignored);
        assert_eq!(outcome.error.as_deref(), Some("Fiche not found (404)"));
    }

    #[test]
    fn success_outcome_carries_recordings_count() {
        let outcome = FicheWorkerOutput::success(FicheId::from("A"), 2);
        assert_eq!(outcome.status, FicheOutcomeStatus::Success);
        assert_eq!(outcome.recordings_count, Some(2));
    }

    /// Not a `#[test]`: there is no live `Repository` to pass it in a unit
    /// test. Kept so a signature change to `FicheWorker::new`/`StepContext`
    /// fails the build here instead of only downstream in
    /// `automation-orchestrator`.
    #[allow(dead_code)]
    fn construct_worker_compiles(repository: &Repository, config: &OrchestrationConfig) {
        let crm = FakeCrmClient::new(2);
        let transcription = FakeTranscriptionEngine::new();
        let audit = FakeAuditEngine;
        let _worker = FicheWorker::new(repository, &crm, &transcription, &audit, config);
        let _ctx = StepContext::in_memory(RunId::from(1), Arc::new(InMemoryEventBus::new()));
        let _ = input("A");
    }
}
