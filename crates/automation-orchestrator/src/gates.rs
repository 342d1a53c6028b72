//! The three sequential fan-in gates shared by Manual mode and legacy API
//! mode: fiche-details, transcription, audit. Each gate dispatches
//! outstanding work for the whole targeted fiche set through the same
//! checkpointed worker functions the new-architecture Day-Worker uses, then
//! confirms completion against the Repository's grouped status queries
//! before handing the survivors to the next gate.
//!
//! Dispatch in this workspace is a direct, awaited call rather than a
//! fire-and-forget event, so a gate's first poll typically already observes
//! the batch as complete; the poll loop still runs so a future asynchronous
//! transport, or a retry wave, is handled by the exact same stall/timeout
//! logic.

use crate::run_orchestrator::Collaborators;
use automation_contracts::{AuditConfigId, AutomationError, FicheCache, FicheCacheId, FicheId, RunId};
use automation_workers::{dispatch_pending_transcriptions, run_audit_stage, FicheWorker, FicheWorkerInput};
use automation_events::StepContext;
use std::time::Duration;

/// One gate's classification of the batch it was given: fiches that cleared
/// the gate (forwarded to the next one, paired with their cached row),
/// fiches terminally ignored (never retried), and fiches that failed: failed
/// fiches are recorded with reason and excluded from downstream stages, but
/// the Run continues.
pub struct GateOutcome {
    pub ready: Vec<(FicheWorkerInput, FicheCache)>,
    pub ignored: Vec<(FicheId, String)>,
    pub failed: Vec<(FicheId, String)>,
}

/// Stages 1-3 run per-fiche inside the Fiche-Worker; this gate dispatches
/// stage 1 through the same [`FicheWorker::ensure_details_cached`]
/// and then applies stages 2-3 (group filter, recording policy) itself,
/// since those two stages decide gate membership rather than an individual
/// worker's short-circuit return.
pub async fn fiche_details_gate(
    ctx: &StepContext,
    collaborators: &Collaborators<'_>,
    run_id: RunId,
    inputs: Vec<FicheWorkerInput>,
) -> Result<GateOutcome, AutomationError> {
    let worker = FicheWorker::new(
        collaborators.repository,
        collaborators.crm,
        collaborators.transcription,
        collaborators.audit,
        collaborators.config,
    );

    let mut ready = Vec::new();
    let mut ignored = Vec::new();
    let mut failed = Vec::new();

    let concurrency = collaborators.config.fiche_worker_concurrency.max(1) as usize;
    for batch in inputs.chunks(concurrency) {
        let outcomes = futures::future::join_all(batch.iter().map(|input| {
            let worker = &worker;
            async move { (input.clone(), worker.ensure_details_cached(ctx, input).await) }
        }))
        .await;

        for (input, result) in outcomes {
            match result {
                Ok(cache) => classify_details(&mut ready, &mut ignored, input, cache),
                Err(AutomationError::TerminalNotFound) => {
                    collaborators
                        .repository
                        .mark_fiche_not_found(&input.fiche_id)
                        .await?;
                    ignored.push((input.fiche_id, "Fiche not found (404)".to_string()));
                }
                Err(e) => failed.push((input.fiche_id, e.to_string())),
            }
        }
    }

    let gate = collaborators.config.fiche_details_gate;
    ctx.poll_until(
        &format!("fiche-details-gate-{run_id}"),
        gate.max_polls(),
        Duration::from_secs(gate.poll_interval_seconds),
        || {
            let outstanding = failed.len();
            async move { Ok::<(bool, usize), AutomationError>((outstanding == 0, outstanding)) }
        },
    )
    .await?;

    Ok(GateOutcome { ready, ignored, failed })
}

/// Group filter, then recording-count policy (ceiling,
/// `onlyWithRecordings`).
fn classify_details(
    ready: &mut Vec<(FicheWorkerInput, FicheCache)>,
    ignored: &mut Vec<(FicheId, String)>,
    input: FicheWorkerInput,
    cache: FicheCache,
) {
    if let Some(allowed) = &input.group_filter {
        if !allowed.is_empty() {
            let groupe = cache.groupe.as_deref();
            if groupe.map(|g| !allowed.iter().any(|a| a == g)).unwrap_or(true) {
                ignored.push((input.fiche_id, "Groupe not selected".to_string()));
                return;
            }
        }
    }

    let recordings_count = cache.recordings_count.unwrap_or(0);
    let ceiling = input.max_recordings;
    if recordings_count as u32 > ceiling {
        ignored.push((input.fiche_id, "Too many recordings".to_string()));
        return;
    }
    if recordings_count == 0 && input.only_with_recordings {
        ignored.push((input.fiche_id, "No recordings".to_string()));
        return;
    }

    ready.push((input, cache));
}

/// Transcription gate: dispatches every pending recording for fiches with
/// transcription enabled, then confirms
/// every dispatched fiche's recordings are all transcribed.
pub async fn transcription_gate(
    ctx: &StepContext,
    collaborators: &Collaborators<'_>,
    run_id: RunId,
    ready: Vec<(FicheWorkerInput, FicheCache)>,
    retry: u32,
) -> Result<GateOutcome, AutomationError> {
    let mut failed = Vec::new();
    let mut eligible_ids = Vec::new();

    for (input, cache) in &ready {
        if input.run_transcription && cache.recordings_count.unwrap_or(0) > 0 {
            eligible_ids.push(cache.id);
            if let Err(e) = dispatch_pending_transcriptions(
                ctx,
                collaborators.repository,
                collaborators.transcription,
                run_id,
                &input.fiche_id,
                cache.id,
                input.skip_if_transcribed,
                input.transcription_priority,
                retry,
            )
            .await
            {
                failed.push((input.fiche_id.clone(), e.to_string()));
            }
        }
    }

    let gate = collaborators.config.transcription_gate;
    ctx.poll_until(
        &format!("transcription-gate-{run_id}"),
        gate.max_polls(),
        Duration::from_secs(gate.poll_interval_seconds),
        || {
            let repository = collaborators.repository;
            let eligible_ids = &eligible_ids;
            async move {
                let status = repository.transcription_gate_status(eligible_ids).await?;
                let outstanding = status.values().filter(|done| !**done).count();
                Ok((outstanding == 0, outstanding))
            }
        },
    )
    .await?;

    let final_status = collaborators
        .repository
        .transcription_gate_status(&eligible_ids)
        .await?;

    let failed_ids: std::collections::HashSet<FicheCacheId> = ready
        .iter()
        .filter(|(_, cache)| {
            eligible_ids.contains(&cache.id) && final_status.get(&cache.id.get()) != Some(&true)
        })
        .map(|(_, cache)| cache.id)
        .collect();

    let mut gate_ready = Vec::new();
    for (input, cache) in ready {
        if failed_ids.contains(&cache.id) {
            failed.push((input.fiche_id, "Transcription incomplete (timeout/stall)".to_string()));
        } else {
            gate_ready.push((input, cache));
        }
    }

    Ok(GateOutcome { ready: gate_ready, ignored: Vec::new(), failed })
}

#[cfg(test)]
mod classify_details_tests {
    use super::*;
    use automation_contracts::TranscriptionPriority;

    fn input(group_filter: Option<Vec<String>>, max_recordings: u32, only_with_recordings: bool) -> FicheWorkerInput {
        FicheWorkerInput {
            fiche_id: FicheId::from("F1"),
            audit_config_id: None,
            schedule_id: automation_contracts::ScheduleId::from("S1"),
            run_id: RunId::from(1),
            run_transcription: false,
            skip_if_transcribed: false,
            transcription_priority: TranscriptionPriority::Normal,
            run_audits: false,
            max_recordings,
            only_with_recordings,
            group_filter,
            retry: 0,
        }
    }

    fn cache(groupe: Option<&str>, recordings_count: Option<i32>) -> FicheCache {
        FicheCache {
            id: FicheCacheId::from(1),
            fiche_id: FicheId::from("F1"),
            cle: None,
            groupe: groupe.map(str::to_string),
            details_success: Some(true),
            details_message: None,
            recordings_count,
            has_recordings: recordings_count.unwrap_or(0) > 0,
            raw_data: serde_json::json!({}),
            expires_at: None,
        }
    }

    #[test]
    fn passes_through_when_no_group_filter_and_within_ceiling() {
        let mut ready = Vec::new();
        let mut ignored = Vec::new();
        classify_details(&mut ready, &mut ignored, input(None, 10, false), cache(Some("G1"), Some(2)));
        assert_eq!(ready.len(), 1);
        assert!(ignored.is_empty());
    }

    #[test]
    fn ignores_when_groupe_not_in_allowed_set() {
        let mut ready = Vec::new();
        let mut ignored = Vec::new();
        let allowed = Some(vec!["G2".to_string()]);
        classify_details(&mut ready, &mut ignored, input(allowed, 10, false), cache(Some("G1"), Some(2)));
        assert!(ready.is_empty());
        assert_eq!(ignored.len(), 1);
        assert_eq!(ignored[0].1, "Groupe not selected");
    }

    #[test]
    fn ignores_when_groupe_missing_but_filter_set() {
        let mut ready = Vec::new();
        let mut ignored = Vec::new();
        let allowed = Some(vec!["G2".to_string()]);
        classify_details(&mut ready, &mut ignored, input(allowed, 10, false), cache(None, Some(2)));
        assert!(ready.is_empty());
        assert_eq!(ignored[0].1, "Groupe not selected");
    }

    #[test]
    fn empty_group_filter_matches_everything() {
        let mut ready = Vec::new();
        let mut ignored = Vec::new();
        classify_details(&mut ready, &mut ignored, input(Some(Vec::new()), 10, false), cache(Some("G1"), Some(2)));
        assert_eq!(ready.len(), 1);
    }

    #[test]
    fn ignores_when_recordings_exceed_ceiling() {
        let mut ready = Vec::new();
        let mut ignored = Vec::new();
        classify_details(&mut ready, &mut ignored, input(None, 3, false), cache(Some("G1"), Some(4)));
        assert!(ready.is_empty());
        assert_eq!(ignored[0].1, "Too many recordings");
    }

    #[test]
    fn ignores_when_only_with_recordings_and_none_present() {
        let mut ready = Vec::new();
        let mut ignored = Vec::new();
        classify_details(&mut ready, &mut ignored, input(None, 10, true), cache(Some("G1"), Some(0)));
        assert!(ready.is_empty());
        assert_eq!(ignored[0].1, "No recordings");
    }

    #[test]
    fn passes_with_zero_recordings_when_only_with_recordings_is_false() {
        let mut ready = Vec::new();
        let mut ignored = Vec::new();
        classify_details(&mut ready, &mut ignored, input(None, 10, false), cache(Some("G1"), Some(0)));
        assert_eq!(ready.len(), 1);
        assert!(ignored.is_empty());
    }

    #[test]
    fn missing_recordings_count_treated_as_zero() {
        let mut ready = Vec::new();
        let mut ignored = Vec::new();
        classify_details(&mut ready, &mut ignored, input(None, 10, true), cache(Some("G1"), None));
        assert!(ready.is_empty());
        assert_eq!(ignored[0].1, "No recordings");
    }
}

/// Audit gate: dispatches the effective audit-config-id set for every
/// fiche with audits enabled, then confirms
/// every `(ficheCacheId, auditConfigId)` pair reached a terminal status.
pub async fn audit_gate(
    ctx: &StepContext,
    collaborators: &Collaborators<'_>,
    run_id: RunId,
    ready: Vec<(FicheWorkerInput, FicheCache)>,
    audit_config_ids: &[AuditConfigId],
    retry: u32,
) -> Result<GateOutcome, AutomationError> {
    let mut failed = Vec::new();
    let mut eligible_ids = Vec::new();

    if audit_config_ids.is_empty() {
        return Ok(GateOutcome { ready, ignored: Vec::new(), failed });
    }

    for (input, cache) in &ready {
        if !input.run_audits {
            continue;
        }
        eligible_ids.push(cache.id);
        for audit_config_id in audit_config_ids {
            if let Err(e) = run_audit_stage(
                ctx,
                collaborators.repository,
                collaborators.audit,
                run_id,
                &input.fiche_id,
                cache.id,
                audit_config_id,
                retry,
            )
            .await
            {
                failed.push((input.fiche_id.clone(), e.to_string()));
            }
        }
    }

    let gate = collaborators.config.audit_gate;
    ctx.poll_until(
        &format!("audit-gate-{run_id}"),
        gate.max_polls(),
        Duration::from_secs(gate.poll_interval_seconds),
        || {
            let repository = collaborators.repository;
            let eligible_ids = &eligible_ids;
            let expected = audit_config_ids.len();
            async move {
                let rows = repository.audit_gate_rows(run_id, eligible_ids).await?;
                let mut terminal_counts: std::collections::HashMap<i64, usize> =
                    std::collections::HashMap::new();
                for (fiche_cache_id, status) in rows {
                    if status.is_terminal() {
                        *terminal_counts.entry(fiche_cache_id.get()).or_insert(0) += 1;
                    }
                }
                let outstanding = eligible_ids
                    .iter()
                    .filter(|id| terminal_counts.get(&id.get()).copied().unwrap_or(0) < expected)
                    .count();
                Ok((outstanding == 0, outstanding))
            }
        },
    )
    .await?;

    let final_rows = collaborators
        .repository
        .audit_gate_rows(run_id, &eligible_ids)
        .await?;
    let mut completed_counts: std::collections::HashMap<i64, usize> = std::collections::HashMap::new();
    for (fiche_cache_id, status) in final_rows {
        if status == automation_contracts::AuditStatus::Completed {
            *completed_counts.entry(fiche_cache_id.get()).or_insert(0) += 1;
        }
    }

    let mut gate_ready = Vec::new();
    for (input, cache) in ready {
        if !input.run_audits {
            gate_ready.push((input, cache));
            continue;
        }
        let completed = completed_counts.get(&cache.id.get()).copied().unwrap_or(0);
        if completed == audit_config_ids.len() {
            gate_ready.push((input, cache));
        } else {
            failed.push((input.fiche_id.clone(), "Audit incomplete (timeout/stall)".to_string()));
        }
    }

    Ok(GateOutcome { ready: gate_ready, ignored: Vec::new(), failed })
}
