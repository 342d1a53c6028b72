//! The Day-Worker: for one calendar day, refreshes the sales
//! list, selects fiches, and fans out bounded-parallel Fiche-Workers.

use crate::clients::{AuditEngine, CrmClient, TranscriptionEngine};
use crate::fiche_worker::{FicheOutcomeStatus, FicheWorker, FicheWorkerInput, FicheWorkerOutput};
use automation_config::OrchestrationConfig;
use automation_contracts::{
    AuditConfigId, AutomationError, FicheCache, FicheId, RunId, ScheduleId, TranscriptionPriority,
};
use automation_database::Repository;
use automation_events::StepContext;
use automation_resilience::{retry, CircuitBreaker, CircuitCallError, RetryConfig};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Debug, Clone)]
pub struct DayWorkerInput {
    pub date: NaiveDate,
    pub run_id: RunId,
    pub schedule_id: ScheduleId,
    pub audit_config_id: Option<AuditConfigId>,
    pub group_filter: Option<Vec<String>>,
    pub only_with_recordings: bool,
    pub only_unaudited: bool,
    pub max_fiches: Option<u32>,
    pub max_recordings_per_fiche: u32,
    pub run_transcription: bool,
    pub skip_if_transcribed: bool,
    pub transcription_priority: TranscriptionPriority,
    pub run_audits: bool,
    pub continue_on_error: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DayWorkerOutput {
    pub date: NaiveDate,
    pub successful: Vec<String>,
    pub failed: Vec<(String, String)>,
    pub ignored: Vec<(String, String)>,
    /// Counts one unit per successful fiche that had transcription enabled
    /// and at least one recording, rather than one unit per completed
    /// recording-level transcription.
    pub transcriptions_run: i32,
    pub audits_run: i32,
}

impl DayWorkerOutput {
    fn failed_day(date: NaiveDate, reason: impl Into<String>) -> Self {
        Self {
            date,
            successful: vec![],
            failed: vec![("*".to_string(), reason.into())],
            ignored: vec![],
            transcriptions_run: 0,
            audits_run: 0,
        }
    }
}

pub struct DayWorker<'a> {
    pub repository: &'a Repository,
    pub crm: &'a dyn CrmClient,
    pub crm_circuit: &'a CircuitBreaker,
    pub transcription: &'a dyn TranscriptionEngine,
    pub audit: &'a dyn AuditEngine,
    pub config: &'a OrchestrationConfig,
}

impl<'a> DayWorker<'a> {
    pub fn new(
        repository: &'a Repository,
        crm: &'a dyn CrmClient,
        crm_circuit: &'a CircuitBreaker,
        transcription: &'a dyn TranscriptionEngine,
        audit: &'a dyn AuditEngine,
        config: &'a OrchestrationConfig,
    ) -> Self {
        Self {
            repository,
            crm,
            crm_circuit,
            transcription,
            audit,
            config,
        }
    }

    pub async fn process(
        &self,
        ctx: &StepContext,
        input: DayWorkerInput,
    ) -> Result<DayWorkerOutput, AutomationError> {
        let sales_list = match self.fetch_sales_list(ctx, &input).await {
            Ok(entries) => entries,
            Err(e) if input.continue_on_error => {
                return Ok(DayWorkerOutput::failed_day(input.date, e.to_string()))
            }
            Err(e) => return Err(e),
        };

        for entry in &sales_list {
            let incoming = FicheCache {
                id: automation_contracts::BigId(0),
                fiche_id: entry.fiche_id.clone(),
                cle: entry.cle.clone(),
                groupe: entry.groupe.clone(),
                details_success: None,
                details_message: None,
                recordings_count: None,
                has_recordings: false,
                raw_data: serde_json::json!({}),
                expires_at: None,
            };
            self.repository.upsert_fiche_cache(&incoming).await?;
        }

        let selected = self.select_fiche_ids(&input, &sales_list).await?;

        let mut successful = vec![];
        let mut failed = vec![];
        let mut ignored = vec![];
        let mut transcriptions_run = 0;
        let mut audits_run = 0;

        let concurrency = self.config.fiche_worker_concurrency.max(1) as usize;
        for batch in selected.chunks(concurrency) {
            let outcomes = futures_join_batch(self, ctx, &input, batch).await;
            let stop_dispatch = apply_batch_outcomes(
                outcomes,
                &input,
                &mut successful,
                &mut failed,
                &mut ignored,
                &mut transcriptions_run,
                &mut audits_run,
            );
            if stop_dispatch {
                break;
            }
        }

        // `continue_on_error=false` + any failure here still finalizes
        // whatever already persisted (stop dispatch, not discard), but the
        // whole Run must still fail — the Run-Orchestrator's finalize step
        // re-derives this same condition from the accumulated outcome
        // counts, so no out-of-band signal is needed here.
        Ok(DayWorkerOutput {
            date: input.date,
            successful,
            failed,
            ignored,
            transcriptions_run,
            audits_run,
        })
    }

    /// CRM sales-list fetch: bounded retry per call, and a
    /// circuit breaker shared across Day-Worker invocations so a CRM outage
    /// trips once instead of every concurrent Day-Worker separately
    /// exhausting its own 3 retries against a dependency already known to
    /// be down.
    /// Exposed `pub` for the same reason as
    /// [`crate::fiche_worker::FicheWorker::ensure_details_cached`]: the
    /// Run-Orchestrator's legacy API-mode path dispatches per-day sales-list
    /// refresh through this method directly rather than going through
    /// [`DayWorker::process`]'s own per-fiche fan-out.
    pub async fn fetch_sales_list(
        &self,
        ctx: &StepContext,
        input: &DayWorkerInput,
    ) -> Result<Vec<crate::clients::SalesListEntry>, AutomationError> {
        let date = input.date;
        ctx.run(&format!("sales-list-{date}"), move || async move {
            self.crm_circuit
                .call(move || {
                    retry("crm.fetch_sales_list", RetryConfig::crm_default(), move || async move {
                        self.crm.fetch_sales_list(date).await
                    })
                })
                .await
                .map_err(|e| match e {
                    CircuitCallError::Open(_) => AutomationError::TransientExternal {
                        service: "crm".to_string(),
                        message: "circuit open after repeated failures".to_string(),
                    },
                    CircuitCallError::Operation(inner) => inner,
                })
        })
        .await
    }

    async fn select_fiche_ids(
        &self,
        input: &DayWorkerInput,
        sales_list: &[crate::clients::SalesListEntry],
    ) -> Result<Vec<FicheId>, AutomationError> {
        let mut selected = Vec::new();
        let mut seen = HashSet::new();

        for entry in sales_list {
            if !seen.insert(entry.fiche_id.clone()) {
                continue;
            }
            if let Some(allowed) = &input.group_filter {
                if !allowed.is_empty() {
                    let groupe = entry.groupe.as_deref();
                    if groupe.map(|g| !allowed.iter().any(|a| a == g)).unwrap_or(true) {
                        continue;
                    }
                }
            }
            if input.only_unaudited {
                if let Some(audit_config_id) = &input.audit_config_id {
                    if let Some(cache) = self.repository.get_fiche_cache(&entry.fiche_id).await? {
                        if self
                            .repository
                            .has_completed_audit(cache.id, audit_config_id)
                            .await?
                        {
                            continue;
                        }
                    }
                }
            }
            selected.push(entry.fiche_id.clone());
            if let Some(max) = input.max_fiches {
                if selected.len() as u32 >= max {
                    break;
                }
            }
        }

        Ok(selected)
    }
}

/// Folds one batch's outcomes into the running accumulators and reports
/// whether dispatch should stop. Dispatch stops as soon as a `Failed`
/// outcome is seen with `continue_on_error=false`: the fiches already
/// persisted by earlier batches are kept (they still get finalized), but no
/// further batches are dispatched this day.
fn apply_batch_outcomes(
    outcomes: Vec<FicheWorkerOutput>,
    input: &DayWorkerInput,
    successful: &mut Vec<String>,
    failed: &mut Vec<(String, String)>,
    ignored: &mut Vec<(String, String)>,
    transcriptions_run: &mut i32,
    audits_run: &mut i32,
) -> bool {
    let mut stop_dispatch = false;
    for outcome in outcomes {
        match outcome.status {
            FicheOutcomeStatus::Success => {
                if input.run_transcription && outcome.recordings_count.unwrap_or(0) > 0 {
                    *transcriptions_run += 1;
                }
                if input.run_audits {
                    *audits_run += 1;
                }
                successful.push(outcome.fiche_id.0);
            }
            FicheOutcomeStatus::Failed => {
                failed.push((outcome.fiche_id.0, outcome.error.unwrap_or_default()));
                if !input.continue_on_error {
                    stop_dispatch = true;
                }
            }
            FicheOutcomeStatus::Ignored => {
                ignored.push((outcome.fiche_id.0, outcome.error.unwrap_or_default()));
            }
        }
    }
    stop_dispatch
}

/// Fans out one batch of Fiche-Workers concurrently. Pulled out as a free
/// function (rather than a `DayWorker` method) purely to keep the borrow of
/// `self` inside the `join_all` future set short-lived and explicit.
async fn futures_join_batch(
    worker: &DayWorker<'_>,
    ctx: &StepContext,
    input: &DayWorkerInput,
    batch: &[FicheId],
) -> Vec<FicheWorkerOutput> {
    let fiche_worker = FicheWorker::new(
        worker.repository,
        worker.crm,
        worker.transcription,
        worker.audit,
        worker.config,
    );

    let futures = batch.iter().map(|fiche_id| {
        let fiche_input = FicheWorkerInput {
            fiche_id: fiche_id.clone(),
            audit_config_id: input.audit_config_id.clone(),
            schedule_id: input.schedule_id.clone(),
            run_id: input.run_id,
            run_transcription: input.run_transcription,
            skip_if_transcribed: input.skip_if_transcribed,
            transcription_priority: input.transcription_priority,
            run_audits: input.run_audits,
            max_recordings: input.max_recordings_per_fiche,
            only_with_recordings: input.only_with_recordings,
            group_filter: input.group_filter.clone(),
            retry: 0,
        };
        fiche_worker.process(ctx, fiche_input)
    });

    // `FicheWorker::process` can itself return `Err` (e.g. a repository
    // error surfacing out of `mark_fiche_not_found`); zipped against `batch`
    // so a bare `Err` still turns into a recorded `Failed` outcome instead of
    // silently vanishing from the successful/failed/ignored accounting.
    batch
        .iter()
        .zip(futures::future::join_all(futures).await)
        .map(|(fiche_id, result)| match result {
            Ok(outcome) => outcome,
            Err(e) => FicheWorkerOutput::failed(fiche_id.clone(), e.to_string()),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_day_records_a_single_placeholder_entry() {
        let date = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
        let output = DayWorkerOutput::failed_day(date, "crm unreachable");
        assert_eq!(output.failed.len(), 1);
        assert_eq!(output.failed[0].1, "crm unreachable");
    }

    fn day_worker_input(continue_on_error: bool, run_transcription: bool, run_audits: bool) -> DayWorkerInput {
        DayWorkerInput {
            date: NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
            run_id: RunId::from(1),
            schedule_id: ScheduleId::from("S1"),
            audit_config_id: None,
            group_filter: None,
            only_with_recordings: false,
            only_unaudited: false,
            max_fiches: None,
            max_recordings_per_fiche: 10,
            run_transcription,
            skip_if_transcribed: false,
            transcription_priority: TranscriptionPriority::Normal,
            run_audits,
            continue_on_error,
        }
    }

    fn accumulators() -> (Vec<String>, Vec<(String, String)>, Vec<(String, String)>, i32, i32) {
        (Vec::new(), Vec::new(), Vec::new(), 0, 0)
    }

    /// Spec §4.B: `continueOnError=false` + a per-fiche failure stops
    /// dispatching the rest of the day's batches.
    #[test]
    fn stops_dispatch_on_failure_when_continue_on_error_is_false() {
        let input = day_worker_input(false, false, false);
        let (mut successful, mut failed, mut ignored, mut transcriptions_run, mut audits_run) = accumulators();
        let outcomes = vec![FicheWorkerOutput {
            fiche_id: FicheId::from("A"),
            status: FicheOutcomeStatus::Failed,
            error: Some("boom".to_string()),
            recordings_count: None,
        }];
        let stop = apply_batch_outcomes(
            outcomes,
            &input,
            &mut successful,
            &mut failed,
            &mut ignored,
            &mut transcriptions_run,
            &mut audits_run,
        );
        assert!(stop);
        assert_eq!(failed, vec![("A".to_string(), "boom".to_string())]);
    }

    #[test]
    fn keeps_dispatching_on_failure_when_continue_on_error_is_true() {
        let input = day_worker_input(true, false, false);
        let (mut successful, mut failed, mut ignored, mut transcriptions_run, mut audits_run) = accumulators();
        let outcomes = vec![FicheWorkerOutput {
            fiche_id: FicheId::from("A"),
            status: FicheOutcomeStatus::Failed,
            error: Some("boom".to_string()),
            recordings_count: None,
        }];
        let stop = apply_batch_outcomes(
            outcomes,
            &input,
            &mut successful,
            &mut failed,
            &mut ignored,
            &mut transcriptions_run,
            &mut audits_run,
        );
        assert!(!stop);
    }

    /// Spec §8 scenario 2: a NOT_FOUND fiche lands in `ignored`, not
    /// `failed`, and never stops dispatch even with `continueOnError=false`.
    #[test]
    fn not_found_outcome_is_ignored_not_failed_and_never_stops_dispatch() {
        let input = day_worker_input(false, false, false);
        let (mut successful, mut failed, mut ignored, mut transcriptions_run, mut audits_run) = accumulators();
        let outcomes = vec![FicheWorkerOutput {
            fiche_id: FicheId::from("A"),
            status: FicheOutcomeStatus::Ignored,
            error: Some("Fiche not found (404)".to_string()),
            recordings_count: None,
        }];
        let stop = apply_batch_outcomes(
            outcomes,
            &input,
            &mut successful,
            &mut failed,
            &mut ignored,
            &mut transcriptions_run,
            &mut audits_run,
        );
        assert!(!stop);
        assert!(failed.is_empty());
        assert_eq!(ignored, vec![("A".to_string(), "Fiche not found (404)".to_string())]);
    }

    /// Spec §8 scenario 3: a transcription stall fails that fiche while the
    /// rest of the batch's successes are still counted.
    #[test]
    fn transcription_stall_is_recorded_as_failed_alongside_other_successes() {
        let input = day_worker_input(true, true, false);
        let (mut successful, mut failed, mut ignored, mut transcriptions_run, mut audits_run) = accumulators();
        let outcomes = vec![
            FicheWorkerOutput {
                fiche_id: FicheId::from("A"),
                status: FicheOutcomeStatus::Success,
                error: None,
                recordings_count: Some(1),
            },
            FicheWorkerOutput {
                fiche_id: FicheId::from("B"),
                status: FicheOutcomeStatus::Failed,
                error: Some("Transcription incomplete (timeout/stall)".to_string()),
                recordings_count: None,
            },
        ];
        let stop = apply_batch_outcomes(
            outcomes,
            &input,
            &mut successful,
            &mut failed,
            &mut ignored,
            &mut transcriptions_run,
            &mut audits_run,
        );
        assert!(!stop);
        assert_eq!(successful, vec!["A".to_string()]);
        assert_eq!(transcriptions_run, 1);
        assert_eq!(
            failed,
            vec![("B".to_string(), "Transcription incomplete (timeout/stall)".to_string())]
        );
    }
}
