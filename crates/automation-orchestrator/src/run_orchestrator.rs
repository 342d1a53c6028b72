//! The Run-Orchestrator: the single durable workflow that turns one
//! `automation/run` event into a finished `Run` row, dispatching through
//! either Manual-mode/legacy-API-mode's shared fan-in gates or the
//! new-architecture API-mode's Day-Worker fan-out.

use crate::dates::resolve_date_range;
use crate::gates::{audit_gate, fiche_details_gate, transcription_gate, GateOutcome};
use crate::progress::{publish_progress, RunProgressSnapshot};
use automation_config::OrchestrationConfig;
use automation_contracts::{
    AuditConfigId, AutomationError, AutomationRunEvent, BigId, FicheCache, FicheId, LastRunStatus,
    LogLevel, RealtimeEventKind, ResultSummary, Run, RunId, Schedule, SelectionMode, WebhookPayload,
};
use automation_database::Repository;
use automation_events::notifications::{render_email, send_webhook, should_notify, EmailSender};
use automation_events::{RealtimePublisher, StepContext};
use automation_resilience::{log_run_event, CircuitBreaker};
use automation_workers::{
    AuditEngine, CrmClient, DayWorker, DayWorkerInput, FicheWorkerInput, SalesListEntry,
    TranscriptionEngine,
};
use chrono::{NaiveDate, Utc};
use std::collections::HashSet;
use std::time::Duration;

/// The Run-Orchestrator's external collaborators, borrowed for the duration
/// of one `run()` call. Mirrors how [`automation_workers::DayWorker`] and
/// [`automation_workers::FicheWorker`] group the same five dependencies.
pub struct Collaborators<'a> {
    pub repository: &'a Repository,
    pub crm: &'a dyn CrmClient,
    pub crm_circuit: &'a CircuitBreaker,
    pub transcription: &'a dyn TranscriptionEngine,
    pub audit: &'a dyn AuditEngine,
    pub config: &'a OrchestrationConfig,
}

pub struct RunOrchestrator<'a> {
    pub collaborators: Collaborators<'a>,
    pub realtime: &'a RealtimePublisher,
    pub http_client: &'a reqwest::Client,
    pub email_sender: &'a dyn EmailSender,
}

impl<'a> RunOrchestrator<'a> {
    pub fn new(
        collaborators: Collaborators<'a>,
        realtime: &'a RealtimePublisher,
        http_client: &'a reqwest::Client,
        email_sender: &'a dyn EmailSender,
    ) -> Self {
        Self {
            collaborators,
            realtime,
            http_client,
            email_sender,
        }
    }

    /// The whole Run lifecycle, from schedule validation through
    /// webhook/email delivery. `ctx` is supplied by the caller (production
    /// code builds a Postgres-backed [`StepContext`], scenario tests an
    /// in-memory one) so this type never decides its own checkpoint storage.
    pub async fn run(&self, ctx: &StepContext, event: AutomationRunEvent) -> Result<Run, AutomationError> {
        let repository = self.collaborators.repository;

        let schedule = repository
            .get_schedule(&event.schedule_id)
            .await?
            .ok_or_else(|| AutomationError::Config(format!("schedule {} not found", event.schedule_id)))?;
        if !schedule.is_active {
            return Err(AutomationError::Config(format!(
                "schedule {} is inactive",
                schedule.id
            )));
        }

        let started_at = Utc::now();
        let payload_snapshot = serde_json::to_value(&event)
            .map_err(|e| AutomationError::Config(format!("event not serializable: {e}")))?;
        let run = repository
            .create_run(&schedule.id, started_at, payload_snapshot)
            .await?;
        repository
            .mark_schedule_triggered(&schedule.id, event.due_at.unwrap_or(started_at))
            .await?;

        let start_log = log_run_event(
            run.id,
            LogLevel::Info,
            format!("run started for schedule {}", schedule.name),
            serde_json::json!({"scheduleId": schedule.id.as_str()}),
        );
        repository.append_run_log(&start_log).await?;
        self.realtime.publish(
            run.id,
            RealtimeEventKind::RunStarted,
            serde_json::json!({"scheduleId": schedule.id.as_str()}),
        );

        let budget = Duration::from_millis(self.collaborators.config.workflow_finish_timeout_ms.max(0) as u64);
        let outcome = match tokio::time::timeout(budget, self.execute(ctx, &schedule, &event, run.id)).await {
            Ok(result) => result,
            Err(_) => Err(AutomationError::StageIncomplete(format!(
                "run exceeded the {}ms finish timeout",
                self.collaborators.config.workflow_finish_timeout_ms
            ))),
        };
        self.finalize(&schedule, run.id, started_at, outcome).await
    }

    async fn execute(
        &self,
        ctx: &StepContext,
        schedule: &Schedule,
        event: &AutomationRunEvent,
        run_id: RunId,
    ) -> Result<(ResultSummary, i32, i32), AutomationError> {
        let effective_audit_ids = self.resolve_effective_audit_config_ids(schedule).await?;

        if schedule.selection.mode == SelectionMode::Manual || event.override_fiche_selection.is_some() {
            let fiche_ids = resolve_manual_fiche_ids(schedule, event.override_fiche_selection.clone());
            if fiche_ids.is_empty() {
                return Ok((ResultSummary::default(), 0, 0));
            }
            let inputs: Vec<FicheWorkerInput> = fiche_ids
                .into_iter()
                .map(|fiche_id| self.build_fiche_worker_input(schedule, run_id, fiche_id, &effective_audit_ids))
                .collect();
            return self
                .run_gate_pipeline(ctx, schedule, run_id, inputs, &effective_audit_ids)
                .await;
        }

        let date_range = schedule
            .selection
            .date_range
            .clone()
            .ok_or_else(|| AutomationError::Config("api-mode schedule missing dateRange".to_string()))?;
        let dates = resolve_date_range(&date_range, &schedule.timezone, event.due_at.unwrap_or_else(Utc::now))?;
        if dates.is_empty() {
            return Ok((ResultSummary::default(), 0, 0));
        }

        let primary_audit_config_id = effective_audit_ids.first().cloned();
        let sales_entries = self
            .revalidate_sales_lists(ctx, schedule, run_id, primary_audit_config_id.clone(), &dates)
            .await?;

        if self.collaborators.config.use_legacy_dispatch {
            let fiche_ids = self
                .select_fiche_ids_from_sales_entries(schedule, primary_audit_config_id.as_ref(), &sales_entries)
                .await?;
            if fiche_ids.is_empty() {
                return Ok((ResultSummary::default(), 0, 0));
            }
            let inputs: Vec<FicheWorkerInput> = fiche_ids
                .into_iter()
                .map(|fiche_id| self.build_fiche_worker_input(schedule, run_id, fiche_id, &effective_audit_ids))
                .collect();
            self.run_gate_pipeline(ctx, schedule, run_id, inputs, &effective_audit_ids)
                .await
        } else {
            self.run_new_architecture_api_mode(ctx, schedule, run_id, &dates, &effective_audit_ids)
                .await
        }
    }

    /// Dispatches a whole [`DayWorker`] per resolved date, bounded by
    /// `day_concurrency`, then runs any audit config ids beyond the
    /// Day-Worker's single primary one through the audit gate directly (a
    /// Day-Worker only carries one `audit_config_id`).
    async fn run_new_architecture_api_mode(
        &self,
        ctx: &StepContext,
        schedule: &Schedule,
        run_id: RunId,
        dates: &[NaiveDate],
        effective_audit_ids: &[AuditConfigId],
    ) -> Result<(ResultSummary, i32, i32), AutomationError> {
        let day_worker = DayWorker::new(
            self.collaborators.repository,
            self.collaborators.crm,
            self.collaborators.crm_circuit,
            self.collaborators.transcription,
            self.collaborators.audit,
            self.collaborators.config,
        );

        let mut summary = ResultSummary::default();
        let mut transcriptions_run = 0;
        let mut audits_run = 0;
        let mut successful_fiche_ids: Vec<FicheId> = Vec::new();

        let concurrency = self.collaborators.config.day_concurrency.max(1) as usize;
        for batch in dates.chunks(concurrency) {
            let futures = batch.iter().map(|date| {
                let input = self.build_day_worker_input(schedule, run_id, *date, effective_audit_ids.first().cloned());
                day_worker.process(ctx, input)
            });
            let outputs = futures::future::join_all(futures).await;

            for output in outputs {
                let output = output?;
                transcriptions_run += output.transcriptions_run;
                audits_run += output.audits_run;
                for fiche_id in output.successful {
                    summary.record_successful(fiche_id.clone());
                    successful_fiche_ids.push(FicheId::from(fiche_id));
                }
                for (fiche_id, reason) in output.failed {
                    summary.record_failed(fiche_id, reason);
                }
                for (fiche_id, reason) in output.ignored {
                    summary.record_ignored(fiche_id, reason);
                }
            }
        }

        publish_progress(
            self.collaborators.repository,
            self.realtime,
            run_id,
            RunProgressSnapshot {
                stage: "day-worker-dispatch".to_string(),
                total: summary.total(),
                ready: successful_fiche_ids.len(),
                ignored: summary.ignored.len(),
                failed: summary.failed.len(),
            },
        )
        .await?;

        if effective_audit_ids.len() > 1 && !successful_fiche_ids.is_empty() {
            let caches = self.collaborators.repository.get_fiche_caches(&successful_fiche_ids).await?;
            let ready: Vec<(FicheWorkerInput, FicheCache)> = caches
                .into_iter()
                .map(|cache| {
                    let input = self.build_fiche_worker_input(schedule, run_id, cache.fiche_id.clone(), effective_audit_ids);
                    (input, cache)
                })
                .collect();

            let outcome = audit_gate_with_retry(
                ctx,
                &self.collaborators,
                schedule,
                run_id,
                ready,
                &effective_audit_ids[1..],
            )
            .await?;
            audits_run += outcome.ready.len() as i32;
            for (fiche_id, reason) in outcome.failed {
                summary.record_failed(fiche_id.0, reason);
            }
            for (fiche_id, reason) in outcome.ignored {
                summary.record_ignored(fiche_id.0, reason);
            }
        }

        Ok((summary, transcriptions_run, audits_run))
    }

    /// The shared gate pipeline used by Manual mode and legacy API mode.
    /// Each gate's survivors feed the next; failed
    /// or ignored fiches are recorded immediately and never retried within
    /// the same gate invocation (retries happen across gate *waves*, see
    /// [`fiche_details_gate_with_retry`] and friends).
    async fn run_gate_pipeline(
        &self,
        ctx: &StepContext,
        schedule: &Schedule,
        run_id: RunId,
        inputs: Vec<FicheWorkerInput>,
        effective_audit_ids: &[AuditConfigId],
    ) -> Result<(ResultSummary, i32, i32), AutomationError> {
        let mut summary = ResultSummary::default();
        let total = inputs.len();

        let details = fiche_details_gate_with_retry(ctx, &self.collaborators, schedule, run_id, inputs).await?;
        for (fiche_id, reason) in &details.ignored {
            summary.record_ignored(fiche_id.0.clone(), reason.clone());
        }
        for (fiche_id, reason) in &details.failed {
            summary.record_failed(fiche_id.0.clone(), reason.clone());
        }
        publish_progress(
            self.collaborators.repository,
            self.realtime,
            run_id,
            RunProgressSnapshot {
                stage: "fiche-details-gate".to_string(),
                total,
                ready: details.ready.len(),
                ignored: details.ignored.len(),
                failed: details.failed.len(),
            },
        )
        .await?;

        let transcription =
            transcription_gate_with_retry(ctx, &self.collaborators, schedule, run_id, details.ready).await?;
        for (fiche_id, reason) in &transcription.failed {
            summary.record_failed(fiche_id.0.clone(), reason.clone());
        }
        let transcriptions_run = transcription
            .ready
            .iter()
            .filter(|(input, cache)| input.run_transcription && cache.recordings_count.unwrap_or(0) > 0)
            .count() as i32;
        publish_progress(
            self.collaborators.repository,
            self.realtime,
            run_id,
            RunProgressSnapshot {
                stage: "transcription-gate".to_string(),
                total,
                ready: transcription.ready.len(),
                ignored: 0,
                failed: transcription.failed.len(),
            },
        )
        .await?;

        let audit = audit_gate_with_retry(
            ctx,
            &self.collaborators,
            schedule,
            run_id,
            transcription.ready,
            effective_audit_ids,
        )
        .await?;
        for (fiche_id, reason) in &audit.failed {
            summary.record_failed(fiche_id.0.clone(), reason.clone());
        }
        let audits_run = audit
            .ready
            .iter()
            .filter(|(input, _)| input.run_audits)
            .count() as i32
            * effective_audit_ids.len().max(1) as i32;
        publish_progress(
            self.collaborators.repository,
            self.realtime,
            run_id,
            RunProgressSnapshot {
                stage: "audit-gate".to_string(),
                total,
                ready: audit.ready.len(),
                ignored: 0,
                failed: audit.failed.len(),
            },
        )
        .await?;

        for (_, cache) in &audit.ready {
            summary.record_successful(cache.fiche_id.0.clone());
        }

        Ok((summary, transcriptions_run, audits_run))
    }

    async fn finalize(
        &self,
        schedule: &Schedule,
        run_id: RunId,
        started_at: chrono::DateTime<Utc>,
        outcome: Result<(ResultSummary, i32, i32), AutomationError>,
    ) -> Result<Run, AutomationError> {
        let repository = self.collaborators.repository;
        let completed_at = Utc::now();

        let (result_summary, transcriptions_run, audits_run, error_message) = match outcome {
            Ok((summary, transcriptions_run, audits_run)) => (summary, transcriptions_run, audits_run, None),
            Err(e) => {
                let mut summary = ResultSummary::default();
                summary.record_failed("*", e.to_string());
                (summary, 0, 0, Some(e.to_string()))
            }
        };

        let run = repository
            .finalize_run(
                run_id,
                result_summary,
                transcriptions_run,
                audits_run,
                error_message.clone(),
                completed_at,
                schedule.failure_policy.continue_on_error,
            )
            .await?;

        let last_run_status = match run.status {
            automation_contracts::RunStatus::Completed => LastRunStatus::Completed,
            automation_contracts::RunStatus::Partial => LastRunStatus::Partial,
            automation_contracts::RunStatus::Failed => LastRunStatus::Failed,
            automation_contracts::RunStatus::Running => LastRunStatus::Running,
        };
        repository
            .update_schedule_last_run_status(&schedule.id, last_run_status)
            .await?;

        let kind = if matches!(run.status, automation_contracts::RunStatus::Failed) {
            RealtimeEventKind::RunFailed
        } else {
            RealtimeEventKind::RunCompleted
        };
        self.realtime.publish(
            run_id,
            kind,
            serde_json::json!({"status": run.status, "errorMessage": error_message}),
        );

        let completion_log = log_run_event(
            run_id,
            LogLevel::Info,
            format!("run finished with status {:?}", run.status),
            serde_json::json!({}),
        );
        repository.append_run_log(&completion_log).await?;

        self.notify(schedule, &run).await;

        Ok(run)
    }

    /// Webhook/email delivery is fire-and-log, never fails the Run.
    async fn notify(&self, schedule: &Schedule, run: &Run) {
        if !should_notify(&schedule.notifications, run.status) {
            return;
        }

        let duration_seconds = run.duration_ms.unwrap_or(0) as f64 / 1000.0;
        let payload = WebhookPayload {
            schedule_id: schedule.id.clone(),
            schedule_name: schedule.name.clone(),
            run_id: run.id,
            status: run.status,
            duration_seconds,
            total_fiches: run.total_fiches,
            successful_fiches: run.successful_fiches,
            failed_fiches: run.failed_fiches,
            ignored_fiches: run.ignored_fiches,
            transcriptions_run: run.transcriptions_run,
            audits_run: run.audits_run,
            failures: run.result_summary.failed.clone(),
        };

        if let Some(webhook_url) = &schedule.notifications.webhook_url {
            if let Err(e) = send_webhook(self.http_client, webhook_url, &payload).await {
                tracing::warn!(run_id = %run.id, error = %e, "webhook delivery failed");
            }
        }

        if !schedule.notifications.notify_emails.is_empty() {
            let message = render_email(&schedule.name, &payload, schedule.notifications.notify_emails.clone());
            if let Err(e) = self.email_sender.send(message).await {
                tracing::warn!(run_id = %run.id, error = %e, "email delivery failed");
            }
        }
    }

    async fn resolve_effective_audit_config_ids(&self, schedule: &Schedule) -> Result<Vec<AuditConfigId>, AutomationError> {
        let mut ids = schedule.stage_flags.specific_audit_config_ids.clone();
        if schedule.stage_flags.use_automatic_audits {
            let automatic = self.collaborators.repository.list_automatic_audit_config_ids().await?;
            for id in automatic {
                if !ids.contains(&id) {
                    ids.push(id);
                }
            }
        }
        Ok(ids)
    }

    /// Mirrors [`DayWorker`]'s own private `select_fiche_ids`,
    /// reimplemented here because legacy API mode never constructs a
    /// Day-Worker and that method isn't exposed.
    async fn select_fiche_ids_from_sales_entries(
        &self,
        schedule: &Schedule,
        audit_config_id: Option<&AuditConfigId>,
        sales_entries: &[SalesListEntry],
    ) -> Result<Vec<FicheId>, AutomationError> {
        let mut selected = Vec::new();
        let mut seen = HashSet::new();

        for entry in sales_entries {
            if !seen.insert(entry.fiche_id.clone()) {
                continue;
            }
            if let Some(allowed) = &schedule.selection.group_filter {
                if !allowed.is_empty() {
                    let groupe = entry.groupe.as_deref();
                    if groupe.map(|g| !allowed.iter().any(|a| a == g)).unwrap_or(true) {
                        continue;
                    }
                }
            }
            if schedule.selection.only_unaudited {
                if let Some(audit_config_id) = audit_config_id {
                    if let Some(cache) = self.collaborators.repository.get_fiche_cache(&entry.fiche_id).await? {
                        if self
                            .collaborators
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
            if let Some(max) = schedule.selection.max_fiches {
                if selected.len() as u32 >= max {
                    break;
                }
            }
        }

        Ok(selected)
    }

    /// Refreshes every resolved date's sales list ahead of
    /// dispatch, batched in waves of `crm_revalidation_concurrency` with a
    /// 1s delay between waves. The same memoized step name
    /// (`sales-list-{date}`) that [`DayWorker::process`] uses internally, so
    /// on the new-architecture path this fetch and the Day-Worker's own
    /// fetch collapse into a single CRM call; on the legacy path this is the
    /// only sales-list fetch, so its results are returned rather than
    /// discarded.
    async fn revalidate_sales_lists(
        &self,
        ctx: &StepContext,
        schedule: &Schedule,
        run_id: RunId,
        primary_audit_config_id: Option<AuditConfigId>,
        dates: &[NaiveDate],
    ) -> Result<Vec<SalesListEntry>, AutomationError> {
        let day_worker = DayWorker::new(
            self.collaborators.repository,
            self.collaborators.crm,
            self.collaborators.crm_circuit,
            self.collaborators.transcription,
            self.collaborators.audit,
            self.collaborators.config,
        );

        let concurrency = self.collaborators.config.crm_revalidation_concurrency.max(1) as usize;
        let chunks: Vec<&[NaiveDate]> = dates.chunks(concurrency).collect();
        let mut all_entries = Vec::new();

        for (wave, batch) in chunks.iter().enumerate() {
            let futures = batch.iter().map(|date| {
                let input = self.build_day_worker_input(schedule, run_id, *date, primary_audit_config_id.clone());
                day_worker.fetch_sales_list(ctx, &input)
            });
            for result in futures::future::join_all(futures).await {
                all_entries.extend(result?);
            }
            if wave + 1 < chunks.len() {
                ctx.sleep(&format!("sales-list-wave-delay-{wave}"), Duration::from_secs(1))
                    .await?;
            }
        }

        for entry in &all_entries {
            let incoming = FicheCache {
                id: BigId(0),
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
            self.collaborators.repository.upsert_fiche_cache(&incoming).await?;
        }

        Ok(all_entries)
    }

    fn build_fiche_worker_input(
        &self,
        schedule: &Schedule,
        run_id: RunId,
        fiche_id: FicheId,
        effective_audit_ids: &[AuditConfigId],
    ) -> FicheWorkerInput {
        FicheWorkerInput {
            fiche_id,
            audit_config_id: effective_audit_ids.first().cloned(),
            schedule_id: schedule.id.clone(),
            run_id,
            run_transcription: schedule.stage_flags.run_transcription,
            skip_if_transcribed: schedule.stage_flags.skip_if_transcribed,
            transcription_priority: schedule.stage_flags.transcription_priority,
            run_audits: schedule.stage_flags.run_audits,
            max_recordings: schedule.selection.max_recordings_per_fiche.unwrap_or(u32::MAX),
            only_with_recordings: schedule.selection.only_with_recordings,
            group_filter: schedule.selection.group_filter.clone(),
            retry: 0,
        }
    }

    fn build_day_worker_input(
        &self,
        schedule: &Schedule,
        run_id: RunId,
        date: NaiveDate,
        audit_config_id: Option<AuditConfigId>,
    ) -> DayWorkerInput {
        DayWorkerInput {
            date,
            run_id,
            schedule_id: schedule.id.clone(),
            audit_config_id,
            group_filter: schedule.selection.group_filter.clone(),
            only_with_recordings: schedule.selection.only_with_recordings,
            only_unaudited: schedule.selection.only_unaudited,
            max_fiches: schedule.selection.max_fiches,
            max_recordings_per_fiche: schedule
                .selection
                .max_recordings_per_fiche
                .unwrap_or(self.collaborators.config.max_recordings_per_fiche),
            run_transcription: schedule.stage_flags.run_transcription,
            skip_if_transcribed: schedule.stage_flags.skip_if_transcribed,
            transcription_priority: schedule.stage_flags.transcription_priority,
            run_audits: schedule.stage_flags.run_audits,
            continue_on_error: schedule.failure_policy.continue_on_error,
        }
    }
}

/// Explicit fiche ids for mode == Manual, trimmed/deduped/capped the same
/// way the API-mode sales-list selection is.
fn resolve_manual_fiche_ids(schedule: &Schedule, override_ids: Option<Vec<FicheId>>) -> Vec<FicheId> {
    let source = override_ids.unwrap_or_else(|| schedule.selection.fiche_ids.clone());
    let mut seen = HashSet::new();
    let mut result = Vec::new();

    for id in source {
        let trimmed = id.as_str().trim();
        if trimmed.is_empty() {
            continue;
        }
        let id = FicheId::from(trimmed);
        if !seen.insert(id.clone()) {
            continue;
        }
        result.push(id);
        if let Some(max) = schedule.selection.max_fiches {
            if result.len() as u32 >= max {
                break;
            }
        }
    }

    result
}

/// `failurePolicy.retryFailed`/`maxRetries`: re-dispatches only the
/// previously-failed fiches, accumulating ready/ignored/failed across
/// rounds. `fiche_details_gate` has no `retry` parameter of its own — a
/// failed step is never memoized (see [`automation_events::StepContext::run`]),
/// so simply calling the gate again on the same input naturally retries it.
async fn fiche_details_gate_with_retry(
    ctx: &StepContext,
    collaborators: &Collaborators<'_>,
    schedule: &Schedule,
    run_id: RunId,
    inputs: Vec<FicheWorkerInput>,
) -> Result<GateOutcome, AutomationError> {
    let mut pending = inputs;
    let mut settled_ready = Vec::new();
    let mut settled_ignored = Vec::new();
    let mut settled_failed = Vec::new();
    let mut attempt: u32 = 0;

    loop {
        let attempted = pending.clone();
        let outcome = fiche_details_gate(ctx, collaborators, run_id, pending).await?;
        settled_ready.extend(outcome.ready);
        settled_ignored.extend(outcome.ignored);

        if outcome.failed.is_empty() {
            break;
        }

        let can_retry = schedule.failure_policy.retry_failed && attempt < schedule.failure_policy.max_retries;
        if !can_retry {
            settled_failed.extend(outcome.failed);
            break;
        }

        let failed_ids: HashSet<FicheId> = outcome.failed.iter().map(|(id, _)| id.clone()).collect();
        attempt += 1;
        pending = attempted
            .into_iter()
            .filter(|input| failed_ids.contains(&input.fiche_id))
            .collect();
    }

    Ok(GateOutcome {
        ready: settled_ready,
        ignored: settled_ignored,
        failed: settled_failed,
    })
}

async fn transcription_gate_with_retry(
    ctx: &StepContext,
    collaborators: &Collaborators<'_>,
    schedule: &Schedule,
    run_id: RunId,
    ready: Vec<(FicheWorkerInput, FicheCache)>,
) -> Result<GateOutcome, AutomationError> {
    let mut pending = ready;
    let mut settled_ready = Vec::new();
    let mut settled_failed = Vec::new();
    let mut attempt: u32 = 0;

    loop {
        let attempted = pending.clone();
        let outcome = transcription_gate(ctx, collaborators, run_id, pending, attempt).await?;
        settled_ready.extend(outcome.ready);

        if outcome.failed.is_empty() {
            break;
        }

        let can_retry = schedule.failure_policy.retry_failed && attempt < schedule.failure_policy.max_retries;
        if !can_retry {
            settled_failed.extend(outcome.failed);
            break;
        }

        let failed_ids: HashSet<FicheId> = outcome.failed.iter().map(|(id, _)| id.clone()).collect();
        attempt += 1;
        pending = attempted
            .into_iter()
            .filter(|(input, _)| failed_ids.contains(&input.fiche_id))
            .collect();
    }

    Ok(GateOutcome {
        ready: settled_ready,
        ignored: Vec::new(),
        failed: settled_failed,
    })
}

async fn audit_gate_with_retry(
    ctx: &StepContext,
    collaborators: &Collaborators<'_>,
    schedule: &Schedule,
    run_id: RunId,
    ready: Vec<(FicheWorkerInput, FicheCache)>,
    audit_config_ids: &[AuditConfigId],
) -> Result<GateOutcome, AutomationError> {
    let mut pending = ready;
    let mut settled_ready = Vec::new();
    let mut settled_failed = Vec::new();
    let mut attempt: u32 = 0;

    loop {
        let attempted = pending.clone();
        let outcome = audit_gate(ctx, collaborators, run_id, pending, audit_config_ids, attempt).await?;
        settled_ready.extend(outcome.ready);

        if outcome.failed.is_empty() {
            break;
        }

        let can_retry = schedule.failure_policy.retry_failed && attempt < schedule.failure_policy.max_retries;
        if !can_retry {
            settled_failed.extend(outcome.failed);
            break;
        }

        let failed_ids: HashSet<FicheId> = outcome.failed.iter().map(|(id, _)| id.clone()).collect();
        attempt += 1;
        pending = attempted
            .into_iter()
            .filter(|(input, _)| failed_ids.contains(&input.fiche_id))
            .collect();
    }

    Ok(GateOutcome {
        ready: settled_ready,
        ignored: Vec::new(),
        failed: settled_failed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use automation_contracts::{DateRange, FailurePolicy, NotificationSettings, ScheduleId, SelectionSpec, StageFlags, StructuredCronFields, TranscriptionPriority};

    fn schedule_with_ids(ids: Vec<&str>, max_fiches: Option<u32>) -> Schedule {
        Schedule {
            id: ScheduleId::from("s1"),
            name: "manual".to_string(),
            is_active: true,
            schedule_type: automation_contracts::ScheduleType::Manual,
            cron_expression: None,
            timezone: "UTC".to_string(),
            structured_fields: StructuredCronFields::default(),
            selection: SelectionSpec {
                mode: SelectionMode::Manual,
                date_range: None,
                fiche_ids: ids.into_iter().map(FicheId::from).collect(),
                group_filter: None,
                only_with_recordings: false,
                only_unaudited: false,
                max_fiches,
                max_recordings_per_fiche: None,
                use_rlm: false,
            },
            stage_flags: StageFlags {
                run_transcription: true,
                skip_if_transcribed: true,
                transcription_priority: TranscriptionPriority::Normal,
                run_audits: false,
                use_automatic_audits: false,
                specific_audit_config_ids: vec![],
            },
            failure_policy: FailurePolicy::default(),
            notifications: NotificationSettings::default(),
            last_run_at: None,
            last_run_status: None,
        }
    }

    #[test]
    fn resolve_manual_fiche_ids_dedupes_and_trims() {
        let schedule = schedule_with_ids(vec!["A", " A ", "B", ""], None);
        let ids = resolve_manual_fiche_ids(&schedule, None);
        assert_eq!(ids, vec![FicheId::from("A"), FicheId::from("B")]);
    }

    #[test]
    fn resolve_manual_fiche_ids_caps_at_max_fiches() {
        let schedule = schedule_with_ids(vec!["A", "B", "C"], Some(2));
        let ids = resolve_manual_fiche_ids(&schedule, None);
        assert_eq!(ids.len(), 2);
    }

    #[test]
    fn resolve_manual_fiche_ids_prefers_override_over_selection() {
        let schedule = schedule_with_ids(vec!["A"], None);
        let ids = resolve_manual_fiche_ids(&schedule, Some(vec![FicheId::from("Z")]));
        assert_eq!(ids, vec![FicheId::from("Z")]);
    }

    #[test]
    fn date_range_is_reachable_without_override() {
        let _ = DateRange::Yesterday;
    }
}
