//! Per-stage progress reporting: a `RunProgress` realtime event plus a
//! matching `RunLog` row, published after each gate or worker-dispatch
//! stage so a long-running Run's state is observable before it finalizes.

use automation_contracts::{LogLevel, RealtimeEventKind, RunId};
use automation_database::Repository;
use automation_events::RealtimePublisher;
use automation_resilience::log_run_event;

/// One stage's counts at the moment it finished, e.g. after the
/// transcription gate settles: how many fiches were still in play, how many
/// cleared, how many were ignored or failed.
#[derive(Debug, Clone)]
pub struct RunProgressSnapshot {
    pub stage: String,
    pub total: usize,
    pub ready: usize,
    pub ignored: usize,
    pub failed: usize,
}

pub async fn publish_progress(
    repository: &Repository,
    realtime: &RealtimePublisher,
    run_id: RunId,
    snapshot: RunProgressSnapshot,
) -> Result<(), automation_contracts::AutomationError> {
    let payload = serde_json::json!({
        "stage": snapshot.stage,
        "total": snapshot.total,
        "ready": snapshot.ready,
        "ignored": snapshot.ignored,
        "failed": snapshot.failed,
    });

    let log = log_run_event(
        run_id,
        LogLevel::Info,
        format!("stage {} settled", snapshot.stage),
        payload.clone(),
    );
    repository.append_run_log(&log).await?;

    realtime.publish(run_id, RealtimeEventKind::RunProgress, payload);
    Ok(())
}
