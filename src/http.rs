//! The admin/health HTTP surface: a liveness probe and a manual-trigger
//! endpoint that publishes the same `automation/run` event a Scheduler tick
//! would, so an operator (or an upstream scheduler that prefers push over
//! this process's own cron-tick loop) can kick off a run without waiting
//! for the next tick. Everything else (progress, results) is the admin
//! UI's job, and that UI is out of scope for this service.

use std::sync::Arc;

use automation_contracts::{deterministic_schedule_run_id, AutomationRunEvent, ScheduleId};
use automation_database::DatabaseClient;
use automation_events::{EventBus, OutboundEvent};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Serialize;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub db: DatabaseClient,
    pub event_bus: Arc<dyn EventBus>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/internal/trigger/:schedule_id", post(trigger_schedule))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    if state.db.health_check().await {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "database unreachable")
    }
}

#[derive(Debug, Serialize)]
struct TriggerResponse {
    event_id: String,
    published: bool,
}

/// Publishes an `automation/run` event for `schedule_id` with `dueAt = now`,
/// exactly as a Scheduler tick would. Does not itself
/// validate the schedule exists or is active — the Run-Orchestrator does
/// that when it consumes the event, and reports the failure on the Run the
/// same way it would for a tick-originated event.
async fn trigger_schedule(
    State(state): State<AppState>,
    Path(schedule_id): Path<String>,
) -> Result<Json<TriggerResponse>, (StatusCode, String)> {
    let schedule_id = ScheduleId::from(schedule_id);
    let due_at = Utc::now();
    let event = AutomationRunEvent {
        schedule_id: schedule_id.clone(),
        due_at: Some(due_at),
        override_fiche_selection: None,
    };
    let event_id = deterministic_schedule_run_id(&schedule_id, due_at);
    let payload = serde_json::to_value(&event)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    let published = state
        .event_bus
        .publish(OutboundEvent::new(event_id.clone(), "automation/run", payload))
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    Ok(Json(TriggerResponse { event_id, published }))
}
