//! `automation-orchestrator`: process wiring for the Automation Orchestrator.
//! Loads config, connects Postgres, runs migrations, and
//! drives three concurrent loops inside one process: the Scheduler's
//! cron-tick, the `automation/run` event consumer that runs the
//! Run-Orchestrator, and a small axum admin/health surface. None of these
//! loops is spawned onto a separate task — they share borrows of the
//! collaborators built in `main`, and run concurrently via `tokio::select!`
//! instead.

mod http;

use std::str::FromStr;
use std::time::Duration;

use automation_config::AppConfig;
use automation_contracts::{AutomationRunEvent, RunId};
use automation_database::{DatabaseClient, MigrationManager, Repository};
use automation_events::notifications::LoggingEmailSender;
use automation_events::{EventBus, InMemoryEventBus, RealtimePublisher, StepContext};
use automation_orchestrator::{Collaborators, RunOrchestrator, Scheduler};
use automation_resilience::{CircuitBreaker, CircuitBreakerConfig};
use automation_workers::{HttpAuditEngine, HttpCrmClient, HttpTranscriptionEngine};
use chrono::Utc;
use clap::Parser;
use std::sync::Arc;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "automation-orchestrator")]
#[command(about = "Sales-call QA automation orchestrator")]
struct Args {
    /// Run one Scheduler tick, process whatever it dispatches, then exit.
    /// Intended for deployments that drive this binary from an external
    /// cron (e.g. a Kubernetes CronJob) rather than running it as a daemon.
    #[arg(long)]
    once: bool,

    /// Admin/health HTTP bind address.
    #[arg(long, default_value = "0.0.0.0:8080")]
    http_addr: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = AppConfig::from_env()?;
    let _file_log_guard = init_tracing(config.orchestration.debug_log_to_file);

    tracing::info!(once = args.once, "automation-orchestrator starting");

    let db = DatabaseClient::connect(&config.database).await?;
    MigrationManager::new(&db).run_pending().await?;
    let repository = Repository::new(&db);

    let event_bus: Arc<dyn EventBus> = Arc::new(InMemoryEventBus::new());
    let realtime = RealtimePublisher::new();
    let http_client = reqwest::Client::new();
    let email_sender = LoggingEmailSender;

    let timeout = Duration::from_secs(30);
    let crm = HttpCrmClient::new(crm_base_url(), timeout);
    let transcription = HttpTranscriptionEngine::new(transcription_base_url(), timeout);
    let audit = HttpAuditEngine::new(audit_base_url(), timeout);
    let crm_circuit = CircuitBreaker::new("crm", CircuitBreakerConfig::default());

    let scheduler = Scheduler::new(&repository, event_bus.as_ref(), &config.orchestration);

    let collaborators = || Collaborators {
        repository: &repository,
        crm: &crm,
        crm_circuit: &crm_circuit,
        transcription: &transcription,
        audit: &audit,
        config: &config.orchestration,
    };
    let orchestrator = RunOrchestrator::new(collaborators(), &realtime, &http_client, &email_sender);

    let app_state = http::AppState {
        db: db.clone(),
        event_bus: event_bus.clone(),
    };
    let listener = tokio::net::TcpListener::bind(&args.http_addr).await?;
    tracing::info!(addr = %args.http_addr, "admin/health surface listening");
    let server = axum::serve(listener, http::router(app_state));

    if args.once {
        run_once(&scheduler, &orchestrator, &repository, event_bus.as_ref()).await?;
        return Ok(());
    }

    tokio::select! {
        result = server => {
            result?;
        }
        result = scheduler_tick_loop(&scheduler, &config.orchestration.scheduler_cron) => {
            result?;
        }
        result = run_event_consumer_loop(&orchestrator, &repository, event_bus.as_ref()) => {
            result?;
        }
    }

    Ok(())
}

fn crm_base_url() -> String {
    std::env::var("AUTOMATION_CRM_BASE_URL").unwrap_or_else(|_| "http://localhost:9001".to_string())
}

fn transcription_base_url() -> String {
    std::env::var("AUTOMATION_TRANSCRIPTION_BASE_URL")
        .unwrap_or_else(|_| "http://localhost:9002".to_string())
}

fn audit_base_url() -> String {
    std::env::var("AUTOMATION_AUDIT_BASE_URL").unwrap_or_else(|_| "http://localhost:9003".to_string())
}

/// `--once`: one tick, then drain whatever it (synchronously) dispatched.
/// `Scheduler::tick` itself awaits `publish_chunked` before returning, and
/// this process is the only subscriber, so every dispatched event is already
/// sitting in the channel by the time `tick` resolves.
async fn run_once(
    scheduler: &Scheduler<'_>,
    orchestrator: &RunOrchestrator<'_>,
    repository: &Repository,
    event_bus: &dyn EventBus,
) -> anyhow::Result<()> {
    let report = scheduler.tick(Utc::now()).await?;
    tracing::info!(
        evaluated = report.evaluated,
        dispatched = report.dispatched.len(),
        reconciled_stale = report.reconciled_stale.len(),
        "scheduler tick complete"
    );

    let mut receiver = event_bus.subscribe("automation/run");
    for _ in 0..report.newly_published {
        match receiver.try_recv() {
            Ok(event) => {
                if let Err(e) = process_run_event(orchestrator, repository, event).await {
                    tracing::error!(error = %e, "run failed");
                }
            }
            Err(_) => break,
        }
    }
    Ok(())
}

async fn scheduler_tick_loop(scheduler: &Scheduler<'_>, cron_expression: &str) -> anyhow::Result<()> {
    loop {
        let delay = next_tick_delay(cron_expression, Utc::now())?;
        tokio::time::sleep(delay).await;
        let now = Utc::now();
        match scheduler.tick(now).await {
            Ok(report) if report.dispatched.is_empty() => {
                tracing::debug!(evaluated = report.evaluated, "scheduler tick: nothing due");
            }
            Ok(report) => {
                tracing::info!(
                    evaluated = report.evaluated,
                    dispatched = report.dispatched.len(),
                    reconciled_stale = report.reconciled_stale.len(),
                    "scheduler tick dispatched runs"
                );
            }
            Err(e) => tracing::error!(error = %e, "scheduler tick failed"),
        }
    }
}

/// Runs on a cron tick (default every minute, configurable).
/// The ticker's own cadence is independent of any individual schedule's
/// timezone, so it is always evaluated in UTC.
fn next_tick_delay(cron_expression: &str, now: chrono::DateTime<Utc>) -> anyhow::Result<Duration> {
    let normalized = automation_orchestrator::cron::normalize_cron_expression(cron_expression);
    let schedule = cron::Schedule::from_str(&normalized)
        .map_err(|e| anyhow::anyhow!("invalid AUTOMATION_SCHEDULER_CRON {cron_expression:?}: {e}"))?;
    let next = schedule
        .after(&now)
        .next()
        .ok_or_else(|| anyhow::anyhow!("cron expression {cron_expression:?} never fires"))?;
    let delay = (next - now).to_std().unwrap_or(Duration::from_secs(1));
    Ok(delay.max(Duration::from_millis(100)))
}

async fn run_event_consumer_loop(
    orchestrator: &RunOrchestrator<'_>,
    repository: &Repository,
    event_bus: &dyn EventBus,
) -> anyhow::Result<()> {
    let mut receiver = event_bus.subscribe("automation/run");
    loop {
        match receiver.recv().await {
            Ok(event) => {
                if let Err(e) = process_run_event(orchestrator, repository, event).await {
                    tracing::error!(error = %e, "run failed");
                }
            }
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "run event consumer lagged; some ticks were missed");
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                return Err(anyhow::anyhow!("automation/run event channel closed"));
            }
        }
    }
}

async fn process_run_event(
    orchestrator: &RunOrchestrator<'_>,
    repository: &Repository,
    event: automation_events::OutboundEvent,
) -> anyhow::Result<()> {
    let run_event: AutomationRunEvent = serde_json::from_value(event.payload)?;
    let run_span = tracing::info_span!("automation_run", schedule_id = %run_event.schedule_id, event_id = %event.id);
    let _enter = run_span.enter();

    // The Postgres-backed Repository doesn't yet expose a get-or-create
    // keyed by (scheduleId, dueAt), so `RunOrchestrator::run` always inserts
    // a fresh `automation_run` row and returns its real id; this provisional
    // id only needs to be stable for the lifetime of one checkpoint-store
    // lookup within that single call, which `fnv1a64` guarantees because it
    // is a pure function of the event's own deterministic id.
    let provisional_run_id = RunId::from(fnv1a64(&event.id));
    let bus: Arc<dyn EventBus> = Arc::new(InMemoryEventBus::new());
    let ctx = StepContext::postgres(provisional_run_id, repository.clone(), bus);

    let run = orchestrator.run(&ctx, run_event).await?;
    tracing::info!(run_id = %run.id, status = ?run.status, "run finished");
    Ok(())
}

/// FNV-1a, chosen only because it's deterministic without a per-process
/// random seed (unlike the stdlib's default `Hasher`) — this is a namespace
/// key for durable-step checkpoints, not anything security-sensitive.
fn fnv1a64(s: &str) -> i64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in s.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    (hash & 0x7fff_ffff_ffff_ffff) as i64
}

/// `tracing` + `tracing-subscriber` (env-filter,
/// fmt, json), plus a global `tracing-appender` non-blocking file writer
/// when `AUTOMATION_DEBUG_LOG_TO_FILE=1`. Returns the appender's worker
/// guard; dropping it flushes the file writer's background thread, so the
/// caller must hold it for the lifetime of `main`.
fn init_tracing(debug_log_to_file: bool) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_env("AUTOMATION_LOG_LEVEL").unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(filter);

    if debug_log_to_file {
        let file_appender = tracing_appender::rolling::daily("logs", "automation-orchestrator.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        registry
            .with(fmt::layer().json())
            .with(fmt::layer().json().with_writer(non_blocking).with_ansi(false))
            .init();
        Some(guard)
    } else {
        registry.with(fmt::layer().json()).init();
        None
    }
}
