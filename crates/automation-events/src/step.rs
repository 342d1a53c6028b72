//! The Durable-Step Runtime: memoized named steps, durable sleep,
//! deterministic event dispatch, all replayable after a process restart
//! because every result is written to `workflow_checkpoint` before
//! the step returns.
//!
//! Pure code between steps; side effects only inside steps. Every CRM call,
//! database write with external consequence, or event publish that the
//! orchestrator performs must go through [`StepContext::run`],
//! [`StepContext::sleep`], or [`StepContext::send_event`] rather than being
//! called directly, or a crash mid-run replays it.

use crate::bus::{EventBus, OutboundEvent};
use automation_contracts::{AutomationError, RunId};
use automation_database::Repository;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

/// Where checkpoints are persisted. `Postgres` is the production backend;
/// `InMemory` backs the orchestrator's scenario tests so they exercise the
/// exact same step-replay semantics without a database.
enum CheckpointStore {
    Postgres(Repository),
    InMemory(Mutex<HashMap<String, serde_json::Value>>),
}

impl CheckpointStore {
    async fn load(&self, run_id: RunId, step_name: &str) -> Result<Option<serde_json::Value>, AutomationError> {
        match self {
            CheckpointStore::Postgres(repo) => repo
                .load_checkpoint(run_id, step_name)
                .await
                .map_err(AutomationError::from),
            CheckpointStore::InMemory(map) => {
                Ok(map.lock().await.get(&key(run_id, step_name)).cloned())
            }
        }
    }

    async fn save(
        &self,
        run_id: RunId,
        step_name: &str,
        result: &serde_json::Value,
    ) -> Result<(), AutomationError> {
        match self {
            CheckpointStore::Postgres(repo) => repo
                .save_checkpoint(run_id, step_name, result)
                .await
                .map_err(AutomationError::from),
            CheckpointStore::InMemory(map) => {
                map.lock()
                    .await
                    .entry(key(run_id, step_name))
                    .or_insert_with(|| result.clone());
                Ok(())
            }
        }
    }
}

fn key(run_id: RunId, step_name: &str) -> String {
    format!("{run_id}:{step_name}")
}

/// One workflow's handle onto the durable-step runtime, scoped to a single
/// `RunId`.
pub struct StepContext {
    run_id: RunId,
    store: CheckpointStore,
    bus: Arc<dyn EventBus>,
}

impl StepContext {
    pub fn postgres(run_id: RunId, repository: Repository, bus: Arc<dyn EventBus>) -> Self {
        Self {
            run_id,
            store: CheckpointStore::Postgres(repository),
            bus,
        }
    }

    pub fn in_memory(run_id: RunId, bus: Arc<dyn EventBus>) -> Self {
        Self {
            run_id,
            store: CheckpointStore::InMemory(Mutex::new(HashMap::new())),
            bus,
        }
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// `step.run(name, fn)`: executes `compute` once per logical `name`; a
    /// replay returns the memoized value without calling `compute` again.
    pub async fn run<T, F, Fut>(&self, name: &str, compute: F) -> Result<T, AutomationError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, AutomationError>>,
    {
        if let Some(memoized) = self.store.load(self.run_id, name).await? {
            debug!(run_id = %self.run_id, step = name, "replaying memoized step");
            return serde_json::from_value(memoized)
                .map_err(|e| AutomationError::Repository(format!("corrupt checkpoint {name}: {e}")));
        }

        let result = compute().await?;
        let encoded = serde_json::to_value(&result)
            .map_err(|e| AutomationError::Repository(format!("step {name} result not serializable: {e}")))?;
        self.store.save(self.run_id, name, &encoded).await?;
        Ok(result)
    }

    /// `step.sleep(name, duration)`: durable wait. Memoized the same way as
    /// [`StepContext::run`] so a process restart mid-sleep does not re-sleep
    /// the full duration on replay.
    pub async fn sleep(&self, name: &str, duration: Duration) -> Result<(), AutomationError> {
        self.run(name, || async move {
            tokio::time::sleep(duration).await;
            Ok::<(), AutomationError>(())
        })
        .await
    }

    /// `step.sendEvent(name, events)`: publishes every event, memoized under
    /// `name` so a replay does not re-dispatch (on top of the
    /// event bus's own per-id dedup, which protects against the same event
    /// id reaching the bus more than once from different step names).
    pub async fn send_event(&self, name: &str, events: Vec<OutboundEvent>) -> Result<usize, AutomationError> {
        let bus = self.bus.clone();
        self.run(name, move || {
            let bus = bus.clone();
            async move {
                let mut published = 0;
                for event in events {
                    if bus.publish(event).await? {
                        published += 1;
                    }
                }
                Ok::<usize, AutomationError>(published)
            }
        })
        .await
    }

    /// `step.invoke(name, {function, data})`: synchronous child execution
    /// with a memoized result. Implemented identically to `run` at this
    /// layer; the distinction is organizational (invoking a named child
    /// function vs. inline code), not behavioral, so one memoization
    /// primitive serves both.
    pub async fn invoke<T, F, Fut>(&self, name: &str, child: F) -> Result<T, AutomationError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, AutomationError>>,
    {
        self.run(name, child).await
    }

    /// The fan-in gate's poll loop: re-check `check` on every
    /// `poll_interval`, up to `max_polls`, durably (each wait is a named
    /// `sleep` step, so the gate survives a restart mid-wait). `check`
    /// returns `(is_ready, progress_metric)`; the gate stalls and returns
    /// `Ok(false)` once `progress_metric` is unchanged for 3 consecutive
    /// polls, without waiting out the rest of `max_polls`.
    pub async fn poll_until<F, Fut>(
        &self,
        name_prefix: &str,
        max_polls: u64,
        poll_interval: Duration,
        mut check: F,
    ) -> Result<bool, AutomationError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(bool, usize), AutomationError>>,
    {
        let mut last_metric: Option<usize> = None;
        let mut stable_polls = 0u32;

        for poll in 0..max_polls {
            let (ready, metric) = check().await?;
            if ready {
                return Ok(true);
            }

            if last_metric == Some(metric) {
                stable_polls += 1;
                if stable_polls >= 3 {
                    debug!(prefix = name_prefix, metric, "gate stalled after 3 unchanged polls");
                    return Ok(false);
                }
            } else {
                stable_polls = 0;
            }
            last_metric = Some(metric);

            self.sleep(&format!("{name_prefix}-poll-{poll}"), poll_interval)
                .await?;
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryEventBus;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn ctx() -> StepContext {
        StepContext::in_memory(RunId::from(1), Arc::new(InMemoryEventBus::new()))
    }

    #[tokio::test]
    async fn run_memoizes_and_does_not_recompute_on_replay() {
        let ctx = ctx();
        let calls = Arc::new(AtomicU32::new(0));

        for _ in 0..3 {
            let calls = calls.clone();
            let value = ctx
                .run("select-fiches", move || {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok::<Vec<String>, AutomationError>(vec!["A".to_string(), "B".to_string()])
                    }
                })
                .await
                .unwrap();
            assert_eq!(value, vec!["A", "B"]);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn send_event_is_memoized_so_a_replay_does_not_redispatch() {
        let ctx = ctx();
        let event = OutboundEvent::new("run-1-fetch-A", "fiche/fetch", serde_json::json!({}));

        let first = ctx.send_event("dispatch-fetch", vec![event.clone()]).await.unwrap();
        let second = ctx.send_event("dispatch-fetch", vec![event]).await.unwrap();

        assert_eq!(first, 1);
        assert_eq!(second, 1, "replay returns the memoized count, not a recount of zero");
    }

    #[tokio::test]
    async fn poll_until_stalls_after_three_unchanged_polls() {
        let ctx = ctx();
        let ready = ctx
            .poll_until("gate", 10, Duration::from_millis(1), || async {
                Ok::<(bool, usize), AutomationError>((false, 1))
            })
            .await
            .unwrap();
        assert!(!ready);
    }

    #[tokio::test]
    async fn poll_until_returns_true_once_ready() {
        let ctx = ctx();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let ready = ctx
            .poll_until("gate", 10, Duration::from_millis(1), move || {
                let calls = calls_clone.clone();
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<(bool, usize), AutomationError>((n >= 2, n as usize))
                }
            })
            .await
            .unwrap();
        assert!(ready);
    }

    #[tokio::test]
    async fn different_step_names_do_not_collide() {
        let ctx = ctx();
        let a = ctx.run("a", || async { Ok::<i32, AutomationError>(1) }).await.unwrap();
        let b = ctx.run("b", || async { Ok::<i32, AutomationError>(2) }).await.unwrap();
        assert_eq!((a, b), (1, 2));
    }
}
