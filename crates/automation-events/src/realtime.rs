//! The realtime pub/sub channel: per-run progress events keyed by
//! `job_id = "automation-run-<runId>"`, consumed by an admin UI this
//! workspace does not implement.

use automation_contracts::{realtime_job_id, RealtimeEventKind, RunId};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeUpdate {
    pub job_id: String,
    pub kind: RealtimeEventKind,
    pub payload: serde_json::Value,
}

/// One broadcast channel shared by every run; subscribers filter by
/// `job_id` client-side, mirroring how a single websocket topic is
/// typically fanned out to many concurrent admin-UI viewers.
pub struct RealtimePublisher {
    sender: broadcast::Sender<RealtimeUpdate>,
}

impl RealtimePublisher {
    pub fn new() -> Self {
        let (sender, _receiver) = broadcast::channel(1024);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RealtimeUpdate> {
        self.sender.subscribe()
    }

    pub fn publish(&self, run_id: RunId, kind: RealtimeEventKind, payload: serde_json::Value) {
        let update = RealtimeUpdate {
            job_id: realtime_job_id(run_id),
            kind,
            payload,
        };
        // No active subscriber is the common case outside of an open admin
        // UI tab; dropping the update silently is correct, the Run's
        // authoritative state lives in the Repository regardless.
        let _ = self.sender.send(update);
    }
}

impl Default for RealtimePublisher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn published_updates_carry_the_run_scoped_job_id() {
        let publisher = RealtimePublisher::new();
        let mut receiver = publisher.subscribe();
        publisher.publish(RunId::from(7), RealtimeEventKind::RunStarted, serde_json::json!({}));
        let update = receiver.recv().await.unwrap();
        assert_eq!(update.job_id, "automation-run-7");
    }
}
