//! The event bus abstraction backing `sendEvent` and named channel dispatch.
//!
//! Every dispatch carries a deterministic id so a retried or replayed
//! publish never produces a duplicate downstream job. [`InMemoryEventBus`]
//! is the only implementation this workspace
//! ships: it is sufficient for a single-process deployment and for the
//! orchestrator's scenario tests, and is the seam a future process-spanning
//! transport (NATS, SQS, Postgres LISTEN/NOTIFY) would sit behind.

use async_trait::async_trait;
use automation_contracts::AutomationError;
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// One unit of dispatch on the bus. `id` is the deterministic idempotency
/// key: per `(runId, stage, ficheId)` at most one child is invoked.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundEvent {
    pub id: String,
    pub name: String,
    pub payload: serde_json::Value,
}

impl OutboundEvent {
    pub fn new(id: impl Into<String>, name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            payload,
        }
    }
}

#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish one event. Returns `false` without side effects if `event.id`
    /// was already published (idempotent child dispatch).
    async fn publish(&self, event: OutboundEvent) -> Result<bool, AutomationError>;

    /// A live feed of every event published under `event_name`, for a
    /// worker to consume. Subscribers that attach after a publish miss it;
    /// callers that need at-least-once delivery across restarts drive
    /// consumption from the Repository instead: fan-in gates poll tables,
    /// they do not rely on bus delivery.
    fn subscribe(&self, event_name: &str) -> broadcast::Receiver<OutboundEvent>;

    /// Event bus dispatches are chunked (default 200 events/chunk) to
    /// respect provider send-limits. Returns the count of events that were
    /// newly published (i.e. not deduped).
    async fn publish_chunked(
        &self,
        events: Vec<OutboundEvent>,
        chunk_size: usize,
    ) -> Result<usize, AutomationError> {
        let chunk_size = chunk_size.max(1);
        let mut newly_published = 0;
        for chunk in events.chunks(chunk_size) {
            for event in chunk {
                if self.publish(event.clone()).await? {
                    newly_published += 1;
                }
            }
        }
        Ok(newly_published)
    }
}

/// In-process event bus: a dedup set keyed by event id, plus one broadcast
/// channel per event name created lazily on first publish or subscribe.
pub struct InMemoryEventBus {
    seen_ids: DashSet<String>,
    channels: DashMap<String, broadcast::Sender<OutboundEvent>>,
    channel_capacity: usize,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self {
            seen_ids: DashSet::new(),
            channels: DashMap::new(),
            channel_capacity: 1024,
        }
    }

    fn sender_for(&self, event_name: &str) -> broadcast::Sender<OutboundEvent> {
        self.channels
            .entry(event_name.to_string())
            .or_insert_with(|| broadcast::channel(self.channel_capacity).0)
            .clone()
    }
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(&self, event: OutboundEvent) -> Result<bool, AutomationError> {
        if !self.seen_ids.insert(event.id.clone()) {
            debug!(event_id = %event.id, event_name = %event.name, "deduped event");
            return Ok(false);
        }

        let sender = self.sender_for(&event.name);
        // A send error only means there are currently no subscribers; the
        // fan-in gates read state from the Repository, not from this
        // channel, so a missed broadcast is not data loss.
        if sender.send(event.clone()).is_err() {
            warn!(event_name = %event.name, "published event had no active subscribers");
        }
        Ok(true)
    }

    fn subscribe(&self, event_name: &str) -> broadcast::Receiver<OutboundEvent> {
        self.sender_for(event_name).subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publishing_the_same_id_twice_is_deduped() {
        let bus = InMemoryEventBus::new();
        let event = OutboundEvent::new("run-1-fetch-A", "fiche/fetch", serde_json::json!({}));
        assert!(bus.publish(event.clone()).await.unwrap());
        assert!(!bus.publish(event).await.unwrap());
    }

    #[tokio::test]
    async fn subscribers_receive_events_published_after_they_attach() {
        let bus = InMemoryEventBus::new();
        let mut receiver = bus.subscribe("fiche/fetch");
        bus.publish(OutboundEvent::new("run-1-fetch-A", "fiche/fetch", serde_json::json!({"a": 1})))
            .await
            .unwrap();
        let received = receiver.recv().await.unwrap();
        assert_eq!(received.id, "run-1-fetch-A");
    }

    #[tokio::test]
    async fn publish_chunked_counts_only_newly_published_events() {
        let bus = InMemoryEventBus::new();
        let events = vec![
            OutboundEvent::new("a", "fiche/fetch", serde_json::json!({})),
            OutboundEvent::new("a", "fiche/fetch", serde_json::json!({})),
            OutboundEvent::new("b", "fiche/fetch", serde_json::json!({})),
        ];
        let count = bus.publish_chunked(events, 200).await.unwrap();
        assert_eq!(count, 2);
    }
}
