use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Event kinds emitted by the agent core.
pub mod kinds {
    pub const SLIDE_IMPORT: &str = "slide.import";
    pub const SLIDE_READY: &str = "slide.ready";
    pub const TILES_READY: &str = "tiles.ready";
    pub const TILE_GENERATED: &str = "tile.generated";
    pub const PREVIEW_PUBLISHED: &str = "preview.published";
    pub const CLEANUP_COMPLETE: &str = "cleanup.complete";
    pub const JOB_FAILED: &str = "job.failed";
}

/// Redis pub/sub channel external subscribers listen on.
pub const EVENTS_TOPIC: &str = "orcein.events";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub kind: String,
    pub payload: serde_json::Value,
}

struct Listeners {
    by_kind: HashMap<String, Vec<mpsc::UnboundedSender<Event>>>,
    firehose: Vec<mpsc::UnboundedSender<Event>>,
}

/// In-process pub/sub for slide/job/tile lifecycle events.
///
/// Emission fans out synchronously to the registered listener channels and
/// never blocks the emitter: listeners get unbounded channels and closed
/// receivers are dropped on the next emit. When a Redis pool is attached,
/// every event is additionally relayed to [`EVENTS_TOPIC`] for cross-process
/// subscribers; relay failures are logged and ignored.
#[derive(Clone)]
pub struct EventBus {
    listeners: Arc<Mutex<Listeners>>,
    relay: Option<deadpool_redis::Pool>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            listeners: Arc::new(Mutex::new(Listeners {
                by_kind: HashMap::new(),
                firehose: Vec::new(),
            })),
            relay: None,
        }
    }

    pub fn with_relay(relay: deadpool_redis::Pool) -> Self {
        let mut bus = Self::new();
        bus.relay = Some(relay);
        bus
    }

    /// Register a listener for one event kind. Delivery order for a single
    /// kind equals emission order.
    pub fn subscribe(&self, kind: &str) -> mpsc::UnboundedReceiver<Event> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners
            .lock()
            .by_kind
            .entry(kind.to_string())
            .or_default()
            .push(tx);
        rx
    }

    /// Register a listener for every event kind (the SSE bridge).
    pub fn subscribe_all(&self) -> mpsc::UnboundedReceiver<Event> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.lock().firehose.push(tx);
        rx
    }

    pub fn emit(&self, kind: &str, payload: serde_json::Value) {
        let event = Event {
            kind: kind.to_string(),
            payload,
        };

        {
            let mut listeners = self.listeners.lock();
            if let Some(subs) = listeners.by_kind.get_mut(kind) {
                subs.retain(|tx| tx.send(event.clone()).is_ok());
            }
            listeners
                .firehose
                .retain(|tx| tx.send(event.clone()).is_ok());
        }

        if let Some(pool) = self.relay.clone() {
            let json = match serde_json::to_string(&event) {
                Ok(json) => json,
                Err(e) => {
                    tracing::warn!(kind = %event.kind, error = %e, "failed to serialize event");
                    return;
                }
            };
            tokio::spawn(async move {
                match pool.get().await {
                    Ok(mut conn) => {
                        if let Err(e) = conn.publish::<_, _, ()>(EVENTS_TOPIC, json).await {
                            tracing::warn!(error = %e, "failed to relay event to redis");
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to get redis connection for event relay");
                    }
                }
            });
        }
    }

    /// Number of live listeners, across kinds and the firehose.
    pub fn listener_count(&self) -> usize {
        let listeners = self.listeners.lock();
        listeners.by_kind.values().map(Vec::len).sum::<usize>() + listeners.firehose.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn delivers_to_kind_listeners_in_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe(kinds::SLIDE_READY);

        bus.emit(kinds::SLIDE_READY, json!({"slide_id": "a"}));
        bus.emit(kinds::SLIDE_READY, json!({"slide_id": "b"}));
        bus.emit(kinds::TILES_READY, json!({"slide_id": "c"}));

        assert_eq!(rx.recv().await.unwrap().payload["slide_id"], "a");
        assert_eq!(rx.recv().await.unwrap().payload["slide_id"], "b");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn firehose_sees_every_kind() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe_all();

        bus.emit(kinds::SLIDE_IMPORT, json!({}));
        bus.emit(kinds::PREVIEW_PUBLISHED, json!({}));

        assert_eq!(rx.recv().await.unwrap().kind, kinds::SLIDE_IMPORT);
        assert_eq!(rx.recv().await.unwrap().kind, kinds::PREVIEW_PUBLISHED);
    }

    #[tokio::test]
    async fn dropped_listeners_are_pruned() {
        let bus = EventBus::new();
        let rx = bus.subscribe(kinds::SLIDE_READY);
        assert_eq!(bus.listener_count(), 1);
        drop(rx);

        // Emission does not fail and prunes the closed channel.
        bus.emit(kinds::SLIDE_READY, json!({}));
        assert_eq!(bus.listener_count(), 0);
    }
}
