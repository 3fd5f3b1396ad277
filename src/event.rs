//! The AG-UI-style event stream (spec §6). `Event` is the wire/durable
//! representation; `EventStream` is the single push channel fanning out to
//! subscribers while persisting through an `EventStore`, the crate's analog
//! of the teacher's `RuntimeEvent` (`events.rs`) + `append_event` pairing.

use crate::event_store::EventStore;
use crate::types::{now_ms, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

/// One causal event for a single instance. `type` is the stable dotted tag
/// from spec §6's table; `payload` carries the fields listed there.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: String,
    pub instance_id: Uuid,
    pub element_id: Option<String>,
    pub timestamp: Timestamp,
    pub payload: Json,
}

impl Event {
    pub fn new(kind: &str, instance_id: Uuid, element_id: Option<&str>, payload: Json) -> Self {
        Self {
            kind: kind.to_string(),
            instance_id,
            element_id: element_id.map(|s| s.to_string()),
            timestamp: now_ms(),
            payload,
        }
    }
}

/// Broadcasts events to live subscribers and persists them through an
/// `EventStore`. One `EventStream` is shared by every task of an instance
/// (`Arc`-wrapped), mirroring how the teacher threads a single
/// `Arc<dyn ProcessStore>` through `BpmnLiteEngine`/`Vm`.
pub struct EventStream {
    store: Arc<dyn EventStore>,
    sender: broadcast::Sender<Event>,
}

impl EventStream {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self { store, sender }
    }

    /// Append to the store, then push to subscribers. Durability precedes
    /// broadcast so `Replay` always agrees with what a live subscriber saw
    /// (spec §4.3's ordering guarantee).
    pub async fn emit(&self, event: Event) -> anyhow::Result<()> {
        self.store.append(event.clone()).await?;
        // A subscriber dropping its receiver is not an error for the emitter.
        let _ = self.sender.send(event);
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    pub async fn replay(
        &self,
        instance_id: Uuid,
        element_id: Option<&str>,
    ) -> anyhow::Result<Vec<Event>> {
        self.store.replay(instance_id, element_id).await
    }
}
