//! LIFO compensation registry (spec §4.4). Registrations are scoped by the
//! (sub)process scope id they belong to, the same scoping the teacher uses
//! for join/wait state per instance — here per `scope_id` within an
//! instance so a completed call-activity or subprocess can be compensated
//! independently of its parent.

use crate::types::CompensationEntry;
use std::collections::HashMap;
use tokio::sync::Mutex;

#[derive(Default)]
pub struct CompensationRegistry {
    inner: Mutex<HashMap<String, Vec<CompensationEntry>>>,
}

impl CompensationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called when a task completes and has a compensation boundary or
    /// declared handler. Registration order is preserved for LIFO firing.
    pub async fn register(&self, scope_id: &str, entry: CompensationEntry) {
        let mut guard = self.inner.lock().await;
        guard.entry(scope_id.to_string()).or_default().push(entry);
    }

    /// Returns the entries registered inside `scope_id` in LIFO (reverse
    /// registration) order and clears them — the caller (scheduler) runs
    /// each handler to completion sequentially, logging failures without
    /// aborting subsequent handlers (spec §4.4).
    pub async fn take_for_trigger(&self, scope_id: &str) -> Vec<CompensationEntry> {
        let mut guard = self.inner.lock().await;
        let mut entries = guard.remove(scope_id).unwrap_or_default();
        entries.reverse();
        entries
    }

    /// Scope exit without compensation.
    pub async fn clear(&self, scope_id: &str) {
        let mut guard = self.inner.lock().await;
        guard.remove(scope_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn fires_in_reverse_registration_order() {
        let registry = CompensationRegistry::new();
        for (element_id, handler) in [
            ("createVPC", "deleteVPC"),
            ("createStorage", "deleteStorage"),
            ("launchVM", "terminateVM"),
        ] {
            registry
                .register(
                    "proc",
                    CompensationEntry {
                        element_id: element_id.to_string(),
                        handler_ref: handler.to_string(),
                        context_snapshot: json!({}),
                    },
                )
                .await;
        }
        let order = registry.take_for_trigger("proc").await;
        let handlers: Vec<&str> = order.iter().map(|e| e.handler_ref.as_str()).collect();
        assert_eq!(handlers, vec!["terminateVM", "deleteStorage", "deleteVPC"]);
    }

    #[tokio::test]
    async fn clear_drops_without_firing() {
        let registry = CompensationRegistry::new();
        registry
            .register(
                "proc",
                CompensationEntry {
                    element_id: "a".to_string(),
                    handler_ref: "undoA".to_string(),
                    context_snapshot: json!({}),
                },
            )
            .await;
        registry.clear("proc").await;
        assert!(registry.take_for_trigger("proc").await.is_empty());
    }
}
