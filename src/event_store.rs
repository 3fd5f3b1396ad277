//! Append-only event persistence keyed by `(instance_id, element_id)`, the
//! crate's analog of the teacher's `ProcessStore::append_event` /
//! `read_events`, generalized per spec §4.3: `Append`, `Subscribe` (owned by
//! `EventStream`, not the store), and `Replay`.

use crate::event::Event;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Durable write; returns after commit.
    async fn append(&self, event: Event) -> anyhow::Result<()>;

    /// Stored events for an instance (optionally filtered to one element),
    /// in original causal order with original timestamps.
    async fn replay(&self, instance_id: Uuid, element_id: Option<&str>)
        -> anyhow::Result<Vec<Event>>;

    /// Explicit purge (spec §3: "retained until explicit purge").
    async fn purge(&self, instance_id: Uuid) -> anyhow::Result<()>;
}

/// In-memory `EventStore`, always available — the default, mirroring
/// the teacher's `MemoryStore` as the always-on backend for tests and
/// single-process deployments.
#[derive(Default)]
pub struct MemoryEventStore {
    events: RwLock<HashMap<Uuid, Vec<Event>>>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn append(&self, event: Event) -> anyhow::Result<()> {
        let mut w = self.events.write().await;
        w.entry(event.instance_id).or_default().push(event);
        Ok(())
    }

    async fn replay(
        &self,
        instance_id: Uuid,
        element_id: Option<&str>,
    ) -> anyhow::Result<Vec<Event>> {
        let r = self.events.read().await;
        let all = r.get(&instance_id).cloned().unwrap_or_default();
        Ok(match element_id {
            Some(eid) => all
                .into_iter()
                .filter(|e| e.element_id.as_deref() == Some(eid))
                .collect(),
            None => all,
        })
    }

    async fn purge(&self, instance_id: Uuid) -> anyhow::Result<()> {
        let mut w = self.events.write().await;
        w.remove(&instance_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn replay_preserves_causal_order() {
        let store = MemoryEventStore::new();
        let instance_id = Uuid::now_v7();
        for i in 0..5 {
            store
                .append(Event::new(
                    "element.entered",
                    instance_id,
                    Some("task1"),
                    json!({"i": i}),
                ))
                .await
                .unwrap();
        }
        let events = store.replay(instance_id, None).await.unwrap();
        let seq: Vec<i64> = events
            .iter()
            .map(|e| e.payload["i"].as_i64().unwrap())
            .collect();
        assert_eq!(seq, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn replay_filters_by_element() {
        let store = MemoryEventStore::new();
        let instance_id = Uuid::now_v7();
        store
            .append(Event::new("element.entered", instance_id, Some("a"), json!({})))
            .await
            .unwrap();
        store
            .append(Event::new("element.entered", instance_id, Some("b"), json!({})))
            .await
            .unwrap();
        let events = store.replay(instance_id, Some("a")).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].element_id.as_deref(), Some("a"));
    }
}

#[cfg(feature = "postgres")]
pub mod postgres {
    //! Durable `EventStore` backed by Postgres, feature-gated exactly like
    //! the teacher's `store_postgres::PostgresProcessStore`.
    use super::*;
    use sqlx::PgPool;

    pub struct PostgresEventStore {
        pool: PgPool,
    }

    impl PostgresEventStore {
        pub fn new(pool: PgPool) -> Self {
            Self { pool }
        }

        pub async fn migrate(&self) -> anyhow::Result<()> {
            sqlx::query(
                r#"
                CREATE TABLE IF NOT EXISTS engine_events (
                    seq BIGSERIAL PRIMARY KEY,
                    instance_id UUID NOT NULL,
                    element_id TEXT,
                    kind TEXT NOT NULL,
                    timestamp BIGINT NOT NULL,
                    payload JSONB NOT NULL
                );
                CREATE INDEX IF NOT EXISTS engine_events_instance_idx
                    ON engine_events (instance_id, seq);
                "#,
            )
            .execute(&self.pool)
            .await?;
            Ok(())
        }
    }

    #[async_trait]
    impl EventStore for PostgresEventStore {
        async fn append(&self, event: Event) -> anyhow::Result<()> {
            sqlx::query(
                "INSERT INTO engine_events (instance_id, element_id, kind, timestamp, payload)
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(event.instance_id)
            .bind(event.element_id)
            .bind(event.kind)
            .bind(event.timestamp)
            .bind(event.payload)
            .execute(&self.pool)
            .await?;
            Ok(())
        }

        async fn replay(
            &self,
            instance_id: Uuid,
            element_id: Option<&str>,
        ) -> anyhow::Result<Vec<Event>> {
            let rows: Vec<(String, Option<String>, i64, serde_json::Value)> = sqlx::query_as(
                "SELECT kind, element_id, timestamp, payload FROM engine_events
                 WHERE instance_id = $1 AND ($2::text IS NULL OR element_id = $2)
                 ORDER BY seq ASC",
            )
            .bind(instance_id)
            .bind(element_id)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows
                .into_iter()
                .map(|(kind, element_id, timestamp, payload)| Event {
                    kind,
                    instance_id,
                    element_id,
                    timestamp,
                    payload,
                })
                .collect())
        }

        async fn purge(&self, instance_id: Uuid) -> anyhow::Result<()> {
            sqlx::query("DELETE FROM engine_events WHERE instance_id = $1")
                .bind(instance_id)
                .execute(&self.pool)
                .await?;
            Ok(())
        }
    }
}
