//! Correlation-keyed pub/sub for message/receive tasks and inbound
//! webhooks (spec §4.2). One `MessageBus` is shared per instance; keys are
//! `(message_ref, correlation_key)` pairs with exact string equality.
//! Grounded on the teacher's per-key coordination pattern
//! (`WaitState::Msg { wait_id, name, corr_key }` + `MemoryStore`'s
//! `RwLock<Inner>`), adapted to real `await`able futures instead of a
//! polled wait-state enum since spec §5 calls for true suspension points.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use crate::types::Message;

/// Empty/unset correlation keys are a distinct wildcard that never matches
/// a keyed publish (spec §4.2).
const UNSET_KEY: &str = "\0unset";

fn key_of(message_ref: &str, correlation_key: &str) -> (String, String) {
    let key = if correlation_key.is_empty() {
        UNSET_KEY.to_string()
    } else {
        correlation_key.to_string()
    };
    (message_ref.to_string(), key)
}

#[derive(Debug, PartialEq, Eq)]
pub enum AwaitOutcome {
    Delivered(Message),
    Timeout,
    Cancelled,
}

struct Waiter {
    tx: oneshot::Sender<Message>,
}

#[derive(Default)]
struct Inner {
    /// Waiters registered for a key, first-registered-first-served.
    waiters: HashMap<(String, String), Vec<Waiter>>,
    /// Messages published with no waiter yet, retained per instance
    /// lifetime by default (spec §9 open question, resolved).
    queued: HashMap<(String, String), Vec<Message>>,
}

/// `MessageBus`: internal per-key mutex around a single `Inner`, mirroring
/// the teacher's "internal per-key mutex + condition variable, or a
/// channel-per-key pattern" design note (spec §9) — here realized as one
/// coarse lock guarding per-key vectors, since contention is bounded by one
/// instance's concurrent waiters.
#[derive(Default)]
pub struct MessageBus {
    inner: Mutex<Inner>,
}

impl MessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a waiter; if a matching queued message exists, consumes it
    /// immediately. Otherwise blocks until delivered, timed out, or
    /// cancelled — every branch is a real suspension point observing
    /// `cancel`.
    pub async fn r#await(
        &self,
        message_ref: &str,
        correlation_key: &str,
        timeout: Option<std::time::Duration>,
        cancel: &CancellationToken,
    ) -> AwaitOutcome {
        let key = key_of(message_ref, correlation_key);
        let rx = {
            let mut guard = self.inner.lock().await;
            if let Some(queue) = guard.queued.get_mut(&key) {
                if let Some(msg) = queue.first().cloned() {
                    queue.remove(0);
                    if queue.is_empty() {
                        guard.queued.remove(&key);
                    }
                    return AwaitOutcome::Delivered(msg);
                }
            }
            let (tx, rx) = oneshot::channel();
            guard.waiters.entry(key.clone()).or_default().push(Waiter { tx });
            rx
        };

        let sleep = async {
            match timeout {
                Some(d) => tokio::time::sleep(d).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.remove_waiter(&key).await;
                AwaitOutcome::Cancelled
            }
            msg = rx => {
                match msg {
                    Ok(msg) => AwaitOutcome::Delivered(msg),
                    Err(_) => AwaitOutcome::Cancelled,
                }
            }
            _ = sleep => {
                self.remove_waiter(&key).await;
                AwaitOutcome::Timeout
            }
        }
    }

    /// Removes any still-pending waiter matching `key`. Used after timeout
    /// fires so a later `publish` does not try to deliver into a dropped
    /// channel; the waiter vector may already have been drained by a
    /// concurrent `publish`, which is fine (no-op).
    async fn remove_waiter(&self, key: &(String, String)) {
        let mut guard = self.inner.lock().await;
        if let Some(waiters) = guard.waiters.get_mut(key) {
            waiters.retain(|w| !w.tx.is_closed());
            if waiters.is_empty() {
                guard.waiters.remove(key);
            }
        }
    }

    /// If a waiter matches, completes it (single delivery, first-registered
    /// first-served). Otherwise enqueues under the key.
    pub async fn publish(&self, message_ref: &str, correlation_key: &str, payload: serde_json::Value) {
        let key = key_of(message_ref, correlation_key);
        let msg = Message {
            message_ref: message_ref.to_string(),
            correlation_key: correlation_key.to_string(),
            payload,
            received_at: crate::types::now_ms(),
        };
        let mut guard = self.inner.lock().await;
        if let Some(waiters) = guard.waiters.get_mut(&key) {
            while let Some(waiter) = waiters.first() {
                if waiter.tx.is_closed() {
                    waiters.remove(0);
                    continue;
                }
                let waiter = waiters.remove(0);
                if waiters.is_empty() {
                    guard.waiters.remove(&key);
                }
                let _ = waiter.tx.send(msg);
                return;
            }
            guard.waiters.remove(&key);
        }
        guard.queued.entry(key).or_default().push(msg);
    }

    /// Broadcast delivery for signal events: every current waiter on
    /// `message_ref` (regardless of correlation key) consumes independently
    /// (spec §4.6 Signal Event).
    pub async fn broadcast(&self, message_ref: &str, payload: serde_json::Value) {
        let mut guard = self.inner.lock().await;
        let keys: Vec<(String, String)> = guard
            .waiters
            .keys()
            .filter(|(name, _)| name == message_ref)
            .cloned()
            .collect();
        for key in keys {
            if let Some(waiters) = guard.waiters.remove(&key) {
                let msg = Message {
                    message_ref: message_ref.to_string(),
                    correlation_key: key.1.clone(),
                    payload: payload.clone(),
                    received_at: crate::types::now_ms(),
                };
                for waiter in waiters {
                    let _ = waiter.tx.send(msg.clone());
                }
            }
        }
    }
}

pub type SharedMessageBus = Arc<MessageBus>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn publish_before_await_is_queued_then_delivered() {
        let bus = MessageBus::new();
        bus.publish("emailApproval", "REQ-1", json!({"decision": "approved"}))
            .await;
        let cancel = CancellationToken::new();
        let outcome = bus.r#await("emailApproval", "REQ-1", None, &cancel).await;
        match outcome {
            AwaitOutcome::Delivered(msg) => assert_eq!(msg.payload["decision"], "approved"),
            other => panic!("expected delivery, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn await_before_publish_is_delivered() {
        let bus = Arc::new(MessageBus::new());
        let cancel = CancellationToken::new();
        let bus2 = bus.clone();
        let handle = tokio::spawn(async move {
            bus2.r#await("emailApproval", "REQ-1", None, &CancellationToken::new())
                .await
        });
        tokio::task::yield_now().await;
        bus.publish("emailApproval", "REQ-1", json!({"decision": "denied"}))
            .await;
        let outcome = handle.await.unwrap();
        match outcome {
            AwaitOutcome::Delivered(msg) => assert_eq!(msg.payload["decision"], "denied"),
            other => panic!("expected delivery, got {other:?}"),
        }
        let _ = cancel;
    }

    #[tokio::test]
    async fn cancellation_while_waiting() {
        let bus = Arc::new(MessageBus::new());
        let cancel = CancellationToken::new();
        let bus2 = bus.clone();
        let cancel2 = cancel.clone();
        let handle = tokio::spawn(async move {
            bus2.r#await("x", "k", None, &cancel2).await
        });
        tokio::task::yield_now().await;
        cancel.cancel();
        let outcome = handle.await.unwrap();
        assert_eq!(outcome, AwaitOutcome::Cancelled);
    }

    #[tokio::test]
    async fn timeout_elapses() {
        let bus = MessageBus::new();
        let cancel = CancellationToken::new();
        let outcome = bus
            .r#await("x", "k", Some(std::time::Duration::from_millis(5)), &cancel)
            .await;
        assert_eq!(outcome, AwaitOutcome::Timeout);
    }

    #[tokio::test]
    async fn empty_correlation_key_is_wildcard_not_matching_keyed_publish() {
        let bus = MessageBus::new();
        bus.publish("x", "REQ-1", json!({})).await;
        let cancel = CancellationToken::new();
        let outcome = bus
            .r#await("x", "", Some(std::time::Duration::from_millis(5)), &cancel)
            .await;
        assert_eq!(outcome, AwaitOutcome::Timeout);
    }
}
