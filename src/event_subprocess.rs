//! Long-lived watchers for event-sub-processes (spec §4.8). Timer/message/
//! signal/escalation starts are watched here; error-start matching happens
//! in the scheduler at the point an uncaught error propagates out of a
//! scope, since that is the only place the failing element's error code is
//! known.

use crate::executors::resolve_timer_duration;
use crate::expression::ExpressionEvaluator;
use crate::message_bus::{AwaitOutcome, MessageBus};
use crate::types::{Element, ElementType};
use serde_json::Value as Json;
use tokio_util::sync::CancellationToken;

/// The start event nested inside an `eventSubProcess` element that defines
/// its trigger kind.
pub fn start_event_of(event_subprocess: &Element) -> Option<&Element> {
    event_subprocess
        .child_elements
        .iter()
        .find(|e| e.kind.is_event_subprocess_start())
}

pub fn is_interrupting(event_subprocess: &Element) -> bool {
    event_subprocess
        .properties
        .get("isInterrupting")
        .and_then(|v| v.as_bool())
        .unwrap_or(true)
}

/// Waits for a timer/message/signal/escalation start event to fire.
/// Returns `None` forever for error-start events (handled by the
/// scheduler) and for malformed definitions. Timer starts measure their
/// deadline from scope activation time (`activation`), per invariant 5 of
/// spec §3 — the caller is responsible for arming this watcher at the
/// moment the scope activates, not instance start.
pub async fn watch(
    start_event: &Element,
    bus: &MessageBus,
    evaluator: &ExpressionEvaluator,
    ctx: &Json,
    cancel: &CancellationToken,
) -> Option<Json> {
    match start_event.kind {
        ElementType::TimerStartEvent => {
            let duration = resolve_timer_duration(start_event).ok()?;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                _ = tokio::time::sleep(duration) => Some(Json::Bool(true)),
            }
        }
        ElementType::MessageStartEvent => {
            let message_ref = start_event.property_str("messageRef")?;
            let correlation_key = start_event
                .property_str("correlationKey")
                .map(|t| evaluator.interpolate(t, ctx))
                .unwrap_or_default();
            match bus.r#await(message_ref, &correlation_key, None, cancel).await {
                AwaitOutcome::Delivered(msg) => Some(msg.payload),
                _ => None,
            }
        }
        ElementType::SignalStartEvent => {
            let signal_ref = start_event.property_str("signalRef")?;
            match bus.r#await(signal_ref, "", None, cancel).await {
                AwaitOutcome::Delivered(msg) => Some(msg.payload),
                _ => None,
            }
        }
        ElementType::EscalationStartEvent => {
            let escalation_code = start_event.property_str("escalationCode")?;
            match bus.r#await(escalation_code, "", None, cancel).await {
                AwaitOutcome::Delivered(msg) => Some(msg.payload),
                _ => None,
            }
        }
        ElementType::ErrorStartEvent => std::future::pending().await,
        _ => None,
    }
}

/// Matches an uncaught error's code against an error-start event sub-process
/// (spec §4.8: substring match, empty catches all).
pub fn matches_error(start_event: &Element, error_code: &str) -> bool {
    if start_event.kind != ElementType::ErrorStartEvent {
        return false;
    }
    let filter = start_event.property_str("errorCode").unwrap_or("");
    filter.is_empty() || error_code.contains(filter)
}
