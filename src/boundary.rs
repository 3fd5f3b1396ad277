//! Runs an activity body racing against its attached boundary events
//! (spec §4.7): timer, error, message, escalation. Compensation boundaries
//! never race the forward flow — they are filtered out here and registered
//! by the scheduler only on successful completion.

use crate::error::EngineError;
use crate::executors::resolve_timer_duration;
use crate::expression::ExpressionEvaluator;
use crate::message_bus::{AwaitOutcome, MessageBus};
use crate::types::{Element, ElementType};
use serde_json::Value as Json;
use std::future::Future;
use tokio_util::sync::CancellationToken;

pub enum BoundaryOutcome {
    /// The activity body completed normally; all watchers were cancelled.
    Completed(Json),
    /// An interrupting boundary fired: the activity was cancelled and the
    /// boundary's outgoing flow should be taken instead.
    Interrupted { boundary: Element, payload: Json },
    /// An error boundary caught the activity's failure.
    CaughtError { boundary: Element, error: EngineError },
    /// The activity body failed and no boundary matched.
    Uncaught(EngineError),
    /// The activity (or an ancestor) was cancelled from outside.
    Cancelled,
}

enum Armed<'a> {
    Timer { boundary: &'a Element, interrupting: bool },
    Message { boundary: &'a Element, interrupting: bool },
    Escalation { boundary: &'a Element, interrupting: bool },
}

/// Races `body` against every boundary event attached to `activity`.
/// `body` receives a child cancellation token that is cancelled when an
/// interrupting boundary wins.
pub async fn run_with_boundaries<F, Fut>(
    boundaries: &[&Element],
    parent_cancel: &CancellationToken,
    evaluator: &ExpressionEvaluator,
    bus: &MessageBus,
    ctx: &Json,
    body: F,
    mut on_non_interrupting: impl FnMut(&Element, &Json),
) -> BoundaryOutcome
where
    F: FnOnce(CancellationToken) -> Fut,
    Fut: Future<Output = Result<Json, EngineError>>,
{
    let activity_cancel = parent_cancel.child_token();
    let error_boundaries: Vec<&Element> = boundaries
        .iter()
        .filter(|b| b.kind == ElementType::BoundaryErrorEvent)
        .copied()
        .collect();
    let mut armed: Vec<Armed> = boundaries
        .iter()
        .filter_map(|b| match b.kind {
            ElementType::BoundaryTimerEvent => Some(Armed::Timer {
                boundary: b,
                interrupting: b.properties.get("cancelActivity").and_then(|v| v.as_bool()).unwrap_or(true),
            }),
            ElementType::BoundaryMessageEvent => Some(Armed::Message {
                boundary: b,
                interrupting: b.properties.get("cancelActivity").and_then(|v| v.as_bool()).unwrap_or(true),
            }),
            ElementType::BoundaryEscalationEvent => Some(Armed::Escalation {
                boundary: b,
                interrupting: b.properties.get("cancelActivity").and_then(|v| v.as_bool()).unwrap_or(true),
            }),
            _ => None,
        })
        .collect();

    let body_fut = body(activity_cancel.clone());
    tokio::pin!(body_fut);

    loop {
        let watcher = watch_once(&armed, evaluator, bus, ctx, &activity_cancel);
        tokio::pin!(watcher);

        tokio::select! {
            biased;
            _ = parent_cancel.cancelled() => {
                activity_cancel.cancel();
                return BoundaryOutcome::Cancelled;
            }
            result = &mut body_fut => {
                activity_cancel.cancel();
                return match result {
                    Ok(value) => BoundaryOutcome::Completed(value),
                    Err(EngineError::Cancelled) => BoundaryOutcome::Cancelled,
                    Err(err) => match match_error_boundary(&error_boundaries, &err) {
                        Some(boundary) => BoundaryOutcome::CaughtError { boundary: boundary.clone(), error: err },
                        None => BoundaryOutcome::Uncaught(err),
                    },
                };
            }
            fired = watcher => {
                match fired {
                    Some((boundary, interrupting, payload)) if interrupting => {
                        activity_cancel.cancel();
                        return BoundaryOutcome::Interrupted { boundary: boundary.clone(), payload };
                    }
                    Some((boundary, _non_interrupting, payload)) => {
                        on_non_interrupting(boundary, &payload);
                        let is_cycle_timer = boundary.kind == ElementType::BoundaryTimerEvent
                            && boundary.property_str("timerCycle").is_some();
                        if !is_cycle_timer {
                            armed.retain(|a| arm_boundary_id(a) != boundary.id);
                        }
                        continue;
                    }
                    None => continue,
                }
            }
        }
    }
}

/// Waits for the first armed watcher to fire; returns `None` only if all
/// watchers are exhausted (no boundaries armed), in which case the caller's
/// `select!` simply waits on the body.
async fn watch_once<'a>(
    armed: &'a [Armed<'a>],
    evaluator: &ExpressionEvaluator,
    bus: &MessageBus,
    ctx: &Json,
    cancel: &CancellationToken,
) -> Option<(&'a Element, bool, Json)> {
    if armed.is_empty() {
        std::future::pending::<()>().await;
        return None;
    }
    type BoxedWatch<'a> = std::pin::Pin<Box<dyn Future<Output = Option<(&'a Element, bool, Json)>> + Send + 'a>>;
    let futures: Vec<BoxedWatch> = armed
        .iter()
        .map(|a| -> BoxedWatch {
            match a {
                Armed::Timer { boundary, interrupting } => Box::pin(async move {
                    let duration = resolve_timer_duration(boundary).ok()?;
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => None,
                        _ = tokio::time::sleep(duration) => Some((*boundary, *interrupting, Json::Bool(true))),
                    }
                }),
                Armed::Message { boundary, interrupting } => Box::pin(async move {
                    let message_ref = boundary.property_str("messageRef")?;
                    let correlation_key = boundary
                        .property_str("correlationKey")
                        .map(|t| evaluator.interpolate(t, ctx))
                        .unwrap_or_default();
                    match bus.r#await(message_ref, &correlation_key, None, cancel).await {
                        AwaitOutcome::Delivered(msg) => Some((*boundary, *interrupting, msg.payload)),
                        _ => None,
                    }
                }),
                Armed::Escalation { boundary, interrupting } => Box::pin(async move {
                    let escalation_code = boundary.property_str("escalationCode")?;
                    match bus.r#await(escalation_code, "", None, cancel).await {
                        AwaitOutcome::Delivered(msg) => Some((*boundary, *interrupting, msg.payload)),
                        _ => None,
                    }
                }),
            }
        })
        .collect();

    let (result, _idx, _rest) = futures::future::select_all(futures).await;
    result
}

fn arm_boundary_id(a: &Armed) -> &str {
    match a {
        Armed::Timer { boundary, .. } | Armed::Message { boundary, .. } | Armed::Escalation { boundary, .. } => {
            boundary.id.as_str()
        }
    }
}

fn match_error_boundary<'a>(boundaries: &[&'a Element], err: &EngineError) -> Option<&'a Element> {
    let code = err.error_code();
    boundaries
        .iter()
        .find(|b| {
            let filter = b.property_str("errorCode").unwrap_or("");
            filter.is_empty() || code.contains(filter)
        })
        .copied()
}
