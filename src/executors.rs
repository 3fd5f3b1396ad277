//! Per-type task executor contracts (spec §4.6). Each leaf executor here
//! implements `Execute(element, context, cancellation) -> final_result`,
//! matching the teacher's registry-of-executor-objects idiom (spec §9's
//! "polymorphism across element kinds" note) but realized as tagged
//! dispatch in `run_leaf_task` rather than a vtable registry, since the
//! element-kind set is closed and known at compile time.
//!
//! Composite behaviours that need to recurse into the scheduler itself
//! (call activities, multi-instance fan-out, standard loops) live in
//! `scheduler.rs`, where the recursion is natural.

use crate::error::EngineError;
use crate::expression::ExpressionEvaluator;
use crate::message_bus::{AwaitOutcome, MessageBus};
use crate::types::Element;
use async_trait::async_trait;
use serde_json::{Map, Value as Json};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Progress messages forwarded to the UI while a task is in flight (spec §6
/// event table: `task.thinking`, `task.tool.start/end`,
/// `text.message.start/chunk/end`).
#[derive(Clone, Debug)]
pub enum Progress {
    Thinking { message: String },
    ToolStart { tool_name: String, args: Json },
    ToolEnd { tool_name: String, result: Json },
    TextStart { message_id: Uuid, role: String },
    TextChunk { message_id: Uuid, content: String, role: String },
    TextEnd { message_id: Uuid },
}

/// A cloneable sink executors push `Progress` into; the scheduler drains it
/// and turns each message into an `Event`.
#[derive(Clone)]
pub struct ProgressSink(mpsc::UnboundedSender<Progress>);

impl ProgressSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Progress>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self(tx), rx)
    }

    pub fn send(&self, progress: Progress) {
        // A closed receiver (scheduler already moved on) is not an error.
        let _ = self.0.send(progress);
    }
}

/// External side-effect boundary: email gateways, LLM/tool calls, cloud
/// APIs. Out of scope per spec §1 — the engine only defines the contract.
#[async_trait]
pub trait ServiceHandler: Send + Sync {
    async fn call(
        &self,
        task_type: &str,
        properties: &BTreeMap<String, Json>,
        context: &Json,
        progress: ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<Json, EngineError>;
}

/// A `ServiceHandler` that fails every call — the default when no handler
/// is wired for a given `task_type`, so unconfigured service/send/agentic
/// tasks fail loudly rather than silently no-op.
pub struct UnconfiguredHandler;

#[async_trait]
impl ServiceHandler for UnconfiguredHandler {
    async fn call(
        &self,
        task_type: &str,
        _properties: &BTreeMap<String, Json>,
        _context: &Json,
        _progress: ProgressSink,
        _cancel: &CancellationToken,
    ) -> Result<Json, EngineError> {
        Err(EngineError::TaskFailed {
            element_id: String::new(),
            code: "NoHandler".to_string(),
            message: format!("no ServiceHandler registered for task_type '{task_type}'"),
        })
    }
}

/// Registry of named `ServiceHandler`s, keyed by `implementation`/task
/// topic the way `Properties.implementation` / `"send"` / `"agentic"`
/// select a handler in spec §4.6.
pub struct ServiceHandlerRegistry {
    handlers: BTreeMap<String, Arc<dyn ServiceHandler>>,
    default: Arc<dyn ServiceHandler>,
}

impl Default for ServiceHandlerRegistry {
    fn default() -> Self {
        Self {
            handlers: BTreeMap::new(),
            default: Arc::new(UnconfiguredHandler),
        }
    }
}

impl ServiceHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn ServiceHandler>) {
        self.handlers.insert(name.into(), handler);
    }

    pub fn get(&self, name: &str) -> Arc<dyn ServiceHandler> {
        self.handlers
            .get(name)
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }
}

/// Script Task (spec §4.6): evaluate a small embedded expression over the
/// context, binding context as the only namespace, returning the last
/// expression's value. No statements beyond a single evaluable expression —
/// the sandbox is the same grammar as `ExpressionEvaluator`.
pub fn run_script_task(element: &Element, ctx: &Json) -> Result<Json, EngineError> {
    let script = element.property_str("script").ok_or_else(|| {
        EngineError::Expression(format!("scriptTask {} has no 'script' property", element.id))
    })?;
    crate::expression::eval_to_json(script, ctx).map_err(EngineError::Expression)
}

/// Service Task: invoke a named handler with `(element.Properties, context)`.
pub async fn run_service_task(
    element: &Element,
    ctx: &Json,
    handlers: &ServiceHandlerRegistry,
    progress: ProgressSink,
    cancel: &CancellationToken,
) -> Result<Json, EngineError> {
    let task_type = element
        .property_str("topic")
        .or_else(|| element.property_str("implementation"))
        .unwrap_or(element.id.as_str());
    let handler = handlers.get(task_type);
    handler
        .call(task_type, &element.properties, ctx, progress, cancel)
        .await
        .map_err(|e| retag_element(e, &element.id))
}

/// Send Task: interpolate `to`/`subject`/`body` then delegate to the
/// `"send"` handler. Success is handler-returning-without-error.
pub async fn run_send_task(
    element: &Element,
    ctx: &Json,
    handlers: &ServiceHandlerRegistry,
    evaluator: &ExpressionEvaluator,
    progress: ProgressSink,
    cancel: &CancellationToken,
) -> Result<Json, EngineError> {
    let mut payload = Map::new();
    for key in ["to", "subject", "messageBody"] {
        if let Some(tmpl) = element.property_str(key) {
            payload.insert(key.to_string(), Json::String(evaluator.interpolate(tmpl, ctx)));
        }
    }
    let handler = handlers.get("send");
    handler
        .call("send", &element.properties, &Json::Object(payload), progress, cancel)
        .await
        .map_err(|e| retag_element(e, &element.id))
}

/// Receive Task: `MessageBus.Await` on `messageRef`/`correlationKey`
/// (interpolated) / `timeoutMs`.
pub async fn run_receive_task(
    element: &Element,
    ctx: &Json,
    bus: &MessageBus,
    evaluator: &ExpressionEvaluator,
    cancel: &CancellationToken,
) -> Result<Json, EngineError> {
    let message_ref = element
        .property_str("messageRef")
        .ok_or_else(|| EngineError::Definition(format!("receiveTask {} missing messageRef", element.id)))?;
    let correlation_key = element
        .property_str("correlationKey")
        .map(|t| evaluator.interpolate(t, ctx))
        .unwrap_or_default();
    let timeout = element.property_u64("timeoutMs").map(Duration::from_millis);
    match bus.r#await(message_ref, &correlation_key, timeout, cancel).await {
        AwaitOutcome::Delivered(msg) => Ok(msg.payload),
        AwaitOutcome::Timeout => Err(EngineError::Timeout {
            element_id: element.id.clone(),
        }),
        AwaitOutcome::Cancelled => Err(EngineError::Cancelled),
    }
}

/// Timer (intermediate catch): parse the duration/date/cycle spec and sleep
/// until due, observing cancellation.
pub async fn run_timer_catch(element: &Element, cancel: &CancellationToken) -> Result<Json, EngineError> {
    let duration = resolve_timer_duration(element)?;
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(EngineError::Cancelled),
        _ = tokio::time::sleep(duration) => Ok(Json::Bool(true)),
    }
}

/// Message Event (throw): `MessageBus.Publish`.
pub async fn run_message_throw(
    element: &Element,
    ctx: &Json,
    bus: &MessageBus,
    evaluator: &ExpressionEvaluator,
) -> Result<Json, EngineError> {
    let message_ref = element
        .property_str("messageRef")
        .ok_or_else(|| EngineError::Definition(format!("{} missing messageRef", element.id)))?;
    let correlation_key = element
        .property_str("correlationKey")
        .map(|t| evaluator.interpolate(t, ctx))
        .unwrap_or_default();
    bus.publish(message_ref, &correlation_key, ctx.clone()).await;
    Ok(Json::Bool(true))
}

/// Message Event (catch): `MessageBus.Await`.
pub async fn run_message_catch(
    element: &Element,
    ctx: &Json,
    bus: &MessageBus,
    evaluator: &ExpressionEvaluator,
    cancel: &CancellationToken,
) -> Result<Json, EngineError> {
    run_receive_task(element, ctx, bus, evaluator, cancel).await
}

/// Signal Event: wildcard-correlation broadcast to every current waiter on
/// the signal's ref (spec §4.6) — all matching waiters consume
/// independently.
pub async fn run_signal_throw(element: &Element, ctx: &Json, bus: &MessageBus) -> Result<Json, EngineError> {
    let signal_ref = element
        .property_str("signalRef")
        .ok_or_else(|| EngineError::Definition(format!("{} missing signalRef", element.id)))?;
    bus.broadcast(signal_ref, ctx.clone()).await;
    Ok(Json::Bool(true))
}

/// Resolve an ISO-8601 duration/date/cycle spec into a sleep `Duration`,
/// for the duration and absolute-instant forms; cycle (`R[n]/<duration>`)
/// re-registration is the caller's (boundary supervisor's) concern.
pub fn resolve_timer_duration(element: &Element) -> Result<Duration, EngineError> {
    if let Some(dur) = element.property_str("timerDuration") {
        return parse_iso8601_duration(dur)
            .map(Duration::from_millis)
            .map_err(EngineError::Definition);
    }
    if let Some(date) = element.property_str("timerDate") {
        let deadline_ms: i64 = date
            .parse()
            .map_err(|_| EngineError::Definition(format!("invalid timerDate '{date}'")))?;
        let now = crate::types::now_ms();
        let remaining = (deadline_ms - now).max(0) as u64;
        return Ok(Duration::from_millis(remaining));
    }
    Err(EngineError::Definition(format!(
        "{} has no timerDuration/timerDate",
        element.id
    )))
}

/// Parse `P[n]DT[n]H[n]M[n]S` into milliseconds.
pub fn parse_iso8601_duration(input: &str) -> Result<u64, String> {
    let s = input
        .strip_prefix('P')
        .ok_or_else(|| format!("duration '{input}' must start with 'P'"))?;
    let (date_part, time_part) = match s.split_once('T') {
        Some((d, t)) => (d, Some(t)),
        None => (s, None),
    };
    let mut ms: u64 = 0;
    ms += parse_designated(date_part, 'D')? * 24 * 3600 * 1000;
    if let Some(t) = time_part {
        ms += parse_designated(t, 'H')? * 3600 * 1000;
        ms += parse_designated(t, 'M')? * 60 * 1000;
        ms += parse_designated(t, 'S')? * 1000;
    }
    Ok(ms)
}

fn parse_designated(segment: &str, designator: char) -> Result<u64, String> {
    let mut num = String::new();
    let mut chars = segment.chars().peekable();
    while let Some(&c) = chars.peek() {
        if c.is_ascii_digit() {
            num.push(c);
            chars.next();
        } else if c == designator {
            chars.next();
            return num.parse().map_err(|_| format!("bad number before '{designator}'"));
        } else {
            // Skip over a different designator's digits (e.g. 'H' while
            // looking for 'M').
            num.clear();
            chars.next();
        }
    }
    Ok(0)
}

/// Parse `R[n]/PT..` cycle specs into (interval_ms, max_fires).
pub fn parse_cycle(input: &str) -> Result<(u64, u32), String> {
    let rest = input
        .strip_prefix('R')
        .ok_or_else(|| format!("cycle '{input}' must start with 'R'"))?;
    let (count, duration) = rest
        .split_once('/')
        .ok_or_else(|| format!("cycle '{input}' missing '/'"))?;
    let max_fires: u32 = if count.is_empty() {
        0
    } else {
        count.parse().map_err(|_| format!("bad cycle count '{count}'"))?
    };
    let interval_ms = parse_iso8601_duration(duration)?;
    Ok((interval_ms, max_fires))
}

fn retag_element(err: EngineError, element_id: &str) -> EngineError {
    match err {
        EngineError::TaskFailed { code, message, .. } => EngineError::TaskFailed {
            element_id: element_id.to_string(),
            code,
            message,
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_parses_hours_minutes() {
        assert_eq!(parse_iso8601_duration("PT2H").unwrap(), 2 * 3600 * 1000);
        assert_eq!(parse_iso8601_duration("PT90M").unwrap(), 90 * 60 * 1000);
        assert_eq!(parse_iso8601_duration("P1DT1H").unwrap(), 25 * 3600 * 1000);
    }

    #[test]
    fn cycle_parses_count_and_interval() {
        let (interval, max) = parse_cycle("R3/PT1H").unwrap();
        assert_eq!(interval, 3600 * 1000);
        assert_eq!(max, 3);
    }

    #[tokio::test]
    async fn unconfigured_handler_fails_loudly() {
        let registry = ServiceHandlerRegistry::new();
        let (sink, _rx) = ProgressSink::channel();
        let cancel = CancellationToken::new();
        let err = registry
            .get("whatever")
            .call("whatever", &BTreeMap::new(), &Json::Null, sink, &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "NoHandler");
    }
}
