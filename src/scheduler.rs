//! Graph-walking scheduler (spec §4.9): the component that actually drives
//! a `WorkflowDefinition` forward. Owns forking/joining, boundary and
//! event-sub-process supervision, multi-instance/standard-loop fan-out, and
//! call-activity/sub-process recursion. Everything downstream of here
//! (`gateway`, `boundary`, `event_subprocess`, `executors`, `message_bus`,
//! `compensation`) is pure with respect to the graph; this module is where
//! their decisions turn into actual cooperative tasks.
//!
//! Structured concurrency mirrors the teacher's fiber-ownership model (a
//! `Fiber` is owned by whichever scope spawned it) but realized with real
//! `tokio::spawn` + `CancellationToken` trees instead of a tick-polled VM,
//! since suspension points here are genuine `await`s.

use crate::boundary::{self, BoundaryOutcome};
use crate::compensation::CompensationRegistry;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::event::{Event, EventStream};
use crate::event_subprocess;
use crate::executors::{self, ProgressSink, ServiceHandlerRegistry};
use crate::expression::ExpressionEvaluator;
use crate::gateway::{ArrivalOutcome, Decision, GatewayEvaluator};
use crate::graph::ProcessGraph;
use crate::message_bus::MessageBus;
use crate::types::{CompensationEntry, Element, ElementType, WorkflowDefinition};
use serde_json::{Map, Value as Json};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex, Notify};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Shared, mutation-visible process context (spec §3/§9: schema-less JSON
/// map, last-writer-wins, no implicit serialization guarantee beyond what
/// safe Rust requires to touch shared memory at all).
#[derive(Clone)]
pub struct SharedContext(Arc<Mutex<Json>>);

impl SharedContext {
    pub fn new(initial: Json) -> Self {
        Self(Arc::new(Mutex::new(initial)))
    }

    pub async fn snapshot(&self) -> Json {
        self.0.lock().await.clone()
    }

    /// Shallow top-level merge: each key in `patch` overwrites the same key
    /// in the base context. No deep-merge strategy — last writer wins at the
    /// key, matching the "no implicit locking semantics beyond memory
    /// safety" note in spec §9.
    pub async fn merge(&self, patch: &Json) {
        if let Json::Object(patch_map) = patch {
            let mut guard = self.0.lock().await;
            if !guard.is_object() {
                *guard = Json::Object(Map::new());
            }
            let base = guard.as_object_mut().unwrap();
            for (k, v) in patch_map {
                base.insert(k.clone(), v.clone());
            }
        }
    }

    pub async fn set_path(&self, path: &str, value: Json) {
        let mut guard = self.0.lock().await;
        if !guard.is_object() {
            *guard = Json::Object(Map::new());
        }
        let mut current = guard.as_object_mut().unwrap();
        let parts: Vec<&str> = path.split('.').collect();
        for part in &parts[..parts.len() - 1] {
            current = current
                .entry(part.to_string())
                .or_insert_with(|| Json::Object(Map::new()))
                .as_object_mut()
                .expect("intermediate path segment is not an object");
        }
        current.insert(parts[parts.len() - 1].to_string(), value);
    }

    /// Independent deep copy for an isolated multi-instance iteration.
    pub async fn fork(&self) -> Self {
        Self::new(self.snapshot().await)
    }
}

/// A decision recorded by `CompleteUserTask`, correlated by the scheduler to
/// an in-flight `UserTask` awaiting it (spec §6).
#[derive(Clone, Debug)]
pub struct UserTaskDecision {
    pub decision: String,
    pub comments: Option<String>,
    pub payload: Option<Json>,
}

/// Everything shared by every task belonging to one workflow instance.
pub struct InstanceHandles {
    pub bus: Arc<MessageBus>,
    pub gateways: Arc<GatewayEvaluator>,
    pub compensation: Arc<CompensationRegistry>,
    pub events: Arc<EventStream>,
    pub handlers: Arc<ServiceHandlerRegistry>,
    pub evaluator: ExpressionEvaluator,
    pub config: Arc<EngineConfig>,
    pub user_tasks: Mutex<HashMap<String, oneshot::Sender<UserTaskDecision>>>,
}

impl InstanceHandles {
    pub fn new(
        events: Arc<EventStream>,
        handlers: Arc<ServiceHandlerRegistry>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            bus: Arc::new(MessageBus::new()),
            gateways: Arc::new(GatewayEvaluator::new()),
            compensation: Arc::new(CompensationRegistry::new()),
            events,
            handlers,
            evaluator: ExpressionEvaluator::new(),
            config,
            user_tasks: Mutex::new(HashMap::new()),
        }
    }
}

/// The active (sub)process definition plus addressing for events/compensation.
struct ScopeInfo {
    def: Arc<WorkflowDefinition>,
    scope_id: String,
    instance_id: Uuid,
}

/// Counts concurrently running branches of one scope and records the first
/// non-cancellation failure, so the scope can wait for every fork to settle
/// before deciding its own outcome. The join pattern mirrors a
/// structured-concurrency "nursery": every `spawn_branch` is matched by
/// exactly one completion before `join` returns.
struct BranchTracker {
    active: AtomicUsize,
    done: Notify,
    failure: Mutex<Option<EngineError>>,
}

impl BranchTracker {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            active: AtomicUsize::new(0),
            done: Notify::new(),
            failure: Mutex::new(None),
        })
    }

    fn spawn_branch<F>(self: &Arc<Self>, scope_cancel: &CancellationToken, fut: F)
    where
        F: Future<Output = Result<(), EngineError>> + Send + 'static,
    {
        self.active.fetch_add(1, Ordering::SeqCst);
        let tracker = self.clone();
        let cancel = scope_cancel.clone();
        tokio::spawn(async move {
            let result = fut.await;
            if let Err(err) = &result {
                if !err.is_cancellation() {
                    let mut guard = tracker.failure.lock().await;
                    if guard.is_none() {
                        *guard = Some(err.clone());
                    }
                    cancel.cancel();
                }
            }
            if tracker.active.fetch_sub(1, Ordering::SeqCst) == 1 {
                tracker.done.notify_waiters();
            }
        });
    }

    async fn join(self: &Arc<Self>) -> Result<(), EngineError> {
        loop {
            let notified = self.done.notified();
            if self.active.load(Ordering::SeqCst) == 0 {
                break;
            }
            notified.await;
        }
        let failure = self.failure.lock().await.clone();
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Bundle threaded through every recursive call within one scope.
struct RunCtx {
    scope: Arc<ScopeInfo>,
    handles: Arc<InstanceHandles>,
    tracker: Arc<BranchTracker>,
}

async fn emit(handles: &InstanceHandles, scope: &ScopeInfo, kind: &str, element_id: Option<&str>, payload: Json) {
    let event = Event::new(kind, scope.instance_id, element_id, payload);
    if let Err(err) = handles.events.emit(event).await {
        tracing::warn!(error = %err, kind, "failed to persist event");
    }
}

/// Runs one (sub)process scope to completion: `def`'s graph starting at
/// `start_id`, racing any interrupting event-sub-processes declared at this
/// scope and arming non-interrupting ones as detached watchers. Returns the
/// scope's context snapshot at the moment it settled.
pub async fn run_process_scope(
    def: Arc<WorkflowDefinition>,
    scope_id: String,
    instance_id: Uuid,
    start_id: String,
    ctx: SharedContext,
    parent_cancel: CancellationToken,
    handles: Arc<InstanceHandles>,
) -> Result<Json, EngineError> {
    let scope_cancel = parent_cancel.child_token();
    let scope = Arc::new(ScopeInfo {
        def: def.clone(),
        scope_id: scope_id.clone(),
        instance_id,
    });

    let event_subprocesses: Vec<&Element> = def
        .elements
        .iter()
        .filter(|e| e.kind == ElementType::EventSubProcess)
        .collect();

    for esp in &event_subprocesses {
        if let Some(start_event) = event_subprocess::start_event_of(esp) {
            if !event_subprocess::is_interrupting(esp) {
                spawn_recurring_event_subprocess(
                    scope.clone(),
                    (*esp).clone(),
                    start_event.clone(),
                    ctx.clone(),
                    scope_cancel.clone(),
                    handles.clone(),
                );
            }
        }
    }

    let interrupting: Vec<(Element, Element)> = event_subprocesses
        .iter()
        .filter(|e| event_subprocess::is_interrupting(e))
        .filter_map(|e| event_subprocess::start_event_of(e).map(|s| ((*e).clone(), s.clone())))
        .collect();

    // Error-start event-sub-processes can't be raced preemptively: whether
    // one applies is only known once the main flow actually fails with a
    // matching `errorCode` (spec §4.8). Every other interrupting start kind
    // (timer/message/signal/escalation) can legitimately fire before the
    // main flow settles and is raced via `event_subprocess::watch`.
    let error_interrupting: Vec<(Element, Element)> = interrupting
        .iter()
        .filter(|(_, start)| start.kind == ElementType::ErrorStartEvent)
        .cloned()
        .collect();
    let preemptive_interrupting: Vec<(Element, Element)> = interrupting
        .into_iter()
        .filter(|(_, start)| start.kind != ElementType::ErrorStartEvent)
        .collect();

    let tracker = BranchTracker::new();
    let rc = Arc::new(RunCtx {
        scope: scope.clone(),
        handles: handles.clone(),
        tracker: tracker.clone(),
    });
    tracker.spawn_branch(&scope_cancel, run_branch(rc, start_id, ctx.clone(), scope_cancel.clone()));

    let main_result = if preemptive_interrupting.is_empty() {
        tracker.join().await
    } else {
        // Race the main flow against every preemptive event-sub-process start.
        type BoxedRace = std::pin::Pin<Box<dyn Future<Output = RaceOutcome> + Send>>;
        let mut races: Vec<BoxedRace> = Vec::new();
        {
            let tracker = tracker.clone();
            races.push(Box::pin(async move { RaceOutcome::MainDone(tracker.join().await) }));
        }
        for (esp, start_event) in preemptive_interrupting {
            let bus = handles.bus.clone();
            let evaluator = handles.evaluator;
            let watch_ctx = ctx.snapshot().await;
            let watch_cancel = scope_cancel.clone();
            races.push(Box::pin(async move {
                let payload = event_subprocess::watch(&start_event, &bus, &evaluator, &watch_ctx, &watch_cancel).await;
                match payload {
                    Some(p) => RaceOutcome::EventSubProcess(esp, p),
                    None => std::future::pending().await,
                }
            }));
        }

        let (winner, _idx, _rest) = futures::future::select_all(races).await;
        scope_cancel.cancel();
        match winner {
            RaceOutcome::MainDone(result) => result,
            RaceOutcome::EventSubProcess(esp, payload) => {
                tracker.join().await.ok();
                emit(&handles, &scope, "compensation.triggered", Some(&esp.id), serde_json::json!({"trigger": "event_subprocess"})).await;
                let inner_ctx = ctx.clone();
                inner_ctx.merge(&payload).await;
                run_event_subprocess_body(&scope, &esp, inner_ctx.clone(), parent_cancel, &handles).await?;
                return Ok(inner_ctx.snapshot().await);
            }
        }
    };

    match main_result {
        Ok(()) => finish_scope(&scope, &handles, &ctx, Ok(())).await,
        Err(err) if !err.is_cancellation() => {
            let matched = error_interrupting
                .into_iter()
                .find(|(_, start_event)| event_subprocess::matches_error(start_event, &err.error_code()));
            match matched {
                Some((esp, _start_event)) => {
                    scope_cancel.cancel();
                    emit(&handles, &scope, "compensation.triggered", Some(&esp.id), serde_json::json!({"trigger": "event_subprocess"})).await;
                    let inner_ctx = ctx.clone();
                    inner_ctx
                        .merge(&serde_json::json!({"errorCode": err.error_code(), "message": err.to_string()}))
                        .await;
                    run_event_subprocess_body(&scope, &esp, inner_ctx.clone(), parent_cancel, &handles).await?;
                    Ok(inner_ctx.snapshot().await)
                }
                None => finish_scope(&scope, &handles, &ctx, Err(err)).await,
            }
        }
        Err(err) => finish_scope(&scope, &handles, &ctx, Err(err)).await,
    }
}

enum RaceOutcome {
    MainDone(Result<(), EngineError>),
    EventSubProcess(Element, Json),
}

async fn finish_scope(
    scope: &ScopeInfo,
    handles: &InstanceHandles,
    ctx: &SharedContext,
    result: Result<(), EngineError>,
) -> Result<Json, EngineError> {
    match result {
        Ok(()) => {
            handles.compensation.clear(&scope.scope_id).await;
            Ok(ctx.snapshot().await)
        }
        Err(err) => Err(err),
    }
}

fn spawn_recurring_event_subprocess(
    scope: Arc<ScopeInfo>,
    esp: Element,
    start_event: Element,
    ctx: SharedContext,
    scope_cancel: CancellationToken,
    handles: Arc<InstanceHandles>,
) {
    tokio::spawn(async move {
        loop {
            let watch_ctx = ctx.snapshot().await;
            let payload = event_subprocess::watch(&start_event, &handles.bus, &handles.evaluator, &watch_ctx, &scope_cancel).await;
            let Some(payload) = payload else {
                return;
            };
            if scope_cancel.is_cancelled() {
                return;
            }
            let child_ctx = ctx.fork().await;
            child_ctx.merge(&payload).await;
            let _ = run_event_subprocess_body(&scope, &esp, child_ctx, scope_cancel.clone(), &handles).await;
        }
    });
}

async fn run_event_subprocess_body(
    scope: &ScopeInfo,
    esp: &Element,
    ctx: SharedContext,
    cancel: CancellationToken,
    handles: &Arc<InstanceHandles>,
) -> Result<(), EngineError> {
    let nested_def = build_child_definition(esp);
    let first = first_non_start_element(&nested_def).ok_or_else(|| {
        EngineError::Definition(format!("eventSubProcess {} has no reachable body", esp.id))
    })?;
    let nested_scope_id = format!("{}/{}", scope.scope_id, esp.id);
    run_process_scope(
        Arc::new(nested_def),
        nested_scope_id,
        scope.instance_id,
        first,
        ctx,
        cancel,
        handles.clone(),
    )
    .await
    .map(|_| ())
}

/// Walks a single cooperative path forward, spawning sibling branches into
/// `rc.tracker` on a diverging fork and returning once this path reaches an
/// end event, is absorbed into a synchronizing join, or fails.
fn run_branch(
    rc: Arc<RunCtx>,
    mut current: String,
    ctx: SharedContext,
    cancel: CancellationToken,
) -> std::pin::Pin<Box<dyn Future<Output = Result<(), EngineError>> + Send>> {
    Box::pin(async move {
        loop {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            let element = rc
                .scope
                .def
                .element(&current)
                .cloned()
                .ok_or_else(|| EngineError::Definition(format!("unknown element '{current}'")))?;

            if element.kind.is_gateway() {
                match step_gateway(&rc, &element, &ctx, &cancel).await? {
                    Some(next) => {
                        current = next;
                        continue;
                    }
                    None => return Ok(()),
                }
            }

            if element.kind == ElementType::EndEvent {
                emit(&rc.handles, &rc.scope, "element.entered", Some(&element.id), serde_json::json!({})).await;
                emit(&rc.handles, &rc.scope, "element.completed", Some(&element.id), serde_json::json!({})).await;
                return Ok(());
            }

            if element.kind == ElementType::EventSubProcess {
                // Sub-process-scoped watchers are armed by the owning
                // `run_process_scope`, not walked as a main-flow node.
                return Ok(());
            }

            emit(&rc.handles, &rc.scope, "element.entered", Some(&element.id), serde_json::json!({})).await;

            match step_activity(&rc, &element, &ctx, &cancel).await {
                Ok(Some(next)) => {
                    current = next;
                    continue;
                }
                Ok(None) => return Ok(()),
                Err(err) => {
                    emit(
                        &rc.handles,
                        &rc.scope,
                        "element.failed",
                        Some(&element.id),
                        serde_json::json!({"errorCode": err.error_code(), "message": err.to_string()}),
                    )
                    .await;
                    return Err(err);
                }
            }
        }
    })
}

/// Evaluates/advances a gateway. Returns `Some(next_element_id)` when this
/// branch should keep walking, `None` when it forked into siblings (or
/// parked waiting at a join) and this task's job is done.
async fn step_gateway(
    rc: &Arc<RunCtx>,
    element: &Element,
    ctx: &SharedContext,
    cancel: &CancellationToken,
) -> Result<Option<String>, EngineError> {
    let outgoing = rc.scope.def.outgoing(&element.id);
    let incoming = rc.scope.def.incoming(&element.id);
    let snapshot = ctx.snapshot().await;

    emit(&rc.handles, &rc.scope, "gateway.evaluating", Some(&element.id), serde_json::json!({})).await;

    // A join point: multiple inbound flows converge here.
    if incoming.len() > 1 && outgoing.len() <= 1 {
        match element.kind {
            ElementType::ParallelGateway | ElementType::InclusiveGateway => {
                let outcome = rc.handles.gateways.arrive(&element.id, &element.id).await;
                return match outcome {
                    ArrivalOutcome::Proceed => Ok(outgoing.first().map(|c| c.to.clone())),
                    ArrivalOutcome::Wait => Ok(None),
                };
            }
            _ => {
                // Exclusive/event-based merge: any arrival passes straight
                // through without waiting for siblings.
                return Ok(outgoing.first().map(|c| c.to.clone()));
            }
        }
    }

    let decision: Decision = match element.kind {
        ElementType::ExclusiveGateway => {
            rc.handles
                .gateways
                .evaluate_exclusive(&element.id, &outgoing, &snapshot, &rc.handles.evaluator)?
        }
        ElementType::InclusiveGateway => {
            rc.handles
                .gateways
                .evaluate_inclusive(&element.id, &outgoing, &snapshot, &rc.handles.evaluator)?
        }
        ElementType::ParallelGateway => rc.handles.gateways.evaluate_parallel(&outgoing),
        ElementType::EventBasedGateway => {
            return step_event_based_gateway(rc, element, &outgoing, ctx, cancel).await;
        }
        _ => unreachable!("non-gateway element reached step_gateway"),
    };

    for conn in &decision.taken {
        emit(&rc.handles, &rc.scope, "gateway.path_taken", Some(&element.id), serde_json::json!({"connectionId": conn.id, "to": conn.to})).await;
    }
    for conn in &decision.not_taken {
        emit(&rc.handles, &rc.scope, "gateway.path_not_taken", Some(&element.id), serde_json::json!({"connectionId": conn.id, "to": conn.to})).await;
    }

    if decision.taken.len() <= 1 {
        return Ok(decision.taken.first().map(|c| c.to.clone()));
    }

    // Diverging fork: spawn every branch but the first, continue the first
    // inline. Register the expected arrival count at the matching join, if
    // one can be found structurally.
    let branch_starts: Vec<String> = decision.taken.iter().map(|c| c.to.clone()).collect();
    let graph = ProcessGraph::build(&rc.scope.def);
    if let Some(join_id) = graph.find_matching_join(&branch_starts) {
        rc.handles.gateways.set_expected_arrivals(&join_id, decision.taken.len()).await;
    }

    for target in &branch_starts[1..] {
        let rc2 = rc.clone();
        let ctx2 = ctx.clone();
        let cancel2 = cancel.clone();
        let target = target.clone();
        rc.tracker.spawn_branch(cancel, run_branch(rc2, target, ctx2, cancel2));
    }
    Ok(Some(branch_starts[0].clone()))
}

/// Event-based gateway: each outgoing branch races its first downstream
/// catch event; the winner continues, the rest are cancelled. This is the
/// idiomatic BPMN mechanism for "first response wins" (spec §8 dual-approval
/// scenario), rather than a generic race flag on arbitrary gateways.
async fn step_event_based_gateway(
    rc: &Arc<RunCtx>,
    element: &Element,
    outgoing: &[&crate::types::Connection],
    ctx: &SharedContext,
    cancel: &CancellationToken,
) -> Result<Option<String>, EngineError> {
    if !rc.handles.gateways.race_arrive(&element.id).await {
        return Ok(None);
    }
    let race_cancel = cancel.child_token();
    type BoxedRace = std::pin::Pin<Box<dyn Future<Output = Option<String>> + Send>>;
    let mut futures: Vec<BoxedRace> = Vec::new();
    for conn in outgoing {
        let target_id = conn.to.clone();
        let rc2 = rc.clone();
        let ctx2 = ctx.clone();
        let race_cancel2 = race_cancel.clone();
        futures.push(Box::pin(async move {
            let target = rc2.scope.def.element(&target_id)?.clone();
            let result = run_leaf(&rc2, &target, &ctx2.snapshot().await, &race_cancel2).await;
            match result {
                Ok(_) => {
                    let following = rc2.scope.def.outgoing(&target.id);
                    following.first().map(|c| c.to.clone())
                }
                Err(_) => None,
            }
        }));
    }
    if futures.is_empty() {
        return Ok(None);
    }
    let (winner, _idx, _rest) = futures::future::select_all(futures).await;
    race_cancel.cancel();
    emit(&rc.handles, &rc.scope, "gateway.path_taken", Some(&element.id), serde_json::json!({"race": true})).await;
    Ok(winner)
}

/// Runs one activity-like element (task, call activity, embedded
/// sub-process) including its attached boundary events, multi-instance, and
/// standard-loop wrapping. Returns the next element id, or `None` if the
/// activity resolved the branch's fate by itself (e.g. an interrupting
/// boundary drove it to a dead end with no outgoing).
async fn step_activity(
    rc: &Arc<RunCtx>,
    element: &Element,
    ctx: &SharedContext,
    cancel: &CancellationToken,
) -> Result<Option<String>, EngineError> {
    let boundaries = rc.scope.def.boundary_events_for(&element.id);
    let compensation_boundary = boundaries.iter().find(|b| b.kind == ElementType::BoundaryCompensationEvent).copied();
    let forward_boundaries: Vec<&Element> = boundaries
        .iter()
        .filter(|b| b.kind != ElementType::BoundaryCompensationEvent)
        .copied()
        .collect();

    let snapshot = ctx.snapshot().await;

    if forward_boundaries.is_empty() {
        let result = run_with_mi_and_loop(rc, element, ctx, cancel).await;
        return finish_activity(rc, element, ctx, compensation_boundary, &snapshot, result, cancel).await;
    }

    let rc2 = rc.clone();
    let element2 = element.clone();
    let ctx2 = ctx.clone();
    let outcome = boundary::run_with_boundaries(
        &forward_boundaries,
        cancel,
        &rc.handles.evaluator,
        &rc.handles.bus,
        &snapshot,
        move |child_cancel| async move { run_with_mi_and_loop(&rc2, &element2, &ctx2, &child_cancel).await },
        |b, payload| {
            let rc3 = rc.clone();
            let target = rc.scope.def.outgoing(&b.id).first().map(|c| c.to.clone());
            let ctx3 = ctx.clone();
            let cancel3 = cancel.clone();
            let payload = payload.clone();
            if let Some(target) = target {
                rc3.tracker.spawn_branch(cancel, {
                    let ctx3 = ctx3.clone();
                    async move {
                        ctx3.merge(&payload).await;
                        run_branch(rc3, target, ctx3, cancel3).await
                    }
                });
            }
        },
    )
    .await;

    match outcome {
        BoundaryOutcome::Completed(value) => {
            let result = Ok(value);
            finish_activity(rc, element, ctx, compensation_boundary, &snapshot, result, cancel).await
        }
        BoundaryOutcome::Interrupted { boundary, payload } => {
            emit(&rc.handles, &rc.scope, "task.cancelled", Some(&element.id), serde_json::json!({"boundary": boundary.id})).await;
            ctx.merge(&payload).await;
            Ok(rc.scope.def.outgoing(&boundary.id).first().map(|c| c.to.clone()))
        }
        BoundaryOutcome::CaughtError { boundary, error } => {
            emit(&rc.handles, &rc.scope, "element.failed", Some(&element.id), serde_json::json!({"errorCode": error.error_code()})).await;
            Ok(rc.scope.def.outgoing(&boundary.id).first().map(|c| c.to.clone()))
        }
        BoundaryOutcome::Uncaught(err) => Err(err),
        BoundaryOutcome::Cancelled => Err(EngineError::Cancelled),
    }
}

async fn finish_activity(
    rc: &Arc<RunCtx>,
    element: &Element,
    ctx: &SharedContext,
    compensation_boundary: Option<&Element>,
    snapshot: &Json,
    result: Result<Json, EngineError>,
    cancel: &CancellationToken,
) -> Result<Option<String>, EngineError> {
    match result {
        Ok(value) => {
            match element.kind {
                ElementType::ReceiveTask => {
                    if let Json::Object(payload) = &value {
                        for (k, v) in payload {
                            ctx.set_path(&format!("{}_{}", element.id, k), v.clone()).await;
                        }
                    }
                }
                ElementType::IntermediateCatchEvent if element.properties.contains_key("messageRef") => {
                    if let Json::Object(payload) = &value {
                        for (k, v) in payload {
                            ctx.set_path(&format!("{}_{}", element.id, k), v.clone()).await;
                        }
                    }
                }
                ElementType::TimerIntermediateCatchEvent => {
                    ctx.set_path(&format!("{}_completed_at", element.id), serde_json::json!(crate::types::now_ms())).await;
                }
                ElementType::UserTask => {
                    // `run_user_task` already keys its payload by
                    // `{elementId}_decision` / `{elementId}_comments`; merge
                    // those top-level rather than nesting under `_result`.
                    ctx.merge(&value).await;
                }
                _ => {}
            }
            ctx.set_path(&format!("{}_result", element.id), value).await;
            if let Some(boundary) = compensation_boundary {
                if let Some(handler) = rc.scope.def.outgoing(&boundary.id).first() {
                    rc.handles
                        .compensation
                        .register(
                            &rc.scope.scope_id,
                            CompensationEntry {
                                element_id: element.id.clone(),
                                handler_ref: handler.to.clone(),
                                context_snapshot: snapshot.clone(),
                            },
                        )
                        .await;
                }
            }
            if element.property_bool("compensate") {
                run_compensation(rc, &rc.scope.scope_id, ctx, cancel).await;
            }
            emit(&rc.handles, &rc.scope, "element.completed", Some(&element.id), serde_json::json!({})).await;
            Ok(rc.scope.def.outgoing(&element.id).first().map(|c| c.to.clone()))
        }
        Err(err) => Err(err),
    }
}

async fn run_compensation(rc: &Arc<RunCtx>, scope_id: &str, ctx: &SharedContext, cancel: &CancellationToken) {
    let entries = rc.handles.compensation.take_for_trigger(scope_id).await;
    for entry in entries {
        let Some(handler_el) = rc.scope.def.element(&entry.handler_ref).cloned() else {
            continue;
        };
        emit(&rc.handles, &rc.scope, "compensation.triggered", Some(&entry.element_id), serde_json::json!({"handler": entry.handler_ref})).await;
        let handler_ctx = SharedContext::new(entry.context_snapshot.clone());
        if let Err(err) = run_leaf(rc, &handler_el, &handler_ctx.snapshot().await, cancel).await {
            tracing::warn!(element = %entry.handler_ref, error = %err, "compensation handler failed, continuing LIFO chain");
        }
    }
}

/// Applies multi-instance/standard-loop semantics around a single activity
/// execution (`run_activity_once`).
async fn run_with_mi_and_loop(
    rc: &Arc<RunCtx>,
    element: &Element,
    ctx: &SharedContext,
    cancel: &CancellationToken,
) -> Result<Json, EngineError> {
    if element.property_bool("isMultiInstance") {
        return run_multi_instance(rc, element, ctx, cancel).await;
    }
    if element.properties.contains_key("loopCondition") {
        return run_standard_loop(rc, element, ctx, cancel).await;
    }
    run_activity_once(rc, element, ctx, cancel).await
}

async fn run_multi_instance(
    rc: &Arc<RunCtx>,
    element: &Element,
    ctx: &SharedContext,
    cancel: &CancellationToken,
) -> Result<Json, EngineError> {
    let sequential = element.property_bool("isSequential");
    let snapshot = ctx.snapshot().await;
    let items: Vec<Json> = match element
        .property_str("inputCollection")
        .and_then(|p| crate::expression::resolve_path(&snapshot, p))
    {
        Some(Json::Array(items)) => items.clone(),
        _ => Vec::new(),
    };
    let limit = rc.handles.config.max_parallel_instances;
    if items.len() > limit {
        return Err(EngineError::MultiInstanceOverflow {
            element_id: element.id.clone(),
            limit,
        });
    }
    let element_var = element.property_str("inputElement").unwrap_or("item");
    let output_collection = element.property_str("outputCollection").map(|p| p.to_string());
    let n = items.len();

    let results: Vec<Json> = if !sequential {
        let tracker = BranchTracker::new();
        let results: Arc<Mutex<Vec<Json>>> = Arc::new(Mutex::new(vec![Json::Null; n]));
        let active = Arc::new(AtomicUsize::new(n));
        let completed = Arc::new(AtomicUsize::new(0));
        for (i, item) in items.into_iter().enumerate() {
            let iter_ctx = ctx.fork().await;
            iter_ctx.set_path(element_var, item).await;
            iter_ctx.set_path("loopCounter", serde_json::json!(i)).await;
            iter_ctx.set_path("nrOfInstances", serde_json::json!(n)).await;
            iter_ctx.set_path("nrOfActiveInstances", serde_json::json!(active.load(Ordering::SeqCst))).await;
            iter_ctx.set_path("nrOfCompletedInstances", serde_json::json!(completed.load(Ordering::SeqCst))).await;
            let rc2 = rc.clone();
            let element2 = element.clone();
            let cancel2 = cancel.child_token();
            let results2 = results.clone();
            let active2 = active.clone();
            let completed2 = completed.clone();
            tracker.spawn_branch(&cancel2, async move {
                let outcome = run_activity_once(&rc2, &element2, &iter_ctx, &cancel2).await;
                active2.fetch_sub(1, Ordering::SeqCst);
                completed2.fetch_add(1, Ordering::SeqCst);
                match outcome {
                    Ok(value) => {
                        results2.lock().await[i] = value;
                    }
                    Err(err) if err.is_cancellation() => return Err(err),
                    Err(err) => {
                        results2.lock().await[i] = serde_json::json!({"error": err.to_string()});
                    }
                }
                Ok(())
            });
        }
        // Iteration failures are recorded per-slot, never propagated: a
        // parallel multi-instance activity always completes once every
        // iteration has settled (spec §4.6). Only cancellation unwinds it.
        tracker.join().await?;
        results.lock().await.clone()
    } else {
        let mut results = Vec::with_capacity(n);
        for (i, item) in items.into_iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            ctx.set_path(element_var, item).await;
            ctx.set_path("loopCounter", serde_json::json!(i)).await;
            ctx.set_path("nrOfInstances", serde_json::json!(n)).await;
            ctx.set_path("nrOfActiveInstances", serde_json::json!(1)).await;
            ctx.set_path("nrOfCompletedInstances", serde_json::json!(i)).await;
            let value = run_activity_once(rc, element, ctx, cancel).await?;
            ctx.set_path(&format!("{}_result", element.id), value.clone()).await;
            results.push(value);
        }
        results
    };

    if let Some(path) = output_collection {
        ctx.set_path(&path, Json::Array(results.clone())).await;
    }
    Ok(Json::Array(results))
}

async fn run_standard_loop(
    rc: &Arc<RunCtx>,
    element: &Element,
    ctx: &SharedContext,
    cancel: &CancellationToken,
) -> Result<Json, EngineError> {
    let max = element
        .property_u64("loopMaximum")
        .map(|v| v as u32)
        .unwrap_or(rc.handles.config.default_loop_maximum);
    let mut last = Json::Null;
    for counter in 0..max.max(1) {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        ctx.set_path("loopCounter", serde_json::json!(counter)).await;
        last = run_activity_once(rc, element, ctx, cancel).await?;
        ctx.set_path(&format!("{}_result", element.id), last.clone()).await;
        let snapshot = ctx.snapshot().await;
        let keep_going = element
            .property_str("loopCondition")
            .map(|cond| rc.handles.evaluator.evaluate(cond, &snapshot).unwrap_or(false))
            .unwrap_or(false);
        if !keep_going {
            break;
        }
    }
    Ok(last)
}

/// The actual per-kind dispatch for a single activity execution (no
/// boundaries, no multi-instance, no loop — those wrap this).
async fn run_activity_once(
    rc: &Arc<RunCtx>,
    element: &Element,
    ctx: &SharedContext,
    cancel: &CancellationToken,
) -> Result<Json, EngineError> {
    match element.kind {
        ElementType::CallActivity => run_call_activity(rc, element, ctx, cancel).await,
        ElementType::SubProcess => run_sub_process(rc, element, ctx, cancel).await,
        _ => {
            let snapshot = ctx.snapshot().await;
            run_leaf(rc, element, &snapshot, cancel).await
        }
    }
}

/// Executes the set of element kinds whose bodies never themselves recurse
/// into the scheduler (tasks, catch/throw events, user tasks).
async fn run_leaf(rc: &Arc<RunCtx>, element: &Element, ctx: &Json, cancel: &CancellationToken) -> Result<Json, EngineError> {
    let (sink, mut progress_rx) = ProgressSink::channel();
    let scope = rc.scope.clone();
    let handles = rc.handles.clone();
    let element_id = element.id.clone();
    let drain = tokio::spawn(async move {
        while let Some(progress) = progress_rx.recv().await {
            emit_progress(&handles, &scope, &element_id, progress).await;
        }
    });

    let result = match element.kind {
        ElementType::Task | ElementType::ManualTask => Ok(Json::Null),
        ElementType::ScriptTask => executors::run_script_task(element, ctx),
        ElementType::ServiceTask | ElementType::AgenticTask => {
            executors::run_service_task(element, ctx, &rc.handles.handlers, sink, cancel).await
        }
        ElementType::SendTask => {
            executors::run_send_task(element, ctx, &rc.handles.handlers, &rc.handles.evaluator, sink, cancel).await
        }
        ElementType::ReceiveTask => executors::run_receive_task(element, ctx, &rc.handles.bus, &rc.handles.evaluator, cancel).await,
        ElementType::UserTask => run_user_task(rc, element, ctx, cancel).await,
        ElementType::TimerIntermediateCatchEvent | ElementType::TimerStartEvent => {
            executors::run_timer_catch(element, cancel).await
        }
        ElementType::IntermediateThrowEvent => {
            if element.properties.contains_key("messageRef") {
                executors::run_message_throw(element, ctx, &rc.handles.bus, &rc.handles.evaluator).await
            } else if element.properties.contains_key("signalRef") {
                executors::run_signal_throw(element, ctx, &rc.handles.bus).await
            } else {
                Ok(Json::Null)
            }
        }
        ElementType::IntermediateCatchEvent => {
            if element.properties.contains_key("messageRef") {
                executors::run_message_catch(element, ctx, &rc.handles.bus, &rc.handles.evaluator, cancel).await
            } else {
                Ok(Json::Null)
            }
        }
        ElementType::StartEvent | ElementType::MessageStartEvent | ElementType::SignalStartEvent | ElementType::EscalationStartEvent | ElementType::ErrorStartEvent => {
            Ok(Json::Null)
        }
        other => Err(EngineError::Definition(format!("{:?} cannot run as a leaf task", other))),
    };

    drain.abort();
    result
}

async fn emit_progress(handles: &InstanceHandles, scope: &ScopeInfo, element_id: &str, progress: executors::Progress) {
    use executors::Progress;
    let (kind, payload) = match progress {
        Progress::Thinking { message } => ("task.thinking", serde_json::json!({"message": message})),
        Progress::ToolStart { tool_name, args } => ("task.tool.start", serde_json::json!({"tool": tool_name, "args": args})),
        Progress::ToolEnd { tool_name, result } => ("task.tool.end", serde_json::json!({"tool": tool_name, "result": result})),
        Progress::TextStart { message_id, role } => ("text.message.start", serde_json::json!({"messageId": message_id, "role": role})),
        Progress::TextChunk { message_id, content, role } => {
            ("text.message.chunk", serde_json::json!({"messageId": message_id, "content": content, "role": role}))
        }
        Progress::TextEnd { message_id } => ("text.message.end", serde_json::json!({"messageId": message_id})),
    };
    emit(handles, scope, kind, Some(element_id), payload).await;
}

/// User Task: park until `Engine::complete_user_task` delivers a decision.
/// Rejection surfaces as `EngineError::UserRejected` (spec §7).
async fn run_user_task(rc: &Arc<RunCtx>, element: &Element, _ctx: &Json, cancel: &CancellationToken) -> Result<Json, EngineError> {
    let (tx, rx) = oneshot::channel();
    {
        let mut guard = rc.handles.user_tasks.lock().await;
        guard.insert(element.id.clone(), tx);
    }
    emit(&rc.handles, &rc.scope, "task.user.pending", Some(&element.id), serde_json::json!({})).await;

    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            rc.handles.user_tasks.lock().await.remove(&element.id);
            Err(EngineError::Cancelled)
        }
        decision = rx => match decision {
            Ok(d) if d.decision == "rejected" => Err(EngineError::UserRejected { element_id: element.id.clone() }),
            Ok(d) => {
                let mut payload = Map::new();
                payload.insert(format!("{}_decision", element.id), Json::String(d.decision));
                if let Some(comments) = d.comments {
                    payload.insert(format!("{}_comments", element.id), Json::String(comments));
                }
                if let Some(extra) = d.payload {
                    if let Json::Object(extra) = extra {
                        for (k, v) in extra {
                            payload.insert(k, v);
                        }
                    }
                }
                Ok(Json::Object(payload))
            }
            Err(_) => Err(EngineError::Cancelled),
        },
    }
}

fn build_child_definition(container: &Element) -> WorkflowDefinition {
    WorkflowDefinition {
        id: container.id.clone(),
        name: container.name.clone().unwrap_or_else(|| container.id.clone()),
        elements: container.child_elements.clone(),
        connections: container.child_connections.clone(),
        pools: vec![],
        subprocess_definitions: BTreeMap::new(),
    }
}

fn first_non_start_element(def: &WorkflowDefinition) -> Option<String> {
    let start = def.elements.iter().find(|e| {
        matches!(
            e.kind,
            ElementType::StartEvent
                | ElementType::TimerStartEvent
                | ElementType::MessageStartEvent
                | ElementType::SignalStartEvent
                | ElementType::EscalationStartEvent
                | ElementType::ErrorStartEvent
        )
    })?;
    def.outgoing(&start.id).first().map(|c| c.to.clone()).or(Some(start.id.clone()))
}

async fn run_sub_process(rc: &Arc<RunCtx>, element: &Element, ctx: &SharedContext, cancel: &CancellationToken) -> Result<Json, EngineError> {
    let nested_def = Arc::new(build_child_definition(element));
    let start = first_non_start_element(&nested_def)
        .ok_or_else(|| EngineError::Definition(format!("subProcess {} has no start event", element.id)))?;
    let nested_scope_id = format!("{}/{}", rc.scope.scope_id, element.id);
    run_process_scope(nested_def, nested_scope_id, rc.scope.instance_id, start, ctx.clone(), cancel.clone(), rc.handles.clone())
        .await
        .map(|_| Json::Null)
}

/// Call Activity (spec §9 resolved open question): a separate process
/// instance of `calledElement`, context exchanged only through declared
/// `inputMapping`/`outputMapping` objects — no implicit variable sharing.
async fn run_call_activity(rc: &Arc<RunCtx>, element: &Element, ctx: &SharedContext, cancel: &CancellationToken) -> Result<Json, EngineError> {
    let called = element
        .property_str("calledElement")
        .ok_or_else(|| EngineError::Definition(format!("callActivity {} missing calledElement", element.id)))?;
    let called_def = rc
        .scope
        .def
        .subprocess_definitions
        .get(called)
        .cloned()
        .ok_or_else(|| EngineError::Definition(format!("no subprocess definition named '{called}'")))?;

    let parent_snapshot = ctx.snapshot().await;
    let mut child_seed = Map::new();
    if let Some(Json::Object(mapping)) = element.properties.get("inputMapping") {
        for (child_var, expr) in mapping {
            if let Some(expr) = expr.as_str() {
                child_seed.insert(child_var.clone(), crate::expression::eval_to_json(expr, &parent_snapshot).unwrap_or(Json::Null));
            }
        }
    }
    let child_ctx = SharedContext::new(Json::Object(child_seed));

    let start = called_def
        .elements
        .iter()
        .find(|e| matches!(e.kind, ElementType::StartEvent))
        .and_then(|s| called_def.outgoing(&s.id).first().map(|c| c.to.clone()))
        .ok_or_else(|| EngineError::Definition(format!("subprocess '{called}' has no start event")))?;

    let nested_scope_id = format!("{}/{}#{}", rc.scope.scope_id, element.id, Uuid::now_v7());
    let child_result = run_process_scope(
        Arc::new(called_def),
        nested_scope_id,
        rc.scope.instance_id,
        start,
        child_ctx,
        cancel.clone(),
        rc.handles.clone(),
    )
    .await?;

    let mut output = Map::new();
    if let Some(Json::Object(mapping)) = element.properties.get("outputMapping") {
        for (parent_path, child_path) in mapping {
            if let Some(child_path) = child_path.as_str() {
                if let Some(value) = crate::expression::resolve_path(&child_result, child_path) {
                    output.insert(parent_path.clone(), value.clone());
                }
            }
        }
    }
    Ok(Json::Object(output))
}
