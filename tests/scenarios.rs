//! End-to-end scenarios run through the `Engine` facade, in the style of
//! the teacher's `bpmn-lite-server/tests/integration.rs`: build a
//! `WorkflowDefinition` by hand (parsing is out of scope), start it, drive
//! it with whatever external input the scenario calls for, then assert on
//! the event stream and/or final instance status.

use async_trait::async_trait;
use bpmn_core::{
    Connection, Element, ElementType, Engine, EngineConfig, EngineError, MemoryEventStore, ProgressSink,
    ServiceHandler, ServiceHandlerRegistry, UserTaskDecision, WorkflowDefinition,
};
use serde_json::{json, Value as Json};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

fn el(id: &str, kind: ElementType) -> Element {
    Element {
        id: id.to_string(),
        kind,
        name: None,
        properties: BTreeMap::new(),
        attached_to_ref: None,
        child_elements: vec![],
        child_connections: vec![],
    }
}

fn el_props(id: &str, kind: ElementType, props: &[(&str, Json)]) -> Element {
    let mut e = el(id, kind);
    for (k, v) in props {
        e.properties.insert(k.to_string(), v.clone());
    }
    e
}

fn el_attached(id: &str, kind: ElementType, attached_to: &str, props: &[(&str, Json)]) -> Element {
    let mut e = el_props(id, kind, props);
    e.attached_to_ref = Some(attached_to.to_string());
    e
}

fn conn(id: &str, from: &str, to: &str) -> Connection {
    Connection {
        id: id.to_string(),
        from: from.to_string(),
        to: to.to_string(),
        properties: BTreeMap::new(),
    }
}

fn conn_cond(id: &str, from: &str, to: &str, cond: &str) -> Connection {
    let mut c = conn(id, from, to);
    c.properties.insert("condition".to_string(), json!(cond));
    c
}

fn conn_default(id: &str, from: &str, to: &str) -> Connection {
    let mut c = conn(id, from, to);
    c.properties.insert("isDefault".to_string(), json!(true));
    c
}

/// Records every call it receives and answers according to a fixed table of
/// `task_type -> Ok(value) | Err(code)`, set up per scenario.
struct ScriptedHandler {
    calls: Mutex<Vec<String>>,
    answers: BTreeMap<String, Result<Json, String>>,
}

impl ScriptedHandler {
    fn new(answers: Vec<(&str, Result<Json, &str>)>) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            answers: answers
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.map_err(|e| e.to_string())))
                .collect(),
        })
    }
}

#[async_trait]
impl ServiceHandler for ScriptedHandler {
    async fn call(
        &self,
        task_type: &str,
        _properties: &BTreeMap<String, Json>,
        _context: &Json,
        _progress: ProgressSink,
        _cancel: &CancellationToken,
    ) -> Result<Json, EngineError> {
        self.calls.lock().unwrap().push(task_type.to_string());
        match self.answers.get(task_type) {
            Some(Ok(v)) => Ok(v.clone()),
            Some(Err(code)) => Err(EngineError::TaskFailed {
                element_id: String::new(),
                code: code.clone(),
                message: format!("scripted failure for {task_type}"),
            }),
            None => Ok(Json::Null),
        }
    }
}

async fn wait_for_status(engine: &Engine, id: Uuid) -> bpmn_core::InstanceStatus {
    for _ in 0..200 {
        let status = engine.instance_status(id).await.unwrap();
        if !matches!(status, bpmn_core::InstanceStatus::Running) {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    engine.instance_status(id).await.unwrap()
}

fn engine_with_handler(handler: Arc<dyn ServiceHandler>, topics: &[&str]) -> Engine {
    let mut registry = ServiceHandlerRegistry::new();
    for topic in topics {
        registry.register(*topic, handler.clone());
    }
    Engine::new(Arc::new(MemoryEventStore::new()), Arc::new(registry), EngineConfig::default())
}

/// Scenario 1: conditional path (XOR gateway picks the high-amount branch).
#[tokio::test]
async fn exclusive_gateway_picks_conditional_path() {
    let handler = ScriptedHandler::new(vec![]);
    let engine = engine_with_handler(handler, &[]);

    let def = WorkflowDefinition {
        id: "conditional".to_string(),
        name: "conditional".to_string(),
        elements: vec![
            el("start", ElementType::StartEvent),
            el_props("computeSum", ElementType::ScriptTask, &[("script", json!("${number1} + ${number2}"))]),
            el("xor", ElementType::ExclusiveGateway),
            el("highPath", ElementType::Task),
            el("lowPath", ElementType::Task),
            el("end", ElementType::EndEvent),
        ],
        connections: vec![
            conn("c1", "start", "computeSum"),
            conn("c2", "computeSum", "xor"),
            conn_cond("c3", "xor", "highPath", "${computeSum_result} > 10"),
            conn_default("c4", "xor", "lowPath"),
            conn("c5", "highPath", "end"),
            conn("c6", "lowPath", "end"),
        ],
        pools: vec![],
        subprocess_definitions: BTreeMap::new(),
    };

    let id = engine
        .start_workflow(def, json!({"number1": 7, "number2": 5}))
        .await
        .unwrap();
    let status = wait_for_status(&engine, id).await;
    assert_eq!(status, bpmn_core::InstanceStatus::Success);

    let events = engine.replay(id, Some("xor")).await.unwrap();
    let taken: Vec<&str> = events
        .iter()
        .filter(|e| e.kind == "gateway.path_taken")
        .filter_map(|e| e.payload.get("to").and_then(|v| v.as_str()))
        .collect();
    assert_eq!(taken, vec!["highPath"]);

    let ctx = engine.instance_context(id).await.unwrap().unwrap();
    assert_eq!(ctx.get("computeSum_result").and_then(|v| v.as_f64()), Some(12.0));
}

/// Scenario 2: dual approval, first response wins, the other is cancelled.
#[tokio::test]
async fn event_based_gateway_race_first_wins() {
    let handler = ScriptedHandler::new(vec![]);
    let engine = engine_with_handler(handler, &[]);

    let def = WorkflowDefinition {
        id: "dual-approval".to_string(),
        name: "dual-approval".to_string(),
        elements: vec![
            el("start", ElementType::StartEvent),
            el("gw", ElementType::EventBasedGateway),
            el_props("approveA", ElementType::ReceiveTask, &[("messageRef", json!("approvalA")), ("correlationKey", json!("${requestId}"))]),
            el_props("approveB", ElementType::ReceiveTask, &[("messageRef", json!("approvalB")), ("correlationKey", json!("${requestId}"))]),
            el("end", ElementType::EndEvent),
        ],
        connections: vec![
            conn("c1", "start", "gw"),
            conn("c2", "gw", "approveA"),
            conn("c3", "gw", "approveB"),
            conn("c4", "approveA", "end"),
            conn("c5", "approveB", "end"),
        ],
        pools: vec![],
        subprocess_definitions: BTreeMap::new(),
    };

    let id = engine.start_workflow(def, json!({"requestId": "REQ-9"})).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    engine
        .publish_message(id, "approvalA", "REQ-9", json!({"decision": "approved"}))
        .await
        .unwrap();

    let status = wait_for_status(&engine, id).await;
    assert_eq!(status, bpmn_core::InstanceStatus::Success);
}

/// Fails whenever the iteration's `item.label == "B"`, otherwise echoes the
/// item back wrapped as `{label, ok: true}`.
struct FailingOnB;

#[async_trait]
impl ServiceHandler for FailingOnB {
    async fn call(
        &self,
        _task_type: &str,
        _properties: &BTreeMap<String, Json>,
        context: &Json,
        _progress: ProgressSink,
        _cancel: &CancellationToken,
    ) -> Result<Json, EngineError> {
        let label = context.get("item").and_then(|i| i.get("label")).and_then(|v| v.as_str());
        match label {
            Some("B") => Err(EngineError::TaskFailed {
                element_id: String::new(),
                code: "boom".to_string(),
                message: "boom".to_string(),
            }),
            _ => Ok(json!({"label": label, "ok": true})),
        }
    }
}

/// Scenario 3: multi-instance parallel fan-out where one iteration fails —
/// its slot records the error, the others still complete, and the overall
/// instance succeeds.
#[tokio::test]
async fn multi_instance_parallel_partial_failure_is_recorded_per_slot() {
    let engine = engine_with_handler(Arc::new(FailingOnB), &["charge"]);

    let charge = el_props(
        "charge",
        ElementType::ServiceTask,
        &[
            ("topic", json!("charge")),
            ("isMultiInstance", json!(true)),
            ("isSequential", json!(false)),
            ("inputCollection", json!("items")),
            ("inputElement", json!("item")),
            ("outputCollection", json!("results")),
        ],
    );

    let def = WorkflowDefinition {
        id: "mi-parallel".to_string(),
        name: "mi-parallel".to_string(),
        elements: vec![el("start", ElementType::StartEvent), charge, el("end", ElementType::EndEvent)],
        connections: vec![conn("c1", "start", "charge"), conn("c2", "charge", "end")],
        pools: vec![],
        subprocess_definitions: BTreeMap::new(),
    };

    let id = engine
        .start_workflow(
            def,
            json!({"items": [{"label": "A"}, {"label": "B"}, {"label": "C"}]}),
        )
        .await
        .unwrap();
    let status = wait_for_status(&engine, id).await;
    assert_eq!(status, bpmn_core::InstanceStatus::Success);

    let ctx = engine.instance_context(id).await.unwrap().unwrap();
    let results = ctx.get("results").and_then(|v| v.as_array()).cloned().unwrap();
    assert_eq!(results.len(), 3);
    assert_eq!(results[0], json!({"label": "A", "ok": true}));
    assert!(results[1].get("error").and_then(|v| v.as_str()).unwrap().contains("boom"));
    assert_eq!(results[2], json!({"label": "C", "ok": true}));
}

/// Scenario 4: an interrupting boundary timer fires before the receive task
/// is ever satisfied, diverting the flow to the timeout path.
#[tokio::test]
async fn interrupting_boundary_timer_diverts_flow() {
    let handler = ScriptedHandler::new(vec![]);
    let engine = engine_with_handler(handler, &[]);

    let def = WorkflowDefinition {
        id: "boundary-timer".to_string(),
        name: "boundary-timer".to_string(),
        elements: vec![
            el("start", ElementType::StartEvent),
            el_props("waitForApproval", ElementType::ReceiveTask, &[("messageRef", json!("approval")), ("correlationKey", json!(""))]),
            el_attached("timeout", ElementType::BoundaryTimerEvent, "waitForApproval", &[("timerDuration", json!("PT0.01S")), ("cancelActivity", json!(true))]),
            el("onTime", ElementType::EndEvent),
            el("timedOut", ElementType::EndEvent),
        ],
        connections: vec![
            conn("c1", "start", "waitForApproval"),
            conn("c2", "waitForApproval", "onTime"),
            conn("c3", "timeout", "timedOut"),
        ],
        pools: vec![],
        subprocess_definitions: BTreeMap::new(),
    };

    let id = engine.start_workflow(def, json!({})).await.unwrap();
    let status = wait_for_status(&engine, id).await;
    assert_eq!(status, bpmn_core::InstanceStatus::Success);

    let events = engine.replay(id, None).await.unwrap();
    assert!(events.iter().any(|e| e.kind == "task.cancelled"));
    assert!(events.iter().any(|e| e.kind == "element.entered" && e.element_id.as_deref() == Some("timedOut")));
}

/// Scenario 5: an error-start event sub-process interrupts the main flow
/// when the protected service task fails.
#[tokio::test]
async fn error_event_subprocess_catches_task_failure() {
    let handler = ScriptedHandler::new(vec![("charge", Err("CardDeclined"))]);
    let engine = engine_with_handler(handler, &["charge"]);

    let error_start = el_props("errCatch", ElementType::ErrorStartEvent, &[("errorCode", json!("CardDeclined"))]);
    let mut esp = el_props("handleFailure", ElementType::EventSubProcess, &[("isInterrupting", json!(true))]);
    esp.child_elements = vec![error_start.clone(), el("recoveryEnd", ElementType::EndEvent)];
    esp.child_connections = vec![conn("esp-c1", "errCatch", "recoveryEnd")];

    let def = WorkflowDefinition {
        id: "error-esp".to_string(),
        name: "error-esp".to_string(),
        elements: vec![
            el("start", ElementType::StartEvent),
            el_props("charge", ElementType::ServiceTask, &[("topic", json!("charge"))]),
            el("mainEnd", ElementType::EndEvent),
            esp,
        ],
        connections: vec![conn("c1", "start", "charge"), conn("c2", "charge", "mainEnd")],
        pools: vec![],
        subprocess_definitions: BTreeMap::new(),
    };

    let id = engine.start_workflow(def, json!({})).await.unwrap();
    let status = wait_for_status(&engine, id).await;
    assert_eq!(status, bpmn_core::InstanceStatus::Success);
}

/// Scenario 6: LIFO compensation — two protected steps complete, then an
/// explicit compensation throw rolls them back in reverse order.
#[tokio::test]
async fn compensation_fires_in_lifo_order() {
    let order = Arc::new(Mutex::new(Vec::<String>::new()));

    struct RecordingHandler(Arc<Mutex<Vec<String>>>);
    #[async_trait]
    impl ServiceHandler for RecordingHandler {
        async fn call(
            &self,
            task_type: &str,
            _properties: &BTreeMap<String, Json>,
            _context: &Json,
            _progress: ProgressSink,
            _cancel: &CancellationToken,
        ) -> Result<Json, EngineError> {
            self.0.lock().unwrap().push(task_type.to_string());
            Ok(Json::Null)
        }
    }

    let mut registry = ServiceHandlerRegistry::new();
    let recorder: Arc<dyn ServiceHandler> = Arc::new(RecordingHandler(order.clone()));
    for topic in ["createVpc", "deleteVpc", "launchVm", "terminateVm"] {
        registry.register(topic, recorder.clone());
    }
    let engine = Engine::new(Arc::new(MemoryEventStore::new()), Arc::new(registry), EngineConfig::default());

    let def = WorkflowDefinition {
        id: "compensation".to_string(),
        name: "compensation".to_string(),
        elements: vec![
            el("start", ElementType::StartEvent),
            el_props("createVpc", ElementType::ServiceTask, &[("topic", json!("createVpc"))]),
            el_attached("boundA", ElementType::BoundaryCompensationEvent, "createVpc", &[]),
            el_props("deleteVpc", ElementType::ServiceTask, &[("topic", json!("deleteVpc"))]),
            el_props("launchVm", ElementType::ServiceTask, &[("topic", json!("launchVm"))]),
            el_attached("boundB", ElementType::BoundaryCompensationEvent, "launchVm", &[]),
            el_props("terminateVm", ElementType::ServiceTask, &[("topic", json!("terminateVm"))]),
            el_props("rollback", ElementType::IntermediateThrowEvent, &[("compensate", json!(true))]),
            el("end", ElementType::EndEvent),
        ],
        connections: vec![
            conn("c1", "start", "createVpc"),
            conn("c2", "createVpc", "launchVm"),
            conn("cBoundA", "boundA", "deleteVpc"),
            conn("cBoundB", "boundB", "terminateVm"),
            conn("c3", "launchVm", "rollback"),
            conn("c4", "rollback", "end"),
        ],
        pools: vec![],
        subprocess_definitions: BTreeMap::new(),
    };

    let id = engine.start_workflow(def, json!({})).await.unwrap();
    let status = wait_for_status(&engine, id).await;
    assert_eq!(status, bpmn_core::InstanceStatus::Success);

    let calls = order.lock().unwrap().clone();
    let pos = |name: &str| calls.iter().position(|c| c == name).unwrap();
    assert!(pos("terminateVm") < pos("deleteVpc"), "compensation must run LIFO: {calls:?}");
}

/// Exercises `CancelWorkflow` and `UserTask` rejection paths directly (not
/// one of the six named scenarios, but part of the same external-interface
/// surface spec §6 defines).
#[tokio::test]
async fn user_task_rejection_fails_the_instance() {
    let handler = ScriptedHandler::new(vec![]);
    let engine = engine_with_handler(handler, &[]);

    let def = WorkflowDefinition {
        id: "approval".to_string(),
        name: "approval".to_string(),
        elements: vec![
            el("start", ElementType::StartEvent),
            el("review", ElementType::UserTask),
            el("end", ElementType::EndEvent),
        ],
        connections: vec![conn("c1", "start", "review"), conn("c2", "review", "end")],
        pools: vec![],
        subprocess_definitions: BTreeMap::new(),
    };

    let id = engine.start_workflow(def, json!({})).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    engine
        .complete_user_task(
            id,
            "review",
            UserTaskDecision {
                decision: "rejected".to_string(),
                comments: Some("not enough detail".to_string()),
                payload: None,
            },
        )
        .await
        .unwrap();

    let status = wait_for_status(&engine, id).await;
    assert_eq!(status, bpmn_core::InstanceStatus::Failure);
}

#[tokio::test]
async fn cancel_workflow_marks_instance_cancelled() {
    let handler = ScriptedHandler::new(vec![]);
    let engine = engine_with_handler(handler, &[]);

    let def = WorkflowDefinition {
        id: "long-wait".to_string(),
        name: "long-wait".to_string(),
        elements: vec![
            el("start", ElementType::StartEvent),
            el_props("wait", ElementType::ReceiveTask, &[("messageRef", json!("neverComes")), ("correlationKey", json!(""))]),
            el("end", ElementType::EndEvent),
        ],
        connections: vec![conn("c1", "start", "wait"), conn("c2", "wait", "end")],
        pools: vec![],
        subprocess_definitions: BTreeMap::new(),
    };

    let id = engine.start_workflow(def, json!({})).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    engine.cancel_workflow(id, "operator requested").await.unwrap();

    let status = wait_for_status(&engine, id).await;
    assert_eq!(status, bpmn_core::InstanceStatus::Cancelled);
}
