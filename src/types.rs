use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::collections::BTreeMap;

/// Epoch milliseconds (UTC). Kept as a plain integer the way the teacher's
/// `Timestamp` alias does, rather than a newtype, since it only ever crosses
/// the wire inside `Event` payloads.
pub type Timestamp = i64;

pub fn now_ms() -> Timestamp {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis() as Timestamp
}

/// Canonicalised element type, case-insensitive on load per spec §6.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ElementType {
    StartEvent,
    EndEvent,
    Task,
    ScriptTask,
    ServiceTask,
    SendTask,
    ReceiveTask,
    UserTask,
    AgenticTask,
    ManualTask,
    CallActivity,
    SubProcess,
    EventSubProcess,
    ExclusiveGateway,
    InclusiveGateway,
    ParallelGateway,
    EventBasedGateway,
    IntermediateCatchEvent,
    IntermediateThrowEvent,
    TimerStartEvent,
    TimerIntermediateCatchEvent,
    BoundaryTimerEvent,
    BoundaryErrorEvent,
    BoundaryMessageEvent,
    BoundaryEscalationEvent,
    BoundaryCompensationEvent,
    ErrorStartEvent,
    MessageStartEvent,
    SignalStartEvent,
    EscalationStartEvent,
}

impl ElementType {
    /// True for every `boundaryXxxEvent` variant — these never appear as a
    /// standalone node in a scope's main flow, only attached to an activity.
    pub fn is_boundary(&self) -> bool {
        matches!(
            self,
            ElementType::BoundaryTimerEvent
                | ElementType::BoundaryErrorEvent
                | ElementType::BoundaryMessageEvent
                | ElementType::BoundaryEscalationEvent
                | ElementType::BoundaryCompensationEvent
        )
    }

    pub fn is_gateway(&self) -> bool {
        matches!(
            self,
            ElementType::ExclusiveGateway
                | ElementType::InclusiveGateway
                | ElementType::ParallelGateway
                | ElementType::EventBasedGateway
        )
    }

    pub fn is_event_subprocess_start(&self) -> bool {
        matches!(
            self,
            ElementType::TimerStartEvent
                | ElementType::ErrorStartEvent
                | ElementType::MessageStartEvent
                | ElementType::SignalStartEvent
                | ElementType::EscalationStartEvent
        )
    }
}

/// One node of a `WorkflowDefinition`. Invariant: `attached_to_ref`, when
/// set, must resolve to a non-event element in the same scope — enforced by
/// the (out-of-scope) graph validator that produces this value; the engine
/// trusts it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Element {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ElementType,
    pub name: Option<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, Json>,
    pub attached_to_ref: Option<String>,
    #[serde(default)]
    pub child_elements: Vec<Element>,
    #[serde(default)]
    pub child_connections: Vec<Connection>,
}

impl Element {
    pub fn property_str(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(|v| v.as_str())
    }

    pub fn property_bool(&self, key: &str) -> bool {
        self.properties
            .get(key)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    pub fn property_u64(&self, key: &str) -> Option<u64> {
        self.properties.get(key).and_then(|v| v.as_u64())
    }
}

/// A sequence (or message/compensation) flow between two elements.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Connection {
    pub id: String,
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub properties: BTreeMap<String, Json>,
}

impl Connection {
    pub fn condition(&self) -> Option<&str> {
        self.properties.get("condition").and_then(|v| v.as_str())
    }

    pub fn is_default(&self) -> bool {
        self.properties
            .get("isDefault")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    pub fn is_compensation(&self) -> bool {
        self.properties
            .get("isCompensation")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct Lane {
    pub id: String,
    pub name: Option<String>,
    #[serde(default)]
    pub element_ids: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct Pool {
    pub id: String,
    pub name: Option<String>,
    #[serde(default)]
    pub lanes: Vec<Lane>,
}

/// Immutable workflow graph plus its subprocess library. Parsing/validation
/// that produces this value is out of scope (spec non-goal); the engine
/// only ever reads it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: String,
    pub name: String,
    pub elements: Vec<Element>,
    pub connections: Vec<Connection>,
    #[serde(default)]
    pub pools: Vec<Pool>,
    #[serde(default)]
    pub subprocess_definitions: BTreeMap<String, WorkflowDefinition>,
}

impl WorkflowDefinition {
    pub fn element(&self, id: &str) -> Option<&Element> {
        self.elements.iter().find(|e| e.id == id)
    }

    pub fn outgoing(&self, element_id: &str) -> Vec<&Connection> {
        self.connections
            .iter()
            .filter(|c| c.from == element_id)
            .collect()
    }

    pub fn incoming(&self, element_id: &str) -> Vec<&Connection> {
        self.connections
            .iter()
            .filter(|c| c.to == element_id)
            .collect()
    }

    pub fn boundary_events_for(&self, activity_id: &str) -> Vec<&Element> {
        self.elements
            .iter()
            .filter(|e| e.kind.is_boundary() && e.attached_to_ref.as_deref() == Some(activity_id))
            .collect()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Running,
    Success,
    Failure,
    Cancelled,
}

/// A message waiting to be consumed, or the description of a slot still
/// waiting for one — see `message_bus`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub message_ref: String,
    pub correlation_key: String,
    pub payload: Json,
    pub received_at: Timestamp,
}

/// A registered compensation handler, captured at the moment the protected
/// task completed successfully.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompensationEntry {
    pub element_id: String,
    pub handler_ref: String,
    pub context_snapshot: Json,
}
