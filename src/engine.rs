//! The inbound control surface from spec §6 (`StartWorkflow`,
//! `CompleteUserTask`, `PublishMessage`, `CancelWorkflow`, `Subscribe`,
//! `Replay`), the crate's equivalent of the teacher's `BpmnLiteEngine` —
//! the seam a transport crate (HTTP/WebSocket, out of scope here) attaches
//! handlers to. Internal modules return `EngineError`; this facade folds
//! them into `anyhow::Result` at the boundary, matching the teacher's
//! convention.

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::event::{Event, EventStream};
use crate::event_store::EventStore;
use crate::executors::ServiceHandlerRegistry;
use crate::scheduler::{self, InstanceHandles, SharedContext, UserTaskDecision};
use crate::types::{ElementType, InstanceStatus, WorkflowDefinition};
use anyhow::{anyhow, Context as _};
use serde_json::Value as Json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

struct InstanceRecord {
    handles: Arc<InstanceHandles>,
    cancel: CancellationToken,
    status: Mutex<InstanceStatus>,
    context: Mutex<Option<Json>>,
}

/// Facade over one running engine: owns every live instance's shared state
/// and the event stream each instance publishes through. A single `Engine`
/// is meant to be held behind an `Arc` and shared across whatever transport
/// layer is wired on top.
pub struct Engine {
    events: Arc<EventStream>,
    handlers: Arc<ServiceHandlerRegistry>,
    config: Arc<EngineConfig>,
    instances: RwLock<HashMap<Uuid, Arc<InstanceRecord>>>,
}

impl Engine {
    pub fn new(store: Arc<dyn EventStore>, handlers: Arc<ServiceHandlerRegistry>, config: EngineConfig) -> Self {
        Self {
            events: Arc::new(EventStream::new(store)),
            handlers,
            config: Arc::new(config),
            instances: RwLock::new(HashMap::new()),
        }
    }

    /// Starts a new instance of `definition` with `initial_context`, running
    /// it in the background. Definition errors (no start event) surface
    /// synchronously; everything after that runs asynchronously and is
    /// observed through `subscribe`/`replay`.
    pub async fn start_workflow(&self, definition: WorkflowDefinition, initial_context: Json) -> anyhow::Result<Uuid> {
        let start = definition
            .elements
            .iter()
            .find(|e| matches!(e.kind, ElementType::StartEvent))
            .ok_or_else(|| anyhow!("definition '{}' has no start event", definition.id))?;
        let first = definition
            .outgoing(&start.id)
            .first()
            .map(|c| c.to.clone())
            .unwrap_or_else(|| start.id.clone());

        let instance_id = Uuid::now_v7();
        let handles = Arc::new(InstanceHandles::new(self.events.clone(), self.handlers.clone(), self.config.clone()));
        let cancel = CancellationToken::new();
        let record = Arc::new(InstanceRecord {
            handles: handles.clone(),
            cancel: cancel.clone(),
            status: Mutex::new(InstanceStatus::Running),
            context: Mutex::new(None),
        });
        self.instances.write().await.insert(instance_id, record.clone());

        self.events
            .emit(Event::new("workflow.started", instance_id, None, serde_json::json!({"definitionId": definition.id})))
            .await
            .context("persisting workflow.started")?;

        let def = Arc::new(definition);
        let ctx = SharedContext::new(initial_context);
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = scheduler::run_process_scope(def, "root".to_string(), instance_id, first, ctx, cancel, handles).await;
            let (status, kind, payload, final_context) = match &result {
                Ok(snapshot) => (
                    InstanceStatus::Success,
                    "workflow.completed",
                    serde_json::json!({"status": "success"}),
                    Some(snapshot.clone()),
                ),
                Err(EngineError::Cancelled) => (
                    InstanceStatus::Cancelled,
                    "workflow.completed",
                    serde_json::json!({"status": "cancelled"}),
                    None,
                ),
                Err(err) => (
                    InstanceStatus::Failure,
                    "workflow.completed",
                    serde_json::json!({"status": "failure", "errorCode": err.error_code(), "message": err.to_string()}),
                    None,
                ),
            };
            *record.status.lock().await = status;
            *record.context.lock().await = final_context;
            let _ = events.emit(Event::new(kind, instance_id, None, payload)).await;
        });

        Ok(instance_id)
    }

    /// Delivers a decision to a parked `UserTask` (spec §6).
    pub async fn complete_user_task(
        &self,
        instance_id: Uuid,
        element_id: &str,
        decision: UserTaskDecision,
    ) -> anyhow::Result<()> {
        let record = self.instance(instance_id).await?;
        let sender = record
            .handles
            .user_tasks
            .lock()
            .await
            .remove(element_id)
            .ok_or_else(|| anyhow!("no pending user task '{element_id}' on instance {instance_id}"))?;
        sender
            .send(decision)
            .map_err(|_| anyhow!("user task '{element_id}' is no longer awaiting a decision"))
    }

    /// Publishes a message for correlation-keyed delivery (spec §6's
    /// `POST /webhooks/{messageRef}/{correlationKey}` contract, exercised
    /// here directly rather than through an HTTP layer).
    pub async fn publish_message(&self, instance_id: Uuid, message_ref: &str, correlation_key: &str, payload: Json) -> anyhow::Result<()> {
        let record = self.instance(instance_id).await?;
        record.handles.bus.publish(message_ref, correlation_key, payload).await;
        Ok(())
    }

    /// Cancels a running instance. Idempotent: cancelling twice is a no-op.
    pub async fn cancel_workflow(&self, instance_id: Uuid, reason: &str) -> anyhow::Result<()> {
        let record = self.instance(instance_id).await?;
        record.cancel.cancel();
        self.events
            .emit(Event::new("workflow.cancel_requested", instance_id, None, serde_json::json!({"reason": reason})))
            .await?;
        Ok(())
    }

    pub fn subscribe(&self, _instance_id: Uuid) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    pub async fn replay(&self, instance_id: Uuid, element_id: Option<&str>) -> anyhow::Result<Vec<Event>> {
        self.events.replay(instance_id, element_id).await
    }

    pub async fn instance_status(&self, instance_id: Uuid) -> anyhow::Result<InstanceStatus> {
        let record = self.instance(instance_id).await?;
        Ok(*record.status.lock().await)
    }

    /// The instance's context as of its last settled scope. `None` while
    /// still running or if it ended in failure/cancellation.
    pub async fn instance_context(&self, instance_id: Uuid) -> anyhow::Result<Option<Json>> {
        let record = self.instance(instance_id).await?;
        Ok(record.context.lock().await.clone())
    }

    async fn instance(&self, instance_id: Uuid) -> anyhow::Result<Arc<InstanceRecord>> {
        self.instances
            .read()
            .await
            .get(&instance_id)
            .cloned()
            .ok_or_else(|| anyhow!("no such instance: {instance_id}"))
    }
}

