//! Operation dispatch for the duplex protocol.
//!
//! Every inbound request envelope lands here after authentication and
//! rate limiting. Dispatch is a pure async function over shared state
//! plus per-connection state, so the full catalog is testable without a
//! socket. Mutations require the write permission, queries read.

use crate::error::{ErrorCode, ServerError, ServerResult};
use crate::AppState;
use coop_bus::SubscriptionId;
use coop_core::{
    AgentId, AgentRegistration, AgentStatus, CapabilityQuery, ContextCreateRequest, ContextId,
    Permission, RequestEnvelope, ServerFrame, TaskCreateRequest, TaskId, TaskStatus,
};
use coop_core::AuthContext;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::debug;

/// Per-connection state threaded through dispatch.
pub struct ConnState {
    /// Synthetic rate-limit identity for this connection.
    pub connection_id: String,
    /// Agent registered over this connection, if any.
    pub registered: Option<AgentId>,
    /// Live bus subscription from `message.subscribe`.
    pub subscription: Option<SubscriptionId>,
    /// Per-connection event pushes (message deliveries).
    pub events: mpsc::UnboundedSender<ServerFrame>,
}

impl ConnState {
    pub fn new(connection_id: String, events: mpsc::UnboundedSender<ServerFrame>) -> Self {
        Self {
            connection_id,
            registered: None,
            subscription: None,
            events,
        }
    }
}

// ============================================================================
// REQUEST PARAMETERS
// ============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AgentIdParams {
    agent_id: AgentId,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct AgentListParams {
    status: Option<AgentStatus>,
    capabilities: Vec<String>,
    match_all: bool,
    name: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskCreateParams {
    description: String,
    #[serde(default)]
    required_capabilities: Vec<String>,
    #[serde(default)]
    created_by: Option<AgentId>,
    #[serde(default)]
    payload: Value,
    #[serde(default)]
    parent_task_id: Option<TaskId>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskAssignParams {
    task_id: TaskId,
    agent_id: AgentId,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskIdParams {
    task_id: TaskId,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskCompleteParams {
    task_id: TaskId,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    failed: bool,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct TaskListParams {
    status: Option<TaskStatus>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContextCreateParams {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    initial_data: Option<Value>,
    #[serde(default)]
    parent_context_id: Option<ContextId>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContextIdParams {
    context_id: ContextId,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContextUpdateParams {
    context_id: ContextId,
    data: Value,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct ContextListParams {
    agent_id: Option<AgentId>,
    query: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageSendParams {
    to: AgentId,
    content: String,
    #[serde(default)]
    data: Option<Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageBroadcastParams {
    event: String,
    #[serde(default)]
    data: Option<Value>,
}

// ============================================================================
// DISPATCH
// ============================================================================

/// Handle one request envelope, always producing a correlated frame.
pub async fn dispatch(
    state: &AppState,
    conn: &mut ConnState,
    auth: &AuthContext,
    envelope: RequestEnvelope,
) -> ServerFrame {
    let request_id = envelope.id.clone();
    match handle(state, conn, auth, envelope).await {
        Ok(payload) => ServerFrame::result(request_id, payload),
        Err(err) => ServerFrame::error(request_id, err.code.as_str(), err.message),
    }
}

fn params<T: serde::de::DeserializeOwned>(payload: Value) -> ServerResult<T> {
    // An omitted payload decodes as null; treat it as an empty object so
    // parameter structs with defaults still apply.
    let payload = match payload {
        Value::Null => Value::Object(Default::default()),
        other => other,
    };
    serde_json::from_value(payload)
        .map_err(|e| ServerError::invalid_request(format!("invalid payload: {e}")))
}

fn require(
    state: &AppState,
    auth: &AuthContext,
    permission: Permission,
) -> ServerResult<()> {
    state.auth.check_permission(auth, permission)?;
    Ok(())
}

/// The agent this connection acts as. Registration binds it.
fn acting_agent(conn: &ConnState) -> ServerResult<AgentId> {
    conn.registered.ok_or_else(|| {
        ServerError::invalid_request("no agent registered on this connection")
    })
}

async fn handle(
    state: &AppState,
    conn: &mut ConnState,
    auth: &AuthContext,
    envelope: RequestEnvelope,
) -> ServerResult<Value> {
    let RequestEnvelope { op, payload, .. } = envelope;
    match op.as_str() {
        // ------------------------------------------------------------ agents
        "agent.register" => {
            require(state, auth, Permission::Write)?;
            let registration: AgentRegistration = params(payload)?;
            let agent = state.registry.register(registration);
            state.storage.save_agent(&agent).await?;
            conn.registered = Some(agent.id);
            Ok(json!({ "agent": agent }))
        }
        "agent.unregister" => {
            require(state, auth, Permission::Write)?;
            let p: AgentIdParams = params(payload)?;
            let removed = state.registry.unregister(p.agent_id);
            if removed {
                state.storage.delete_agent(p.agent_id).await?;
                if conn.registered == Some(p.agent_id) {
                    conn.registered = None;
                }
            }
            Ok(json!({ "success": removed }))
        }
        "agent.list" => {
            require(state, auth, Permission::Read)?;
            let p: AgentListParams = params(payload)?;
            let agents = if !p.capabilities.is_empty() {
                state.registry.find_by_capabilities(&CapabilityQuery {
                    capabilities: p.capabilities,
                    match_all: p.match_all,
                })
            } else if let Some(name) = p.name {
                state.registry.find_by_name(&name)
            } else if let Some(status) = p.status {
                state.registry.get_agents_by_status(status)
            } else {
                state.registry.get_all_agents()
            };
            Ok(json!({ "agents": agents }))
        }
        "agent.get" => {
            require(state, auth, Permission::Read)?;
            let p: AgentIdParams = params(payload)?;
            let agent = state
                .registry
                .get_agent(p.agent_id)
                .ok_or_else(|| ServerError::not_found(format!("agent {} not found", p.agent_id)))?;
            Ok(json!({ "agent": agent }))
        }

        // ------------------------------------------------------------- tasks
        "task.create" => {
            require(state, auth, Permission::Write)?;
            let p: TaskCreateParams = params(payload)?;
            let created_by = match p.created_by {
                Some(id) => id,
                None => acting_agent(conn)?,
            };
            let task = state
                .tasks
                .create_task(TaskCreateRequest {
                    description: p.description,
                    required_capabilities: p.required_capabilities,
                    created_by,
                    payload: p.payload,
                    parent_task_id: p.parent_task_id,
                })
                .await?;
            Ok(json!({ "task": task }))
        }
        "task.assign" => {
            require(state, auth, Permission::Write)?;
            let p: TaskAssignParams = params(payload)?;
            let assigned = state.tasks.assign_task(p.task_id, p.agent_id).await?;
            Ok(json!({ "success": assigned }))
        }
        "task.start" => {
            require(state, auth, Permission::Write)?;
            let p: TaskIdParams = params(payload)?;
            let started = state.tasks.start_task(p.task_id).await?;
            Ok(json!({ "success": started }))
        }
        "task.complete" => {
            require(state, auth, Permission::Write)?;
            let p: TaskCompleteParams = params(payload)?;
            let completed = state
                .tasks
                .complete_task(p.task_id, p.result, p.failed)
                .await?;
            Ok(json!({ "success": completed }))
        }
        "task.cancel" => {
            require(state, auth, Permission::Write)?;
            let p: TaskIdParams = params(payload)?;
            let cancelled = state.tasks.cancel_task(p.task_id).await?;
            Ok(json!({ "success": cancelled }))
        }
        "task.get" => {
            require(state, auth, Permission::Read)?;
            let p: TaskIdParams = params(payload)?;
            let task = state
                .tasks
                .get_task(p.task_id)
                .await?
                .ok_or_else(|| ServerError::not_found(format!("task {} not found", p.task_id)))?;
            Ok(json!({ "task": task }))
        }
        "task.list" => {
            require(state, auth, Permission::Read)?;
            let p: TaskListParams = params(payload)?;
            let tasks = state.tasks.list_tasks(p.status).await?;
            Ok(json!({ "tasks": tasks }))
        }

        // ---------------------------------------------------------- contexts
        "context.create" => {
            require(state, auth, Permission::Write)?;
            let p: ContextCreateParams = params(payload)?;
            let created_by = acting_agent(conn)?;
            let request = ContextCreateRequest {
                name: p.name,
                description: p.description,
                initial_data: p.initial_data,
                parent_context_id: None,
            };
            let context = match p.parent_context_id {
                Some(parent_id) => state
                    .contexts
                    .create_child(parent_id, request, created_by)
                    .ok_or_else(|| {
                        ServerError::not_found(format!("context {parent_id} not found"))
                    })?,
                None => state.contexts.create(request, created_by),
            };
            state.storage.save_context(&context).await?;
            Ok(json!({ "context": context }))
        }
        "context.get" => {
            require(state, auth, Permission::Read)?;
            let p: ContextIdParams = params(payload)?;
            let context = state.contexts.get_context(p.context_id).ok_or_else(|| {
                ServerError::not_found(format!("context {} not found", p.context_id))
            })?;
            Ok(json!({ "context": context }))
        }
        "context.update" => {
            require(state, auth, Permission::Write)?;
            let p: ContextUpdateParams = params(payload)?;
            let updated_by = acting_agent(conn)?;
            let context = state
                .contexts
                .update(p.context_id, p.data, updated_by)
                .ok_or_else(|| {
                    ServerError::not_found(format!("context {} not found", p.context_id))
                })?;
            state.storage.save_context(&context).await?;
            Ok(json!({ "context": context }))
        }
        "context.list" => {
            require(state, auth, Permission::Read)?;
            let p: ContextListParams = params(payload)?;
            let contexts = if let Some(query) = p.query {
                state.contexts.search(&query)
            } else if let Some(agent_id) = p.agent_id {
                state.contexts.get_contexts_for_agent(agent_id)
            } else {
                state.contexts.get_all_contexts()
            };
            Ok(json!({ "contexts": contexts }))
        }

        // ---------------------------------------------------------- messages
        "message.send" => {
            require(state, auth, Permission::Write)?;
            let p: MessageSendParams = params(payload)?;
            let from = acting_agent(conn)?;
            let message = state.bus.send_direct(from, p.to, p.content, p.data);
            state.storage.save_message(&message).await?;
            Ok(json!({ "message": message }))
        }
        "message.broadcast" => {
            require(state, auth, Permission::Write)?;
            let p: MessageBroadcastParams = params(payload)?;
            let from = acting_agent(conn)?;
            let message = state.bus.broadcast(from, p.event, p.data);
            state.storage.save_message(&message).await?;
            Ok(json!({ "message": message }))
        }
        "message.subscribe" => {
            require(state, auth, Permission::Read)?;
            let agent_id = acting_agent(conn)?;
            if let Some(previous) = conn.subscription.take() {
                state.bus.unsubscribe(previous);
            }
            let events = conn.events.clone();
            let subscription = state.bus.subscribe_agent(agent_id, move |message| {
                let frame =
                    ServerFrame::event("message.received", json!({ "message": message }));
                // Receiver dropped means the connection is closing.
                let _ = events.send(frame);
            });
            conn.subscription = Some(subscription);
            Ok(json!({ "subscribed": true }))
        }

        // ------------------------------------------------------------ status
        "status.get" => {
            require(state, auth, Permission::Read)?;
            let tasks = state.tasks.list_tasks(None).await?;
            Ok(json!({
                "agents": state.registry.count(),
                "tasks": tasks.len(),
                "contexts": state.contexts.count(),
                "messages": state.bus.history_len(),
                "uptimeSecs": state.started_at.elapsed().as_secs(),
            }))
        }

        other => {
            debug!(op = other, "unknown operation");
            Err(ServerError::new(
                ErrorCode::UnknownOperation,
                format!("unknown operation: {other}"),
            ))
        }
    }
}

/// Tear down per-connection state when the socket closes: drop the bus
/// subscription, mark the registered agent offline, release the rate
/// budget.
pub async fn disconnect(state: &AppState, conn: &mut ConnState) {
    if let Some(subscription) = conn.subscription.take() {
        state.bus.unsubscribe(subscription);
    }
    if let Some(agent_id) = conn.registered.take() {
        if state.registry.update_status(agent_id, AgentStatus::Offline) {
            if let Some(agent) = state.registry.get_agent(agent_id) {
                if let Err(err) = state.storage.save_agent(&agent).await {
                    tracing::warn!(%agent_id, error = %err, "failed to persist offline status");
                }
            }
        }
    }
    state.limiter.release(&conn.connection_id);
}
