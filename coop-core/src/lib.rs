//! COOP Core - Entity Types and Shared Primitives
//!
//! Defines the data model shared by every crate in the workspace:
//! agents, messages, contexts, tasks, auth contexts, the wire envelope
//! protocol, deep-merge over dynamic documents, and the observer
//! registry used for component event emission.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use uuid::Uuid;

// ============================================================================
// TYPE ALIASES
// ============================================================================

/// Canonical timestamp type. Serialized as RFC 3339 on the wire.
pub type Timestamp = DateTime<Utc>;

/// Open key/value map used for metadata fields.
pub type JsonMap = serde_json::Map<String, Value>;

// ============================================================================
// ENTITY IDS
// ============================================================================

macro_rules! entity_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Generate a fresh id (UUIDv7, time-ordered).
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }
    };
}

entity_id!(
    /// Unique identifier for a registered agent.
    AgentId
);
entity_id!(
    /// Unique identifier for a bus message.
    MessageId
);
entity_id!(
    /// Unique identifier for a shared context.
    ContextId
);
entity_id!(
    /// Unique identifier for a task.
    TaskId
);

// ============================================================================
// AGENTS
// ============================================================================

/// Coarse agent availability status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Idle,
    Busy,
    Offline,
    Error,
}

/// A registered participant in the coordination backbone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    pub id: AgentId,
    pub name: String,
    pub description: String,
    /// Opaque capability tags used for discovery matching.
    pub capabilities: Vec<String>,
    pub status: AgentStatus,
    #[serde(default)]
    pub metadata: JsonMap,
    pub registered_at: Timestamp,
    pub last_seen_at: Timestamp,
}

impl Agent {
    /// Construct a new agent from a registration request.
    /// Status starts at `Idle`; both timestamps are stamped to now.
    pub fn from_registration(registration: AgentRegistration) -> Self {
        let now = Utc::now();
        Self {
            id: AgentId::new(),
            name: registration.name,
            description: registration.description,
            capabilities: registration.capabilities,
            status: AgentStatus::Idle,
            metadata: registration.metadata,
            registered_at: now,
            last_seen_at: now,
        }
    }

    /// Whether this agent advertises the given capability tag.
    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }
}

/// Payload submitted by an agent when registering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRegistration {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub metadata: JsonMap,
}

/// Capability-based discovery query.
///
/// `match_all = true` requires the agent's capability set to be a superset
/// of the queried set; otherwise a non-empty intersection suffices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityQuery {
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub match_all: bool,
}

// ============================================================================
// MESSAGES
// ============================================================================

/// Message body, discriminated by shape on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessagePayload {
    TaskRequest {
        #[serde(rename = "taskId")]
        task_id: TaskId,
        description: String,
    },
    TaskResponse {
        #[serde(rename = "taskId")]
        task_id: TaskId,
        status: TaskStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
    },
    Broadcast {
        event: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },
    Direct {
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },
}

/// An immutable message routed through the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    /// Logical event name: "direct", "broadcast", or caller-supplied.
    #[serde(rename = "type")]
    pub message_type: String,
    pub from: AgentId,
    /// Absent implies broadcast scope.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<AgentId>,
    pub payload: MessagePayload,
    pub timestamp: Timestamp,
}

impl Message {
    pub fn new(
        from: AgentId,
        to: Option<AgentId>,
        message_type: impl Into<String>,
        payload: MessagePayload,
    ) -> Self {
        Self {
            id: MessageId::new(),
            message_type: message_type.into(),
            from,
            to,
            payload,
            timestamp: Utc::now(),
        }
    }

    /// Whether the given agent sent, received, or is in broadcast scope of
    /// this message.
    pub fn involves(&self, agent_id: AgentId) -> bool {
        self.from == agent_id || self.to == Some(agent_id) || self.to.is_none()
    }
}

// ============================================================================
// CONTEXTS
// ============================================================================

/// A shared, hierarchical, mutable workspace document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Context {
    pub id: ContextId,
    pub name: String,
    pub description: String,
    pub data: Value,
    /// Ordered set of participant agent ids; insertion order is meaningful.
    pub participants: Vec<AgentId>,
    /// Set once at creation. The parent/child relation forms a tree.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_context_id: Option<ContextId>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// Payload for creating a context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextCreateRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub initial_data: Option<Value>,
    #[serde(default)]
    pub parent_context_id: Option<ContextId>,
}

// ============================================================================
// TASKS
// ============================================================================

/// Task lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Assigned,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Terminal statuses admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// A unit of delegated work tracked through the backbone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,
    pub description: String,
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<AgentId>,
    pub created_by: AgentId,
    #[serde(default)]
    pub payload: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_task_id: Option<TaskId>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<Timestamp>,
}

/// Payload for creating a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskCreateRequest {
    pub description: String,
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    pub created_by: AgentId,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub parent_task_id: Option<TaskId>,
}

impl Task {
    pub fn from_request(request: TaskCreateRequest) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new(),
            description: request.description,
            required_capabilities: request.required_capabilities,
            status: TaskStatus::Pending,
            assigned_to: None,
            created_by: request.created_by,
            payload: request.payload,
            result: None,
            parent_task_id: request.parent_task_id,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }
}

// ============================================================================
// AUTH
// ============================================================================

/// The three coarse permission bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    Read,
    Write,
    Admin,
}

/// Permission set attached to an authenticated identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Permissions {
    pub read: bool,
    pub write: bool,
    pub admin: bool,
}

impl Permissions {
    /// All three bits set.
    pub fn all() -> Self {
        Self {
            read: true,
            write: true,
            admin: true,
        }
    }

    /// Read-write without admin.
    pub fn read_write() -> Self {
        Self {
            read: true,
            write: true,
            admin: false,
        }
    }

    /// Whether the named bit is set. Checks the named bit only.
    pub fn has(&self, permission: Permission) -> bool {
        match permission {
            Permission::Read => self.read,
            Permission::Write => self.write,
            Permission::Admin => self.admin,
        }
    }
}

/// Ephemeral per-request identity produced by authentication.
/// Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthContext {
    pub agent_id: String,
    pub permissions: Permissions,
    #[serde(default)]
    pub metadata: JsonMap,
    pub authenticated_at: Timestamp,
}

impl AuthContext {
    pub fn new(agent_id: impl Into<String>, permissions: Permissions) -> Self {
        Self {
            agent_id: agent_id.into(),
            permissions,
            metadata: JsonMap::new(),
            authenticated_at: Utc::now(),
        }
    }
}

// ============================================================================
// WIRE PROTOCOL
// ============================================================================

/// Request envelope sent by a client over the duplex connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// Caller-generated correlation id.
    pub id: String,
    /// Operation name, e.g. "agent.register".
    #[serde(rename = "type")]
    pub op: String,
    #[serde(default)]
    pub payload: Value,
}

/// Error payload carried in an error response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub error: String,
    pub code: String,
}

/// Frame written by the server: a correlated result or error, or an
/// unsolicited event push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerFrame {
    Result {
        #[serde(rename = "requestId")]
        request_id: String,
        payload: Value,
    },
    Error {
        #[serde(rename = "requestId")]
        request_id: String,
        payload: ErrorPayload,
    },
    Event {
        /// Object payload carrying `eventType` plus event data.
        payload: Value,
    },
}

impl ServerFrame {
    pub fn result(request_id: impl Into<String>, payload: Value) -> Self {
        Self::Result {
            request_id: request_id.into(),
            payload,
        }
    }

    pub fn error(
        request_id: impl Into<String>,
        code: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self::Error {
            request_id: request_id.into(),
            payload: ErrorPayload {
                error: error.into(),
                code: code.into(),
            },
        }
    }

    /// Build an event push frame with `eventType` merged into the data.
    pub fn event(event_type: &str, data: Value) -> Self {
        let mut payload = match data {
            Value::Object(map) => map,
            Value::Null => JsonMap::new(),
            other => {
                let mut map = JsonMap::new();
                map.insert("data".to_string(), other);
                map
            }
        };
        payload.insert(
            "eventType".to_string(),
            Value::String(event_type.to_string()),
        );
        Self::Event {
            payload: Value::Object(payload),
        }
    }
}

// ============================================================================
// DEEP MERGE
// ============================================================================

/// Recursively merge `patch` into `base`.
///
/// For each key where both sides hold a non-array object the values merge
/// recursively; every other pairing (scalars, arrays, nulls) is replaced
/// wholesale by the incoming value.
pub fn deep_merge(base: &mut Value, patch: Value) {
    match (base, patch) {
        (Value::Object(base_map), Value::Object(patch_map)) => {
            for (key, incoming) in patch_map {
                match base_map.get_mut(&key) {
                    Some(existing) if existing.is_object() && incoming.is_object() => {
                        deep_merge(existing, incoming);
                    }
                    _ => {
                        base_map.insert(key, incoming);
                    }
                }
            }
        }
        (base, patch) => *base = patch,
    }
}

// ============================================================================
// OBSERVER REGISTRY
// ============================================================================

/// Handle identifying a registered observer, removable without object
/// identity comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

type ObserverFn<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Ordered registry of event observers.
///
/// Emission is synchronous with respect to the triggering call; each
/// observer is isolated so one failing handler never prevents delivery
/// to the rest.
pub struct Observers<E> {
    handlers: RwLock<Vec<(ObserverId, ObserverFn<E>)>>,
    next_id: AtomicU64,
}

impl<E> Default for Observers<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Observers<E> {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register an observer; returns a handle usable to remove it.
    pub fn subscribe<F>(&self, handler: F) -> ObserverId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers.write().unwrap().push((id, Arc::new(handler)));
        id
    }

    /// Remove an observer by handle. Returns false if unknown.
    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        let mut handlers = self.handlers.write().unwrap();
        let before = handlers.len();
        handlers.retain(|(handler_id, _)| *handler_id != id);
        handlers.len() != before
    }

    /// Notify every registered observer in registration order.
    pub fn emit(&self, event: &E) {
        let handlers: Vec<ObserverFn<E>> = self
            .handlers
            .read()
            .unwrap()
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();
        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                tracing::warn!("event observer panicked during dispatch; continuing");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.handlers.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn agent_id_roundtrips_through_string() {
        let id = AgentId::new();
        let parsed: AgentId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn agent_serializes_camel_case() {
        let agent = Agent::from_registration(AgentRegistration {
            name: "worker".to_string(),
            description: "test worker".to_string(),
            capabilities: vec!["search".to_string()],
            metadata: JsonMap::new(),
        });
        let value = serde_json::to_value(&agent).unwrap();
        assert!(value.get("registeredAt").is_some());
        assert!(value.get("lastSeenAt").is_some());
        assert_eq!(value["status"], json!("idle"));
    }

    #[test]
    fn message_involves_covers_broadcast_scope() {
        let a = AgentId::new();
        let b = AgentId::new();
        let c = AgentId::new();
        let broadcast = Message::new(
            a,
            None,
            "broadcast",
            MessagePayload::Broadcast {
                event: "hello".to_string(),
                data: None,
            },
        );
        assert!(broadcast.involves(c));

        let direct = Message::new(
            a,
            Some(b),
            "direct",
            MessagePayload::Direct {
                content: "hi".to_string(),
                data: None,
            },
        );
        assert!(direct.involves(a));
        assert!(direct.involves(b));
        assert!(!direct.involves(c));
    }

    #[test]
    fn message_payload_discriminates_by_shape() {
        let direct: MessagePayload =
            serde_json::from_value(json!({"content": "hi"})).unwrap();
        assert!(matches!(direct, MessagePayload::Direct { .. }));

        let broadcast: MessagePayload =
            serde_json::from_value(json!({"event": "sync", "data": {"x": 1}})).unwrap();
        assert!(matches!(broadcast, MessagePayload::Broadcast { .. }));
    }

    #[test]
    fn task_status_terminality() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::InProgress.is_terminal());
    }

    #[test]
    fn permissions_check_named_bit_only() {
        let perms = Permissions {
            read: false,
            write: false,
            admin: true,
        };
        assert!(perms.has(Permission::Admin));
        // The check is against the named bit, not any implication.
        assert!(!perms.has(Permission::Read));
    }

    #[test]
    fn request_envelope_wire_shape() {
        let envelope: RequestEnvelope = serde_json::from_value(json!({
            "id": "req-1",
            "type": "agent.list",
            "payload": {}
        }))
        .unwrap();
        assert_eq!(envelope.op, "agent.list");
    }

    #[test]
    fn server_frame_result_wire_shape() {
        let frame = ServerFrame::result("req-1", json!({"ok": true}));
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], json!("result"));
        assert_eq!(value["requestId"], json!("req-1"));
    }

    #[test]
    fn server_frame_event_merges_event_type() {
        let frame = ServerFrame::event("agent_registered", json!({"agentId": "a-1"}));
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], json!("event"));
        assert_eq!(value["payload"]["eventType"], json!("agent_registered"));
        assert_eq!(value["payload"]["agentId"], json!("a-1"));
    }

    #[test]
    fn deep_merge_preserves_untouched_siblings() {
        let mut base = json!({"a": {"x": 1}});
        deep_merge(&mut base, json!({"a": {"y": 2}}));
        assert_eq!(base, json!({"a": {"x": 1, "y": 2}}));
    }

    #[test]
    fn deep_merge_replaces_arrays_wholesale() {
        let mut base = json!({"tags": ["a", "b"], "nested": {"list": [1, 2]}});
        deep_merge(&mut base, json!({"tags": ["c"], "nested": {"list": [3]}}));
        assert_eq!(base, json!({"tags": ["c"], "nested": {"list": [3]}}));
    }

    #[test]
    fn deep_merge_replaces_scalar_with_object() {
        let mut base = json!({"value": 1});
        deep_merge(&mut base, json!({"value": {"nested": true}}));
        assert_eq!(base, json!({"value": {"nested": true}}));
    }

    #[test]
    fn observers_dispatch_in_order_and_remove_by_handle() {
        use std::sync::Mutex;

        let observers: Observers<u32> = Observers::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let seen_a = Arc::clone(&seen);
        let id_a = observers.subscribe(move |event| seen_a.lock().unwrap().push(("a", *event)));
        let seen_b = Arc::clone(&seen);
        observers.subscribe(move |event| seen_b.lock().unwrap().push(("b", *event)));

        observers.emit(&1);
        assert!(observers.unsubscribe(id_a));
        assert!(!observers.unsubscribe(id_a));
        observers.emit(&2);

        let seen = seen.lock().unwrap();
        assert_eq!(*seen, vec![("a", 1), ("b", 1), ("b", 2)]);
    }

    #[test]
    fn observer_panic_does_not_block_remaining_handlers() {
        use std::sync::Mutex;

        let observers: Observers<u32> = Observers::new();
        observers.subscribe(|_| panic!("bad handler"));
        let seen = Arc::new(Mutex::new(0u32));
        let seen_clone = Arc::clone(&seen);
        observers.subscribe(move |event| *seen_clone.lock().unwrap() = *event);

        observers.emit(&7);
        assert_eq!(*seen.lock().unwrap(), 7);
    }
}
