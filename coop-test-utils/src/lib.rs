//! COOP Test Utilities
//!
//! Centralized test infrastructure for the COOP workspace:
//! - Fixture builders for common entities
//! - Proptest generators for entity types and payloads
//! - Re-exported in-memory storage

pub use coop_storage::MemoryStorage;

pub use coop_core::{
    Agent, AgentId, AgentRegistration, AgentStatus, CapabilityQuery, Context,
    ContextCreateRequest, ContextId, Message, MessageId, MessagePayload, Task, TaskCreateRequest,
    TaskId, TaskStatus,
};

use serde_json::{json, Value};

// ============================================================================
// FIXTURES
// ============================================================================

/// A registration with just a name.
pub fn registration(name: &str) -> AgentRegistration {
    AgentRegistration {
        name: name.to_string(),
        description: String::new(),
        capabilities: vec![],
        metadata: Default::default(),
    }
}

/// A registration advertising the given capability tags.
pub fn registration_with_caps(name: &str, capabilities: &[&str]) -> AgentRegistration {
    AgentRegistration {
        capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
        ..registration(name)
    }
}

/// A direct message fixture.
pub fn direct_message(from: AgentId, to: AgentId, content: &str) -> Message {
    Message::new(
        from,
        Some(to),
        "direct",
        MessagePayload::Direct {
            content: content.to_string(),
            data: None,
        },
    )
}

/// A pending task fixture.
pub fn task_request(created_by: AgentId, description: &str) -> TaskCreateRequest {
    TaskCreateRequest {
        description: description.to_string(),
        required_capabilities: vec![],
        created_by,
        payload: json!({}),
        parent_task_id: None,
    }
}

/// A context creation fixture with no parent.
pub fn context_request(name: &str, initial_data: Value) -> ContextCreateRequest {
    ContextCreateRequest {
        name: name.to_string(),
        description: String::new(),
        initial_data: Some(initial_data),
        parent_context_id: None,
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    use super::*;
    use proptest::prelude::*;
    use uuid::Uuid;

    pub fn arb_uuid() -> impl Strategy<Value = Uuid> {
        any::<u128>().prop_map(Uuid::from_u128)
    }

    pub fn arb_agent_id() -> impl Strategy<Value = AgentId> {
        arb_uuid().prop_map(AgentId::from_uuid)
    }

    pub fn arb_task_id() -> impl Strategy<Value = TaskId> {
        arb_uuid().prop_map(TaskId::from_uuid)
    }

    pub fn arb_context_id() -> impl Strategy<Value = ContextId> {
        arb_uuid().prop_map(ContextId::from_uuid)
    }

    pub fn arb_agent_name() -> impl Strategy<Value = String> {
        "[a-z][a-z0-9-]{0,15}"
    }

    pub fn arb_capability() -> impl Strategy<Value = String> {
        prop_oneof![
            Just("search".to_string()),
            Just("summarize".to_string()),
            Just("translate".to_string()),
            Just("code".to_string()),
            Just("plan".to_string()),
        ]
    }

    pub fn arb_capabilities() -> impl Strategy<Value = Vec<String>> {
        proptest::collection::vec(arb_capability(), 0..4)
    }

    pub fn arb_registration() -> impl Strategy<Value = AgentRegistration> {
        (arb_agent_name(), arb_capabilities()).prop_map(|(name, capabilities)| AgentRegistration {
            name,
            description: String::new(),
            capabilities,
            metadata: Default::default(),
        })
    }

    pub fn arb_agent_status() -> impl Strategy<Value = AgentStatus> {
        prop_oneof![
            Just(AgentStatus::Idle),
            Just(AgentStatus::Busy),
            Just(AgentStatus::Offline),
            Just(AgentStatus::Error),
        ]
    }

    pub fn arb_task_status() -> impl Strategy<Value = TaskStatus> {
        prop_oneof![
            Just(TaskStatus::Pending),
            Just(TaskStatus::Assigned),
            Just(TaskStatus::InProgress),
            Just(TaskStatus::Completed),
            Just(TaskStatus::Failed),
            Just(TaskStatus::Cancelled),
        ]
    }

    /// Flat JSON objects with scalar values, for merge and metadata
    /// payloads.
    pub fn arb_flat_object() -> impl Strategy<Value = Value> {
        proptest::collection::btree_map(
            "[a-z]{1,8}",
            prop_oneof![
                any::<bool>().prop_map(Value::Bool),
                any::<i32>().prop_map(|n| json!(n)),
                "[a-z]{0,8}".prop_map(Value::String),
            ],
            0..5,
        )
        .prop_map(|map| Value::Object(map.into_iter().collect()))
    }
}
