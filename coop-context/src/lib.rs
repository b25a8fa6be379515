//! COOP Context - Shared Hierarchical Workspaces
//!
//! Contexts are mutable documents shared between agents. They form a tree
//! via an immutable parent pointer set at creation; updates deep-merge
//! partial data and track participants; deletion removes an entire
//! subtree, children before parent.

use chrono::Utc;
use coop_core::{deep_merge, AgentId, Context, ContextCreateRequest, ContextId, Observers};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::RwLock;

/// Events emitted by the context store.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "eventType", rename_all = "snake_case")]
pub enum ContextEvent {
    ContextCreated {
        context: Context,
    },
    ContextUpdated {
        #[serde(rename = "contextId")]
        context_id: ContextId,
        #[serde(rename = "updatedBy")]
        updated_by: AgentId,
        /// The literal partial-data payload that was merged in.
        update: Value,
    },
    ContextDeleted {
        #[serde(rename = "contextId")]
        context_id: ContextId,
    },
    ParticipantAdded {
        #[serde(rename = "contextId")]
        context_id: ContextId,
        #[serde(rename = "agentId")]
        agent_id: AgentId,
    },
    ParticipantRemoved {
        #[serde(rename = "contextId")]
        context_id: ContextId,
        #[serde(rename = "agentId")]
        agent_id: AgentId,
    },
}

/// Flat table of contexts keyed by id, with explicit parent pointers.
pub struct ContextStore {
    contexts: RwLock<HashMap<ContextId, Context>>,
    observers: Observers<ContextEvent>,
}

impl Default for ContextStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ContextStore {
    pub fn new() -> Self {
        Self {
            contexts: RwLock::new(HashMap::new()),
            observers: Observers::new(),
        }
    }

    pub fn observers(&self) -> &Observers<ContextEvent> {
        &self.observers
    }

    // ========================================================================
    // LIFECYCLE
    // ========================================================================

    /// Create a context. The creator becomes the first participant.
    pub fn create(&self, request: ContextCreateRequest, created_by: AgentId) -> Context {
        let now = Utc::now();
        let context = Context {
            id: ContextId::new(),
            name: request.name,
            description: request.description,
            data: request.initial_data.unwrap_or_else(|| json!({})),
            participants: vec![created_by],
            parent_context_id: request.parent_context_id,
            created_at: now,
            updated_at: now,
        };
        self.contexts
            .write()
            .unwrap()
            .insert(context.id, context.clone());
        tracing::debug!(context_id = %context.id, "context created");
        self.observers.emit(&ContextEvent::ContextCreated {
            context: context.clone(),
        });
        context
    }

    /// `create` with the parent forced to `parent_id`.
    pub fn create_child(
        &self,
        parent_id: ContextId,
        mut request: ContextCreateRequest,
        created_by: AgentId,
    ) -> Option<Context> {
        if !self.contexts.read().unwrap().contains_key(&parent_id) {
            return None;
        }
        request.parent_context_id = Some(parent_id);
        Some(self.create(request, created_by))
    }

    /// Deep-merge `partial_data` into the context's document. The updater
    /// is added to participants if absent. Returns the updated context, or
    /// None if unknown.
    pub fn update(
        &self,
        context_id: ContextId,
        partial_data: Value,
        updated_by: AgentId,
    ) -> Option<Context> {
        let updated = {
            let mut contexts = self.contexts.write().unwrap();
            let context = contexts.get_mut(&context_id)?;
            if !context.participants.contains(&updated_by) {
                context.participants.push(updated_by);
            }
            deep_merge(&mut context.data, partial_data.clone());
            context.updated_at = Utc::now();
            context.clone()
        };
        self.observers.emit(&ContextEvent::ContextUpdated {
            context_id,
            updated_by,
            update: partial_data,
        });
        Some(updated)
    }

    /// Single-key sugar over `update`.
    pub fn set_value(
        &self,
        context_id: ContextId,
        key: &str,
        value: Value,
        updated_by: AgentId,
    ) -> Option<Context> {
        self.update(context_id, json!({ key: value }), updated_by)
    }

    /// Read a single top-level key, falling back to `default` when the
    /// context or key is missing.
    pub fn get_value(&self, context_id: ContextId, key: &str, default: Value) -> Value {
        self.contexts
            .read()
            .unwrap()
            .get(&context_id)
            .and_then(|c| c.data.get(key).cloned())
            .unwrap_or(default)
    }

    /// Delete a context and its entire subtree, children before parent.
    /// Emits `ContextDeleted` for the root only. Returns false if unknown.
    pub fn delete(&self, context_id: ContextId) -> bool {
        let removed = {
            let mut contexts = self.contexts.write().unwrap();
            if !contexts.contains_key(&context_id) {
                return false;
            }

            // Iterative post-order over the subtree: collect via an explicit
            // stack, then remove in reverse discovery order so children go
            // before their parents.
            let mut discovered = Vec::new();
            let mut stack = vec![context_id];
            while let Some(current) = stack.pop() {
                discovered.push(current);
                stack.extend(
                    contexts
                        .values()
                        .filter(|c| c.parent_context_id == Some(current))
                        .map(|c| c.id),
                );
            }
            for id in discovered.iter().rev() {
                contexts.remove(id);
            }
            discovered.len()
        };
        tracing::debug!(context_id = %context_id, subtree = removed, "context deleted");
        self.observers
            .emit(&ContextEvent::ContextDeleted { context_id });
        true
    }

    // ========================================================================
    // PARTICIPANTS
    // ========================================================================

    /// Add a participant. Idempotent; emits and refreshes `updated_at`
    /// only when membership actually changes. Returns false if the
    /// context is unknown.
    pub fn add_participant(&self, context_id: ContextId, agent_id: AgentId) -> bool {
        let changed = {
            let mut contexts = self.contexts.write().unwrap();
            match contexts.get_mut(&context_id) {
                Some(context) => {
                    if context.participants.contains(&agent_id) {
                        false
                    } else {
                        context.participants.push(agent_id);
                        context.updated_at = Utc::now();
                        true
                    }
                }
                None => return false,
            }
        };
        if changed {
            self.observers.emit(&ContextEvent::ParticipantAdded {
                context_id,
                agent_id,
            });
        }
        true
    }

    /// Remove a participant. Idempotent, mirroring `add_participant`.
    pub fn remove_participant(&self, context_id: ContextId, agent_id: AgentId) -> bool {
        let changed = {
            let mut contexts = self.contexts.write().unwrap();
            match contexts.get_mut(&context_id) {
                Some(context) => {
                    let before = context.participants.len();
                    context.participants.retain(|p| *p != agent_id);
                    if context.participants.len() != before {
                        context.updated_at = Utc::now();
                        true
                    } else {
                        false
                    }
                }
                None => return false,
            }
        };
        if changed {
            self.observers.emit(&ContextEvent::ParticipantRemoved {
                context_id,
                agent_id,
            });
        }
        true
    }

    // ========================================================================
    // QUERIES
    // ========================================================================

    pub fn get_context(&self, context_id: ContextId) -> Option<Context> {
        self.contexts.read().unwrap().get(&context_id).cloned()
    }

    pub fn get_all_contexts(&self) -> Vec<Context> {
        let mut contexts: Vec<Context> =
            self.contexts.read().unwrap().values().cloned().collect();
        contexts.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        contexts
    }

    /// Direct children of `parent_id`.
    pub fn get_children(&self, parent_id: ContextId) -> Vec<Context> {
        self.contexts
            .read()
            .unwrap()
            .values()
            .filter(|c| c.parent_context_id == Some(parent_id))
            .cloned()
            .collect()
    }

    /// Contexts the agent participates in.
    pub fn get_contexts_for_agent(&self, agent_id: AgentId) -> Vec<Context> {
        self.contexts
            .read()
            .unwrap()
            .values()
            .filter(|c| c.participants.contains(&agent_id))
            .cloned()
            .collect()
    }

    /// Case-insensitive substring search over name and description.
    pub fn search(&self, query: &str) -> Vec<Context> {
        let needle = query.to_lowercase();
        self.contexts
            .read()
            .unwrap()
            .values()
            .filter(|c| {
                c.name.to_lowercase().contains(&needle)
                    || c.description.to_lowercase().contains(&needle)
            })
            .cloned()
            .collect()
    }

    pub fn count(&self) -> usize {
        self.contexts.read().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn request(name: &str) -> ContextCreateRequest {
        ContextCreateRequest {
            name: name.to_string(),
            description: String::new(),
            initial_data: None,
            parent_context_id: None,
        }
    }

    #[test]
    fn create_seeds_creator_as_first_participant() {
        let store = ContextStore::new();
        let creator = AgentId::new();
        let context = store.create(request("workspace"), creator);
        assert_eq!(context.participants, vec![creator]);
        assert_eq!(context.data, json!({}));
        assert_eq!(context.created_at, context.updated_at);
    }

    #[test]
    fn update_deep_merges_and_tracks_participants() {
        let store = ContextStore::new();
        let u1 = AgentId::new();
        let u2 = AgentId::new();
        let context = store.create(request("workspace"), u1);

        store.update(context.id, json!({"a": {"x": 1}}), u1);
        let updated = store.update(context.id, json!({"a": {"y": 2}}), u2).unwrap();

        assert_eq!(updated.data["a"], json!({"x": 1, "y": 2}));
        assert_eq!(updated.participants, vec![u1, u2]);

        // Updating again must not duplicate participants.
        let again = store.update(context.id, json!({"b": 3}), u2).unwrap();
        assert_eq!(again.participants, vec![u1, u2]);
    }

    #[test]
    fn update_unknown_context_returns_none() {
        let store = ContextStore::new();
        assert!(store
            .update(ContextId::new(), json!({"a": 1}), AgentId::new())
            .is_none());
    }

    #[test]
    fn set_and_get_value_with_default() {
        let store = ContextStore::new();
        let agent = AgentId::new();
        let context = store.create(request("workspace"), agent);

        store.set_value(context.id, "phase", json!("planning"), agent);
        assert_eq!(
            store.get_value(context.id, "phase", json!(null)),
            json!("planning")
        );
        assert_eq!(
            store.get_value(context.id, "missing", json!("fallback")),
            json!("fallback")
        );
        assert_eq!(
            store.get_value(ContextId::new(), "phase", json!("fallback")),
            json!("fallback")
        );
    }

    #[test]
    fn delete_removes_two_levels_of_descendants() {
        let store = ContextStore::new();
        let agent = AgentId::new();
        let root = store.create(request("root"), agent);
        let child = store.create_child(root.id, request("child"), agent).unwrap();
        let grandchild = store
            .create_child(child.id, request("grandchild"), agent)
            .unwrap();
        let unrelated = store.create(request("unrelated"), agent);

        let deleted = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&deleted);
        store.observers().subscribe(move |event| {
            if let ContextEvent::ContextDeleted { context_id } = event {
                sink.lock().unwrap().push(*context_id);
            }
        });

        assert!(store.delete(root.id));
        assert!(store.get_context(root.id).is_none());
        assert!(store.get_context(child.id).is_none());
        assert!(store.get_context(grandchild.id).is_none());
        assert!(store.get_context(unrelated.id).is_some());
        // Deleted event is emitted for the root only.
        assert_eq!(*deleted.lock().unwrap(), vec![root.id]);
    }

    #[test]
    fn delete_unknown_returns_false() {
        let store = ContextStore::new();
        assert!(!store.delete(ContextId::new()));
    }

    #[test]
    fn participant_events_only_on_membership_change() {
        let store = ContextStore::new();
        let creator = AgentId::new();
        let other = AgentId::new();
        let context = store.create(request("workspace"), creator);

        let events = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&events);
        store.observers().subscribe(move |event| {
            if matches!(
                event,
                ContextEvent::ParticipantAdded { .. } | ContextEvent::ParticipantRemoved { .. }
            ) {
                *sink.lock().unwrap() += 1;
            }
        });

        assert!(store.add_participant(context.id, other));
        assert!(store.add_participant(context.id, other));
        assert!(store.remove_participant(context.id, other));
        assert!(store.remove_participant(context.id, other));
        assert!(!store.add_participant(ContextId::new(), other));

        assert_eq!(*events.lock().unwrap(), 2);
    }

    #[test]
    fn create_child_requires_existing_parent() {
        let store = ContextStore::new();
        let agent = AgentId::new();
        assert!(store
            .create_child(ContextId::new(), request("orphan"), agent)
            .is_none());
    }

    #[test]
    fn children_and_agent_queries() {
        let store = ContextStore::new();
        let a = AgentId::new();
        let b = AgentId::new();
        let root = store.create(request("root"), a);
        let child = store.create_child(root.id, request("child"), b).unwrap();

        let children = store.get_children(root.id);
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].id, child.id);

        assert_eq!(store.get_contexts_for_agent(b).len(), 1);
        assert_eq!(store.get_contexts_for_agent(a).len(), 1);
    }

    #[test]
    fn search_matches_name_and_description() {
        let store = ContextStore::new();
        let agent = AgentId::new();
        store.create(request("Planning Session"), agent);
        store.create(
            ContextCreateRequest {
                name: "misc".to_string(),
                description: "notes about PLANNING".to_string(),
                initial_data: None,
                parent_context_id: None,
            },
            agent,
        );

        assert_eq!(store.search("planning").len(), 2);
        assert_eq!(store.search("session").len(), 1);
        assert_eq!(store.search("absent").len(), 0);
    }
}
