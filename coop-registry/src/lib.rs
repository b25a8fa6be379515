//! COOP Registry - Agent Directory
//!
//! Central directory of known agents: registration, discovery by
//! capability or name, and status/metadata updates. Lifecycle changes are
//! emitted through an observer registry so the transport layer can push
//! them to connected clients.

use chrono::Utc;
use coop_core::{
    Agent, AgentId, AgentRegistration, AgentStatus, CapabilityQuery, JsonMap, Observers,
};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;

/// Lifecycle events emitted by the registry.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "eventType", rename_all = "snake_case")]
pub enum RegistryEvent {
    AgentRegistered {
        agent: Agent,
    },
    AgentUnregistered {
        #[serde(rename = "agentId")]
        agent_id: AgentId,
    },
    AgentStatusChanged {
        #[serde(rename = "agentId")]
        agent_id: AgentId,
        #[serde(rename = "oldStatus")]
        old_status: AgentStatus,
        #[serde(rename = "newStatus")]
        new_status: AgentStatus,
    },
    AgentMetadataUpdated {
        #[serde(rename = "agentId")]
        agent_id: AgentId,
    },
}

/// Directory of registered agents.
///
/// Mutators targeting a specific agent return a bool indicating whether
/// the agent existed; "not found" is not an error.
pub struct AgentRegistry {
    agents: RwLock<HashMap<AgentId, Agent>>,
    observers: Observers<RegistryEvent>,
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            observers: Observers::new(),
        }
    }

    /// Observer registry for lifecycle events.
    pub fn observers(&self) -> &Observers<RegistryEvent> {
        &self.observers
    }

    // ========================================================================
    // LIFECYCLE
    // ========================================================================

    /// Register a new agent. Assigns an id, sets status to idle, and
    /// stamps both timestamps.
    pub fn register(&self, registration: AgentRegistration) -> Agent {
        let agent = Agent::from_registration(registration);
        self.agents
            .write()
            .unwrap()
            .insert(agent.id, agent.clone());
        tracing::info!(agent_id = %agent.id, name = %agent.name, "agent registered");
        self.observers.emit(&RegistryEvent::AgentRegistered {
            agent: agent.clone(),
        });
        agent
    }

    /// Remove an agent (hard delete). Returns false if unknown.
    pub fn unregister(&self, agent_id: AgentId) -> bool {
        let removed = self.agents.write().unwrap().remove(&agent_id).is_some();
        if removed {
            tracing::info!(agent_id = %agent_id, "agent unregistered");
            self.observers
                .emit(&RegistryEvent::AgentUnregistered { agent_id });
        }
        removed
    }

    /// Record a new status, refreshing `last_seen_at`. The previous status
    /// is carried in the emitted event. Returns false if unknown.
    pub fn update_status(&self, agent_id: AgentId, status: AgentStatus) -> bool {
        let old_status = {
            let mut agents = self.agents.write().unwrap();
            match agents.get_mut(&agent_id) {
                Some(agent) => {
                    let old = agent.status;
                    agent.status = status;
                    agent.last_seen_at = Utc::now();
                    old
                }
                None => return false,
            }
        };
        self.observers.emit(&RegistryEvent::AgentStatusChanged {
            agent_id,
            old_status,
            new_status: status,
        });
        true
    }

    /// Shallow-merge into the agent's metadata map, refreshing
    /// `last_seen_at`. Returns false if unknown.
    pub fn update_metadata(&self, agent_id: AgentId, patch: JsonMap) -> bool {
        {
            let mut agents = self.agents.write().unwrap();
            match agents.get_mut(&agent_id) {
                Some(agent) => {
                    for (key, value) in patch {
                        agent.metadata.insert(key, value);
                    }
                    agent.last_seen_at = Utc::now();
                }
                None => return false,
            }
        }
        self.observers
            .emit(&RegistryEvent::AgentMetadataUpdated { agent_id });
        true
    }

    // ========================================================================
    // QUERIES
    // ========================================================================

    pub fn get_agent(&self, agent_id: AgentId) -> Option<Agent> {
        self.agents.read().unwrap().get(&agent_id).cloned()
    }

    pub fn get_all_agents(&self) -> Vec<Agent> {
        let mut agents: Vec<Agent> = self.agents.read().unwrap().values().cloned().collect();
        agents.sort_by(|a, b| a.registered_at.cmp(&b.registered_at));
        agents
    }

    pub fn get_agents_by_status(&self, status: AgentStatus) -> Vec<Agent> {
        self.agents
            .read()
            .unwrap()
            .values()
            .filter(|a| a.status == status)
            .cloned()
            .collect()
    }

    /// Discover agents by capability tags. With `match_all` the agent's
    /// capability set must be a superset of the query; otherwise a
    /// non-empty intersection qualifies.
    pub fn find_by_capabilities(&self, query: &CapabilityQuery) -> Vec<Agent> {
        self.agents
            .read()
            .unwrap()
            .values()
            .filter(|agent| {
                if query.match_all {
                    query.capabilities.iter().all(|c| agent.has_capability(c))
                } else {
                    query.capabilities.iter().any(|c| agent.has_capability(c))
                }
            })
            .cloned()
            .collect()
    }

    /// Case-insensitive substring match over agent names.
    pub fn find_by_name(&self, name: &str) -> Vec<Agent> {
        let needle = name.to_lowercase();
        self.agents
            .read()
            .unwrap()
            .values()
            .filter(|a| a.name.to_lowercase().contains(&needle))
            .cloned()
            .collect()
    }

    /// De-duplicated union of every agent's capability tags, sorted.
    pub fn get_all_capabilities(&self) -> Vec<String> {
        let set: BTreeSet<String> = self
            .agents
            .read()
            .unwrap()
            .values()
            .flat_map(|a| a.capabilities.iter().cloned())
            .collect();
        set.into_iter().collect()
    }

    pub fn count(&self) -> usize {
        self.agents.read().unwrap().len()
    }
}


#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn arb_capabilities() -> impl Strategy<Value = Vec<String>> {
        prop::collection::vec("[a-d]", 0..4)
    }

    proptest! {
        #[test]
        fn capability_matching_follows_set_semantics(
            agent_caps in prop::collection::vec(arb_capabilities(), 0..6),
            query_caps in arb_capabilities(),
            match_all in any::<bool>(),
        ) {
            let registry = AgentRegistry::new();
            let mut expected = HashSet::new();
            for (i, caps) in agent_caps.iter().enumerate() {
                let agent = registry.register(AgentRegistration {
                    name: format!("agent-{i}"),
                    description: String::new(),
                    capabilities: caps.clone(),
                    metadata: JsonMap::new(),
                });
                let cap_set: HashSet<&String> = caps.iter().collect();
                let query_set: HashSet<&String> = query_caps.iter().collect();
                let qualifies = if match_all {
                    query_set.iter().all(|c| cap_set.contains(*c))
                } else {
                    query_set.iter().any(|c| cap_set.contains(*c))
                };
                if qualifies {
                    expected.insert(agent.id);
                }
            }

            let matched: HashSet<AgentId> = registry
                .find_by_capabilities(&CapabilityQuery {
                    capabilities: query_caps,
                    match_all,
                })
                .iter()
                .map(|a| a.id)
                .collect();
            prop_assert_eq!(matched, expected);
        }
    }
}
