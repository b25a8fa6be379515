//! In-memory storage. Entities are stored in their serialized wire form
//! and re-parsed on every read, so callers can never mutate stored state
//! through a returned reference and date-valued fields round-trip through
//! the same canonical representation the durable backend uses.

use crate::{MessageQuery, Storage, StorageError};
use async_trait::async_trait;
use coop_core::{Agent, AgentId, Context, ContextId, Message, Task, TaskId};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use uuid::Uuid;

/// Map key shared by all entity id types.
type Key = Uuid;

pub struct MemoryStorage {
    agents: RwLock<HashMap<Key, String>>,
    tasks: RwLock<HashMap<Key, String>>,
    contexts: RwLock<HashMap<Key, String>>,
    /// Chronological message log, trimmed oldest-first past the cap.
    messages: RwLock<Vec<String>>,
    max_messages: usize,
    connected: AtomicBool,
}

impl MemoryStorage {
    pub fn new(max_messages: usize) -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            tasks: RwLock::new(HashMap::new()),
            contexts: RwLock::new(HashMap::new()),
            messages: RwLock::new(Vec::new()),
            max_messages: max_messages.max(1),
            connected: AtomicBool::new(false),
        }
    }

    fn save<T: Serialize>(
        table: &RwLock<HashMap<Key, String>>,
        id: Key,
        entity: &T,
    ) -> Result<(), StorageError> {
        let encoded = serde_json::to_string(entity)?;
        table.write().unwrap().insert(id, encoded);
        Ok(())
    }

    fn get<T: DeserializeOwned>(
        table: &RwLock<HashMap<Key, String>>,
        id: Key,
    ) -> Result<Option<T>, StorageError> {
        match table.read().unwrap().get(&id) {
            Some(encoded) => Ok(Some(serde_json::from_str(encoded)?)),
            None => Ok(None),
        }
    }

    fn get_all<T: DeserializeOwned>(
        table: &RwLock<HashMap<Key, String>>,
    ) -> Result<Vec<T>, StorageError> {
        table
            .read()
            .unwrap()
            .values()
            .map(|encoded| serde_json::from_str(encoded).map_err(StorageError::from))
            .collect()
    }

    fn delete(table: &RwLock<HashMap<Key, String>>, id: Key) -> bool {
        table.write().unwrap().remove(&id).is_some()
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new(crate::DEFAULT_MAX_MESSAGES)
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    /// Memory storage cannot fail to connect.
    async fn connect(&self) -> Result<(), StorageError> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), StorageError> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn save_agent(&self, agent: &Agent) -> Result<(), StorageError> {
        Self::save(&self.agents, agent.id.as_uuid(), agent)
    }

    async fn get_agent(&self, id: AgentId) -> Result<Option<Agent>, StorageError> {
        Self::get(&self.agents, id.as_uuid())
    }

    async fn get_all_agents(&self) -> Result<Vec<Agent>, StorageError> {
        Self::get_all(&self.agents)
    }

    async fn delete_agent(&self, id: AgentId) -> Result<bool, StorageError> {
        Ok(Self::delete(&self.agents, id.as_uuid()))
    }

    async fn save_task(&self, task: &Task) -> Result<(), StorageError> {
        Self::save(&self.tasks, task.id.as_uuid(), task)
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<Task>, StorageError> {
        Self::get(&self.tasks, id.as_uuid())
    }

    async fn get_all_tasks(&self) -> Result<Vec<Task>, StorageError> {
        Self::get_all(&self.tasks)
    }

    async fn delete_task(&self, id: TaskId) -> Result<bool, StorageError> {
        Ok(Self::delete(&self.tasks, id.as_uuid()))
    }

    async fn save_context(&self, context: &Context) -> Result<(), StorageError> {
        Self::save(&self.contexts, context.id.as_uuid(), context)
    }

    async fn get_context(&self, id: ContextId) -> Result<Option<Context>, StorageError> {
        Self::get(&self.contexts, id.as_uuid())
    }

    async fn get_all_contexts(&self) -> Result<Vec<Context>, StorageError> {
        Self::get_all(&self.contexts)
    }

    async fn delete_context(&self, id: ContextId) -> Result<bool, StorageError> {
        Ok(Self::delete(&self.contexts, id.as_uuid()))
    }

    async fn save_message(&self, message: &Message) -> Result<(), StorageError> {
        let encoded = serde_json::to_string(message)?;
        let mut messages = self.messages.write().unwrap();
        messages.push(encoded);
        let overflow = messages.len().saturating_sub(self.max_messages);
        if overflow > 0 {
            messages.drain(..overflow);
        }
        Ok(())
    }

    async fn get_messages(&self, query: MessageQuery) -> Result<Vec<Message>, StorageError> {
        let decoded: Vec<Message> = self
            .messages
            .read()
            .unwrap()
            .iter()
            .map(|encoded| serde_json::from_str(encoded).map_err(StorageError::from))
            .collect::<Result<_, _>>()?;

        let mut filtered: Vec<Message> = match query.before {
            Some(before) => decoded
                .into_iter()
                .filter(|m| m.timestamp < before)
                .collect(),
            None => decoded,
        };
        if let Some(limit) = query.limit {
            let skip = filtered.len().saturating_sub(limit);
            filtered.drain(..skip);
        }
        Ok(filtered)
    }
}
