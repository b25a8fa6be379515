//! Redis-backed storage.
//!
//! Entities are individually addressable JSON records under
//! `<prefix><type>:<id>`; the message log is a single append-only capped
//! stream at `<prefix>messages`, trimmed with an approximate MAXLEN policy
//! and read back newest-first before being re-ordered chronologically.

use crate::{MessageQuery, Storage, StorageError};
use ::redis::aio::ConnectionManager;
use ::redis::streams::{StreamMaxlen, StreamRangeReply};
use ::redis::AsyncCommands;
use async_trait::async_trait;
use coop_core::{Agent, AgentId, Context, ContextId, Message, Task, TaskId};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::RwLock;

pub struct RedisStorage {
    url: String,
    key_prefix: String,
    max_messages: usize,
    manager: RwLock<Option<ConnectionManager>>,
}

impl RedisStorage {
    pub fn new(url: String, key_prefix: String, max_messages: usize) -> Self {
        Self {
            url,
            key_prefix,
            max_messages: max_messages.max(1),
            manager: RwLock::new(None),
        }
    }

    fn key(&self, entity_type: &str, id: impl std::fmt::Display) -> String {
        format!("{}{}:{}", self.key_prefix, entity_type, id)
    }

    fn pattern(&self, entity_type: &str) -> String {
        format!("{}{}:*", self.key_prefix, entity_type)
    }

    fn stream_key(&self) -> String {
        format!("{}messages", self.key_prefix)
    }

    fn connection(&self) -> Result<ConnectionManager, StorageError> {
        self.manager
            .read()
            .unwrap()
            .clone()
            .ok_or(StorageError::NotConnected)
    }

    async fn save_entity<T: Serialize + Sync>(
        &self,
        entity_type: &str,
        id: impl std::fmt::Display,
        entity: &T,
    ) -> Result<(), StorageError> {
        let mut con = self.connection()?;
        let encoded = serde_json::to_string(entity)?;
        con.set::<_, _, ()>(self.key(entity_type, id), encoded)
            .await?;
        Ok(())
    }

    async fn get_entity<T: DeserializeOwned>(
        &self,
        entity_type: &str,
        id: impl std::fmt::Display,
    ) -> Result<Option<T>, StorageError> {
        let mut con = self.connection()?;
        let encoded: Option<String> = con.get(self.key(entity_type, id)).await?;
        match encoded {
            Some(encoded) => Ok(Some(serde_json::from_str(&encoded)?)),
            None => Ok(None),
        }
    }

    async fn get_entities<T: DeserializeOwned>(
        &self,
        entity_type: &str,
    ) -> Result<Vec<T>, StorageError> {
        let mut con = self.connection()?;
        let keys: Vec<String> = con.keys(self.pattern(entity_type)).await?;
        let mut entities = Vec::with_capacity(keys.len());
        for key in keys {
            let encoded: Option<String> = con.get(&key).await?;
            if let Some(encoded) = encoded {
                entities.push(serde_json::from_str(&encoded)?);
            }
        }
        Ok(entities)
    }

    async fn delete_entity(
        &self,
        entity_type: &str,
        id: impl std::fmt::Display,
    ) -> Result<bool, StorageError> {
        let mut con = self.connection()?;
        let removed: i64 = con.del(self.key(entity_type, id)).await?;
        Ok(removed > 0)
    }
}

#[async_trait]
impl Storage for RedisStorage {
    /// Failure here is fatal for this instance; the caller decides whether
    /// to fall back to memory storage or abort startup.
    async fn connect(&self) -> Result<(), StorageError> {
        let client = ::redis::Client::open(self.url.as_str())
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        *self.manager.write().unwrap() = Some(manager);
        tracing::info!(url = %self.url, prefix = %self.key_prefix, "redis storage connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), StorageError> {
        *self.manager.write().unwrap() = None;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.manager.read().unwrap().is_some()
    }

    async fn save_agent(&self, agent: &Agent) -> Result<(), StorageError> {
        self.save_entity("agent", agent.id, agent).await
    }

    async fn get_agent(&self, id: AgentId) -> Result<Option<Agent>, StorageError> {
        self.get_entity("agent", id).await
    }

    async fn get_all_agents(&self) -> Result<Vec<Agent>, StorageError> {
        self.get_entities("agent").await
    }

    async fn delete_agent(&self, id: AgentId) -> Result<bool, StorageError> {
        self.delete_entity("agent", id).await
    }

    async fn save_task(&self, task: &Task) -> Result<(), StorageError> {
        self.save_entity("task", task.id, task).await
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<Task>, StorageError> {
        self.get_entity("task", id).await
    }

    async fn get_all_tasks(&self) -> Result<Vec<Task>, StorageError> {
        self.get_entities("task").await
    }

    async fn delete_task(&self, id: TaskId) -> Result<bool, StorageError> {
        self.delete_entity("task", id).await
    }

    async fn save_context(&self, context: &Context) -> Result<(), StorageError> {
        self.save_entity("context", context.id, context).await
    }

    async fn get_context(&self, id: ContextId) -> Result<Option<Context>, StorageError> {
        self.get_entity("context", id).await
    }

    async fn get_all_contexts(&self) -> Result<Vec<Context>, StorageError> {
        self.get_entities("context").await
    }

    async fn delete_context(&self, id: ContextId) -> Result<bool, StorageError> {
        self.delete_entity("context", id).await
    }

    async fn save_message(&self, message: &Message) -> Result<(), StorageError> {
        let mut con = self.connection()?;
        let encoded = serde_json::to_string(message)?;
        let key = self.stream_key();
        con.xadd::<_, _, _, _, String>(&key, "*", &[("data", encoded)])
            .await?;
        // Approximate trim keeps the stream bounded without the cost of
        // exact MAXLEN on every append.
        con.xtrim::<_, i64>(&key, StreamMaxlen::Approx(self.max_messages))
            .await?;
        Ok(())
    }

    async fn get_messages(&self, query: MessageQuery) -> Result<Vec<Message>, StorageError> {
        let mut con = self.connection()?;
        let key = self.stream_key();
        let reply: StreamRangeReply = match query.limit {
            Some(limit) => con.xrevrange_count(&key, "+", "-", limit).await?,
            None => con.xrevrange(&key, "+", "-").await?,
        };

        // Newest-first off the wire; re-order chronologically.
        let mut messages = Vec::with_capacity(reply.ids.len());
        for entry in reply.ids.into_iter().rev() {
            let encoded: String = entry.get("data").ok_or_else(|| {
                StorageError::Corrupt("stream entry missing data field".to_string())
            })?;
            messages.push(serde_json::from_str::<Message>(&encoded)?);
        }
        if let Some(before) = query.before {
            messages.retain(|m| m.timestamp < before);
        }
        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_layout_matches_prefix_scheme() {
        let storage = RedisStorage::new(
            "redis://localhost".to_string(),
            "coop:".to_string(),
            100,
        );
        let id = AgentId::new();
        assert_eq!(storage.key("agent", id), format!("coop:agent:{id}"));
        assert_eq!(storage.pattern("task"), "coop:task:*");
        assert_eq!(storage.stream_key(), "coop:messages");
    }

    #[tokio::test]
    async fn operations_require_connection() {
        let storage = RedisStorage::new(
            "redis://localhost".to_string(),
            "coop:".to_string(),
            100,
        );
        assert!(!storage.is_connected());
        let result = storage.get_all_agents().await;
        assert!(matches!(result, Err(StorageError::NotConnected)));
    }
}
