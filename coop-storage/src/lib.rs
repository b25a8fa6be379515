//! COOP Storage - Persistence Abstraction
//!
//! Uniform async storage interface for agents, tasks, contexts, and the
//! message log, with two implementations:
//!
//! - [`MemoryStorage`]: entities held in maps, deep-copied through their
//!   serde wire form on every read and write.
//! - [`RedisStorage`]: entities as prefixed JSON records, the message log
//!   as an append-only capped stream.

mod memory;
mod redis;

pub use memory::MemoryStorage;
pub use redis::RedisStorage;

use async_trait::async_trait;
use coop_core::{Agent, AgentId, Context, ContextId, Message, Task, TaskId, Timestamp};
use std::sync::Arc;
use thiserror::Error;

/// Default cap on retained messages.
pub const DEFAULT_MAX_MESSAGES: usize = 1000;

#[derive(Debug, Error)]
pub enum StorageError {
    /// Establishing the durable connection failed. Fatal for this
    /// storage instance; there is no retry loop.
    #[error("storage connection failed: {0}")]
    Connection(String),

    #[error("storage is not connected")]
    NotConnected,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("redis error: {0}")]
    Backend(#[from] ::redis::RedisError),

    #[error("invalid storage configuration: {0}")]
    InvalidConfig(String),

    #[error("corrupt stored record: {0}")]
    Corrupt(String),
}

/// Filter for message-log reads.
#[derive(Debug, Clone, Default)]
pub struct MessageQuery {
    /// Maximum number of messages to return (most recent retained).
    pub limit: Option<usize>,
    /// Only messages strictly older than this timestamp.
    pub before: Option<Timestamp>,
}

/// Persistence contract behind the bus, registry, context store, and
/// task orchestrator. Returned messages are always oldest-first.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn connect(&self) -> Result<(), StorageError>;
    async fn disconnect(&self) -> Result<(), StorageError>;
    fn is_connected(&self) -> bool;

    async fn save_agent(&self, agent: &Agent) -> Result<(), StorageError>;
    async fn get_agent(&self, id: AgentId) -> Result<Option<Agent>, StorageError>;
    async fn get_all_agents(&self) -> Result<Vec<Agent>, StorageError>;
    async fn delete_agent(&self, id: AgentId) -> Result<bool, StorageError>;

    async fn save_task(&self, task: &Task) -> Result<(), StorageError>;
    async fn get_task(&self, id: TaskId) -> Result<Option<Task>, StorageError>;
    async fn get_all_tasks(&self) -> Result<Vec<Task>, StorageError>;
    async fn delete_task(&self, id: TaskId) -> Result<bool, StorageError>;

    async fn save_context(&self, context: &Context) -> Result<(), StorageError>;
    async fn get_context(&self, id: ContextId) -> Result<Option<Context>, StorageError>;
    async fn get_all_contexts(&self) -> Result<Vec<Context>, StorageError>;
    async fn delete_context(&self, id: ContextId) -> Result<bool, StorageError>;

    async fn save_message(&self, message: &Message) -> Result<(), StorageError>;
    async fn get_messages(&self, query: MessageQuery) -> Result<Vec<Message>, StorageError>;
}

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Storage backend selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Memory,
    Redis,
}

/// Storage configuration, read from `COOP_*` environment variables.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Redis connection URL; credentials and database index ride in the URL.
    pub redis_url: String,
    /// Prefix for every durable key, e.g. `coop:`.
    pub key_prefix: String,
    /// Cap on retained messages (ring for memory, stream trim for Redis).
    pub max_messages: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "coop:".to_string(),
            max_messages: DEFAULT_MAX_MESSAGES,
        }
    }
}

impl StorageConfig {
    /// Read configuration from the environment, falling back to defaults.
    ///
    /// Recognized: `COOP_STORAGE_BACKEND` (memory|redis), `COOP_REDIS_URL`,
    /// `COOP_STORAGE_PREFIX`, `COOP_MAX_MESSAGES`.
    pub fn from_env() -> Result<Self, StorageError> {
        let defaults = Self::default();
        let backend = match std::env::var("COOP_STORAGE_BACKEND").ok().as_deref() {
            None | Some("memory") => StorageBackend::Memory,
            Some("redis") => StorageBackend::Redis,
            Some(other) => {
                return Err(StorageError::InvalidConfig(format!(
                    "unknown storage backend: {other}"
                )))
            }
        };
        let max_messages = match std::env::var("COOP_MAX_MESSAGES").ok() {
            Some(raw) => raw.parse::<usize>().map_err(|_| {
                StorageError::InvalidConfig(format!("invalid COOP_MAX_MESSAGES: {raw}"))
            })?,
            None => defaults.max_messages,
        };
        Ok(Self {
            backend,
            redis_url: std::env::var("COOP_REDIS_URL").unwrap_or(defaults.redis_url),
            key_prefix: std::env::var("COOP_STORAGE_PREFIX").unwrap_or(defaults.key_prefix),
            max_messages: max_messages.max(1),
        })
    }
}

/// Build the storage implementation selected by the configuration.
/// The caller is responsible for `connect()`.
pub fn create_storage(config: &StorageConfig) -> Arc<dyn Storage> {
    match config.backend {
        StorageBackend::Memory => Arc::new(MemoryStorage::new(config.max_messages)),
        StorageBackend::Redis => Arc::new(RedisStorage::new(
            config.redis_url.clone(),
            config.key_prefix.clone(),
            config.max_messages,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_uses_memory_backend() {
        let config = StorageConfig::default();
        assert_eq!(config.backend, StorageBackend::Memory);
        assert_eq!(config.key_prefix, "coop:");
        assert_eq!(config.max_messages, DEFAULT_MAX_MESSAGES);
    }

    #[test]
    fn factory_builds_selected_backend() {
        let storage = create_storage(&StorageConfig::default());
        assert!(!storage.is_connected());
    }
}
