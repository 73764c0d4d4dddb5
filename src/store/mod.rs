//! Task storage module with pluggable backends.
//!
//! Supports:
//! - `memory`: Bounded in-memory map (server default, non-persistent)
//! - `file`: Size-capped JSON snapshot that evicts before every write
//! - `sqlite`: SQLite database with one JSON record per task
//!
//! Every backend treats tasks older than the configured TTL as absent.

mod eviction;
mod file;
mod memory;
mod sqlite;

pub use eviction::{record_size, EvictionPolicy, EvictionReport};
pub use file::FileTaskStore;
pub use memory::InMemoryTaskStore;
pub use sqlite::SqliteTaskStore;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::StoreConfig;
use crate::task::{Task, TaskId, TaskStatus};

/// Errors raised by a storage backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to (de)serialize task record: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Store quota exceeded: {size} bytes against a budget of {budget}")]
    QuotaExceeded { size: usize, budget: usize },

    #[error("Store worker failed: {0}")]
    Join(String),
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(e: tokio::task::JoinError) -> Self {
        StoreError::Join(e.to_string())
    }
}

/// Task store trait - implemented by all storage backends.
///
/// Only `TaskLifecycleManager` writes through this trait.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Whether this store persists data across restarts.
    fn is_persistent(&self) -> bool;

    /// Insert or replace a task record.
    async fn put(&self, task: &Task) -> Result<(), StoreError>;

    /// Get a task by ID. Expired and evicted tasks are `None`.
    async fn get(&self, id: TaskId) -> Result<Option<Task>, StoreError>;

    /// Delete a task. Returns whether it existed.
    async fn delete(&self, id: TaskId) -> Result<bool, StoreError>;

    /// List live tasks, newest `created_at` first.
    async fn list_all(&self, limit: usize) -> Result<Vec<Task>, StoreError>;

    /// Serialized size of all stored records.
    async fn size_bytes(&self) -> Result<usize, StoreError>;

    /// Delete every task past the TTL. Returns how many were removed.
    async fn sweep_expired(&self) -> Result<usize, StoreError>;

    /// All live tasks with the given status.
    async fn list_by_status(&self, status: TaskStatus) -> Result<Vec<Task>, StoreError> {
        let tasks = self.list_all(usize::MAX).await?;
        Ok(tasks.into_iter().filter(|t| t.status == status).collect())
    }
}

/// Task store type selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreType {
    #[default]
    Memory,
    File,
    Sqlite,
}

impl StoreType {
    /// Parse from environment variable value.
    pub fn from_str(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "memory" | "mem" => Self::Memory,
            "file" | "json" => Self::File,
            "sqlite" | "db" => Self::Sqlite,
            other => {
                tracing::warn!("Unknown task store type {:?}, using memory", other);
                Self::default()
            }
        }
    }
}

/// Create a task store based on configuration.
pub async fn create_task_store(config: &StoreConfig) -> Result<Arc<dyn TaskStore>, StoreError> {
    let store: Arc<dyn TaskStore> = match config.store_type {
        StoreType::Memory => Arc::new(InMemoryTaskStore::new(config.max_tasks, config.ttl)),
        StoreType::File => Arc::new(
            FileTaskStore::new(config.dir.clone(), config.ttl, config.eviction.clone()).await?,
        ),
        StoreType::Sqlite => Arc::new(SqliteTaskStore::new(config.dir.clone(), config.ttl).await?),
    };
    tracing::info!(
        store_type = ?config.store_type,
        persistent = store.is_persistent(),
        "Task store ready"
    );
    Ok(store)
}
