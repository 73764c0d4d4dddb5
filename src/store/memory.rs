//! Bounded in-memory task store (server default).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use super::{record_size, StoreError, TaskStore};
use crate::task::{Task, TaskId};

#[derive(Clone)]
pub struct InMemoryTaskStore {
    tasks: Arc<RwLock<HashMap<TaskId, Task>>>,
    max_tasks: usize,
    ttl: Duration,
}

impl InMemoryTaskStore {
    pub fn new(max_tasks: usize, ttl: Duration) -> Self {
        Self {
            tasks: Arc::new(RwLock::new(HashMap::new())),
            max_tasks: max_tasks.max(1),
            ttl,
        }
    }

    /// Pick the record to drop when over capacity: oldest finished task, else oldest task.
    fn overflow_victim(tasks: &HashMap<TaskId, Task>, keep: TaskId) -> Option<TaskId> {
        let oldest = |finished_only: bool| {
            tasks
                .values()
                .filter(|t| t.id != keep && (!finished_only || t.status.is_terminal()))
                .min_by_key(|t| t.created_at)
                .map(|t| t.id)
        };
        oldest(true).or_else(|| oldest(false))
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    fn is_persistent(&self) -> bool {
        false
    }

    async fn put(&self, task: &Task) -> Result<(), StoreError> {
        let mut tasks = self.tasks.write().await;
        tasks.insert(task.id, task.clone());
        while tasks.len() > self.max_tasks {
            let Some(victim) = Self::overflow_victim(&tasks, task.id) else {
                break;
            };
            tasks.remove(&victim);
            tracing::debug!(task_id = %victim, "Evicted task from in-memory store (capacity)");
        }
        Ok(())
    }

    async fn get(&self, id: TaskId) -> Result<Option<Task>, StoreError> {
        let now = Utc::now();
        Ok(self
            .tasks
            .read()
            .await
            .get(&id)
            .filter(|t| !t.is_expired(now, self.ttl))
            .cloned())
    }

    async fn delete(&self, id: TaskId) -> Result<bool, StoreError> {
        Ok(self.tasks.write().await.remove(&id).is_some())
    }

    async fn list_all(&self, limit: usize) -> Result<Vec<Task>, StoreError> {
        let now = Utc::now();
        let mut tasks: Vec<Task> = self
            .tasks
            .read()
            .await
            .values()
            .filter(|t| !t.is_expired(now, self.ttl))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        tasks.truncate(limit);
        Ok(tasks)
    }

    async fn size_bytes(&self) -> Result<usize, StoreError> {
        self.tasks.read().await.values().map(record_size).sum()
    }

    async fn sweep_expired(&self) -> Result<usize, StoreError> {
        let now = Utc::now();
        let mut tasks = self.tasks.write().await;
        let before = tasks.len();
        tasks.retain(|_, t| !t.is_expired(now, self.ttl));
        Ok(before - tasks.len())
    }
}
