//! Size-capped JSON snapshot store (client-side cache).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::{Mutex, RwLock};

use super::{record_size, EvictionPolicy, StoreError, TaskStore};
use crate::task::{Task, TaskId};

const SNAPSHOT_FILE: &str = "tasks.json";

#[derive(Debug, Serialize, Deserialize, Default)]
struct TaskStoreSnapshot {
    tasks: HashMap<TaskId, Task>,
}

#[derive(Clone)]
pub struct FileTaskStore {
    path: PathBuf,
    tasks: Arc<RwLock<HashMap<TaskId, Task>>>,
    persist_lock: Arc<Mutex<()>>,
    ttl: Duration,
    policy: EvictionPolicy,
}

impl FileTaskStore {
    pub async fn new(
        base_dir: PathBuf,
        ttl: Duration,
        policy: EvictionPolicy,
    ) -> Result<Self, StoreError> {
        fs::create_dir_all(&base_dir).await?;
        let path = base_dir.join(SNAPSHOT_FILE);
        let snapshot = match fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<TaskStoreSnapshot>(&bytes) {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    tracing::warn!("Failed to parse task store {}: {}", path.display(), e);
                    TaskStoreSnapshot::default()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => TaskStoreSnapshot::default(),
            Err(err) => {
                tracing::warn!("Failed to read task store {}: {}", path.display(), err);
                TaskStoreSnapshot::default()
            }
        };

        Ok(Self {
            path,
            tasks: Arc::new(RwLock::new(snapshot.tasks)),
            persist_lock: Arc::new(Mutex::new(())),
            ttl,
            policy,
        })
    }

    async fn persist(&self) -> Result<(), StoreError> {
        let _guard = self.persist_lock.lock().await;
        let snapshot = TaskStoreSnapshot {
            tasks: self.tasks.read().await.clone(),
        };
        let data = serde_json::to_vec(&snapshot)?;
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, data).await?;
        fs::rename(&tmp_path, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl TaskStore for FileTaskStore {
    fn is_persistent(&self) -> bool {
        true
    }

    async fn put(&self, task: &Task) -> Result<(), StoreError> {
        {
            let mut tasks = self.tasks.write().await;
            let mut candidate = tasks.clone();
            candidate.insert(task.id, task.clone());
            // Rejected writes leave the previous record set untouched.
            let report = self.policy.apply(&mut candidate, Utc::now())?;
            if report != Default::default() {
                tracing::debug!(
                    task_id = %task.id,
                    expired = report.expired,
                    over_cap = report.over_cap,
                    stripped = report.stripped,
                    trimmed = report.trimmed,
                    "Evicted tasks before write"
                );
            }
            *tasks = candidate;
        }
        self.persist().await
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
        let existed = self.tasks.write().await.remove(&id).is_some();
        if existed {
            self.persist().await?;
        }
        Ok(existed)
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
        let removed = {
            let mut tasks = self.tasks.write().await;
            let before = tasks.len();
            tasks.retain(|_, t| !t.is_expired(now, self.ttl));
            before - tasks.len()
        };
        if removed > 0 {
            self.persist().await?;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{ReferenceImage, TaskRequest};

    fn ttl() -> Duration {
        Duration::from_secs(30 * 60)
    }

    #[tokio::test]
    async fn snapshot_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let task = Task::new(TaskRequest::new("persist me", 2));
        {
            let store = FileTaskStore::new(dir.path().to_path_buf(), ttl(), Default::default())
                .await
                .unwrap();
            store.put(&task).await.unwrap();
        }
        let reopened = FileTaskStore::new(dir.path().to_path_buf(), ttl(), Default::default())
            .await
            .unwrap();
        let loaded = reopened.get(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.request.prompt, "persist me");
        assert!(!dir.path().join("tasks.json.tmp").exists());
    }

    #[tokio::test]
    async fn corrupt_snapshot_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(SNAPSHOT_FILE), b"{ not json").unwrap();
        let store = FileTaskStore::new(dir.path().to_path_buf(), ttl(), Default::default())
            .await
            .unwrap();
        assert!(store.list_all(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn sixth_task_evicts_the_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTaskStore::new(dir.path().to_path_buf(), ttl(), Default::default())
            .await
            .unwrap();
        let base = Utc::now() - chrono::Duration::minutes(10);
        let mut ids = Vec::new();
        for i in 0..6 {
            let mut task = Task::new(TaskRequest::new(format!("task {i}"), 1));
            task.created_at = base + chrono::Duration::minutes(i);
            ids.push(task.id);
            store.put(&task).await.unwrap();
        }

        assert!(store.get(ids[0]).await.unwrap().is_none());
        for id in &ids[1..] {
            assert!(store.get(*id).await.unwrap().is_some());
        }
    }

    #[tokio::test]
    async fn write_over_budget_is_rejected_and_keeps_previous_state() {
        let dir = tempfile::tempdir().unwrap();
        let policy = EvictionPolicy {
            hard_cap_bytes: 2048,
            ..Default::default()
        };
        let store = FileTaskStore::new(dir.path().to_path_buf(), ttl(), policy)
            .await
            .unwrap();
        let small = Task::new(TaskRequest::new("small", 1));
        store.put(&small).await.unwrap();

        let big = Task::new(
            TaskRequest::new("big", 1)
                .with_reference_image(ReferenceImage::new(vec![0u8; 16 * 1024], "big.png")),
        );
        tokio_test::assert_err!(store.put(&big).await);

        assert!(store.get(small.id).await.unwrap().is_some());
        assert!(store.get(big.id).await.unwrap().is_none());
    }
}
