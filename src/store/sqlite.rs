//! SQLite-based task store with one JSON record per task.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;

use super::{StoreError, TaskStore};
use crate::task::{Task, TaskId, TaskStatus};

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;

CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY NOT NULL,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    record TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_tasks_created_at ON tasks(created_at DESC);
CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
"#;

const DB_FILE: &str = "tasks.db";

/// Fixed-width timestamps so SQL string comparison matches time order.
fn timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub struct SqliteTaskStore {
    conn: Arc<Mutex<Connection>>,
    ttl: Duration,
}

impl SqliteTaskStore {
    pub async fn new(base_dir: PathBuf, ttl: Duration) -> Result<Self, StoreError> {
        tokio::fs::create_dir_all(&base_dir).await?;
        let db_path = base_dir.join(DB_FILE);

        let conn = tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&db_path)?;
            conn.execute_batch(SCHEMA)?;
            Ok::<_, StoreError>(conn)
        })
        .await??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            ttl,
        })
    }

    /// Oldest `created_at` that is still live.
    fn cutoff(&self) -> String {
        let ttl = chrono::Duration::from_std(self.ttl)
            .unwrap_or_else(|_| chrono::Duration::days(365 * 100));
        timestamp(Utc::now().checked_sub_signed(ttl).unwrap_or_default())
    }

    fn decode(record: String) -> Result<Task, StoreError> {
        Ok(serde_json::from_str(&record)?)
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    fn is_persistent(&self) -> bool {
        true
    }

    async fn put(&self, task: &Task) -> Result<(), StoreError> {
        let record = serde_json::to_string(task)?;
        let id = task.id.to_string();
        let status = task.status.to_string();
        let created_at = timestamp(task.created_at);
        let updated_at = timestamp(task.updated_at);
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            conn.execute(
                "INSERT INTO tasks (id, status, created_at, updated_at, record)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                    status = excluded.status,
                    updated_at = excluded.updated_at,
                    record = excluded.record",
                params![id, status, created_at, updated_at, record],
            )?;
            Ok::<_, StoreError>(())
        })
        .await?
    }

    async fn get(&self, id: TaskId) -> Result<Option<Task>, StoreError> {
        let conn = Arc::clone(&self.conn);
        let cutoff = self.cutoff();
        let record = tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            conn.query_row(
                "SELECT record FROM tasks WHERE id = ?1 AND created_at >= ?2",
                params![id.to_string(), cutoff],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .map_err(StoreError::from)
        })
        .await??;
        record.map(Self::decode).transpose()
    }

    async fn delete(&self, id: TaskId) -> Result<bool, StoreError> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let changed = conn.execute("DELETE FROM tasks WHERE id = ?1", params![id.to_string()])?;
            Ok::<_, StoreError>(changed > 0)
        })
        .await?
    }

    async fn list_all(&self, limit: usize) -> Result<Vec<Task>, StoreError> {
        let conn = Arc::clone(&self.conn);
        let cutoff = self.cutoff();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let records = tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let mut stmt = conn.prepare(
                "SELECT record FROM tasks
                 WHERE created_at >= ?1
                 ORDER BY created_at DESC
                 LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(params![cutoff, limit], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok::<_, StoreError>(rows)
        })
        .await??;
        records.into_iter().map(Self::decode).collect()
    }

    async fn size_bytes(&self) -> Result<usize, StoreError> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let total: i64 = conn.query_row(
                "SELECT COALESCE(SUM(LENGTH(record)), 0) FROM tasks",
                [],
                |row| row.get(0),
            )?;
            Ok::<_, StoreError>(usize::try_from(total).unwrap_or(0))
        })
        .await?
    }

    async fn sweep_expired(&self) -> Result<usize, StoreError> {
        let conn = Arc::clone(&self.conn);
        let cutoff = self.cutoff();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let removed = conn.execute("DELETE FROM tasks WHERE created_at < ?1", params![cutoff])?;
            Ok::<_, StoreError>(removed)
        })
        .await?
    }

    async fn list_by_status(&self, status: TaskStatus) -> Result<Vec<Task>, StoreError> {
        let conn = Arc::clone(&self.conn);
        let cutoff = self.cutoff();
        let records = tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let mut stmt = conn.prepare(
                "SELECT record FROM tasks
                 WHERE status = ?1 AND created_at >= ?2
                 ORDER BY created_at DESC",
            )?;
            let rows = stmt
                .query_map(params![status.to_string(), cutoff], |row| {
                    row.get::<_, String>(0)
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok::<_, StoreError>(rows)
        })
        .await??;
        records.into_iter().map(Self::decode).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskRequest;

    #[tokio::test]
    async fn records_survive_reopen_and_upsert() {
        let dir = tempfile::tempdir().unwrap();
        let ttl = Duration::from_secs(1800);
        let mut task = Task::new(TaskRequest::new("durable", 2));
        {
            let store = SqliteTaskStore::new(dir.path().to_path_buf(), ttl)
                .await
                .unwrap();
            store.put(&task).await.unwrap();
            task.begin_processing().unwrap();
            task.record_progress(52, Some("https://img/1.png".into()))
                .unwrap();
            store.put(&task).await.unwrap();
        }
        let store = SqliteTaskStore::new(dir.path().to_path_buf(), ttl)
            .await
            .unwrap();
        let loaded = store.get(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Processing);
        assert_eq!(loaded.progress, 52);
        assert_eq!(loaded.results, vec!["https://img/1.png".to_string()]);
        assert_eq!(store.list_all(10).await.unwrap().len(), 1);
    }
}
