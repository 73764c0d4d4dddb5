//! Task lifecycle manager - the single writer of task records.
//!
//! Every mutation is a read-modify-write under a per-task async mutex, so
//! concurrent progress updates for the same task never lose a result append.
//! Writers that belong to a specific attempt pass an `AttemptRef`; once a task
//! has moved on to a newer attempt those writes are rejected as stale.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::store::{StoreError, TaskStore};
use crate::task::{Task, TaskError, TaskId, TaskRequest, TaskStatus};

/// Tries per store call before the task is treated as gone.
const STORE_TRIES: u32 = 3;
const STORE_BACKOFF: Duration = Duration::from_millis(25);

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("Task not found: {0}")]
    NotFound(TaskId),

    #[error(transparent)]
    Transition(#[from] TaskError),

    #[error("Stale write for task {id}: attempt {attempt} was superseded by attempt {current}")]
    StaleAttempt {
        id: TaskId,
        attempt: u32,
        current: u32,
    },

    #[error("Task {id} does not fit the store budget: {size} bytes against a budget of {budget}")]
    QuotaExceeded {
        id: TaskId,
        size: usize,
        budget: usize,
    },

    #[error("Store unavailable: {0}")]
    Store(#[from] StoreError),
}

/// A task id pinned to one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptRef {
    pub id: TaskId,
    pub attempt: u32,
}

impl AttemptRef {
    pub fn of(task: &Task) -> Self {
        Self {
            id: task.id,
            attempt: task.attempt,
        }
    }
}

pub struct TaskLifecycleManager {
    store: Arc<dyn TaskStore>,
    locks: Mutex<HashMap<TaskId, Arc<tokio::sync::Mutex<()>>>>,
    max_attempts: u32,
}

impl TaskLifecycleManager {
    pub fn new(store: Arc<dyn TaskStore>, max_attempts: u32) -> Self {
        Self {
            store,
            locks: Mutex::new(HashMap::new()),
            max_attempts,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn is_persistent(&self) -> bool {
        self.store.is_persistent()
    }

    fn lock_for(&self, id: TaskId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(id).or_default().clone()
    }

    fn release(&self, id: TaskId, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // One reference in the table plus ours: nobody else is waiting.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(&id);
        }
    }

    /// Number of task locks currently held or awaited.
    pub fn active_locks(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    async fn with_store_retry<T, F, Fut>(&self, op: &str, id: TaskId, call: F) -> Result<T, StoreError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut tries = 0;
        loop {
            tries += 1;
            match call().await {
                Ok(value) => return Ok(value),
                Err(e @ StoreError::QuotaExceeded { .. }) => return Err(e),
                Err(e) if tries < STORE_TRIES => {
                    tracing::warn!(task_id = %id, op, tries, "Store call failed, retrying: {}", e);
                    tokio::time::sleep(STORE_BACKOFF * tries).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Read a task, treating an unrecoverable store failure as absence.
    async fn load(&self, id: TaskId) -> Option<Task> {
        match self.with_store_retry("get", id, || self.store.get(id)).await {
            Ok(task) => task,
            Err(e) => {
                tracing::error!(task_id = %id, "Store read failed, treating task as not found: {}", e);
                None
            }
        }
    }

    async fn save(&self, task: &Task) -> Result<(), LifecycleError> {
        self.with_store_retry("put", task.id, || self.store.put(task))
            .await
            .map_err(|e| match e {
                StoreError::QuotaExceeded { size, budget } => {
                    tracing::warn!(task_id = %task.id, size, budget, "Task record rejected by store budget");
                    LifecycleError::QuotaExceeded {
                        id: task.id,
                        size,
                        budget,
                    }
                }
                other => {
                    tracing::error!(task_id = %task.id, "Store write failed, treating task as not found: {}", other);
                    LifecycleError::NotFound(task.id)
                }
            })
    }

    /// Run `f` on the current record under the task lock and persist the result.
    async fn mutate<T, F>(&self, id: TaskId, attempt: Option<u32>, f: F) -> Result<(T, Task), LifecycleError>
    where
        F: FnOnce(&mut Task) -> Result<T, TaskError> + Send,
        T: Send,
    {
        let lock = self.lock_for(id);
        let result = {
            let _guard = lock.lock().await;
            self.mutate_locked(id, attempt, f).await
        };
        self.release(id, lock);
        result
    }

    async fn mutate_locked<T, F>(&self, id: TaskId, attempt: Option<u32>, f: F) -> Result<(T, Task), LifecycleError>
    where
        F: FnOnce(&mut Task) -> Result<T, TaskError> + Send,
        T: Send,
    {
        let mut task = self.load(id).await.ok_or(LifecycleError::NotFound(id))?;
        if let Some(attempt) = attempt {
            if task.attempt != attempt {
                return Err(LifecycleError::StaleAttempt {
                    id,
                    attempt,
                    current: task.attempt,
                });
            }
        }
        let value = f(&mut task)?;
        self.save(&task).await?;
        Ok((value, task))
    }

    /// Create and persist a new `Pending` task.
    pub async fn create(&self, request: TaskRequest) -> Result<Task, LifecycleError> {
        let task = Task::new(request);
        self.with_store_retry("put", task.id, || self.store.put(&task))
            .await?;
        tracing::info!(
            task_id = %task.id,
            width = task.request.fan_out_width,
            min_success = task.request.min_success,
            "Task created"
        );
        Ok(task)
    }

    /// `Pending -> Processing`; `Ok(false)` if already processing.
    pub async fn begin_processing(&self, id: TaskId) -> Result<bool, LifecycleError> {
        self.begin_processing_at(id, None).await
    }

    pub async fn begin_attempt(&self, attempt: AttemptRef) -> Result<bool, LifecycleError> {
        self.begin_processing_at(attempt.id, Some(attempt.attempt)).await
    }

    async fn begin_processing_at(&self, id: TaskId, attempt: Option<u32>) -> Result<bool, LifecycleError> {
        let (started, task) = self.mutate(id, attempt, |t| t.begin_processing()).await?;
        if started {
            tracing::debug!(task_id = %id, attempt = task.attempt, "Task processing");
        }
        Ok(started)
    }

    /// Append an optional result and raise progress.
    ///
    /// A task that has vanished is logged and reported as `Ok(None)`.
    pub async fn record_partial_progress(
        &self,
        id: TaskId,
        progress: u8,
        result: Option<String>,
    ) -> Result<Option<Task>, LifecycleError> {
        self.record_progress_at(id, None, progress, result).await
    }

    pub async fn record_attempt_progress(
        &self,
        attempt: AttemptRef,
        progress: u8,
        result: Option<String>,
    ) -> Result<Option<Task>, LifecycleError> {
        self.record_progress_at(attempt.id, Some(attempt.attempt), progress, result)
            .await
    }

    async fn record_progress_at(
        &self,
        id: TaskId,
        attempt: Option<u32>,
        progress: u8,
        result: Option<String>,
    ) -> Result<Option<Task>, LifecycleError> {
        match self
            .mutate(id, attempt, |t| t.record_progress(progress, result))
            .await
        {
            Ok(((), task)) => Ok(Some(task)),
            Err(LifecycleError::NotFound(_)) => {
                tracing::warn!(task_id = %id, progress, "Progress for a task that no longer exists");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// `Processing -> Completed`.
    pub async fn complete(&self, id: TaskId, results: Vec<String>) -> Result<Task, LifecycleError> {
        self.complete_at(id, None, results).await
    }

    pub async fn complete_attempt(
        &self,
        attempt: AttemptRef,
        results: Vec<String>,
    ) -> Result<Task, LifecycleError> {
        self.complete_at(attempt.id, Some(attempt.attempt), results)
            .await
    }

    async fn complete_at(
        &self,
        id: TaskId,
        attempt: Option<u32>,
        results: Vec<String>,
    ) -> Result<Task, LifecycleError> {
        let ((), task) = self.mutate(id, attempt, |t| t.complete(results)).await?;
        tracing::info!(task_id = %id, results = task.results.len(), "Task completed");
        Ok(task)
    }

    /// `Pending | Processing -> Failed`.
    pub async fn fail(&self, id: TaskId, reason: impl Into<String>) -> Result<Task, LifecycleError> {
        self.fail_at(id, None, reason.into()).await
    }

    pub async fn fail_attempt(
        &self,
        attempt: AttemptRef,
        reason: impl Into<String>,
    ) -> Result<Task, LifecycleError> {
        self.fail_at(attempt.id, Some(attempt.attempt), reason.into())
            .await
    }

    async fn fail_at(&self, id: TaskId, attempt: Option<u32>, reason: String) -> Result<Task, LifecycleError> {
        let ((), task) = self.mutate(id, attempt, |t| t.fail(reason)).await?;
        tracing::warn!(
            task_id = %id,
            attempt = task.attempt,
            reason = task.error_message.as_deref().unwrap_or_default(),
            "Task failed"
        );
        Ok(task)
    }

    /// Fail a task only if it is still processing `attempt` and still stale at `now`.
    ///
    /// Returns `Ok(false)` when the task moved on since it was scanned.
    pub async fn fail_stalled(
        &self,
        attempt: AttemptRef,
        threshold: Duration,
        now: DateTime<Utc>,
        reason: &str,
    ) -> Result<bool, LifecycleError> {
        let outcome = self
            .mutate(attempt.id, Some(attempt.attempt), |t| {
                if t.status != TaskStatus::Processing || !t.is_stale(now, threshold) {
                    return Ok(false);
                }
                t.fail(reason).map(|()| true)
            })
            .await;
        match outcome {
            Ok((failed, _)) => Ok(failed),
            Err(LifecycleError::StaleAttempt { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// `Failed -> Pending` for a new attempt; `Ok(false)` once attempts are exhausted.
    pub async fn retry(&self, id: TaskId) -> Result<bool, LifecycleError> {
        let max_attempts = self.max_attempts;
        let (retried, task) = self.mutate(id, None, |t| t.retry(max_attempts)).await?;
        if retried {
            tracing::info!(task_id = %id, attempt = task.attempt, "Task queued for retry");
        } else {
            tracing::info!(task_id = %id, attempt = task.attempt, "Retry refused, attempts exhausted");
        }
        Ok(retried)
    }

    pub async fn get(&self, id: TaskId) -> Option<Task> {
        self.load(id).await
    }

    pub async fn list(&self, limit: usize) -> Result<Vec<Task>, LifecycleError> {
        Ok(self.store.list_all(limit).await?)
    }

    pub async fn list_by_status(&self, status: TaskStatus) -> Result<Vec<Task>, LifecycleError> {
        Ok(self.store.list_by_status(status).await?)
    }

    pub async fn delete(&self, id: TaskId) -> Result<bool, LifecycleError> {
        let lock = self.lock_for(id);
        let result = {
            let _guard = lock.lock().await;
            self.with_store_retry("delete", id, || self.store.delete(id))
                .await
        };
        self.release(id, lock);
        Ok(result?)
    }

    pub async fn sweep_expired(&self) -> Result<usize, LifecycleError> {
        let removed = self.store.sweep_expired().await?;
        if removed > 0 {
            tracing::info!(removed, "Swept expired tasks");
        }
        Ok(removed)
    }

    pub async fn size_bytes(&self) -> Result<usize, LifecycleError> {
        Ok(self.store.size_bytes().await?)
    }
}
