//! The orchestrator facade: validated submission, status lookups and the
//! background loops (stall monitor and expiry sweeper).
//!
//! ```text
//! submit ──► TaskLifecycleManager::create ──► FanOutCoordinator::spawn
//!                                                   │
//!                          N x SubJobExecutor ◄─────┘
//! status ──► TaskLifecycleManager::get ──► TaskSnapshot | NotFound
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, OrchestratorConfig};
use crate::executor::{HttpImageProvider, ProviderExecutor, SubJobExecutor};
use crate::fanout::FanOutCoordinator;
use crate::lifecycle::{AttemptRef, LifecycleError, TaskLifecycleManager};
use crate::monitor::{ScanReport, TimeoutRetryMonitor};
use crate::store::{create_task_store, StoreError, TaskStore};
use crate::task::{RequestError, TaskId, TaskRequest, TaskSnapshot, TaskStatus};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    InvalidRequest(#[from] RequestError),

    #[error("Task not found: {0}")]
    NotFound(TaskId),

    #[error("Task {id} cannot be retried: {reason}")]
    NotRetryable { id: TaskId, reason: String },

    #[error("Task store unavailable: {0}")]
    Unavailable(String),
}

impl From<LifecycleError> for OrchestratorError {
    fn from(e: LifecycleError) -> Self {
        match e {
            LifecycleError::NotFound(id) => OrchestratorError::NotFound(id),
            LifecycleError::StaleAttempt { id, .. } => OrchestratorError::NotRetryable {
                id,
                reason: e.to_string(),
            },
            other => OrchestratorError::Unavailable(other.to_string()),
        }
    }
}

/// Answer to a successful submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub suggested_poll_interval: Duration,
}

/// Result of a status query. Not found means expired or evicted, never failed.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusLookup {
    Found(TaskSnapshot),
    NotFound,
}

/// Task counts per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStats {
    pub total: usize,
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub store_bytes: usize,
    pub persistent: bool,
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    lifecycle: Arc<TaskLifecycleManager>,
    coordinator: Arc<FanOutCoordinator>,
    monitor: Arc<TimeoutRetryMonitor>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        store: Arc<dyn TaskStore>,
        executor: Arc<dyn SubJobExecutor>,
    ) -> Self {
        let lifecycle = Arc::new(TaskLifecycleManager::new(store, config.max_attempts));
        let coordinator = Arc::new(FanOutCoordinator::new(Arc::clone(&lifecycle), executor));
        let monitor = Arc::new(TimeoutRetryMonitor::new(
            Arc::clone(&coordinator),
            config.stall_threshold,
            config.monitor_interval,
        ));
        Self {
            config,
            lifecycle,
            coordinator,
            monitor,
        }
    }

    /// Wire the configured store and the HTTP image provider.
    pub async fn from_config(config: &Config) -> Result<Self, StoreError> {
        let store = create_task_store(&config.store).await?;
        let provider = Arc::new(HttpImageProvider::new(&config.provider));
        let executor = Arc::new(ProviderExecutor::new(
            provider,
            config.orchestrator.sub_job_timeout,
        ));
        Ok(Self::new(config.orchestrator.clone(), store, executor))
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Build a request with the configured default width and K.
    pub fn prepare(&self, prompt: impl Into<String>, width: Option<usize>) -> Result<TaskRequest, RequestError> {
        let width = width.unwrap_or(self.config.default_fan_out_width);
        if width == 0 || width > self.config.max_fan_out_width {
            return Err(RequestError::InvalidFanOutWidth {
                width,
                max: self.config.max_fan_out_width,
            });
        }
        Ok(TaskRequest::new(prompt, width).with_min_success(self.config.min_success_for(width)))
    }

    /// Validate, persist and dispatch a task. Returns as soon as the task is stored.
    pub async fn submit(&self, request: TaskRequest) -> Result<Submission, OrchestratorError> {
        request.validate(self.config.max_prompt_chars, self.config.max_fan_out_width)?;
        let task = self.lifecycle.create(request).await?;
        self.coordinator.spawn(AttemptRef::of(&task));
        Ok(Submission {
            task_id: task.id,
            status: task.status,
            suggested_poll_interval: self.config.suggested_poll_interval,
        })
    }

    pub async fn status(&self, id: TaskId) -> StatusLookup {
        match self.lifecycle.get(id).await {
            Some(task) => StatusLookup::Found(task.snapshot()),
            None => StatusLookup::NotFound,
        }
    }

    /// Manually retry a failed task and dispatch the new attempt.
    pub async fn retry(&self, id: TaskId) -> Result<TaskSnapshot, OrchestratorError> {
        let task = self
            .lifecycle
            .get(id)
            .await
            .ok_or(OrchestratorError::NotFound(id))?;
        if task.status != TaskStatus::Failed {
            return Err(OrchestratorError::NotRetryable {
                id,
                reason: format!("task is {}", task.status),
            });
        }
        let retried = self.lifecycle.retry(id).await.map_err(|e| match e {
            LifecycleError::Transition(t) => OrchestratorError::NotRetryable {
                id,
                reason: t.to_string(),
            },
            other => other.into(),
        })?;
        if !retried {
            return Err(OrchestratorError::NotRetryable {
                id,
                reason: format!("all {} attempts used", self.config.max_attempts),
            });
        }
        let task = self
            .lifecycle
            .get(id)
            .await
            .ok_or(OrchestratorError::NotFound(id))?;
        self.coordinator.spawn(AttemptRef::of(&task));
        Ok(task.snapshot())
    }

    pub async fn delete(&self, id: TaskId) -> Result<bool, OrchestratorError> {
        Ok(self.lifecycle.delete(id).await?)
    }

    pub async fn list(&self, limit: usize) -> Result<Vec<TaskSnapshot>, OrchestratorError> {
        let tasks = self.lifecycle.list(limit).await?;
        Ok(tasks.iter().map(|t| t.snapshot()).collect())
    }

    pub async fn stats(&self) -> Result<TaskStats, OrchestratorError> {
        let tasks = self.lifecycle.list(usize::MAX).await?;
        let mut stats = TaskStats {
            total: tasks.len(),
            store_bytes: self.lifecycle.size_bytes().await?,
            persistent: self.lifecycle.is_persistent(),
            ..Default::default()
        };
        for task in &tasks {
            match task.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::Processing => stats.processing += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }

    /// Run one stall scan now.
    pub async fn check_timeouts(&self) -> ScanReport {
        self.monitor.scan_at(Utc::now()).await
    }

    /// Start the stall monitor (if enabled) and the expiry sweeper.
    pub fn start_background(&self, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        if self.config.monitor_enabled {
            handles.push(tokio::spawn(
                Arc::clone(&self.monitor).run(cancel.clone()),
            ));
        } else {
            tracing::info!("Stall monitor disabled");
        }
        handles.push(tokio::spawn(sweep_loop(
            Arc::clone(&self.lifecycle),
            self.config.sweep_interval,
            cancel,
        )));
        handles
    }
}

async fn sweep_loop(lifecycle: Arc<TaskLifecycleManager>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = lifecycle.sweep_expired().await {
                    tracing::warn!("Expiry sweep failed: {}", e);
                }
            }
        }
    }
}
