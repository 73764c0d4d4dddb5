//! Polling client.
//!
//! Submits a task, then polls its status until it reaches a terminal state,
//! the client-side wall-clock budget runs out, or the caller cancels. A
//! cancelled or timed-out wait only stops *this* client: the task keeps
//! running on the orchestrator and can be picked up again with [`PollingClient::wait`].
//!
//! Transports implement [`TaskApi`]:
//! - [`HttpTaskApi`] talks to a running server over HTTP
//! - [`Orchestrator`](crate::orchestrator::Orchestrator) serves the same calls in-process

mod http;
mod local;

pub use http::HttpTaskApi;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::task::{TaskId, TaskRequest, TaskSnapshot, TaskStatus};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PollError {
    /// Network or server-side failure; worth retrying
    #[error("Transport error: {0}")]
    Transport(String),

    /// The task is unknown or has expired
    #[error("Task not found or expired: {0}")]
    NotFound(TaskId),

    /// The server refused the request as invalid
    #[error("Request rejected: {0}")]
    Rejected(String),
}

/// Transport to an orchestrator.
#[async_trait]
pub trait TaskApi: Send + Sync {
    async fn submit(&self, request: &TaskRequest) -> Result<TaskId, PollError>;

    /// `Ok(None)` when the task is unknown or expired.
    async fn fetch(&self, id: TaskId) -> Result<Option<TaskSnapshot>, PollError>;
}

#[derive(Debug, Clone)]
pub struct PollConfig {
    /// Delay between status polls
    pub interval: Duration,
    /// Client-side wall-clock budget for one wait
    pub max_wait: Duration,
    /// Transport retries per poll before giving up
    pub max_transport_retries: u32,
    /// First backoff delay; doubled per retry, plus jitter
    pub retry_base_delay: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            max_wait: Duration::from_secs(5 * 60),
            max_transport_retries: 3,
            retry_base_delay: Duration::from_millis(500),
        }
    }
}

/// How a wait ended. Carries the last snapshot seen where one exists.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    Completed(TaskSnapshot),
    Failed(TaskSnapshot),
    /// The orchestrator no longer knows the task; resubmit
    Expired,
    TimedOut(Option<TaskSnapshot>),
    Cancelled(Option<TaskSnapshot>),
    /// Transport retries ran out
    Unreachable(String),
}

impl PollOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, PollOutcome::Completed(_))
    }
}

pub struct PollingClient {
    api: Arc<dyn TaskApi>,
    config: PollConfig,
}

impl PollingClient {
    pub fn new(api: Arc<dyn TaskApi>, config: PollConfig) -> Self {
        Self { api, config }
    }

    /// Submit a task. Not retried, a resubmission would create a second task.
    pub async fn submit(&self, request: &TaskRequest) -> Result<TaskId, PollError> {
        let id = self.api.submit(request).await?;
        tracing::info!(task_id = %id, "Task submitted");
        Ok(id)
    }

    /// Fetch the current snapshot, retrying transport errors with backoff.
    pub async fn poll(&self, id: TaskId) -> Result<TaskSnapshot, PollError> {
        let mut retries = 0;
        loop {
            match self.api.fetch(id).await {
                Ok(Some(snapshot)) => return Ok(snapshot),
                Ok(None) => return Err(PollError::NotFound(id)),
                Err(PollError::Transport(message))
                    if retries < self.config.max_transport_retries =>
                {
                    let delay = backoff_delay(self.config.retry_base_delay, retries);
                    retries += 1;
                    tracing::debug!(
                        task_id = %id,
                        retry = retries,
                        delay_ms = delay.as_millis() as u64,
                        "Poll failed, retrying: {}",
                        message
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Poll until the task settles, the budget runs out or `cancel` fires.
    ///
    /// The first poll happens immediately. `on_update` sees every snapshot.
    pub async fn wait<F>(&self, id: TaskId, cancel: &CancellationToken, mut on_update: F) -> PollOutcome
    where
        F: FnMut(&TaskSnapshot),
    {
        let deadline = Instant::now() + self.config.max_wait;
        let mut last: Option<TaskSnapshot> = None;

        loop {
            let polled = tokio::select! {
                biased;
                _ = cancel.cancelled() => return PollOutcome::Cancelled(last),
                polled = self.poll(id) => polled,
            };

            match polled {
                Ok(snapshot) => {
                    on_update(&snapshot);
                    match snapshot.status {
                        TaskStatus::Completed => return PollOutcome::Completed(snapshot),
                        TaskStatus::Failed => return PollOutcome::Failed(snapshot),
                        TaskStatus::Pending | TaskStatus::Processing => last = Some(snapshot),
                    }
                }
                Err(PollError::NotFound(_)) => {
                    tracing::warn!(task_id = %id, "Task expired while polling");
                    return PollOutcome::Expired;
                }
                Err(e) => return PollOutcome::Unreachable(e.to_string()),
            }

            let now = Instant::now();
            if now >= deadline {
                tracing::warn!(task_id = %id, "Client wait budget exhausted");
                return PollOutcome::TimedOut(last);
            }
            let pause = self.config.interval.min(deadline - now);

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return PollOutcome::Cancelled(last),
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }

    /// Submit, then wait for the result.
    pub async fn submit_and_wait<F>(
        &self,
        request: &TaskRequest,
        cancel: &CancellationToken,
        on_update: F,
    ) -> Result<(TaskId, PollOutcome), PollError>
    where
        F: FnMut(&TaskSnapshot),
    {
        let id = self.submit(request).await?;
        let outcome = self.wait(id, cancel, on_update).await;
        Ok((id, outcome))
    }
}

/// Exponential backoff with up to 50% random jitter.
fn backoff_delay(base: Duration, retry: u32) -> Duration {
    let exp = base.saturating_mul(2u32.saturating_pow(retry.min(6)));
    let spread = (exp.as_millis() as u64) / 2;
    let jitter = if spread == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=spread)
    };
    exp + Duration::from_millis(jitter)
}
