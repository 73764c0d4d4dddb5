//! Core Task type and its lifecycle transitions.
//!
//! # State Machine
//! ```text
//! Pending -> Processing -> Completed
//!    |            \-> Failed -> Pending   (authorized retry only)
//!    \-> Failed
//! ```
//!
//! # Invariants
//! - `results.len() <= request.fan_out_width`
//! - `progress == 100` iff the status is terminal (`Completed` or `Failed`)
//! - `status == Completed` implies `results.len() >= request.min_success`
//! - within one attempt `progress` never decreases
//! - `error_message` is only set while `Failed`

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::request::TaskRequest;

/// Highest progress value a task can report while work is still pending.
pub const PARTIAL_PROGRESS_CAP: u8 = 99;

/// Unique identifier for a task.
///
/// # Properties
/// - Generated at submission time, never reused
/// - Immutable once created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// Status of a task in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Created, waiting for the fan-out to start
    Pending,
    /// Sub-jobs are in flight
    Processing,
    /// Enough sub-jobs succeeded
    Completed,
    /// Too few sub-jobs succeeded, or the task stalled
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "processing" => Ok(TaskStatus::Processing),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(TaskError::UnknownStatus(other.to_string())),
        }
    }
}

/// Outcome of one sub-job. Failures are values, never panics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubJobOutcome {
    Success(String),
    Failure(String),
}

impl SubJobOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, SubJobOutcome::Success(_))
    }
}

/// One settled sub-job, tagged with its variant index. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubJobResult {
    pub index: usize,
    pub outcome: SubJobOutcome,
}

/// The unit of orchestration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub status: TaskStatus,
    pub progress: u8,
    pub request: TaskRequest,
    #[serde(default)]
    pub results: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Create a fresh `Pending` task.
    ///
    /// # Postcondition
    /// `status == Pending`, `progress == 0`, `attempt == 0`, no results.
    pub fn new(request: TaskRequest) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new(),
            status: TaskStatus::Pending,
            progress: 0,
            request,
            results: Vec::new(),
            error_message: None,
            attempt: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    fn invalid(&self, to: &str) -> TaskError {
        TaskError::InvalidTransition {
            from: self.status.to_string(),
            to: to.to_string(),
        }
    }

    /// Whether `now - updated_at` exceeds `threshold`.
    pub fn is_stale(&self, now: DateTime<Utc>, threshold: std::time::Duration) -> bool {
        crate::util::elapsed_std(now - self.updated_at) > threshold
    }

    /// Whether the task's age exceeds `ttl`.
    pub fn is_expired(&self, now: DateTime<Utc>, ttl: std::time::Duration) -> bool {
        crate::util::elapsed_std(now - self.created_at) > ttl
    }

    /// Transition `Pending -> Processing`.
    ///
    /// Returns `Ok(false)` without touching the record when already `Processing`.
    pub fn begin_processing(&mut self) -> Result<bool, TaskError> {
        match self.status {
            TaskStatus::Pending => {
                self.status = TaskStatus::Processing;
                self.touch();
                Ok(true)
            }
            TaskStatus::Processing => Ok(false),
            _ => Err(self.invalid("processing")),
        }
    }

    /// Record partial progress and an optional result while `Processing`.
    ///
    /// Progress only rises and stays below 100 until a terminal transition.
    pub fn record_progress(&mut self, progress: u8, result: Option<String>) -> Result<(), TaskError> {
        if self.status != TaskStatus::Processing {
            return Err(self.invalid("processing"));
        }
        if let Some(result) = result {
            if self.results.len() >= self.request.fan_out_width {
                return Err(TaskError::ResultBoundExceeded {
                    width: self.request.fan_out_width,
                });
            }
            self.results.push(result);
        }
        self.progress = self.progress.max(progress.min(PARTIAL_PROGRESS_CAP));
        self.touch();
        Ok(())
    }

    /// Transition `Processing -> Completed` with the final results.
    ///
    /// # Errors
    /// Fails if not `Processing`, or if fewer than `min_success` results are given.
    pub fn complete(&mut self, mut results: Vec<String>) -> Result<(), TaskError> {
        if self.status != TaskStatus::Processing {
            return Err(self.invalid("completed"));
        }
        results.truncate(self.request.fan_out_width);
        if results.len() < self.request.min_success {
            return Err(TaskError::BelowThreshold {
                got: results.len(),
                required: self.request.min_success,
            });
        }
        self.results = results;
        self.status = TaskStatus::Completed;
        self.progress = 100;
        self.error_message = None;
        self.touch();
        Ok(())
    }

    /// Transition `Pending | Processing -> Failed`.
    ///
    /// Partial results are discarded and progress is forced to 100.
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<(), TaskError> {
        if self.status.is_terminal() {
            return Err(self.invalid("failed"));
        }
        self.status = TaskStatus::Failed;
        self.error_message = Some(reason.into());
        self.results.clear();
        self.progress = 100;
        self.touch();
        Ok(())
    }

    /// Transition `Failed -> Pending` for a fresh attempt.
    ///
    /// Returns `Ok(false)` and leaves the task untouched once `attempt >= max_attempts`.
    pub fn retry(&mut self, max_attempts: u32) -> Result<bool, TaskError> {
        if self.status != TaskStatus::Failed {
            return Err(self.invalid("pending"));
        }
        if self.attempt >= max_attempts {
            return Ok(false);
        }
        self.attempt += 1;
        self.results.clear();
        self.error_message = None;
        self.progress = 0;
        self.status = TaskStatus::Pending;
        self.touch();
        Ok(true)
    }

    /// Drop large binary request fields. Returns whether anything was removed.
    pub fn strip_binary_payload(&mut self) -> bool {
        self.request.reference_image.take().is_some()
    }

    /// Public view of the task for status queries.
    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            task_id: self.id.to_string(),
            status: self.status,
            progress: self.progress,
            results: self.results.clone(),
            error_message: self.error_message.clone(),
            attempt: self.attempt,
            fan_out_width: self.request.fan_out_width,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Public, serializable view of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSnapshot {
    pub task_id: String,
    pub status: TaskStatus,
    pub progress: u8,
    #[serde(default)]
    pub results: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub attempt: u32,
    #[serde(default)]
    pub fan_out_width: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Errors that can occur during task transitions.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Result bound exceeded: task already holds {width} results")]
    ResultBoundExceeded { width: usize },

    #[error("Only {got} results, {required} required to complete")]
    BelowThreshold { got: usize, required: usize },

    #[error("Unknown task status: {0}")]
    UnknownStatus(String),
}
