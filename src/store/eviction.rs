//! Size-aware eviction for the persisted task cache.
//!
//! Applied in order before every write:
//! 1. terminal tasks past their grace window
//! 2. oldest tasks beyond the soft count cap
//! 3. reference images of non-active tasks, then everything but the most recent
//! 4. a record set still over the byte budget is rejected

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::StoreError;
use crate::task::{Task, TaskId, TaskStatus};
use crate::util::elapsed_std;

/// Limits applied by the file store.
#[derive(Debug, Clone)]
pub struct EvictionPolicy {
    /// Completed tasks older than this are dropped
    pub completed_grace: Duration,
    /// Failed tasks older than this are dropped
    pub failed_grace: Duration,
    /// Maximum number of tasks kept before the oldest are dropped
    pub soft_cap: usize,
    /// Byte budget for the serialized record set
    pub hard_cap_bytes: usize,
    /// Tasks kept when stripping reference images is not enough
    pub keep_recent: usize,
}

impl Default for EvictionPolicy {
    fn default() -> Self {
        Self {
            completed_grace: Duration::from_secs(10 * 60),
            failed_grace: Duration::from_secs(5 * 60),
            soft_cap: 5,
            hard_cap_bytes: 5 * 1024 * 1024,
            keep_recent: 3,
        }
    }
}

/// What a single eviction pass removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionReport {
    pub expired: usize,
    pub over_cap: usize,
    pub stripped: usize,
    pub trimmed: usize,
}

impl EvictionReport {
    pub fn removed(&self) -> usize {
        self.expired + self.over_cap + self.trimmed
    }
}

/// Serialized size of a single record, as the file store would write it.
pub fn record_size(task: &Task) -> Result<usize, StoreError> {
    Ok(serde_json::to_vec(task)?.len())
}

/// Serialized size of a record set.
pub fn total_size(tasks: &HashMap<TaskId, Task>) -> Result<usize, StoreError> {
    tasks.values().map(record_size).sum()
}

/// Task ids ordered newest `created_at` first.
fn newest_first(tasks: &HashMap<TaskId, Task>) -> Vec<TaskId> {
    let mut ids: Vec<(DateTime<Utc>, TaskId)> =
        tasks.values().map(|t| (t.created_at, t.id)).collect();
    ids.sort_by(|a, b| b.cmp(a));
    ids.into_iter().map(|(_, id)| id).collect()
}

impl EvictionPolicy {
    fn past_grace(&self, task: &Task, now: DateTime<Utc>) -> bool {
        let age = elapsed_std(now - task.updated_at);
        match task.status {
            TaskStatus::Completed => age > self.completed_grace,
            TaskStatus::Failed => age > self.failed_grace,
            _ => false,
        }
    }

    /// Bring `tasks` within the policy limits.
    ///
    /// # Errors
    /// `StoreError::QuotaExceeded` when the remaining records still exceed the byte budget.
    pub fn apply(
        &self,
        tasks: &mut HashMap<TaskId, Task>,
        now: DateTime<Utc>,
    ) -> Result<EvictionReport, StoreError> {
        let mut report = EvictionReport::default();

        let before = tasks.len();
        tasks.retain(|_, task| !self.past_grace(task, now));
        report.expired = before - tasks.len();

        if tasks.len() > self.soft_cap {
            for id in newest_first(tasks).into_iter().skip(self.soft_cap) {
                tasks.remove(&id);
                report.over_cap += 1;
            }
        }

        if total_size(tasks)? <= self.hard_cap_bytes {
            return Ok(report);
        }

        for task in tasks.values_mut().filter(|t| t.status.is_terminal()) {
            if task.strip_binary_payload() {
                report.stripped += 1;
            }
        }

        if total_size(tasks)? > self.hard_cap_bytes {
            for id in newest_first(tasks).into_iter().skip(self.keep_recent) {
                tasks.remove(&id);
                report.trimmed += 1;
            }
        }

        let size = total_size(tasks)?;
        if size > self.hard_cap_bytes {
            return Err(StoreError::QuotaExceeded {
                size,
                budget: self.hard_cap_bytes,
            });
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{ReferenceImage, TaskRequest};

    fn task_created(minutes_ago: i64, now: DateTime<Utc>) -> Task {
        let mut task = Task::new(TaskRequest::new("a fox", 3));
        task.created_at = now - chrono::Duration::minutes(minutes_ago);
        task.updated_at = task.created_at;
        task
    }

    fn map(tasks: Vec<Task>) -> HashMap<TaskId, Task> {
        tasks.into_iter().map(|t| (t.id, t)).collect()
    }

    #[test]
    fn drops_terminal_tasks_past_grace() {
        let now = Utc::now();
        let mut done = task_created(12, now);
        done.status = TaskStatus::Completed;
        let mut failed_recent = task_created(3, now);
        failed_recent.status = TaskStatus::Failed;
        let mut failed_old = task_created(6, now);
        failed_old.status = TaskStatus::Failed;
        let active = task_created(20, now);
        let active_id = active.id;
        let recent_id = failed_recent.id;

        let mut tasks = map(vec![done, failed_recent, failed_old, active]);
        let report = EvictionPolicy::default().apply(&mut tasks, now).unwrap();

        assert_eq!(report.expired, 2);
        assert!(tasks.contains_key(&active_id));
        assert!(tasks.contains_key(&recent_id));
    }

    #[test]
    fn soft_cap_evicts_oldest_by_creation() {
        let now = Utc::now();
        let tasks: Vec<Task> = (0..6).map(|i| task_created(i, now)).collect();
        let oldest = tasks[5].id;
        let mut tasks = map(tasks);

        let report = EvictionPolicy::default().apply(&mut tasks, now).unwrap();

        assert_eq!(report.over_cap, 1);
        assert_eq!(tasks.len(), 5);
        assert!(!tasks.contains_key(&oldest));
    }

    #[test]
    fn strips_images_from_finished_tasks_before_trimming() {
        let now = Utc::now();
        let image = ReferenceImage::new(vec![7u8; 4096], "ref.png");
        let mut finished = task_created(1, now);
        finished.request = finished.request.with_reference_image(image.clone());
        finished.status = TaskStatus::Completed;
        let mut active = task_created(2, now);
        active.request = active.request.with_reference_image(image);
        let (finished_id, active_id) = (finished.id, active.id);

        let mut tasks = map(vec![finished, active]);
        let budget = record_size(&tasks[&active_id]).unwrap() + 2048;
        let policy = EvictionPolicy {
            hard_cap_bytes: budget,
            ..Default::default()
        };

        let report = policy.apply(&mut tasks, now).unwrap();

        assert_eq!(report.stripped, 1);
        assert_eq!(report.trimmed, 0);
        assert!(tasks[&finished_id].request.reference_image.is_none());
        assert!(tasks[&active_id].request.reference_image.is_some());
    }

    #[test]
    fn oversized_single_record_is_rejected() {
        let now = Utc::now();
        let mut task = task_created(0, now);
        task.request = task
            .request
            .with_reference_image(ReferenceImage::new(vec![1u8; 8192], "big.png"));
        let mut tasks = map(vec![task]);
        let policy = EvictionPolicy {
            hard_cap_bytes: 1024,
            ..Default::default()
        };

        assert!(matches!(
            policy.apply(&mut tasks, now),
            Err(StoreError::QuotaExceeded { budget: 1024, .. })
        ));
    }
}
