//! Stall detection and automatic retry for processing tasks.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::fanout::FanOutCoordinator;
use crate::lifecycle::AttemptRef;
use crate::task::{Task, TaskStatus};

const STALLED_REASON: &str = "stalled";

/// What one scan cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanReport {
    /// Processing tasks looked at
    pub scanned: usize,
    /// Stalled tasks failed, retried and re-dispatched
    pub retried: usize,
    /// Stalled tasks failed for good
    pub exhausted: usize,
    /// Stalled tasks that changed under us and were left alone
    pub skipped: usize,
}

pub struct TimeoutRetryMonitor {
    coordinator: Arc<FanOutCoordinator>,
    stall_threshold: Duration,
    interval: Duration,
}

impl TimeoutRetryMonitor {
    pub fn new(coordinator: Arc<FanOutCoordinator>, stall_threshold: Duration, interval: Duration) -> Self {
        Self {
            coordinator,
            stall_threshold,
            interval,
        }
    }

    /// Run one scan as of `now`.
    pub async fn scan_at(&self, now: DateTime<Utc>) -> ScanReport {
        let lifecycle = self.coordinator.lifecycle();
        let mut report = ScanReport::default();

        let tasks = match lifecycle.list_by_status(TaskStatus::Processing).await {
            Ok(tasks) => tasks,
            Err(e) => {
                tracing::warn!("Stall scan skipped, could not list tasks: {}", e);
                return report;
            }
        };

        for task in tasks {
            report.scanned += 1;
            if !task.is_stale(now, self.stall_threshold) {
                continue;
            }
            if task.attempt < lifecycle.max_attempts() {
                self.retry_stalled(&task, now, &mut report).await;
            } else {
                self.exhaust_stalled(&task, now, &mut report).await;
            }
        }

        if report.retried + report.exhausted + report.skipped > 0 {
            tracing::info!(
                scanned = report.scanned,
                retried = report.retried,
                exhausted = report.exhausted,
                skipped = report.skipped,
                "Stall scan finished"
            );
        }
        report
    }

    async fn retry_stalled(&self, task: &Task, now: DateTime<Utc>, report: &mut ScanReport) {
        let lifecycle = self.coordinator.lifecycle();
        let attempt = AttemptRef::of(task);

        match lifecycle
            .fail_stalled(attempt, self.stall_threshold, now, STALLED_REASON)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                report.skipped += 1;
                return;
            }
            Err(e) => {
                tracing::debug!(task_id = %task.id, "Lost race failing stalled task: {}", e);
                report.skipped += 1;
                return;
            }
        }

        match lifecycle.retry(task.id).await {
            Ok(true) => {
                let next = AttemptRef {
                    id: task.id,
                    attempt: attempt.attempt + 1,
                };
                tracing::warn!(
                    task_id = %task.id,
                    attempt = next.attempt,
                    "Stalled task re-dispatched"
                );
                self.coordinator.spawn(next);
                report.retried += 1;
            }
            Ok(false) => report.exhausted += 1,
            Err(e) => {
                tracing::debug!(task_id = %task.id, "Lost race retrying stalled task: {}", e);
                report.skipped += 1;
            }
        }
    }

    async fn exhaust_stalled(&self, task: &Task, now: DateTime<Utc>, report: &mut ScanReport) {
        let reason = format!("timeout after {} retries", task.attempt);
        match self
            .coordinator
            .lifecycle()
            .fail_stalled(AttemptRef::of(task), self.stall_threshold, now, &reason)
            .await
        {
            Ok(true) => {
                tracing::warn!(task_id = %task.id, attempt = task.attempt, "Stalled task out of retries");
                report.exhausted += 1;
            }
            Ok(false) => report.skipped += 1,
            Err(e) => {
                tracing::debug!(task_id = %task.id, "Lost race failing exhausted task: {}", e);
                report.skipped += 1;
            }
        }
    }

    /// Scan every `interval` until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(
            interval_secs = self.interval.as_secs(),
            stall_threshold_secs = self.stall_threshold.as_secs(),
            "Stall monitor started"
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.scan_at(Utc::now()).await;
                }
            }
        }
        tracing::info!("Stall monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fanout::tests::{ScriptedExecutor, Step};
    use crate::lifecycle::TaskLifecycleManager;
    use crate::store::InMemoryTaskStore;
    use crate::task::{TaskId, TaskRequest};

    const THRESHOLD: Duration = Duration::from_secs(120);

    fn monitor() -> (Arc<TaskLifecycleManager>, TimeoutRetryMonitor) {
        let store = Arc::new(InMemoryTaskStore::new(100, Duration::from_secs(1800)));
        let lifecycle = Arc::new(TaskLifecycleManager::new(store, 2));
        let coordinator = Arc::new(FanOutCoordinator::new(
            Arc::clone(&lifecycle),
            ScriptedExecutor::new(vec![(1, Step::Succeed(20))]),
        ));
        let monitor = TimeoutRetryMonitor::new(coordinator, THRESHOLD, Duration::from_secs(30));
        (lifecycle, monitor)
    }

    /// A processing task stuck at `attempt`, as if its fan-out died.
    async fn stuck_task(lifecycle: &TaskLifecycleManager, attempt: u32) -> TaskId {
        let task = lifecycle
            .create(TaskRequest::new("owl", 2).with_min_success(2))
            .await
            .unwrap();
        for _ in 0..attempt {
            lifecycle.fail(task.id, "stalled").await.unwrap();
            lifecycle.retry(task.id).await.unwrap();
        }
        lifecycle.begin_processing(task.id).await.unwrap();
        lifecycle
            .record_partial_progress(task.id, 52, Some("img://partial".into()))
            .await
            .unwrap();
        task.id
    }

    async fn wait_for_terminal(lifecycle: &TaskLifecycleManager, id: TaskId) -> Task {
        for _ in 0..200 {
            let task = lifecycle.get(id).await.unwrap();
            if task.status.is_terminal() {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {} never finished", id);
    }

    #[tokio::test]
    async fn fresh_tasks_are_left_alone() {
        let (lifecycle, monitor) = monitor();
        let id = stuck_task(&lifecycle, 0).await;

        let report = monitor.scan_at(Utc::now()).await;

        assert_eq!(
            report,
            ScanReport {
                scanned: 1,
                ..Default::default()
            }
        );
        assert_eq!(lifecycle.get(id).await.unwrap().progress, 52);
    }

    #[tokio::test]
    async fn stalled_task_is_retried_and_completes() {
        let (lifecycle, monitor) = monitor();
        let id = stuck_task(&lifecycle, 0).await;
        let later = Utc::now() + chrono::Duration::minutes(3);

        let report = monitor.scan_at(later).await;
        assert_eq!(report.retried, 1);

        let task = wait_for_terminal(&lifecycle, id).await;
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.attempt, 1);
        assert_eq!(task.results, vec!["img://owl/0", "img://owl/1"]);
    }

    #[tokio::test]
    async fn exhausted_task_fails_with_terminal_message() {
        let (lifecycle, monitor) = monitor();
        let id = stuck_task(&lifecycle, 2).await;
        let later = Utc::now() + chrono::Duration::minutes(3);

        let report = monitor.scan_at(later).await;
        assert_eq!(report.exhausted, 1);

        let task = lifecycle.get(id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.attempt, 2);
        assert_eq!(task.error_message.as_deref(), Some("timeout after 2 retries"));

        let again = monitor.scan_at(later + chrono::Duration::minutes(3)).await;
        assert_eq!(again.scanned, 0);
        assert!(!lifecycle.retry(id).await.unwrap());
    }

    #[tokio::test]
    async fn run_loop_stops_on_cancel() {
        let (_lifecycle, monitor) = monitor();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Arc::new(monitor).run(cancel.clone()));
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
