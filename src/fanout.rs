//! Fan-out coordinator: N concurrent sub-jobs, K-of-N aggregation.
//!
//! Each sub-job runs on its own tokio task. Outcomes are consumed in completion
//! order so pollers see partial progress, but the aggregate decision is only
//! made once every sub-job has settled.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::task::JoinHandle;

use crate::executor::SubJobExecutor;
use crate::lifecycle::{AttemptRef, LifecycleError, TaskLifecycleManager};
use crate::task::{SubJobOutcome, SubJobResult};

/// Progress reported once processing has started.
pub const PROGRESS_BASE: u8 = 10;
/// Progress spread across sub-job completions.
pub const PROGRESS_BUDGET: u8 = 85;

const PANIC_REASON: &str = "sub-job panicked";
const INTERNAL_ERROR_REASON: &str = "internal error: fan-out aborted";

/// How a fan-out run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FanOutOutcome {
    /// At least K sub-jobs succeeded and the task was completed.
    Completed { results: usize, failures: usize },
    /// Fewer than K sub-jobs succeeded and the task was failed.
    Failed { reason: String },
    /// The task vanished or moved to another attempt; nothing was written.
    Abandoned { reason: String },
}

/// Progress after `completed` of `width` sub-jobs have settled.
pub fn progress_for(completed: usize, width: usize) -> u8 {
    let width = width.max(1);
    let share = completed.min(width) * PROGRESS_BUDGET as usize / width;
    PROGRESS_BASE + share as u8
}

/// Group failure reasons into a single message, e.g. `timeout x2; Server error (HTTP 503)`.
fn summarize_failures(failures: &[&str]) -> String {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for reason in failures.iter().copied() {
        *counts.entry(reason).or_default() += 1;
    }
    counts
        .into_iter()
        .map(|(reason, n)| {
            if n > 1 {
                format!("{} x{}", reason, n)
            } else {
                reason.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("; ")
}

pub struct FanOutCoordinator {
    lifecycle: Arc<TaskLifecycleManager>,
    executor: Arc<dyn SubJobExecutor>,
}

impl FanOutCoordinator {
    pub fn new(lifecycle: Arc<TaskLifecycleManager>, executor: Arc<dyn SubJobExecutor>) -> Self {
        Self {
            lifecycle,
            executor,
        }
    }

    pub fn lifecycle(&self) -> &Arc<TaskLifecycleManager> {
        &self.lifecycle
    }

    /// Run the fan-out for one attempt of a task to completion.
    pub async fn run(&self, attempt: AttemptRef) -> FanOutOutcome {
        let id = attempt.id;
        let Some(task) = self.lifecycle.get(id).await else {
            return FanOutOutcome::Abandoned {
                reason: "task not found".to_string(),
            };
        };
        if let Err(e) = self.lifecycle.begin_attempt(attempt).await {
            tracing::warn!(task_id = %id, attempt = attempt.attempt, "Fan-out not started: {}", e);
            return FanOutOutcome::Abandoned {
                reason: e.to_string(),
            };
        }

        let request = Arc::new(task.request);
        let width = request.fan_out_width;
        let min_success = request.min_success.clamp(1, width);
        tracing::info!(
            task_id = %id,
            attempt = attempt.attempt,
            width,
            min_success,
            "Fan-out started"
        );

        let mut pending: FuturesUnordered<_> = (0..width)
            .map(|index| {
                let executor = Arc::clone(&self.executor);
                let request = Arc::clone(&request);
                let handle = tokio::spawn(async move { executor.execute(&request, index).await });
                async move {
                    let outcome = match handle.await {
                        Ok(outcome) => outcome,
                        Err(e) if e.is_panic() => SubJobOutcome::Failure(PANIC_REASON.to_string()),
                        Err(e) => SubJobOutcome::Failure(format!("sub-job aborted: {}", e)),
                    };
                    SubJobResult { index, outcome }
                }
            })
            .collect();

        let mut settled: Vec<SubJobResult> = Vec::with_capacity(width);
        while let Some(result) = pending.next().await {
            let success = match &result.outcome {
                SubJobOutcome::Success(result_ref) => Some(result_ref.clone()),
                SubJobOutcome::Failure(reason) => {
                    tracing::debug!(task_id = %id, variant = result.index, reason = %reason, "Sub-job failed");
                    None
                }
            };
            settled.push(result);
            let progress = progress_for(settled.len(), width);
            if let Err(e) = self
                .lifecycle
                .record_attempt_progress(attempt, progress, success)
                .await
            {
                match e {
                    LifecycleError::QuotaExceeded { .. } => {
                        tracing::warn!(task_id = %id, progress, "Progress not recorded: {}", e)
                    }
                    _ => tracing::debug!(task_id = %id, progress, "Progress not recorded: {}", e),
                }
            }
        }

        settled.sort_by_key(|r| r.index);
        let mut successes = Vec::new();
        let mut failures = Vec::new();
        for result in &settled {
            match &result.outcome {
                SubJobOutcome::Success(result_ref) => successes.push(result_ref.clone()),
                SubJobOutcome::Failure(reason) => failures.push(reason.as_str()),
            }
        }

        if successes.len() >= min_success {
            let results = successes.len();
            match self.lifecycle.complete_attempt(attempt, successes).await {
                Ok(_) => FanOutOutcome::Completed {
                    results,
                    failures: failures.len(),
                },
                Err(LifecycleError::QuotaExceeded { size, budget, .. }) => {
                    let reason = format!(
                        "results exceed the store's size budget ({} bytes, limit {})",
                        size, budget
                    );
                    self.fail_with(attempt, reason).await
                }
                Err(e) => Self::abandoned(attempt, e),
            }
        } else {
            let reason = format!(
                "only {} of {} variants succeeded ({} required): {}",
                successes.len(),
                width,
                min_success,
                summarize_failures(&failures)
            );
            self.fail_with(attempt, reason).await
        }
    }

    async fn fail_with(&self, attempt: AttemptRef, reason: String) -> FanOutOutcome {
        match self.lifecycle.fail_attempt(attempt, reason.clone()).await {
            Ok(_) => FanOutOutcome::Failed { reason },
            Err(e) => Self::abandoned(attempt, e),
        }
    }

    fn abandoned(attempt: AttemptRef, e: LifecycleError) -> FanOutOutcome {
        tracing::warn!(
            task_id = %attempt.id,
            attempt = attempt.attempt,
            "Fan-out result discarded: {}",
            e
        );
        FanOutOutcome::Abandoned {
            reason: e.to_string(),
        }
    }

    /// Run a fan-out in the background under a supervisor.
    ///
    /// If the run itself panics, the attempt is failed with an internal-error reason.
    pub fn spawn(self: &Arc<Self>, attempt: AttemptRef) -> JoinHandle<FanOutOutcome> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let worker = {
                let coordinator = Arc::clone(&coordinator);
                tokio::spawn(async move { coordinator.run(attempt).await })
            };
            match worker.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::error!(task_id = %attempt.id, "Fan-out supervisor caught failure: {}", e);
                    if let Err(fail_err) = coordinator
                        .lifecycle
                        .fail_attempt(attempt, INTERNAL_ERROR_REASON)
                        .await
                    {
                        tracing::warn!(task_id = %attempt.id, "Could not fail aborted task: {}", fail_err);
                    }
                    FanOutOutcome::Failed {
                        reason: INTERNAL_ERROR_REASON.to_string(),
                    }
                }
            }
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::store::{EvictionPolicy, FileTaskStore, InMemoryTaskStore};
    use crate::task::{TaskRequest, TaskStatus};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::time::Duration;

    /// What a scripted sub-job does.
    #[derive(Clone)]
    pub(crate) enum Step {
        Succeed(u64),
        Fail(u64, &'static str),
        Panic,
    }

    /// Executor that follows a per-variant script; unscripted variants succeed immediately.
    pub(crate) struct ScriptedExecutor {
        pub(crate) steps: HashMap<usize, Step>,
    }

    impl ScriptedExecutor {
        pub(crate) fn new(steps: Vec<(usize, Step)>) -> Arc<Self> {
            Arc::new(Self {
                steps: steps.into_iter().collect(),
            })
        }
    }

    #[async_trait]
    impl SubJobExecutor for ScriptedExecutor {
        async fn execute(&self, request: &TaskRequest, variant_index: usize) -> SubJobOutcome {
            match self.steps.get(&variant_index).cloned().unwrap_or(Step::Succeed(0)) {
                Step::Succeed(ms) => {
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    SubJobOutcome::Success(format!("img://{}/{}", request.prompt, variant_index))
                }
                Step::Fail(ms, reason) => {
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    SubJobOutcome::Failure(reason.to_string())
                }
                Step::Panic => panic!("scripted sub-job panic"),
            }
        }
    }

    fn coordinator(executor: Arc<ScriptedExecutor>) -> Arc<FanOutCoordinator> {
        let store = Arc::new(InMemoryTaskStore::new(100, Duration::from_secs(1800)));
        let lifecycle = Arc::new(TaskLifecycleManager::new(store, 2));
        Arc::new(FanOutCoordinator::new(lifecycle, executor))
    }

    async fn submit(c: &FanOutCoordinator, width: usize, k: usize) -> AttemptRef {
        let task = c
            .lifecycle
            .create(TaskRequest::new("fox", width).with_min_success(k))
            .await
            .unwrap();
        AttemptRef::of(&task)
    }

    #[test]
    fn progress_formula_spans_base_to_95() {
        assert_eq!(progress_for(0, 3), 10);
        assert_eq!(progress_for(1, 3), 38);
        assert_eq!(progress_for(2, 3), 66);
        assert_eq!(progress_for(3, 3), 95);
    }

    #[tokio::test]
    async fn all_succeed_results_sorted_by_variant() {
        let c = coordinator(ScriptedExecutor::new(vec![
            (0, Step::Succeed(30)),
            (1, Step::Succeed(10)),
            (2, Step::Succeed(20)),
        ]));
        let attempt = submit(&c, 3, 2).await;

        let outcome = c.run(attempt).await;

        assert_eq!(
            outcome,
            FanOutOutcome::Completed {
                results: 3,
                failures: 0
            }
        );
        let task = c.lifecycle.get(attempt.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.progress, 100);
        assert_eq!(task.results, vec!["img://fox/0", "img://fox/1", "img://fox/2"]);
    }

    #[tokio::test]
    async fn one_failure_still_meets_threshold() {
        let c = coordinator(ScriptedExecutor::new(vec![(1, Step::Fail(5, "timeout"))]));
        let attempt = submit(&c, 3, 2).await;

        let outcome = c.run(attempt).await;

        assert_eq!(
            outcome,
            FanOutOutcome::Completed {
                results: 2,
                failures: 1
            }
        );
        let task = c.lifecycle.get(attempt.id).await.unwrap();
        assert_eq!(task.results, vec!["img://fox/0", "img://fox/2"]);
    }

    #[tokio::test]
    async fn too_few_successes_fail_with_summary() {
        let c = coordinator(ScriptedExecutor::new(vec![
            (0, Step::Fail(5, "timeout")),
            (2, Step::Fail(10, "timeout")),
        ]));
        let attempt = submit(&c, 3, 2).await;

        let outcome = c.run(attempt).await;

        let FanOutOutcome::Failed { reason } = outcome else {
            panic!("expected failure, got {:?}", outcome);
        };
        assert!(reason.contains("only 1 of 3"));
        assert!(reason.contains("timeout x2"));
        let task = c.lifecycle.get(attempt.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.progress, 100);
        assert!(task.results.is_empty());
        assert_eq!(task.error_message.as_deref(), Some(reason.as_str()));
    }

    #[tokio::test]
    async fn panicking_sub_job_is_counted_not_propagated() {
        let c = coordinator(ScriptedExecutor::new(vec![(1, Step::Panic)]));
        let attempt = submit(&c, 3, 2).await;

        let outcome = c.run(attempt).await;

        assert_eq!(
            outcome,
            FanOutOutcome::Completed {
                results: 2,
                failures: 1
            }
        );
    }

    #[tokio::test]
    async fn single_variant_degenerates_to_one_job() {
        let c = coordinator(ScriptedExecutor::new(vec![(0, Step::Fail(0, "Client error (HTTP 400)"))]));
        let attempt = submit(&c, 1, 1).await;

        let outcome = c.spawn(attempt).await.unwrap();

        assert!(matches!(outcome, FanOutOutcome::Failed { .. }));
    }

    /// Returns inline data URLs of a fixed payload size.
    struct LargeResultExecutor(usize);

    #[async_trait]
    impl SubJobExecutor for LargeResultExecutor {
        async fn execute(&self, _request: &TaskRequest, variant_index: usize) -> SubJobOutcome {
            SubJobOutcome::Success(format!(
                "data:image/png;base64,{}{}",
                variant_index,
                "A".repeat(self.0)
            ))
        }
    }

    #[tokio::test]
    async fn results_over_store_budget_fail_the_task() {
        let dir = tempfile::tempdir().unwrap();
        let policy = EvictionPolicy {
            hard_cap_bytes: 8000,
            ..Default::default()
        };
        let store = Arc::new(
            FileTaskStore::new(dir.path().to_path_buf(), Duration::from_secs(1800), policy)
                .await
                .unwrap(),
        );
        let lifecycle = Arc::new(TaskLifecycleManager::new(store, 2));
        let c = Arc::new(FanOutCoordinator::new(
            lifecycle,
            Arc::new(LargeResultExecutor(3000)),
        ));
        let attempt = submit(&c, 3, 2).await;

        let outcome = c.run(attempt).await;

        let FanOutOutcome::Failed { reason } = outcome else {
            panic!("expected failure, got {:?}", outcome);
        };
        assert!(reason.contains("size budget"));
        let task = c.lifecycle.get(attempt.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.results.is_empty());
        assert_eq!(task.error_message.as_deref(), Some(reason.as_str()));
    }

    #[tokio::test]
    async fn superseded_attempt_is_abandoned() {
        let c = coordinator(ScriptedExecutor::new(vec![]));
        let attempt = submit(&c, 2, 1).await;
        c.lifecycle.fail(attempt.id, "stalled").await.unwrap();
        c.lifecycle.retry(attempt.id).await.unwrap();

        let outcome = c.run(attempt).await;

        assert!(matches!(outcome, FanOutOutcome::Abandoned { .. }));
        let task = c.lifecycle.get(attempt.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.attempt, 1);
    }
}
