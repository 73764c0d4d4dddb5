//! In-process transport: the orchestrator answers the client directly.

use async_trait::async_trait;

use super::{PollError, TaskApi};
use crate::orchestrator::{Orchestrator, OrchestratorError, StatusLookup};
use crate::task::{TaskId, TaskRequest, TaskSnapshot};

#[async_trait]
impl TaskApi for Orchestrator {
    async fn submit(&self, request: &TaskRequest) -> Result<TaskId, PollError> {
        match Orchestrator::submit(self, request.clone()).await {
            Ok(submission) => Ok(submission.task_id),
            Err(OrchestratorError::InvalidRequest(e)) => Err(PollError::Rejected(e.to_string())),
            Err(e) => Err(PollError::Transport(e.to_string())),
        }
    }

    async fn fetch(&self, id: TaskId) -> Result<Option<TaskSnapshot>, PollError> {
        match self.status(id).await {
            StatusLookup::Found(snapshot) => Ok(Some(snapshot)),
            StatusLookup::NotFound => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{PollConfig, PollOutcome, PollingClient};
    use crate::fanout::tests::Step;
    use crate::orchestrator::tests::orchestrator;
    use crate::task::TaskStatus;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn client(steps: Vec<(usize, Step)>) -> PollingClient {
        PollingClient::new(
            orchestrator(steps),
            PollConfig {
                interval: Duration::from_millis(10),
                max_wait: Duration::from_secs(5),
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn progress_is_monotonic_until_completion() {
        let client = client(vec![
            (0, Step::Succeed(20)),
            (1, Step::Succeed(60)),
            (2, Step::Succeed(100)),
        ]);
        let mut progress = Vec::new();

        let (_, outcome) = client
            .submit_and_wait(&TaskRequest::new("an owl", 3).with_min_success(2), &CancellationToken::new(), |s| {
                progress.push(s.progress)
            })
            .await
            .unwrap();

        assert!(outcome.is_success());
        assert!(progress.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(progress.last(), Some(&100));
    }

    #[tokio::test]
    async fn below_threshold_surfaces_as_failed() {
        let client = client(vec![(0, Step::Fail(5, "timeout")), (1, Step::Fail(5, "timeout"))]);

        let (_, outcome) = client
            .submit_and_wait(&TaskRequest::new("an owl", 3).with_min_success(2), &CancellationToken::new(), |_| {})
            .await
            .unwrap();

        match outcome {
            PollOutcome::Failed(snapshot) => {
                assert_eq!(snapshot.status, TaskStatus::Failed);
                assert!(snapshot.results.is_empty());
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn cancelled_wait_leaves_task_running() {
        let orchestrator = orchestrator(vec![(0, Step::Succeed(100))]);
        let client = PollingClient::new(orchestrator.clone(), PollConfig::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let (id, outcome) = client
            .submit_and_wait(&TaskRequest::new("an owl", 1), &cancel, |_| {})
            .await
            .unwrap();
        assert_eq!(outcome, PollOutcome::Cancelled(None));

        let resumed = PollingClient::new(
            orchestrator,
            PollConfig {
                interval: Duration::from_millis(10),
                ..Default::default()
            },
        );
        let outcome = resumed.wait(id, &CancellationToken::new(), |_| {}).await;
        assert!(outcome.is_success());
    }

    #[tokio::test]
    async fn empty_prompt_is_rejected() {
        let client = client(vec![]);
        assert!(matches!(
            client.submit(&TaskRequest::new("", 2)).await,
            Err(PollError::Rejected(_))
        ));
    }
}
