//! HTTP transport for the polling client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use url::Url;

use super::{PollError, TaskApi};
use crate::api::{ErrorResponse, SubmitTaskRequest, SubmitTaskResponse};
use crate::task::{TaskId, TaskRequest, TaskSnapshot};
use crate::util::truncate_for_log;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Talks to the `/api/tasks` routes of a running server.
pub struct HttpTaskApi {
    client: Client,
    base: Url,
}

impl HttpTaskApi {
    /// `base_url` is the server root, e.g. `http://127.0.0.1:3000`.
    pub fn new(base_url: &str) -> Result<Self, PollError> {
        let mut root = base_url.trim().trim_end_matches('/').to_string();
        root.push('/');
        let base = Url::parse(&root)
            .map_err(|e| PollError::Rejected(format!("Invalid server URL {}: {}", base_url, e)))?;
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| PollError::Transport(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client, base })
    }

    fn endpoint(&self, path: &str) -> Result<Url, PollError> {
        self.base
            .join(path)
            .map_err(|e| PollError::Rejected(format!("Invalid path {}: {}", path, e)))
    }
}

fn transport(e: reqwest::Error) -> PollError {
    if e.is_connect() {
        PollError::Transport(format!("Connection failed: {}", e))
    } else if e.is_timeout() {
        PollError::Transport(format!("Request timed out: {}", e))
    } else {
        PollError::Transport(format!("Request failed: {}", e))
    }
}

/// Prefer the server's `error` field, fall back to the raw body.
fn error_message(status: StatusCode, body: &str) -> String {
    match serde_json::from_str::<ErrorResponse>(body) {
        Ok(parsed) => parsed.error,
        Err(_) => format!("HTTP {}: {}", status.as_u16(), truncate_for_log(body, 200)),
    }
}

#[async_trait]
impl TaskApi for HttpTaskApi {
    async fn submit(&self, request: &TaskRequest) -> Result<TaskId, PollError> {
        let response = self
            .client
            .post(self.endpoint("api/tasks")?)
            .json(&SubmitTaskRequest::from_task_request(request))
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        let body = response.text().await.map_err(transport)?;
        if status.is_client_error() {
            return Err(PollError::Rejected(error_message(status, &body)));
        }
        if !status.is_success() {
            return Err(PollError::Transport(error_message(status, &body)));
        }

        let accepted: SubmitTaskResponse = serde_json::from_str(&body)
            .map_err(|e| PollError::Transport(format!("Malformed submit response: {}", e)))?;
        accepted
            .task_id
            .parse()
            .map_err(|_| PollError::Transport(format!("Malformed task id: {}", accepted.task_id)))
    }

    async fn fetch(&self, id: TaskId) -> Result<Option<TaskSnapshot>, PollError> {
        let response = self
            .client
            .get(self.endpoint(&format!("api/tasks/{}", id))?)
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body = response.text().await.map_err(transport)?;
        if !status.is_success() {
            return Err(PollError::Transport(error_message(status, &body)));
        }

        serde_json::from_str(&body)
            .map(Some)
            .map_err(|e| PollError::Transport(format!("Malformed task snapshot: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{router, AppState};
    use crate::client::{PollConfig, PollOutcome, PollingClient};
    use crate::config::{Config, ProviderConfig};
    use crate::fanout::tests::Step;
    use crate::orchestrator::tests::orchestrator;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    async fn spawn_server(steps: Vec<(usize, Step)>) -> String {
        let state = Arc::new(AppState {
            config: Config::new(ProviderConfig::default()),
            orchestrator: orchestrator(steps),
        });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(state)).await.unwrap();
        });
        format!("http://{}/", addr)
    }

    #[test]
    fn endpoints_join_under_the_base() {
        let api = HttpTaskApi::new("http://localhost:3000/").unwrap();
        assert_eq!(
            api.endpoint("api/tasks").unwrap().as_str(),
            "http://localhost:3000/api/tasks"
        );
        assert!(matches!(HttpTaskApi::new("not a url"), Err(PollError::Rejected(_))));
    }

    #[test]
    fn server_error_field_is_preferred() {
        let body = r#"{"error":"Prompt cannot be empty"}"#;
        assert_eq!(error_message(StatusCode::BAD_REQUEST, body), "Prompt cannot be empty");
        assert_eq!(error_message(StatusCode::BAD_GATEWAY, "upstream"), "HTTP 502: upstream");
    }

    #[tokio::test]
    async fn round_trip_against_live_router() {
        let base = spawn_server(vec![(1, Step::Fail(5, "timeout"))]).await;
        let api = Arc::new(HttpTaskApi::new(&base).unwrap());
        let client = PollingClient::new(
            api.clone(),
            PollConfig {
                interval: Duration::from_millis(10),
                ..Default::default()
            },
        );

        let (_, outcome) = client
            .submit_and_wait(&TaskRequest::new("a fox", 3).with_min_success(2), &CancellationToken::new(), |_| {})
            .await
            .unwrap();

        match outcome {
            PollOutcome::Completed(snapshot) => assert_eq!(snapshot.results.len(), 2),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(api.fetch(TaskId::new()).await, Ok(None));
    }

    #[tokio::test]
    async fn invalid_submission_is_rejected() {
        let base = spawn_server(vec![]).await;
        let api = HttpTaskApi::new(&base).unwrap();

        let result = api.submit(&TaskRequest::new("   ", 2)).await;

        assert!(matches!(result, Err(PollError::Rejected(message)) if message.contains("empty")));
    }
}
