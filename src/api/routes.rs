//! HTTP route handlers.

use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::orchestrator::{Orchestrator, OrchestratorError, StatusLookup, TaskStats};
use crate::task::{TaskId, TaskSnapshot};

use super::types::*;

/// Base64 reference images make bodies larger than axum's default limit.
const MAX_BODY_BYTES: usize = 20 * 1024 * 1024;
const DEFAULT_LIST_LIMIT: usize = 50;

type ApiError = (StatusCode, Json<ErrorResponse>);

/// Shared application state.
pub struct AppState {
    pub config: Config,
    pub orchestrator: Arc<Orchestrator>,
}

fn error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(ErrorResponse::new(message)))
}

fn not_found(id: &str) -> ApiError {
    (StatusCode::NOT_FOUND, Json(ErrorResponse::expired(id)))
}

/// Ids that cannot name a task are reported like expired ones.
fn parse_id(raw: &str) -> Result<TaskId, ApiError> {
    raw.parse().map_err(|_| not_found(raw))
}

impl From<OrchestratorError> for ApiError {
    fn from(e: OrchestratorError) -> Self {
        match &e {
            OrchestratorError::InvalidRequest(_) => error(StatusCode::BAD_REQUEST, e.to_string()),
            OrchestratorError::NotFound(id) => not_found(&id.to_string()),
            OrchestratorError::NotRetryable { .. } => error(StatusCode::CONFLICT, e.to_string()),
            OrchestratorError::Unavailable(_) => {
                tracing::error!("Task store unavailable: {}", e);
                error(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
            }
        }
    }
}

/// Build the router over an existing state.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/stats", get(stats))
        .route("/api/tasks", post(submit_task).get(list_tasks))
        .route("/api/tasks/check-timeout", post(check_timeout))
        .route("/api/tasks/:id", get(get_task).delete(delete_task))
        .route("/api/tasks/:id/retry", post(retry_task))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    let orchestrator = Arc::new(Orchestrator::from_config(&config).await?);
    let cancel = CancellationToken::new();
    let background = orchestrator.start_background(cancel.clone());

    let state = Arc::new(AppState {
        config: config.clone(),
        orchestrator,
    });
    let app = router(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    cancel.cancel();
    for handle in background {
        if let Err(e) = handle.await {
            tracing::warn!("Background loop ended abnormally: {}", e);
        }
    }
    tracing::info!("Server stopped");
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, draining requests");
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        store_persistent: state.config.store.store_type != crate::store::StoreType::Memory,
        monitor_enabled: state.orchestrator.config().monitor_enabled,
    })
}

/// Submit a new task. Responds once the task is stored; generation runs in the background.
async fn submit_task(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SubmitTaskRequest>,
) -> Result<(StatusCode, Json<SubmitTaskResponse>), ApiError> {
    let request = body
        .into_task_request(&state.orchestrator)
        .map_err(|e| error(StatusCode::BAD_REQUEST, e.to_string()))?;
    let submission = state.orchestrator.submit(request).await?;
    Ok((StatusCode::ACCEPTED, Json(submission.into())))
}

async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<TaskSnapshot>, ApiError> {
    let task_id = parse_id(&id)?;
    match state.orchestrator.status(task_id).await {
        StatusLookup::Found(snapshot) => Ok(Json(snapshot)),
        StatusLookup::NotFound => Err(not_found(&id)),
    }
}

async fn list_tasks(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListTasksQuery>,
) -> Result<Json<Vec<TaskSnapshot>>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT);
    Ok(Json(state.orchestrator.list(limit).await?))
}

async fn delete_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<DeleteTaskResponse>, ApiError> {
    let task_id = parse_id(&id)?;
    if !state.orchestrator.delete(task_id).await? {
        return Err(not_found(&id));
    }
    Ok(Json(DeleteTaskResponse {
        task_id: id,
        deleted: true,
    }))
}

async fn retry_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<TaskSnapshot>), ApiError> {
    let task_id = parse_id(&id)?;
    let snapshot = state.orchestrator.retry(task_id).await?;
    Ok((StatusCode::ACCEPTED, Json(snapshot)))
}

async fn stats(State(state): State<Arc<AppState>>) -> Result<Json<TaskStats>, ApiError> {
    Ok(Json(state.orchestrator.stats().await?))
}

async fn check_timeout(State(state): State<Arc<AppState>>) -> Json<CheckTimeoutResponse> {
    let report = state.orchestrator.check_timeouts().await;
    Json(CheckTimeoutResponse {
        report,
        checked_at: chrono::Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderConfig;
    use crate::fanout::tests::Step;
    use crate::orchestrator::tests::orchestrator;

    fn state(steps: Vec<(usize, Step)>) -> Arc<AppState> {
        Arc::new(AppState {
            config: Config::new(ProviderConfig::default()),
            orchestrator: orchestrator(steps),
        })
    }

    fn body(prompt: &str, width: Option<usize>) -> SubmitTaskRequest {
        SubmitTaskRequest {
            prompt: prompt.to_string(),
            reference_image: None,
            reference_image_name: None,
            style: Some("cyber".to_string()),
            fan_out_width: width,
            min_success: None,
        }
    }

    #[tokio::test]
    async fn submit_then_get_returns_snapshot() {
        let state = state(vec![]);
        let (status, Json(submitted)) = submit_task(State(state.clone()), Json(body("a fox", None)))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(submitted.suggested_poll_interval_ms, 10);

        let Json(snapshot) = get_task(State(state), Path(submitted.task_id.clone()))
            .await
            .unwrap();
        assert_eq!(snapshot.task_id, submitted.task_id);
    }

    #[tokio::test]
    async fn invalid_submission_is_400() {
        let state = state(vec![]);
        let (status, _) = submit_task(State(state.clone()), Json(body("a fox", Some(9))))
            .await
            .unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let long = "x".repeat(1001);
        let (status, _) = submit_task(State(state), Json(body(&long, None)))
            .await
            .unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_task_is_404_with_suggestion() {
        let state = state(vec![]);
        let id = TaskId::new().to_string();
        let (status, Json(body)) = get_task(State(state.clone()), Path(id.clone()))
            .await
            .unwrap_err();
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body.task_id, Some(id));
        assert!(body.suggestion.is_some());

        let (status, Json(body)) = get_task(State(state.clone()), Path("not-a-uuid".to_string()))
            .await
            .unwrap_err();
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body.task_id.as_deref(), Some("not-a-uuid"));

        let (status, _) = delete_task(State(state), Path("not-a-uuid".to_string()))
            .await
            .unwrap_err();
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn retrying_a_live_task_is_conflict() {
        let state = state(vec![(0, Step::Succeed(500))]);
        let (_, Json(submitted)) = submit_task(State(state.clone()), Json(body("a fox", Some(1))))
            .await
            .unwrap();
        let (status, _) = retry_task(State(state), Path(submitted.task_id))
            .await
            .unwrap_err();
        assert_eq!(status, StatusCode::CONFLICT);
    }
}
