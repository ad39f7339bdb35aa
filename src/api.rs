//! HTTP API exposed to the chat gateway.
//!
//! The gateway forwards inbound chat commands and button clicks here;
//! outbound traffic goes the other way through the transport client.

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router, extract::Path, extract::Query, extract::State};
use log::warn;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tower_http::trace::TraceLayer;

use crate::error::ExecError;
use crate::service::ExecService;
use crate::store::Run;

/// API error with structured JSON responses.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<ExecError> for ApiError {
    fn from(err: ExecError) -> Self {
        match err {
            ExecError::QueueFull(_) => ApiError::Conflict(err.to_string()),
            ExecError::Forbidden(_) => ApiError::Forbidden(err.to_string()),
            ExecError::InvalidProject(_) => ApiError::BadRequest(err.to_string()),
            ExecError::NoPendingPrompt(_) => ApiError::Conflict(err.to_string()),
            ExecError::Storage(_) => ApiError::ServiceUnavailable(err.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            warn!("api error: {self}");
        }
        (
            status,
            Json(ErrorBody {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

#[derive(Debug, Deserialize)]
struct EnqueueRequest {
    conversation_id: String,
    user_id: String,
    project_id: String,
    program: String,
    #[serde(default)]
    args: Vec<String>,
}

#[derive(Debug, Serialize)]
struct EnqueueResponse {
    run_id: i64,
}

#[derive(Debug, Deserialize)]
struct RespondRequest {
    selection: String,
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    #[serde(default = "default_history_limit")]
    limit: i64,
}

fn default_history_limit() -> i64 {
    20
}

/// Create the application router.
pub fn create_router(service: Arc<ExecService>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/runs", post(enqueue_run))
        .route("/runs/{run_id}", get(get_run))
        .route("/runs/{run_id}/cancel", post(cancel_run))
        .route("/runs/{run_id}/respond", post(respond_to_prompt))
        .route("/conversations/{conversation_id}/runs", get(list_runs))
        .route("/conversations/{conversation_id}/cancel", post(cancel_conversation))
        .layer(TraceLayer::new_for_http())
        .with_state(service)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn enqueue_run(
    State(service): State<Arc<ExecService>>,
    Json(request): Json<EnqueueRequest>,
) -> Result<Json<EnqueueResponse>, ApiError> {
    if request.program.trim().is_empty() {
        return Err(ApiError::BadRequest("program must not be empty".to_string()));
    }

    let run_id = service
        .enqueue(
            &request.conversation_id,
            &request.user_id,
            &request.project_id,
            &request.program,
            request.args,
        )
        .await?;

    Ok(Json(EnqueueResponse { run_id }))
}

async fn get_run(
    State(service): State<Arc<ExecService>>,
    Path(run_id): Path<i64>,
) -> Result<Json<Run>, ApiError> {
    let run = service
        .status(run_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("run {run_id}")))?;
    Ok(Json(run))
}

async fn list_runs(
    State(service): State<Arc<ExecService>>,
    Path(conversation_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<Run>>, ApiError> {
    let runs = service
        .history(&conversation_id, query.limit.clamp(1, 200))
        .await?;
    Ok(Json(runs))
}

async fn cancel_run(
    State(service): State<Arc<ExecService>>,
    Path(run_id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    service.cancel_run(run_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn cancel_conversation(
    State(service): State<Arc<ExecService>>,
    Path(conversation_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    service.cancel_conversation(&conversation_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn respond_to_prompt(
    State(service): State<Arc<ExecService>>,
    Path(run_id): Path<i64>,
    Json(request): Json<RespondRequest>,
) -> Result<StatusCode, ApiError> {
    service.respond_to_prompt(run_id, &request.selection).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum_test::TestServer;
    use serde_json::json;
    use std::collections::HashMap;

    use crate::auth::Allowlist;
    use crate::settings::{AuthConfig, ExecConfig, ProjectConfig};
    use crate::project::ProjectRegistry;
    use crate::store::Database;
    use crate::transport::{ChatTransport, MessageId, TransportError};

    struct NullTransport;

    #[async_trait]
    impl ChatTransport for NullTransport {
        async fn send(
            &self,
            _conversation_id: &str,
            _text: &str,
            _buttons: Option<&[String]>,
        ) -> Result<MessageId, TransportError> {
            Ok("msg".to_string())
        }

        async fn edit(&self, _message_id: &MessageId, _text: &str) -> Result<(), TransportError> {
            Ok(())
        }
    }

    async fn test_server(project_dir: &std::path::Path) -> TestServer {
        let db = Database::in_memory().await.unwrap();

        let mut projects = HashMap::new();
        projects.insert(
            "demo".to_string(),
            ProjectConfig {
                path: project_dir.to_string_lossy().into_owned(),
            },
        );

        let service = ExecService::new(
            &db,
            Arc::new(NullTransport),
            Allowlist::new(&AuthConfig {
                allowed_users: vec!["alice".to_string()],
                open: false,
            }),
            ProjectRegistry::new(&projects),
            &ExecConfig::default(),
        );
        service.bootstrap().await.unwrap();

        TestServer::new(create_router(service)).unwrap()
    }

    #[tokio::test]
    async fn test_healthz() {
        let dir = tempfile::tempdir().unwrap();
        let server = test_server(dir.path()).await;
        let response = server.get("/healthz").await;
        response.assert_status_ok();
        response.assert_text("ok");
    }

    #[tokio::test]
    async fn test_enqueue_and_status() {
        let dir = tempfile::tempdir().unwrap();
        let server = test_server(dir.path()).await;

        let response = server
            .post("/runs")
            .json(&json!({
                "conversation_id": "chat-1",
                "user_id": "alice",
                "project_id": "demo",
                "program": "echo",
                "args": ["hello"],
            }))
            .await;
        response.assert_status_ok();
        let body: serde_json::Value = response.json();
        let run_id = body["run_id"].as_i64().unwrap();

        // The consumer picks the run up and completes it shortly.
        let mut status = String::new();
        for _ in 0..100 {
            let response = server.get(&format!("/runs/{run_id}")).await;
            response.assert_status_ok();
            let run: serde_json::Value = response.json();
            status = run["status"].as_str().unwrap().to_string();
            if status == "completed" {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        assert_eq!(status, "completed");
    }

    #[tokio::test]
    async fn test_enqueue_rejects_unknown_user() {
        let dir = tempfile::tempdir().unwrap();
        let server = test_server(dir.path()).await;

        let response = server
            .post("/runs")
            .json(&json!({
                "conversation_id": "chat-1",
                "user_id": "mallory",
                "project_id": "demo",
                "program": "echo",
            }))
            .await;
        response.assert_status(StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_enqueue_rejects_unknown_project() {
        let dir = tempfile::tempdir().unwrap();
        let server = test_server(dir.path()).await;

        let response = server
            .post("/runs")
            .json(&json!({
                "conversation_id": "chat-1",
                "user_id": "alice",
                "project_id": "nope",
                "program": "echo",
            }))
            .await;
        response.assert_status(StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_run_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let server = test_server(dir.path()).await;
        let response = server.get("/runs/999").await;
        response.assert_status(StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_respond_without_prompt_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let server = test_server(dir.path()).await;
        let response = server
            .post("/runs/1/respond")
            .json(&json!({"selection": "y"}))
            .await;
        response.assert_status(StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_history_listing() {
        let dir = tempfile::tempdir().unwrap();
        let server = test_server(dir.path()).await;

        for _ in 0..3 {
            server
                .post("/runs")
                .json(&json!({
                    "conversation_id": "chat-1",
                    "user_id": "alice",
                    "project_id": "demo",
                    "program": "true",
                }))
                .await
                .assert_status_ok();
        }

        let response = server.get("/conversations/chat-1/runs").await;
        response.assert_status_ok();
        let runs: Vec<serde_json::Value> = response.json();
        assert_eq!(runs.len(), 3);
    }
}
