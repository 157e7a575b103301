//! HTTP API over the sandbox registry
//!
//! JSON in, JSON out, except for logs which are served as plain text.

use anyhow::{Context, Result};
use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use forge_sandbox::{
    ExecuteRequest, FileMap, MaterializeError, SandboxError, SandboxService, Violation,
};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Create the API router
pub fn create_router(service: SandboxService) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/sandboxes", get(handle_list))
        .route(
            "/sandboxes/:id",
            post(handle_execute).get(handle_status).delete(handle_stop),
        )
        .route("/sandboxes/:id/files", put(handle_update))
        .route("/sandboxes/:id/logs", get(handle_logs))
        .layer(TraceLayer::new_for_http())
        .with_state(service)
}

/// Serve until Ctrl-C, then stop every sandbox
pub async fn start_server(listener: tokio::net::TcpListener, service: SandboxService) -> Result<()> {
    let bind_addr = listener
        .local_addr()
        .context("Failed to obtain server bind address")?;
    info!("Starting sandbox API on {}", bind_addr);

    let app = create_router(service.clone());
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Shutdown requested");
        })
        .await
        .context("Sandbox API server error")?;

    service.shutdown().await;
    Ok(())
}

/// Error body: `{error, violations?}`
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub violations: Option<Vec<Violation>>,
}

/// Registry error mapped onto an HTTP status
pub struct ApiError(SandboxError);

impl From<SandboxError> for ApiError {
    fn from(error: SandboxError) -> Self {
        Self(error)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            SandboxError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            SandboxError::Materialize(MaterializeError::Io { .. }) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            SandboxError::Materialize(_) | SandboxError::InvalidId(_) => StatusCode::BAD_REQUEST,
            SandboxError::AlreadyExists(_) => StatusCode::CONFLICT,
            SandboxError::NotFound(_) => StatusCode::NOT_FOUND,
            SandboxError::PortsExhausted { .. }
            | SandboxError::ShuttingDown
            | SandboxError::RuntimeUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(status = status.as_u16(), "request failed: {}", self.0);
        }
        let violations = match &self.0 {
            SandboxError::Validation(verdict) => Some(verdict.violations.clone()),
            _ => None,
        };
        let body = ErrorBody {
            error: self.0.to_string(),
            violations,
        };
        (status, Json(body)).into_response()
    }
}

fn not_found(id: &str) -> ApiError {
    ApiError(SandboxError::NotFound(id.to_string()))
}

async fn handle_health(State(service): State<SandboxService>) -> impl IntoResponse {
    Json(service.health().await)
}

async fn handle_list(State(service): State<SandboxService>) -> impl IntoResponse {
    Json(service.list().await)
}

async fn handle_execute(
    State(service): State<SandboxService>,
    Path(id): Path<String>,
    Json(request): Json<ExecuteRequest>,
) -> Result<Response, ApiError> {
    let response = service.execute(&id, request).await?;
    Ok((StatusCode::CREATED, Json(response)).into_response())
}

/// Body of a hot update
#[derive(Debug, Deserialize)]
struct UpdateBody {
    files: FileMap,
}

async fn handle_update(
    State(service): State<SandboxService>,
    Path(id): Path<String>,
    Json(body): Json<UpdateBody>,
) -> Result<Response, ApiError> {
    let ack = service.update(&id, body.files).await?;
    Ok(Json(ack).into_response())
}

async fn handle_status(
    State(service): State<SandboxService>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let view = service.status(&id).await.ok_or_else(|| not_found(&id))?;
    Ok(Json(view).into_response())
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    tail: Option<usize>,
}

async fn handle_logs(
    State(service): State<SandboxService>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<Response, ApiError> {
    let text = service
        .logs(&id, query.tail)
        .await
        .ok_or_else(|| not_found(&id))?;
    Ok(([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], text).into_response())
}

async fn handle_stop(
    State(service): State<SandboxService>,
    Path(id): Path<String>,
) -> StatusCode {
    if let Some(report) = service.stop(&id).await {
        if !report.is_clean() {
            warn!(sandbox_id = %id, "sandbox stopped with teardown errors");
        }
    }
    StatusCode::NO_CONTENT
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use forge_sandbox::{EngineConfig, HealthReport};
    use tempfile::TempDir;
    use tower::ServiceExt;

    async fn app() -> (Router, TempDir) {
        let root = TempDir::new().unwrap();
        let config = EngineConfig {
            workspace_root: root.path().to_path_buf(),
            ..Default::default()
        };
        let service = SandboxService::init(config).await.unwrap();
        (create_router(service), root)
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, body.to_vec())
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _root) = app().await;
        let request = Request::get("/health").body(Body::empty()).unwrap();
        let (status, body) = send(&app, request).await;

        assert_eq!(status, StatusCode::OK);
        let report: HealthReport = serde_json::from_slice(&body).unwrap();
        assert_eq!(report.status, "healthy");
        assert_eq!(report.sandboxes, 0);
    }

    #[tokio::test]
    async fn test_denylisted_dependency_is_unprocessable() {
        let (app, root) = app().await;
        let request = post_json(
            "/sandboxes/app-1",
            serde_json::json!({
                "files": {"package.json": "{}", "index.js": "console.log('ready')"},
                "dependencies": {"child-process-lib": "*"}
            }),
        );
        let (status, body) = send(&app, request).await;

        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        let error: ErrorBody = serde_json::from_slice(&body).unwrap();
        let violations = error.violations.unwrap();
        assert!(violations.iter().any(|v| v.subject == "child-process-lib"));
        assert!(!root.path().join("app-1").exists());
    }

    #[tokio::test]
    async fn test_manifest_dependency_is_unprocessable() {
        let (app, root) = app().await;
        let request = post_json(
            "/sandboxes/app-1",
            serde_json::json!({
                "files": {
                    "package.json": r#"{"dependencies":{"shelljs":"^0.8.5"}}"#,
                    "index.js": "console.log('ready')"
                }
            }),
        );
        let (status, body) = send(&app, request).await;

        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        let error: ErrorBody = serde_json::from_slice(&body).unwrap();
        assert!(error.violations.unwrap().iter().any(|v| v.subject == "shelljs"));
        assert!(!root.path().join("app-1").exists());
    }

    #[tokio::test]
    async fn test_invalid_id_is_bad_request() {
        let (app, _root) = app().await;
        let request = post_json(
            "/sandboxes/-bad",
            serde_json::json!({"files": {"index.js": "1"}}),
        );
        let (status, _) = send(&app, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_sandbox_is_not_found() {
        let (app, _root) = app().await;

        let (status, _) = send(&app, Request::get("/sandboxes/nope").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(
            &app,
            Request::get("/sandboxes/nope/logs?tail=5")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let update = Request::builder()
            .method("PUT")
            .uri("/sandboxes/nope/files")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"files":{"index.js":"1"}}"#))
            .unwrap();
        let (status, body) = send(&app, update).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let error: ErrorBody = serde_json::from_slice(&body).unwrap();
        assert!(error.violations.is_none());
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let (app, _root) = app().await;
        for _ in 0..2 {
            let request = Request::delete("/sandboxes/app-1").body(Body::empty()).unwrap();
            let (status, _) = send(&app, request).await;
            assert_eq!(status, StatusCode::NO_CONTENT);
        }
    }
}
