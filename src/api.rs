//! REST endpoints for managing runs and retrieving artifacts.

use std::path::{Component, PathBuf};
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::broadcast;
use tracing::error;

use crate::db::DbHandle;
use crate::errors::SupervisorError;
use crate::models::{Run, RunDetail};
use crate::runner::supervisor::RunSupervisor;

// ── Application state ────────────────────────────────────────────────

#[derive(Clone)]
pub struct AppState {
    pub db: DbHandle,
    pub tx: broadcast::Sender<String>,
    pub supervisor: Arc<RunSupervisor>,
    pub scripts_dir: PathBuf,
    pub artifacts_dir: PathBuf,
}

// ── Error handling ───────────────────────────────────────────────────

/// API-level errors mapped onto HTTP status codes.
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(e) => {
                error!("Internal error: {:#}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError::Internal(e)
    }
}

impl From<SupervisorError> for ApiError {
    fn from(e: SupervisorError) -> Self {
        match e {
            SupervisorError::RunNotFound { .. } => ApiError::NotFound(e.to_string()),
            SupervisorError::NoScript { .. } => ApiError::BadRequest(e.to_string()),
            SupervisorError::AlreadyRunning { .. } => ApiError::Conflict(e.to_string()),
            SupervisorError::SpawnFailed(_) | SupervisorError::Other(_) => {
                ApiError::Internal(e.into())
            }
        }
    }
}

// ── Request/response payloads ────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateRunRequest {
    pub name: String,
    #[serde(default)]
    pub script_path: Option<String>,
    #[serde(default)]
    pub target_url: Option<String>,
    /// Ordered step names forming the run's fixed step template.
    #[serde(default)]
    pub steps: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct StartRunResponse {
    pub run_id: i64,
    pub message: String,
}

// ── Router ───────────────────────────────────────────────────────────

pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/api/runs", post(create_run).get(list_runs))
        .route("/api/runs/{id}", get(get_run))
        .route("/api/runs/{id}/start", post(start_run))
        .route("/api/scripts", get(list_scripts))
        .route("/api/artifacts/{*path}", get(serve_artifact))
}

// ── Handlers ─────────────────────────────────────────────────────────

async fn create_run(
    State(state): State<AppState>,
    Json(req): Json<CreateRunRequest>,
) -> Result<(StatusCode, Json<Run>), ApiError> {
    if req.name.trim().is_empty() {
        return Err(ApiError::BadRequest("Run name cannot be empty".to_string()));
    }
    let run = state
        .db
        .call(move |db| {
            db.create_run(
                &req.name,
                req.script_path.as_deref(),
                req.target_url.as_deref(),
                &req.steps,
            )
        })
        .await?;
    Ok((StatusCode::CREATED, Json(run)))
}

async fn list_runs(State(state): State<AppState>) -> Result<Json<Vec<Run>>, ApiError> {
    let runs = state.db.call(|db| db.list_runs()).await?;
    Ok(Json(runs))
}

async fn get_run(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<RunDetail>, ApiError> {
    let detail = state
        .db
        .call(move |db| db.get_run_detail(id))
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Run {} not found", id)))?;
    Ok(Json(detail))
}

/// Launch a run's script. Replies 202 as soon as the execution task is
/// spawned; progress is observable via `GET /api/runs/{id}` and the
/// WebSocket stream.
async fn start_run(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<(StatusCode, Json<StartRunResponse>), ApiError> {
    state.supervisor.start_run(id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(StartRunResponse {
            run_id: id,
            message: "Run started".to_string(),
        }),
    ))
}

/// Names of script files available in the scripts directory.
async fn list_scripts(State(state): State<AppState>) -> Result<Json<Vec<String>>, ApiError> {
    let dir = state.scripts_dir.clone();
    let mut names = Vec::new();
    let mut entries = match tokio::fs::read_dir(&dir).await {
        Ok(entries) => entries,
        // A missing scripts directory just means no scripts yet
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Json(names)),
        Err(e) => {
            return Err(ApiError::Internal(anyhow::Error::new(e).context(format!(
                "Failed to read scripts directory {}",
                dir.display()
            ))));
        }
    };
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| ApiError::Internal(e.into()))?
    {
        let is_file = entry
            .file_type()
            .await
            .map(|t| t.is_file())
            .unwrap_or(false);
        if is_file {
            if let Some(name) = entry.file_name().to_str() {
                // Only JavaScript test scripts are runnable
                if name.ends_with(".js") {
                    names.push(name.to_string());
                }
            }
        }
    }
    names.sort();
    Ok(Json(names))
}

async fn serve_artifact(
    State(state): State<AppState>,
    Path(path): Path<String>,
) -> Result<Response, ApiError> {
    let relative = sanitize_artifact_path(&path)
        .ok_or_else(|| ApiError::BadRequest("Invalid artifact path".to_string()))?;
    let full = state.artifacts_dir.join(relative);
    let bytes = match tokio::fs::read(&full).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ApiError::NotFound(format!("Artifact {} not found", path)));
        }
        Err(e) => {
            return Err(ApiError::Internal(anyhow::Error::new(e).context(format!(
                "Failed to read artifact {}",
                full.display()
            ))));
        }
    };
    let mime = mime_guess::from_path(&full).first_or_octet_stream();
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, mime.to_string())],
        bytes,
    )
        .into_response())
}

/// Reject artifact paths that could escape the artifacts directory.
fn sanitize_artifact_path(path: &str) -> Option<PathBuf> {
    let candidate = PathBuf::from(path);
    let mut clean = PathBuf::new();
    for component in candidate.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            _ => return None,
        }
    }
    if clean.as_os_str().is_empty() {
        None
    } else {
        Some(clean)
    }
}
