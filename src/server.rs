//! HTTP server assembly and lifecycle.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
};
use serde_json::json;
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::api::{AppState, api_router};
use crate::db::{DbHandle, RunDb};
use crate::runner::artifacts::FsArtifactStore;
use crate::runner::supervisor::{RunSupervisor, RunnerCommand, SupervisorConfig};
use crate::ws::ws_handler_with_sender;

/// Capacity of the broadcast channel feeding WebSocket clients. A slow
/// client that lags past this many messages skips ahead rather than
/// stalling the stream.
const BROADCAST_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub scripts_dir: PathBuf,
    pub artifacts_dir: PathBuf,
    pub runner: RunnerCommand,
    pub max_concurrent_runs: usize,
    pub run_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3001,
            db_path: PathBuf::from("testdeck.db"),
            scripts_dir: PathBuf::from("scripts"),
            artifacts_dir: PathBuf::from("screenshots"),
            runner: RunnerCommand::default(),
            max_concurrent_runs: 4,
            run_timeout: Duration::from_secs(600),
        }
    }
}

/// Open the database and wire up the shared application state.
pub fn build_state(config: &ServerConfig) -> Result<AppState> {
    let db = DbHandle::new(RunDb::new(&config.db_path)?);
    build_state_with_db(config, db)
}

pub fn build_state_with_db(config: &ServerConfig, db: DbHandle) -> Result<AppState> {
    let (tx, _) = broadcast::channel::<String>(BROADCAST_CAPACITY);
    let artifacts = Arc::new(FsArtifactStore::new(config.artifacts_dir.clone()));
    let supervisor = Arc::new(RunSupervisor::new(
        db.clone(),
        tx.clone(),
        artifacts,
        SupervisorConfig {
            scripts_dir: config.scripts_dir.clone(),
            runner: config.runner.clone(),
            max_concurrent_runs: config.max_concurrent_runs,
            run_timeout: config.run_timeout,
        },
    ));
    Ok(AppState {
        db,
        tx,
        supervisor,
        scripts_dir: config.scripts_dir.clone(),
        artifacts_dir: config.artifacts_dir.clone(),
    })
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .merge(api_router())
        .route("/ws", get(ws_handler))
        // The dashboard is served from a different origin during development
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws_handler_with_sender(ws, state.tx.clone()).await
}

/// Run the server until ctrl-c.
pub async fn start_server(config: ServerConfig) -> Result<()> {
    let state = build_state(&config)?;
    let router = build_router(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!(
        addr = %addr,
        scripts_dir = %config.scripts_dir.display(),
        "Server listening"
    );

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Shutdown signal received");
    }
}
