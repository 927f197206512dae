use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::error;

use super::ws::ws_handler;
use crate::config::PipelineOverrides;
use crate::errors::OrchestratorError;
use crate::pipeline::{ApprovalDecision, PipelineOrchestrator, PipelineRun, StageName, StageStatus};

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub orchestrator: PipelineOrchestrator,
    pub ai_configured: bool,
    pub started_at: DateTime<Utc>,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateRunRequest {
    pub prompt: String,
    #[serde(default)]
    pub config: Option<PipelineOverrides>,
}

#[derive(Deserialize)]
pub struct ApproveRequest {
    pub decision: ApprovalDecision,
    #[serde(default)]
    pub comment: Option<String>,
}

/// A run as returned by the API: the stored record plus a per-stage summary.
#[derive(Serialize)]
pub struct RunView {
    #[serde(flatten)]
    pub run: PipelineRun,
    pub stages: BTreeMap<StageName, StageStatus>,
}

impl From<PipelineRun> for RunView {
    fn from(run: PipelineRun) -> Self {
        let stages = run.stage_statuses();
        Self { run, stages }
    }
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        let msg = err.to_string();
        match err {
            OrchestratorError::RunNotFound { .. } => ApiError::NotFound(msg),
            OrchestratorError::EmptyPrompt => ApiError::BadRequest(msg),
            OrchestratorError::NotAwaitingApproval { .. }
            | OrchestratorError::AlreadyTerminal { .. } => ApiError::Conflict(msg),
            OrchestratorError::Persistence { .. } | OrchestratorError::Other(_) => {
                error!(error = %msg, "request failed");
                ApiError::Internal(msg)
            }
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health_check))
        .route("/api/status", get(system_status))
        .route("/runs", get(list_runs).post(create_run))
        .route("/runs/{run_id}", get(get_run))
        .route("/runs/{run_id}/approve", post(approve_run))
        .route("/runs/{run_id}/cancel", post(cancel_run))
        .route("/ws", get(ws_handler))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn root() -> impl IntoResponse {
    Json(serde_json::json!({
        "message": "Bizimatch AI Development Pipeline API",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({"status": "healthy"}))
}

async fn system_status(State(state): State<SharedState>) -> impl IntoResponse {
    let (database, runs) = match state.orchestrator.status_counts().await {
        Ok(counts) => ("connected", Some(counts)),
        Err(e) => {
            error!(error = %e, "status check could not read runs");
            ("error", None)
        }
    };
    let ai_client = if state.ai_configured {
        "configured"
    } else {
        "missing_api_key"
    };
    let uptime_secs = (Utc::now() - state.started_at).num_seconds().max(0);
    Json(serde_json::json!({
        "status": "operational",
        "components": {
            "orchestrator": "ready",
            "ai_client": ai_client,
            "database": database,
        },
        "runs": runs,
        "uptime_secs": uptime_secs,
    }))
}

async fn create_run(
    State(state): State<SharedState>,
    Json(req): Json<CreateRunRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let run_id = state.orchestrator.run(&req.prompt, req.config.as_ref()).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({"run_id": run_id, "status": "running"})),
    ))
}

async fn list_runs(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let runs: Vec<RunView> = state
        .orchestrator
        .list()
        .await?
        .into_iter()
        .map(RunView::from)
        .collect();
    Ok(Json(runs))
}

async fn get_run(
    State(state): State<SharedState>,
    Path(run_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let run = state.orchestrator.get(&run_id).await?;
    Ok(Json(RunView::from(run)))
}

async fn approve_run(
    State(state): State<SharedState>,
    Path(run_id): Path<String>,
    Json(req): Json<ApproveRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let run = state
        .orchestrator
        .approve(&run_id, req.decision, req.comment.as_deref())
        .await?;
    Ok(Json(RunView::from(run)))
}

async fn cancel_run(
    State(state): State<SharedState>,
    Path(run_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let run = state.orchestrator.cancel(&run_id).await?;
    Ok(Json(RunView::from(run)))
}

// ── Tests ─────────────────────────────────────────────────────────────
