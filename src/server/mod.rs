//! HTTP and WebSocket front end for the pipeline orchestrator.
//!
//! | Module | Responsibility                                              |
//! |--------|-------------------------------------------------------------|
//! | `api`  | REST routes, `AppState`, `ApiError` status mapping          |
//! | `ws`   | `/ws` live run events with ping/pong keepalive              |

pub mod api;
pub mod ws;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{Router, http::Uri, response::IntoResponse};
use chrono::Utc;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

use crate::ai;
use crate::config::BizimatchConfig;
use crate::pipeline::PipelineOrchestrator;
use api::{ApiError, AppState, SharedState};

/// Build the full application router.
pub fn build_router(state: SharedState, dev_mode: bool) -> Router {
    let app = api::api_router().fallback(not_found).with_state(state);
    if dev_mode {
        app.layer(CorsLayer::permissive())
    } else {
        app
    }
}

async fn not_found(uri: Uri) -> impl IntoResponse {
    ApiError::NotFound(format!("No route for {}", uri.path()))
}

/// Open the run store, resume interrupted runs and serve until Ctrl+C.
pub async fn start_server(config: &BizimatchConfig) -> Result<()> {
    let toml = &config.toml;
    let orchestrator = PipelineOrchestrator::from_config(toml)
        .context("Failed to initialize pipeline orchestrator")?;

    let resumed = orchestrator
        .resume_incomplete()
        .await
        .context("Failed to resume incomplete runs")?;
    if !resumed.is_empty() {
        info!(count = resumed.len(), "resumed incomplete runs");
    }

    let state = Arc::new(AppState {
        orchestrator,
        ai_configured: ai::is_configured(&toml.ai),
        started_at: Utc::now(),
    });
    if !state.ai_configured {
        warn!("server starting without an AI API key");
    }

    let app = build_router(state, toml.server.dev_mode);

    let addr = format!("{}:{}", toml.server.host, toml.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    info!(address = %local_addr, db = %config.db_path().display(), "bizimatch server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for Ctrl+C; shutting down");
    }
    info!("shutdown requested");
}
