// =============================================================================
// REST Control Surface — Axum 0.7
// =============================================================================
//
// Four commands plus health, all under /api/v1/. The server binds loopback by
// default; CORS is open for tooling convenience.
//
//   GET  /api/v1/health                    liveness
//   GET  /api/v1/status                    engine status payload
//   GET  /api/v1/position                  position, transitions, observation
//   POST /api/v1/control/start             accept signals
//   POST /api/v1/control/stop              observe only
//   POST /api/v1/control/trigger-analysis  out-of-cycle context refresh
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::State,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::app_state::AppState;
use crate::supervisor;

/// Build the control router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/status", get(status))
        .route("/api/v1/position", get(position))
        .route("/api/v1/control/start", post(control_start))
        .route("/api/v1/control/stop", post(control_stop))
        .route("/api/v1/control/trigger-analysis", post(control_trigger_analysis))
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Handlers
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    server_time: i64,
}

async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        server_time: chrono::Utc::now().timestamp_millis(),
    })
}

async fn status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let now_ms = chrono::Utc::now().timestamp_millis();
    Json(state.status(now_ms))
}

async fn position(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "position": state.machine.snapshot(),
        "transitions": state.machine.transitions(),
        "observation": state.observation.snapshot(),
    }))
}

#[derive(Serialize)]
struct ControlResponse {
    ok: bool,
    running: bool,
}

async fn control_start(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    info!("control: start");
    supervisor::start(&state);
    Json(ControlResponse {
        ok: true,
        running: true,
    })
}

async fn control_stop(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    info!("control: stop");
    supervisor::stop(&state);
    Json(ControlResponse {
        ok: true,
        running: false,
    })
}

async fn control_trigger_analysis(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    info!("control: trigger-analysis");
    state.analysis_trigger.notify_one();
    Json(ControlResponse {
        ok: true,
        running: state.machine.is_running(),
    })
}
