//! Health and tool availability endpoints

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use crate::api::middleware::AppState;
use crate::tools::ToolStatus;

/// Response for the health check
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_seconds: u64,
    pub total_requests: u64,
    pub avg_response_time_ms: f64,
    pub active_jobs: usize,
    pub workers: usize,
    pub transcription_slots_available: usize,
}

/// Response for the tool report
#[derive(Debug, Serialize)]
pub struct ToolsResponse {
    pub tools: Vec<ToolStatus>,
    pub available: usize,
    pub total: usize,
}

/// Build the system router
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/tools", get(tools))
}

/// GET /api/v1/health
async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let stats = &state.request_stats;
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: stats.uptime_seconds(),
        total_requests: stats.total_requests(),
        avg_response_time_ms: (stats.avg_response_time_us() / 10.0).round() / 100.0,
        active_jobs: state.jobs.active_count().await,
        workers: state.jobs.workers(),
        transcription_slots_available: state.media.transcription_slots_available(),
    })
}

/// GET /api/v1/tools - Which external tools were detected
async fn tools(State(state): State<AppState>) -> Json<ToolsResponse> {
    let tools = state.tools.report();
    Json(ToolsResponse {
        available: tools.iter().filter(|t| t.available).count(),
        total: tools.len(),
        tools,
    })
}
