//! Health check endpoint

use axum::{extract::State, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;

use crate::db::records;
use crate::AppState;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// "ok", or "degraded" when the database cannot be queried
    pub status: String,
    pub module: String,
    pub version: String,
    pub uptime_seconds: u64,
    /// Days currently being computed
    pub in_flight: usize,
    /// Conversation records per processing status
    pub records_by_status: HashMap<String, i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let uptime = Utc::now().signed_duration_since(state.startup_time);
    let uptime_seconds = uptime.num_seconds().max(0) as u64;

    let (status, records_by_status, last_error) = match records::count_by_status(&state.db).await {
        Ok(counts) => ("ok", counts, None),
        Err(e) => ("degraded", HashMap::new(), Some(e.to_string())),
    };

    Json(HealthResponse {
        status: status.to_string(),
        module: "lifelog-cc".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds,
        in_flight: state.crew.in_flight(),
        records_by_status,
        last_error,
    })
}

/// Build health check routes
pub fn health_routes() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}
