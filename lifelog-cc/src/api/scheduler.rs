//! Scheduler control endpoint

use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use serde::Serialize;

use crate::services::SchedulerRunReport;
use crate::AppState;

/// POST /scheduler/run response
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerResponse {
    pub status: String,
    /// Report of the most recent completed run, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run: Option<SchedulerRunReport>,
}

/// POST /scheduler/run
///
/// Wakes the background scheduler for an immediate run. Repeated triggers
/// while a run is pending coalesce into one.
pub async fn trigger_run(State(state): State<AppState>) -> (StatusCode, Json<TriggerResponse>) {
    state.scheduler.trigger();
    tracing::info!("Scheduler run requested via API");

    let last_run = state.scheduler.last_report().await;
    (
        StatusCode::ACCEPTED,
        Json(TriggerResponse {
            status: "triggered".to_string(),
            last_run,
        }),
    )
}

/// Build scheduler routes
pub fn scheduler_routes() -> Router<AppState> {
    Router::new().route("/scheduler/run", post(trigger_run))
}
