//! Day conversation API handlers
//!
//! GET /days/:day/conversation, GET /days/:day/status, POST /days/:day/enqueue

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;

use crate::error::ApiResult;
use crate::models::{parse_day, DayStatus, Priority, ProjectionResult, WaitMode};
use crate::AppState;

/// GET /days/:day/conversation query
#[derive(Debug, Default, Deserialize)]
pub struct ConversationQuery {
    /// Recompute even if a projection is stored
    #[serde(default)]
    pub force: bool,
    /// Wait for an in-flight computation (default true)
    #[serde(default)]
    pub wait: Option<bool>,
}

impl ConversationQuery {
    fn wait_mode(&self) -> WaitMode {
        match self.wait {
            Some(false) => WaitMode::NoWait,
            _ => WaitMode::Block,
        }
    }
}

/// POST /days/:day/enqueue request
#[derive(Debug, Default, Deserialize)]
pub struct EnqueueRequest {
    /// "low", "normal", "high" or "urgent" (default "normal")
    #[serde(default)]
    pub priority: Option<String>,
}

/// GET /days/:day/conversation
///
/// Always answers with a structured result. A projection that is not ready
/// yet comes back as the raw conversation with `deduplicated: false`.
pub async fn get_conversation(
    State(state): State<AppState>,
    Path(day): Path<String>,
    Query(query): Query<ConversationQuery>,
) -> ApiResult<Json<ProjectionResult>> {
    let day = parse_day(&day)?;
    let result = state
        .crew
        .get_projection(day, query.force, query.wait_mode())
        .await?;

    tracing::debug!(
        day = %day,
        status = %result.status,
        cache_hit = result.cache_hit,
        elapsed_ms = result.elapsed_ms,
        "Served day conversation"
    );
    Ok(Json(result))
}

/// GET /days/:day/status
pub async fn get_day_status(
    State(state): State<AppState>,
    Path(day): Path<String>,
) -> ApiResult<Json<DayStatus>> {
    let day = parse_day(&day)?;
    Ok(Json(state.crew.get_status(day).await?))
}

/// POST /days/:day/enqueue
///
/// Queue the day for background processing. Returns 202 Accepted.
pub async fn enqueue_day(
    State(state): State<AppState>,
    Path(day): Path<String>,
    request: Option<Json<EnqueueRequest>>,
) -> ApiResult<(StatusCode, Json<DayStatus>)> {
    let day = parse_day(&day)?;
    let priority = match request.and_then(|Json(r)| r.priority) {
        Some(raw) => raw.parse::<Priority>()?,
        None => Priority::default(),
    };

    let status = state.crew.enqueue(day, priority).await?;
    Ok((StatusCode::ACCEPTED, Json(status)))
}

/// Build day conversation routes
pub fn conversation_routes() -> Router<AppState> {
    Router::new()
        .route("/days/:day/conversation", get(get_conversation))
        .route("/days/:day/status", get(get_day_status))
        .route("/days/:day/enqueue", post(enqueue_day))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_mode_defaults_to_block() {
        assert_eq!(ConversationQuery::default().wait_mode(), WaitMode::Block);
        let no_wait = ConversationQuery { force: false, wait: Some(false) };
        assert_eq!(no_wait.wait_mode(), WaitMode::NoWait);
    }
}
