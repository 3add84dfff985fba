//! Server-Sent Events endpoints
//!
//! `/days/:day/progress` streams the computation of a single day;
//! `/events` streams service-wide lifecycle events.

use axum::{
    extract::{Path, State},
    response::sse::{Event, Sse},
    routing::get,
    Router,
};
use futures::stream::Stream;
use std::convert::Infallible;
use tracing::{debug, info, warn};

use crate::error::ApiResult;
use crate::models::parse_day;
use crate::AppState;

/// GET /days/:day/progress
///
/// Frames carry the event name (`started`, `progress`, `completed`, `failed`)
/// and the JSON event. The stream closes after a terminal event. Events
/// published before the client connected are not replayed.
pub async fn day_progress_stream(
    State(state): State<AppState>,
    Path(day): Path<String>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let day = parse_day(&day)?;

    // Subscribe before the existence check so a computation starting in
    // between is still observed
    let mut subscription = state.crew.progress().subscribe(day);
    let snapshot = state.crew.get_status(day).await?;
    info!(day = %day, status = %snapshot.status, "SSE client connected to day progress");

    let stream = async_stream::stream! {
        yield Ok(Event::default().event("ConnectionStatus").data("connected"));

        while let Some(event) = subscription.recv().await {
            match serde_json::to_string(&event) {
                Ok(json) => {
                    debug!(day = %day, event = event.event_name(), "SSE: forwarding progress event");
                    yield Ok(Event::default().event(event.event_name()).data(json));
                }
                Err(e) => {
                    warn!(day = %day, error = %e, "SSE: failed to serialize progress event");
                }
            }
        }

        debug!(day = %day, "SSE: day progress stream finished");
    };

    Ok(Sse::new(stream).keep_alive(lifelog_common::sse::keep_alive()))
}

/// GET /events
pub async fn event_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    lifelog_common::sse::create_event_bus_sse_stream("lifelog-cc", &state.event_bus)
}

/// Build day progress routes
pub fn progress_routes() -> Router<AppState> {
    Router::new().route("/days/:day/progress", get(day_progress_stream))
}
