//! lifelog-cc library interface
//!
//! The Clean Up Crew: semantic deduplication of daily conversations and the
//! adaptive delivery of their condensed projections. Exposed as a library so
//! integration tests can build the router and services directly.

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod services;
pub mod utils;

pub use crate::error::{ApiError, ApiResult, DedupError, DedupResult};

use axum::Router;
use chrono::{DateTime, Utc};
use lifelog_common::events::EventBus;
use sqlx::SqlitePool;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::services::{CleanUpCrew, SchedulerHandle};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub db: SqlitePool,
    /// Service-wide lifecycle events, streamed on `/events`
    pub event_bus: EventBus,
    pub crew: Arc<CleanUpCrew>,
    /// Trigger for an immediate scheduler run
    pub scheduler: SchedulerHandle,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
}

impl AppState {
    pub fn new(
        db: SqlitePool,
        event_bus: EventBus,
        crew: Arc<CleanUpCrew>,
        scheduler: SchedulerHandle,
    ) -> Self {
        Self {
            db,
            event_bus,
            crew,
            scheduler,
            startup_time: Utc::now(),
        }
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    use axum::routing::get;

    Router::new()
        .merge(api::conversation_routes())
        .merge(api::progress_routes())
        .merge(api::scheduler_routes())
        .merge(api::health_routes())
        .route("/events", get(api::event_stream))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
