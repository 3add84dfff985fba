//! HTTP API handlers for lifelog-cc

pub mod conversation;
pub mod health;
pub mod progress;
pub mod scheduler;

pub use conversation::conversation_routes;
pub use health::health_routes;
pub use progress::{event_stream, progress_routes};
pub use scheduler::scheduler_routes;
