//! # Lifelog Common Library
//!
//! Shared code for the lifelog services including:
//! - Error types
//! - Event types (LifelogEvent enum) and the EventBus
//! - Bootstrap configuration loading and root folder resolution
//! - SQLite pool helpers
//! - SSE utilities

pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod sse;

pub use error::{Error, Result};
