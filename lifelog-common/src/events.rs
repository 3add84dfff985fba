//! Event types for the lifelog event system
//!
//! Provides service-wide event definitions and the EventBus. Per-day progress
//! for in-flight computations travels on a separate, day-keyed channel owned by
//! the dedup service; this bus carries coarse lifecycle notifications only.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Lifelog service events
///
/// Events are broadcast via EventBus and can be serialized for SSE transmission.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum LifelogEvent {
    /// Records of a day were queued for background processing
    DayQueued {
        day: NaiveDate,
        /// Priority label ("low", "normal", "high", "urgent")
        priority: String,
        /// Number of records affected
        records: u64,
        timestamp: DateTime<Utc>,
    },

    /// A day's display projection was computed and persisted
    ///
    /// Triggers:
    /// - SSE: refresh any open day view
    DayProcessed {
        day: NaiveDate,
        /// Lines shown in the projection
        visible_lines: usize,
        /// Lines elided as near-duplicates
        hidden_lines: usize,
        /// Wall time of the computation
        elapsed_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// Processing a day failed
    DayFailed {
        day: NaiveDate,
        /// Error kind ("provider", "storage", ...)
        kind: String,
        message: String,
        /// Whether the scheduler will retry automatically
        will_retry: bool,
        timestamp: DateTime<Utc>,
    },

    /// A background scheduler run finished
    SchedulerRunCompleted {
        /// Days selected from the queue
        selected: usize,
        completed: usize,
        failed: usize,
        /// Delay until the next run (seconds)
        next_run_in_secs: u64,
        timestamp: DateTime<Utc>,
    },
}

impl LifelogEvent {
    /// Get event type as string for filtering
    pub fn event_type(&self) -> &str {
        match self {
            LifelogEvent::DayQueued { .. } => "DayQueued",
            LifelogEvent::DayProcessed { .. } => "DayProcessed",
            LifelogEvent::DayFailed { .. } => "DayFailed",
            LifelogEvent::SchedulerRunCompleted { .. } => "SchedulerRunCompleted",
        }
    }
}

/// Central event distribution bus for service-wide events
///
/// The EventBus uses tokio::broadcast internally, providing:
/// - Non-blocking publish (slow subscribers don't block producers)
/// - Multiple concurrent subscribers
/// - Lagged message detection for slow subscribers
///
/// # Examples
///
/// ```
/// use lifelog_common::events::{EventBus, LifelogEvent};
///
/// let event_bus = EventBus::new(100);
/// let mut rx = event_bus.subscribe();
///
/// event_bus.emit_lossy(LifelogEvent::SchedulerRunCompleted {
///     selected: 0,
///     completed: 0,
///     failed: 0,
///     next_run_in_secs: 7200,
///     timestamp: chrono::Utc::now(),
/// });
///
/// assert!(rx.try_recv().is_ok());
/// ```
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<LifelogEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    ///
    /// Events emitted before subscription are not received.
    pub fn subscribe(&self) -> broadcast::Receiver<LifelogEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Err` if no subscribers are listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: LifelogEvent,
    ) -> std::result::Result<usize, broadcast::error::SendError<LifelogEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: LifelogEvent) {
        let _ = self.tx.send(event);
    }

    /// Get the current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Get the configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
