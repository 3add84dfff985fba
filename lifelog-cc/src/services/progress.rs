//! Per-day progress channel
//!
//! Live progress of in-flight computations, keyed by day. Delivery is
//! at-least-once to current subscribers only; nothing is replayed to late
//! subscribers. A subscription ends after a terminal event.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;

use crate::error::ErrorInfo;
use crate::models::DayProjection;

/// Buffered events per day before slow subscribers start lagging
const DAY_CHANNEL_CAPACITY: usize = 64;

/// Progress of one day's computation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProgressEvent {
    Started {
        day: NaiveDate,
    },
    Progress {
        day: NaiveDate,
        /// Fraction done, 0.0 to 1.0
        progress: f64,
        stage: String,
    },
    Completed {
        day: NaiveDate,
        projection: DayProjection,
    },
    Failed {
        day: NaiveDate,
        error: ErrorInfo,
    },
}

impl ProgressEvent {
    pub fn day(&self) -> NaiveDate {
        match self {
            ProgressEvent::Started { day }
            | ProgressEvent::Progress { day, .. }
            | ProgressEvent::Completed { day, .. }
            | ProgressEvent::Failed { day, .. } => *day,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ProgressEvent::Completed { .. } | ProgressEvent::Failed { .. })
    }

    /// SSE event name
    pub fn event_name(&self) -> &'static str {
        match self {
            ProgressEvent::Started { .. } => "started",
            ProgressEvent::Progress { .. } => "progress",
            ProgressEvent::Completed { .. } => "completed",
            ProgressEvent::Failed { .. } => "failed",
        }
    }
}

/// Day-keyed broadcast hub
#[derive(Default)]
pub struct ProgressChannel {
    senders: Mutex<HashMap<NaiveDate, broadcast::Sender<ProgressEvent>>>,
}

impl ProgressChannel {
    pub fn new() -> Self {
        Self::default()
    }

    fn senders(&self) -> MutexGuard<'_, HashMap<NaiveDate, broadcast::Sender<ProgressEvent>>> {
        self.senders.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Subscribe to the next events of `day`
    pub fn subscribe(&self, day: NaiveDate) -> ProgressSubscription {
        let mut senders = self.senders();
        senders.retain(|_, tx| tx.receiver_count() > 0);
        let rx = senders
            .entry(day)
            .or_insert_with(|| broadcast::channel(DAY_CHANNEL_CAPACITY).0)
            .subscribe();
        ProgressSubscription { day, rx, finished: false }
    }

    /// Deliver an event to the day's current subscribers
    ///
    /// Returns the number of subscribers reached. A terminal event closes the
    /// day's channel after delivery.
    pub fn publish(&self, event: ProgressEvent) -> usize {
        let day = event.day();
        let terminal = event.is_terminal();
        let mut senders = self.senders();

        let Some(tx) = senders.get(&day) else {
            return 0;
        };
        let delivered = tx.send(event).unwrap_or(0);

        if terminal || tx.receiver_count() == 0 {
            senders.remove(&day);
        }
        delivered
    }

    pub fn subscriber_count(&self, day: NaiveDate) -> usize {
        self.senders()
            .get(&day)
            .map_or(0, |tx| tx.receiver_count())
    }

    /// Days with an open channel
    pub fn active_days(&self) -> usize {
        self.senders().len()
    }
}

/// Receiving end for one day
pub struct ProgressSubscription {
    day: NaiveDate,
    rx: broadcast::Receiver<ProgressEvent>,
    finished: bool,
}

impl ProgressSubscription {
    pub fn day(&self) -> NaiveDate {
        self.day
    }

    /// Next event; `None` once a terminal event was delivered or the channel closed
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        if self.finished {
            return None;
        }
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    if event.is_terminal() {
                        self.finished = true;
                    }
                    return Some(event);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(day = %self.day, skipped, "Progress subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.finished = true;
                    return None;
                }
            }
        }
    }
}
