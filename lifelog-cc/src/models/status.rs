//! Processing state machine for conversation records
//!
//! Records progress PENDING → QUEUED → PROCESSING → COMPLETED | FAILED.
//! Transitions only move forward, except FAILED → QUEUED (retry) and
//! COMPLETED → PROCESSING (the whole day is recomputed, either forced or
//! because a new record joined it). The guards live in the UPDATE statements
//! of `db::records`.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::DedupError;

/// Lifecycle status of a conversation record (and, aggregated, of a day)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStatus {
    /// Ingested, not yet scheduled
    Pending,
    /// Waiting for the background scheduler
    Queued,
    /// Computation in flight
    Processing,
    /// Projection persisted
    Completed,
    /// Last computation failed
    Failed,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::Pending => "pending",
            ProcessingStatus::Queued => "queued",
            ProcessingStatus::Processing => "processing",
            ProcessingStatus::Completed => "completed",
            ProcessingStatus::Failed => "failed",
        }
    }

    /// Aggregate per-record statuses into the status of their day
    ///
    /// Any in-flight record makes the day `processing`; otherwise a failure
    /// dominates, then queued work, then pending work. A day is `completed`
    /// only when every record is.
    pub fn aggregate<I>(statuses: I) -> Option<ProcessingStatus>
    where
        I: IntoIterator<Item = ProcessingStatus>,
    {
        let mut seen = [false; 5];
        let mut any = false;
        for status in statuses {
            any = true;
            seen[status.rank()] = true;
        }
        if !any {
            return None;
        }

        use ProcessingStatus::*;
        let order = [Processing, Failed, Queued, Pending, Completed];
        order.into_iter().find(|s| seen[s.rank()])
    }

    fn rank(&self) -> usize {
        match self {
            ProcessingStatus::Pending => 0,
            ProcessingStatus::Queued => 1,
            ProcessingStatus::Processing => 2,
            ProcessingStatus::Completed => 3,
            ProcessingStatus::Failed => 4,
        }
    }
}

impl fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessingStatus {
    type Err = DedupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ProcessingStatus::Pending),
            "queued" => Ok(ProcessingStatus::Queued),
            "processing" => Ok(ProcessingStatus::Processing),
            "completed" => Ok(ProcessingStatus::Completed),
            "failed" => Ok(ProcessingStatus::Failed),
            other => Err(DedupError::Validation(format!("Unknown status: {}", other))),
        }
    }
}

/// Scheduling priority
///
/// Stored as an integer rank so the queue query can order by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Normal,
    High,
    Urgent,
}

impl Priority {
    pub fn rank(&self) -> i64 {
        match self {
            Priority::Low => 0,
            Priority::Normal => 1,
            Priority::High => 2,
            Priority::Urgent => 3,
        }
    }

    pub fn from_rank(rank: i64) -> Priority {
        match rank {
            i64::MIN..=0 => Priority::Low,
            1 => Priority::Normal,
            2 => Priority::High,
            _ => Priority::Urgent,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = DedupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "urgent" => Ok(Priority::Urgent),
            other => Err(DedupError::Validation(format!("Unknown priority: {}", other))),
        }
    }
}

/// Parse a `YYYY-MM-DD` day bucket
pub fn parse_day(raw: &str) -> Result<NaiveDate, DedupError> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|e| DedupError::Validation(format!("Invalid day '{}': {}", raw, e)))
}

/// Read-only status summary of a day
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DayStatus {
    pub day: NaiveDate,
    pub status: ProcessingStatus,
    /// Highest priority among the day's records
    pub priority: Priority,
    /// Most recent completion time across the day's records
    pub processed_at: Option<DateTime<Utc>>,
    pub record_count: usize,
    /// Failures recorded since the last success
    pub retry_count: u32,
    pub last_error: Option<String>,
}

impl DayStatus {
    /// Whether automatic retries are used up for a failed day
    pub fn retries_exhausted(&self, max_retries: u32) -> bool {
        self.status == ProcessingStatus::Failed && self.retry_count > max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ProcessingStatus::*;

    #[test]
    fn test_aggregate() {
        assert_eq!(ProcessingStatus::aggregate(Vec::new()), None);
        assert_eq!(ProcessingStatus::aggregate([Completed, Completed]), Some(Completed));
        assert_eq!(ProcessingStatus::aggregate([Completed, Pending]), Some(Pending));
        assert_eq!(ProcessingStatus::aggregate([Queued, Failed]), Some(Failed));
        assert_eq!(ProcessingStatus::aggregate([Failed, Processing]), Some(Processing));
    }

    #[test]
    fn test_priority_ordering_and_parsing() {
        assert!(Priority::Urgent > Priority::High);
        assert!(Priority::Low < Priority::Normal);
        assert_eq!("HIGH".parse::<Priority>().unwrap(), Priority::High);
        assert!("critical".parse::<Priority>().is_err());
        assert_eq!(Priority::from_rank(Priority::Urgent.rank()), Priority::Urgent);
    }

    #[test]
    fn test_parse_day() {
        assert_eq!(parse_day("2024-03-09").unwrap(), NaiveDate::from_ymd_opt(2024, 3, 9).unwrap());
        assert!(matches!(parse_day("2024-13-01"), Err(DedupError::Validation(_))));
        assert!(parse_day("yesterday").is_err());
    }

    #[test]
    fn test_status_serde_lowercase() {
        assert_eq!(serde_json::to_string(&Completed).unwrap(), "\"completed\"");
        assert_eq!("queued".parse::<ProcessingStatus>().unwrap(), Queued);
    }
}
