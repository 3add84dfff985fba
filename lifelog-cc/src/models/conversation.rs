//! Conversation records and the spoken lines derived from them

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::status::{Priority, ProcessingStatus};

/// A day's conversation record as stored by ingestion
///
/// `content` is owned by the ingestion adapters and never rewritten here;
/// the subsystem only touches the status/priority/projection columns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub id: Uuid,
    pub namespace: String,
    pub source_id: String,
    pub day: NaiveDate,
    pub title: Option<String>,
    /// Raw content: JSON node array or plain `Speaker: text` transcript
    pub content: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: ProcessingStatus,
    pub priority: Priority,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// Record as handed over by an ingestion adapter
#[derive(Debug, Clone)]
pub struct NewConversationRecord {
    pub namespace: String,
    pub source_id: String,
    pub day: NaiveDate,
    pub title: Option<String>,
    pub content: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// Identity of a line: its record and its position within that record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineId {
    pub record_id: Uuid,
    pub line_index: u32,
}

/// A single speaker-attributed utterance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpokenLine {
    pub id: LineId,
    pub speaker: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl SpokenLine {
    pub fn word_count(&self) -> usize {
        self.text.split_whitespace().count()
    }
}
