//! Display projection of a day: the condensed, ordered view with
//! near-duplicate lines elided

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::conversation::{LineId, SpokenLine};
use super::status::ProcessingStatus;
use crate::error::ErrorInfo;

/// Role of a line in the projection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisplayKind {
    /// Representative of a cluster with hidden variations
    Canonical,
    /// Line with no near-duplicates (or not eligible for clustering)
    Unique,
}

/// One visible line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayLine {
    #[serde(flatten)]
    pub line: LineId,
    pub speaker: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub kind: DisplayKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<Uuid>,
    /// Number of elided near-duplicates represented by this line
    pub hidden_variations: usize,
}

impl DisplayLine {
    /// Verbatim, unclustered rendering of a line
    pub fn unique(line: &SpokenLine) -> Self {
        Self {
            line: line.id,
            speaker: line.speaker.clone(),
            text: line.text.clone(),
            timestamp: line.timestamp,
            kind: DisplayKind::Unique,
            cluster_id: None,
            hidden_variations: 0,
        }
    }

    pub fn to_spoken_line(&self) -> SpokenLine {
        SpokenLine {
            id: self.line,
            speaker: self.speaker.clone(),
            text: self.text.clone(),
            timestamp: self.timestamp,
        }
    }
}

/// A day's display projection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DayProjection {
    pub day: NaiveDate,
    pub lines: Vec<DisplayLine>,
    /// Lines in the original conversation
    pub original_line_count: usize,
    /// Lines elided from the projection
    pub hidden_line_count: usize,
    /// Clusters with at least one hidden variation
    pub cluster_count: usize,
    /// False when this is the raw conversation served as a fallback
    pub deduplicated: bool,
}

impl DayProjection {
    pub fn from_lines(day: NaiveDate, lines: Vec<DisplayLine>, deduplicated: bool) -> Self {
        let hidden_line_count = lines.iter().map(|l| l.hidden_variations).sum::<usize>();
        let cluster_count = lines
            .iter()
            .filter(|l| l.kind == DisplayKind::Canonical)
            .count();
        Self {
            day,
            original_line_count: lines.len() + hidden_line_count,
            hidden_line_count,
            cluster_count,
            lines,
            deduplicated,
        }
    }

    /// Raw, non-deduplicated conversation
    pub fn raw(day: NaiveDate, lines: &[SpokenLine]) -> Self {
        Self::from_lines(day, lines.iter().map(DisplayLine::unique).collect(), false)
    }
}

/// How a caller wants to treat a computation already in flight for its day
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaitMode {
    /// Wait for the in-flight result (bounded by the request timeout)
    #[default]
    Block,
    /// Return `processing` immediately with an estimate
    NoWait,
}

/// Structured answer of `get_projection`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectionResult {
    pub day: NaiveDate,
    pub status: ProcessingStatus,
    pub projection: Option<DayProjection>,
    pub elapsed_ms: u64,
    pub cache_hit: bool,
    /// False when `projection` is the raw fallback (or absent)
    pub deduplicated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_remaining_ms: Option<u64>,
}
