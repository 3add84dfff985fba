//! Semantic clusters and line memberships

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::conversation::LineId;

/// Group of near-duplicate lines within a day
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SemanticCluster {
    pub id: Uuid,
    pub day: NaiveDate,
    /// Short label derived from the canonical line
    pub theme: String,
    pub canonical_text: String,
    /// Mean pairwise similarity, 1.0 for singletons
    pub confidence: f64,
    pub member_count: usize,
    /// Singleton cluster: a unique line rather than a deduplicated group
    pub is_unique: bool,
}

/// Membership of one line in one cluster
///
/// Carries a copy of the line so hidden variations can be shown again
/// without re-parsing the raw record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineClusterMembership {
    pub line: LineId,
    pub cluster_id: Uuid,
    pub day: NaiveDate,
    pub speaker: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    /// Similarity to the cluster's canonical line, in [0, 1]
    pub similarity: f64,
    pub is_canonical: bool,
}
