//! Conversation projection
//!
//! Builds the display sequence of a day from its lines and clusters, plus the
//! cluster/membership rows that make the original sequence recoverable.

use chrono::NaiveDate;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use super::clusterer::LineCluster;
use crate::db::clusters::DayOutcome;
use crate::models::{
    DayProjection, DisplayKind, DisplayLine, LineClusterMembership, LineId, SemanticCluster,
    SpokenLine,
};

/// Namespace for deterministic cluster ids
const CLUSTER_ID_NAMESPACE: Uuid = Uuid::from_u128(0x6c69_6665_6c6f_4763_a5e1_c1a5_7e72_0001);

/// Words of the canonical text used as the cluster theme
const THEME_WORDS: usize = 6;

/// Cluster id derived from the day and the canonical line, stable across recomputes
pub fn cluster_id(day: NaiveDate, canonical: &LineId) -> Uuid {
    let name = format!("{}:{}:{}", day, canonical.record_id, canonical.line_index);
    Uuid::new_v5(&CLUSTER_ID_NAMESPACE, name.as_bytes())
}

/// Short label for a cluster
pub fn theme_label(text: &str) -> String {
    let words: Vec<&str> = text.split_whitespace().take(THEME_WORDS).collect();
    words
        .join(" ")
        .trim_end_matches(|c: char| c.is_ascii_punctuation())
        .to_string()
}

/// A day's projection together with the rows to persist for it
#[derive(Debug, Clone)]
pub struct ProjectionOutput {
    pub projection: DayProjection,
    pub outcome: DayOutcome,
}

/// Build the display projection of a day
///
/// `clusters` index into `clustered`, a subset of `lines`. Lines not in any
/// cluster render verbatim. The output keeps the input order of `lines` and
/// only ever omits lines. `record_ids` lists every record of the day so
/// records without spoken lines still get an (empty) stored projection.
pub fn build_projection(
    day: NaiveDate,
    record_ids: &[Uuid],
    lines: &[SpokenLine],
    clustered: &[SpokenLine],
    clusters: &[LineCluster],
) -> ProjectionOutput {
    let mut semantic = Vec::with_capacity(clusters.len());
    let mut memberships = Vec::new();
    // Line → (cluster id, hidden variations) for canonical lines of real clusters
    let mut canonical_of: HashMap<LineId, (Uuid, usize)> = HashMap::new();
    let mut hidden: HashSet<LineId> = HashSet::new();

    for cluster in clusters {
        let canonical_line = &clustered[cluster.canonical];
        let id = cluster_id(day, &canonical_line.id);

        semantic.push(SemanticCluster {
            id,
            day,
            theme: theme_label(&canonical_line.text),
            canonical_text: canonical_line.text.clone(),
            confidence: cluster.confidence,
            member_count: cluster.members.len(),
            is_unique: cluster.is_singleton(),
        });

        for (&member, &similarity) in cluster.members.iter().zip(&cluster.similarity_to_canonical) {
            let line = &clustered[member];
            let is_canonical = member == cluster.canonical;
            memberships.push(LineClusterMembership {
                line: line.id,
                cluster_id: id,
                day,
                speaker: line.speaker.clone(),
                text: line.text.clone(),
                timestamp: line.timestamp,
                similarity: similarity.clamp(0.0, 1.0),
                is_canonical,
            });
            if !is_canonical {
                hidden.insert(line.id);
            }
        }

        if !cluster.is_singleton() {
            canonical_of.insert(canonical_line.id, (id, cluster.members.len() - 1));
        }
    }

    let display: Vec<DisplayLine> = lines
        .iter()
        .filter(|line| !hidden.contains(&line.id))
        .map(|line| match canonical_of.get(&line.id) {
            Some(&(id, hidden_variations)) => DisplayLine {
                kind: DisplayKind::Canonical,
                cluster_id: Some(id),
                hidden_variations,
                ..DisplayLine::unique(line)
            },
            None => DisplayLine::unique(line),
        })
        .collect();

    let mut per_record: HashMap<Uuid, Vec<DisplayLine>> = HashMap::new();
    for line in &display {
        per_record.entry(line.line.record_id).or_default().push(line.clone());
    }
    let record_projections = record_ids
        .iter()
        .map(|id| (*id, per_record.remove(id).unwrap_or_default()))
        .collect();

    ProjectionOutput {
        projection: DayProjection::from_lines(day, display, true),
        outcome: DayOutcome {
            clusters: semantic,
            memberships,
            record_projections,
            degraded: None,
        },
    }
}

/// Every line rendered verbatim; used when clustering data is unusable
///
/// The projection is marked as not deduplicated and `reason` is stored with
/// the day so later reads report the same degradation.
pub fn unique_projection(
    day: NaiveDate,
    record_ids: &[Uuid],
    lines: &[SpokenLine],
    reason: String,
) -> ProjectionOutput {
    let mut output = build_projection(day, record_ids, lines, &[], &[]);
    output.projection.deduplicated = false;
    output.outcome.degraded = Some(reason);
    output
}

/// Reconstruct the full original line sequence of a day
///
/// Visible lines come from the projection, hidden ones from the membership
/// rows. Records follow `record_order` (the day's records as returned by
/// `records::records_for_day`), lines within a record their index. Records
/// missing from `record_order` go last.
pub fn recover_original(
    projection: &DayProjection,
    memberships: &[LineClusterMembership],
    record_order: &[Uuid],
) -> Vec<SpokenLine> {
    let mut by_id: HashMap<LineId, SpokenLine> = HashMap::new();
    for line in &projection.lines {
        by_id.insert(line.line, line.to_spoken_line());
    }
    for membership in memberships {
        by_id.entry(membership.line).or_insert_with(|| SpokenLine {
            id: membership.line,
            speaker: membership.speaker.clone(),
            text: membership.text.clone(),
            timestamp: membership.timestamp,
        });
    }

    let position: HashMap<Uuid, usize> = record_order
        .iter()
        .enumerate()
        .map(|(i, id)| (*id, i))
        .collect();
    let rank = |record_id: &Uuid| position.get(record_id).copied().unwrap_or(usize::MAX);

    let mut lines: Vec<SpokenLine> = by_id.into_values().collect();
    lines.sort_by(|a, b| {
        rank(&a.id.record_id)
            .cmp(&rank(&b.id.record_id))
            .then(a.id.record_id.cmp(&b.id.record_id))
            .then(a.id.line_index.cmp(&b.id.line_index))
    });
    lines
}
