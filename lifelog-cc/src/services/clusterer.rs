//! Similarity clustering of spoken lines
//!
//! Agglomerative complete-linkage over cosine similarity. Two clusters are
//! merged only when every pair of lines across them is more similar than the
//! threshold; the most similar eligible pair is always merged first. Merge
//! order does not depend on the threshold, so a higher threshold yields a
//! refinement of the clusters produced by a lower one.
//!
//! Pure and synchronous; callers run it on the blocking pool.

use std::cmp::Ordering;

use crate::error::{DedupError, DedupResult};
use crate::models::SpokenLine;

/// Clustering parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClusterParams {
    /// Merge only when the complete linkage exceeds this value
    pub threshold: f64,
    pub allow_cross_speaker: bool,
    /// Larger inputs are clustered in independent chronological windows
    pub max_window_lines: usize,
}

/// One cluster over the clusterer's input, by input position
#[derive(Debug, Clone, PartialEq)]
pub struct LineCluster {
    /// Member positions, ascending
    pub members: Vec<usize>,
    pub canonical: usize,
    /// Mean pairwise similarity; 1.0 for a singleton
    pub confidence: f64,
    /// Similarity of each member to the canonical line, parallel to `members`
    pub similarity_to_canonical: Vec<f64>,
}

impl LineCluster {
    pub fn is_singleton(&self) -> bool {
        self.members.len() == 1
    }
}

/// Cosine similarity clamped to [0, 1]; zero vectors are dissimilar to everything
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    let mut dot = 0.0_f64;
    let mut norm_a = 0.0_f64;
    let mut norm_b = 0.0_f64;

    for (va, vb) in a.iter().zip(b.iter()) {
        let (va, vb) = (*va as f64, *vb as f64);
        dot += va * vb;
        norm_a += va * va;
        norm_b += vb * vb;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    (dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(0.0, 1.0)
}

/// Reject vectors the similarity math cannot use
pub fn validate_vectors<V: AsRef<[f32]>>(vectors: &[V]) -> DedupResult<()> {
    let Some(first) = vectors.first() else {
        return Ok(());
    };
    let dimensions = first.as_ref().len();
    if dimensions == 0 {
        return Err(DedupError::Clustering("empty embedding vector".to_string()));
    }

    for (idx, vector) in vectors.iter().enumerate() {
        let vector = vector.as_ref();
        if vector.len() != dimensions {
            return Err(DedupError::Clustering(format!(
                "dimension mismatch at line {}: expected {}, got {}",
                idx,
                dimensions,
                vector.len()
            )));
        }
        if vector.iter().any(|v| !v.is_finite()) {
            return Err(DedupError::Clustering(format!(
                "non-finite value in embedding of line {}",
                idx
            )));
        }
    }
    Ok(())
}

/// Cluster `lines` using the parallel `vectors`
///
/// Every input position ends up in exactly one cluster. Output clusters are
/// ordered by their first member.
pub fn cluster_lines<V: AsRef<[f32]>>(
    lines: &[SpokenLine],
    vectors: &[V],
    params: &ClusterParams,
) -> DedupResult<Vec<LineCluster>> {
    if lines.len() != vectors.len() {
        return Err(DedupError::Clustering(format!(
            "{} lines but {} vectors",
            lines.len(),
            vectors.len()
        )));
    }
    validate_vectors(vectors)?;
    if lines.is_empty() {
        return Ok(Vec::new());
    }

    // Chronological order, input position breaking ties
    let mut order: Vec<usize> = (0..lines.len()).collect();
    order.sort_by(|&a, &b| lines[a].timestamp.cmp(&lines[b].timestamp).then(a.cmp(&b)));

    let window = params.max_window_lines.max(2);
    let mut clusters = Vec::new();
    for chunk in order.chunks(window) {
        clusters.extend(cluster_window(chunk, lines, vectors, params));
    }

    clusters.sort_by_key(|c| c.members[0]);
    Ok(clusters)
}

fn cluster_window<V: AsRef<[f32]>>(
    positions: &[usize],
    lines: &[SpokenLine],
    vectors: &[V],
    params: &ClusterParams,
) -> Vec<LineCluster> {
    let n = positions.len();

    let mut sim = vec![vec![1.0_f64; n]; n];
    for i in 0..n {
        for j in (i + 1)..n {
            let s = cosine_similarity(vectors[positions[i]].as_ref(), vectors[positions[j]].as_ref());
            sim[i][j] = s;
            sim[j][i] = s;
        }
    }

    // Linkage between current clusters; speaker gating is folded in so it
    // survives the min-update on merge
    let mut link = sim.clone();
    if !params.allow_cross_speaker {
        for i in 0..n {
            for j in 0..n {
                if lines[positions[i]].speaker != lines[positions[j]].speaker {
                    link[i][j] = f64::NEG_INFINITY;
                }
            }
        }
    }

    let mut groups: Vec<Option<Vec<usize>>> = (0..n).map(|i| Some(vec![i])).collect();

    loop {
        let mut best: Option<(usize, usize, f64)> = None;
        for i in 0..n {
            if groups[i].is_none() {
                continue;
            }
            for j in (i + 1)..n {
                if groups[j].is_none() {
                    continue;
                }
                let l = link[i][j];
                if l > params.threshold && best.map_or(true, |(_, _, b)| l > b) {
                    best = Some((i, j, l));
                }
            }
        }

        let Some((i, j, _)) = best else {
            break;
        };

        let absorbed = groups[j].take().unwrap_or_default();
        if let Some(group) = groups[i].as_mut() {
            group.extend(absorbed);
        }
        for k in 0..n {
            if k != i && groups[k].is_some() {
                let merged = link[i][k].min(link[j][k]);
                link[i][k] = merged;
                link[k][i] = merged;
            }
        }
    }

    groups
        .into_iter()
        .flatten()
        .map(|mut local| {
            local.sort_unstable();
            finish_cluster(&local, positions, lines, &sim)
        })
        .collect()
}

fn finish_cluster(
    local: &[usize],
    positions: &[usize],
    lines: &[SpokenLine],
    sim: &[Vec<f64>],
) -> LineCluster {
    if local.len() == 1 {
        let only = positions[local[0]];
        return LineCluster {
            members: vec![only],
            canonical: only,
            confidence: 1.0,
            similarity_to_canonical: vec![1.0],
        };
    }

    let mean_to_others = |a: usize| -> f64 {
        let total: f64 = local.iter().filter(|&&b| b != a).map(|&b| sim[a][b]).sum();
        total / (local.len() - 1) as f64
    };

    let mut canonical_local = local[0];
    let mut canonical_score = mean_to_others(canonical_local);
    for &candidate in &local[1..] {
        let score = mean_to_others(candidate);
        if prefer_canonical(
            (score, &lines[positions[candidate]], positions[candidate]),
            (canonical_score, &lines[positions[canonical_local]], positions[canonical_local]),
        ) {
            canonical_local = candidate;
            canonical_score = score;
        }
    }

    let mut pair_total = 0.0;
    let mut pairs = 0usize;
    for (x, &a) in local.iter().enumerate() {
        for &b in &local[x + 1..] {
            pair_total += sim[a][b];
            pairs += 1;
        }
    }

    let mut members: Vec<(usize, f64)> = local
        .iter()
        .map(|&m| {
            let s = if m == canonical_local { 1.0 } else { sim[m][canonical_local] };
            (positions[m], s)
        })
        .collect();
    members.sort_by_key(|(pos, _)| *pos);

    LineCluster {
        canonical: positions[canonical_local],
        confidence: (pair_total / pairs as f64).clamp(0.0, 1.0),
        similarity_to_canonical: members.iter().map(|(_, s)| *s).collect(),
        members: members.into_iter().map(|(pos, _)| pos).collect(),
    }
}

/// Highest mean similarity, then longer text, then earlier timestamp, then earlier position
fn prefer_canonical(
    candidate: (f64, &SpokenLine, usize),
    current: (f64, &SpokenLine, usize),
) -> bool {
    let (c_score, c_line, c_pos) = candidate;
    let (k_score, k_line, k_pos) = current;

    let ordering = c_score
        .partial_cmp(&k_score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| c_line.text.chars().count().cmp(&k_line.text.chars().count()))
        .then_with(|| k_line.timestamp.cmp(&c_line.timestamp))
        .then_with(|| k_pos.cmp(&c_pos));

    ordering == Ordering::Greater
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::LineId;
    use chrono::{TimeZone, Utc};
    use uuid::Uuid;

    fn line(idx: u32, speaker: &str, text: &str) -> SpokenLine {
        SpokenLine {
            id: LineId { record_id: Uuid::nil(), line_index: idx },
            speaker: speaker.to_string(),
            text: text.to_string(),
            timestamp: Utc.with_ymd_and_hms(2024, 7, 14, 12, 0, idx).unwrap(),
        }
    }

    fn params(threshold: f64) -> ClusterParams {
        ClusterParams {
            threshold,
            allow_cross_speaker: true,
            max_window_lines: 300,
        }
    }

    /// Unit vector at `deg` degrees in the plane
    fn angle(deg: f64) -> Vec<f32> {
        let r = deg.to_radians();
        vec![r.cos() as f32, r.sin() as f32]
    }

    #[test]
    fn test_cosine_similarity_bounds() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-9);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn test_heat_lines_cluster_and_canonical_is_central() {
        let lines = vec![
            line(0, "John", "wow it is really hot"),
            line(1, "John", "wow it's really hot"),
            line(2, "John", "i hate this heat"),
            line(3, "John", "let's go inside"),
        ];
        let vectors = vec![angle(0.0), angle(10.0), angle(20.0), angle(80.0)];

        let clusters = cluster_lines(&lines, &vectors, &params(0.85)).unwrap();
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0].members, vec![0, 1, 2]);
        // Middle vector has the highest mean similarity
        assert_eq!(clusters[0].canonical, 1);
        assert_eq!(clusters[0].similarity_to_canonical[1], 1.0);
        assert!(clusters[0].confidence > 0.85 && clusters[0].confidence <= 1.0);
        assert!(clusters[1].is_singleton());
        assert_eq!(clusters[1].confidence, 1.0);
    }

    #[test]
    fn test_complete_linkage_rejects_chains() {
        // 0-1 and 1-2 are close, 0-2 is not
        let lines = vec![line(0, "A", "a a a"), line(1, "A", "b b b"), line(2, "A", "c c c")];
        let vectors = vec![angle(0.0), angle(25.0), angle(50.0)];
        let clusters = cluster_lines(&lines, &vectors, &params(0.85)).unwrap();
        assert_eq!(clusters.len(), 2);
        assert!(clusters.iter().all(|c| c.members.len() <= 2));
    }

    #[test]
    fn test_canonical_tie_prefers_longer_text() {
        let lines = vec![line(0, "A", "short one here"), line(1, "A", "a much longer line here")];
        let vectors = vec![angle(0.0), angle(0.0)];
        let clusters = cluster_lines(&lines, &vectors, &params(0.85)).unwrap();
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].canonical, 1);
    }

    #[test]
    fn test_canonical_tie_prefers_earlier_line() {
        let lines = vec![line(0, "A", "same text here"), line(1, "A", "same text here")];
        let vectors = vec![angle(5.0), angle(5.0)];
        let clusters = cluster_lines(&lines, &vectors, &params(0.5)).unwrap();
        assert_eq!(clusters[0].canonical, 0);
    }

    #[test]
    fn test_cross_speaker_gate() {
        let lines = vec![line(0, "John", "sounds good to me"), line(1, "Mary", "sounds good to me")];
        let vectors = vec![angle(0.0), angle(1.0)];

        let merged = cluster_lines(&lines, &vectors, &params(0.85)).unwrap();
        assert_eq!(merged.len(), 1);

        let gated = ClusterParams {
            allow_cross_speaker: false,
            ..params(0.85)
        };
        assert_eq!(cluster_lines(&lines, &vectors, &gated).unwrap().len(), 2);
    }

    #[test]
    fn test_threshold_monotonicity() {
        let lines: Vec<SpokenLine> = (0..8).map(|i| line(i, "A", "some words here")).collect();
        let vectors: Vec<Vec<f32>> = [0.0, 4.0, 9.0, 15.0, 22.0, 40.0, 43.0, 70.0]
            .iter()
            .map(|d| angle(*d))
            .collect();

        let cluster_of = |threshold: f64| -> Vec<usize> {
            let clusters = cluster_lines(&lines, &vectors, &params(threshold)).unwrap();
            let mut owner = vec![0usize; lines.len()];
            for (c, cluster) in clusters.iter().enumerate() {
                for &m in &cluster.members {
                    owner[m] = c;
                }
            }
            owner
        };

        let thresholds = [0.5, 0.7, 0.85, 0.95, 0.99];
        for pair in thresholds.windows(2) {
            let (coarse, fine) = (cluster_of(pair[0]), cluster_of(pair[1]));
            for a in 0..lines.len() {
                for b in 0..lines.len() {
                    if fine[a] == fine[b] {
                        assert_eq!(coarse[a], coarse[b], "τ={} split a pair τ={} kept", pair[0], pair[1]);
                    }
                }
            }
        }
    }

    #[test]
    fn test_windows_cluster_independently() {
        let lines: Vec<SpokenLine> = (0..4).map(|i| line(i, "A", "same thing again")).collect();
        let vectors = vec![angle(0.0); 4];
        let windowed = ClusterParams {
            max_window_lines: 2,
            ..params(0.85)
        };
        let clusters = cluster_lines(&lines, &vectors, &windowed).unwrap();
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0].members, vec![0, 1]);
        assert_eq!(clusters[1].members, vec![2, 3]);
    }

    #[test]
    fn test_malformed_vectors() {
        let lines = vec![line(0, "A", "a b c"), line(1, "A", "d e f")];
        let mismatch = vec![vec![1.0_f32, 0.0], vec![1.0_f32]];
        assert!(matches!(
            cluster_lines(&lines, &mismatch, &params(0.85)),
            Err(DedupError::Clustering(_))
        ));

        let nan = vec![vec![1.0_f32, 0.0], vec![f32::NAN, 0.0]];
        assert!(cluster_lines(&lines, &nan, &params(0.85)).is_err());
    }

    #[test]
    fn test_empty_input() {
        let vectors: Vec<Vec<f32>> = Vec::new();
        assert!(cluster_lines(&[], &vectors, &params(0.85)).unwrap().is_empty());
    }
}
