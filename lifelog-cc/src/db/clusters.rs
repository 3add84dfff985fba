//! Cluster and membership persistence

use chrono::{NaiveDate, Utc};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use super::{format_timestamp, parse_stored_day, parse_timestamp, parse_uuid};
use crate::error::DedupResult;
use crate::models::{DisplayLine, LineClusterMembership, LineId, SemanticCluster};
use crate::utils::{retry_on_lock, DEFAULT_MAX_LOCK_WAIT_MS};

/// Everything a completed computation writes for one day
#[derive(Debug, Clone, Default)]
pub struct DayOutcome {
    pub clusters: Vec<SemanticCluster>,
    pub memberships: Vec<LineClusterMembership>,
    /// Display lines per record, in record order
    pub record_projections: Vec<(Uuid, Vec<DisplayLine>)>,
    /// Why the lines are stored verbatim instead of deduplicated
    pub degraded: Option<String>,
}

/// Replace a day's clusters and complete its records in one transaction
///
/// Only records still in `processing` are completed; a record ingested while
/// the day was computing stays pending and triggers the next recompute.
pub async fn persist_day_outcome(
    pool: &SqlitePool,
    day: NaiveDate,
    outcome: &DayOutcome,
) -> DedupResult<()> {
    let day_str = day.to_string();
    let now = format_timestamp(&Utc::now());

    // Serialize before touching the database
    let mut record_rows = Vec::with_capacity(outcome.record_projections.len());
    for (record_id, lines) in &outcome.record_projections {
        record_rows.push((record_id.to_string(), serde_json::to_string(lines)?));
    }

    retry_on_lock("persist_day_outcome", DEFAULT_MAX_LOCK_WAIT_MS, || async {
        let mut tx = pool.begin().await?;

        sqlx::query("DELETE FROM line_cluster_memberships WHERE day = ?")
            .bind(&day_str)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM semantic_clusters WHERE day = ?")
            .bind(&day_str)
            .execute(&mut *tx)
            .await?;

        for cluster in &outcome.clusters {
            sqlx::query(
                r#"
                INSERT INTO semantic_clusters (
                    id, day, theme, canonical_text, confidence, member_count, is_unique
                ) VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(cluster.id.to_string())
            .bind(&day_str)
            .bind(&cluster.theme)
            .bind(&cluster.canonical_text)
            .bind(cluster.confidence)
            .bind(cluster.member_count as i64)
            .bind(cluster.is_unique)
            .execute(&mut *tx)
            .await?;
        }

        for membership in &outcome.memberships {
            sqlx::query(
                r#"
                INSERT INTO line_cluster_memberships (
                    record_id, line_index, cluster_id, day, speaker, text, timestamp,
                    similarity, is_canonical
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(membership.line.record_id.to_string())
            .bind(membership.line.line_index as i64)
            .bind(membership.cluster_id.to_string())
            .bind(&day_str)
            .bind(&membership.speaker)
            .bind(&membership.text)
            .bind(format_timestamp(&membership.timestamp))
            .bind(membership.similarity)
            .bind(membership.is_canonical)
            .execute(&mut *tx)
            .await?;
        }

        for (record_id, display_content) in &record_rows {
            sqlx::query(
                r#"
                UPDATE conversations SET
                    status = 'completed',
                    display_content = ?,
                    processed_at = ?,
                    retry_count = 0,
                    last_error = ?,
                    deduplicated = ?
                WHERE id = ? AND status = 'processing'
                "#,
            )
            .bind(display_content)
            .bind(&now)
            .bind(&outcome.degraded)
            .bind(outcome.degraded.is_none())
            .bind(record_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    })
    .await?;

    tracing::debug!(
        day = %day,
        clusters = outcome.clusters.len(),
        memberships = outcome.memberships.len(),
        deduplicated = outcome.degraded.is_none(),
        "Persisted day outcome"
    );
    Ok(())
}

/// Clusters of a day, largest first
pub async fn clusters_for_day(pool: &SqlitePool, day: NaiveDate) -> DedupResult<Vec<SemanticCluster>> {
    let rows = sqlx::query(
        r#"
        SELECT id, day, theme, canonical_text, confidence, member_count, is_unique
        FROM semantic_clusters
        WHERE day = ?
        ORDER BY member_count DESC, id
        "#,
    )
    .bind(day.to_string())
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| {
            let id: String = row.get("id");
            let day: String = row.get("day");
            Ok(SemanticCluster {
                id: parse_uuid("cluster id", &id)?,
                day: parse_stored_day(&day)?,
                theme: row.get("theme"),
                canonical_text: row.get("canonical_text"),
                confidence: row.get("confidence"),
                member_count: row.get::<i64, _>("member_count").max(0) as usize,
                is_unique: row.get("is_unique"),
            })
        })
        .collect()
}

/// Memberships of a day in conversation order
///
/// Records follow the same order as `records::records_for_day`, lines within
/// a record follow their index.
pub async fn memberships_for_day(
    pool: &SqlitePool,
    day: NaiveDate,
) -> DedupResult<Vec<LineClusterMembership>> {
    let rows = sqlx::query(
        r#"
        SELECT m.record_id, m.line_index, m.cluster_id, m.day, m.speaker, m.text,
               m.timestamp, m.similarity, m.is_canonical
        FROM line_cluster_memberships m
        LEFT JOIN conversations c ON c.id = m.record_id
        WHERE m.day = ?
        ORDER BY c.started_at, m.record_id, m.line_index
        "#,
    )
    .bind(day.to_string())
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| {
            let record_id: String = row.get("record_id");
            let cluster_id: String = row.get("cluster_id");
            let day: String = row.get("day");
            let timestamp: String = row.get("timestamp");
            Ok(LineClusterMembership {
                line: LineId {
                    record_id: parse_uuid("record_id", &record_id)?,
                    line_index: row.get::<i64, _>("line_index").max(0) as u32,
                },
                cluster_id: parse_uuid("cluster_id", &cluster_id)?,
                day: parse_stored_day(&day)?,
                speaker: row.get("speaker"),
                text: row.get("text"),
                timestamp: parse_timestamp("timestamp", &timestamp)?,
                similarity: row.get("similarity"),
                is_canonical: row.get("is_canonical"),
            })
        })
        .collect()
}
