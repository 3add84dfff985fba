//! Database access for lifelog-cc
//!
//! The `conversations` table is shared with the ingestion adapters; this
//! service owns the status/priority/projection columns on it plus the cluster,
//! membership, embedding and settings tables.

pub mod clusters;
pub mod embeddings;
pub mod records;
pub mod settings;

use anyhow::Result;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use sqlx::SqlitePool;
use std::path::Path;

use crate::error::{DedupError, DedupResult};

/// Connections in the service pool
pub const POOL_MAX_CONNECTIONS: u32 = 8;

/// Open the service database and create missing tables
pub async fn init_database_pool(db_path: &Path) -> Result<SqlitePool> {
    let pool = lifelog_common::db::open_pool(db_path, POOL_MAX_CONNECTIONS).await?;
    init_tables(&pool).await?;
    Ok(pool)
}

/// Create lifelog-cc tables if they don't exist
pub async fn init_tables(pool: &SqlitePool) -> DedupResult<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS conversations (
            id TEXT PRIMARY KEY,
            namespace TEXT NOT NULL,
            source_id TEXT NOT NULL,
            day TEXT NOT NULL,
            title TEXT,
            content TEXT NOT NULL,
            started_at TEXT NOT NULL,
            ended_at TEXT,
            status TEXT NOT NULL DEFAULT 'pending',
            priority INTEGER NOT NULL DEFAULT 1,
            retry_count INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            queued_at TEXT,
            processed_at TEXT,
            display_content TEXT,
            deduplicated INTEGER NOT NULL DEFAULT 1,
            UNIQUE (namespace, source_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_conversations_day ON conversations(day)")
        .execute(pool)
        .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_conversations_queue ON conversations(status, priority, day)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS semantic_clusters (
            id TEXT PRIMARY KEY,
            day TEXT NOT NULL,
            theme TEXT NOT NULL,
            canonical_text TEXT NOT NULL,
            confidence REAL NOT NULL CHECK (confidence >= 0.0 AND confidence <= 1.0),
            member_count INTEGER NOT NULL,
            is_unique INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_semantic_clusters_day ON semantic_clusters(day)")
        .execute(pool)
        .await?;

    // A line belongs to at most one cluster
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS line_cluster_memberships (
            record_id TEXT NOT NULL,
            line_index INTEGER NOT NULL,
            cluster_id TEXT NOT NULL REFERENCES semantic_clusters(id) ON DELETE CASCADE,
            day TEXT NOT NULL,
            speaker TEXT NOT NULL,
            text TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            similarity REAL NOT NULL CHECK (similarity >= 0.0 AND similarity <= 1.0),
            is_canonical INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (record_id, line_index)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_memberships_day ON line_cluster_memberships(day)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS line_embeddings (
            text_hash TEXT NOT NULL,
            model TEXT NOT NULL,
            dimensions INTEGER NOT NULL,
            vector BLOB NOT NULL,
            created_at TEXT NOT NULL,
            PRIMARY KEY (text_hash, model)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Timestamps are stored as fixed-width UTC RFC 3339 so they sort as text
pub(crate) fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn parse_timestamp(column: &str, raw: &str) -> DedupResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DedupError::Storage(format!("Failed to parse {}: {}", column, e)))
}

pub(crate) fn parse_optional_timestamp(
    column: &str,
    raw: Option<String>,
) -> DedupResult<Option<DateTime<Utc>>> {
    raw.map(|s| parse_timestamp(column, &s)).transpose()
}

pub(crate) fn parse_stored_day(raw: &str) -> DedupResult<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|e| DedupError::Storage(format!("Failed to parse day '{}': {}", raw, e)))
}

pub(crate) fn parse_uuid(column: &str, raw: &str) -> DedupResult<uuid::Uuid> {
    uuid::Uuid::parse_str(raw)
        .map_err(|e| DedupError::Storage(format!("Failed to parse {}: {}", column, e)))
}
