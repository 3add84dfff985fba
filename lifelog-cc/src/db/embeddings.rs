//! Persistent line-embedding cache
//!
//! Vectors are keyed by (SHA-256 of the line text, model) and stored as
//! little-endian f32 BLOBs.

use chrono::Utc;
use sqlx::SqlitePool;
use std::collections::HashMap;

use super::format_timestamp;
use crate::error::{DedupError, DedupResult};
use crate::utils::{retry_on_lock, DEFAULT_MAX_LOCK_WAIT_MS};

pub fn f32_vec_to_blob(values: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * 4);
    for value in values {
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}

pub fn blob_to_f32_vec(blob: &[u8]) -> DedupResult<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return Err(DedupError::Storage(format!(
            "Invalid embedding blob length {}",
            blob.len()
        )));
    }
    Ok(blob
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

/// Look up stored vectors; missing hashes are simply absent from the result
pub async fn load_vectors(
    pool: &SqlitePool,
    model: &str,
    hashes: &[String],
) -> DedupResult<HashMap<String, Vec<f32>>> {
    let mut found = HashMap::new();
    if hashes.is_empty() {
        return Ok(found);
    }

    let mut conn = pool.acquire().await?;
    for hash in hashes {
        let blob: Option<Vec<u8>> = sqlx::query_scalar(
            "SELECT vector FROM line_embeddings WHERE text_hash = ? AND model = ?",
        )
        .bind(hash)
        .bind(model)
        .fetch_optional(&mut *conn)
        .await?;

        if let Some(blob) = blob {
            found.insert(hash.clone(), blob_to_f32_vec(&blob)?);
        }
    }
    Ok(found)
}

/// Store freshly computed vectors
pub async fn store_vectors(
    pool: &SqlitePool,
    model: &str,
    entries: &[(String, Vec<f32>)],
) -> DedupResult<()> {
    if entries.is_empty() {
        return Ok(());
    }

    let now = format_timestamp(&Utc::now());
    let rows: Vec<(&str, i64, Vec<u8>)> = entries
        .iter()
        .map(|(hash, vector)| (hash.as_str(), vector.len() as i64, f32_vec_to_blob(vector)))
        .collect();

    retry_on_lock("store_vectors", DEFAULT_MAX_LOCK_WAIT_MS, || async {
        let mut tx = pool.begin().await?;
        for (hash, dimensions, blob) in &rows {
            sqlx::query(
                r#"
                INSERT INTO line_embeddings (text_hash, model, dimensions, vector, created_at)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(text_hash, model) DO UPDATE SET
                    dimensions = excluded.dimensions,
                    vector = excluded.vector
                "#,
            )
            .bind(*hash)
            .bind(model)
            .bind(*dimensions)
            .bind(blob)
            .bind(&now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    })
    .await
}
