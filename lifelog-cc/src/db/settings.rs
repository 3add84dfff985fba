//! Settings database operations
//!
//! Runtime overrides for deduplication parameters, stored as key/value rows.
//! A row wins over the TOML file; a missing row keeps the configured value.

use sqlx::SqlitePool;

use crate::config::DedupConfig;
use crate::error::{DedupError, DedupResult};

/// Apply every `cc_*` override present in the settings table
///
/// Returns the number of overrides applied. The result is validated before
/// it replaces `config`.
pub async fn apply_dedup_overrides(pool: &SqlitePool, config: &mut DedupConfig) -> DedupResult<usize> {
    let mut updated = config.clone();
    let mut applied = 0usize;

    macro_rules! override_from {
        ($key:literal, $field:ident) => {
            if let Some(value) = get_setting(pool, $key).await? {
                tracing::debug!(key = $key, "Applying settings override");
                updated.$field = value;
                applied += 1;
            }
        };
    }

    override_from!("cc_similarity_threshold", similarity_threshold);
    override_from!("cc_min_words", min_words);
    override_from!("cc_embedding_batch_size", embedding_batch_size);
    override_from!("cc_allow_cross_speaker", allow_cross_speaker);
    override_from!("cc_max_window_lines", max_window_lines);
    override_from!("cc_background_interval_secs", background_interval_secs);
    override_from!("cc_batch_limit", batch_limit);
    override_from!("cc_scheduler_concurrency", scheduler_concurrency);
    override_from!("cc_max_backoff_secs", max_backoff_secs);
    override_from!("cc_compute_timeout_secs", compute_timeout_secs);
    override_from!("cc_max_retries", max_retries);
    override_from!("cc_max_concurrent_computations", max_concurrent_computations);
    override_from!("cc_expected_compute_ms", expected_compute_ms);

    updated.validate()?;
    *config = updated;
    Ok(applied)
}

/// Generic setting getter
pub async fn get_setting<T>(pool: &SqlitePool, key: &str) -> DedupResult<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let row: Option<(String,)> = sqlx::query_as("SELECT value FROM settings WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await?;

    match row {
        Some((value,)) => {
            let parsed = value.trim().parse::<T>().map_err(|e| {
                DedupError::Validation(format!("Invalid value for setting {}: {}", key, e))
            })?;
            Ok(Some(parsed))
        }
        None => Ok(None),
    }
}

/// Generic setting setter
pub async fn set_setting<T>(pool: &SqlitePool, key: &str, value: T) -> DedupResult<()>
where
    T: std::fmt::Display,
{
    sqlx::query(
        "INSERT INTO settings (key, value) VALUES (?, ?)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
    )
    .bind(key)
    .bind(value.to_string())
    .execute(pool)
    .await?;

    Ok(())
}
