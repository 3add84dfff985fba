//! Conversation record status store
//!
//! Status, priority and the cached projection live on the `conversations`
//! rows themselves; there is no separate queue table. A day's status is the
//! aggregate of its records' statuses.

use chrono::{NaiveDate, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use uuid::Uuid;

use super::{format_timestamp, parse_optional_timestamp, parse_stored_day, parse_timestamp, parse_uuid};
use crate::error::{DedupError, DedupResult};
use crate::models::{
    ConversationRecord, DayProjection, DayStatus, DisplayLine, NewConversationRecord, Priority,
    ProcessingStatus,
};
use crate::utils::{retry_on_lock, DEFAULT_MAX_LOCK_WAIT_MS};

/// Insert a record, or refresh title/content of an already ingested one
///
/// Re-ingesting never resets status: a completed day keeps serving its
/// projection until a forced recompute.
pub async fn upsert_record(pool: &SqlitePool, record: &NewConversationRecord) -> DedupResult<Uuid> {
    let new_id = Uuid::new_v4().to_string();
    let day = record.day.to_string();
    let started_at = format_timestamp(&record.started_at);
    let ended_at = record.ended_at.as_ref().map(format_timestamp);

    let id: String = retry_on_lock("upsert_record", DEFAULT_MAX_LOCK_WAIT_MS, || async {
        let id = sqlx::query_scalar(
            r#"
            INSERT INTO conversations (
                id, namespace, source_id, day, title, content, started_at, ended_at,
                status, priority
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'pending', ?)
            ON CONFLICT(namespace, source_id) DO UPDATE SET
                title = excluded.title,
                content = excluded.content,
                ended_at = excluded.ended_at
            RETURNING id
            "#,
        )
        .bind(&new_id)
        .bind(&record.namespace)
        .bind(&record.source_id)
        .bind(&day)
        .bind(&record.title)
        .bind(&record.content)
        .bind(&started_at)
        .bind(&ended_at)
        .bind(Priority::Low.rank())
        .fetch_one(pool)
        .await?;
        Ok(id)
    })
    .await?;

    parse_uuid("id", &id)
}

fn record_from_row(row: &SqliteRow) -> DedupResult<ConversationRecord> {
    let id: String = row.get("id");
    let day: String = row.get("day");
    let started_at: String = row.get("started_at");
    let status: String = row.get("status");

    Ok(ConversationRecord {
        id: parse_uuid("id", &id)?,
        namespace: row.get("namespace"),
        source_id: row.get("source_id"),
        day: parse_stored_day(&day)?,
        title: row.get("title"),
        content: row.get("content"),
        started_at: parse_timestamp("started_at", &started_at)?,
        ended_at: parse_optional_timestamp("ended_at", row.get("ended_at"))?,
        status: status.parse()?,
        priority: Priority::from_rank(row.get("priority")),
        retry_count: row.get::<i64, _>("retry_count").max(0) as u32,
        last_error: row.get("last_error"),
        processed_at: parse_optional_timestamp("processed_at", row.get("processed_at"))?,
    })
}

/// All records of a day in chronological order
pub async fn records_for_day(pool: &SqlitePool, day: NaiveDate) -> DedupResult<Vec<ConversationRecord>> {
    let rows = sqlx::query(
        r#"
        SELECT id, namespace, source_id, day, title, content, started_at, ended_at,
               status, priority, retry_count, last_error, processed_at
        FROM conversations
        WHERE day = ?
        ORDER BY started_at, id
        "#,
    )
    .bind(day.to_string())
    .fetch_all(pool)
    .await?;

    rows.iter().map(record_from_row).collect()
}

/// Aggregated status of a day, `None` when the day has no records
pub async fn day_status(pool: &SqlitePool, day: NaiveDate) -> DedupResult<Option<DayStatus>> {
    let rows = sqlx::query(
        r#"
        SELECT status, priority, retry_count, last_error, processed_at
        FROM conversations
        WHERE day = ?
        "#,
    )
    .bind(day.to_string())
    .fetch_all(pool)
    .await?;

    let mut statuses = Vec::with_capacity(rows.len());
    let mut priority = Priority::Low;
    let mut retry_count = 0u32;
    let mut last_error: Option<String> = None;
    let mut processed_at = None;

    for row in &rows {
        let status: ProcessingStatus = row.get::<String, _>("status").parse()?;
        statuses.push(status);
        priority = priority.max(Priority::from_rank(row.get("priority")));
        retry_count = retry_count.max(row.get::<i64, _>("retry_count").max(0) as u32);
        if last_error.is_none() {
            last_error = row.get("last_error");
        }
        let completed = parse_optional_timestamp("processed_at", row.get("processed_at"))?;
        processed_at = processed_at.max(completed);
    }

    let Some(status) = ProcessingStatus::aggregate(statuses) else {
        return Ok(None);
    };

    Ok(Some(DayStatus {
        day,
        status,
        priority,
        processed_at,
        record_count: rows.len(),
        retry_count,
        last_error,
    }))
}

/// Queue a day's records for background processing
///
/// Pending and failed records become queued; priority is only ever raised.
/// Returns the number of records of the day (0 when the day is unknown).
pub async fn enqueue_day(pool: &SqlitePool, day: NaiveDate, priority: Priority) -> DedupResult<u64> {
    let day = day.to_string();
    let now = format_timestamp(&Utc::now());

    retry_on_lock("enqueue_day", DEFAULT_MAX_LOCK_WAIT_MS, || async {
        let result = sqlx::query(
            r#"
            UPDATE conversations SET
                priority = MAX(priority, ?),
                queued_at = CASE WHEN status IN ('pending', 'failed') THEN ? ELSE queued_at END,
                status = CASE WHEN status IN ('pending', 'failed') THEN 'queued' ELSE status END
            WHERE day = ?
            "#,
        )
        .bind(priority.rank())
        .bind(&now)
        .bind(&day)
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    })
    .await
}

/// Promote pending records: past days at normal priority, today (and later) at low
pub async fn promote_pending(pool: &SqlitePool, today: NaiveDate) -> DedupResult<u64> {
    let today = today.to_string();
    let now = format_timestamp(&Utc::now());

    retry_on_lock("promote_pending", DEFAULT_MAX_LOCK_WAIT_MS, || async {
        let result = sqlx::query(
            r#"
            UPDATE conversations SET
                status = 'queued',
                priority = MAX(priority, CASE WHEN day < ? THEN ? ELSE ? END),
                queued_at = ?
            WHERE status = 'pending'
            "#,
        )
        .bind(&today)
        .bind(Priority::Normal.rank())
        .bind(Priority::Low.rank())
        .bind(&now)
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    })
    .await
}

/// Requeue failed records that still have retry budget
pub async fn requeue_failed(pool: &SqlitePool, max_retries: u32) -> DedupResult<u64> {
    let now = format_timestamp(&Utc::now());

    retry_on_lock("requeue_failed", DEFAULT_MAX_LOCK_WAIT_MS, || async {
        let result = sqlx::query(
            r#"
            UPDATE conversations SET status = 'queued', queued_at = ?
            WHERE status = 'failed' AND retry_count <= ?
            "#,
        )
        .bind(&now)
        .bind(max_retries as i64)
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    })
    .await
}

/// Up to `limit` queued days, highest priority first, then most recent day first
pub async fn next_queued_days(pool: &SqlitePool, limit: usize) -> DedupResult<Vec<(NaiveDate, Priority)>> {
    let rows = sqlx::query(
        r#"
        SELECT day, MAX(priority) AS top_priority
        FROM conversations
        WHERE status = 'queued'
        GROUP BY day
        ORDER BY top_priority DESC, day DESC
        LIMIT ?
        "#,
    )
    .bind(limit as i64)
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| {
            let day: String = row.get("day");
            Ok((parse_stored_day(&day)?, Priority::from_rank(row.get("top_priority"))))
        })
        .collect()
}

/// Move every record of a day to `processing`
///
/// Returns the prior status of each record so a storage failure can put them
/// back. The whole day is the processing unit, so completed records re-enter
/// processing when the day is recomputed.
pub async fn mark_processing(
    pool: &SqlitePool,
    day: NaiveDate,
) -> DedupResult<Vec<(Uuid, ProcessingStatus)>> {
    let day = day.to_string();

    let prior: Vec<(String, String)> = retry_on_lock("mark_processing", DEFAULT_MAX_LOCK_WAIT_MS, || async {
        let mut tx = pool.begin().await?;

        let prior: Vec<(String, String)> =
            sqlx::query_as("SELECT id, status FROM conversations WHERE day = ?")
                .bind(&day)
                .fetch_all(&mut *tx)
                .await?;

        sqlx::query("UPDATE conversations SET status = 'processing' WHERE day = ?")
            .bind(&day)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(prior)
    })
    .await?;

    prior
        .iter()
        .map(|(id, status)| Ok((parse_uuid("id", id)?, status.parse()?)))
        .collect()
}

/// Record a failed computation; returns the day's retry count after the failure
pub async fn mark_failed(pool: &SqlitePool, day: NaiveDate, message: &str) -> DedupResult<u32> {
    let day = day.to_string();

    let retry_count: Option<i64> = retry_on_lock("mark_failed", DEFAULT_MAX_LOCK_WAIT_MS, || async {
        let mut tx = pool.begin().await?;

        sqlx::query(
            r#"
            UPDATE conversations SET
                status = 'failed',
                retry_count = retry_count + 1,
                last_error = ?
            WHERE day = ? AND status = 'processing'
            "#,
        )
        .bind(message)
        .bind(&day)
        .execute(&mut *tx)
        .await?;

        let retry_count: Option<i64> =
            sqlx::query_scalar("SELECT MAX(retry_count) FROM conversations WHERE day = ?")
                .bind(&day)
                .fetch_one(&mut *tx)
                .await?;

        tx.commit().await?;
        Ok(retry_count)
    })
    .await?;

    Ok(retry_count.unwrap_or(0).max(0) as u32)
}

/// Put records still in `processing` back to the status they had before
pub async fn restore_statuses(
    pool: &SqlitePool,
    prior: &[(Uuid, ProcessingStatus)],
) -> DedupResult<()> {
    retry_on_lock("restore_statuses", DEFAULT_MAX_LOCK_WAIT_MS, || async {
        let mut tx = pool.begin().await?;
        for (id, status) in prior {
            sqlx::query("UPDATE conversations SET status = ? WHERE id = ? AND status = 'processing'")
                .bind(status.as_str())
                .bind(id.to_string())
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    })
    .await
}

/// Requeue records left in `processing` by a previous run of the service
pub async fn reset_stale_processing(pool: &SqlitePool) -> DedupResult<u64> {
    let now = format_timestamp(&Utc::now());
    let result = sqlx::query(
        "UPDATE conversations SET status = 'queued', queued_at = ? WHERE status = 'processing'",
    )
    .bind(&now)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// Persisted display projection of a completed day
///
/// `None` unless every record of the day is completed with a stored
/// projection. Records are concatenated in chronological order. The day
/// counts as deduplicated only if every record was stored deduplicated.
pub async fn load_day_projection(
    pool: &SqlitePool,
    day: NaiveDate,
) -> DedupResult<Option<DayProjection>> {
    let rows: Vec<(String, Option<String>, bool)> = sqlx::query_as(
        r#"
        SELECT status, display_content, deduplicated
        FROM conversations
        WHERE day = ?
        ORDER BY started_at, id
        "#,
    )
    .bind(day.to_string())
    .fetch_all(pool)
    .await?;

    if rows.is_empty() {
        return Ok(None);
    }

    let mut lines = Vec::new();
    let mut deduplicated = true;
    for (status, display_content, record_deduplicated) in rows {
        if status != ProcessingStatus::Completed.as_str() {
            return Ok(None);
        }
        let Some(content) = display_content else {
            return Ok(None);
        };
        let mut record_lines: Vec<DisplayLine> = serde_json::from_str(&content)?;
        lines.append(&mut record_lines);
        deduplicated &= record_deduplicated;
    }

    Ok(Some(DayProjection::from_lines(day, lines, deduplicated)))
}

/// Record counts per status, for health reporting
pub async fn count_by_status(pool: &SqlitePool) -> DedupResult<HashMap<String, i64>> {
    let rows: Vec<(String, i64)> =
        sqlx::query_as("SELECT status, COUNT(*) FROM conversations GROUP BY status")
            .fetch_all(pool)
            .await?;
    Ok(rows.into_iter().collect())
}

/// Shorthand for callers that need the day to exist
pub async fn require_day_status(pool: &SqlitePool, day: NaiveDate) -> DedupResult<DayStatus> {
    day_status(pool, day)
        .await?
        .ok_or_else(|| DedupError::NotFound(format!("No conversations recorded for {}", day)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    async fn setup_test_db() -> SqlitePool {
        let pool = lifelog_common::db::open_in_memory().await.unwrap();
        crate::db::init_tables(&pool).await.unwrap();
        pool
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 7, d).unwrap()
    }

    fn new_record(source_id: &str, d: u32, hour: u32) -> NewConversationRecord {
        NewConversationRecord {
            namespace: "limitless".to_string(),
            source_id: source_id.to_string(),
            day: day(d),
            title: Some("Morning".to_string()),
            content: "John: hello there everyone".to_string(),
            started_at: Utc.with_ymd_and_hms(2024, 7, d, hour, 0, 0).unwrap(),
            ended_at: None,
        }
    }

    #[tokio::test]
    async fn test_upsert_keeps_identity_and_status() {
        let pool = setup_test_db().await;
        let first = upsert_record(&pool, &new_record("a", 14, 9)).await.unwrap();
        enqueue_day(&pool, day(14), Priority::High).await.unwrap();

        let mut changed = new_record("a", 14, 9);
        changed.content = "John: hello again".to_string();
        let second = upsert_record(&pool, &changed).await.unwrap();
        assert_eq!(first, second);

        let records = records_for_day(&pool, day(14)).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].content, "John: hello again");
        assert_eq!(records[0].status, ProcessingStatus::Queued);
        assert_eq!(records[0].priority, Priority::High);
    }

    #[tokio::test]
    async fn test_day_status_unknown_day() {
        let pool = setup_test_db().await;
        assert!(day_status(&pool, day(1)).await.unwrap().is_none());
        assert!(matches!(
            require_day_status(&pool, day(1)).await,
            Err(DedupError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_enqueue_never_lowers_priority() {
        let pool = setup_test_db().await;
        upsert_record(&pool, &new_record("a", 14, 9)).await.unwrap();

        assert_eq!(enqueue_day(&pool, day(14), Priority::Urgent).await.unwrap(), 1);
        enqueue_day(&pool, day(14), Priority::Low).await.unwrap();

        let status = day_status(&pool, day(14)).await.unwrap().unwrap();
        assert_eq!(status.status, ProcessingStatus::Queued);
        assert_eq!(status.priority, Priority::Urgent);
        assert_eq!(enqueue_day(&pool, day(15), Priority::Low).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_promotion_by_day_age() {
        let pool = setup_test_db().await;
        upsert_record(&pool, &new_record("old", 12, 9)).await.unwrap();
        upsert_record(&pool, &new_record("today", 14, 9)).await.unwrap();

        assert_eq!(promote_pending(&pool, day(14)).await.unwrap(), 2);

        let queued = next_queued_days(&pool, 10).await.unwrap();
        assert_eq!(queued, vec![(day(12), Priority::Normal), (day(14), Priority::Low)]);
    }

    #[tokio::test]
    async fn test_queue_order_priority_then_recency() {
        let pool = setup_test_db().await;
        for (id, d) in [("a", 10), ("b", 11), ("c", 12)] {
            upsert_record(&pool, &new_record(id, d, 9)).await.unwrap();
            enqueue_day(&pool, day(d), Priority::Normal).await.unwrap();
        }
        enqueue_day(&pool, day(10), Priority::High).await.unwrap();

        let queued: Vec<NaiveDate> = next_queued_days(&pool, 2)
            .await
            .unwrap()
            .into_iter()
            .map(|(d, _)| d)
            .collect();
        assert_eq!(queued, vec![day(10), day(12)]);
    }

    #[tokio::test]
    async fn test_failure_and_retry_budget() {
        let pool = setup_test_db().await;
        upsert_record(&pool, &new_record("a", 14, 9)).await.unwrap();

        for expected in 1..=3u32 {
            mark_processing(&pool, day(14)).await.unwrap();
            let count = mark_failed(&pool, day(14), "provider down").await.unwrap();
            assert_eq!(count, expected);
            requeue_failed(&pool, 2).await.unwrap();
        }

        let status = day_status(&pool, day(14)).await.unwrap().unwrap();
        assert_eq!(status.status, ProcessingStatus::Failed);
        assert_eq!(status.last_error.as_deref(), Some("provider down"));
        assert!(status.retries_exhausted(2));
    }

    #[tokio::test]
    async fn test_restore_statuses_after_storage_failure() {
        let pool = setup_test_db().await;
        upsert_record(&pool, &new_record("a", 14, 9)).await.unwrap();
        upsert_record(&pool, &new_record("b", 14, 11)).await.unwrap();
        enqueue_day(&pool, day(14), Priority::Normal).await.unwrap();

        let prior = mark_processing(&pool, day(14)).await.unwrap();
        assert_eq!(prior.len(), 2);
        assert_eq!(
            day_status(&pool, day(14)).await.unwrap().unwrap().status,
            ProcessingStatus::Processing
        );

        restore_statuses(&pool, &prior).await.unwrap();
        assert_eq!(
            day_status(&pool, day(14)).await.unwrap().unwrap().status,
            ProcessingStatus::Queued
        );
    }

    #[tokio::test]
    async fn test_reset_stale_processing() {
        let pool = setup_test_db().await;
        upsert_record(&pool, &new_record("a", 14, 9)).await.unwrap();
        mark_processing(&pool, day(14)).await.unwrap();

        assert_eq!(reset_stale_processing(&pool).await.unwrap(), 1);
        let counts = count_by_status(&pool).await.unwrap();
        assert_eq!(counts.get("queued"), Some(&1));
    }

    #[tokio::test]
    async fn test_projection_absent_until_completed() {
        let pool = setup_test_db().await;
        upsert_record(&pool, &new_record("a", 14, 9)).await.unwrap();
        assert!(load_day_projection(&pool, day(14)).await.unwrap().is_none());
        assert!(load_day_projection(&pool, day(20)).await.unwrap().is_none());
    }
}
