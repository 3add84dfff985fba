//! Clean Up Crew: fast/slow path arbitration for day projections
//!
//! A completed day is served straight from the `conversations` table. Any
//! other day is computed on a spawned task under a per-day lease, so at most
//! one computation per day is ever in flight. Callers that arrive while a
//! computation runs either wait for its result (bounded by the compute
//! timeout) or get `processing` back immediately with an estimate.
//!
//! Callers always get a structured result: the projection, or the raw
//! conversation as a non-deduplicated fallback. Only validation and
//! not-found surface as errors.

use chrono::{NaiveDate, Utc};
use lifelog_common::events::{EventBus, LifelogEvent};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::{watch, Semaphore};
use uuid::Uuid;

use super::clusterer::{cluster_lines, ClusterParams};
use super::embedding::EmbeddingCache;
use super::line_extractor;
use super::progress::{ProgressChannel, ProgressEvent};
use super::projector::{self, ProjectionOutput};
use crate::config::DedupConfig;
use crate::db::{clusters, records};
use crate::error::{DedupError, DedupResult, ErrorInfo, ErrorKind};
use crate::models::{
    ConversationRecord, DayProjection, DayStatus, Priority, ProcessingStatus, ProjectionResult,
    SpokenLine, WaitMode,
};

type SharedOutcome = Arc<Result<DayProjection, ErrorInfo>>;

struct InFlight {
    rx: watch::Receiver<Option<SharedOutcome>>,
    started: Instant,
}

type LeaseMap = HashMap<NaiveDate, InFlight>;

/// Releases a day's lease when the computing task finishes, panics included
struct LeaseGuard {
    crew: Arc<CleanUpCrew>,
    day: NaiveDate,
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        self.crew.leases().remove(&self.day);
    }
}

/// Result of draining one queued day
#[derive(Debug, Clone, PartialEq)]
pub enum DayRunOutcome {
    /// Already completed, nothing to do
    Skipped,
    Completed,
    Failed(ErrorInfo),
}

/// Processing orchestrator
pub struct CleanUpCrew {
    db: SqlitePool,
    config: DedupConfig,
    embeddings: Arc<EmbeddingCache>,
    progress: Arc<ProgressChannel>,
    event_bus: EventBus,
    leases: Mutex<LeaseMap>,
    permits: Arc<Semaphore>,
    /// Moving average of slow-path durations, for `NoWait` estimates
    average_compute_ms: AtomicU64,
}

impl CleanUpCrew {
    pub fn new(
        db: SqlitePool,
        config: DedupConfig,
        embeddings: Arc<EmbeddingCache>,
        progress: Arc<ProgressChannel>,
        event_bus: EventBus,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_computations.max(1)));
        let average_compute_ms = AtomicU64::new(config.expected_compute_ms);
        Self {
            db,
            config,
            embeddings,
            progress,
            event_bus,
            leases: Mutex::new(HashMap::new()),
            permits,
            average_compute_ms,
        }
    }

    pub fn config(&self) -> &DedupConfig {
        &self.config
    }

    pub fn db(&self) -> &SqlitePool {
        &self.db
    }

    pub fn progress(&self) -> &Arc<ProgressChannel> {
        &self.progress
    }

    fn leases(&self) -> MutexGuard<'_, LeaseMap> {
        self.leases.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Days with a computation in flight
    pub fn in_flight(&self) -> usize {
        self.leases().len()
    }

    /// Current slow-path duration estimate
    pub fn expected_compute_ms(&self) -> u64 {
        self.average_compute_ms.load(Ordering::Relaxed)
    }

    /// Read-only status of a day
    pub async fn get_status(&self, day: NaiveDate) -> DedupResult<DayStatus> {
        records::require_day_status(&self.db, day).await
    }

    /// Queue a day for background processing without computing it
    pub async fn enqueue(&self, day: NaiveDate, priority: Priority) -> DedupResult<DayStatus> {
        let affected = records::enqueue_day(&self.db, day, priority).await?;
        if affected == 0 {
            return Err(DedupError::NotFound(format!("No conversations recorded for {}", day)));
        }

        tracing::info!(day = %day, priority = %priority, records = affected, "Day enqueued");
        self.event_bus.emit_lossy(LifelogEvent::DayQueued {
            day,
            priority: priority.to_string(),
            records: affected,
            timestamp: Utc::now(),
        });

        self.get_status(day).await
    }

    /// Projection of a day, computing it when needed
    pub async fn get_projection(
        self: &Arc<Self>,
        day: NaiveDate,
        force: bool,
        wait: WaitMode,
    ) -> DedupResult<ProjectionResult> {
        let started = Instant::now();
        let status = records::require_day_status(&self.db, day).await?;

        if !force && status.status == ProcessingStatus::Completed {
            if let Some(projection) = records::load_day_projection(&self.db, day).await? {
                tracing::debug!(day = %day, elapsed_ms = started.elapsed().as_millis() as u64, "Fast path hit");
                let error = (!projection.deduplicated)
                    .then(|| degraded_info(status.last_error.clone()));
                return Ok(build_result(
                    day,
                    ProcessingStatus::Completed,
                    Some(projection),
                    started,
                    true,
                    error,
                    None,
                ));
            }
        }

        if !force && status.retries_exhausted(self.config.max_retries) {
            let error = ErrorInfo {
                kind: ErrorKind::Provider,
                message: status
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "Automatic retries exhausted".to_string()),
            };
            let fallback = self.raw_fallback(day).await;
            return Ok(build_result(
                day,
                ProcessingStatus::Failed,
                fallback,
                started,
                false,
                Some(error),
                None,
            ));
        }

        let (mut rx, lease_started) = self.join_or_start(day, force);

        if wait == WaitMode::NoWait {
            if let Some(outcome) = current_outcome(&rx) {
                return self.outcome_result(day, outcome, started).await;
            }
            let remaining = self
                .expected_compute_ms()
                .saturating_sub(lease_started.elapsed().as_millis() as u64);
            return Ok(build_result(
                day,
                ProcessingStatus::Processing,
                None,
                started,
                false,
                None,
                Some(remaining),
            ));
        }

        match tokio::time::timeout(self.config.compute_timeout(), wait_for_outcome(&mut rx)).await {
            Ok(outcome) => self.outcome_result(day, outcome, started).await,
            Err(_) => {
                let timeout_ms = self.config.compute_timeout().as_millis() as u64;
                tracing::warn!(day = %day, timeout_ms, "Request timed out, computation continues");
                let fallback = self.raw_fallback(day).await;
                let remaining = self
                    .expected_compute_ms()
                    .saturating_sub(lease_started.elapsed().as_millis() as u64);
                Ok(build_result(
                    day,
                    ProcessingStatus::Processing,
                    fallback,
                    started,
                    false,
                    Some(DedupError::Timeout(timeout_ms).info()),
                    Some(remaining),
                ))
            }
        }
    }

    /// Compute a queued day on behalf of the scheduler
    ///
    /// Shares the lease with request-driven computations and waits for the
    /// result without a timeout.
    pub async fn process_queued_day(self: &Arc<Self>, day: NaiveDate) -> DedupResult<DayRunOutcome> {
        let status = records::require_day_status(&self.db, day).await?;
        if status.status == ProcessingStatus::Completed {
            tracing::debug!(day = %day, "Queued day already completed");
            return Ok(DayRunOutcome::Skipped);
        }

        let (mut rx, _) = self.join_or_start(day, false);
        let outcome = wait_for_outcome(&mut rx).await;
        Ok(match outcome.as_ref() {
            Ok(_) => DayRunOutcome::Completed,
            Err(info) => DayRunOutcome::Failed(info.clone()),
        })
    }

    /// Join the day's in-flight computation, or start one
    fn join_or_start(
        self: &Arc<Self>,
        day: NaiveDate,
        force: bool,
    ) -> (watch::Receiver<Option<SharedOutcome>>, Instant) {
        let mut leases = self.leases();
        if let Some(in_flight) = leases.get(&day) {
            tracing::debug!(day = %day, "Joining in-flight computation");
            return (in_flight.rx.clone(), in_flight.started);
        }

        let (tx, rx) = watch::channel(None);
        let started = Instant::now();
        leases.insert(day, InFlight { rx: rx.clone(), started });
        drop(leases);

        let crew = Arc::clone(self);
        tokio::spawn(async move {
            let guard = LeaseGuard { crew: Arc::clone(&crew), day };
            let outcome = crew.run_leader(day, force).await;
            // Release before publishing so late callers read the persisted state
            drop(guard);
            let _ = tx.send(Some(Arc::new(outcome)));
        });

        (rx, started)
    }

    async fn run_leader(&self, day: NaiveDate, force: bool) -> Result<DayProjection, ErrorInfo> {
        let _permit = match Arc::clone(&self.permits).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                return Err(DedupError::Storage("computation pool closed".to_string()).info());
            }
        };

        let started = Instant::now();
        match self.compute_day(day, force).await {
            Ok(projection) => {
                self.record_duration(started.elapsed().as_millis() as u64);
                Ok(projection)
            }
            Err(e) => Err(e.info()),
        }
    }

    async fn compute_day(&self, day: NaiveDate, force: bool) -> DedupResult<DayProjection> {
        let status = records::require_day_status(&self.db, day).await?;

        // Another computation may have finished while this one waited
        if !force && status.status == ProcessingStatus::Completed {
            if let Some(projection) = records::load_day_projection(&self.db, day).await? {
                tracing::debug!(day = %day, "Day completed meanwhile, skipping recompute");
                return Ok(projection);
            }
        }

        let started = Instant::now();
        let prior = records::mark_processing(&self.db, day).await?;
        self.progress.publish(ProgressEvent::Started { day });
        tracing::info!(day = %day, records = prior.len(), force, "Computing day projection");

        let result = async {
            let day_records = records::records_for_day(&self.db, day).await?;
            let output = self.run_pipeline(day, &day_records).await?;
            self.publish_progress(day, 0.95, "persisting");
            clusters::persist_day_outcome(&self.db, day, &output.outcome).await?;
            Ok::<_, DedupError>(output)
        }
        .await;

        match result {
            Ok(output) => {
                let elapsed_ms = started.elapsed().as_millis() as u64;
                let projection = output.projection;
                tracing::info!(
                    day = %day,
                    elapsed_ms,
                    visible = projection.lines.len(),
                    hidden = projection.hidden_line_count,
                    clusters = projection.cluster_count,
                    "Day projection computed"
                );
                self.progress.publish(ProgressEvent::Completed {
                    day,
                    projection: projection.clone(),
                });
                self.event_bus.emit_lossy(LifelogEvent::DayProcessed {
                    day,
                    visible_lines: projection.lines.len(),
                    hidden_lines: projection.hidden_line_count,
                    elapsed_ms,
                    timestamp: Utc::now(),
                });
                Ok(projection)
            }
            Err(e) => {
                self.handle_failure(day, &prior, &e).await;
                Err(e)
            }
        }
    }

    async fn run_pipeline(
        &self,
        day: NaiveDate,
        day_records: &[ConversationRecord],
    ) -> DedupResult<ProjectionOutput> {
        if day_records.is_empty() {
            return Err(DedupError::NotFound(format!("No conversations recorded for {}", day)));
        }
        let record_ids: Vec<Uuid> = day_records.iter().map(|r| r.id).collect();

        let lines = line_extractor::extract_day(day_records);
        let eligible: Vec<SpokenLine> = lines
            .iter()
            .filter(|l| l.word_count() >= self.config.min_words)
            .cloned()
            .collect();
        self.publish_progress(day, 0.1, "extracting");
        tracing::debug!(day = %day, lines = lines.len(), eligible = eligible.len(), "Extracted lines");

        let texts: Vec<String> = eligible.iter().map(|l| l.text.clone()).collect();
        let progress = Arc::clone(&self.progress);
        let (vectors, stats) = self
            .embeddings
            .embed_texts(&self.db, &texts, self.config.embedding_batch_size, |done, total| {
                let fraction = 0.1 + 0.7 * done as f64 / total.max(1) as f64;
                progress.publish(ProgressEvent::Progress {
                    day,
                    progress: fraction,
                    stage: "embedding".to_string(),
                });
            })
            .await?;
        tracing::debug!(
            day = %day,
            memory_hits = stats.memory_hits,
            stored_hits = stats.stored_hits,
            requested = stats.provider_requested,
            failed = stats.provider_failed,
            "Embedded lines"
        );

        // Lines whose embedding failed stay out of clustering and render verbatim
        let (clustered, cluster_vectors): (Vec<SpokenLine>, Vec<Arc<Vec<f32>>>) = eligible
            .into_iter()
            .zip(vectors)
            .filter_map(|(line, vector)| vector.map(|v| (line, v)))
            .unzip();

        self.publish_progress(day, 0.85, "clustering");
        let params = ClusterParams {
            threshold: self.config.similarity_threshold,
            allow_cross_speaker: self.config.allow_cross_speaker,
            max_window_lines: self.config.max_window_lines,
        };

        let clustering = tokio::task::spawn_blocking(move || {
            let slices: Vec<&[f32]> = cluster_vectors.iter().map(|v| v.as_slice()).collect();
            let clusters = cluster_lines(&clustered, &slices, &params);
            (clustered, clusters)
        })
        .await;

        let output = match clustering {
            Ok((clustered, Ok(clusters))) => {
                projector::build_projection(day, &record_ids, &lines, &clustered, &clusters)
            }
            Ok((_, Err(e))) => {
                tracing::warn!(day = %day, error = %e, "Clustering failed, rendering all lines verbatim");
                projector::unique_projection(day, &record_ids, &lines, e.to_string())
            }
            Err(e) => {
                tracing::error!(day = %day, error = %e, "Clustering task aborted, rendering all lines verbatim");
                let reason = DedupError::Clustering(format!("clustering task aborted: {}", e));
                projector::unique_projection(day, &record_ids, &lines, reason.to_string())
            }
        };

        Ok(output)
    }

    async fn handle_failure(&self, day: NaiveDate, prior: &[(Uuid, ProcessingStatus)], error: &DedupError) {
        let will_retry = match error {
            DedupError::Provider(message) => match records::mark_failed(&self.db, day, message).await {
                Ok(retry_count) => retry_count <= self.config.max_retries,
                Err(e) => {
                    tracing::error!(day = %day, error = %e, "Failed to record failure");
                    true
                }
            },
            _ => {
                if let Err(e) = records::restore_statuses(&self.db, prior).await {
                    tracing::error!(day = %day, error = %e, "Failed to restore record statuses");
                }
                error.is_retryable()
            }
        };

        tracing::warn!(day = %day, kind = error.kind().as_str(), will_retry, error = %error, "Day computation failed");

        self.progress.publish(ProgressEvent::Failed { day, error: error.info() });
        self.event_bus.emit_lossy(LifelogEvent::DayFailed {
            day,
            kind: error.kind().as_str().to_string(),
            message: error.to_string(),
            will_retry,
            timestamp: Utc::now(),
        });
    }

    async fn outcome_result(
        &self,
        day: NaiveDate,
        outcome: SharedOutcome,
        started: Instant,
    ) -> DedupResult<ProjectionResult> {
        match outcome.as_ref() {
            Ok(projection) => {
                let error = if projection.deduplicated {
                    None
                } else {
                    let reason = match records::day_status(&self.db, day).await {
                        Ok(Some(status)) => status.last_error,
                        _ => None,
                    };
                    Some(degraded_info(reason))
                };
                Ok(build_result(
                    day,
                    ProcessingStatus::Completed,
                    Some(projection.clone()),
                    started,
                    false,
                    error,
                    None,
                ))
            }
            Err(info) if info.kind == ErrorKind::NotFound => {
                Err(DedupError::NotFound(info.message.clone()))
            }
            Err(info) => {
                let status = match records::day_status(&self.db, day).await {
                    Ok(Some(status)) => status.status,
                    _ => ProcessingStatus::Failed,
                };
                let fallback = self.raw_fallback(day).await;
                Ok(build_result(day, status, fallback, started, false, Some(info.clone()), None))
            }
        }
    }

    /// The day's lines verbatim; `None` if even that cannot be read
    async fn raw_fallback(&self, day: NaiveDate) -> Option<DayProjection> {
        match records::records_for_day(&self.db, day).await {
            Ok(day_records) => Some(DayProjection::raw(day, &line_extractor::extract_day(&day_records))),
            Err(e) => {
                tracing::error!(day = %day, error = %e, "Failed to load raw conversation");
                None
            }
        }
    }

    fn publish_progress(&self, day: NaiveDate, progress: f64, stage: &str) {
        self.progress.publish(ProgressEvent::Progress {
            day,
            progress,
            stage: stage.to_string(),
        });
    }

    fn record_duration(&self, sample_ms: u64) {
        let previous = self.average_compute_ms.load(Ordering::Relaxed);
        let next = (previous * 3 + sample_ms) / 4;
        self.average_compute_ms.store(next, Ordering::Relaxed);
    }
}

fn current_outcome(rx: &watch::Receiver<Option<SharedOutcome>>) -> Option<SharedOutcome> {
    rx.borrow().clone()
}

async fn wait_for_outcome(rx: &mut watch::Receiver<Option<SharedOutcome>>) -> SharedOutcome {
    loop {
        if let Some(outcome) = current_outcome(rx) {
            return outcome;
        }
        if rx.changed().await.is_err() {
            // Sender gone without a value: the computing task died
            return current_outcome(rx).unwrap_or_else(|| {
                Arc::new(Err(DedupError::Storage("computation aborted".to_string()).info()))
            });
        }
    }
}

/// Error attached to a completed day whose lines could not be deduplicated
fn degraded_info(reason: Option<String>) -> ErrorInfo {
    ErrorInfo {
        kind: ErrorKind::Clustering,
        message: reason.unwrap_or_else(|| "Deduplication unavailable, lines shown verbatim".to_string()),
    }
}

fn build_result(
    day: NaiveDate,
    status: ProcessingStatus,
    projection: Option<DayProjection>,
    started: Instant,
    cache_hit: bool,
    error: Option<ErrorInfo>,
    estimated_remaining_ms: Option<u64>,
) -> ProjectionResult {
    ProjectionResult {
        day,
        status,
        deduplicated: projection.as_ref().map_or(false, |p| p.deduplicated),
        projection,
        elapsed_ms: started.elapsed().as_millis() as u64,
        cache_hit,
        error,
        estimated_remaining_ms,
    }
}
