//! Background scheduler
//!
//! Periodically promotes pending days, requeues failed days that still have
//! retry budget, and drains the highest-priority queued days through the
//! Clean Up Crew with bounded concurrency. Runs that only produce provider
//! failures double the delay to the next run, up to `max_backoff`.

use chrono::{Local, NaiveDate, Utc};
use futures::stream::{self, StreamExt};
use lifelog_common::events::{EventBus, LifelogEvent};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, RwLock};
use tokio_util::sync::CancellationToken;

use super::orchestrator::{CleanUpCrew, DayRunOutcome};
use crate::db::records;
use crate::error::{DedupResult, ErrorKind};

/// Counters of one scheduler run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerRunReport {
    pub promoted: u64,
    pub requeued: u64,
    pub selected: usize,
    pub completed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub provider_failures: usize,
}

impl SchedulerRunReport {
    /// Provider trouble with nothing to show for it
    pub fn is_backoff_worthy(&self) -> bool {
        self.provider_failures > 0 && self.completed == 0
    }
}

/// Cloneable control surface of a running scheduler
#[derive(Clone, Default)]
pub struct SchedulerHandle {
    trigger: Arc<Notify>,
    last_report: Arc<RwLock<Option<SchedulerRunReport>>>,
}

impl SchedulerHandle {
    /// Ask for an immediate run; coalesces with a pending request
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    pub async fn last_report(&self) -> Option<SchedulerRunReport> {
        self.last_report.read().await.clone()
    }
}

pub struct BackgroundScheduler {
    crew: Arc<CleanUpCrew>,
    event_bus: EventBus,
    handle: SchedulerHandle,
}

impl BackgroundScheduler {
    pub fn new(crew: Arc<CleanUpCrew>, event_bus: EventBus) -> Self {
        Self {
            crew,
            event_bus,
            handle: SchedulerHandle::default(),
        }
    }

    pub fn handle(&self) -> SchedulerHandle {
        self.handle.clone()
    }

    /// Delay before the next run after `consecutive_failures` backoff-worthy runs
    pub fn next_delay(&self, consecutive_failures: u32) -> Duration {
        let config = self.crew.config();
        backoff_delay(config.background_interval(), config.max_backoff(), consecutive_failures)
    }

    /// One pass over the queue, with `today` deciding promotion priority
    pub async fn run_once_for(&self, today: NaiveDate) -> DedupResult<SchedulerRunReport> {
        let config = self.crew.config();
        let db = self.crew.db();

        let promoted = records::promote_pending(db, today).await?;
        let requeued = records::requeue_failed(db, config.max_retries).await?;
        let days = records::next_queued_days(db, config.batch_limit).await?;

        let mut report = SchedulerRunReport {
            promoted,
            requeued,
            selected: days.len(),
            ..Default::default()
        };

        if !days.is_empty() {
            tracing::info!(
                promoted,
                requeued,
                selected = days.len(),
                concurrency = config.scheduler_concurrency,
                "Scheduler draining queued days"
            );
        }

        let outcomes: Vec<_> = stream::iter(days)
            .map(|(day, priority)| {
                let crew = Arc::clone(&self.crew);
                async move {
                    tracing::debug!(day = %day, priority = %priority, "Processing queued day");
                    (day, crew.process_queued_day(day).await)
                }
            })
            .buffer_unordered(config.scheduler_concurrency.max(1))
            .collect()
            .await;

        for (day, outcome) in outcomes {
            match outcome {
                Ok(DayRunOutcome::Completed) => report.completed += 1,
                Ok(DayRunOutcome::Skipped) => report.skipped += 1,
                Ok(DayRunOutcome::Failed(info)) => {
                    report.failed += 1;
                    if info.kind == ErrorKind::Provider {
                        report.provider_failures += 1;
                    }
                }
                Err(e) => {
                    tracing::warn!(day = %day, error = %e, "Queued day could not be processed");
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }

    pub async fn run_once(&self) -> DedupResult<SchedulerRunReport> {
        self.run_once_for(Local::now().date_naive()).await
    }

    /// Run until `cancel` fires
    ///
    /// The first run starts immediately so a backlog left by a previous
    /// process is drained on startup.
    pub async fn run(self, cancel: CancellationToken) {
        let mut consecutive_failures = 0u32;
        tracing::info!(
            interval_secs = self.crew.config().background_interval_secs,
            "Background scheduler started"
        );

        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.run_once() => result,
            };

            match result {
                Ok(report) => {
                    if report.is_backoff_worthy() {
                        consecutive_failures = consecutive_failures.saturating_add(1);
                    } else if report.completed > 0 || report.failed == 0 {
                        consecutive_failures = 0;
                    }

                    let delay = self.next_delay(consecutive_failures);
                    if report.selected > 0 {
                        tracing::info!(
                            completed = report.completed,
                            failed = report.failed,
                            skipped = report.skipped,
                            next_run_in_secs = delay.as_secs(),
                            "Scheduler run completed"
                        );
                    }
                    let event = LifelogEvent::SchedulerRunCompleted {
                        selected: report.selected,
                        completed: report.completed,
                        failed: report.failed,
                        next_run_in_secs: delay.as_secs(),
                        timestamp: Utc::now(),
                    };
                    *self.handle.last_report.write().await = Some(report);
                    self.event_bus.emit_lossy(event);
                }
                Err(e) => {
                    consecutive_failures = consecutive_failures.saturating_add(1);
                    tracing::error!(error = %e, "Scheduler run failed");
                }
            }

            let delay = self.next_delay(consecutive_failures);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
                _ = self.handle.trigger.notified() => {
                    tracing::info!("Scheduler run triggered");
                }
            }
        }

        tracing::info!("Background scheduler stopped");
    }
}

/// `interval * 2^failures`, capped at `max_backoff`
pub fn backoff_delay(interval: Duration, max_backoff: Duration, consecutive_failures: u32) -> Duration {
    let factor = 2u32.saturating_pow(consecutive_failures);
    interval.saturating_mul(factor).min(max_backoff.max(interval))
}
