//! Background scheduler integration tests

mod helpers;

use std::time::Duration;

use helpers::{at, day, seed_record, test_config, TestCrew};
use lifelog_cc::config::DedupConfig;
use lifelog_cc::models::{Priority, ProcessingStatus};
use lifelog_cc::services::{BackgroundScheduler, DayRunOutcome};
use lifelog_common::events::LifelogEvent;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

async fn seed_simple_day(t: &TestCrew, d: chrono::NaiveDate) {
    let first = format!("it rained all day on {}", d);
    let second = format!("so much rain on {}", d);
    t.provider.set_topic(&first, 4);
    t.provider.set_topic(&second, 4);
    seed_record(
        &t.pool,
        d,
        &format!("rain-{}", d),
        at(d, 8, 0),
        &[("John", first.as_str()), ("Sarah", second.as_str())],
    )
    .await;
}

/// `completed` count of the next finished scheduler run
async fn next_run(events: &mut broadcast::Receiver<LifelogEvent>) -> usize {
    loop {
        if let LifelogEvent::SchedulerRunCompleted { completed, .. } = events.recv().await.unwrap() {
            return completed;
        }
    }
}

#[tokio::test]
async fn run_promotes_pending_days_and_drains_them() {
    let t = TestCrew::new().await;
    let today = day(2024, 8, 10);
    let yesterday = day(2024, 8, 9);
    seed_simple_day(&t, yesterday).await;
    seed_simple_day(&t, today).await;

    let scheduler = BackgroundScheduler::new(t.crew.clone(), t.event_bus.clone());
    let report = scheduler.run_once_for(today).await.unwrap();

    assert_eq!(report.promoted, 2);
    assert_eq!(report.selected, 2);
    assert_eq!(report.completed, 2);
    assert_eq!(report.failed, 0);

    for d in [yesterday, today] {
        let status = t.crew.get_status(d).await.unwrap();
        assert_eq!(status.status, ProcessingStatus::Completed);
    }
}

#[tokio::test]
async fn promotion_gives_past_days_normal_and_today_low_priority() {
    let config = DedupConfig {
        batch_limit: 1,
        ..test_config()
    };
    let t = TestCrew::with_config(config).await;
    let today = day(2024, 8, 10);
    let past = day(2024, 8, 1);
    seed_simple_day(&t, past).await;
    seed_simple_day(&t, today).await;

    let scheduler = BackgroundScheduler::new(t.crew.clone(), t.event_bus.clone());
    let report = scheduler.run_once_for(today).await.unwrap();
    assert_eq!(report.selected, 1);

    // The older day outranks today despite being less recent
    assert_eq!(t.crew.get_status(past).await.unwrap().status, ProcessingStatus::Completed);
    let today_status = t.crew.get_status(today).await.unwrap();
    assert_eq!(today_status.status, ProcessingStatus::Queued);
    assert_eq!(today_status.priority, Priority::Low);
}

#[tokio::test]
async fn higher_priority_then_more_recent_days_go_first() {
    let config = DedupConfig {
        batch_limit: 1,
        ..test_config()
    };
    let t = TestCrew::with_config(config).await;
    let today = day(2024, 8, 20);
    let old = day(2024, 8, 2);
    let recent = day(2024, 8, 12);
    let urgent = day(2024, 8, 1);
    for d in [old, recent, urgent] {
        seed_simple_day(&t, d).await;
    }
    t.crew.enqueue(urgent, Priority::Urgent).await.unwrap();

    let scheduler = BackgroundScheduler::new(t.crew.clone(), t.event_bus.clone());

    scheduler.run_once_for(today).await.unwrap();
    assert_eq!(t.crew.get_status(urgent).await.unwrap().status, ProcessingStatus::Completed);
    assert_eq!(t.crew.get_status(recent).await.unwrap().status, ProcessingStatus::Queued);

    scheduler.run_once_for(today).await.unwrap();
    assert_eq!(t.crew.get_status(recent).await.unwrap().status, ProcessingStatus::Completed);
    assert_eq!(t.crew.get_status(old).await.unwrap().status, ProcessingStatus::Queued);

    scheduler.run_once_for(today).await.unwrap();
    assert_eq!(t.crew.get_status(old).await.unwrap().status, ProcessingStatus::Completed);
}

#[tokio::test]
async fn failed_days_are_retried_until_the_budget_runs_out() {
    let config = DedupConfig {
        max_retries: 1,
        ..test_config()
    };
    let t = TestCrew::with_config(config).await;
    let today = day(2024, 8, 10);
    let d = day(2024, 8, 5);
    seed_simple_day(&t, d).await;
    t.provider.set_down(true);

    let scheduler = BackgroundScheduler::new(t.crew.clone(), t.event_bus.clone());

    let first = scheduler.run_once_for(today).await.unwrap();
    assert_eq!(first.provider_failures, 1);
    assert!(first.is_backoff_worthy());
    assert_eq!(t.crew.get_status(d).await.unwrap().retry_count, 1);

    let second = scheduler.run_once_for(today).await.unwrap();
    assert_eq!(second.requeued, 1);
    assert_eq!(second.failed, 1);
    assert_eq!(t.crew.get_status(d).await.unwrap().retry_count, 2);

    let third = scheduler.run_once_for(today).await.unwrap();
    assert_eq!(third.requeued, 0);
    assert_eq!(third.selected, 0);
    let status = t.crew.get_status(d).await.unwrap();
    assert_eq!(status.status, ProcessingStatus::Failed);
    assert!(status.last_error.is_some());
}

#[tokio::test]
async fn backoff_grows_with_consecutive_failures() {
    let t = TestCrew::new().await;
    let scheduler = BackgroundScheduler::new(t.crew.clone(), t.event_bus.clone());
    let interval = t.crew.config().background_interval();

    assert_eq!(scheduler.next_delay(0), interval);
    assert_eq!(scheduler.next_delay(1), interval * 2);
    assert_eq!(scheduler.next_delay(30), t.crew.config().max_backoff());
}

#[tokio::test]
async fn completed_day_is_skipped() {
    let t = TestCrew::new().await;
    let d = day(2024, 8, 6);
    seed_simple_day(&t, d).await;

    assert_eq!(t.crew.process_queued_day(d).await.unwrap(), DayRunOutcome::Completed);
    let calls = t.provider.calls();
    assert_eq!(t.crew.process_queued_day(d).await.unwrap(), DayRunOutcome::Skipped);
    assert_eq!(t.provider.calls(), calls);
}

#[tokio::test]
async fn run_loop_reports_runs_and_stops_on_cancel() {
    let t = TestCrew::new().await;
    seed_simple_day(&t, day(2024, 8, 7)).await;

    let mut events = t.event_bus.subscribe();
    let scheduler = BackgroundScheduler::new(t.crew.clone(), t.event_bus.clone());
    let handle = scheduler.handle();
    let cancel = CancellationToken::new();
    let task = tokio::spawn(scheduler.run(cancel.clone()));

    // First run happens at startup
    let completed = tokio::time::timeout(Duration::from_secs(5), next_run(&mut events))
        .await
        .unwrap();
    assert_eq!(completed, 1);
    assert_eq!(handle.last_report().await.unwrap().completed, 1);

    // Triggered run without waiting for the two-hour interval
    handle.trigger();
    let completed = tokio::time::timeout(Duration::from_secs(5), next_run(&mut events))
        .await
        .unwrap();
    assert_eq!(completed, 0);

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap();
}
