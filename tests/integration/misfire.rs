//! Misfire handling as seen through a running scheduler.

use crate::common::{in_ms, start, stop};
use cadence::testing::{wait_until, CountingJob, RecordingHandler};
use cadence::{
    Event, EventBus, InMemoryJobStore, JobDetail, JobRegistry, MisfireInstruction, Repeat,
    Schedule, Scheduler, StoreSettings, Trigger, TriggerKey,
};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

async fn recording_scheduler(
    job: Arc<CountingJob>,
    store: InMemoryJobStore,
) -> (Scheduler, Arc<RecordingHandler>) {
    let recorder = Arc::new(RecordingHandler::new());
    let events = EventBus::new();
    events.register(recorder.clone()).await;
    let scheduler = Scheduler::new(store)
        .with_job_factory(JobRegistry::new().register_instance("count", job))
        .with_event_bus(events);
    (scheduler, recorder)
}

fn misfired_count(recorder: &RecordingHandler) -> usize {
    recorder.count(|e| matches!(e, Event::TriggerMisfired { .. }))
}

/// Test: a cron trigger ten minutes behind with DO_NOTHING skips to its next future slot.
#[tokio::test]
async fn test_cron_do_nothing_skips_missed_slots() {
    let job = Arc::new(CountingJob::new());
    let (scheduler, recorder) = recording_scheduler(job.clone(), InMemoryJobStore::new()).await;
    let (handle, task) = start(scheduler).await;

    let trigger = Trigger::builder("minutely", "j")
        .with_schedule(Schedule::cron("0 * * * * *").unwrap())
        .starting_at(Utc::now() - chrono::Duration::minutes(10))
        .with_misfire_instruction(MisfireInstruction::DoNothing)
        .build()
        .unwrap();
    handle
        .schedule_job(JobDetail::new("j", "count"), trigger)
        .await
        .unwrap();

    assert!(wait_until(Duration::from_secs(1), || misfired_count(&recorder) == 1).await);
    let stored = handle
        .get_trigger(&TriggerKey::from("minutely"))
        .await
        .unwrap()
        .unwrap();
    let next = stored.next_fire_time().unwrap();
    assert!(next > Utc::now() - chrono::Duration::seconds(1));
    assert!(next <= Utc::now() + chrono::Duration::minutes(1));

    // the slot following a skip is at most a minute out and may be due now;
    // what matters is that none of the ten missed slots ran
    assert!(job.count() <= 1);
    stop(handle, task, true).await;
}

/// Test: a simple trigger behind with FIRE_NOW runs once now and then keeps its interval.
#[tokio::test]
async fn test_simple_fire_now_runs_once() {
    let job = Arc::new(CountingJob::new());
    let (scheduler, recorder) = recording_scheduler(job.clone(), InMemoryJobStore::new()).await;
    let (handle, task) = start(scheduler).await;

    let trigger = Trigger::builder("hourly", "j")
        .with_schedule(Schedule::every(chrono::Duration::hours(1), Repeat::Forever))
        .starting_at(Utc::now() - chrono::Duration::minutes(5))
        .with_misfire_instruction(MisfireInstruction::FireNow)
        .build()
        .unwrap();
    handle
        .schedule_job(JobDetail::new("j", "count"), trigger)
        .await
        .unwrap();

    assert!(wait_until(Duration::from_secs(1), || job.count() == 1).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(job.count(), 1);
    assert_eq!(misfired_count(&recorder), 1);

    let stored = handle
        .get_trigger(&TriggerKey::from("hourly"))
        .await
        .unwrap()
        .unwrap();
    let next = stored.next_fire_time().unwrap();
    let expected = Utc::now() + chrono::Duration::hours(1);
    assert!((next - expected).num_seconds().abs() < 5);
    stop(handle, task, true).await;
}

/// Test: IGNORE_MISFIRES fires every missed slot and is never reported as misfired.
#[tokio::test]
async fn test_ignore_misfires_catches_up() {
    let job = Arc::new(CountingJob::new());
    let (scheduler, recorder) = recording_scheduler(job.clone(), InMemoryJobStore::new()).await;
    let (handle, task) = start(scheduler).await;

    let trigger = Trigger::builder("catch-up", "j")
        .with_schedule(Schedule::every(chrono::Duration::minutes(1), Repeat::Count(2)))
        .starting_at(Utc::now() - chrono::Duration::seconds(150))
        .with_misfire_instruction(MisfireInstruction::IgnoreMisfires)
        .build()
        .unwrap();
    handle
        .schedule_job(JobDetail::new("j", "count"), trigger)
        .await
        .unwrap();

    assert!(wait_until(Duration::from_secs(2), || job.count() == 3).await);
    assert_eq!(misfired_count(&recorder), 0);
    stop(handle, task, true).await;
}

/// Test: a late fire time within the threshold is fired as usual, not misfired.
#[tokio::test]
async fn test_lateness_under_threshold_is_not_a_misfire() {
    let job = Arc::new(CountingJob::new());
    let store = InMemoryJobStore::with_settings(StoreSettings {
        misfire_threshold: chrono::Duration::seconds(5),
        ..Default::default()
    });
    let (scheduler, recorder) = recording_scheduler(job.clone(), store).await;
    let (handle, task) = start(scheduler.with_start_in_standby(true)).await;

    handle
        .schedule_job(
            JobDetail::new("j", "count"),
            Trigger::builder("late", "j").starting_at(in_ms(10)).build().unwrap(),
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(job.count(), 0);

    handle.start().await.unwrap();
    assert!(wait_until(Duration::from_secs(1), || job.count() == 1).await);
    assert_eq!(misfired_count(&recorder), 0);
    stop(handle, task, true).await;
}

/// Test: standby longer than the threshold makes a one-shot trigger misfire.
#[tokio::test]
async fn test_standby_past_threshold_misfires() {
    let job = Arc::new(CountingJob::new());
    let store = InMemoryJobStore::with_settings(StoreSettings {
        misfire_threshold: chrono::Duration::milliseconds(50),
        ..Default::default()
    });
    let (scheduler, recorder) = recording_scheduler(job.clone(), store).await;
    let (handle, task) = start(scheduler.with_start_in_standby(true)).await;

    let trigger = Trigger::builder("late", "j")
        .starting_at(in_ms(10))
        .with_misfire_instruction(MisfireInstruction::FireNow)
        .build()
        .unwrap();
    handle
        .schedule_job(JobDetail::new("j", "count"), trigger)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    handle.start().await.unwrap();
    assert!(wait_until(Duration::from_secs(1), || job.count() == 1).await);
    assert_eq!(misfired_count(&recorder), 1);
    stop(handle, task, true).await;
}
