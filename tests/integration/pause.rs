//! Pausing, resuming and calendars through the scheduling API.

use crate::common::{in_ms, one_shot, start, stop, wait_for_trigger_state};
use cadence::testing::{wait_until, CountingJob};
use cadence::{
    InMemoryJobStore, JobDetail, JobKey, JobRegistry, RangeExclusionCalendar, Repeat, Schedule,
    Scheduler, SchedulerError, SharedCalendar, StorageError, Trigger, TriggerKey, TriggerState,
};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

fn counting_scheduler(job: Arc<CountingJob>) -> Scheduler {
    Scheduler::new(InMemoryJobStore::new())
        .with_job_factory(JobRegistry::new().register_instance("count", job))
}

fn every(name: &str, job: &str, ms: i64) -> Trigger {
    Trigger::builder(name, job)
        .with_schedule(Schedule::every(chrono::Duration::milliseconds(ms), Repeat::Forever))
        .starting_at(in_ms(10))
        .build()
        .unwrap()
}

/// Test: a paused trigger does not fire until it is resumed.
#[tokio::test]
async fn test_pause_and_resume_trigger() {
    let job = Arc::new(CountingJob::new());
    let (handle, task) = start(counting_scheduler(job.clone())).await;
    let key = TriggerKey::from("t");

    handle
        .schedule_job(JobDetail::new("j", "count"), one_shot("t", "j", in_ms(100)))
        .await
        .unwrap();
    handle.pause_trigger(&key).await.unwrap();
    assert_eq!(
        handle.get_trigger_state(&key).await.unwrap(),
        Some(TriggerState::Paused)
    );

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(job.count(), 0);

    // missed by far less than the misfire threshold, so it still fires
    handle.resume_trigger(&key).await.unwrap();
    assert!(wait_until(Duration::from_secs(1), || job.count() == 1).await);

    let missing = handle.pause_trigger(&TriggerKey::from("nope")).await;
    assert!(matches!(missing, Err(SchedulerError::TriggerNotFound(_))));
    stop(handle, task, true).await;
}

/// Test: pausing a job holds all its triggers; other jobs keep running.
#[tokio::test]
async fn test_pause_job_leaves_other_jobs_running() {
    let job = Arc::new(CountingJob::new());
    let (handle, task) = start(counting_scheduler(job.clone())).await;

    handle
        .schedule_job(JobDetail::new("held", "count"), every("h", "held", 20))
        .await
        .unwrap();
    handle
        .schedule_job(JobDetail::new("free", "count"), every("f", "free", 20))
        .await
        .unwrap();
    handle.pause_job(&JobKey::from("held")).await.unwrap();

    assert!(wait_until(Duration::from_secs(1), || job.count() >= 3).await);
    stop(handle, task, true).await;
    assert!(job.fired_triggers().iter().all(|k| k.name() == "f"));
}

/// Test: triggers added to a paused group start out paused.
#[tokio::test]
async fn test_paused_group_applies_to_new_triggers() {
    let job = Arc::new(CountingJob::new());
    let (handle, task) = start(counting_scheduler(job.clone())).await;

    handle.pause_trigger_group("nightly").await.unwrap();
    assert_eq!(handle.paused_trigger_groups().await.unwrap(), vec!["nightly"]);

    let trigger = Trigger::builder(TriggerKey::new("t", "nightly"), "j")
        .starting_at(in_ms(20))
        .build()
        .unwrap();
    handle
        .schedule_job(JobDetail::new("j", "count"), trigger)
        .await
        .unwrap();
    let key = TriggerKey::new("t", "nightly");
    assert_eq!(
        handle.get_trigger_state(&key).await.unwrap(),
        Some(TriggerState::Paused)
    );
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(job.count(), 0);

    handle.resume_trigger_group("nightly").await.unwrap();
    assert!(handle.paused_trigger_groups().await.unwrap().is_empty());
    assert!(wait_until(Duration::from_secs(1), || job.count() == 1).await);
    stop(handle, task, true).await;
}

/// Test: pause_all and resume_all cover every group.
#[tokio::test]
async fn test_pause_all_and_resume_all() {
    let job = Arc::new(CountingJob::new());
    let (handle, task) = start(counting_scheduler(job.clone())).await;

    handle
        .schedule_job(JobDetail::new("j", "count"), every("t", "j", 20))
        .await
        .unwrap();
    handle.pause_all().await.unwrap();
    let paused_at = job.count();
    tokio::time::sleep(Duration::from_millis(100)).await;
    // one firing may already have been under way
    assert!(job.count() <= paused_at + 1);

    handle.resume_all().await.unwrap();
    let resumed_at = job.count();
    assert!(wait_until(Duration::from_secs(1), || job.count() >= resumed_at + 2).await);
    stop(handle, task, true).await;
}

/// Test: fire times inside a calendar's excluded range are skipped.
#[tokio::test]
async fn test_calendar_excludes_fire_times() {
    let job = Arc::new(CountingJob::new());
    let (handle, task) = start(counting_scheduler(job.clone())).await;

    let now = Utc::now();
    let calendar: SharedCalendar = Arc::new(
        RangeExclusionCalendar::new("maintenance")
            .exclude(now, now + chrono::Duration::milliseconds(300)),
    );
    handle
        .add_calendar("maintenance", calendar, false, false)
        .await
        .unwrap();
    assert_eq!(handle.calendar_names().await.unwrap(), vec!["maintenance"]);

    let trigger = Trigger::builder("t", "j")
        .starting_at(now + chrono::Duration::milliseconds(50))
        .with_calendar("maintenance")
        .build()
        .unwrap();
    let first = handle
        .schedule_job(JobDetail::new("j", "count").with_durable(true), trigger)
        .await;
    // a one-shot inside the exclusion has nowhere to go
    assert!(matches!(first, Err(SchedulerError::Trigger(_))));

    let repeating = Trigger::builder("r", "j")
        .with_schedule(Schedule::every(chrono::Duration::milliseconds(100), Repeat::Forever))
        .starting_at(now + chrono::Duration::milliseconds(50))
        .with_calendar("maintenance")
        .build()
        .unwrap();
    let first = handle
        .schedule_job(JobDetail::new("j", "count").with_durable(true), repeating)
        .await
        .unwrap();
    assert!(first >= now + chrono::Duration::milliseconds(300));

    assert!(wait_until(Duration::from_secs(2), || job.count() >= 1).await);
    let removal = handle.delete_calendar("maintenance").await;
    assert!(matches!(
        removal,
        Err(SchedulerError::Storage(StorageError::InUse(_)))
    ));
    stop(handle, task, true).await;
}

/// Test: an unknown calendar name is rejected when the trigger is scheduled.
#[tokio::test]
async fn test_unknown_calendar_is_rejected() {
    let job = Arc::new(CountingJob::new());
    let (handle, task) = start(counting_scheduler(job)).await;

    let trigger = Trigger::builder("t", "j")
        .starting_at(in_ms(50))
        .with_calendar("holidays")
        .build()
        .unwrap();
    let result = handle.schedule_job(JobDetail::new("j", "count"), trigger).await;
    assert!(matches!(result, Err(SchedulerError::Invalid(_))));
    assert!(!handle.check_job_exists(&JobKey::from("j")).await.unwrap());
    stop(handle, task, true).await;
}

/// Test: deleting a job removes its triggers and stops future firings.
#[tokio::test]
async fn test_delete_job_stops_firing() {
    let job = Arc::new(CountingJob::new());
    let (handle, task) = start(counting_scheduler(job.clone())).await;

    handle
        .schedule_job(JobDetail::new("j", "count"), one_shot("t", "j", in_ms(100)))
        .await
        .unwrap();
    assert!(handle.delete_job(&JobKey::from("j")).await.unwrap());
    assert!(!handle.check_trigger_exists(&TriggerKey::from("t")).await.unwrap());
    wait_for_trigger_state(&handle, &TriggerKey::from("t"), None, Duration::from_millis(10)).await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(job.count(), 0);
    stop(handle, task, true).await;
}
