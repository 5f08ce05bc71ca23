//! Non-concurrent jobs, interruption and shutdown of running work.

use crate::common::{in_ms, one_shot, start, stop, wait_for_trigger_state};
use cadence::testing::{wait_until, BlockingJob, CountingJob, RecordingHandler};
use cadence::{
    Event, EventBus, InMemoryJobStore, JobDetail, JobKey, JobRegistry, Repeat, Schedule,
    Scheduler, Trigger, TriggerKey, TriggerState,
};
use std::sync::Arc;
use std::time::Duration;

fn blocking_scheduler(job: Arc<BlockingJob>) -> Scheduler {
    Scheduler::new(InMemoryJobStore::new())
        .with_job_factory(JobRegistry::new().register_instance("block", job))
}

/// Test: while a non-concurrent job runs, its other triggers are BLOCKED and wait.
#[tokio::test]
async fn test_non_concurrent_job_blocks_other_triggers() {
    let job = Arc::new(BlockingJob::new());
    let (handle, task) = start(blocking_scheduler(job.clone())).await;

    let detail = JobDetail::new("exclusive", "block").with_concurrent_execution_disallowed(true);
    handle
        .schedule_job(detail, one_shot("first", "exclusive", in_ms(20)))
        .await
        .unwrap();
    handle
        .schedule_trigger(one_shot("second", "exclusive", in_ms(40)))
        .await
        .unwrap();

    assert!(wait_until(Duration::from_secs(1), || job.started() == 1).await);
    wait_for_trigger_state(
        &handle,
        &TriggerKey::from("second"),
        Some(TriggerState::Blocked),
        Duration::from_secs(1),
    )
    .await;

    // well past the second trigger's fire time, still only one execution
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(job.started(), 1);
    assert_eq!(job.running().len(), 1);

    job.release();
    assert!(wait_until(Duration::from_secs(1), || job.finished() == 2).await);
    wait_for_trigger_state(
        &handle,
        &TriggerKey::from("second"),
        Some(TriggerState::Complete),
        Duration::from_secs(1),
    )
    .await;
    stop(handle, task, true).await;
}

/// Test: a fast repeating trigger never overlaps executions of a non-concurrent job.
#[tokio::test]
async fn test_non_concurrent_job_never_overlaps() {
    let job = Arc::new(CountingJob::with_delay(Duration::from_millis(40)));
    let scheduler = Scheduler::new(InMemoryJobStore::new())
        .with_job_factory(JobRegistry::new().register_instance("slow", job.clone()))
        .with_thread_count(4);
    let (handle, task) = start(scheduler).await;

    let trigger = Trigger::builder("fast", "slow-job")
        .with_schedule(Schedule::every(chrono::Duration::milliseconds(10), Repeat::Forever))
        .starting_at(in_ms(10))
        .build()
        .unwrap();
    handle
        .schedule_job(
            JobDetail::new("slow-job", "slow").with_concurrent_execution_disallowed(true),
            trigger,
        )
        .await
        .unwrap();

    assert!(wait_until(Duration::from_secs(2), || job.count() >= 3).await);
    stop(handle, task, true).await;
    assert_eq!(job.max_concurrent(), 1);
}

/// Test: interrupting a job key stops its running execution with an error outcome.
#[tokio::test]
async fn test_interrupt_running_job() {
    let job = Arc::new(BlockingJob::new());
    let recorder = Arc::new(RecordingHandler::new());
    let events = EventBus::new();
    events.register(recorder.clone()).await;
    let (handle, task) = start(blocking_scheduler(job.clone()).with_event_bus(events)).await;

    handle
        .schedule_job(JobDetail::new("long", "block"), one_shot("t", "long", in_ms(10)))
        .await
        .unwrap();
    assert!(wait_until(Duration::from_secs(1), || job.started() == 1).await);

    let executing = handle.currently_executing_jobs();
    assert_eq!(executing.len(), 1);
    assert_eq!(handle.interrupt(&JobKey::from("long")), 1);
    assert_eq!(handle.interrupt(&JobKey::from("idle")), 0);

    assert!(wait_until(Duration::from_secs(1), || job.finished() == 1).await);
    assert!(
        wait_until(Duration::from_secs(1), || {
            recorder.count(|e| {
                matches!(e, Event::JobWasExecuted { error: Some(_), .. })
            }) == 1
        })
        .await
    );
    assert!(handle.currently_executing_jobs().is_empty());
    stop(handle, task, true).await;
}

/// Test: shutdown with interruption enabled stops blocked jobs instead of waiting them out.
#[tokio::test]
async fn test_shutdown_interrupts_running_jobs() {
    let job = Arc::new(BlockingJob::new());
    let scheduler = blocking_scheduler(job.clone()).with_interrupt_jobs_on_shutdown(true);
    let (handle, task) = start(scheduler).await;

    handle
        .schedule_job(JobDetail::new("stuck", "block"), one_shot("t", "stuck", in_ms(10)))
        .await
        .unwrap();
    assert!(wait_until(Duration::from_secs(1), || job.started() == 1).await);

    let begun = tokio::time::Instant::now();
    stop(handle.clone(), task, true).await;
    assert!(begun.elapsed() < Duration::from_secs(2));
    assert_eq!(job.finished(), 1);
    assert!(handle.is_shutdown().await);
}

/// Test: shutdown without waiting returns while a job is still running.
#[tokio::test]
async fn test_shutdown_without_waiting() {
    let job = Arc::new(BlockingJob::new());
    let (handle, task) = start(blocking_scheduler(job.clone())).await;

    handle
        .schedule_job(JobDetail::new("stuck", "block"), one_shot("t", "stuck", in_ms(10)))
        .await
        .unwrap();
    assert!(wait_until(Duration::from_secs(1), || job.started() == 1).await);

    stop(handle, task, false).await;
    assert_eq!(job.finished(), 0);
    job.release();
}
