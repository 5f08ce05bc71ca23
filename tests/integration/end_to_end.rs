//! End-to-end scheduling scenarios.
//!
//! A job is scheduled through the public handle, the fire loop picks it up,
//! the worker pool runs it and the store records the outcome.

use crate::common::{in_ms, one_shot, start, stop, wait_for_trigger_state};
use async_trait::async_trait;
use cadence::config::{build_scheduler, JobConfigBuilder, YamlLoader};
use cadence::testing::{wait_until, CountingJob, RecordingHandler};
use cadence::{
    Event, EventBus, InMemoryJobStore, Job, JobDataMap, JobDetail, JobError, JobExecutionContext,
    JobKey, JobRegistry, Repeat, Schedule, Scheduler, SchedulerError, Trigger, TriggerKey,
    TriggerState,
};
use chrono::Utc;
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn counting_scheduler(job: Arc<CountingJob>) -> Scheduler {
    Scheduler::new(InMemoryJobStore::new())
        .with_job_factory(JobRegistry::new().register_instance("count", job))
}

/// Test: a one-shot trigger 100ms out has run exactly once after 150ms and is COMPLETE.
#[tokio::test]
async fn test_one_shot_runs_exactly_once() {
    let job = Arc::new(CountingJob::new());
    let (handle, task) = start(counting_scheduler(job.clone())).await;

    handle
        .schedule_job(JobDetail::new("j1", "count"), one_shot("t1", "j1", in_ms(100)))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(wait_until(Duration::from_millis(500), || job.count() == 1).await);
    wait_for_trigger_state(
        &handle,
        &TriggerKey::from("t1"),
        Some(TriggerState::Complete),
        Duration::from_secs(1),
    )
    .await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(job.count(), 1);
    stop(handle, task, true).await;
}

/// Test: a repeating simple trigger fires its first run plus the repeats, then completes.
#[tokio::test]
async fn test_repeat_count_is_honored() {
    let job = Arc::new(CountingJob::new());
    let (handle, task) = start(counting_scheduler(job.clone())).await;

    let trigger = Trigger::builder("t", "j")
        .with_schedule(Schedule::every(chrono::Duration::milliseconds(30), Repeat::Count(2)))
        .starting_at(in_ms(20))
        .build()
        .unwrap();
    handle
        .schedule_job(JobDetail::new("j", "count"), trigger)
        .await
        .unwrap();

    wait_for_trigger_state(
        &handle,
        &TriggerKey::from("t"),
        Some(TriggerState::Complete),
        Duration::from_secs(2),
    )
    .await;
    assert_eq!(job.count(), 3);
    stop(handle, task, true).await;
}

/// Job that records the data map it was given.
#[derive(Default)]
struct DataProbe {
    seen: Mutex<Vec<JobDataMap>>,
}

#[async_trait]
impl Job for DataProbe {
    async fn execute(&self, ctx: &mut JobExecutionContext) -> Result<(), JobError> {
        self.seen.lock().unwrap().push(ctx.data().clone());
        Ok(())
    }
}

/// Test: manual firing runs a stored job once with the supplied data.
#[tokio::test]
async fn test_trigger_job_passes_data() {
    let probe = Arc::new(DataProbe::default());
    let scheduler = Scheduler::new(InMemoryJobStore::new())
        .with_job_factory(JobRegistry::new().register_instance("probe", probe.clone()));
    let (handle, task) = start(scheduler).await;

    handle
        .add_job(
            JobDetail::new("report", "probe")
                .with_durable(true)
                .with_data("format", "pdf"),
            false,
        )
        .await
        .unwrap();

    let mut data = JobDataMap::new();
    data.insert("who".to_string(), json!("alice"));
    let trigger_key = handle.trigger_job(&JobKey::from("report"), data).await.unwrap();
    assert_eq!(trigger_key.group(), cadence::MANUAL_TRIGGER_GROUP);

    assert!(wait_until(Duration::from_secs(1), || probe.seen.lock().unwrap().len() == 1).await);
    let seen = probe.seen.lock().unwrap()[0].clone();
    assert_eq!(seen["who"], json!("alice"));
    assert_eq!(seen["format"], json!("pdf"));

    // the durable job outlives its manual trigger
    assert!(handle.check_job_exists(&JobKey::from("report")).await.unwrap());
    stop(handle, task, true).await;
}

/// Test: listeners observe a firing from start to completion, in order.
#[tokio::test]
async fn test_listener_sees_firing_lifecycle() {
    let job = Arc::new(CountingJob::new());
    let recorder = Arc::new(RecordingHandler::new());
    let events = EventBus::new();
    events.register(recorder.clone()).await;
    let (handle, task) = start(counting_scheduler(job.clone()).with_event_bus(events)).await;

    handle
        .schedule_job(JobDetail::new("j", "count"), one_shot("t", "j", in_ms(20)))
        .await
        .unwrap();
    assert!(
        wait_until(Duration::from_secs(1), || {
            recorder.count(|e| matches!(e, Event::TriggerCompleted { .. })) == 1
        })
        .await
    );
    stop(handle, task, true).await;

    let names: Vec<&'static str> = recorder
        .events()
        .iter()
        .filter_map(|e| match e {
            Event::SchedulerStarted => Some("started"),
            Event::JobScheduled { .. } => Some("scheduled"),
            Event::TriggerFired { .. } => Some("fired"),
            Event::JobToBeExecuted { .. } => Some("to_be_executed"),
            Event::JobWasExecuted { .. } => Some("was_executed"),
            Event::TriggerCompleted { .. } => Some("completed"),
            Event::SchedulerShutdown => Some("shutdown"),
            _ => None,
        })
        .collect();
    assert_eq!(
        names,
        vec![
            "started",
            "scheduled",
            "fired",
            "to_be_executed",
            "was_executed",
            "completed",
            "shutdown"
        ]
    );
}

/// Test: invalid requests fail synchronously with typed errors.
#[tokio::test]
async fn test_invalid_requests_are_rejected() {
    let job = Arc::new(CountingJob::new());
    let (handle, task) = start(counting_scheduler(job)).await;

    let result = handle
        .schedule_job(JobDetail::new("j", "no-such-type"), one_shot("t", "j", in_ms(1_000)))
        .await;
    assert!(matches!(result, Err(SchedulerError::UnknownJobType(_))));

    handle
        .schedule_job(JobDetail::new("j", "count"), one_shot("t", "j", in_ms(60_000)))
        .await
        .unwrap();
    let result = handle
        .schedule_job(JobDetail::new("j", "count"), one_shot("t", "j", in_ms(60_000)))
        .await;
    assert!(matches!(result, Err(SchedulerError::Storage(_))));

    // no New Year's midnight inside a one-minute window
    let never = Trigger::builder("never", "j")
        .starting_at(Utc::now() + chrono::Duration::minutes(1))
        .ending_at(Utc::now() + chrono::Duration::minutes(2))
        .with_schedule(Schedule::cron("0 0 0 1 1 *").unwrap())
        .build()
        .unwrap();
    let result = handle.schedule_trigger(never).await;
    assert!(matches!(result, Err(SchedulerError::Trigger(_))));

    let orphan = one_shot("orphan", "missing", in_ms(1_000));
    let result = handle.schedule_trigger(orphan).await;
    assert!(matches!(result, Err(SchedulerError::JobNotFound(_))));

    stop(handle.clone(), task, false).await;
    let result = handle
        .schedule_job(JobDetail::new("k", "count"), one_shot("u", "k", in_ms(10)))
        .await;
    assert!(matches!(result, Err(SchedulerError::Shutdown)));
}

/// Test: a job whose trigger set is rejected is not stored, nor are any of its triggers.
#[tokio::test]
async fn test_rejected_trigger_set_stores_nothing() {
    let job = Arc::new(CountingJob::new());
    let (handle, task) = start(counting_scheduler(job.clone())).await;

    let repeated = vec![
        one_shot("t", "j", in_ms(100)),
        one_shot("t", "j", in_ms(100)),
    ];
    let result = handle
        .schedule_job_with_triggers(JobDetail::new("j", "count"), repeated, false)
        .await;
    assert!(matches!(result, Err(SchedulerError::Storage(_))));
    assert!(!handle.check_job_exists(&JobKey::from("j")).await.unwrap());

    handle
        .schedule_job(JobDetail::new("other", "count"), one_shot("taken", "other", in_ms(60_000)))
        .await
        .unwrap();
    let clash = vec![
        one_shot("fresh", "j", in_ms(50)),
        one_shot("taken", "j", in_ms(50)),
    ];
    let result = handle
        .schedule_job_with_triggers(JobDetail::new("j", "count"), clash, false)
        .await;
    assert!(result.is_err());
    assert!(!handle.check_job_exists(&JobKey::from("j")).await.unwrap());
    assert!(!handle.check_trigger_exists(&TriggerKey::from("fresh")).await.unwrap());

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(job.count(), 0);
    stop(handle, task, true).await;
}

/// Test: rescheduling replaces the trigger; unscheduling the last trigger removes the job.
#[tokio::test]
async fn test_reschedule_and_unschedule() {
    let job = Arc::new(CountingJob::new());
    let (handle, task) = start(counting_scheduler(job.clone())).await;

    handle
        .schedule_job(JobDetail::new("j", "count"), one_shot("t", "j", in_ms(60_000)))
        .await
        .unwrap();
    let first = handle
        .reschedule_job(&TriggerKey::from("t"), one_shot("t2", "ignored", in_ms(30)))
        .await
        .unwrap();
    assert!(first.is_some());
    assert!(!handle.check_trigger_exists(&TriggerKey::from("t")).await.unwrap());
    let replacement = handle.get_trigger(&TriggerKey::from("t2")).await.unwrap().unwrap();
    assert_eq!(replacement.job_key(), &JobKey::from("j"));
    assert!(wait_until(Duration::from_secs(1), || job.count() == 1).await);

    handle
        .schedule_trigger(one_shot("t3", "j", in_ms(60_000)))
        .await
        .unwrap();
    assert!(handle.unschedule_job(&TriggerKey::from("t3")).await.unwrap());
    assert!(handle.get_triggers_of_job(&JobKey::from("j")).await.unwrap().len() <= 1);
    assert!(
        handle
            .reschedule_job(&TriggerKey::from("nope"), one_shot("x", "j", in_ms(10)))
            .await
            .unwrap()
            .is_none()
    );
    stop(handle, task, true).await;
}

/// Test: a YAML file drives a command job through the whole stack.
#[tokio::test]
async fn test_yaml_command_job_runs() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("ran");
    let yaml = format!(
        r#"
scheduler:
  instance_name: e2e
  thread_count: 2
jobs:
  - name: touch
    command: touch
    args: ["{}"]
    triggers:
      - name: soon
        schedule: {{ type: once }}
"#,
        marker.display()
    );
    let file = YamlLoader::parse(&yaml).unwrap();
    let (handle, task) = start(build_scheduler(&file.scheduler).await.unwrap()).await;
    assert_eq!(handle.scheduler_name(), "e2e");

    for job in &file.jobs {
        let (detail, triggers) = JobConfigBuilder::build(job, Utc::now()).unwrap();
        handle
            .schedule_job_with_triggers(detail, triggers, false)
            .await
            .unwrap();
    }
    assert!(wait_until(Duration::from_secs(5), || marker.exists()).await);
    wait_for_trigger_state(
        &handle,
        &TriggerKey::from("soon"),
        Some(TriggerState::Complete),
        Duration::from_secs(2),
    )
    .await;
    stop(handle, task, true).await;
}
