//! Fire order through the running scheduler.

use crate::common::{start, stop};
use cadence::testing::{wait_until, CountingJob, RecordingHandler};
use cadence::{
    Event, EventBus, InMemoryJobStore, JobDetail, JobRegistry, JobStore, Scheduler, Trigger,
    TriggerKey,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

fn trigger(name: &str, at: DateTime<Utc>, priority: i32) -> Trigger {
    Trigger::builder(name, "j")
        .starting_at(at)
        .with_priority(priority)
        .build()
        .unwrap()
}

async fn fire_order(store: Arc<dyn JobStore>) -> Vec<TriggerKey> {
    let job = Arc::new(CountingJob::new());
    let recorder = Arc::new(RecordingHandler::new());
    let events = EventBus::new();
    events.register(recorder.clone()).await;
    let scheduler = Scheduler::with_store(store)
        .with_job_factory(JobRegistry::new().register_instance("count", job.clone()))
        .with_event_bus(events)
        .with_thread_count(1)
        .with_start_in_standby(true);
    let (handle, task) = start(scheduler).await;

    // t1 and t2 share a fire time; t3 is later but has the highest priority
    let base = Utc::now() + chrono::Duration::milliseconds(100);
    handle
        .add_job(JobDetail::new("j", "count").with_durable(true), false)
        .await
        .unwrap();
    handle.schedule_trigger(trigger("t3", base + chrono::Duration::milliseconds(50), 20)).await.unwrap();
    handle.schedule_trigger(trigger("t2", base, 5)).await.unwrap();
    handle.schedule_trigger(trigger("t1", base, 10)).await.unwrap();
    handle.start().await.unwrap();

    assert!(wait_until(Duration::from_secs(2), || job.count() == 3).await);
    stop(handle, task, true).await;

    recorder
        .events()
        .into_iter()
        .filter_map(|e| match e {
            Event::TriggerFired { trigger_key, .. } => Some(trigger_key),
            _ => None,
        })
        .collect()
}

/// Test: equal fire times go by priority; a later fire time waits whatever its priority.
#[tokio::test]
async fn test_fire_order_in_memory() {
    let order = fire_order(Arc::new(InMemoryJobStore::new())).await;
    assert_eq!(
        order,
        vec![TriggerKey::from("t1"), TriggerKey::from("t2"), TriggerKey::from("t3")]
    );
}

#[cfg(feature = "sqlite")]
#[tokio::test]
async fn test_fire_order_in_sqlite() {
    use cadence::{SqliteJobStore, StoreSettings};

    let store = SqliteJobStore::in_memory(StoreSettings::default()).await.unwrap();
    let order = fire_order(Arc::new(store)).await;
    assert_eq!(
        order,
        vec![TriggerKey::from("t1"), TriggerKey::from("t2"), TriggerKey::from("t3")]
    );
}

/// Test: a batch acquires several due triggers at once and still fires them in order.
#[tokio::test]
async fn test_batch_acquisition_keeps_order() {
    let job = Arc::new(CountingJob::new());
    let recorder = Arc::new(RecordingHandler::new());
    let events = EventBus::new();
    events.register(recorder.clone()).await;
    let scheduler = Scheduler::new(InMemoryJobStore::new())
        .with_job_factory(JobRegistry::new().register_instance("count", job.clone()))
        .with_event_bus(events)
        .with_batch(5, chrono::Duration::milliseconds(100))
        .with_start_in_standby(true);
    let (handle, task) = start(scheduler).await;

    let base = Utc::now() + chrono::Duration::milliseconds(100);
    handle
        .add_job(JobDetail::new("j", "count").with_durable(true), false)
        .await
        .unwrap();
    for (i, name) in ["a", "b", "c", "d"].iter().enumerate() {
        let at = base + chrono::Duration::milliseconds(10 * i as i64);
        handle.schedule_trigger(trigger(name, at, 5)).await.unwrap();
    }
    handle.start().await.unwrap();

    assert!(wait_until(Duration::from_secs(2), || job.count() == 4).await);
    stop(handle, task, true).await;

    let fired: Vec<String> = recorder
        .events()
        .into_iter()
        .filter_map(|e| match e {
            Event::TriggerFired { trigger_key, .. } => Some(trigger_key.name().to_string()),
            _ => None,
        })
        .collect();
    assert_eq!(fired, vec!["a", "b", "c", "d"]);
}
