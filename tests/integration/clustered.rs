//! Several scheduler instances sharing one SQLite database.

use crate::common::{fast_cluster, in_ms, one_shot, sqlite_node, start, stop};
use async_trait::async_trait;
use cadence::storage::{TriggerFiredResult, RECOVERY_GROUP};
use cadence::testing::{wait_until, CountingJob, RecordingHandler};
use cadence::{
    ClusterSettings, Event, EventBus, Job, JobDetail, JobError, JobExecutionContext, JobRegistry, JobStore,
    Scheduler, SqliteJobStore, TriggerKey, TriggerState,
};
use chrono::Utc;
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

async fn node(path: &Path, instance: &str, job: Arc<CountingJob>) -> Scheduler {
    let store = sqlite_node(path, instance, fast_cluster()).await;
    Scheduler::new(store)
        .with_name("cluster-test")
        .with_job_factory(JobRegistry::new().register_instance("count", job))
        .with_idle_wait(Duration::from_millis(50))
}

/// Test: two nodes polling the same database fire each trigger exactly once.
#[tokio::test]
async fn test_two_nodes_fire_each_trigger_once() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("cluster.db");
    let job = Arc::new(CountingJob::new());

    let (a, a_task) = start(node(&path, "node-a", job.clone()).await).await;
    let (b, b_task) = start(node(&path, "node-b", job.clone()).await).await;

    a.add_job(JobDetail::new("shared", "count").with_durable(true), false)
        .await
        .unwrap();
    for i in 0..20 {
        let name = format!("t{}", i);
        a.schedule_trigger(one_shot(&name, "shared", in_ms(100 + 10 * i)))
            .await
            .unwrap();
    }

    assert!(wait_until(Duration::from_secs(5), || job.count() == 20).await);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(job.count(), 20);

    let fired = job.fired_triggers();
    let unique: HashSet<&TriggerKey> = fired.iter().collect();
    assert_eq!(unique.len(), 20);

    stop(a, a_task, true).await;
    stop(b, b_task, true).await;
}

/// Job that records whether each execution was a recovery.
#[derive(Default)]
struct RecoveryProbe {
    runs: Mutex<Vec<(bool, Option<TriggerKey>)>>,
}

#[async_trait]
impl Job for RecoveryProbe {
    async fn execute(&self, ctx: &mut JobExecutionContext) -> Result<(), JobError> {
        self.runs
            .lock()
            .unwrap()
            .push((ctx.is_recovering(), ctx.recovering_trigger_key()));
        Ok(())
    }
}

/// Test: a node that dies mid-execution has its recoverable job re-run once by a survivor.
#[tokio::test]
async fn test_survivor_recovers_crashed_node() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("cluster.db");

    // node A fires a trigger and disappears without completing it
    let crashed = sqlite_node(&path, "node-a", fast_cluster()).await;
    crashed.checkin().await.unwrap();
    crashed
        .store_job_and_trigger(
            JobDetail::new("important", "probe").with_requests_recovery(true),
            one_shot("t", "important", Utc::now()),
        )
        .await
        .unwrap();
    let acquired = crashed
        .acquire_next_triggers(Utc::now() + chrono::Duration::seconds(1), 1, chrono::Duration::zero())
        .await
        .unwrap();
    assert_eq!(acquired.len(), 1);
    let fired = crashed.trigger_fired(&acquired[0]).await.unwrap();
    assert!(matches!(fired, TriggerFiredResult::Fired(_)));
    assert_eq!(crashed.fired_records().await.unwrap().len(), 1);
    crashed.close().await;

    // let node A's checkin go stale
    tokio::time::sleep(Duration::from_millis(300)).await;

    let probe = Arc::new(RecoveryProbe::default());
    let store = sqlite_node(&path, "node-b", fast_cluster()).await;
    let scheduler = Scheduler::new(store)
        .with_job_factory(JobRegistry::new().register_instance("probe", probe.clone()))
        .with_idle_wait(Duration::from_millis(50));
    let (b, b_task) = start(scheduler).await;

    assert!(wait_until(Duration::from_secs(5), || probe.runs.lock().unwrap().len() == 1).await);
    tokio::time::sleep(Duration::from_millis(300)).await;
    let runs = probe.runs.lock().unwrap().clone();
    assert_eq!(runs.len(), 1);
    assert!(runs[0].0);
    assert_eq!(runs[0].1, Some(TriggerKey::from("t")));

    assert_eq!(
        b.get_trigger_state(&TriggerKey::from("t")).await.unwrap(),
        Some(TriggerState::Complete)
    );
    // the one-shot recovery trigger is spent
    for key in b.trigger_keys().await.unwrap() {
        if key.group() == RECOVERY_GROUP {
            assert_eq!(
                b.get_trigger_state(&key).await.unwrap(),
                Some(TriggerState::Complete)
            );
        }
    }
    stop(b, b_task, true).await;

    // nothing of node A is left in flight
    let inspect = SqliteJobStore::open(&path, Default::default(), ClusterSettings::default())
        .await
        .unwrap();
    assert!(inspect.fired_records().await.unwrap().is_empty());
    let instances: Vec<String> = inspect
        .scheduler_states()
        .await
        .unwrap()
        .into_iter()
        .map(|s| s.instance_id.as_str().to_string())
        .collect();
    assert!(!instances.contains(&"node-a".to_string()));
}

/// Test: a recovery pass run twice leaves the same state as running it once.
#[tokio::test]
async fn test_recovery_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("cluster.db");

    let crashed = sqlite_node(&path, "node-a", fast_cluster()).await;
    crashed.checkin().await.unwrap();
    crashed
        .store_job_and_trigger(
            JobDetail::new("important", "probe").with_requests_recovery(true),
            one_shot("t", "important", Utc::now()),
        )
        .await
        .unwrap();
    let acquired = crashed
        .acquire_next_triggers(Utc::now() + chrono::Duration::seconds(1), 1, chrono::Duration::zero())
        .await
        .unwrap();
    crashed.trigger_fired(&acquired[0]).await.unwrap();
    crashed.close().await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    let survivor = sqlite_node(&path, "node-b", fast_cluster()).await;
    survivor.checkin().await.unwrap();
    let after_first = survivor.trigger_keys().await.unwrap();
    survivor.checkin().await.unwrap();
    let after_second = survivor.trigger_keys().await.unwrap();

    assert_eq!(after_first, after_second);
    let recovery: Vec<&TriggerKey> = after_first
        .iter()
        .filter(|k| k.group() == RECOVERY_GROUP)
        .collect();
    assert_eq!(recovery.len(), 1);
    assert!(survivor.fired_records().await.unwrap().is_empty());
}

async fn set_state_lock_owner(path: &Path, owner: Option<&str>) {
    let pool = sqlx::SqlitePool::connect(&format!("sqlite://{}", path.display()))
        .await
        .unwrap();
    let expires_at = owner.map(|_| i64::MAX / 2);
    sqlx::query("UPDATE locks SET owner = ?, expires_at = ? WHERE lock_name = 'STATE_ACCESS'")
        .bind(owner)
        .bind(expires_at)
        .execute(&pool)
        .await
        .unwrap();
    pool.close().await;
}

/// Test: a node that cannot check in stops firing, and resumes once checkins succeed.
#[tokio::test]
async fn test_node_with_stale_checkin_does_not_fire() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("cluster.db");
    let job = Arc::new(CountingJob::new());
    let recorder = Arc::new(RecordingHandler::new());
    let events = EventBus::new();
    events.register(recorder.clone()).await;

    let cluster = ClusterSettings {
        lock_timeout: Duration::from_millis(50),
        ..fast_cluster()
    };
    let store = sqlite_node(&path, "node-a", cluster).await;
    let scheduler = Scheduler::new(store)
        .with_job_factory(JobRegistry::new().register_instance("count", job.clone()))
        .with_event_bus(events)
        .with_idle_wait(Duration::from_millis(50));
    let (handle, task) = start(scheduler).await;

    // another connection holds the cluster-state lock for good
    set_state_lock_owner(&path, Some("intruder#0")).await;
    tokio::time::sleep(Duration::from_millis(600)).await;

    handle
        .schedule_job(JobDetail::new("j", "count"), one_shot("t", "j", in_ms(50)))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(job.count(), 0);
    assert_eq!(
        handle.get_trigger_state(&TriggerKey::from("t")).await.unwrap(),
        Some(TriggerState::Waiting)
    );
    assert!(recorder.count(|e| matches!(e, Event::SchedulerError { .. })) >= 1);

    set_state_lock_owner(&path, None).await;
    assert!(wait_until(Duration::from_secs(3), || job.count() == 1).await);
    stop(handle, task, true).await;
}
