//! Common test utilities shared across integration tests.

#![allow(dead_code)]

use cadence::{JobKey, Scheduler, SchedulerHandle, Trigger, TriggerKey, TriggerState};
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::task::JoinHandle;

#[cfg(feature = "sqlite")]
use cadence::{ClusterSettings, InstanceId, SqliteJobStore, StoreSettings};
#[cfg(feature = "sqlite")]
use std::path::Path;

/// A moment `ms` milliseconds from now.
pub fn in_ms(ms: i64) -> DateTime<Utc> {
    Utc::now() + chrono::Duration::milliseconds(ms)
}

/// A trigger that fires once at `at`.
pub fn one_shot(name: &str, job: &str, at: DateTime<Utc>) -> Trigger {
    Trigger::builder(name, job).starting_at(at).build().unwrap()
}

/// Start a scheduler with settings suited to tests.
pub async fn start(scheduler: Scheduler) -> (SchedulerHandle, JoinHandle<()>) {
    scheduler
        .with_shutdown_timeout(Duration::from_secs(5))
        .start()
        .await
        .unwrap()
}

/// Shut down and wait for the fire loop to exit.
pub async fn stop(handle: SchedulerHandle, task: JoinHandle<()>, wait_for_jobs: bool) {
    handle.shutdown(wait_for_jobs).await.unwrap();
    tokio::time::timeout(Duration::from_secs(10), task)
        .await
        .expect("fire loop did not stop")
        .unwrap();
}

/// Poll a trigger's state until it matches `expected`.
///
/// # Panics
///
/// Panics if the timeout is reached first.
pub async fn wait_for_trigger_state(
    handle: &SchedulerHandle,
    key: &TriggerKey,
    expected: Option<TriggerState>,
    timeout: Duration,
) {
    let start = tokio::time::Instant::now();
    loop {
        let state = handle.get_trigger_state(key).await.unwrap();
        if state == expected {
            return;
        }
        if start.elapsed() > timeout {
            panic!(
                "timeout waiting for trigger {} to reach {:?}, current state: {:?}",
                key, expected, state
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn job_key(name: &str) -> JobKey {
    JobKey::from(name)
}

/// Cluster settings with short heartbeats so failure detection is quick.
#[cfg(feature = "sqlite")]
pub fn fast_cluster() -> ClusterSettings {
    ClusterSettings {
        clustered: true,
        checkin_interval: Duration::from_millis(100),
        checkin_grace: Duration::from_millis(100),
        lock_lease: Duration::from_secs(10),
        lock_timeout: Duration::from_secs(5),
    }
}

/// Open a store on a database file shared with other instances.
#[cfg(feature = "sqlite")]
pub async fn sqlite_node(path: &Path, instance: &str, cluster: ClusterSettings) -> SqliteJobStore {
    let settings = StoreSettings {
        instance_id: InstanceId::new(instance),
        instance_name: "cluster-test".to_string(),
        ..Default::default()
    };
    SqliteJobStore::open(path, settings, cluster).await.unwrap()
}
