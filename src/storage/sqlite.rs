//! SQLite job store.
//!
//! Persistent storage on SQLite through `sqlx`. Every mutation of trigger
//! state runs inside a transaction while `TRIGGER_ACCESS` is held. When
//! clustered, the locks are leased rows in the `locks` table, so several
//! processes can share one database file; each node checks in periodically
//! and recovers the in-flight work of nodes that stop checking in.
//!
//! Calendar behaviour lives in the process that registered it. Only the
//! calendar name and description are persisted, so every node of a cluster
//! must register the same calendars.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use sqlx::sqlite::{
    Sqlite, SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
};
use sqlx::Transaction;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

use super::lock::{DbLockManager, LocalLockManager, LockManager, LockName};
use super::{
    check_trigger_set, deliver, AcquiredTrigger, ALL_GROUPS_PAUSED, FiredState, FiredTriggerRecord, JobStore, Notice,
    SchedulerStateRecord, StorageError, StoreSettings, TriggerFiredBundle, TriggerFiredResult,
    TriggerState, RECOVERY_GROUP,
};
use crate::core::calendar::SharedCalendar;
use crate::core::clock::{from_millis, Clock, SharedClock};
use crate::core::context::{
    RECOVERING_FIRE_TIME, RECOVERING_SCHEDULED_FIRE_TIME, RECOVERING_TRIGGER_GROUP,
    RECOVERING_TRIGGER_NAME,
};
use crate::core::job::JobDetail;
use crate::core::misfire::MisfireInstruction;
use crate::core::trigger::{CompletedExecutionInstruction, Trigger};
use crate::core::types::{FireInstanceId, InstanceId, JobKey, TriggerKey};
use crate::scheduler::{NoopSignaler, SchedulerSignaler};

/// Clustering parameters of a [`SqliteJobStore`].
#[derive(Debug, Clone)]
pub struct ClusterSettings {
    /// Share the database with other scheduler instances.
    pub clustered: bool,
    /// How often this node records a heartbeat.
    pub checkin_interval: std::time::Duration,
    /// Extra time past a node's interval before it is declared failed.
    pub checkin_grace: std::time::Duration,
    /// How long a database lock is held before others may take it over.
    pub lock_lease: std::time::Duration,
    /// How long to wait for a database lock.
    pub lock_timeout: std::time::Duration,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            clustered: false,
            checkin_interval: std::time::Duration::from_millis(7_500),
            checkin_grace: std::time::Duration::from_millis(7_500),
            lock_lease: std::time::Duration::from_secs(30),
            lock_timeout: std::time::Duration::from_secs(10),
        }
    }
}

type FiredRow = (
    String,
    String,
    String,
    String,
    String,
    String,
    i64,
    i64,
    i32,
    String,
    bool,
    bool,
);

const FIRED_COLUMNS: &str = "entry_id, trigger_group, trigger_name, job_group, job_name, \
     instance_id, fired_time, sched_time, priority, state, is_nonconcurrent, requests_recovery";

/// SQLite job store.
pub struct SqliteJobStore {
    pool: SqlitePool,
    settings: StoreSettings,
    cluster: ClusterSettings,
    locks: Box<dyn LockManager>,
    signaler: RwLock<Arc<dyn SchedulerSignaler>>,
    calendars: RwLock<HashMap<String, SharedCalendar>>,
    first_checkin: AtomicBool,
}

impl SqliteJobStore {
    /// Open (creating if needed) the database at `path` and run migrations.
    pub async fn open(
        path: impl AsRef<Path>,
        settings: StoreSettings,
        cluster: ClusterSettings,
    ) -> Result<Self, StorageError> {
        let path_str = path.as_ref().to_string_lossy();
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path_str))
            .map_err(|e| StorageError::Other(e.to_string()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Other(e.to_string()))?;

        Self::with_pool(pool, settings, cluster).await
    }

    /// Create a store on a private in-memory database (useful for testing).
    ///
    /// An in-memory database cannot be shared, so the store is never clustered.
    pub async fn in_memory(settings: StoreSettings) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StorageError::Other(e.to_string()))?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Other(e.to_string()))?;

        Self::with_pool(pool, settings, ClusterSettings::default()).await
    }

    async fn with_pool(
        pool: SqlitePool,
        settings: StoreSettings,
        cluster: ClusterSettings,
    ) -> Result<Self, StorageError> {
        let locks: Box<dyn LockManager> = if cluster.clustered {
            let owner = format!("{}#{}", settings.instance_id, uuid::Uuid::new_v4());
            Box::new(DbLockManager::new(
                pool.clone(),
                owner,
                settings.clock.clone(),
                cluster.lock_lease,
                cluster.lock_timeout,
            ))
        } else {
            Box::new(LocalLockManager::new())
        };

        let store = Self {
            pool,
            settings,
            cluster,
            locks,
            signaler: RwLock::new(Arc::new(NoopSignaler)),
            calendars: RwLock::new(HashMap::new()),
            first_checkin: AtomicBool::new(true),
        };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Run database migrations.
    async fn run_migrations(&self) -> Result<(), StorageError> {
        let schema = include_str!("../../migrations/001_initial_schema.sql");
        sqlx::raw_sql(schema)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Other(format!("migration failed: {}", e)))?;
        Ok(())
    }

    /// Close the database connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Heartbeat rows of every known cluster member.
    pub async fn scheduler_states(&self) -> Result<Vec<SchedulerStateRecord>, StorageError> {
        let rows: Vec<(String, i64, i64)> = sqlx::query_as(
            "SELECT instance_id, last_checkin_time, checkin_interval FROM scheduler_state ORDER BY instance_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;
        Ok(rows.into_iter().map(state_record).collect())
    }

    /// Fired-trigger records currently held, for inspection.
    pub async fn fired_records(&self) -> Result<Vec<FiredTriggerRecord>, StorageError> {
        let rows: Vec<FiredRow> = sqlx::query_as(&format!(
            "SELECT {} FROM fired_triggers ORDER BY fired_time",
            FIRED_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;
        rows.into_iter().map(fired_record).collect()
    }

    fn now(&self) -> DateTime<Utc> {
        self.settings.clock.now()
    }

    /// Start a write transaction. Taking the write lock up front keeps a
    /// read snapshot from going stale before the first write.
    async fn begin(&self) -> Result<Transaction<'static, Sqlite>, StorageError> {
        self.pool.begin_with("BEGIN IMMEDIATE").await.map_err(db)
    }

    fn deliver(&self, notices: Vec<Notice>) {
        if notices.is_empty() {
            return;
        }
        let signaler = match self.signaler.read() {
            Ok(s) => s.clone(),
            Err(_) => return,
        };
        deliver(signaler.as_ref(), notices);
    }

    fn calendar(&self, name: &str) -> Result<Option<SharedCalendar>, StorageError> {
        let calendars = self.calendars.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(calendars.get(name).cloned())
    }

    /// Run `op` while holding `name`. The lock is released whatever `op` returns.
    async fn locked<T, F>(&self, name: LockName, op: F) -> Result<T, StorageError>
    where
        F: Future<Output = Result<T, StorageError>>,
    {
        let held = self.locks.obtain(name).await?;
        let result = op.await;
        if let Err(e) = self.locks.release(held).await {
            warn!(lock = %name, error = %e, "failed to release store lock");
        }
        result
    }

    // Operations below run with TRIGGER_ACCESS held.

    async fn store_trigger_op(
        &self,
        conn: &mut SqliteConnection,
        trigger: &Trigger,
        replace: bool,
    ) -> Result<(), StorageError> {
        if fetch_trigger(conn, trigger.key()).await?.is_some() && !replace {
            return Err(StorageError::DuplicateKey(format!("trigger: {}", trigger.key())));
        }
        let Some(job) = fetch_job(conn, trigger.job_key()).await? else {
            return Err(StorageError::NotFound(format!(
                "job {} referenced by trigger {}",
                trigger.job_key(),
                trigger.key()
            )));
        };
        let paused = group_paused(conn, trigger.key().group()).await?;
        let blocked = job.is_concurrent_execution_disallowed() && job_blocked(conn, job.key()).await?;
        write_trigger(conn, trigger, TriggerState::on_store(paused, blocked)).await
    }

    async fn remove_trigger_op(
        &self,
        conn: &mut SqliteConnection,
        key: &TriggerKey,
        remove_orphaned_job: bool,
        notices: &mut Vec<Notice>,
    ) -> Result<bool, StorageError> {
        let Some((trigger, _)) = fetch_trigger(conn, key).await? else {
            return Ok(false);
        };
        delete_trigger(conn, key).await?;
        if remove_orphaned_job {
            let job_key = trigger.job_key();
            let orphaned = fetch_job(conn, job_key).await?.is_some_and(|j| !j.is_durable())
                && trigger_keys_for_job(conn, job_key).await?.is_empty();
            if orphaned {
                delete_job(conn, job_key).await?;
                notices.push(Notice::JobDeleted(job_key.clone()));
            }
        }
        Ok(true)
    }

    async fn resume_trigger_op(
        &self,
        conn: &mut SqliteConnection,
        key: &TriggerKey,
        notices: &mut Vec<Notice>,
    ) -> Result<(), StorageError> {
        let Some((mut trigger, state)) = fetch_trigger(conn, key).await? else {
            return Ok(());
        };
        if !state.is_paused() {
            return Ok(());
        }
        let blocked = job_blocked(conn, trigger.job_key()).await?;
        let calendar = match trigger.calendar_name() {
            Some(name) => self.calendar(name)?,
            None => None,
        };
        let mut new_state = TriggerState::on_store(false, blocked);
        let misfire = self.settings.misfire_handler();
        if misfire
            .apply(&mut trigger, calendar.as_deref(), self.now())
            .is_some()
        {
            notices.push(Notice::Misfired(trigger.clone()));
            if trigger.next_fire_time().is_none() {
                new_state = TriggerState::Complete;
                notices.push(Notice::Finalized(trigger.clone()));
            }
        }
        if let Some(t) = trigger.next_fire_time() {
            notices.push(Notice::Signal(Some(t)));
        }
        write_trigger(conn, &trigger, new_state).await
    }

    async fn pause_group_op(&self, conn: &mut SqliteConnection, group: &str) -> Result<(), StorageError> {
        sqlx::query("INSERT OR IGNORE INTO paused_trigger_groups (trigger_group) VALUES (?)")
            .bind(group)
            .execute(&mut *conn)
            .await
            .map_err(db)?;
        for key in trigger_keys_in_group(conn, group).await? {
            pause_trigger(conn, &key).await?;
        }
        Ok(())
    }

    async fn resume_group_op(
        &self,
        conn: &mut SqliteConnection,
        group: &str,
        notices: &mut Vec<Notice>,
    ) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM paused_trigger_groups WHERE trigger_group = ?")
            .bind(group)
            .execute(&mut *conn)
            .await
            .map_err(db)?;
        for key in trigger_keys_in_group(conn, group).await? {
            self.resume_trigger_op(conn, &key, notices).await?;
        }
        Ok(())
    }

    /// Apply misfire instructions to overdue waiting triggers, bounded per pass.
    async fn recover_misfires_op(
        &self,
        conn: &mut SqliteConnection,
        notices: &mut Vec<Notice>,
    ) -> Result<usize, StorageError> {
        let now = self.now();
        let misfire = self.settings.misfire_handler();
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT definition FROM triggers
            WHERE state = 'WAITING' AND next_fire_time < ? AND misfire_instruction != ?
            ORDER BY next_fire_time ASC, priority DESC
            LIMIT ?
            "#,
        )
        .bind(misfire.misfire_cutoff(now).timestamp_millis())
        .bind(MisfireInstruction::IgnoreMisfires.as_str())
        .bind(self.settings.max_misfires_per_acquisition as i64)
        .fetch_all(&mut *conn)
        .await
        .map_err(db)?;

        let mut handled = 0;
        for (definition,) in rows {
            let mut trigger: Trigger = serde_json::from_str(&definition)?;
            let calendar = match trigger.calendar_name() {
                Some(name) => self.calendar(name)?,
                None => None,
            };
            if misfire.apply(&mut trigger, calendar.as_deref(), now).is_none() {
                continue;
            }
            handled += 1;
            notices.push(Notice::Misfired(trigger.clone()));
            match trigger.next_fire_time() {
                Some(t) => {
                    notices.push(Notice::Signal(Some(t)));
                    write_trigger(conn, &trigger, TriggerState::Waiting).await?;
                }
                None => {
                    notices.push(Notice::Finalized(trigger.clone()));
                    write_trigger(conn, &trigger, TriggerState::Complete).await?;
                }
            }
        }
        if handled > 0 {
            debug!(count = handled, "handled misfired triggers");
        }
        Ok(handled)
    }

    async fn acquire_op(
        &self,
        no_later_than: DateTime<Utc>,
        max_count: usize,
        time_window: Duration,
        notices: &mut Vec<Notice>,
    ) -> Result<Vec<AcquiredTrigger>, StorageError> {
        let mut tx = self.begin().await?;
        self.recover_misfires_op(&mut tx, notices).await?;

        let now = self.now();
        let cutoff = self.settings.misfire_handler().misfire_cutoff(now);
        // Over-fetch so skipped non-concurrent siblings do not starve the batch.
        let fetch_limit = (max_count as i64).saturating_mul(2).max(10);
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT definition FROM triggers
            WHERE state = 'WAITING' AND next_fire_time <= ?
              AND (next_fire_time >= ? OR misfire_instruction = ?)
            ORDER BY next_fire_time ASC, priority DESC, trigger_group ASC, trigger_name ASC
            LIMIT ?
            "#,
        )
        .bind(no_later_than.timestamp_millis())
        .bind(cutoff.timestamp_millis())
        .bind(MisfireInstruction::IgnoreMisfires.as_str())
        .bind(fetch_limit)
        .fetch_all(&mut *tx)
        .await
        .map_err(db)?;

        let mut acquired = Vec::new();
        let mut acquired_jobs: HashSet<JobKey> = HashSet::new();
        let mut batch_end = no_later_than;
        for (definition,) in rows {
            if acquired.len() >= max_count {
                break;
            }
            let trigger: Trigger = serde_json::from_str(&definition)?;
            let Some(fire_time) = trigger.next_fire_time() else {
                continue;
            };
            if fire_time > batch_end {
                break;
            }
            let Some(job) = fetch_job(&mut tx, trigger.job_key()).await? else {
                continue;
            };
            if job.is_concurrent_execution_disallowed() {
                if acquired_jobs.contains(job.key()) {
                    continue;
                }
                acquired_jobs.insert(job.key().clone());
            }
            if !set_state_if(&mut tx, trigger.key(), TriggerState::Waiting, TriggerState::Acquired).await? {
                continue;
            }

            let record = FiredTriggerRecord {
                fire_instance_id: FireInstanceId::new(),
                trigger_key: trigger.key().clone(),
                job_key: job.key().clone(),
                instance_id: self.settings.instance_id.clone(),
                fired_time: now,
                scheduled_time: fire_time,
                priority: trigger.priority(),
                state: FiredState::Acquired,
                concurrent_execution_disallowed: job.is_concurrent_execution_disallowed(),
                requests_recovery: job.requests_recovery(),
            };
            insert_fired(&mut tx, &record).await?;

            if acquired.is_empty() {
                batch_end = fire_time.max(now) + time_window;
            }
            acquired.push(AcquiredTrigger {
                fire_instance_id: record.fire_instance_id,
                trigger,
            });
        }

        tx.commit().await.map_err(db)?;
        Ok(acquired)
    }

    async fn trigger_fired_op(
        &self,
        acquired: &AcquiredTrigger,
        notices: &mut Vec<Notice>,
    ) -> Result<TriggerFiredResult, StorageError> {
        let now = self.now();
        let key = acquired.key();
        let mut tx = self.begin().await?;

        let result = 'fire: {
            let Some((mut trigger, state)) = fetch_trigger(&mut tx, key).await? else {
                delete_fired(&mut tx, acquired.fire_instance_id).await?;
                break 'fire TriggerFiredResult::Gone;
            };
            if state != TriggerState::Acquired {
                delete_fired(&mut tx, acquired.fire_instance_id).await?;
                break 'fire TriggerFiredResult::Gone;
            }

            let calendar = match trigger.calendar_name() {
                Some(name) => match self.calendar(name)? {
                    Some(cal) => Some(cal),
                    None => {
                        notices.push(Notice::Error(format!(
                            "trigger {} references unknown calendar {}",
                            key, name
                        )));
                        delete_fired(&mut tx, acquired.fire_instance_id).await?;
                        set_state(&mut tx, key, TriggerState::Error).await?;
                        break 'fire TriggerFiredResult::Gone;
                    }
                },
                None => None,
            };

            let Some(job) = fetch_job(&mut tx, trigger.job_key()).await? else {
                delete_fired(&mut tx, acquired.fire_instance_id).await?;
                break 'fire TriggerFiredResult::Gone;
            };
            let nonconcurrent = job.is_concurrent_execution_disallowed();
            if nonconcurrent && job_blocked(&mut tx, job.key()).await? {
                delete_fired(&mut tx, acquired.fire_instance_id).await?;
                set_state(&mut tx, key, TriggerState::Blocked).await?;
                break 'fire TriggerFiredResult::Blocked;
            }

            let scheduled = trigger.next_fire_time();
            trigger.triggered(calendar.as_deref());
            let new_state = if trigger.next_fire_time().is_some() {
                TriggerState::Waiting
            } else {
                TriggerState::Executing
            };
            write_trigger(&mut tx, &trigger, new_state).await?;

            sqlx::query("UPDATE fired_triggers SET state = ?, fired_time = ? WHERE entry_id = ?")
                .bind(FiredState::Executing.as_str())
                .bind(now.timestamp_millis())
                .bind(acquired.fire_instance_id.to_string())
                .execute(&mut *tx)
                .await
                .map_err(db)?;

            if nonconcurrent {
                set_job_trigger_states(&mut tx, job.key(), TriggerState::Waiting, TriggerState::Blocked).await?;
                set_job_trigger_states(&mut tx, job.key(), TriggerState::Acquired, TriggerState::Blocked).await?;
                set_job_trigger_states(&mut tx, job.key(), TriggerState::Paused, TriggerState::PausedBlocked)
                    .await?;
            }

            TriggerFiredResult::Fired(Box::new(TriggerFiredBundle {
                fire_instance_id: acquired.fire_instance_id,
                recovering: key.group() == RECOVERY_GROUP,
                trigger,
                job_detail: job,
                fire_time: now,
                scheduled_fire_time: scheduled,
            }))
        };

        tx.commit().await.map_err(db)?;
        Ok(result)
    }

    async fn trigger_completed_op(
        &self,
        trigger: &Trigger,
        fire_instance_id: FireInstanceId,
        job: &JobDetail,
        instruction: CompletedExecutionInstruction,
        notices: &mut Vec<Notice>,
    ) -> Result<(), StorageError> {
        let mut tx = self.begin().await?;
        delete_fired(&mut tx, fire_instance_id).await?;

        let mut nonconcurrent = job.is_concurrent_execution_disallowed();
        if let Some(mut stored) = fetch_job(&mut tx, job.key()).await? {
            nonconcurrent = stored.is_concurrent_execution_disallowed();
            if stored.is_persist_data_after_execution() {
                *stored.data_mut() = job.data().clone();
                write_job(&mut tx, &stored).await?;
            }
        }

        if nonconcurrent {
            set_job_trigger_states(&mut tx, job.key(), TriggerState::Blocked, TriggerState::Waiting).await?;
            set_job_trigger_states(&mut tx, job.key(), TriggerState::PausedBlocked, TriggerState::Paused)
                .await?;
            notices.push(Notice::Signal(None));
        }

        let key = trigger.key();
        match instruction {
            CompletedExecutionInstruction::Noop | CompletedExecutionInstruction::ReExecuteJob => {
                if set_state_if(&mut tx, key, TriggerState::Executing, TriggerState::Complete).await? {
                    notices.push(Notice::Finalized(trigger.clone()));
                }
            }
            CompletedExecutionInstruction::SetTriggerComplete => {
                if set_state(&mut tx, key, TriggerState::Complete).await? {
                    notices.push(Notice::Finalized(trigger.clone()));
                }
                notices.push(Notice::Signal(None));
            }
            CompletedExecutionInstruction::DeleteTrigger => {
                self.remove_trigger_op(&mut tx, key, true, notices).await?;
                notices.push(Notice::Signal(None));
            }
            CompletedExecutionInstruction::SetTriggerError => {
                set_state(&mut tx, key, TriggerState::Error).await?;
                notices.push(Notice::Signal(None));
            }
            CompletedExecutionInstruction::SetAllJobTriggersComplete => {
                for sibling in trigger_keys_for_job(&mut tx, job.key()).await? {
                    set_state(&mut tx, &sibling, TriggerState::Complete).await?;
                }
                notices.push(Notice::Signal(None));
            }
            CompletedExecutionInstruction::SetAllJobTriggersError => {
                for sibling in trigger_keys_for_job(&mut tx, job.key()).await? {
                    set_state(&mut tx, &sibling, TriggerState::Error).await?;
                }
                notices.push(Notice::Signal(None));
            }
        }

        tx.commit().await.map_err(db)?;
        Ok(())
    }

    // Recovery

    /// Undo the in-flight work of one instance. Returns the number of
    /// firings re-queued for recovery.
    async fn recover_instance_op(
        &self,
        conn: &mut SqliteConnection,
        instance_id: &InstanceId,
    ) -> Result<usize, StorageError> {
        let rows: Vec<FiredRow> = sqlx::query_as(&format!(
            "SELECT {} FROM fired_triggers WHERE instance_id = ?",
            FIRED_COLUMNS
        ))
        .bind(instance_id.as_str())
        .fetch_all(&mut *conn)
        .await
        .map_err(db)?;

        let mut requeued = 0;
        for row in rows {
            let record = fired_record(row)?;
            match record.state {
                FiredState::Acquired => {
                    set_state_if(conn, &record.trigger_key, TriggerState::Acquired, TriggerState::Waiting)
                        .await?;
                }
                FiredState::Executing => {
                    let original = fetch_trigger(conn, &record.trigger_key).await?;
                    if record.requests_recovery && fetch_job(conn, &record.job_key).await?.is_some() {
                        let recovery = recovery_trigger(&record, original.as_ref().map(|(t, _)| t))?;
                        let paused = group_paused(conn, RECOVERY_GROUP).await?;
                        write_trigger(conn, &recovery, TriggerState::on_store(paused, false)).await?;
                        requeued += 1;
                    }
                    if original.is_some_and(|(_, state)| state == TriggerState::Executing) {
                        set_state(conn, &record.trigger_key, TriggerState::Complete).await?;
                    }
                }
            }
            if record.concurrent_execution_disallowed {
                set_job_trigger_states(conn, &record.job_key, TriggerState::Blocked, TriggerState::Waiting)
                    .await?;
                set_job_trigger_states(conn, &record.job_key, TriggerState::PausedBlocked, TriggerState::Paused)
                    .await?;
            }
            delete_fired(conn, record.fire_instance_id).await?;
        }

        if *instance_id != self.settings.instance_id {
            sqlx::query("DELETE FROM scheduler_state WHERE instance_id = ?")
                .bind(instance_id.as_str())
                .execute(&mut *conn)
                .await
                .map_err(db)?;
        }
        Ok(requeued)
    }

    /// Start-up recovery of a non-clustered store: nothing can be in flight.
    async fn recover_all_op(&self) -> Result<(), StorageError> {
        let mut tx = self.begin().await?;
        let instances: Vec<(String,)> = sqlx::query_as("SELECT DISTINCT instance_id FROM fired_triggers")
            .fetch_all(&mut *tx)
            .await
            .map_err(db)?;
        let mut requeued = 0;
        for (instance,) in instances {
            requeued += self.recover_instance_op(&mut tx, &InstanceId::new(instance)).await?;
        }
        for (from, to) in [
            (TriggerState::Acquired, TriggerState::Waiting),
            (TriggerState::Blocked, TriggerState::Waiting),
            (TriggerState::PausedBlocked, TriggerState::Paused),
            (TriggerState::Executing, TriggerState::Complete),
        ] {
            sqlx::query("UPDATE triggers SET state = ? WHERE state = ?")
                .bind(to.as_str())
                .bind(from.as_str())
                .execute(&mut *tx)
                .await
                .map_err(db)?;
        }
        tx.commit().await.map_err(db)?;
        info!(recovered = requeued, "recovered job store state at start");
        Ok(())
    }

    async fn find_failed_instances(&self, first: bool) -> Result<Vec<InstanceId>, StorageError> {
        let now = self.now();
        let grace = Duration::milliseconds(self.cluster.checkin_grace.as_millis() as i64);
        let me = &self.settings.instance_id;

        let states = self.scheduler_states().await?;
        let mut failed: BTreeSet<InstanceId> = BTreeSet::new();
        for state in &states {
            if state.instance_id == *me {
                if first {
                    failed.insert(state.instance_id.clone());
                }
            } else if state.has_failed(now, grace) {
                failed.insert(state.instance_id.clone());
            }
        }

        // Fired records whose owner has no heartbeat row at all.
        let known: HashSet<&InstanceId> = states.iter().map(|s| &s.instance_id).collect();
        let owners: Vec<(String,)> = sqlx::query_as("SELECT DISTINCT instance_id FROM fired_triggers")
            .fetch_all(&self.pool)
            .await
            .map_err(db)?;
        for (owner,) in owners {
            let owner = InstanceId::new(owner);
            if !known.contains(&owner) && (owner != *me || first) {
                failed.insert(owner);
            }
        }
        Ok(failed.into_iter().collect())
    }

    async fn checkin_op(&self, first: bool) -> Result<(), StorageError> {
        let failed = self.find_failed_instances(first).await?;

        sqlx::query(
            r#"
            INSERT INTO scheduler_state (instance_id, last_checkin_time, checkin_interval)
            VALUES (?, ?, ?)
            ON CONFLICT(instance_id) DO UPDATE SET
                last_checkin_time = excluded.last_checkin_time,
                checkin_interval = excluded.checkin_interval
            "#,
        )
        .bind(self.settings.instance_id.as_str())
        .bind(self.now().timestamp_millis())
        .bind(self.cluster.checkin_interval.as_millis() as i64)
        .execute(&self.pool)
        .await
        .map_err(db)?;

        if failed.is_empty() {
            return Ok(());
        }

        self.locked(LockName::TriggerAccess, async {
            let mut tx = self.begin().await?;
            for instance in &failed {
                if *instance != self.settings.instance_id {
                    warn!(instance = %instance, "scheduler instance stopped checking in; recovering its jobs");
                }
                let requeued = self.recover_instance_op(&mut tx, instance).await?;
                info!(instance = %instance, recovered = requeued, "finished instance recovery");
            }
            tx.commit().await.map_err(db)
        })
        .await?;

        self.deliver(vec![Notice::Signal(None)]);
        Ok(())
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn initialize(&self, signaler: Arc<dyn SchedulerSignaler>) -> Result<(), StorageError> {
        let mut slot = self.signaler.write().map_err(|_| StorageError::LockPoisoned)?;
        *slot = signaler;
        Ok(())
    }

    async fn scheduler_started(&self) -> Result<(), StorageError> {
        if self.cluster.clustered {
            self.checkin().await
        } else {
            self.locked(LockName::TriggerAccess, self.recover_all_op()).await?;
            self.deliver(vec![Notice::Signal(None)]);
            Ok(())
        }
    }

    async fn shutdown(&self) -> Result<(), StorageError> {
        Ok(())
    }

    fn supports_persistence(&self) -> bool {
        true
    }

    fn is_clustered(&self) -> bool {
        self.cluster.clustered
    }

    fn instance_id(&self) -> InstanceId {
        self.settings.instance_id.clone()
    }

    fn clock(&self) -> SharedClock {
        self.settings.clock.clone()
    }

    fn checkin_interval(&self) -> std::time::Duration {
        self.cluster.checkin_interval
    }

    fn checkin_grace(&self) -> std::time::Duration {
        self.cluster.checkin_grace
    }

    async fn checkin(&self) -> Result<(), StorageError> {
        if !self.cluster.clustered {
            return Ok(());
        }
        let first = self.first_checkin.load(Ordering::SeqCst);
        self.locked(LockName::StateAccess, self.checkin_op(first)).await?;
        self.first_checkin.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn store_job_and_trigger(&self, job: JobDetail, trigger: Trigger) -> Result<(), StorageError> {
        self.locked(LockName::TriggerAccess, async {
            let mut tx = self.begin().await?;
            insert_job(&mut tx, &job, false).await?;
            self.store_trigger_op(&mut tx, &trigger, false).await?;
            tx.commit().await.map_err(db)
        })
        .await
    }

    async fn store_job_and_triggers(
        &self,
        job: JobDetail,
        triggers: Vec<Trigger>,
        replace: bool,
    ) -> Result<(), StorageError> {
        check_trigger_set(&job, &triggers)?;
        self.locked(LockName::TriggerAccess, async {
            let mut tx = self.begin().await?;
            insert_job(&mut tx, &job, replace).await?;
            for trigger in &triggers {
                self.store_trigger_op(&mut tx, trigger, replace).await?;
            }
            tx.commit().await.map_err(db)
        })
        .await
    }

    async fn store_job(&self, job: JobDetail, replace: bool) -> Result<(), StorageError> {
        self.locked(LockName::TriggerAccess, async {
            let mut tx = self.begin().await?;
            insert_job(&mut tx, &job, replace).await?;
            tx.commit().await.map_err(db)
        })
        .await
    }

    async fn store_trigger(&self, trigger: Trigger, replace: bool) -> Result<(), StorageError> {
        self.locked(LockName::TriggerAccess, async {
            let mut tx = self.begin().await?;
            self.store_trigger_op(&mut tx, &trigger, replace).await?;
            tx.commit().await.map_err(db)
        })
        .await
    }

    async fn remove_job(&self, key: &JobKey) -> Result<bool, StorageError> {
        self.locked(LockName::TriggerAccess, async {
            let mut tx = self.begin().await?;
            for trigger_key in trigger_keys_for_job(&mut tx, key).await? {
                delete_trigger(&mut tx, &trigger_key).await?;
            }
            let existed = delete_job(&mut tx, key).await?;
            tx.commit().await.map_err(db)?;
            Ok(existed)
        })
        .await
    }

    async fn remove_trigger(&self, key: &TriggerKey) -> Result<bool, StorageError> {
        let mut notices = Vec::new();
        let removed = self
            .locked(LockName::TriggerAccess, async {
                let mut tx = self.begin().await?;
                let removed = self.remove_trigger_op(&mut tx, key, true, &mut notices).await?;
                tx.commit().await.map_err(db)?;
                Ok(removed)
            })
            .await?;
        self.deliver(notices);
        Ok(removed)
    }

    async fn replace_trigger(&self, key: &TriggerKey, trigger: Trigger) -> Result<bool, StorageError> {
        let mut notices = Vec::new();
        let replaced = self
            .locked(LockName::TriggerAccess, async {
                let mut tx = self.begin().await?;
                let Some((old, _)) = fetch_trigger(&mut tx, key).await? else {
                    return Ok(false);
                };
                if old.job_key() != trigger.job_key() {
                    return Err(StorageError::Invalid(format!(
                        "new trigger is for job {}, old trigger {} is for job {}",
                        trigger.job_key(),
                        key,
                        old.job_key()
                    )));
                }
                self.remove_trigger_op(&mut tx, key, false, &mut notices).await?;
                self.store_trigger_op(&mut tx, &trigger, false).await?;
                tx.commit().await.map_err(db)?;
                Ok(true)
            })
            .await?;
        self.deliver(notices);
        Ok(replaced)
    }

    async fn retrieve_job(&self, key: &JobKey) -> Result<Option<JobDetail>, StorageError> {
        let mut conn = self.pool.acquire().await.map_err(db)?;
        fetch_job(&mut conn, key).await
    }

    async fn retrieve_trigger(&self, key: &TriggerKey) -> Result<Option<Trigger>, StorageError> {
        let mut conn = self.pool.acquire().await.map_err(db)?;
        Ok(fetch_trigger(&mut conn, key).await?.map(|(t, _)| t))
    }

    async fn get_triggers_for_job(&self, key: &JobKey) -> Result<Vec<Trigger>, StorageError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT definition FROM triggers WHERE job_group = ? AND job_name = ? ORDER BY trigger_group, trigger_name",
        )
        .bind(key.group())
        .bind(key.name())
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;
        rows.into_iter()
            .map(|(d,)| serde_json::from_str(&d).map_err(StorageError::from))
            .collect()
    }

    async fn job_keys(&self) -> Result<Vec<JobKey>, StorageError> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT job_group, job_name FROM jobs ORDER BY job_group, job_name")
                .fetch_all(&self.pool)
                .await
                .map_err(db)?;
        Ok(rows.into_iter().map(|(g, n)| JobKey::new(n, g)).collect())
    }

    async fn trigger_keys(&self) -> Result<Vec<TriggerKey>, StorageError> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT trigger_group, trigger_name FROM triggers ORDER BY trigger_group, trigger_name",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;
        Ok(rows.into_iter().map(|(g, n)| TriggerKey::new(n, g)).collect())
    }

    async fn clear_all(&self) -> Result<(), StorageError> {
        self.locked(LockName::TriggerAccess, async {
            let mut tx = self.begin().await?;
            for table in [
                "fired_triggers",
                "triggers",
                "jobs",
                "calendars",
                "paused_trigger_groups",
            ] {
                sqlx::query(&format!("DELETE FROM {}", table))
                    .execute(&mut *tx)
                    .await
                    .map_err(db)?;
            }
            tx.commit().await.map_err(db)?;
            self.calendars
                .write()
                .map_err(|_| StorageError::LockPoisoned)?
                .clear();
            Ok(())
        })
        .await
    }

    async fn store_calendar(
        &self,
        name: &str,
        calendar: SharedCalendar,
        replace: bool,
        update_triggers: bool,
    ) -> Result<(), StorageError> {
        let mut notices = Vec::new();
        self.locked(LockName::TriggerAccess, async {
            let mut tx = self.begin().await?;
            let exists: Option<(String,)> =
                sqlx::query_as("SELECT calendar_name FROM calendars WHERE calendar_name = ?")
                    .bind(name)
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(db)?;
            if exists.is_some() && !replace {
                return Err(StorageError::DuplicateKey(format!("calendar: {}", name)));
            }
            sqlx::query(
                r#"
                INSERT INTO calendars (calendar_name, description) VALUES (?, ?)
                ON CONFLICT(calendar_name) DO UPDATE SET description = excluded.description
                "#,
            )
            .bind(name)
            .bind(calendar.description())
            .execute(&mut *tx)
            .await
            .map_err(db)?;

            if update_triggers {
                let now = self.now();
                let rows: Vec<(String, String)> =
                    sqlx::query_as("SELECT definition, state FROM triggers WHERE calendar_name = ?")
                        .bind(name)
                        .fetch_all(&mut *tx)
                        .await
                        .map_err(db)?;
                for (definition, state) in rows {
                    let mut trigger: Trigger = serde_json::from_str(&definition)?;
                    trigger.update_with_new_calendar(
                        Some(calendar.as_ref()),
                        now,
                        self.settings.misfire_threshold,
                    );
                    if let Some(t) = trigger.next_fire_time() {
                        notices.push(Notice::Signal(Some(t)));
                    }
                    write_trigger(&mut tx, &trigger, parse_state(&state)?).await?;
                }
            }
            tx.commit().await.map_err(db)?;
            self.calendars
                .write()
                .map_err(|_| StorageError::LockPoisoned)?
                .insert(name.to_string(), calendar.clone());
            Ok(())
        })
        .await?;
        self.deliver(notices);
        Ok(())
    }

    async fn remove_calendar(&self, name: &str) -> Result<bool, StorageError> {
        self.locked(LockName::TriggerAccess, async {
            let mut tx = self.begin().await?;
            let (users,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM triggers WHERE calendar_name = ?")
                .bind(name)
                .fetch_one(&mut *tx)
                .await
                .map_err(db)?;
            if users > 0 {
                return Err(StorageError::InUse(format!(
                    "calendar {} is referenced by a trigger",
                    name
                )));
            }
            let result = sqlx::query("DELETE FROM calendars WHERE calendar_name = ?")
                .bind(name)
                .execute(&mut *tx)
                .await
                .map_err(db)?;
            tx.commit().await.map_err(db)?;
            let registered = self
                .calendars
                .write()
                .map_err(|_| StorageError::LockPoisoned)?
                .remove(name)
                .is_some();
            Ok(result.rows_affected() > 0 || registered)
        })
        .await
    }

    async fn retrieve_calendar(&self, name: &str) -> Result<Option<SharedCalendar>, StorageError> {
        self.calendar(name)
    }

    async fn calendar_names(&self) -> Result<Vec<String>, StorageError> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT calendar_name FROM calendars ORDER BY calendar_name")
            .fetch_all(&self.pool)
            .await
            .map_err(db)?;
        Ok(rows.into_iter().map(|(n,)| n).collect())
    }

    async fn get_trigger_state(&self, key: &TriggerKey) -> Result<Option<TriggerState>, StorageError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT state FROM triggers WHERE trigger_group = ? AND trigger_name = ?")
                .bind(key.group())
                .bind(key.name())
                .fetch_optional(&self.pool)
                .await
                .map_err(db)?;
        row.map(|(s,)| parse_state(&s)).transpose()
    }

    async fn pause_trigger(&self, key: &TriggerKey) -> Result<(), StorageError> {
        self.locked(LockName::TriggerAccess, async {
            let mut conn = self.pool.acquire().await.map_err(db)?;
            pause_trigger(&mut conn, key).await
        })
        .await
    }

    async fn resume_trigger(&self, key: &TriggerKey) -> Result<(), StorageError> {
        let mut notices = Vec::new();
        self.locked(LockName::TriggerAccess, async {
            let mut tx = self.begin().await?;
            self.resume_trigger_op(&mut tx, key, &mut notices).await?;
            tx.commit().await.map_err(db)
        })
        .await?;
        self.deliver(notices);
        Ok(())
    }

    async fn pause_job(&self, key: &JobKey) -> Result<(), StorageError> {
        self.locked(LockName::TriggerAccess, async {
            let mut tx = self.begin().await?;
            for trigger_key in trigger_keys_for_job(&mut tx, key).await? {
                pause_trigger(&mut tx, &trigger_key).await?;
            }
            tx.commit().await.map_err(db)
        })
        .await
    }

    async fn resume_job(&self, key: &JobKey) -> Result<(), StorageError> {
        let mut notices = Vec::new();
        self.locked(LockName::TriggerAccess, async {
            let mut tx = self.begin().await?;
            for trigger_key in trigger_keys_for_job(&mut tx, key).await? {
                self.resume_trigger_op(&mut tx, &trigger_key, &mut notices).await?;
            }
            tx.commit().await.map_err(db)
        })
        .await?;
        self.deliver(notices);
        Ok(())
    }

    async fn pause_trigger_group(&self, group: &str) -> Result<(), StorageError> {
        self.locked(LockName::TriggerAccess, async {
            let mut tx = self.begin().await?;
            self.pause_group_op(&mut tx, group).await?;
            tx.commit().await.map_err(db)
        })
        .await
    }

    async fn resume_trigger_group(&self, group: &str) -> Result<(), StorageError> {
        let mut notices = Vec::new();
        self.locked(LockName::TriggerAccess, async {
            let mut tx = self.begin().await?;
            self.resume_group_op(&mut tx, group, &mut notices).await?;
            tx.commit().await.map_err(db)
        })
        .await?;
        self.deliver(notices);
        Ok(())
    }

    async fn pause_all(&self) -> Result<(), StorageError> {
        self.locked(LockName::TriggerAccess, async {
            let mut tx = self.begin().await?;
            for group in trigger_groups(&mut tx).await? {
                self.pause_group_op(&mut tx, &group).await?;
            }
            self.pause_group_op(&mut tx, ALL_GROUPS_PAUSED).await?;
            tx.commit().await.map_err(db)
        })
        .await
    }

    async fn resume_all(&self) -> Result<(), StorageError> {
        let mut notices = Vec::new();
        self.locked(LockName::TriggerAccess, async {
            let mut tx = self.begin().await?;
            let mut groups = trigger_groups(&mut tx).await?;
            let paused: Vec<(String,)> = sqlx::query_as("SELECT trigger_group FROM paused_trigger_groups")
                .fetch_all(&mut *tx)
                .await
                .map_err(db)?;
            groups.extend(paused.into_iter().map(|(g,)| g));
            for group in groups {
                self.resume_group_op(&mut tx, &group, &mut notices).await?;
            }
            tx.commit().await.map_err(db)
        })
        .await?;
        self.deliver(notices);
        Ok(())
    }

    async fn paused_trigger_groups(&self) -> Result<Vec<String>, StorageError> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT trigger_group FROM paused_trigger_groups ORDER BY trigger_group")
                .fetch_all(&self.pool)
                .await
                .map_err(db)?;
        Ok(rows
            .into_iter()
            .map(|(g,)| g)
            .filter(|g| g != ALL_GROUPS_PAUSED)
            .collect())
    }

    async fn reset_trigger_from_error_state(&self, key: &TriggerKey) -> Result<(), StorageError> {
        let mut notices = Vec::new();
        self.locked(LockName::TriggerAccess, async {
            let mut tx = self.begin().await?;
            let Some((trigger, state)) = fetch_trigger(&mut tx, key).await? else {
                return Ok(());
            };
            if state != TriggerState::Error {
                return Ok(());
            }
            let paused = group_paused(&mut tx, key.group()).await?;
            let blocked = job_blocked(&mut tx, trigger.job_key()).await?;
            set_state(&mut tx, key, TriggerState::on_store(paused, blocked)).await?;
            if let Some(t) = trigger.next_fire_time() {
                notices.push(Notice::Signal(Some(t)));
            }
            tx.commit().await.map_err(db)
        })
        .await?;
        self.deliver(notices);
        Ok(())
    }

    async fn acquire_next_triggers(
        &self,
        no_later_than: DateTime<Utc>,
        max_count: usize,
        time_window: Duration,
    ) -> Result<Vec<AcquiredTrigger>, StorageError> {
        let mut notices = Vec::new();
        let acquired = self
            .locked(
                LockName::TriggerAccess,
                self.acquire_op(no_later_than, max_count, time_window, &mut notices),
            )
            .await?;
        self.deliver(notices);
        Ok(acquired)
    }

    async fn release_acquired_trigger(&self, acquired: &AcquiredTrigger) -> Result<(), StorageError> {
        self.locked(LockName::TriggerAccess, async {
            let mut tx = self.begin().await?;
            set_state_if(&mut tx, acquired.key(), TriggerState::Acquired, TriggerState::Waiting).await?;
            delete_fired(&mut tx, acquired.fire_instance_id).await?;
            tx.commit().await.map_err(db)
        })
        .await
    }

    async fn trigger_fired(&self, acquired: &AcquiredTrigger) -> Result<TriggerFiredResult, StorageError> {
        let mut notices = Vec::new();
        let result = self
            .locked(LockName::TriggerAccess, self.trigger_fired_op(acquired, &mut notices))
            .await?;
        self.deliver(notices);
        Ok(result)
    }

    async fn trigger_completed(
        &self,
        trigger: &Trigger,
        fire_instance_id: FireInstanceId,
        job: &JobDetail,
        instruction: CompletedExecutionInstruction,
    ) -> Result<(), StorageError> {
        let mut notices = Vec::new();
        self.locked(
            LockName::TriggerAccess,
            self.trigger_completed_op(trigger, fire_instance_id, job, instruction, &mut notices),
        )
        .await?;
        self.deliver(notices);
        Ok(())
    }
}

// Row helpers

fn db(e: sqlx::Error) -> StorageError {
    StorageError::Database(e.to_string())
}

fn parse_state(s: &str) -> Result<TriggerState, StorageError> {
    TriggerState::parse(s)
        .ok_or_else(|| StorageError::SerializationError(format!("unknown trigger state: {}", s)))
}

fn state_record((instance_id, last_checkin, interval): (String, i64, i64)) -> SchedulerStateRecord {
    SchedulerStateRecord {
        instance_id: InstanceId::new(instance_id),
        last_checkin: from_millis(last_checkin),
        checkin_interval: Duration::milliseconds(interval),
    }
}

fn fired_record(row: FiredRow) -> Result<FiredTriggerRecord, StorageError> {
    let (
        entry_id,
        trigger_group,
        trigger_name,
        job_group,
        job_name,
        instance_id,
        fired_time,
        sched_time,
        priority,
        state,
        nonconcurrent,
        requests_recovery,
    ) = row;
    Ok(FiredTriggerRecord {
        fire_instance_id: FireInstanceId::from_str(&entry_id)
            .map_err(|e| StorageError::SerializationError(e.to_string()))?,
        trigger_key: TriggerKey::new(trigger_name, trigger_group),
        job_key: JobKey::new(job_name, job_group),
        instance_id: InstanceId::new(instance_id),
        fired_time: from_millis(fired_time),
        scheduled_time: from_millis(sched_time),
        priority,
        state: FiredState::parse(&state)
            .ok_or_else(|| StorageError::SerializationError(format!("unknown fired state: {}", state)))?,
        concurrent_execution_disallowed: nonconcurrent,
        requests_recovery,
    })
}

fn recovery_trigger(record: &FiredTriggerRecord, original: Option<&Trigger>) -> Result<Trigger, StorageError> {
    let mut data = original.map(|t| t.data().clone()).unwrap_or_default();
    data.insert(RECOVERING_TRIGGER_NAME.to_string(), json!(record.trigger_key.name()));
    data.insert(RECOVERING_TRIGGER_GROUP.to_string(), json!(record.trigger_key.group()));
    data.insert(RECOVERING_FIRE_TIME.to_string(), json!(record.fired_time.timestamp_millis()));
    data.insert(
        RECOVERING_SCHEDULED_FIRE_TIME.to_string(),
        json!(record.scheduled_time.timestamp_millis()),
    );

    let key = TriggerKey::new(
        format!("recover_{}_{}", record.instance_id, record.fire_instance_id),
        RECOVERY_GROUP,
    );
    let mut trigger = Trigger::builder(key, record.job_key.clone())
        .with_priority(record.priority)
        .starting_at(record.scheduled_time)
        .with_misfire_instruction(MisfireInstruction::IgnoreMisfires)
        .with_data_map(data)
        .build()
        .map_err(|e| StorageError::Invalid(e.to_string()))?;
    trigger.compute_first_fire_time(None);
    Ok(trigger)
}

async fn fetch_trigger(
    conn: &mut SqliteConnection,
    key: &TriggerKey,
) -> Result<Option<(Trigger, TriggerState)>, StorageError> {
    let row: Option<(String, String)> = sqlx::query_as(
        "SELECT definition, state FROM triggers WHERE trigger_group = ? AND trigger_name = ?",
    )
    .bind(key.group())
    .bind(key.name())
    .fetch_optional(&mut *conn)
    .await
    .map_err(db)?;
    row.map(|(definition, state)| Ok((serde_json::from_str(&definition)?, parse_state(&state)?)))
        .transpose()
}

async fn write_trigger(
    conn: &mut SqliteConnection,
    trigger: &Trigger,
    state: TriggerState,
) -> Result<(), StorageError> {
    let definition = serde_json::to_string(trigger)?;
    sqlx::query(
        r#"
        INSERT INTO triggers (trigger_group, trigger_name, job_group, job_name, state,
                              next_fire_time, prev_fire_time, priority, misfire_instruction,
                              calendar_name, definition)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(trigger_group, trigger_name) DO UPDATE SET
            job_group = excluded.job_group,
            job_name = excluded.job_name,
            state = excluded.state,
            next_fire_time = excluded.next_fire_time,
            prev_fire_time = excluded.prev_fire_time,
            priority = excluded.priority,
            misfire_instruction = excluded.misfire_instruction,
            calendar_name = excluded.calendar_name,
            definition = excluded.definition
        "#,
    )
    .bind(trigger.key().group())
    .bind(trigger.key().name())
    .bind(trigger.job_key().group())
    .bind(trigger.job_key().name())
    .bind(state.as_str())
    .bind(trigger.next_fire_time().map(|t| t.timestamp_millis()))
    .bind(trigger.previous_fire_time().map(|t| t.timestamp_millis()))
    .bind(trigger.priority())
    .bind(trigger.misfire_instruction().as_str())
    .bind(trigger.calendar_name())
    .bind(definition)
    .execute(&mut *conn)
    .await
    .map_err(db)?;
    Ok(())
}

async fn delete_trigger(conn: &mut SqliteConnection, key: &TriggerKey) -> Result<bool, StorageError> {
    let result = sqlx::query("DELETE FROM triggers WHERE trigger_group = ? AND trigger_name = ?")
        .bind(key.group())
        .bind(key.name())
        .execute(&mut *conn)
        .await
        .map_err(db)?;
    Ok(result.rows_affected() > 0)
}

async fn set_state(
    conn: &mut SqliteConnection,
    key: &TriggerKey,
    state: TriggerState,
) -> Result<bool, StorageError> {
    let result = sqlx::query("UPDATE triggers SET state = ? WHERE trigger_group = ? AND trigger_name = ?")
        .bind(state.as_str())
        .bind(key.group())
        .bind(key.name())
        .execute(&mut *conn)
        .await
        .map_err(db)?;
    Ok(result.rows_affected() > 0)
}

async fn set_state_if(
    conn: &mut SqliteConnection,
    key: &TriggerKey,
    from: TriggerState,
    to: TriggerState,
) -> Result<bool, StorageError> {
    let result = sqlx::query(
        "UPDATE triggers SET state = ? WHERE trigger_group = ? AND trigger_name = ? AND state = ?",
    )
    .bind(to.as_str())
    .bind(key.group())
    .bind(key.name())
    .bind(from.as_str())
    .execute(&mut *conn)
    .await
    .map_err(db)?;
    Ok(result.rows_affected() > 0)
}

async fn set_job_trigger_states(
    conn: &mut SqliteConnection,
    job_key: &JobKey,
    from: TriggerState,
    to: TriggerState,
) -> Result<(), StorageError> {
    sqlx::query("UPDATE triggers SET state = ? WHERE job_group = ? AND job_name = ? AND state = ?")
        .bind(to.as_str())
        .bind(job_key.group())
        .bind(job_key.name())
        .bind(from.as_str())
        .execute(&mut *conn)
        .await
        .map_err(db)?;
    Ok(())
}

async fn pause_trigger(conn: &mut SqliteConnection, key: &TriggerKey) -> Result<(), StorageError> {
    sqlx::query(
        r#"
        UPDATE triggers
        SET state = CASE state WHEN 'BLOCKED' THEN 'PAUSED_BLOCKED' ELSE 'PAUSED' END
        WHERE trigger_group = ? AND trigger_name = ? AND state IN ('WAITING', 'ACQUIRED', 'BLOCKED')
        "#,
    )
    .bind(key.group())
    .bind(key.name())
    .execute(&mut *conn)
    .await
    .map_err(db)?;
    Ok(())
}

async fn trigger_keys_for_job(
    conn: &mut SqliteConnection,
    job_key: &JobKey,
) -> Result<Vec<TriggerKey>, StorageError> {
    let rows: Vec<(String, String)> = sqlx::query_as(
        "SELECT trigger_group, trigger_name FROM triggers WHERE job_group = ? AND job_name = ? \
         ORDER BY trigger_group, trigger_name",
    )
    .bind(job_key.group())
    .bind(job_key.name())
    .fetch_all(&mut *conn)
    .await
    .map_err(db)?;
    Ok(rows.into_iter().map(|(g, n)| TriggerKey::new(n, g)).collect())
}

async fn trigger_keys_in_group(
    conn: &mut SqliteConnection,
    group: &str,
) -> Result<Vec<TriggerKey>, StorageError> {
    let rows: Vec<(String,)> =
        sqlx::query_as("SELECT trigger_name FROM triggers WHERE trigger_group = ? ORDER BY trigger_name")
            .bind(group)
            .fetch_all(&mut *conn)
            .await
            .map_err(db)?;
    Ok(rows.into_iter().map(|(n,)| TriggerKey::new(n, group)).collect())
}

async fn trigger_groups(conn: &mut SqliteConnection) -> Result<Vec<String>, StorageError> {
    let rows: Vec<(String,)> =
        sqlx::query_as("SELECT DISTINCT trigger_group FROM triggers ORDER BY trigger_group")
            .fetch_all(&mut *conn)
            .await
            .map_err(db)?;
    Ok(rows.into_iter().map(|(g,)| g).collect())
}

async fn group_paused(conn: &mut SqliteConnection, group: &str) -> Result<bool, StorageError> {
    let row: Option<(String,)> =
        sqlx::query_as("SELECT trigger_group FROM paused_trigger_groups WHERE trigger_group IN (?, ?)")
            .bind(group)
            .bind(ALL_GROUPS_PAUSED)
            .fetch_optional(&mut *conn)
            .await
            .map_err(db)?;
    Ok(row.is_some())
}

/// Whether a non-concurrent job currently has an executing firing anywhere in the cluster.
async fn job_blocked(conn: &mut SqliteConnection, job_key: &JobKey) -> Result<bool, StorageError> {
    let (count,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM fired_triggers \
         WHERE job_group = ? AND job_name = ? AND state = 'EXECUTING' AND is_nonconcurrent = 1",
    )
    .bind(job_key.group())
    .bind(job_key.name())
    .fetch_one(&mut *conn)
    .await
    .map_err(db)?;
    Ok(count > 0)
}

async fn fetch_job(conn: &mut SqliteConnection, key: &JobKey) -> Result<Option<JobDetail>, StorageError> {
    let row: Option<(String,)> =
        sqlx::query_as("SELECT detail FROM jobs WHERE job_group = ? AND job_name = ?")
            .bind(key.group())
            .bind(key.name())
            .fetch_optional(&mut *conn)
            .await
            .map_err(db)?;
    row.map(|(detail,)| serde_json::from_str(&detail).map_err(StorageError::from))
        .transpose()
}

async fn insert_job(conn: &mut SqliteConnection, job: &JobDetail, replace: bool) -> Result<(), StorageError> {
    if replace {
        return write_job(conn, job).await;
    }
    let result = sqlx::query(
        r#"
        INSERT INTO jobs (job_group, job_name, job_type, is_durable, is_nonconcurrent,
                          requests_recovery, detail)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(job.key().group())
    .bind(job.key().name())
    .bind(job.job_type())
    .bind(job.is_durable())
    .bind(job.is_concurrent_execution_disallowed())
    .bind(job.requests_recovery())
    .bind(serde_json::to_string(job)?)
    .execute(&mut *conn)
    .await;

    match result {
        Ok(_) => Ok(()),
        Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
            Err(StorageError::DuplicateKey(format!("job: {}", job.key())))
        }
        Err(e) => Err(db(e)),
    }
}

async fn write_job(conn: &mut SqliteConnection, job: &JobDetail) -> Result<(), StorageError> {
    sqlx::query(
        r#"
        INSERT INTO jobs (job_group, job_name, job_type, is_durable, is_nonconcurrent,
                          requests_recovery, detail)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(job_group, job_name) DO UPDATE SET
            job_type = excluded.job_type,
            is_durable = excluded.is_durable,
            is_nonconcurrent = excluded.is_nonconcurrent,
            requests_recovery = excluded.requests_recovery,
            detail = excluded.detail
        "#,
    )
    .bind(job.key().group())
    .bind(job.key().name())
    .bind(job.job_type())
    .bind(job.is_durable())
    .bind(job.is_concurrent_execution_disallowed())
    .bind(job.requests_recovery())
    .bind(serde_json::to_string(job)?)
    .execute(&mut *conn)
    .await
    .map_err(db)?;
    Ok(())
}

async fn delete_job(conn: &mut SqliteConnection, key: &JobKey) -> Result<bool, StorageError> {
    let result = sqlx::query("DELETE FROM jobs WHERE job_group = ? AND job_name = ?")
        .bind(key.group())
        .bind(key.name())
        .execute(&mut *conn)
        .await
        .map_err(db)?;
    Ok(result.rows_affected() > 0)
}

async fn insert_fired(conn: &mut SqliteConnection, record: &FiredTriggerRecord) -> Result<(), StorageError> {
    sqlx::query(&format!(
        "INSERT INTO fired_triggers ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        FIRED_COLUMNS
    ))
    .bind(record.fire_instance_id.to_string())
    .bind(record.trigger_key.group())
    .bind(record.trigger_key.name())
    .bind(record.job_key.group())
    .bind(record.job_key.name())
    .bind(record.instance_id.as_str())
    .bind(record.fired_time.timestamp_millis())
    .bind(record.scheduled_time.timestamp_millis())
    .bind(record.priority)
    .bind(record.state.as_str())
    .bind(record.concurrent_execution_disallowed)
    .bind(record.requests_recovery)
    .execute(&mut *conn)
    .await
    .map_err(db)?;
    Ok(())
}

async fn delete_fired(conn: &mut SqliteConnection, id: FireInstanceId) -> Result<(), StorageError> {
    sqlx::query("DELETE FROM fired_triggers WHERE entry_id = ?")
        .bind(id.to_string())
        .execute(&mut *conn)
        .await
        .map_err(db)?;
    Ok(())
}
