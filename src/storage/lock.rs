//! Named locks serializing store operations.
//!
//! Two locks exist. `TRIGGER_ACCESS` guards acquisition, firing, completion
//! and every mutation of trigger state. `STATE_ACCESS` guards the checkin
//! table and failed-instance recovery. A non-clustered store only needs to
//! serialize callers in this process; a clustered store additionally holds
//! a leased row in the `locks` table so other nodes are excluded too.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::StorageError;

/// The two store locks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockName {
    TriggerAccess,
    StateAccess,
}

impl LockName {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockName::TriggerAccess => "TRIGGER_ACCESS",
            LockName::StateAccess => "STATE_ACCESS",
        }
    }
}

impl std::fmt::Display for LockName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Proof that a lock is held. Hand it back to [`LockManager::release`].
///
/// Dropping it releases the in-process part only; a database lease then
/// lapses on its own when it expires.
#[derive(Debug)]
pub struct HeldLock {
    name: LockName,
    _local: OwnedMutexGuard<()>,
}

impl HeldLock {
    pub fn name(&self) -> LockName {
        self.name
    }
}

/// Obtains and releases the named locks.
#[async_trait]
pub trait LockManager: Send + Sync {
    /// Block until the lock is held or the manager's timeout elapses.
    async fn obtain(&self, name: LockName) -> Result<HeldLock, StorageError>;

    async fn release(&self, held: HeldLock) -> Result<(), StorageError>;

    /// Whether the lock spans processes.
    fn is_distributed(&self) -> bool;
}

#[derive(Debug, Default)]
struct LocalLocks {
    trigger_access: Arc<Mutex<()>>,
    state_access: Arc<Mutex<()>>,
}

impl LocalLocks {
    fn get(&self, name: LockName) -> Arc<Mutex<()>> {
        match name {
            LockName::TriggerAccess => self.trigger_access.clone(),
            LockName::StateAccess => self.state_access.clone(),
        }
    }
}

/// In-process locks for a store that is the only user of its data.
#[derive(Debug, Default)]
pub struct LocalLockManager {
    locks: LocalLocks,
}

impl LocalLockManager {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockManager for LocalLockManager {
    async fn obtain(&self, name: LockName) -> Result<HeldLock, StorageError> {
        let guard = self.locks.get(name).lock_owned().await;
        Ok(HeldLock {
            name,
            _local: guard,
        })
    }

    async fn release(&self, held: HeldLock) -> Result<(), StorageError> {
        drop(held);
        Ok(())
    }

    fn is_distributed(&self) -> bool {
        false
    }
}

#[cfg(feature = "sqlite")]
pub use db::DbLockManager;

#[cfg(feature = "sqlite")]
mod db {
    use super::*;
    use crate::core::clock::SharedClock;
    use sqlx::sqlite::SqlitePool;
    use tracing::{debug, warn};

    const INITIAL_BACKOFF: Duration = Duration::from_millis(5);
    const MAX_BACKOFF: Duration = Duration::from_millis(250);

    /// Lease-based row locks in the `locks` table.
    ///
    /// A lock row is owned while `owner` is set and `expires_at` lies in the
    /// future. An expired lease may be taken over by anyone, so a node that
    /// dies holding a lock stalls the cluster for at most one lease. Lease
    /// times come from the store's clock.
    #[derive(Debug)]
    pub struct DbLockManager {
        pool: SqlitePool,
        owner: String,
        clock: SharedClock,
        lease: Duration,
        timeout: Duration,
        local: LocalLocks,
    }

    impl DbLockManager {
        /// `owner` must be unique among all nodes sharing the database.
        pub fn new(
            pool: SqlitePool,
            owner: impl Into<String>,
            clock: SharedClock,
            lease: Duration,
            timeout: Duration,
        ) -> Self {
            Self {
                pool,
                owner: owner.into(),
                clock,
                lease,
                timeout,
                local: LocalLocks::default(),
            }
        }

        async fn try_claim(&self, name: LockName) -> Result<bool, StorageError> {
            let now = self.clock.now().timestamp_millis();
            let expires_at = now + self.lease.as_millis() as i64;
            let result = sqlx::query(
                r#"
                UPDATE locks SET owner = ?, expires_at = ?
                WHERE lock_name = ? AND (owner IS NULL OR owner = ? OR expires_at < ?)
                "#,
            )
            .bind(&self.owner)
            .bind(expires_at)
            .bind(name.as_str())
            .bind(&self.owner)
            .bind(now)
            .execute(&self.pool)
            .await;

            match result {
                Ok(r) => Ok(r.rows_affected() == 1),
                // SQLITE_BUSY and friends: another writer holds the file, try again.
                Err(sqlx::Error::Database(e)) => {
                    debug!(lock = %name, error = %e, "lock claim hit a database error");
                    Ok(false)
                }
                Err(e) => Err(StorageError::Database(e.to_string())),
            }
        }
    }

    #[async_trait]
    impl LockManager for DbLockManager {
        async fn obtain(&self, name: LockName) -> Result<HeldLock, StorageError> {
            let local = tokio::time::timeout(self.timeout, self.local.get(name).lock_owned())
                .await
                .map_err(|_| StorageError::LockTimeout(name.to_string()))?;

            let deadline = tokio::time::Instant::now() + self.timeout;
            let mut backoff = INITIAL_BACKOFF;
            loop {
                if self.try_claim(name).await? {
                    debug!(lock = %name, owner = %self.owner, "lock obtained");
                    return Ok(HeldLock {
                        name,
                        _local: local,
                    });
                }
                if tokio::time::Instant::now() + backoff > deadline {
                    return Err(StorageError::LockTimeout(name.to_string()));
                }
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }

        async fn release(&self, held: HeldLock) -> Result<(), StorageError> {
            let result = sqlx::query(
                "UPDATE locks SET owner = NULL, expires_at = NULL WHERE lock_name = ? AND owner = ?",
            )
            .bind(held.name.as_str())
            .bind(&self.owner)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Database(e.to_string()))?;

            if result.rows_affected() == 0 {
                warn!(lock = %held.name, owner = %self.owner, "lock lease expired before release");
            }
            Ok(())
        }

        fn is_distributed(&self) -> bool {
            true
        }
    }
}
