//! Named lookup of running schedulers.
//!
//! Embedders that run several schedulers in one process can keep their
//! handles in a [`SchedulerDirectory`]. It is an ordinary value owned by
//! the embedder; the engine never consults it.

use std::collections::BTreeMap;
use std::sync::RwLock;

use super::handle::SchedulerHandle;
use super::types::SchedulerError;

/// Handles indexed by scheduler name.
#[derive(Debug, Default)]
pub struct SchedulerDirectory {
    schedulers: RwLock<BTreeMap<String, SchedulerHandle>>,
}

impl SchedulerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handle under its scheduler name. Names must be unique.
    pub fn bind(&self, handle: SchedulerHandle) -> Result<(), SchedulerError> {
        let mut schedulers = self
            .schedulers
            .write()
            .map_err(|_| SchedulerError::Invalid("scheduler directory poisoned".into()))?;
        let name = handle.scheduler_name().to_string();
        if schedulers.contains_key(&name) {
            return Err(SchedulerError::Invalid(format!(
                "a scheduler named '{}' is already registered",
                name
            )));
        }
        schedulers.insert(name, handle);
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Option<SchedulerHandle> {
        self.schedulers.read().ok()?.get(name).cloned()
    }

    /// Forget a scheduler. Returns its handle if it was registered.
    pub fn remove(&self, name: &str) -> Option<SchedulerHandle> {
        self.schedulers.write().ok()?.remove(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.schedulers
            .read()
            .map(|s| s.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop handles of schedulers that have shut down.
    pub async fn prune(&self) -> usize {
        let handles: Vec<SchedulerHandle> = match self.schedulers.read() {
            Ok(s) => s.values().cloned().collect(),
            Err(_) => return 0,
        };
        let mut stopped = Vec::new();
        for handle in handles {
            if handle.is_shutdown().await {
                stopped.push(handle.scheduler_name().to_string());
            }
        }
        let Ok(mut schedulers) = self.schedulers.write() else {
            return 0;
        };
        for name in &stopped {
            schedulers.remove(name);
        }
        stopped.len()
    }
}
