//! Per-experiment in-process locks.
//!
//! Admission for one experiment is a read-decide-write sequence (select a
//! group, take a subject number, insert the session). Requests for the same
//! experiment queue on an async mutex; different experiments never contend.
//! The `IMMEDIATE` transaction taken under the lock serializes writers in
//! other processes.
//!
//! Registry entries live only while a request holds or waits on them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::OwnedMutexGuard;

use crate::error::EngineError;

type Registry = Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>;

/// Remove `experiment_id` from the registry if the map holds the only
/// reference to its mutex.
fn forget_if_idle(registry: &Registry, experiment_id: &str) {
    let mut locks = registry.lock().unwrap_or_else(PoisonError::into_inner);
    if locks
        .get(experiment_id)
        .is_some_and(|lock| Arc::strong_count(lock) == 1)
    {
        locks.remove(experiment_id);
    }
}

/// Registry of experiment locks, created on first use.
#[derive(Debug)]
pub struct ExperimentLocks {
    locks: Registry,
    timeout: Duration,
}

/// Held while an experiment-scoped operation runs. Released on drop.
#[derive(Debug)]
pub struct ExperimentGuard {
    experiment_id: String,
    registry: Registry,
    guard: Option<OwnedMutexGuard<()>>,
}

impl ExperimentGuard {
    #[must_use]
    pub fn experiment_id(&self) -> &str {
        &self.experiment_id
    }
}

impl Drop for ExperimentGuard {
    fn drop(&mut self) {
        // Unlock first so the count below only sees the map and any waiters.
        drop(self.guard.take());
        forget_if_idle(&self.registry, &self.experiment_id);
    }
}

impl ExperimentLocks {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            locks: Arc::new(Mutex::new(HashMap::new())),
            timeout,
        }
    }

    /// Wait for the experiment's lock.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::LockTimeout` (transient) if another request holds
    /// the lock longer than the configured timeout.
    pub async fn acquire(&self, experiment_id: &str) -> Result<ExperimentGuard, EngineError> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(experiment_id.to_string()).or_default())
        };

        let acquired = tokio::time::timeout(self.timeout, lock.lock_owned()).await;
        if let Ok(guard) = acquired {
            return Ok(ExperimentGuard {
                experiment_id: experiment_id.to_string(),
                registry: Arc::clone(&self.locks),
                guard: Some(guard),
            });
        }

        // The holder may have released while we were still counted as a waiter.
        forget_if_idle(&self.locks, experiment_id);
        tracing::warn!(experiment_id, timeout = ?self.timeout, "experiment lock timed out");
        Err(EngineError::LockTimeout(experiment_id.to_string()))
    }

    /// Number of experiments with a request holding or waiting on their lock.
    #[must_use]
    pub fn len(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
