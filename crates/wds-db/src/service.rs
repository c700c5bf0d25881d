//! Service layer owning the store, the experiment locks, and engine settings.
//!
//! `WdsService` wraps `WdsDb` (raw database access) and `ExperimentLocks`.
//! Record management lives in `repos` and the admission engine in `engine`,
//! both as `impl WdsService` blocks.

use std::time::Duration;

use libsql::TransactionBehavior;
use wds_config::{AllocationConfig, WdsConfig};

use crate::WdsDb;
use crate::error::DatabaseError;
use crate::lock::ExperimentLocks;
use crate::retry::RetryPolicy;

/// Entry point for every datastore operation.
///
/// Every engine mutation follows this protocol:
/// 1. Acquire the experiment lock
/// 2. Begin an `IMMEDIATE` transaction on a fresh connection
/// 3. Read, decide, and write
/// 4. Commit (or roll back on any error)
/// 5. Retry the whole unit on transient conflicts
pub struct WdsService {
    db: WdsDb,
    locks: ExperimentLocks,
    retry: RetryPolicy,
    allocation: AllocationConfig,
}

impl WdsService {
    /// Open the configured database and build a service around it.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError` if the database cannot be opened.
    pub async fn new_local(config: &WdsConfig) -> Result<Self, DatabaseError> {
        let db = WdsDb::open_with_config(&config.database).await?;
        Ok(Self::from_db(db, config))
    }

    /// Create from an existing `WdsDb`.
    #[must_use]
    pub fn from_db(db: WdsDb, config: &WdsConfig) -> Self {
        Self {
            db,
            locks: ExperimentLocks::new(Duration::from_millis(config.allocation.lock_timeout_ms)),
            retry: RetryPolicy::from(&config.retry),
            allocation: config.allocation.clone(),
        }
    }

    /// Access the underlying database handle.
    #[must_use]
    pub const fn db(&self) -> &WdsDb {
        &self.db
    }

    #[must_use]
    pub const fn locks(&self) -> &ExperimentLocks {
        &self.locks
    }

    #[must_use]
    pub const fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    #[must_use]
    pub const fn allocation(&self) -> &AllocationConfig {
        &self.allocation
    }

    /// Begin an `IMMEDIATE` transaction on a new connection.
    ///
    /// The write lock is taken up front, so reads inside the transaction see
    /// the state the writes will be based on.
    pub(crate) async fn begin_write(&self) -> Result<libsql::Transaction, DatabaseError> {
        let conn = self.db.connect().await?;
        Ok(conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .await?)
    }
}
