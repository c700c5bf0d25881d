//! Transient conflict retry logic.
//!
//! Experiment-scoped writes run inside `BEGIN IMMEDIATE` transactions. When
//! another process holds the write lock longer than `busy_timeout`, `SQLite`
//! reports the database as busy/locked; an in-process experiment lock can
//! also time out. Both resolve on their own, so the engine retries the whole
//! unit of work with capped exponential backoff before giving up.
//!
//! The predicate is intentionally narrow: constraint violations and SQL
//! errors are never retried.

use std::future::Future;
use std::time::Duration;

use wds_config::RetryConfig;

use crate::error::EngineError;

/// Retry behaviour for transient conflicts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the initial one).
    pub max_attempts: u32,
    /// Initial delay before the first retry.
    pub base_delay: Duration,
    /// Maximum delay between retries (backoff is capped here).
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }
}

impl RetryPolicy {
    /// Delay after the given failed attempt (1-based): `base * 2^(attempt-1)`, capped.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Detect `SQLite` busy/locked errors.
pub fn is_transient_libsql_error(e: &libsql::Error) -> bool {
    let msg = e.to_string();
    msg.contains("database is locked")
        || msg.contains("database table is locked")
        || msg.contains("SQLITE_BUSY")
        || msg.contains("SQLITE_LOCKED")
}

/// Run `op` until it succeeds, fails permanently, or exhausts the policy.
///
/// Each attempt must be a complete unit of work (its own transaction), since
/// a failed attempt has already been rolled back.
///
/// # Errors
///
/// Returns the first non-transient error, or `EngineError::Transient` once
/// `max_attempts` transient failures have occurred.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &'static str,
    mut op: F,
) -> Result<T, EngineError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, EngineError>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Err(error) if error.is_transient() => {
                if attempt >= policy.max_attempts {
                    tracing::warn!(operation, attempts = attempt, %error, "giving up after transient conflicts");
                    return Err(EngineError::Transient {
                        operation,
                        attempts: attempt,
                        reason: error.to_string(),
                    });
                }
                let delay = policy.delay_for(attempt);
                tracing::warn!(operation, attempt, ?delay, %error, "transient conflict; retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}
