//! Per-experiment sequence counters (subject ids, data-point numbers).
//!
//! The next value is one past the larger of the stored high-water mark and the
//! live maximum of the holder column. The high-water mark is advanced in the
//! same transaction as the insert that consumes the value, so numbers freed by
//! deletions are never handed out again. `UNIQUE` constraints on the holder
//! columns catch anything that slips past the transaction.

use wds_core::enums::SequenceCounter;

use crate::error::DatabaseError;
use crate::finish_tx;
use crate::repos::query_i64;
use crate::service::WdsService;

async fn high_water_mark(
    conn: &libsql::Connection,
    experiment_id: &str,
    counter: SequenceCounter,
) -> Result<i64, DatabaseError> {
    let (table, column) = counter.holder();
    query_i64(
        conn,
        &format!(
            "SELECT MAX(
                 COALESCE((SELECT last_value FROM sequence_counters
                           WHERE experiment_id = ?1 AND counter = ?2), 0),
                 COALESCE((SELECT MAX({column}) FROM {table} WHERE experiment_id = ?1), 0)
             )"
        ),
        libsql::params![experiment_id, counter.as_str()],
    )
    .await
}

/// Reserve the next value. Must run inside the write transaction that
/// inserts the record holding it.
pub(crate) async fn next_in(
    conn: &libsql::Connection,
    experiment_id: &str,
    counter: SequenceCounter,
) -> Result<i64, DatabaseError> {
    let next = high_water_mark(conn, experiment_id, counter).await? + 1;
    conn.execute(
        "INSERT INTO sequence_counters (experiment_id, counter, last_value)
         VALUES (?1, ?2, ?3)
         ON CONFLICT (experiment_id, counter) DO UPDATE SET last_value = excluded.last_value",
        libsql::params![experiment_id, counter.as_str(), next],
    )
    .await?;
    tracing::debug!(experiment_id, %counter, value = next, "sequence value assigned");
    Ok(next)
}

impl WdsService {
    /// Highest value handed out so far (0 if none).
    pub async fn current_sequence(
        &self,
        experiment_id: &str,
        counter: SequenceCounter,
    ) -> Result<i64, DatabaseError> {
        high_water_mark(self.db().conn(), experiment_id, counter).await
    }

    /// Reserve a value without inserting a holder; the value is consumed.
    pub async fn next_sequence(
        &self,
        experiment_id: &str,
        counter: SequenceCounter,
    ) -> Result<i64, DatabaseError> {
        let tx = self.begin_write().await?;
        let result = next_in(&tx, experiment_id, counter).await;
        finish_tx(tx, result).await
    }
}
