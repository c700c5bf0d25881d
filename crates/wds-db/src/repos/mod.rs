//! Repository modules implementing record management for datastore entities.
//!
//! Each module adds methods to `WdsService` via `impl WdsService` blocks, plus
//! crate-internal query functions that take a connection so the engine can run
//! them inside its write transaction.

pub mod data_point;
pub mod experiment;
pub mod group;
pub mod sequence;
pub mod session;

use wds_core::errors::CoreError;

use crate::error::DatabaseError;

pub(crate) fn not_found(entity_type: &str, id: &str) -> DatabaseError {
    DatabaseError::Core(CoreError::NotFound {
        entity_type: entity_type.to_string(),
        id: id.to_string(),
    })
}

/// Read a single `COUNT(*)`/aggregate integer.
pub(crate) async fn query_i64(
    conn: &libsql::Connection,
    sql: &str,
    params: impl libsql::params::IntoParams,
) -> Result<i64, DatabaseError> {
    let mut rows = conn.query(sql, params).await?;
    let row = rows.next().await?.ok_or(DatabaseError::NoResult)?;
    Ok(row.get::<i64>(0)?)
}
