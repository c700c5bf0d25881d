//! # wds-db
//!
//! libSQL record store and participant allocation engine for the experiment
//! datastore.
//!
//! Holds experiments, target groups, participant sessions, data points, and
//! per-experiment sequence counters. The [`engine`] module admits participants
//! into groups and numbers their uploads; every admission runs under an
//! in-process experiment lock and an `IMMEDIATE` write transaction so that
//! group selection and sequence assignment are race-free.
//!
//! Uses the `libsql` crate (C `SQLite` fork, v0.9.29) with a local file
//! database. One connection is kept for reads; each write transaction opens
//! its own connection so transactions never interleave.

pub mod engine;
pub mod error;
pub mod helpers;
pub mod lock;
mod migrations;
pub mod repos;
pub mod retry;
pub mod service;
pub mod updates;

#[cfg(test)]
pub(crate) mod test_support;

use std::time::Duration;

use error::DatabaseError;
use libsql::Builder;
use wds_config::DatabaseConfig;
use wds_core::ids::ID_RANDOM_BYTES;

/// Central database handle for all datastore state.
///
/// Wraps a libSQL database, a shared read connection, and the `busy_timeout`
/// applied to every connection it hands out.
pub struct WdsDb {
    db: libsql::Database,
    conn: libsql::Connection,
    busy_timeout: Duration,
}

impl WdsDb {
    /// Open a local database file with default settings.
    ///
    /// Runs migrations automatically on first open.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError` if the database cannot be opened or
    /// migrations fail.
    pub async fn open_local(path: &str) -> Result<Self, DatabaseError> {
        Self::open_with_config(&DatabaseConfig {
            path: path.to_string(),
            ..DatabaseConfig::default()
        })
        .await
    }

    /// Open the database described by `config`.
    ///
    /// Switches the file to WAL so readers never block the writer, then runs
    /// migrations.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError::InvalidState` for `:memory:` paths (write
    /// transactions use separate connections, which cannot share an in-memory
    /// database), or `DatabaseError` if opening or migrating fails.
    pub async fn open_with_config(config: &DatabaseConfig) -> Result<Self, DatabaseError> {
        if !config.is_file_backed() {
            return Err(DatabaseError::InvalidState(format!(
                "database path '{}' is not a file",
                config.path
            )));
        }
        if let Some(parent) = std::path::Path::new(&config.path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    DatabaseError::InvalidState(format!(
                        "cannot create database directory {}: {e}",
                        parent.display()
                    ))
                })?;
            }
        }

        let db = Builder::new_local(&config.path).build().await?;
        let busy_timeout = Duration::from_millis(config.busy_timeout_ms);
        let conn = db.connect()?;
        configure_connection(&conn, busy_timeout).await?;

        // WAL is persistent per file, so once is enough.
        let mut rows = conn
            .query("PRAGMA journal_mode = WAL", ())
            .await
            .map_err(|e| DatabaseError::Migration(format!("PRAGMA journal_mode: {e}")))?;
        while rows.next().await?.is_some() {}

        let wds_db = Self {
            db,
            conn,
            busy_timeout,
        };
        wds_db.run_migrations().await?;
        tracing::debug!(path = %config.path, "database opened");
        Ok(wds_db)
    }

    /// Shared connection for reads and single-statement writes.
    #[must_use]
    pub const fn conn(&self) -> &libsql::Connection {
        &self.conn
    }

    /// Open a fresh, configured connection for a write transaction.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError` if the connection cannot be opened or the
    /// pragmas fail.
    pub async fn connect(&self) -> Result<libsql::Connection, DatabaseError> {
        let conn = self.db.connect()?;
        configure_connection(&conn, self.busy_timeout).await?;
        Ok(conn)
    }

    /// Generate a prefixed ID via libSQL. Returns e.g., `"grp-a3f8b2c19e04d7b6"`.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError` if the query fails or returns no rows.
    pub async fn generate_id(&self, prefix: &str) -> Result<String, DatabaseError> {
        generate_id_on(&self.conn, prefix).await
    }

    /// Generate an opaque 128-bit session token (32 lowercase hex chars).
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError` if the query fails or returns no rows.
    pub async fn generate_token(&self) -> Result<String, DatabaseError> {
        generate_token_on(&self.conn).await
    }
}

/// `generate_id` on an arbitrary connection (e.g. inside a transaction).
pub(crate) async fn generate_id_on(
    conn: &libsql::Connection,
    prefix: &str,
) -> Result<String, DatabaseError> {
    let mut rows = conn
        .query(
            &format!("SELECT ?1 || '-' || lower(hex(randomblob({ID_RANDOM_BYTES})))"),
            [prefix],
        )
        .await?;
    let row = rows.next().await?.ok_or(DatabaseError::NoResult)?;
    Ok(row.get::<String>(0)?)
}

pub(crate) async fn generate_token_on(conn: &libsql::Connection) -> Result<String, DatabaseError> {
    let mut rows = conn.query("SELECT lower(hex(randomblob(16)))", ()).await?;
    let row = rows.next().await?.ok_or(DatabaseError::NoResult)?;
    Ok(row.get::<String>(0)?)
}

async fn configure_connection(
    conn: &libsql::Connection,
    busy_timeout: Duration,
) -> Result<(), DatabaseError> {
    // Foreign keys must be enabled per connection in SQLite.
    conn.execute("PRAGMA foreign_keys = ON", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("PRAGMA foreign_keys: {e}")))?;

    // busy_timeout echoes the new value back as a row.
    let mut rows = conn
        .query(
            &format!("PRAGMA busy_timeout = {}", busy_timeout.as_millis()),
            (),
        )
        .await
        .map_err(|e| DatabaseError::Migration(format!("PRAGMA busy_timeout: {e}")))?;
    while rows.next().await?.is_some() {}
    Ok(())
}

/// Commit on success, roll back on failure.
///
/// A failed rollback is logged and the original error is returned; `SQLite`
/// discards the open transaction when the connection closes anyway.
pub(crate) async fn finish_tx<T, E>(tx: libsql::Transaction, result: Result<T, E>) -> Result<T, E>
where
    E: From<DatabaseError>,
{
    match result {
        Ok(value) => {
            tx.commit()
                .await
                .map_err(|e| E::from(DatabaseError::from(e)))?;
            Ok(value)
        }
        Err(error) => {
            if let Err(rollback_error) = tx.rollback().await {
                tracing::warn!(error = %rollback_error, "rollback failed");
            }
            Err(error)
        }
    }
}
