//! Error types for wds-db.
//!
//! `DatabaseError` covers storage failures. `EngineError` is the outcome
//! taxonomy of the admission engine; each variant maps to a stable
//! [`ResultCode`] the request layer can expose.

use thiserror::Error;
use wds_core::errors::CoreError;
use wds_core::responses::{ErrorResponse, ResultCode};

use crate::retry::is_transient_libsql_error;

/// Errors from database operations.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// A SQL query failed.
    #[error("Query failed: {0}")]
    Query(String),

    /// Schema migration failed.
    #[error("Migration failed: {0}")]
    Migration(String),

    /// Expected a result row but none was returned.
    #[error("No result returned")]
    NoResult,

    /// Invalid state encountered (e.g., bad data in DB).
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Domain validation or protection rule refused the operation.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Underlying libSQL error.
    #[error("libSQL error: {0}")]
    LibSql(#[from] libsql::Error),

    /// Catch-all for unexpected errors.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DatabaseError {
    /// Busy/locked conditions that resolve once the competing writer commits.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::LibSql(e) if is_transient_libsql_error(e))
    }
}

/// Outcomes of admission, completion, and upload operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// No experiment with the given id exists.
    #[error("No experiment using id {0} was found")]
    UnknownExperiment(String),

    /// Not approved, not in an accepting lifecycle state, or (group mode)
    /// every group has reached its completion target.
    #[error("Experiment {0} is not open to new participants")]
    NotOpen(String),

    /// The gate passed but no group could be produced.
    #[error("Could not assign participant to any group in experiment {0}")]
    GroupAssignFail(String),

    /// Unknown session token, or a token belonging to another experiment.
    #[error("Participant session not found")]
    SessionNotFound,

    /// The experiment balances groups, so uploads must name a session.
    #[error("Experiment {0} requires a participant session id")]
    SessionRequired(String),

    /// Session upload to an experiment that runs without groups.
    #[error("Experiment {0} is not using participant sessions")]
    SessionsNotUsed(String),

    /// Empty upload payload.
    #[error("No data was provided")]
    NoData,

    /// Another request held the experiment lock for too long.
    #[error("Timed out waiting for experiment {0}")]
    LockTimeout(String),

    /// A transient conflict persisted through every retry.
    #[error("{operation} failed after {attempts} attempts: {reason}")]
    Transient {
        operation: &'static str,
        attempts: u32,
        reason: String,
    },

    /// State machine or validation failure.
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl EngineError {
    /// Conflicts worth retrying: lock timeouts and busy storage.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::LockTimeout(_) => true,
            Self::Database(e) => e.is_transient(),
            _ => false,
        }
    }

    #[must_use]
    pub const fn result_code(&self) -> ResultCode {
        match self {
            Self::UnknownExperiment(_) => ResultCode::ErrUnknownId,
            Self::NotOpen(_) => ResultCode::ErrNotOpen,
            Self::GroupAssignFail(_) => ResultCode::ErrGroupAssignFail,
            Self::SessionNotFound | Self::SessionRequired(_) | Self::SessionsNotUsed(_) => ResultCode::ErrNoSession,
            Self::NoData => ResultCode::ErrNoData,
            Self::LockTimeout(_) | Self::Transient { .. } => ResultCode::ErrTransient,
            Self::Core(CoreError::InvalidTransition { .. }) => ResultCode::ErrInvalidTransition,
            Self::Core(CoreError::NotFound { .. }) => ResultCode::ErrUnknownId,
            Self::Core(_) | Self::Database(_) => ResultCode::ErrInternal,
        }
    }

    /// Error body for the request layer.
    #[must_use]
    pub fn to_response(&self) -> ErrorResponse {
        ErrorResponse {
            result: self.result_code(),
            detail: self.to_string(),
        }
    }
}
