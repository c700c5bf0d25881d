//! Result codes and response types handed to the request layer.
//!
//! The request layer owns status codes and routing; these types only fix the
//! shape and the machine-readable `result` strings.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::enums::SessionState;

/// Machine-readable outcome of an engine operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResultCode {
    Ok,
    ErrNoData,
    ErrUnknownId,
    ErrNotOpen,
    ErrGroupAssignFail,
    ErrNoSession,
    ErrInvalidTransition,
    ErrTransient,
    ErrInternal,
}

impl ResultCode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::ErrNoData => "ERR_NO_DATA",
            Self::ErrUnknownId => "ERR_UNKNOWN_ID",
            Self::ErrNotOpen => "ERR_NOT_OPEN",
            Self::ErrGroupAssignFail => "ERR_GROUP_ASSIGN_FAIL",
            Self::ErrNoSession => "ERR_NO_SESSION",
            Self::ErrInvalidTransition => "ERR_INVALID_TRANSITION",
            Self::ErrTransient => "ERR_TRANSIENT",
            Self::ErrInternal => "ERR_INTERNAL",
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a participant is admitted.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct ParticipantCreateResponse {
    pub session_token: String,
    pub state: SessionState,
    pub group_name: String,
    pub subject_id: i64,
}

/// Returned for a successful data upload.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct UploadResponse {
    pub result: ResultCode,
    pub message: String,
    pub number: i64,
}

/// Error body for a refused operation.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct ErrorResponse {
    pub result: ResultCode,
    pub detail: String,
}

/// Experiment metadata exposed to running experiments.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct MetadataResponse {
    pub state: String,
}
