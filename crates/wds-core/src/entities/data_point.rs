use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A single data upload, numbered per experiment.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct DataPoint {
    pub id: String,
    pub experiment_id: String,
    pub session_id: Option<String>,
    pub number: i64,
    pub payload: String,
    pub size: i64,
    pub created_at: DateTime<Utc>,
}
