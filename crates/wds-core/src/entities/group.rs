use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A capacity-limited target group inside an experiment.
///
/// `position` is the creation sequence within the experiment and defines the
/// round-robin order. The completed count is never stored; it is derived from
/// sessions at query time.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct TargetGroup {
    pub id: String,
    pub experiment_id: String,
    pub name: String,
    pub completion_target: i64,
    pub position: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Per-group session counts for researcher dashboards.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct GroupStats {
    pub group_id: String,
    pub name: String,
    pub completion_target: i64,
    pub started: i64,
    pub completed: i64,
    pub pilot_completed: i64,
}

impl GroupStats {
    /// Open-phase completions still missing to reach the target.
    #[must_use]
    pub const fn remaining(&self) -> i64 {
        let remaining = self.completion_target - self.completed;
        if remaining > 0 { remaining } else { 0 }
    }
}
