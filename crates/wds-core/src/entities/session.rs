use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::enums::{ExperimentState, SessionState};

/// One participant's journey through an experiment.
///
/// The two lifecycle snapshots are deliberately separate fields: group
/// completion counts read `experiment_state_at_completion` only, and it is
/// written exactly once.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct ParticipantSession {
    pub id: String,
    pub token: String,
    pub experiment_id: String,
    pub group_id: String,
    pub state: SessionState,
    pub subject_id: i64,
    pub experiment_state_at_creation: ExperimentState,
    pub experiment_state_at_completion: Option<ExperimentState>,
    pub date_started: DateTime<Utc>,
    pub date_updated: DateTime<Utc>,
}

impl ParticipantSession {
    /// Sessions started during piloting are labelled as pilot data.
    #[must_use]
    pub fn is_pilot(&self) -> bool {
        self.experiment_state_at_creation == ExperimentState::Piloting
    }
}
