use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::enums::ExperimentState;

/// Display label shown instead of the lifecycle while staff approval is pending.
pub const AWAITING_APPROVAL: &str = "awaiting_approval";

/// An experiment that participants are admitted into.
///
/// `access_id` is the public key the request layer resolves experiments by;
/// `id` is the internal primary key.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct Experiment {
    pub id: String,
    pub access_id: String,
    pub title: String,
    pub state: ExperimentState,
    pub approved: bool,
    pub created_at: DateTime<Utc>,
}

impl Experiment {
    /// Approval and lifecycle both allow new participants. Group capacity is
    /// checked separately by the admission gate.
    #[must_use]
    pub const fn lifecycle_accepts(&self) -> bool {
        self.approved && self.state.accepts_participants()
    }

    /// Status label for metadata lookups. Pending approval overrides whatever
    /// lifecycle the researcher has set.
    #[must_use]
    pub const fn display_state(&self) -> &'static str {
        if self.approved {
            self.state.as_str()
        } else {
            AWAITING_APPROVAL
        }
    }
}
