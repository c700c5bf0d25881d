//! Admission gate.

use wds_core::entities::Experiment;

use crate::engine::group_state::{GroupState, load_group_states};
use crate::error::EngineError;
use crate::repos::experiment::fetch_experiment;
use crate::service::WdsService;

/// Approved, in an accepting lifecycle, and (when balancing over several
/// groups) at least one group still open.
///
/// An experiment with a single group runs in legacy mode: its capacity is
/// never checked.
#[must_use]
pub fn accepts_new_participant(experiment: &Experiment, groups: &[GroupState]) -> bool {
    experiment.lifecycle_accepts() && (groups.len() <= 1 || groups.iter().any(GroupState::is_open))
}

impl WdsService {
    pub async fn accepts_new_participants(&self, experiment_id: &str) -> Result<bool, EngineError> {
        let conn = self.db().conn();
        let experiment = fetch_experiment(conn, experiment_id)
            .await?
            .ok_or_else(|| EngineError::UnknownExperiment(experiment_id.to_string()))?;
        let groups = load_group_states(conn, &experiment.id, experiment.state).await?;
        Ok(accepts_new_participant(&experiment, &groups))
    }
}
