//! Group allocation policy.
//!
//! Incoming participants are spread round robin over the open groups. Because
//! started sessions do not always complete, the policy rebalances whenever the
//! most recent event in the current lifecycle was a completion: the next
//! participant then goes to the open group with the fewest completions.
//!
//! History and counts are both scoped to the experiment's current lifecycle,
//! so a pilot phase never skews the open phase.

use chrono::{DateTime, Utc};
use wds_core::entities::{Experiment, TargetGroup};

use crate::engine::group_state::{GroupState, load_group_states};
use crate::error::{DatabaseError, EngineError};
use crate::repos::experiment::fetch_experiment;
use crate::repos::session::{latest_completed, latest_started};
use crate::service::WdsService;

/// The two events the policy looks at, both within the current lifecycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllocationHistory {
    /// Group and start time of the most recently started session.
    pub last_opened: Option<(String, DateTime<Utc>)>,
    /// Time of the most recent completion.
    pub last_closed: Option<DateTime<Utc>>,
}

impl AllocationHistory {
    pub(crate) async fn load(
        conn: &libsql::Connection,
        experiment: &Experiment,
    ) -> Result<Self, DatabaseError> {
        Ok(Self {
            last_opened: latest_started(conn, &experiment.id, experiment.state).await?,
            last_closed: latest_completed(conn, &experiment.id, experiment.state).await?,
        })
    }

    /// A completion happened strictly after the last start (or with no start
    /// at all in this lifecycle).
    #[must_use]
    pub fn completion_is_latest(&self) -> bool {
        match (&self.last_opened, self.last_closed) {
            (_, None) => false,
            (None, Some(_)) => true,
            (Some((_, started)), Some(closed)) => closed > *started,
        }
    }
}

/// Pick the group for the next participant, or `None` when every group is
/// full (or there are no groups).
///
/// `groups` must be in round-robin (`position`) order.
#[must_use]
pub fn choose_group<'a>(
    groups: &'a [GroupState],
    history: &AllocationHistory,
) -> Option<&'a GroupState> {
    if groups.is_empty() {
        return None;
    }
    if history.completion_is_latest() {
        least_completed(groups)
    } else {
        let last_group = history.last_opened.as_ref().map(|(id, _)| id.as_str());
        next_in_turn(groups, last_group)
    }
}

/// Fewest completions first; ties go to the earlier group.
fn least_completed(groups: &[GroupState]) -> Option<&GroupState> {
    groups
        .iter()
        .filter(|g| g.is_open())
        .min_by_key(|g| (g.completed, g.group.position))
}

/// First open group after `last_group`, wrapping around once. Without a
/// previous group the walk starts at the first group.
fn next_in_turn<'a>(groups: &'a [GroupState], last_group: Option<&str>) -> Option<&'a GroupState> {
    let len = groups.len();
    let last_idx = last_group
        .and_then(|id| groups.iter().position(|g| g.group.id == id))
        .unwrap_or(len - 1);
    (1..=len)
        .map(|step| &groups[(last_idx + step) % len])
        .find(|g| g.is_open())
}

/// Load counts and history for `experiment` and pick a group.
pub(crate) async fn select_group_in(
    conn: &libsql::Connection,
    experiment: &Experiment,
) -> Result<(Vec<GroupState>, Option<GroupState>), DatabaseError> {
    let groups = load_group_states(conn, &experiment.id, experiment.state).await?;
    let history = AllocationHistory::load(conn, experiment).await?;
    let chosen = choose_group(&groups, &history).cloned();
    tracing::debug!(
        experiment_id = %experiment.id,
        lifecycle = %experiment.state,
        rebalance = history.completion_is_latest(),
        chosen = chosen.as_ref().map(|g| g.group.name.as_str()),
        "group selection"
    );
    Ok((groups, chosen))
}

impl WdsService {
    /// The group the next participant would join right now. Read-only; the
    /// answer can change before a participant is actually created.
    pub async fn select_group(&self, experiment_id: &str) -> Result<Option<TargetGroup>, EngineError> {
        let conn = self.db().conn();
        let experiment = fetch_experiment(conn, experiment_id)
            .await?
            .ok_or_else(|| EngineError::UnknownExperiment(experiment_id.to_string()))?;
        let (_, chosen) = select_group_in(conn, &experiment).await?;
        Ok(chosen.map(|state| state.group))
    }
}
