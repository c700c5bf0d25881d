//! Read-only capacity view of a target group.

use wds_core::entities::TargetGroup;
use wds_core::enums::ExperimentState;

use crate::error::DatabaseError;
use crate::repos::group::{completed_counts, fetch_groups};

/// A group with its completed count scoped to one lifecycle value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupState {
    pub group: TargetGroup,
    pub completed: i64,
}

impl GroupState {
    #[must_use]
    pub const fn new(group: TargetGroup, completed: i64) -> Self {
        Self { group, completed }
    }

    /// Open while completions are below target. Overshoot leaves it closed.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.completed < self.group.completion_target
    }
}

/// Groups of an experiment in round-robin order, counted under `lifecycle`.
pub(crate) async fn load_group_states(
    conn: &libsql::Connection,
    experiment_id: &str,
    lifecycle: ExperimentState,
) -> Result<Vec<GroupState>, DatabaseError> {
    let groups = fetch_groups(conn, experiment_id).await?;
    let counts = completed_counts(conn, experiment_id, lifecycle).await?;
    Ok(groups
        .into_iter()
        .map(|group| {
            let completed = counts.get(&group.id).copied().unwrap_or(0);
            GroupState::new(group, completed)
        })
        .collect())
}
