//! Target group repository.
//!
//! Groups are ordered by `position`, assigned once at insert as one past the
//! experiment's current maximum. Completed counts are never stored here; see
//! [`completed_counts`].

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use wds_config::MAX_GROUP_NAME_LEN;
use wds_core::entities::{GroupStats, TargetGroup};
use wds_core::enums::ExperimentState;
use wds_core::errors::CoreError;
use wds_core::ids::PREFIX_GROUP;

use crate::error::DatabaseError;
use crate::helpers::{format_timestamp, now, parse_datetime};
use crate::repos::experiment::fetch_experiment;
use crate::repos::{not_found, query_i64};
use crate::service::WdsService;
use crate::updates::group::GroupUpdate;
use crate::{finish_tx, generate_id_on};

const SELECT_COLS: &str =
    "id, experiment_id, name, completion_target, position, created_at, updated_at";

/// A group to add to an experiment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewGroup {
    pub name: String,
    pub completion_target: i64,
}

impl NewGroup {
    pub fn new(name: impl Into<String>, completion_target: i64) -> Self {
        Self {
            name: name.into(),
            completion_target,
        }
    }

    /// # Errors
    ///
    /// Returns `CoreError::Validation` for an empty or over-long name or a
    /// negative target.
    pub fn validate(&self) -> Result<(), CoreError> {
        validate_name(&self.name)?;
        validate_target(self.completion_target)
    }
}

fn validate_name(name: &str) -> Result<(), CoreError> {
    let len = name.chars().count();
    if len == 0 || len > MAX_GROUP_NAME_LEN {
        return Err(CoreError::Validation(format!(
            "group name must be 1 to {MAX_GROUP_NAME_LEN} characters, got {len}"
        )));
    }
    Ok(())
}

fn validate_target(target: i64) -> Result<(), CoreError> {
    if target < 0 {
        return Err(CoreError::Validation(format!(
            "completion target must not be negative, got {target}"
        )));
    }
    Ok(())
}

fn row_to_group(row: &libsql::Row) -> Result<TargetGroup, DatabaseError> {
    Ok(TargetGroup {
        id: row.get(0)?,
        experiment_id: row.get(1)?,
        name: row.get(2)?,
        completion_target: row.get(3)?,
        position: row.get(4)?,
        created_at: parse_datetime(&row.get::<String>(5)?)?,
        updated_at: parse_datetime(&row.get::<String>(6)?)?,
    })
}

pub(crate) async fn insert_group(
    conn: &libsql::Connection,
    experiment_id: &str,
    group: &NewGroup,
) -> Result<TargetGroup, DatabaseError> {
    group.validate()?;
    let id = generate_id_on(conn, PREFIX_GROUP).await?;
    let position = query_i64(
        conn,
        "SELECT COALESCE(MAX(position), 0) + 1 FROM target_groups WHERE experiment_id = ?1",
        [experiment_id],
    )
    .await?;
    let created_at = now();
    let ts = format_timestamp(&created_at);

    conn.execute(
        &format!("INSERT INTO target_groups ({SELECT_COLS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"),
        libsql::params![
            id.as_str(),
            experiment_id,
            group.name.as_str(),
            group.completion_target,
            position,
            ts.as_str(),
            ts.as_str()
        ],
    )
    .await?;

    Ok(TargetGroup {
        id,
        experiment_id: experiment_id.to_string(),
        name: group.name.clone(),
        completion_target: group.completion_target,
        position,
        created_at,
        updated_at: created_at,
    })
}

/// Groups of an experiment in round-robin order.
pub(crate) async fn fetch_groups(
    conn: &libsql::Connection,
    experiment_id: &str,
) -> Result<Vec<TargetGroup>, DatabaseError> {
    let mut rows = conn
        .query(
            &format!(
                "SELECT {SELECT_COLS} FROM target_groups WHERE experiment_id = ?1 ORDER BY position"
            ),
            [experiment_id],
        )
        .await?;
    let mut groups = Vec::new();
    while let Some(row) = rows.next().await? {
        groups.push(row_to_group(&row)?);
    }
    Ok(groups)
}

async fn fetch_group(
    conn: &libsql::Connection,
    id: &str,
) -> Result<Option<TargetGroup>, DatabaseError> {
    let mut rows = conn
        .query(
            &format!("SELECT {SELECT_COLS} FROM target_groups WHERE id = ?1"),
            [id],
        )
        .await?;
    rows.next().await?.map(|row| row_to_group(&row)).transpose()
}

/// Completed sessions per group whose completion snapshot equals `lifecycle`.
/// Groups without such sessions are absent from the map.
pub(crate) async fn completed_counts(
    conn: &libsql::Connection,
    experiment_id: &str,
    lifecycle: ExperimentState,
) -> Result<HashMap<String, i64>, DatabaseError> {
    let mut rows = conn
        .query(
            "SELECT group_id, COUNT(*) FROM participant_sessions
             WHERE experiment_id = ?1 AND state = 'completed'
               AND experiment_state_at_completion = ?2
             GROUP BY group_id",
            libsql::params![experiment_id, lifecycle.as_str()],
        )
        .await?;
    let mut counts = HashMap::new();
    while let Some(row) = rows.next().await? {
        counts.insert(row.get::<String>(0)?, row.get::<i64>(1)?);
    }
    Ok(counts)
}

impl WdsService {
    /// Append a group to an experiment (it becomes last in round-robin order).
    pub async fn create_group(
        &self,
        experiment_id: &str,
        group: &NewGroup,
    ) -> Result<TargetGroup, DatabaseError> {
        let tx = self.begin_write().await?;
        let result: Result<TargetGroup, DatabaseError> = async {
            if fetch_experiment(&tx, experiment_id).await?.is_none() {
                return Err(not_found("experiment", experiment_id));
            }
            insert_group(&tx, experiment_id, group).await
        }
        .await;
        let created = finish_tx(tx, result).await?;
        tracing::info!(experiment_id, group_id = %created.id, name = %created.name, "group created");
        Ok(created)
    }

    pub async fn get_group(&self, id: &str) -> Result<TargetGroup, DatabaseError> {
        fetch_group(self.db().conn(), id)
            .await?
            .ok_or_else(|| not_found("target_group", id))
    }

    pub async fn list_groups(&self, experiment_id: &str) -> Result<Vec<TargetGroup>, DatabaseError> {
        fetch_groups(self.db().conn(), experiment_id).await
    }

    pub async fn update_group(
        &self,
        id: &str,
        update: GroupUpdate,
    ) -> Result<TargetGroup, DatabaseError> {
        let mut sets = Vec::new();
        let mut params: Vec<libsql::Value> = Vec::new();
        let mut idx = 1usize;

        if let Some(ref name) = update.name {
            validate_name(name)?;
            sets.push(format!("name = ?{idx}"));
            params.push(name.clone().into());
            idx += 1;
        }
        if let Some(target) = update.completion_target {
            validate_target(target)?;
            sets.push(format!("completion_target = ?{idx}"));
            params.push(target.into());
            idx += 1;
        }

        if sets.is_empty() {
            return self.get_group(id).await;
        }

        sets.push(format!("updated_at = ?{idx}"));
        params.push(format_timestamp(&now()).into());
        idx += 1;

        params.push(id.into());
        let sql = format!("UPDATE target_groups SET {} WHERE id = ?{idx}", sets.join(", "));
        let changed = self
            .db()
            .conn()
            .execute(&sql, libsql::params_from_iter(params))
            .await?;
        if changed == 0 {
            return Err(not_found("target_group", id));
        }
        self.get_group(id).await
    }

    /// Delete a group no session refers to.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Validation` while any participant session still
    /// belongs to the group.
    pub async fn delete_group(&self, id: &str) -> Result<(), DatabaseError> {
        let tx = self.begin_write().await?;
        let result: Result<(), DatabaseError> = async {
            let sessions = query_i64(
                &tx,
                "SELECT COUNT(*) FROM participant_sessions WHERE group_id = ?1",
                [id],
            )
            .await?;
            if sessions > 0 {
                return Err(DatabaseError::Core(CoreError::Validation(format!(
                    "group {id} still has {sessions} participant sessions"
                ))));
            }
            let changed = tx
                .execute("DELETE FROM target_groups WHERE id = ?1", [id])
                .await?;
            if changed == 0 {
                return Err(not_found("target_group", id));
            }
            Ok(())
        }
        .await;

        if let Err(ref error) = result {
            tracing::warn!(group_id = id, %error, "group deletion refused");
        }
        finish_tx(tx, result).await
    }

    /// Session counts per group, in round-robin order.
    ///
    /// `completed` counts open-phase completions only; pilot completions are
    /// reported separately and never consume capacity.
    pub async fn group_stats(&self, experiment_id: &str) -> Result<Vec<GroupStats>, DatabaseError> {
        let mut rows = self
            .db()
            .conn()
            .query(
                "SELECT g.id, g.name, g.completion_target,
                        COUNT(s.id),
                        COALESCE(SUM(CASE WHEN s.state = 'completed'
                                          AND s.experiment_state_at_completion = 'open'
                                     THEN 1 ELSE 0 END), 0),
                        COALESCE(SUM(CASE WHEN s.state = 'completed'
                                          AND s.experiment_state_at_completion = 'piloting'
                                     THEN 1 ELSE 0 END), 0)
                 FROM target_groups g
                 LEFT JOIN participant_sessions s ON s.group_id = g.id
                 WHERE g.experiment_id = ?1
                 GROUP BY g.id
                 ORDER BY g.position",
                [experiment_id],
            )
            .await?;
        let mut stats = Vec::new();
        while let Some(row) = rows.next().await? {
            stats.push(GroupStats {
                group_id: row.get(0)?,
                name: row.get(1)?,
                completion_target: row.get(2)?,
                started: row.get(3)?,
                completed: row.get(4)?,
                pilot_completed: row.get(5)?,
            });
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use crate::test_support::helpers::{group, running_experiment, test_service};
    use crate::updates::group::GroupUpdateBuilder;

    #[rstest]
    #[case("", 1, false)]
    #[case("A", -1, false)]
    #[case("A", 0, true)]
    #[case(&"x".repeat(100), 10, true)]
    #[case(&"x".repeat(101), 10, false)]
    fn new_group_validation(#[case] name: &str, #[case] target: i64, #[case] valid: bool) {
        assert_eq!(NewGroup::new(name, target).validate().is_ok(), valid);
    }

    #[tokio::test]
    async fn create_group_appends_position() {
        let (svc, _dir) = test_service().await;
        let experiment = svc
            .create_experiment("Groups", &[group("A", 1), group("B", 1)])
            .await
            .unwrap();
        let c = svc.create_group(&experiment.id, &group("C", 3)).await.unwrap();
        assert_eq!(c.position, 3);
        assert_eq!(svc.get_group(&c.id).await.unwrap(), c);
    }

    #[tokio::test]
    async fn create_group_for_unknown_experiment_fails() {
        let (svc, _dir) = test_service().await;
        let result = svc.create_group("exp-missing", &group("A", 1)).await;
        assert!(matches!(
            result,
            Err(DatabaseError::Core(CoreError::NotFound { .. }))
        ));
    }

    #[tokio::test]
    async fn update_group_target() {
        let (svc, _dir) = test_service().await;
        let experiment = svc.create_experiment("Update", &[group("A", 1)]).await.unwrap();
        let groups = svc.list_groups(&experiment.id).await.unwrap();

        let updated = svc
            .update_group(
                &groups[0].id,
                GroupUpdateBuilder::new().completion_target(9).name("Renamed").build(),
            )
            .await
            .unwrap();
        assert_eq!(updated.completion_target, 9);
        assert_eq!(updated.name, "Renamed");
        assert_eq!(updated.position, groups[0].position);
        assert!(updated.updated_at > groups[0].updated_at);

        let invalid = svc
            .update_group(
                &groups[0].id,
                GroupUpdateBuilder::new().completion_target(-3).build(),
            )
            .await;
        assert!(invalid.is_err());
    }

    #[tokio::test]
    async fn referenced_group_cannot_be_deleted() {
        let (svc, _dir) = test_service().await;
        let (experiment, groups) =
            running_experiment(&svc, ExperimentState::Open, &[group("A", 5), group("B", 5)]).await;
        let admitted = svc.create_participant(&experiment.id).await.unwrap();
        assert_eq!(admitted.group_name, "A");

        let result = svc.delete_group(&groups[0].id).await;
        assert!(matches!(
            result,
            Err(DatabaseError::Core(CoreError::Validation(_)))
        ));
        assert_eq!(svc.list_groups(&experiment.id).await.unwrap().len(), 2);

        svc.delete_group(&groups[1].id).await.unwrap();
        assert_eq!(svc.list_groups(&experiment.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stats_split_open_and_pilot_completions() {
        let (svc, _dir) = test_service().await;
        let (experiment, _) =
            running_experiment(&svc, ExperimentState::Piloting, &[group("A", 2), group("B", 2)])
                .await;

        let pilot = svc.create_participant(&experiment.id).await.unwrap();
        svc.complete_session(&pilot.session_token).await.unwrap();

        svc.update_experiment(
            &experiment.id,
            crate::updates::experiment::ExperimentUpdateBuilder::new()
                .state(ExperimentState::Open)
                .build(),
        )
        .await
        .unwrap();
        let first = svc.create_participant(&experiment.id).await.unwrap();
        svc.complete_session(&first.session_token).await.unwrap();
        svc.create_participant(&experiment.id).await.unwrap();

        let stats = svc.group_stats(&experiment.id).await.unwrap();
        let summary: Vec<_> = stats
            .iter()
            .map(|s| (s.name.as_str(), s.started, s.completed, s.pilot_completed))
            .collect();
        assert_eq!(summary, vec![("A", 2, 1, 1), ("B", 1, 0, 0)]);
        assert_eq!(stats[0].remaining(), 1);
    }
}
