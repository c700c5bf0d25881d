//! Experiment repository.
//!
//! Creation always leaves the experiment with at least one target group:
//! when none are given, a default group is added with the configured name
//! and a generous completion target.

use wds_core::entities::Experiment;
use wds_core::enums::ExperimentState;
use wds_core::ids::PREFIX_EXPERIMENT;
use wds_core::responses::MetadataResponse;

use crate::error::DatabaseError;
use crate::helpers::{format_timestamp, now, parse_datetime, parse_enum};
use crate::repos::group::{NewGroup, insert_group};
use crate::repos::{not_found, query_i64};
use crate::service::WdsService;
use crate::updates::experiment::ExperimentUpdate;
use crate::{finish_tx, generate_id_on, generate_token_on};

const SELECT_COLS: &str = "id, access_id, title, state, approved, created_at";

fn row_to_experiment(row: &libsql::Row) -> Result<Experiment, DatabaseError> {
    Ok(Experiment {
        id: row.get(0)?,
        access_id: row.get(1)?,
        title: row.get(2)?,
        state: parse_enum(&row.get::<String>(3)?)?,
        approved: row.get::<i64>(4)? != 0,
        created_at: parse_datetime(&row.get::<String>(5)?)?,
    })
}

pub(crate) async fn fetch_experiment(
    conn: &libsql::Connection,
    id: &str,
) -> Result<Option<Experiment>, DatabaseError> {
    let mut rows = conn
        .query(
            &format!("SELECT {SELECT_COLS} FROM experiments WHERE id = ?1"),
            [id],
        )
        .await?;
    rows.next()
        .await?
        .map(|row| row_to_experiment(&row))
        .transpose()
}

impl WdsService {
    /// Create a closed, unapproved experiment with the given groups.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError::Core` if a group fails validation, or
    /// `DatabaseError` if the inserts fail (nothing is persisted then).
    pub async fn create_experiment(
        &self,
        title: &str,
        groups: &[NewGroup],
    ) -> Result<Experiment, DatabaseError> {
        let tx = self.begin_write().await?;
        let result = self.insert_experiment(&tx, title, groups).await;
        let experiment = finish_tx(tx, result).await?;
        tracing::info!(experiment_id = %experiment.id, groups = groups.len().max(1), "experiment created");
        Ok(experiment)
    }

    async fn insert_experiment(
        &self,
        conn: &libsql::Connection,
        title: &str,
        groups: &[NewGroup],
    ) -> Result<Experiment, DatabaseError> {
        let created_at = now();
        let id = generate_id_on(conn, PREFIX_EXPERIMENT).await?;
        let access_id = generate_token_on(conn).await?;

        conn.execute(
            &format!("INSERT INTO experiments ({SELECT_COLS}) VALUES (?1, ?2, ?3, ?4, 0, ?5)"),
            libsql::params![
                id.as_str(),
                access_id.as_str(),
                title,
                ExperimentState::Closed.as_str(),
                format_timestamp(&created_at)
            ],
        )
        .await?;

        if groups.is_empty() {
            self.insert_default_group(conn, &id).await?;
        } else {
            for group in groups {
                insert_group(conn, &id, group).await?;
            }
        }

        Ok(Experiment {
            id,
            access_id,
            title: title.to_string(),
            state: ExperimentState::Closed,
            approved: false,
            created_at,
        })
    }

    async fn insert_default_group(
        &self,
        conn: &libsql::Connection,
        experiment_id: &str,
    ) -> Result<(), DatabaseError> {
        let default = NewGroup::new(
            self.allocation().default_group_name.clone(),
            self.allocation().default_completion_target,
        );
        insert_group(conn, experiment_id, &default).await?;
        Ok(())
    }

    pub async fn get_experiment(&self, id: &str) -> Result<Experiment, DatabaseError> {
        fetch_experiment(self.db().conn(), id)
            .await?
            .ok_or_else(|| not_found("experiment", id))
    }

    /// Resolve an experiment by its public access id.
    pub async fn get_experiment_by_access_id(
        &self,
        access_id: &str,
    ) -> Result<Experiment, DatabaseError> {
        let mut rows = self
            .db()
            .conn()
            .query(
                &format!("SELECT {SELECT_COLS} FROM experiments WHERE access_id = ?1"),
                [access_id],
            )
            .await?;
        let row = rows
            .next()
            .await?
            .ok_or_else(|| not_found("experiment", access_id))?;
        row_to_experiment(&row)
    }

    pub async fn list_experiments(&self) -> Result<Vec<Experiment>, DatabaseError> {
        let mut rows = self
            .db()
            .conn()
            .query(
                &format!("SELECT {SELECT_COLS} FROM experiments ORDER BY created_at"),
                (),
            )
            .await?;
        let mut experiments = Vec::new();
        while let Some(row) = rows.next().await? {
            experiments.push(row_to_experiment(&row)?);
        }
        Ok(experiments)
    }

    /// Apply an update. An experiment left without groups gets its default
    /// group back, mirroring creation.
    pub async fn update_experiment(
        &self,
        id: &str,
        update: ExperimentUpdate,
    ) -> Result<Experiment, DatabaseError> {
        let tx = self.begin_write().await?;
        let result = self.apply_experiment_update(&tx, id, &update).await;
        let experiment = finish_tx(tx, result).await?;
        tracing::info!(experiment_id = id, state = %experiment.state, approved = experiment.approved, "experiment updated");
        Ok(experiment)
    }

    async fn apply_experiment_update(
        &self,
        conn: &libsql::Connection,
        id: &str,
        update: &ExperimentUpdate,
    ) -> Result<Experiment, DatabaseError> {
        let mut sets = Vec::new();
        let mut params: Vec<libsql::Value> = Vec::new();
        let mut idx = 1usize;

        if let Some(ref title) = update.title {
            sets.push(format!("title = ?{idx}"));
            params.push(title.clone().into());
            idx += 1;
        }
        if let Some(state) = update.state {
            sets.push(format!("state = ?{idx}"));
            params.push(state.as_str().into());
            idx += 1;
        }
        if let Some(approved) = update.approved {
            sets.push(format!("approved = ?{idx}"));
            params.push(i64::from(approved).into());
            idx += 1;
        }

        if !sets.is_empty() {
            params.push(id.into());
            let sql = format!("UPDATE experiments SET {} WHERE id = ?{idx}", sets.join(", "));
            let changed = conn.execute(&sql, libsql::params_from_iter(params)).await?;
            if changed == 0 {
                return Err(not_found("experiment", id));
            }
        }

        let experiment = fetch_experiment(conn, id)
            .await?
            .ok_or_else(|| not_found("experiment", id))?;

        let group_count = query_i64(
            conn,
            "SELECT COUNT(*) FROM target_groups WHERE experiment_id = ?1",
            [id],
        )
        .await?;
        if group_count == 0 {
            self.insert_default_group(conn, id).await?;
        }

        Ok(experiment)
    }

    /// Delete an experiment with its groups, sessions, data points, and counters.
    pub async fn delete_experiment(&self, id: &str) -> Result<(), DatabaseError> {
        let changed = self
            .db()
            .conn()
            .execute("DELETE FROM experiments WHERE id = ?1", [id])
            .await?;
        if changed == 0 {
            return Err(not_found("experiment", id));
        }
        tracing::info!(experiment_id = id, "experiment deleted");
        Ok(())
    }

    /// Status label for running experiments: the lifecycle, or
    /// `awaiting_approval` while staff approval is pending.
    pub async fn experiment_status(&self, id: &str) -> Result<MetadataResponse, DatabaseError> {
        let experiment = self.get_experiment(id).await?;
        Ok(MetadataResponse {
            state: experiment.display_state().to_string(),
        })
    }
}
