//! Data point repository.
//!
//! Payloads are stored exactly as received. Deleting a session's last data
//! point deletes the session too.

use chrono::{DateTime, Utc};
use wds_core::entities::DataPoint;
use wds_core::ids::PREFIX_DATA_POINT;

use crate::error::DatabaseError;
use crate::helpers::{format_timestamp, get_opt_string, parse_datetime};
use crate::repos::{not_found, query_i64};
use crate::service::WdsService;
use crate::{finish_tx, generate_id_on};

const SELECT_COLS: &str = "id, experiment_id, session_id, number, payload, size, created_at";

fn row_to_data_point(row: &libsql::Row) -> Result<DataPoint, DatabaseError> {
    Ok(DataPoint {
        id: row.get(0)?,
        experiment_id: row.get(1)?,
        session_id: get_opt_string(row, 2)?,
        number: row.get(3)?,
        payload: row.get(4)?,
        size: row.get(5)?,
        created_at: parse_datetime(&row.get::<String>(6)?)?,
    })
}

async fn fetch_data_point(
    conn: &libsql::Connection,
    id: &str,
) -> Result<Option<DataPoint>, DatabaseError> {
    let mut rows = conn
        .query(
            &format!("SELECT {SELECT_COLS} FROM data_points WHERE id = ?1"),
            [id],
        )
        .await?;
    rows.next()
        .await?
        .map(|row| row_to_data_point(&row))
        .transpose()
}

pub(crate) async fn insert_data_point(
    conn: &libsql::Connection,
    experiment_id: &str,
    session_id: Option<&str>,
    number: i64,
    payload: &str,
    created_at: DateTime<Utc>,
) -> Result<DataPoint, DatabaseError> {
    let id = generate_id_on(conn, PREFIX_DATA_POINT).await?;
    let size = i64::try_from(payload.len())
        .map_err(|e| DatabaseError::InvalidState(format!("payload too large: {e}")))?;

    conn.execute(
        &format!("INSERT INTO data_points ({SELECT_COLS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"),
        libsql::params![
            id.as_str(),
            experiment_id,
            session_id,
            number,
            payload,
            size,
            format_timestamp(&created_at)
        ],
    )
    .await?;

    Ok(DataPoint {
        id,
        experiment_id: experiment_id.to_string(),
        session_id: session_id.map(String::from),
        number,
        payload: payload.to_string(),
        size,
        created_at,
    })
}

impl WdsService {
    pub async fn get_data_point(&self, id: &str) -> Result<DataPoint, DatabaseError> {
        fetch_data_point(self.db().conn(), id)
            .await?
            .ok_or_else(|| not_found("data_point", id))
    }

    /// Data points of an experiment ordered by number.
    pub async fn list_data_points(&self, experiment_id: &str) -> Result<Vec<DataPoint>, DatabaseError> {
        let mut rows = self
            .db()
            .conn()
            .query(
                &format!(
                    "SELECT {SELECT_COLS} FROM data_points WHERE experiment_id = ?1 ORDER BY number"
                ),
                [experiment_id],
            )
            .await?;
        let mut points = Vec::new();
        while let Some(row) = rows.next().await? {
            points.push(row_to_data_point(&row)?);
        }
        Ok(points)
    }

    /// Delete a data point. If it was its session's last one, the session is
    /// deleted as well and its id returned.
    pub async fn delete_data_point(&self, id: &str) -> Result<Option<String>, DatabaseError> {
        let tx = self.begin_write().await?;
        let result: Result<Option<String>, DatabaseError> = async {
            let point = fetch_data_point(&tx, id)
                .await?
                .ok_or_else(|| not_found("data_point", id))?;
            tx.execute("DELETE FROM data_points WHERE id = ?1", [id])
                .await?;

            let Some(session_id) = point.session_id else {
                return Ok(None);
            };
            let remaining = query_i64(
                &tx,
                "SELECT COUNT(*) FROM data_points WHERE session_id = ?1",
                [session_id.as_str()],
            )
            .await?;
            if remaining > 0 {
                return Ok(None);
            }
            tx.execute(
                "DELETE FROM participant_sessions WHERE id = ?1",
                [session_id.as_str()],
            )
            .await?;
            Ok(Some(session_id))
        }
        .await;

        let removed_session = finish_tx(tx, result).await?;
        tracing::info!(data_point_id = id, removed_session = ?removed_session, "data point deleted");
        Ok(removed_session)
    }
}
