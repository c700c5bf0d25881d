//! Participant session repository.
//!
//! Sessions are created and transitioned by the admission engine; this module
//! holds the SQL and the read-side service methods.

use chrono::{DateTime, Utc};
use wds_core::entities::ParticipantSession;
use wds_core::enums::{ExperimentState, SessionState};
use wds_core::ids::PREFIX_SESSION;

use crate::error::DatabaseError;
use crate::helpers::{format_timestamp, parse_datetime, parse_enum, parse_optional_enum};
use crate::repos::not_found;
use crate::service::WdsService;
use crate::{generate_id_on, generate_token_on};

const SELECT_COLS: &str = "id, token, experiment_id, group_id, state, subject_id, \
     experiment_state_at_creation, experiment_state_at_completion, date_started, date_updated";

fn row_to_session(row: &libsql::Row) -> Result<ParticipantSession, DatabaseError> {
    Ok(ParticipantSession {
        id: row.get(0)?,
        token: row.get(1)?,
        experiment_id: row.get(2)?,
        group_id: row.get(3)?,
        state: parse_enum(&row.get::<String>(4)?)?,
        subject_id: row.get(5)?,
        experiment_state_at_creation: parse_enum(&row.get::<String>(6)?)?,
        experiment_state_at_completion: parse_optional_enum(
            row.get::<Option<String>>(7)?.as_deref(),
        )?,
        date_started: parse_datetime(&row.get::<String>(8)?)?,
        date_updated: parse_datetime(&row.get::<String>(9)?)?,
    })
}

async fn fetch_one(
    conn: &libsql::Connection,
    column: &str,
    value: &str,
) -> Result<Option<ParticipantSession>, DatabaseError> {
    let mut rows = conn
        .query(
            &format!("SELECT {SELECT_COLS} FROM participant_sessions WHERE {column} = ?1"),
            [value],
        )
        .await?;
    rows.next().await?.map(|row| row_to_session(&row)).transpose()
}

pub(crate) async fn fetch_session_by_token(
    conn: &libsql::Connection,
    token: &str,
) -> Result<Option<ParticipantSession>, DatabaseError> {
    fetch_one(conn, "token", token).await
}

pub(crate) async fn fetch_session(
    conn: &libsql::Connection,
    id: &str,
) -> Result<Option<ParticipantSession>, DatabaseError> {
    fetch_one(conn, "id", id).await
}

/// Insert a `started` session with a fresh id and token.
pub(crate) async fn insert_session(
    conn: &libsql::Connection,
    experiment_id: &str,
    group_id: &str,
    subject_id: i64,
    lifecycle: ExperimentState,
    started_at: DateTime<Utc>,
) -> Result<ParticipantSession, DatabaseError> {
    let id = generate_id_on(conn, PREFIX_SESSION).await?;
    let token = generate_token_on(conn).await?;
    let ts = format_timestamp(&started_at);

    conn.execute(
        "INSERT INTO participant_sessions
             (id, token, experiment_id, group_id, state, subject_id,
              experiment_state_at_creation, date_started, date_updated)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        libsql::params![
            id.as_str(),
            token.as_str(),
            experiment_id,
            group_id,
            SessionState::Started.as_str(),
            subject_id,
            lifecycle.as_str(),
            ts.as_str(),
            ts.as_str()
        ],
    )
    .await?;

    Ok(ParticipantSession {
        id,
        token,
        experiment_id: experiment_id.to_string(),
        group_id: group_id.to_string(),
        state: SessionState::Started,
        subject_id,
        experiment_state_at_creation: lifecycle,
        experiment_state_at_completion: None,
        date_started: started_at,
        date_updated: started_at,
    })
}

/// Move a `started` session to `completed`, stamping the completion snapshot.
/// Returns the number of rows changed (0 if the session was not `started`).
pub(crate) async fn mark_completed(
    conn: &libsql::Connection,
    id: &str,
    lifecycle: ExperimentState,
    at: DateTime<Utc>,
) -> Result<u64, DatabaseError> {
    Ok(conn
        .execute(
            "UPDATE participant_sessions
             SET state = 'completed', experiment_state_at_completion = ?2, date_updated = ?3
             WHERE id = ?1 AND state = 'started'",
            libsql::params![id, lifecycle.as_str(), format_timestamp(&at)],
        )
        .await?)
}

/// Move a `started` session to `rejected`. Returns the number of rows changed.
pub(crate) async fn mark_rejected(
    conn: &libsql::Connection,
    id: &str,
    at: DateTime<Utc>,
) -> Result<u64, DatabaseError> {
    Ok(conn
        .execute(
            "UPDATE participant_sessions SET state = 'rejected', date_updated = ?2
             WHERE id = ?1 AND state = 'started'",
            libsql::params![id, format_timestamp(&at)],
        )
        .await?)
}

/// Most recently started session created under `lifecycle`: its group and start.
pub(crate) async fn latest_started(
    conn: &libsql::Connection,
    experiment_id: &str,
    lifecycle: ExperimentState,
) -> Result<Option<(String, DateTime<Utc>)>, DatabaseError> {
    let mut rows = conn
        .query(
            "SELECT group_id, date_started FROM participant_sessions
             WHERE experiment_id = ?1 AND experiment_state_at_creation = ?2
             ORDER BY date_started DESC, subject_id DESC LIMIT 1",
            libsql::params![experiment_id, lifecycle.as_str()],
        )
        .await?;
    match rows.next().await? {
        Some(row) => Ok(Some((
            row.get::<String>(0)?,
            parse_datetime(&row.get::<String>(1)?)?,
        ))),
        None => Ok(None),
    }
}

/// Time of the most recent completion whose snapshot equals `lifecycle`.
pub(crate) async fn latest_completed(
    conn: &libsql::Connection,
    experiment_id: &str,
    lifecycle: ExperimentState,
) -> Result<Option<DateTime<Utc>>, DatabaseError> {
    let mut rows = conn
        .query(
            "SELECT date_updated FROM participant_sessions
             WHERE experiment_id = ?1 AND state = 'completed'
               AND experiment_state_at_completion = ?2
             ORDER BY date_updated DESC LIMIT 1",
            libsql::params![experiment_id, lifecycle.as_str()],
        )
        .await?;
    match rows.next().await? {
        Some(row) => Ok(Some(parse_datetime(&row.get::<String>(0)?)?)),
        None => Ok(None),
    }
}

impl WdsService {
    pub async fn get_session(&self, id: &str) -> Result<ParticipantSession, DatabaseError> {
        fetch_session(self.db().conn(), id)
            .await?
            .ok_or_else(|| not_found("participant_session", id))
    }

    pub async fn get_session_by_token(
        &self,
        token: &str,
    ) -> Result<ParticipantSession, DatabaseError> {
        fetch_session_by_token(self.db().conn(), token)
            .await?
            .ok_or_else(|| not_found("participant_session", token))
    }

    /// Sessions of an experiment ordered by subject id.
    pub async fn list_sessions(
        &self,
        experiment_id: &str,
    ) -> Result<Vec<ParticipantSession>, DatabaseError> {
        let mut rows = self
            .db()
            .conn()
            .query(
                &format!(
                    "SELECT {SELECT_COLS} FROM participant_sessions
                     WHERE experiment_id = ?1 ORDER BY subject_id"
                ),
                [experiment_id],
            )
            .await?;
        let mut sessions = Vec::new();
        while let Some(row) = rows.next().await? {
            sessions.push(row_to_session(&row)?);
        }
        Ok(sessions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    use crate::helpers::now;
    use crate::test_support::helpers::test_service;

    #[tokio::test]
    async fn insert_and_transition() {
        let (svc, _dir) = test_service().await;
        let experiment = svc.create_experiment("Sessions", &[]).await.unwrap();
        let group = &svc.list_groups(&experiment.id).await.unwrap()[0];
        let conn = svc.db().conn();

        let session = insert_session(conn, &experiment.id, &group.id, 1, ExperimentState::Open, now())
            .await
            .unwrap();
        assert!(session.id.starts_with("ses-"));
        assert_eq!(svc.get_session_by_token(&session.token).await.unwrap(), session);

        assert_eq!(mark_completed(conn, &session.id, ExperimentState::Open, now()).await.unwrap(), 1);
        assert_eq!(mark_completed(conn, &session.id, ExperimentState::Open, now()).await.unwrap(), 0);
        assert_eq!(mark_rejected(conn, &session.id, now()).await.unwrap(), 0);

        let completed = svc.get_session(&session.id).await.unwrap();
        assert_eq!(completed.state, SessionState::Completed);
        assert_eq!(
            completed.experiment_state_at_completion,
            Some(ExperimentState::Open)
        );
        assert!(completed.date_updated > completed.date_started);
    }

    #[tokio::test]
    async fn history_is_scoped_to_lifecycle() {
        let (svc, _dir) = test_service().await;
        let experiment = svc.create_experiment("History", &[]).await.unwrap();
        let group = &svc.list_groups(&experiment.id).await.unwrap()[0];
        let conn = svc.db().conn();

        let pilot = insert_session(conn, &experiment.id, &group.id, 1, ExperimentState::Piloting, now())
            .await
            .unwrap();
        mark_completed(conn, &pilot.id, ExperimentState::Piloting, now())
            .await
            .unwrap();

        assert!(latest_started(conn, &experiment.id, ExperimentState::Open).await.unwrap().is_none());
        assert!(latest_completed(conn, &experiment.id, ExperimentState::Open).await.unwrap().is_none());

        let (group_id, started) = latest_started(conn, &experiment.id, ExperimentState::Piloting)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(group_id, group.id);
        assert_eq!(started, pilot.date_started);
        assert!(latest_completed(conn, &experiment.id, ExperimentState::Piloting).await.unwrap().is_some());
    }
}
