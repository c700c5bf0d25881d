//! Admission, completion, and upload operations.
//!
//! Every operation here runs under the experiment lock inside one `IMMEDIATE`
//! transaction, and the whole unit is retried on transient conflicts. Group
//! selection, sequence assignment, and the dependent insert therefore see and
//! produce one consistent state.

use wds_core::entities::{Experiment, ParticipantSession};
use wds_core::enums::{ExperimentState, SequenceCounter, SessionState};
use wds_core::errors::CoreError;
use wds_core::responses::{ParticipantCreateResponse, ResultCode, UploadResponse};

use crate::engine::allocation::select_group_in;
use crate::engine::gate::accepts_new_participant;
use crate::engine::group_state::load_group_states;
use crate::error::{DatabaseError, EngineError};
use crate::finish_tx;
use crate::helpers::now;
use crate::repos::data_point::insert_data_point;
use crate::repos::experiment::fetch_experiment;
use crate::repos::group::fetch_groups;
use crate::repos::sequence::next_in;
use crate::repos::session::{
    fetch_session_by_token, insert_session, mark_completed, mark_rejected,
};
use crate::retry::with_retry;
use crate::service::WdsService;

const UPLOAD_OK: &str = "Upload successful";

async fn load_experiment(
    conn: &libsql::Connection,
    experiment_id: &str,
) -> Result<Experiment, EngineError> {
    fetch_experiment(conn, experiment_id)
        .await?
        .ok_or_else(|| EngineError::UnknownExperiment(experiment_id.to_string()))
}

fn invalid_transition(session: &ParticipantSession, to: SessionState) -> EngineError {
    EngineError::Core(CoreError::InvalidTransition {
        entity_type: "participant_session".into(),
        id: session.id.clone(),
        from: session.state.to_string(),
        to: to.to_string(),
    })
}

/// Gate, select, number, insert.
async fn admit(
    conn: &libsql::Connection,
    experiment_id: &str,
) -> Result<(ParticipantSession, String), EngineError> {
    let experiment = load_experiment(conn, experiment_id).await?;
    let (groups, chosen) = select_group_in(conn, &experiment).await?;

    if !accepts_new_participant(&experiment, &groups) {
        return Err(EngineError::NotOpen(experiment.id));
    }

    let group = match groups.as_slice() {
        [only] => only.group.clone(),
        _ => {
            chosen
                .ok_or_else(|| EngineError::GroupAssignFail(experiment.id.clone()))?
                .group
        }
    };

    let subject_id = next_in(conn, &experiment.id, SequenceCounter::SubjectId).await?;
    let session = insert_session(
        conn,
        &experiment.id,
        &group.id,
        subject_id,
        experiment.state,
        now(),
    )
    .await?;
    Ok((session, group.name))
}

/// Started → Completed, stamping the lifecycle at completion. Completing a
/// completed session changes nothing.
async fn complete_in(
    conn: &libsql::Connection,
    mut session: ParticipantSession,
    lifecycle: ExperimentState,
) -> Result<ParticipantSession, EngineError> {
    match session.state {
        SessionState::Completed => {
            tracing::debug!(session_id = %session.id, "session already completed");
            Ok(session)
        }
        state if state.can_transition_to(SessionState::Completed) => {
            let at = now();
            if mark_completed(conn, &session.id, lifecycle, at).await? != 1 {
                return Err(DatabaseError::InvalidState(format!(
                    "session {} changed state during completion",
                    session.id
                ))
                .into());
            }
            session.state = SessionState::Completed;
            session.experiment_state_at_completion = Some(lifecycle);
            session.date_updated = at;
            Ok(session)
        }
        _ => Err(invalid_transition(&session, SessionState::Completed)),
    }
}

async fn reject_in(
    conn: &libsql::Connection,
    mut session: ParticipantSession,
) -> Result<ParticipantSession, EngineError> {
    match session.state {
        SessionState::Rejected => Ok(session),
        state if state.can_transition_to(SessionState::Rejected) => {
            let at = now();
            if mark_rejected(conn, &session.id, at).await? != 1 {
                return Err(DatabaseError::InvalidState(format!(
                    "session {} changed state during rejection",
                    session.id
                ))
                .into());
            }
            session.state = SessionState::Rejected;
            session.date_updated = at;
            Ok(session)
        }
        _ => Err(invalid_transition(&session, SessionState::Rejected)),
    }
}

async fn upload_to_session(
    conn: &libsql::Connection,
    experiment_id: &str,
    token: &str,
    payload: &str,
) -> Result<i64, EngineError> {
    let experiment = load_experiment(conn, experiment_id).await?;
    if !experiment.lifecycle_accepts() {
        return Err(EngineError::NotOpen(experiment.id));
    }
    if fetch_groups(conn, &experiment.id).await?.len() <= 1 {
        return Err(EngineError::SessionsNotUsed(experiment.id));
    }

    let session = fetch_session_by_token(conn, token)
        .await?
        .filter(|s| s.experiment_id == experiment.id)
        .ok_or(EngineError::SessionNotFound)?;

    let number = next_in(conn, &experiment.id, SequenceCounter::DataPointNumber).await?;
    insert_data_point(conn, &experiment.id, Some(&session.id), number, payload, now()).await?;
    complete_in(conn, session, experiment.state).await?;
    Ok(number)
}

async fn upload_without_session(
    conn: &libsql::Connection,
    experiment_id: &str,
    payload: &str,
) -> Result<i64, EngineError> {
    let experiment = load_experiment(conn, experiment_id).await?;
    let groups = load_group_states(conn, &experiment.id, experiment.state).await?;
    if !accepts_new_participant(&experiment, &groups) {
        return Err(EngineError::NotOpen(experiment.id));
    }
    let group = match groups.as_slice() {
        [] => return Err(EngineError::GroupAssignFail(experiment.id)),
        [only] => &only.group,
        _ => return Err(EngineError::SessionRequired(experiment.id)),
    };

    let subject_id = next_in(conn, &experiment.id, SequenceCounter::SubjectId).await?;
    let session = insert_session(
        conn,
        &experiment.id,
        &group.id,
        subject_id,
        experiment.state,
        now(),
    )
    .await?;
    let session = complete_in(conn, session, experiment.state).await?;

    let number = next_in(conn, &experiment.id, SequenceCounter::DataPointNumber).await?;
    insert_data_point(conn, &experiment.id, Some(&session.id), number, payload, now()).await?;
    Ok(number)
}

fn upload_ok(number: i64) -> UploadResponse {
    UploadResponse {
        result: ResultCode::Ok,
        message: UPLOAD_OK.to_string(),
        number,
    }
}

impl WdsService {
    /// Refuse unknown experiment ids before they reach the lock registry.
    /// The transaction loads the experiment again under the lock.
    async fn ensure_experiment(&self, experiment_id: &str) -> Result<(), EngineError> {
        load_experiment(self.db().conn(), experiment_id)
            .await
            .map(drop)
            .inspect_err(|error| {
                tracing::warn!(experiment_id, %error, "request for unknown experiment");
            })
    }

    /// Admit a new participant: pick a group, assign the next subject id, and
    /// start a session.
    ///
    /// # Errors
    ///
    /// - `EngineError::UnknownExperiment` if the experiment does not exist
    /// - `EngineError::NotOpen` if the gate refuses (this includes every group
    ///   being full)
    /// - `EngineError::GroupAssignFail` if the gate passes but the experiment
    ///   has no group
    /// - `EngineError::Transient` if conflicts persist through every retry
    pub async fn create_participant(
        &self,
        experiment_id: &str,
    ) -> Result<ParticipantCreateResponse, EngineError> {
        self.ensure_experiment(experiment_id).await?;
        let (session, group_name) =
            with_retry(self.retry_policy(), "create_participant", move || async move {
                let _guard = self.locks().acquire(experiment_id).await?;
                let tx = self.begin_write().await?;
                let result = admit(&tx, experiment_id).await;
                finish_tx(tx, result).await
            })
            .await
            .inspect_err(|error| {
                tracing::warn!(experiment_id, %error, "participant refused");
            })?;

        tracing::info!(
            experiment_id,
            session_id = %session.id,
            subject_id = session.subject_id,
            group = %group_name,
            "participant admitted"
        );
        Ok(ParticipantCreateResponse {
            session_token: session.token,
            state: session.state,
            group_name,
            subject_id: session.subject_id,
        })
    }

    /// Mark a session completed. Idempotent for completed sessions.
    ///
    /// # Errors
    ///
    /// - `EngineError::SessionNotFound` for an unknown token
    /// - `EngineError::Core(CoreError::InvalidTransition)` for a rejected session
    pub async fn complete_session(&self, token: &str) -> Result<ParticipantSession, EngineError> {
        let experiment_id = self.session_experiment(token).await?;
        let experiment_id = experiment_id.as_str();

        let session = with_retry(self.retry_policy(), "complete_session", move || async move {
            let _guard = self.locks().acquire(experiment_id).await?;
            let tx = self.begin_write().await?;
            let result: Result<ParticipantSession, EngineError> = async {
                let session = fetch_session_by_token(&tx, token)
                    .await?
                    .ok_or(EngineError::SessionNotFound)?;
                let experiment = load_experiment(&tx, &session.experiment_id).await?;
                complete_in(&tx, session, experiment.state).await
            }
            .await;
            finish_tx(tx, result).await
        })
        .await?;

        tracing::info!(
            experiment_id,
            session_id = %session.id,
            lifecycle = ?session.experiment_state_at_completion,
            "session completed"
        );
        Ok(session)
    }

    /// Moderation hook: mark a started session rejected. Idempotent for
    /// rejected sessions.
    ///
    /// # Errors
    ///
    /// - `EngineError::SessionNotFound` for an unknown token
    /// - `EngineError::Core(CoreError::InvalidTransition)` for a completed session
    pub async fn reject_session(&self, token: &str) -> Result<ParticipantSession, EngineError> {
        let experiment_id = self.session_experiment(token).await?;
        let experiment_id = experiment_id.as_str();

        let session = with_retry(self.retry_policy(), "reject_session", move || async move {
            let _guard = self.locks().acquire(experiment_id).await?;
            let tx = self.begin_write().await?;
            let result: Result<ParticipantSession, EngineError> = async {
                let session = fetch_session_by_token(&tx, token)
                    .await?
                    .ok_or(EngineError::SessionNotFound)?;
                reject_in(&tx, session).await
            }
            .await;
            finish_tx(tx, result).await
        })
        .await?;

        tracing::info!(experiment_id, session_id = %session.id, "session rejected");
        Ok(session)
    }

    /// Store an upload for an admitted participant and complete their session.
    ///
    /// # Errors
    ///
    /// - `EngineError::NoData` for an empty payload
    /// - `EngineError::NotOpen` if the experiment is unapproved or not running
    /// - `EngineError::SessionsNotUsed` if the experiment has at most one group
    /// - `EngineError::SessionNotFound` for a token unknown to this experiment
    pub async fn submit_data(
        &self,
        experiment_id: &str,
        token: &str,
        payload: &str,
    ) -> Result<UploadResponse, EngineError> {
        if payload.is_empty() {
            return Err(EngineError::NoData);
        }
        self.ensure_experiment(experiment_id).await?;
        let number = with_retry(self.retry_policy(), "submit_data", move || async move {
            let _guard = self.locks().acquire(experiment_id).await?;
            let tx = self.begin_write().await?;
            let result = upload_to_session(&tx, experiment_id, token, payload).await;
            finish_tx(tx, result).await
        })
        .await
        .inspect_err(|error| {
            tracing::warn!(experiment_id, %error, "upload refused");
        })?;

        tracing::info!(experiment_id, number, size = payload.len(), "data point stored");
        Ok(upload_ok(number))
    }

    /// Store an upload for an experiment running without sessions. A session
    /// is created in the sole group and completed on the spot.
    ///
    /// # Errors
    ///
    /// - `EngineError::NoData` for an empty payload
    /// - `EngineError::NotOpen` if the experiment is unapproved or not running
    /// - `EngineError::SessionRequired` if the experiment balances several groups
    /// - `EngineError::GroupAssignFail` if the experiment has no group
    pub async fn submit_legacy_data(
        &self,
        experiment_id: &str,
        payload: &str,
    ) -> Result<UploadResponse, EngineError> {
        if payload.is_empty() {
            return Err(EngineError::NoData);
        }
        self.ensure_experiment(experiment_id).await?;
        let number = with_retry(self.retry_policy(), "submit_legacy_data", move || async move {
            let _guard = self.locks().acquire(experiment_id).await?;
            let tx = self.begin_write().await?;
            let result = upload_without_session(&tx, experiment_id, payload).await;
            finish_tx(tx, result).await
        })
        .await
        .inspect_err(|error| {
            tracing::warn!(experiment_id, %error, "upload refused");
        })?;

        tracing::info!(experiment_id, number, size = payload.len(), "data point stored");
        Ok(upload_ok(number))
    }

    async fn session_experiment(&self, token: &str) -> Result<String, EngineError> {
        fetch_session_by_token(self.db().conn(), token)
            .await?
            .map(|s| s.experiment_id)
            .ok_or(EngineError::SessionNotFound)
    }
}
