//! End-to-end allocation and sequencing behaviour against a file database.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use pretty_assertions::assert_eq;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;
use wds_config::WdsConfig;
use wds_core::entities::Experiment;
use wds_core::enums::{ExperimentState, SequenceCounter};
use wds_db::error::EngineError;
use wds_db::repos::group::NewGroup;
use wds_db::service::WdsService;
use wds_db::updates::experiment::ExperimentUpdateBuilder;

fn config_for(dir: &TempDir) -> WdsConfig {
    let mut config = WdsConfig::default();
    config.database.path = dir.path().join("store.db").to_string_lossy().into_owned();
    config
}

async fn service(dir: &TempDir) -> WdsService {
    WdsService::new_local(&config_for(dir)).await.unwrap()
}

async fn running(svc: &WdsService, state: ExperimentState, groups: &[(&str, i64)]) -> Experiment {
    let groups: Vec<_> = groups
        .iter()
        .map(|(name, target)| NewGroup::new(*name, *target))
        .collect();
    let experiment = svc.create_experiment("Experiment", &groups).await.unwrap();
    svc.update_experiment(
        &experiment.id,
        ExperimentUpdateBuilder::new()
            .state(state)
            .approved(true)
            .build(),
    )
    .await
    .unwrap()
}

async fn set_state(svc: &WdsService, experiment: &Experiment, state: ExperimentState) {
    svc.update_experiment(
        &experiment.id,
        ExperimentUpdateBuilder::new().state(state).build(),
    )
    .await
    .unwrap();
}

/// Admit one participant and return (group name, session token).
async fn admit(svc: &WdsService, experiment: &Experiment) -> (String, String) {
    let response = svc.create_participant(&experiment.id).await.unwrap();
    (response.group_name, response.session_token)
}

async fn completed_per_group(svc: &WdsService, experiment: &Experiment) -> BTreeMap<String, i64> {
    svc.group_stats(&experiment.id)
        .await
        .unwrap()
        .into_iter()
        .map(|s| (s.name, s.completed))
        .collect()
}

#[tokio::test]
async fn round_robin_without_completions() {
    let dir = TempDir::new().unwrap();
    let svc = service(&dir).await;
    let experiment = running(&svc, ExperimentState::Open, &[("A", 10), ("B", 10)]).await;

    let mut picks = Vec::new();
    for _ in 0..3 {
        picks.push(admit(&svc, &experiment).await.0);
    }
    assert_eq!(picks, vec!["A", "B", "A"]);
}

#[tokio::test]
async fn completion_triggers_rebalance() {
    let dir = TempDir::new().unwrap();
    let svc = service(&dir).await;
    let experiment = running(&svc, ExperimentState::Open, &[("A", 10), ("B", 10)]).await;

    let (g1, p1) = admit(&svc, &experiment).await;
    let (g2, _) = admit(&svc, &experiment).await;
    let (g3, _) = admit(&svc, &experiment).await;
    assert_eq!((g1.as_str(), g2.as_str(), g3.as_str()), ("A", "B", "A"));

    svc.complete_session(&p1).await.unwrap();
    let (g4, p4) = admit(&svc, &experiment).await;
    assert_eq!(g4, "B");

    svc.complete_session(&p4).await.unwrap();
    // A=1, B=1: ties go to the earlier group.
    let (g5, p5) = admit(&svc, &experiment).await;
    assert_eq!(g5, "A");
    svc.complete_session(&p5).await.unwrap();
    let (g6, _) = admit(&svc, &experiment).await;
    assert_eq!(g6, "B");
}

#[tokio::test]
async fn full_group_is_skipped() {
    let dir = TempDir::new().unwrap();
    let svc = service(&dir).await;
    let experiment =
        running(&svc, ExperimentState::Open, &[("A", 1), ("B", 5), ("C", 5)]).await;

    let (g1, p1) = admit(&svc, &experiment).await;
    assert_eq!(g1, "A");
    svc.complete_session(&p1).await.unwrap();

    let mut picks = Vec::new();
    for _ in 0..4 {
        picks.push(admit(&svc, &experiment).await.0);
    }
    assert_eq!(picks, vec!["B", "C", "B", "C"]);
}

#[tokio::test]
async fn all_groups_at_zero_target_is_not_open() {
    let dir = TempDir::new().unwrap();
    let svc = service(&dir).await;
    let experiment = running(&svc, ExperimentState::Open, &[("A", 0), ("B", 0)]).await;

    assert_eq!(svc.select_group(&experiment.id).await.unwrap(), None);
    assert!(!svc.accepts_new_participants(&experiment.id).await.unwrap());
    assert!(matches!(
        svc.create_participant(&experiment.id).await,
        Err(EngineError::NotOpen(_))
    ));
}

#[tokio::test]
async fn filling_every_group_closes_admission() {
    let dir = TempDir::new().unwrap();
    let svc = service(&dir).await;
    let experiment = running(&svc, ExperimentState::Open, &[("A", 1), ("B", 1)]).await;

    for _ in 0..2 {
        let (_, token) = admit(&svc, &experiment).await;
        svc.complete_session(&token).await.unwrap();
    }
    let err = svc.create_participant(&experiment.id).await.unwrap_err();
    assert!(matches!(err, EngineError::NotOpen(_)));
    assert_eq!(err.result_code().as_str(), "ERR_NOT_OPEN");
}

#[tokio::test]
async fn zero_groups_fail_assignment() {
    let dir = TempDir::new().unwrap();
    let svc = service(&dir).await;
    let experiment = running(&svc, ExperimentState::Open, &[]).await;
    let groups = svc.list_groups(&experiment.id).await.unwrap();
    svc.delete_group(&groups[0].id).await.unwrap();

    let err = svc.create_participant(&experiment.id).await.unwrap_err();
    assert!(matches!(err, EngineError::GroupAssignFail(_)));
    assert_eq!(err.result_code().as_str(), "ERR_GROUP_ASSIGN_FAIL");
}

#[tokio::test]
async fn pilot_completions_do_not_consume_open_capacity() {
    let dir = TempDir::new().unwrap();
    let svc = service(&dir).await;
    let experiment = running(&svc, ExperimentState::Piloting, &[("A", 1), ("B", 1)]).await;

    let (g1, p1) = admit(&svc, &experiment).await;
    assert_eq!(g1, "A");
    svc.complete_session(&p1).await.unwrap();
    let (g2, p2) = admit(&svc, &experiment).await;
    assert_eq!(g2, "B");
    svc.complete_session(&p2).await.unwrap();
    assert!(matches!(
        svc.create_participant(&experiment.id).await,
        Err(EngineError::NotOpen(_))
    ));

    set_state(&svc, &experiment, ExperimentState::Open).await;
    assert_eq!(
        svc.select_group(&experiment.id).await.unwrap().map(|g| g.name),
        Some("A".to_string())
    );
    let (g3, _) = admit(&svc, &experiment).await;
    assert_eq!(g3, "A");

    let stats = svc.group_stats(&experiment.id).await.unwrap();
    assert_eq!(
        stats.iter().map(|s| s.pilot_completed).collect::<Vec<_>>(),
        vec![1, 1]
    );
    assert_eq!(stats.iter().map(|s| s.completed).collect::<Vec<_>>(), vec![0, 0]);
}

#[tokio::test]
async fn open_completions_do_not_consume_pilot_capacity() {
    let dir = TempDir::new().unwrap();
    let svc = service(&dir).await;
    let experiment = running(&svc, ExperimentState::Open, &[("A", 1), ("B", 1)]).await;

    for _ in 0..2 {
        let (_, token) = admit(&svc, &experiment).await;
        svc.complete_session(&token).await.unwrap();
    }
    assert!(matches!(
        svc.create_participant(&experiment.id).await,
        Err(EngineError::NotOpen(_))
    ));

    set_state(&svc, &experiment, ExperimentState::Piloting).await;
    assert!(svc.accepts_new_participants(&experiment.id).await.unwrap());
    let (g1, p1) = admit(&svc, &experiment).await;
    assert_eq!(g1, "A");
    svc.complete_session(&p1).await.unwrap();
    let (g2, _) = admit(&svc, &experiment).await;
    assert_eq!(g2, "B");

    let stats = svc.group_stats(&experiment.id).await.unwrap();
    assert_eq!(stats.iter().map(|s| s.completed).collect::<Vec<_>>(), vec![1, 1]);
    assert_eq!(
        stats.iter().map(|s| s.pilot_completed).collect::<Vec<_>>(),
        vec![1, 0]
    );
}

#[tokio::test]
async fn skew_recovery_points_at_lagging_group() {
    let dir = TempDir::new().unwrap();
    let svc = service(&dir).await;
    let experiment = running(&svc, ExperimentState::Open, &[("A", 10), ("B", 10)]).await;

    let (_, p1) = admit(&svc, &experiment).await; // A
    let (_, p2) = admit(&svc, &experiment).await; // B
    let (_, p3) = admit(&svc, &experiment).await; // A
    let (_, p4) = admit(&svc, &experiment).await; // B

    svc.complete_session(&p1).await.unwrap();
    svc.complete_session(&p3).await.unwrap();
    assert_eq!(admit(&svc, &experiment).await.0, "B");

    // Round robin would now say A.
    svc.complete_session(&p2).await.unwrap();
    assert_eq!(admit(&svc, &experiment).await.0, "B");

    svc.complete_session(&p4).await.unwrap();
    assert_eq!(admit(&svc, &experiment).await.0, "A");
}

#[tokio::test]
async fn random_dropout_still_fills_every_group() {
    let dir = TempDir::new().unwrap();
    let svc = service(&dir).await;
    let experiment =
        running(&svc, ExperimentState::Open, &[("A", 12), ("B", 12), ("C", 12)]).await;
    let mut rng = StdRng::seed_from_u64(7);

    let mut admitted = 0;
    loop {
        match svc.create_participant(&experiment.id).await {
            Ok(response) => {
                admitted += 1;
                if rng.gen_bool(0.7) {
                    svc.complete_session(&response.session_token).await.unwrap();
                }
            }
            Err(EngineError::NotOpen(_)) => break,
            Err(other) => panic!("unexpected error: {other}"),
        }
        assert!(admitted < 500, "admission never closed");
    }

    let completed = completed_per_group(&svc, &experiment).await;
    assert_eq!(
        completed,
        BTreeMap::from([("A".into(), 12), ("B".into(), 12), ("C".into(), 12)])
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_admissions_get_distinct_subject_ids() {
    const N: i64 = 24;
    let dir = TempDir::new().unwrap();
    let svc = Arc::new(service(&dir).await);
    let experiment = running(&svc, ExperimentState::Open, &[("A", 100), ("B", 100)]).await;

    let mut handles = Vec::new();
    for _ in 0..N {
        let svc = Arc::clone(&svc);
        let experiment_id = experiment.id.clone();
        handles.push(tokio::spawn(async move {
            svc.create_participant(&experiment_id).await.unwrap()
        }));
    }

    let mut subject_ids = HashSet::new();
    let mut per_group: BTreeMap<String, i64> = BTreeMap::new();
    for handle in handles {
        let response = handle.await.unwrap();
        assert!(subject_ids.insert(response.subject_id));
        *per_group.entry(response.group_name).or_default() += 1;
    }
    assert_eq!(subject_ids, (1..=N).collect::<HashSet<_>>());
    // Serialized admission keeps strict alternation.
    assert_eq!(per_group, BTreeMap::from([("A".into(), N / 2), ("B".into(), N / 2)]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn separate_handles_on_one_file_do_not_collide() {
    const PER_HANDLE: usize = 10;
    let dir = TempDir::new().unwrap();
    let first = Arc::new(service(&dir).await);
    let second = Arc::new(service(&dir).await);
    let experiment = running(&first, ExperimentState::Open, &[("A", 100), ("B", 100)]).await;

    let mut handles = Vec::new();
    for svc in [&first, &second] {
        for _ in 0..PER_HANDLE {
            let svc = Arc::clone(svc);
            let experiment_id = experiment.id.clone();
            handles.push(tokio::spawn(async move {
                svc.create_participant(&experiment_id).await.unwrap().subject_id
            }));
        }
    }

    let mut subject_ids = HashSet::new();
    for handle in handles {
        assert!(subject_ids.insert(handle.await.unwrap()));
    }
    assert_eq!(subject_ids.len(), 2 * PER_HANDLE);
    assert_eq!(
        subject_ids.iter().copied().max(),
        Some(i64::try_from(2 * PER_HANDLE).unwrap())
    );
}

#[tokio::test]
async fn deleted_numbers_are_never_reused() {
    let dir = TempDir::new().unwrap();
    let svc = service(&dir).await;
    let experiment = running(&svc, ExperimentState::Open, &[]).await;

    for expected in 1..=3 {
        let response = svc.submit_legacy_data(&experiment.id, "payload").await.unwrap();
        assert_eq!(response.number, expected);
    }
    let points = svc.list_data_points(&experiment.id).await.unwrap();
    let removed = svc.delete_data_point(&points[2].id).await.unwrap();
    assert!(removed.is_some(), "the session of the last point goes too");
    assert_eq!(svc.list_sessions(&experiment.id).await.unwrap().len(), 2);

    let response = svc.submit_legacy_data(&experiment.id, "payload").await.unwrap();
    assert_eq!(response.number, 4);
    let subject_ids: Vec<_> = svc
        .list_sessions(&experiment.id)
        .await
        .unwrap()
        .into_iter()
        .map(|s| s.subject_id)
        .collect();
    assert_eq!(subject_ids, vec![1, 2, 4]);
    assert_eq!(
        svc.current_sequence(&experiment.id, SequenceCounter::SubjectId)
            .await
            .unwrap(),
        4
    );
}

#[tokio::test]
async fn admission_never_reuses_a_deleted_subject_id() {
    let dir = TempDir::new().unwrap();
    let svc = service(&dir).await;
    let experiment = running(&svc, ExperimentState::Open, &[("A", 10), ("B", 10)]).await;

    let mut issued = Vec::new();
    let mut last_token = String::new();
    for _ in 0..3 {
        let response = svc.create_participant(&experiment.id).await.unwrap();
        issued.push(response.subject_id);
        last_token = response.session_token;
    }
    assert_eq!(issued, vec![1, 2, 3]);

    // Removing the only data point of the highest subject removes its session.
    svc.submit_data(&experiment.id, &last_token, "payload")
        .await
        .unwrap();
    let points = svc.list_data_points(&experiment.id).await.unwrap();
    assert_eq!(points.len(), 1);
    assert!(svc.delete_data_point(&points[0].id).await.unwrap().is_some());
    assert!(svc.get_session_by_token(&last_token).await.is_err());

    let next = svc.create_participant(&experiment.id).await.unwrap();
    assert!(issued.iter().all(|&id| next.subject_id > id));
    assert_eq!(next.subject_id, 4);

    let upload = svc
        .submit_data(&experiment.id, &next.session_token, "payload")
        .await
        .unwrap();
    assert_eq!(upload.number, 2, "data-point numbers skip the deleted one too");
}

#[tokio::test]
async fn data_point_numbers_are_per_experiment() {
    let dir = TempDir::new().unwrap();
    let svc = service(&dir).await;
    let first = running(&svc, ExperimentState::Open, &[("A", 5), ("B", 5)]).await;
    let second = running(&svc, ExperimentState::Open, &[("A", 5), ("B", 5)]).await;

    let (_, t1) = admit(&svc, &first).await;
    let (_, t2) = admit(&svc, &second).await;
    let numbers = [
        svc.submit_data(&first.id, &t1, "a").await.unwrap().number,
        svc.submit_data(&second.id, &t2, "b").await.unwrap().number,
        svc.submit_data(&first.id, &t1, "c").await.unwrap().number,
    ];
    assert_eq!(numbers, [1, 1, 2]);

    let (_, t3) = admit(&svc, &first).await;
    assert_eq!(
        svc.get_session_by_token(&t3).await.unwrap().subject_id,
        2,
        "subject ids are independent of data-point numbers"
    );
}

#[tokio::test]
async fn deleting_experiment_removes_everything() {
    let dir = TempDir::new().unwrap();
    let svc = service(&dir).await;
    let experiment = running(&svc, ExperimentState::Open, &[("A", 5), ("B", 5)]).await;
    let (_, token) = admit(&svc, &experiment).await;
    svc.submit_data(&experiment.id, &token, "x").await.unwrap();

    svc.delete_experiment(&experiment.id).await.unwrap();
    assert!(svc.list_sessions(&experiment.id).await.unwrap().is_empty());
    assert!(svc.list_data_points(&experiment.id).await.unwrap().is_empty());
    assert!(svc.list_groups(&experiment.id).await.unwrap().is_empty());
    assert_eq!(
        svc.current_sequence(&experiment.id, SequenceCounter::SubjectId)
            .await
            .unwrap(),
        0
    );
}
