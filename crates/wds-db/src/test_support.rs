//! Shared test utilities for wds-db unit tests.

pub(crate) mod helpers {
    use tempfile::TempDir;
    use wds_config::WdsConfig;
    use wds_core::entities::{Experiment, TargetGroup};
    use wds_core::enums::ExperimentState;

    use crate::WdsDb;
    use crate::repos::group::NewGroup;
    use crate::service::WdsService;
    use crate::updates::experiment::ExperimentUpdateBuilder;

    /// Install a fmt subscriber filtered by `WDS_LOG` (once per test binary).
    pub fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_env("WDS_LOG"))
            .with_test_writer()
            .try_init();
    }

    /// Open a fresh database file inside a temp dir. Keep the dir alive.
    pub async fn test_db() -> (WdsDb, TempDir) {
        init_tracing();
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.db");
        let db = WdsDb::open_local(path.to_str().unwrap()).await.unwrap();
        (db, dir)
    }

    /// Service over a fresh database with default configuration.
    pub async fn test_service() -> (WdsService, TempDir) {
        let (db, dir) = test_db().await;
        (WdsService::from_db(db, &WdsConfig::default()), dir)
    }

    pub fn group(name: &str, completion_target: i64) -> NewGroup {
        NewGroup::new(name, completion_target)
    }

    /// Create an approved experiment in `state` with the given groups.
    pub async fn running_experiment(
        svc: &WdsService,
        state: ExperimentState,
        groups: &[NewGroup],
    ) -> (Experiment, Vec<TargetGroup>) {
        let experiment = svc
            .create_experiment("Test experiment", groups)
            .await
            .unwrap();
        let experiment = svc
            .update_experiment(
                &experiment.id,
                ExperimentUpdateBuilder::new()
                    .state(state)
                    .approved(true)
                    .build(),
            )
            .await
            .unwrap();
        let groups = svc.list_groups(&experiment.id).await.unwrap();
        (experiment, groups)
    }
}
