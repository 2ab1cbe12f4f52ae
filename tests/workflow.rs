//! End-to-end missions with the offline backends.

use std::collections::HashSet;

use mission_kernel::config::Config;
use mission_kernel::ledger::{Ledger, LedgerBackend, LedgerEventKind};
use mission_kernel::mission::{ManifestStore, Phase};
use mission_kernel::task::TaskStatus;
use mission_kernel::{ExecutionMode, Runtime};

fn config(dir: &std::path::Path, auto_approve: bool) -> Config {
    let mut config = Config::new(dir.join("data"));
    config.ledger_backend = LedgerBackend::Sqlite;
    config.auto_approve = auto_approve;
    config
}

#[tokio::test]
async fn offline_mission_reaches_maintenance() {
    let dir = tempfile::tempdir().unwrap();
    let project = dir.path().join("project");
    let runtime = Runtime::boot(config(dir.path(), true), ExecutionMode::Offline)
        .await
        .unwrap();

    let mut mission = runtime.start_mission("add login", project.clone()).await.unwrap();
    assert_eq!(mission.run_to_end().await.unwrap(), Phase::Maintenance);

    let manifest = mission.manifest();
    for name in ["mission_brief", "plan", "changeset", "test_report", "deployment_record"] {
        let artifact = &manifest.artifacts[name];
        assert!(
            std::path::Path::new(&artifact.location).exists(),
            "{} should exist at {}",
            name,
            artifact.location
        );
    }
    assert_eq!(manifest.artifacts["test_report"].attributes["passed"], true);
    assert_eq!(
        manifest.artifacts["plan"].attributes["steps"].as_array().unwrap().len(),
        5
    );
    assert!(project.join(".mission/artifacts/plan.md").exists());

    // The stored manifest is archived and matches the in-memory one.
    let store = &runtime.services().store;
    assert!(store.is_archived(&manifest.mission_id).await.unwrap());
    let stored = store.load(&manifest.mission_id).await.unwrap().unwrap();
    assert_eq!(&stored, manifest);

    // Gap-free ledger, every task closed, one DELEGATED per delegating phase.
    let entries = runtime.kernel().ledger().read_since(0).await.unwrap();
    for (idx, entry) in entries.iter().enumerate() {
        assert_eq!(entry.sequence, idx as u64 + 1);
    }
    let delegated = entries
        .iter()
        .filter(|e| e.kind == LedgerEventKind::Delegated)
        .count();
    assert_eq!(delegated, 4);

    let tasks = runtime.kernel().tasks().await;
    assert_eq!(tasks.len(), 9);
    assert!(tasks.iter().all(|t| t.status() == &TaskStatus::Succeeded));
    let ids: HashSet<_> = tasks.iter().map(|t| t.id()).collect();
    for id in ids {
        let kinds: Vec<_> = runtime
            .kernel()
            .ledger()
            .entries_for(id)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.kind)
            .filter(|k| *k != LedgerEventKind::Delegated)
            .collect();
        assert_eq!(
            kinds,
            vec![
                LedgerEventKind::Submitted,
                LedgerEventKind::Started,
                LedgerEventKind::Completed
            ]
        );
    }
}

#[tokio::test]
async fn mission_waits_for_deployment_sign_off_and_resumes() {
    let dir = tempfile::tempdir().unwrap();
    let project = dir.path().join("project");
    let mission_id = {
        let runtime = Runtime::boot(config(dir.path(), false), ExecutionMode::Offline)
            .await
            .unwrap();
        let mut mission = runtime.start_mission("add login", project).await.unwrap();
        assert_eq!(mission.run_to_end().await.unwrap(), Phase::AwaitingApproval);
        assert_eq!(mission.manifest().paused_phase, Some(Phase::Deployment));
        mission.manifest().mission_id.clone()
    };

    // A new process sees the paused mission and the earlier ledger.
    let runtime = Runtime::boot(config(dir.path(), false), ExecutionMode::Offline)
        .await
        .unwrap();
    assert!(runtime.kernel().ledger().head().await.unwrap() > 0);

    let mut mission = runtime.resume_mission(&mission_id).await.unwrap();
    assert_eq!(mission.phase(), Phase::AwaitingApproval);
    assert!(mission.request_transition(Phase::Failed).await.is_err());
    assert_eq!(
        mission.request_transition(Phase::Maintenance).await.unwrap(),
        Phase::Maintenance
    );
    assert_eq!(
        mission.manifest().history.last().map(|t| t.from),
        Some(Phase::AwaitingApproval)
    );
}

#[tokio::test]
async fn unknown_mission_lists_known_ids() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = Runtime::boot(config(dir.path(), true), ExecutionMode::Offline)
        .await
        .unwrap();
    let err = runtime.resume_mission("nope").await.err().unwrap();
    assert!(err.to_string().contains("mission 'nope' not found"));
}
