//! End-to-end launch flows against in-memory collaborators.

use coursehub_application::{LaunchRequest, SessionLaunchUseCase};
use coursehub_core::config::{AccountSettings, OrchestratorSettings, WorkspaceSettings};
use coursehub_core::course::RosterEntry;
use coursehub_core::error::CourseHubError;
use coursehub_core::identity::{IdentityReconciler, Role};
use coursehub_core::session::{SessionRecordRepository, SessionState};
use coursehub_core::testing::{
    MemoryDirectory, MemoryRecordRepository, MemoryWorkspaceFs, ScriptedOrchestrator,
    StaticRoster,
};
use coursehub_core::workspace::{EntryKind, MountPlanner, SNAPSHOT_LABEL, WorkspaceProvisioner};
use std::sync::Arc;
use std::time::Duration;

struct Hub {
    usecase: Arc<SessionLaunchUseCase>,
    fs: Arc<MemoryWorkspaceFs>,
    directory: Arc<MemoryDirectory>,
    orchestrator: Arc<ScriptedOrchestrator>,
    records: Arc<MemoryRecordRepository>,
    roster: Arc<StaticRoster>,
}

impl Hub {
    /// A use case over the same collaborators, as a freshly started process
    /// would build it.
    fn restarted(&self) -> SessionLaunchUseCase {
        build_usecase(
            self.fs.clone(),
            self.directory.clone(),
            self.orchestrator.clone(),
            self.records.clone(),
            self.roster.clone(),
        )
    }
}

fn build_usecase(
    fs: Arc<MemoryWorkspaceFs>,
    directory: Arc<MemoryDirectory>,
    orchestrator: Arc<ScriptedOrchestrator>,
    records: Arc<MemoryRecordRepository>,
    roster: Arc<StaticRoster>,
) -> SessionLaunchUseCase {
    let accounts = AccountSettings {
        instructor_gid: 2000,
        learner_gid: 3000,
        ..AccountSettings::default()
    };
    let orchestrator_settings = OrchestratorSettings {
        poll_unit_ms: 1,
        launch_timeout_secs: None,
        ..OrchestratorSettings::default()
    };

    let reconciler = Arc::new(IdentityReconciler::new(directory, accounts.clone()));
    let provisioner = Arc::new(WorkspaceProvisioner::new(
        fs,
        MountPlanner::new(WorkspaceSettings::default()),
        accounts,
    ));

    SessionLaunchUseCase::new(
        reconciler,
        provisioner,
        orchestrator,
        records,
        orchestrator_settings,
        2,
    )
    .with_roster(roster)
}

fn hub() -> Hub {
    let fs = Arc::new(MemoryWorkspaceFs::new());
    fs.add_file("/etc/nslcd.conf");
    let directory = Arc::new(MemoryDirectory::new());
    let orchestrator = Arc::new(ScriptedOrchestrator::new());
    let records = Arc::new(MemoryRecordRepository::new());
    let roster = Arc::new(StaticRoster::new());

    let usecase = build_usecase(
        fs.clone(),
        directory.clone(),
        orchestrator.clone(),
        records.clone(),
        roster.clone(),
    );

    Hub {
        usecase: Arc::new(usecase),
        fs,
        directory,
        orchestrator,
        records,
        roster,
    }
}

fn learner(username: &str, id: u32) -> LaunchRequest {
    LaunchRequest::new(username, Role::Learner, "cs101").with_subject_id(Some(id))
}

#[tokio::test]
async fn test_learner_launch_provisions_and_runs() {
    let hub = hub();
    hub.orchestrator.script_states(&["preparing", "running"]);

    let record = hub.usecase.launch(learner("alice", 5)).await.unwrap();

    assert_eq!(record.state, SessionState::Running);
    assert_eq!(record.service_name, "coursehub-alice");
    assert_eq!(hub.directory.add_count(), 1);

    let working = hub.fs.entry("/jupyter/alice/class/cs101").unwrap();
    assert_eq!(working.kind, EntryKind::Directory);
    assert_eq!(working.uid, 20005);

    let specs = hub.orchestrator.specs();
    assert_eq!(specs.len(), 1);
    assert_eq!(specs[0].mounts.len(), 4);
    assert_eq!(specs[0].env.get("NB_UID").map(String::as_str), Some("20005"));
    assert!(specs[0].labels.contains_key(SNAPSHOT_LABEL));
    assert_eq!(hub.roster.calls(), 0);

    let archived = hub.records.find_by_id(&record.session_id).await.unwrap();
    assert_eq!(archived.map(|r| r.state), Some(SessionState::Running));
}

#[tokio::test]
async fn test_running_session_is_reused() {
    let hub = hub();
    hub.orchestrator.script_states(&["running"]);

    let first = hub.usecase.launch(learner("alice", 5)).await.unwrap();
    let second = hub.usecase.launch(learner("alice", 5)).await.unwrap();

    assert_eq!(first.session_id, second.session_id);
    assert_eq!(hub.orchestrator.created().len(), 1);
}

#[tokio::test]
async fn test_instructor_launch_writes_roster() {
    let hub = hub();
    hub.roster.insert(
        "cs101",
        vec![RosterEntry {
            id: "alice".to_string(),
            first_name: "Alice".to_string(),
            last_name: "Liddell".to_string(),
            email: "alice@example.com".to_string(),
            lms_user_id: Some(7),
        }],
    );
    hub.orchestrator.script_states(&["running"]);

    let request =
        LaunchRequest::new("tina", Role::Instructor, "cs101").with_subject_id(Some(9));
    hub.usecase.launch(request).await.unwrap();

    assert_eq!(hub.roster.calls(), 1);
    let roster = hub
        .fs
        .entry("/jupyter/tina/class/cs101/roster.json")
        .unwrap();
    let contents = String::from_utf8(roster.contents).unwrap();
    assert!(contents.contains("Liddell"));
    assert_eq!(hub.orchestrator.specs()[0].mounts.len(), 5);
}

#[tokio::test]
async fn test_failed_launch_cleans_up_and_relaunches_fresh() {
    let hub = hub();
    hub.orchestrator.script_states(&["failed"]);

    let err = hub.usecase.launch(learner("alice", 5)).await.unwrap_err();
    match &err {
        CourseHubError::LaunchFailed { status, .. } => assert_eq!(status, "failed"),
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(hub.orchestrator.removed(), vec!["coursehub-alice".to_string()]);

    let failed = hub.usecase.status("alice").await.unwrap().unwrap();
    assert_eq!(failed.state, SessionState::Failed);

    hub.orchestrator.script_states(&["running"]);
    let relaunched = hub.usecase.launch(learner("alice", 5)).await.unwrap();
    assert_eq!(relaunched.state, SessionState::Running);
    assert_ne!(relaunched.session_id, failed.session_id);
    assert_eq!(hub.directory.add_count(), 1);
    assert_eq!(hub.directory.modify_count(), 0);
    assert_eq!(
        relaunched.visited_states()[0],
        SessionState::Requested
    );
}

#[tokio::test]
async fn test_deadline_cancels_and_reports_last_status() {
    let hub = hub();
    hub.orchestrator.script_states(&["pending"]);

    let request = learner("alice", 5).with_timeout(Some(Duration::from_millis(50)));
    let err = hub.usecase.launch(request).await.unwrap_err();

    assert!(err.is_cancelled(), "{:?}", err);
    assert!(err.to_string().contains("pending"), "{}", err);
    assert_eq!(hub.orchestrator.removed(), vec!["coursehub-alice".to_string()]);
    let record = hub.usecase.status("alice").await.unwrap().unwrap();
    assert_eq!(record.state, SessionState::Failed);
}

#[tokio::test]
async fn test_teardown_interrupts_launch_in_progress() {
    let hub = hub();
    // No task ever appears: the launch waits until it is cancelled.
    let launch = {
        let usecase = hub.usecase.clone();
        tokio::spawn(async move { usecase.launch(learner("alice", 5)).await })
    };

    let mut waited = 0;
    loop {
        let state = hub.usecase.status("alice").await.unwrap().map(|r| r.state);
        if state == Some(SessionState::AwaitingReadiness) {
            break;
        }
        waited += 1;
        assert!(waited < 400, "launch never reached readiness polling");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let record = hub.usecase.teardown("alice").await.unwrap().unwrap();
    assert_eq!(record.state, SessionState::Failed);

    let outcome = launch.await.unwrap();
    assert!(outcome.unwrap_err().is_cancelled());
    assert!(hub.usecase.list().await.unwrap().iter().all(|r| r.state != SessionState::Running));
}

#[tokio::test]
async fn test_teardown_is_idempotent() {
    let hub = hub();
    hub.orchestrator.script_states(&["running"]);
    hub.usecase.launch(learner("alice", 5)).await.unwrap();

    let first = hub.usecase.teardown("alice").await.unwrap().unwrap();
    assert_eq!(first.state, SessionState::Removed);
    let second = hub.usecase.teardown("alice").await.unwrap().unwrap();
    assert_eq!(second.state, SessionState::Removed);
    assert_eq!(second.session_id, first.session_id);
    assert_eq!(hub.orchestrator.removed().len(), 1);

    assert!(hub.usecase.teardown("nobody").await.unwrap().is_none());
}

#[tokio::test]
async fn test_teardown_all_and_list() {
    let hub = hub();
    hub.orchestrator.script_states(&["running"]);
    hub.usecase.launch(learner("alice", 5)).await.unwrap();
    hub.usecase.launch(learner("bob", 6)).await.unwrap();

    let results = hub.usecase.teardown_all().await;
    assert_eq!(results.len(), 2);
    for (username, result) in results {
        let record = result.unwrap().unwrap();
        assert_eq!(record.subject_username, username);
        assert_eq!(record.state, SessionState::Removed);
    }

    let listed = hub.usecase.list().await.unwrap();
    assert_eq!(listed.len(), 2);
    assert!(listed.iter().all(|r| r.state == SessionState::Removed));
}

#[tokio::test]
async fn test_plan_has_no_side_effects() {
    let hub = hub();
    hub.fs.clear_ops();

    let plan = hub.usecase.plan(&learner("alice", 5)).await.unwrap();

    assert_eq!(plan.len(), 4);
    assert_eq!(hub.directory.add_count(), 0);
    assert!(hub.fs.ops().is_empty());
    assert!(hub.orchestrator.created().is_empty());
}

#[tokio::test]
async fn test_configuration_error_prevents_launch() {
    let hub = hub();
    hub.fs.remove_entry("/etc/nslcd.conf");

    let err = hub.usecase.launch(learner("alice", 5)).await.unwrap_err();

    assert!(err.is_config());
    assert!(hub.orchestrator.created().is_empty());
}

#[tokio::test]
async fn test_relaunch_reuses_provisioned_workspace() {
    let hub = hub();
    hub.orchestrator.script_states(&["running"]);

    let first = hub.usecase.launch(learner("alice", 5)).await.unwrap();
    assert!(first.workspace.is_some());
    hub.usecase.teardown("alice").await.unwrap();

    hub.fs.clear_ops();
    let second = hub.usecase.launch(learner("alice", 5)).await.unwrap();

    assert_eq!(second.state, SessionState::Running);
    assert_ne!(second.session_id, first.session_id);
    assert!(hub.fs.ops().is_empty(), "unexpected writes: {:?}", hub.fs.ops());
    assert_eq!(second.workspace, first.workspace);
}

#[tokio::test]
async fn test_restarted_hub_adopts_archived_workspace() {
    let hub = hub();
    hub.orchestrator.script_states(&["running"]);
    hub.usecase.launch(learner("alice", 5)).await.unwrap();
    hub.usecase.teardown("alice").await.unwrap();

    let restarted = hub.restarted();
    hub.fs.clear_ops();
    let record = restarted.launch(learner("alice", 5)).await.unwrap();

    assert_eq!(record.state, SessionState::Running);
    assert!(hub.fs.ops().is_empty(), "unexpected writes: {:?}", hub.fs.ops());

    // another course still provisions
    let other = LaunchRequest::new("alice", Role::Learner, "cs102").with_subject_id(Some(5));
    restarted.launch(other).await.unwrap();
    assert!(hub.fs.entry("/jupyter/alice/class/cs102").is_some());
    assert!(!hub.fs.ops().is_empty());
}
