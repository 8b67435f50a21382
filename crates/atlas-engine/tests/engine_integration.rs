//! End-to-end exercise of the in-process engine (Section 6): a real
//! workspace on a real git repo, a task driven through a template to
//! completion, and a destroy that takes its task history down with it.
//! No HTTP, no daemon; everything here goes through the same public API
//! the CLI calls.

use atlas_core::{TaskStatus, WorkspaceName};
use atlas_engine::executors::{CheckLister, Deps};
use atlas_engine::pipeline::PipelineSpec;
use atlas_engine::retry::RetryPolicy;
use atlas_engine::templates::TemplateRegistry;
use atlas_engine::watcher::WatchSpec;
use atlas_engine::workspace::WorkspaceManager;
use atlas_engine::{Store, TaskEngine};
use std::process::Command as StdCommand;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn setup_test_repo() -> TempDir {
    let dir = TempDir::new().unwrap();
    for args in [
        vec!["init"],
        vec!["config", "user.email", "test@test.com"],
        vec!["config", "user.name", "Test"],
    ] {
        StdCommand::new("git").args(args).current_dir(dir.path()).output().unwrap();
    }
    std::fs::write(dir.path().join("README.md"), "# Test").unwrap();
    StdCommand::new("git").args(["add", "."]).current_dir(dir.path()).output().unwrap();
    StdCommand::new("git")
        .args(["commit", "-m", "Initial commit"])
        .current_dir(dir.path())
        .output()
        .unwrap();
    dir
}

fn noop_ai() -> impl Fn(
    String,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<String, String>> + Send>>
       + Send
       + Sync {
    |_prompt: String| Box::pin(async { Ok("ai output".to_string()) })
}

fn noop_checks() -> impl Fn() -> std::pin::Pin<
    Box<dyn std::future::Future<Output = Result<Vec<atlas_core::CheckResult>, String>> + Send>,
> + Send
       + Sync {
    || Box::pin(async { Ok(Vec::new()) })
}

/// `WorkspaceCreate` → `Start` → `Run` drives a "hotfix" task through
/// implement/validate/commit/push and lands it in `gh_failed` once push hits
/// a repo with no remote, matching the CLI's own behavior against a bare
/// checkout.
#[tokio::test]
async fn start_and_run_drives_a_task_to_gh_failed_without_a_remote() {
    let repo = setup_test_repo();
    let store_dir = TempDir::new().unwrap();
    let store = Store::new(store_dir.path().to_path_buf());
    store.init().unwrap();

    let manager = WorkspaceManager::new(&store, repo.path().to_path_buf(), "atlas".to_string());
    let ws = manager.create("integration-demo", None).unwrap();

    let templates = TemplateRegistry::new();
    let engine = TaskEngine::new(&store, &templates);
    let task = engine.start(ws.name.clone(), "hotfix", "fix the thing").unwrap();
    assert_eq!(task.status, TaskStatus::Pending);

    let cancel = CancellationToken::new();
    let validation_spec = PipelineSpec::default();
    let ci_spec = WatchSpec {
        required_checks: vec![],
        interval: Duration::from_millis(1),
        timeout: Duration::from_millis(1),
        bell_enabled: false,
    };
    let ai = noop_ai();
    let checks = noop_checks();
    let ai_invoke: atlas_engine::executors::AiInvoke<'_> = &ai;
    let check_lister: CheckLister<'_> = &checks;

    let factory = |_t: &atlas_core::Task| Deps {
        cancel: &cancel,
        workspace: &ws,
        retry_policy: RetryPolicy { max_attempts: 1, ..RetryPolicy::default() },
        validation_spec: &validation_spec,
        validation_timeout: Duration::from_secs(5),
        ci_spec: &ci_spec,
        ai_invoke,
        check_lister,
    };

    let result = engine.run(&cancel, &task.id, &factory).await.unwrap();
    assert_eq!(result.status, TaskStatus::GhFailed);

    let loaded = store.load_task(&task.id).unwrap();
    assert_eq!(loaded.status, TaskStatus::GhFailed);

    let events = store.list_events(&task.id).unwrap();
    assert!(events.iter().any(|e| matches!(e.payload, atlas_core::EventPayload::TaskCreated(_))));
}

/// Destroying a workspace removes every task filed under it (Section 3:
/// "Task ... removed only by workspace destruction"), not just its own
/// `workspace.json`.
#[test]
fn destroying_a_workspace_removes_its_tasks_too() {
    let repo = setup_test_repo();
    let store_dir = TempDir::new().unwrap();
    let store = Store::new(store_dir.path().to_path_buf());
    store.init().unwrap();

    let manager = WorkspaceManager::new(&store, repo.path().to_path_buf(), "atlas".to_string());
    let ws = manager.create("to-be-destroyed", None).unwrap();

    let templates = TemplateRegistry::new();
    let engine = TaskEngine::new(&store, &templates);
    let task = engine.start(ws.name.clone(), "hotfix", "doomed task").unwrap();

    assert!(store.load_task(&task.id).is_ok());
    let task_dir = store.task_artifacts_dir(&ws.name, &task.id);
    assert!(task_dir.join("task.json").exists());

    manager.destroy(&ws.name).unwrap();

    assert!(store.load_workspace(&ws.name).is_err());
    assert!(store.load_task(&task.id).is_err());
    assert!(!task_dir.exists());
}

/// Approve on an already-terminal task reports `already_terminal`, not
/// `not_awaiting_approval` (Section 4.8).
#[test]
fn approve_after_abandon_is_already_terminal() {
    let repo = setup_test_repo();
    let store_dir = TempDir::new().unwrap();
    let store = Store::new(store_dir.path().to_path_buf());
    store.init().unwrap();

    let manager = WorkspaceManager::new(&store, repo.path().to_path_buf(), "atlas".to_string());
    let ws = manager.create("approve-demo", None).unwrap();

    let templates = TemplateRegistry::new();
    let engine = TaskEngine::new(&store, &templates);
    let task = engine.start(ws.name.clone(), "hotfix", "will be abandoned").unwrap();

    engine.abandon(&task.id).unwrap();
    let err = engine.approve(&task.id).unwrap_err();
    assert!(matches!(err, atlas_engine::EngineError::AlreadyTerminal(_)));
}

/// Artifacts from repeated validation runs accumulate as distinct versions
/// rather than clobbering the first one (Section 8, testable property 2).
#[test]
fn repeated_validation_failures_keep_every_artifact_version() {
    use atlas_core::save_versioned_artifact;

    let dir = TempDir::new().unwrap();
    let written_at = chrono::Utc::now();
    let first = save_versioned_artifact(dir.path(), "validation.json", b"{\"ok\":false}", written_at).unwrap();
    let second = save_versioned_artifact(dir.path(), "validation.json", b"{\"ok\":true}", written_at).unwrap();

    assert_eq!(first.version, 0);
    assert_eq!(second.version, 1);
    let artifacts_dir = atlas_core::artifacts_dir(dir.path());
    assert!(artifacts_dir.join("validation.json").exists());
    assert!(artifacts_dir.join("validation.json.1").exists());

    let latest = atlas_core::read_latest_artifact(dir.path(), "validation.json").unwrap().unwrap();
    assert_eq!(latest, b"{\"ok\":true}");
}
