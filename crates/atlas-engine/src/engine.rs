//! Task Engine (C8): the scheduler loop driving a task through its template,
//! one step (or parallel group) at a time, persisting after every transition
//! (Section 4.8). The engine never auto-resumes after a failure or a human
//! step; an external command re-enters the loop.

use crate::executors::{self, Deps, ExecutorError};
use crate::store::{Store, StoreError};
use crate::templates::{StepSpec, TemplateRegistry};
use atlas_core::events::{
    EventPayload, StatusChangedPayload, StepFinishedPayload, StepStartedPayload,
    TaskAbandonedPayload, TaskRejectedPayload,
};
use atlas_core::{ErrorKind, StepRunStatus, Task, TaskId, TaskStatus, WorkspaceName};
use std::path::PathBuf;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("unknown template: {0}")]
    UnknownTemplate(String),
    #[error("task {0} is already terminal")]
    AlreadyTerminal(TaskId),
    #[error("task {0} is not awaiting approval")]
    NotAwaitingApproval(TaskId),
    #[error("cannot resume task {0} from status {1:?}")]
    NotResumable(TaskId, TaskStatus),
    #[error("step {0} not found in task history")]
    StepNotFound(String),
}

impl EngineError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Store(e) => match e {
                StoreError::CorruptedState(_) => ErrorKind::CorruptedState,
                StoreError::WorkspaceNotFound(_) | StoreError::TaskNotFound(_) => ErrorKind::NotFound,
                StoreError::Io(_) => ErrorKind::Io,
            },
            Self::UnknownTemplate(_) => ErrorKind::NotFound,
            Self::AlreadyTerminal(_) | Self::NotAwaitingApproval(_) | Self::NotResumable(_, _) => {
                ErrorKind::InvalidState
            }
            Self::StepNotFound(_) => ErrorKind::NotFound,
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Drives a single task through its template. Holds no state of its own
/// besides a reference to the store and registry; all task state lives in
/// the persisted `Task` record (Section 4.8: "reload from C1 establishes
/// authoritative state after restart").
pub struct TaskEngine<'a> {
    store: &'a Store,
    templates: &'a TemplateRegistry,
}

impl<'a> TaskEngine<'a> {
    #[must_use]
    pub fn new(store: &'a Store, templates: &'a TemplateRegistry) -> Self {
        Self { store, templates }
    }

    /// Start a new task for `workspace` running `template`, persist it, and
    /// return it without running any steps (the caller drives the loop via
    /// [`Self::run`]).
    pub fn start(&self, workspace: WorkspaceName, template: &str, description: &str) -> Result<Task> {
        let steps = self
            .templates
            .get(template)
            .ok_or_else(|| EngineError::UnknownTemplate(template.to_string()))?;
        let records = steps
            .iter()
            .map(|s| atlas_core::StepRecord::pending(s.name, s.kind))
            .collect();
        let task = Task::new(workspace, template, description, records);
        self.store.save_task(&task)?;
        self.store.append_event(
            &task.id,
            EventPayload::TaskCreated(atlas_core::events::TaskCreatedPayload {
                task_id: task.id.clone(),
                workspace: task.workspace.clone(),
                template: task.template.to_string(),
            }),
        )?;
        Ok(task)
    }

    fn step_specs(&self, task: &Task) -> Result<&'a [StepSpec]> {
        self.templates
            .get(&task.template)
            .ok_or_else(|| EngineError::UnknownTemplate(task.template.clone()))
    }

    /// Collect the indices making up the group starting at `start`: the
    /// step at `start` plus any immediately following steps sharing its
    /// `parallel_group` tag (Section 4.7).
    fn group_indices(specs: &[StepSpec], start: usize) -> Vec<usize> {
        let Some(group) = specs[start].parallel_group else {
            return vec![start];
        };
        let mut indices = vec![start];
        let mut i = start + 1;
        while i < specs.len() && specs[i].parallel_group == Some(group) {
            indices.push(i);
            i += 1;
        }
        indices
    }

    fn task_dir(&self, task: &Task) -> PathBuf {
        self.store.task_artifacts_dir(&task.workspace, &task.id)
    }

    fn classify_and_transition(&self, task: &mut Task, step_name: &str, kind: ErrorKind, message: &str) {
        let new_status = match kind {
            ErrorKind::ValidationFailed => TaskStatus::ValidationFailed,
            ErrorKind::CiFailed => TaskStatus::CiFailed,
            ErrorKind::CiTimeout | ErrorKind::CiMissingRequired => TaskStatus::CiTimeout,
            ErrorKind::GitPushRejected | ErrorKind::PrCreationFailed => TaskStatus::GhFailed,
            _ => {
                warn!(step = step_name, kind = kind.as_str(), "unclassified step failure; leaving task running for manual resume");
                return;
            }
        };
        let from = task.status;
        if task.status.can_transition_to(new_status) {
            task.status = new_status;
        }
        task.updated_at = chrono::Utc::now();
        warn!(step = step_name, kind = kind.as_str(), detail = message, "step failed");
        let _ = self.store.append_event(
            &task.id,
            EventPayload::StatusChanged(StatusChangedPayload { task_id: task.id.clone(), from, to: task.status }),
        );
    }

    /// Run the task's scheduler loop until it suspends: on a human step, a
    /// failure, or completion (Section 4.8). Never auto-retries; call again
    /// (after `approve`/`reject`/`resume`) to keep driving it.
    pub async fn run(&self, cancel: &CancellationToken, task_id: &TaskId, deps_factory: &dyn Fn(&Task) -> Deps<'_>) -> Result<Task> {
        let mut task = self.store.load_task(task_id)?;

        loop {
            if task.status.is_terminal() {
                return Ok(task);
            }
            if task.status != TaskStatus::Pending && task.status != TaskStatus::Running {
                // Awaiting human input or a failure needing manual resume.
                return Ok(task);
            }
            if task.status == TaskStatus::Pending {
                task.status = TaskStatus::Running;
            }

            let specs = self.step_specs(&task)?;
            if task.current_step_index >= specs.len() {
                let from = task.status;
                task.status = TaskStatus::Completed;
                task.updated_at = chrono::Utc::now();
                self.store.save_task(&task)?;
                self.store.append_event(
                    &task.id,
                    EventPayload::StatusChanged(StatusChangedPayload { task_id: task.id.clone(), from, to: task.status }),
                )?;
                return Ok(task);
            }

            let group = Self::group_indices(specs, task.current_step_index);

            if specs[group[0]].kind == atlas_core::StepKind::Human {
                let from = task.status;
                task.steps[group[0]].status = StepRunStatus::Succeeded;
                task.status = TaskStatus::AwaitingApproval;
                task.updated_at = chrono::Utc::now();
                self.store.save_task(&task)?;
                self.store.append_event(
                    &task.id,
                    EventPayload::StatusChanged(StatusChangedPayload { task_id: task.id.clone(), from, to: task.status }),
                )?;
                return Ok(task);
            }

            for &idx in &group {
                task.steps[idx].status = StepRunStatus::Running;
                task.steps[idx].started_at = Some(chrono::Utc::now());
                task.steps[idx].attempt += 1;
            }
            task.updated_at = chrono::Utc::now();
            self.store.save_task(&task)?;
            for &idx in &group {
                self.store.append_event(
                    &task.id,
                    EventPayload::StepStarted(StepStartedPayload {
                        task_id: task.id.clone(),
                        step_name: task.steps[idx].name.clone(),
                        attempt: task.steps[idx].attempt,
                    }),
                )?;
            }

            let task_dir = self.task_dir(&task);
            let mut group_failure: Option<(String, ErrorKind, String)> = None;

            // Group members run to completion regardless of an earlier
            // member's failure (Section 4.7: "any failure in a group marks
            // the group failed once all members finish"). No built-in
            // template currently tags more than one step per group, so this
            // is sequential rather than concurrent; a real fan-out would
            // need `Task` split per member instead of shared `&mut`.
            for &idx in &group {
                let deps = deps_factory(&task);
                let step = specs[idx].clone();
                let outcome = executors::execute(&deps, &mut task, &task_dir, &step).await;
                Self::record_outcome(&mut task, idx, outcome, &mut group_failure);
            }

            for &idx in &group {
                let now = chrono::Utc::now();
                task.steps[idx].completed_at = Some(now);
                let duration_ms = task.steps[idx]
                    .started_at
                    .map(|started| (now - started).num_milliseconds().max(0) as u64)
                    .unwrap_or(0);
                self.store.append_event(
                    &task.id,
                    EventPayload::StepFinished(StepFinishedPayload {
                        task_id: task.id.clone(),
                        step_name: task.steps[idx].name.clone(),
                        success: task.steps[idx].status == StepRunStatus::Succeeded,
                        duration_ms,
                    }),
                )?;
            }

            if let Some((step_name, kind, message)) = group_failure {
                self.classify_and_transition(&mut task, &step_name, kind, &message);
                task.updated_at = chrono::Utc::now();
                self.store.save_task(&task)?;
                return Ok(task);
            }

            task.current_step_index = group.last().map_or(task.current_step_index, |i| i + 1);
            task.updated_at = chrono::Utc::now();
            self.store.save_task(&task)?;

            if cancel.is_cancelled() {
                return Ok(task);
            }
        }
    }

    fn record_outcome(
        task: &mut Task,
        idx: usize,
        outcome: std::result::Result<Vec<String>, ExecutorError>,
        group_failure: &mut Option<(String, ErrorKind, String)>,
    ) {
        match outcome {
            Ok(artifacts) => {
                task.steps[idx].status = StepRunStatus::Succeeded;
                task.steps[idx].artifacts = artifacts;
            }
            Err(err) => {
                let kind = err.kind();
                task.steps[idx].status = StepRunStatus::Failed;
                task.steps[idx].error = Some(err.to_string());
                if group_failure.is_none() {
                    *group_failure = Some((task.steps[idx].name.clone(), kind, err.to_string()));
                }
            }
        }
    }

    /// Approve the current `awaiting_approval` task: advance past the human
    /// step, or complete the task if it was the last step.
    pub fn approve(&self, task_id: &TaskId) -> Result<Task> {
        let mut task = self.store.load_task(task_id)?;
        if task.status.is_terminal() {
            return Err(EngineError::AlreadyTerminal(task_id.clone()));
        }
        if task.status != TaskStatus::AwaitingApproval {
            return Err(EngineError::NotAwaitingApproval(task_id.clone()));
        }
        task.current_step_index += 1;
        let specs = self.step_specs(&task)?;
        if task.current_step_index >= specs.len() {
            task.status = TaskStatus::Completed;
        } else {
            task.status = TaskStatus::Running;
        }
        task.updated_at = chrono::Utc::now();
        self.store.save_task(&task)?;
        Ok(task)
    }

    /// Reject the current `awaiting_approval` task, rewinding to
    /// `rewind_step` (by name) and attaching `feedback` for the next AI
    /// invocation to consume (Section 4.8).
    pub fn reject(&self, task_id: &TaskId, rewind_step: &str, feedback: &str) -> Result<Task> {
        let mut task = self.store.load_task(task_id)?;
        if task.status != TaskStatus::AwaitingApproval {
            return Err(EngineError::NotAwaitingApproval(task_id.clone()));
        }
        let idx = task
            .steps
            .iter()
            .position(|s| s.name == rewind_step)
            .ok_or_else(|| EngineError::StepNotFound(rewind_step.to_string()))?;
        task.current_step_index = idx;
        task.variables.insert("rejection_feedback".to_string(), serde_json::json!(feedback));
        task.status = TaskStatus::Running;
        task.updated_at = chrono::Utc::now();
        self.store.save_task(&task)?;
        self.store.append_event(
            &task.id,
            EventPayload::TaskRejected(TaskRejectedPayload {
                task_id: task.id.clone(),
                reason: Some(feedback.to_string()),
            }),
        )?;
        Ok(task)
    }

    /// Abandon a task from any non-terminal status. Worktree is preserved
    /// (Section 4.8).
    pub fn abandon(&self, task_id: &TaskId) -> Result<Task> {
        let mut task = self.store.load_task(task_id)?;
        if task.status.is_terminal() {
            return Err(EngineError::AlreadyTerminal(task_id.clone()));
        }
        task.status = TaskStatus::Abandoned;
        task.updated_at = chrono::Utc::now();
        self.store.save_task(&task)?;
        self.store.append_event(
            &task.id,
            EventPayload::TaskAbandoned(TaskAbandonedPayload { task_id: task.id.clone(), reason: None }),
        )?;
        Ok(task)
    }

    /// Resume a task stuck in a failure status (`validation_failed`,
    /// `gh_failed`, `ci_failed`, `ci_timeout`) back to `running` at its
    /// current index, including tasks left at `running`/`validating` by a
    /// crash (Section 4.8 crash recovery).
    pub fn resume(&self, task_id: &TaskId) -> Result<Task> {
        let mut task = self.store.load_task(task_id)?;
        let resumable = matches!(
            task.status,
            TaskStatus::ValidationFailed
                | TaskStatus::GhFailed
                | TaskStatus::CiFailed
                | TaskStatus::CiTimeout
                | TaskStatus::Running
                | TaskStatus::Validating
        );
        if !resumable {
            return Err(EngineError::NotResumable(task_id.clone(), task.status));
        }
        task.status = TaskStatus::Running;
        task.updated_at = chrono::Utc::now();
        self.store.save_task(&task)?;
        info!(task_id = %task.id, "task resumed");
        Ok(task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::PipelineSpec;
    use crate::retry::RetryPolicy;
    use crate::watcher::WatchSpec;
    use atlas_core::{WorkspaceStatus, SCHEMA_VERSION};
    use std::process::Command as StdCommand;
    use tempfile::TempDir;

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

    struct Fixture {
        store: Store,
        templates: TemplateRegistry,
        _store_dir: TempDir,
        repo_dir: TempDir,
    }

    fn fixture() -> Fixture {
        let store_dir = TempDir::new().unwrap();
        let store = Store::new(store_dir.path().to_path_buf());
        store.init().unwrap();
        Fixture { store, templates: TemplateRegistry::new(), _store_dir: store_dir, repo_dir: setup_test_repo() }
    }

    fn workspace(worktree_path: &std::path::Path) -> atlas_core::Workspace {
        atlas_core::Workspace {
            schema_version: SCHEMA_VERSION,
            name: atlas_core::WorkspaceName::sanitize("demo"),
            branch: "atlas/demo".to_string(),
            worktree_path: worktree_path.to_string_lossy().to_string(),
            base_branch: "main".to_string(),
            status: WorkspaceStatus::Active,
            created_at: chrono::Utc::now(),
            latest_task_id: None,
        }
    }

    fn noop_ai<'a>() -> crate::executors::AiInvoke<'a> {
        &|_prompt: String| Box::pin(async { Ok("ai output".to_string()) })
    }

    fn noop_checks<'a>() -> crate::executors::CheckLister<'a> {
        &|| Box::pin(async { Ok(Vec::new()) })
    }

    fn make_deps<'a>(
        cancel: &'a CancellationToken,
        ws: &'a atlas_core::Workspace,
        validation_spec: &'a PipelineSpec,
        ci_spec: &'a WatchSpec,
    ) -> Deps<'a> {
        Deps {
            cancel,
            workspace: ws,
            retry_policy: RetryPolicy { max_attempts: 1, ..RetryPolicy::default() },
            validation_spec,
            validation_timeout: std::time::Duration::from_secs(5),
            ci_spec,
            ai_invoke: noop_ai(),
            check_lister: noop_checks(),
        }
    }

    #[test]
    fn start_registers_task_with_all_template_steps_pending() {
        let fx = fixture();
        let engine = TaskEngine::new(&fx.store, &fx.templates);
        let task = engine.start(atlas_core::WorkspaceName::sanitize("demo"), "hotfix", "fix the bug").unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.steps.len(), 7);
        assert!(task.steps.iter().all(|s| s.status == StepRunStatus::Pending));
    }

    #[test]
    fn start_with_unknown_template_errors() {
        let fx = fixture();
        let engine = TaskEngine::new(&fx.store, &fx.templates);
        let err = engine.start(atlas_core::WorkspaceName::sanitize("demo"), "no-such-template", "x").unwrap_err();
        assert!(matches!(err, EngineError::UnknownTemplate(_)));
    }

    #[tokio::test]
    async fn run_stops_at_first_unreachable_git_step_and_marks_gh_failed() {
        let fx = fixture();
        let engine = TaskEngine::new(&fx.store, &fx.templates);
        let task = engine.start(atlas_core::WorkspaceName::sanitize("demo"), "hotfix", "fix the bug").unwrap();

        let ws = workspace(fx.repo_dir.path());
        let validation_spec = PipelineSpec::default();
        let ci_spec = WatchSpec { required_checks: vec![], interval: std::time::Duration::from_millis(1), timeout: std::time::Duration::from_millis(1), bell_enabled: false };
        let cancel = CancellationToken::new();
        let factory = |_task: &Task| make_deps(&cancel, &ws, &validation_spec, &ci_spec);

        let result = engine.run(&cancel, &task.id, &factory).await.unwrap();

        // implement/validate/commit succeed; push has no remote configured
        // and fails, landing the task in `gh_failed` without reaching the
        // PR/CI/review steps.
        assert_eq!(result.status, TaskStatus::GhFailed);
        assert_eq!(result.steps[0].status, StepRunStatus::Succeeded); // implement
        assert_eq!(result.steps[1].status, StepRunStatus::Succeeded); // validate
        assert_eq!(result.steps[2].status, StepRunStatus::Succeeded); // commit
        assert_eq!(result.steps[3].status, StepRunStatus::Failed); // push
    }

    #[test]
    fn approve_advances_to_next_step_and_completes_on_last_step() {
        let fx = fixture();
        let engine = TaskEngine::new(&fx.store, &fx.templates);
        let mut task = engine.start(atlas_core::WorkspaceName::sanitize("demo"), "hotfix", "fix the bug").unwrap();
        task.current_step_index = task.steps.len() - 1;
        task.status = TaskStatus::AwaitingApproval;
        fx.store.save_task(&task).unwrap();

        let approved = engine.approve(&task.id).unwrap();
        assert_eq!(approved.status, TaskStatus::Completed);
    }

    #[test]
    fn approve_on_non_awaiting_task_errors() {
        let fx = fixture();
        let engine = TaskEngine::new(&fx.store, &fx.templates);
        let task = engine.start(atlas_core::WorkspaceName::sanitize("demo"), "hotfix", "fix the bug").unwrap();
        let err = engine.approve(&task.id).unwrap_err();
        assert!(matches!(err, EngineError::NotAwaitingApproval(_)));
    }

    #[test]
    fn reject_rewinds_and_attaches_feedback() {
        let fx = fixture();
        let engine = TaskEngine::new(&fx.store, &fx.templates);
        let mut task = engine.start(atlas_core::WorkspaceName::sanitize("demo"), "hotfix", "fix the bug").unwrap();
        task.current_step_index = task.steps.len() - 1;
        task.status = TaskStatus::AwaitingApproval;
        fx.store.save_task(&task).unwrap();

        let rejected = engine.reject(&task.id, "implement", "needs more tests").unwrap();
        assert_eq!(rejected.status, TaskStatus::Running);
        assert_eq!(rejected.current_step_index, 0);
        assert_eq!(
            rejected.variables.get("rejection_feedback").and_then(|v| v.as_str()),
            Some("needs more tests")
        );
    }

    #[test]
    fn abandon_is_terminal_and_rejects_second_abandon() {
        let fx = fixture();
        let engine = TaskEngine::new(&fx.store, &fx.templates);
        let task = engine.start(atlas_core::WorkspaceName::sanitize("demo"), "hotfix", "fix the bug").unwrap();
        let abandoned = engine.abandon(&task.id).unwrap();
        assert_eq!(abandoned.status, TaskStatus::Abandoned);
        let err = engine.abandon(&task.id).unwrap_err();
        assert!(matches!(err, EngineError::AlreadyTerminal(_)));
    }

    #[test]
    fn resume_brings_a_failed_task_back_to_running() {
        let fx = fixture();
        let engine = TaskEngine::new(&fx.store, &fx.templates);
        let mut task = engine.start(atlas_core::WorkspaceName::sanitize("demo"), "hotfix", "fix the bug").unwrap();
        task.status = TaskStatus::CiFailed;
        fx.store.save_task(&task).unwrap();

        let resumed = engine.resume(&task.id).unwrap();
        assert_eq!(resumed.status, TaskStatus::Running);
    }

    #[test]
    fn approve_on_terminal_task_is_already_terminal_not_not_awaiting() {
        let fx = fixture();
        let engine = TaskEngine::new(&fx.store, &fx.templates);
        let task = engine.start(atlas_core::WorkspaceName::sanitize("demo"), "hotfix", "fix the bug").unwrap();
        let abandoned = engine.abandon(&task.id).unwrap();
        assert_eq!(abandoned.status, TaskStatus::Abandoned);

        let err = engine.approve(&task.id).unwrap_err();
        assert!(matches!(err, EngineError::AlreadyTerminal(_)));
    }

    #[test]
    fn resume_on_awaiting_approval_is_rejected() {
        let fx = fixture();
        let engine = TaskEngine::new(&fx.store, &fx.templates);
        let mut task = engine.start(atlas_core::WorkspaceName::sanitize("demo"), "hotfix", "fix the bug").unwrap();
        task.status = TaskStatus::AwaitingApproval;
        fx.store.save_task(&task).unwrap();

        let err = engine.resume(&task.id).unwrap_err();
        assert!(matches!(err, EngineError::NotResumable(_, _)));
    }
}
