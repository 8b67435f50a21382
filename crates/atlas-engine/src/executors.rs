//! Step Executors (C7): one contract, dispatched per `StepKind` (Section
//! 4.7). Every executor receives only the collaborators it needs via `Deps`,
//! keeping the import graph acyclic (Section 9 design notes).

use crate::pipeline::{self, PipelineSpec};
use crate::retry::{self, Disposition, RetryPolicy};
use crate::runner::{self, RunnerError};
use crate::templates::StepSpec;
use crate::watcher::{self, WatchError, WatchSpec};
use atlas_core::{save_versioned_artifact, CheckResult, ErrorKind, StepKind, Task, Workspace};
use chrono::Utc;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("validation pipeline failed at {0}")]
    ValidationFailed(String),
    #[error("git operation failed: {0}")]
    Git(String),
    #[error("ci watch failed: {0}")]
    Ci(#[from] WatchError),
    #[error("ai invocation failed: {0}")]
    Ai(String),
    #[error("cancelled")]
    Cancelled,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("artifact error: {0}")]
    Artifact(#[from] atlas_core::artifacts::ArtifactError),
    #[error("no pull request is open for this task yet")]
    NoPullRequest,
    #[error("unrecognized git sub-action: {0}")]
    UnknownGitAction(String),
}

impl ExecutorError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ValidationFailed(_) => ErrorKind::ValidationFailed,
            Self::Git(_) | Self::NoPullRequest => ErrorKind::GitPushRejected,
            Self::UnknownGitAction(_) => ErrorKind::NotFound,
            Self::Ci(e) => e.kind(),
            Self::Ai(_) => ErrorKind::Transient,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Io(_) | Self::Artifact(_) => ErrorKind::Io,
        }
    }
}

/// Classifier for git/`gh` sub-actions run via C3 (Section 4.4: "each
/// external subsystem keeps its own transient/permanent/cancelled policy").
/// Network and auth failures retry; a local git error (bad ref, merge
/// conflict, nothing to commit) is permanent.
fn classify_git(err: &ExecutorError) -> Disposition {
    match err {
        ExecutorError::Cancelled => Disposition::Cancelled,
        ExecutorError::Git(detail) => {
            let lowered = detail.to_lowercase();
            let transient = [
                "could not resolve host",
                "could not read from remote",
                "connection",
                "timed out",
                "non-fast-forward",
                "fetch first",
                "rejected",
                "authentication",
                "network",
            ];
            if transient.iter().any(|marker| lowered.contains(marker)) {
                Disposition::Retry
            } else {
                Disposition::Permanent
            }
        }
        _ => Disposition::Permanent,
    }
}

pub type Result<T> = std::result::Result<T, ExecutorError>;

/// Invokes the AI CLI (or the SDD tool, which shares the same shape) with a
/// rendered prompt and returns its captured stdout.
pub type AiInvoke<'a> = &'a (dyn Fn(
    String,
) -> Pin<Box<dyn Future<Output = std::result::Result<String, String>> + Send>>
             + Send
             + Sync);

/// Lists external checks for a PR (wraps `gh pr checks` or equivalent).
pub type CheckLister<'a> = &'a (dyn Fn() -> Pin<Box<dyn Future<Output = std::result::Result<Vec<CheckResult>, String>> + Send>>
             + Send
             + Sync);

/// Collaborators an executor needs, injected rather than looked up globally
/// (Section 9: "executors receive `deps` holding only the collaborators they
/// need").
pub struct Deps<'a> {
    pub cancel: &'a CancellationToken,
    pub workspace: &'a Workspace,
    pub retry_policy: RetryPolicy,
    pub validation_spec: &'a PipelineSpec,
    pub validation_timeout: Duration,
    pub ci_spec: &'a WatchSpec,
    pub ai_invoke: AiInvoke<'a>,
    pub check_lister: CheckLister<'a>,
}

fn workdir(deps: &Deps<'_>) -> PathBuf {
    PathBuf::from(&deps.workspace.worktree_path)
}

async fn execute_ai(deps: &Deps<'_>, task: &Task, step: &StepSpec) -> Result<Vec<u8>> {
    let prompt = format!("{}\n\nTask: {}", step.name, task.description);
    let output = retry::with_retry(
        deps.cancel,
        &deps.retry_policy,
        || (deps.ai_invoke)(prompt.clone()),
        |_: &String| Disposition::Retry,
    )
    .await
    .map_err(ExecutorError::Ai)?;
    Ok(output.into_bytes())
}

async fn execute_gather(_deps: &Deps<'_>, task: &Task) -> Result<Vec<u8>> {
    // Section 4.7: "optional interactive prompt; skipped if inputs present;
    // never fails fatally." With no interactive surface in the engine, the
    // task description itself is treated as the gathered input.
    Ok(task.description.clone().into_bytes())
}

async fn execute_validation(deps: &Deps<'_>, task_dir: &Path) -> Result<Vec<u8>> {
    let result = pipeline::run_pipeline(deps.cancel, &workdir(deps), deps.validation_spec, deps.validation_timeout).await;
    let bytes = serde_json::to_vec_pretty(&result).map_err(|e| ExecutorError::Ai(e.to_string()))?;
    save_versioned_artifact(task_dir, "validation.json", &bytes, Utc::now())?;
    if !result.success {
        return Err(ExecutorError::ValidationFailed(
            result.failed_step.unwrap_or_else(|| "unknown".to_string()),
        ));
    }
    Ok(bytes)
}

/// Run one `git`/`gh` command through C3, turning a nonzero exit into a
/// classifiable `ExecutorError::Git` (Section 4.7: git sub-actions run "via
/// C3+C4 with git-specific classifier").
async fn run_git_cmd(deps: &Deps<'_>, wd: &Path, program: &str, args: &[&str]) -> Result<runner::RunOutcome> {
    let outcome = runner::run(deps.cancel, wd, program, args, Duration::from_secs(60))
        .await
        .map_err(|e| match e {
            RunnerError::Cancelled => ExecutorError::Cancelled,
            other => ExecutorError::Git(other.to_string()),
        })?;
    if outcome.exit_code != 0 {
        return Err(ExecutorError::Git(format!(
            "{program} {}: {}",
            args.join(" "),
            outcome.stderr.trim()
        )));
    }
    Ok(outcome)
}

async fn execute_git(deps: &Deps<'_>, task: &mut Task, step: &StepSpec) -> Result<Vec<u8>> {
    let wd = workdir(deps);
    match step.name {
        "branch" => {
            run_git_cmd(
                deps,
                &wd,
                "git",
                &["branch", &deps.workspace.branch, &deps.workspace.base_branch],
            )
            .await?;
            Ok(format!("branch={}", deps.workspace.branch).into_bytes())
        }
        "clean" => {
            run_git_cmd(deps, &wd, "git", &["clean", "-fd"]).await?;
            Ok(b"cleaned".to_vec())
        }
        "stage" => {
            run_git_cmd(deps, &wd, "git", &["add", "-A"]).await?;
            Ok(b"staged".to_vec())
        }
        "commit" | "smart_commit" => {
            run_git_cmd(deps, &wd, "git", &["add", "-A"]).await?;
            let status = run_git_cmd(deps, &wd, "git", &["status", "--porcelain"]).await?;
            if status.stdout.trim().is_empty() {
                return Ok(b"committed=false".to_vec());
            }
            let message = format!("{}\n\nTask: {}", task.description, task.id);
            retry::with_retry(
                deps.cancel,
                &deps.retry_policy,
                || run_git_cmd(deps, &wd, "git", &["commit", "-m", &message]),
                classify_git,
            )
            .await?;
            Ok(b"committed=true".to_vec())
        }
        "push" => {
            retry::with_retry(
                deps.cancel,
                &deps.retry_policy,
                || run_git_cmd(deps, &wd, "git", &["push", "-u", "origin", &deps.workspace.branch]),
                classify_git,
            )
            .await?;
            Ok(b"pushed".to_vec())
        }
        "pr" | "open_pr" => {
            let outcome = retry::with_retry(
                deps.cancel,
                &deps.retry_policy,
                || {
                    run_git_cmd(
                        deps,
                        &wd,
                        "gh",
                        &["pr", "create", "--fill", "--head", &deps.workspace.branch],
                    )
                },
                classify_git,
            )
            .await?;
            let pr_number = outcome
                .stdout
                .lines()
                .rev()
                .find_map(|line| line.rsplit('/').next().and_then(|s| s.trim().parse::<u64>().ok()));
            if let Some(number) = pr_number {
                task.variables.insert("pr_number".to_string(), serde_json::json!(number));
            }
            Ok(outcome.stdout.into_bytes())
        }
        "pr_update" => {
            let pr_number = task
                .variables
                .get("pr_number")
                .and_then(serde_json::Value::as_u64)
                .ok_or(ExecutorError::NoPullRequest)?;
            let body = format!("{}\n\nTask: {}", task.description, task.id);
            let outcome = retry::with_retry(
                deps.cancel,
                &deps.retry_policy,
                || {
                    run_git_cmd(
                        deps,
                        &wd,
                        "gh",
                        &["pr", "edit", &pr_number.to_string(), "--body", &body],
                    )
                },
                classify_git,
            )
            .await?;
            Ok(outcome.stdout.into_bytes())
        }
        other => {
            warn!(step = other, "unrecognized git step name");
            Err(ExecutorError::UnknownGitAction(other.to_string()))
        }
    }
}

async fn execute_ci(deps: &Deps<'_>, task: &Task) -> Result<Vec<u8>> {
    let _pr_number = task
        .variables
        .get("pr_number")
        .and_then(serde_json::Value::as_u64)
        .ok_or(ExecutorError::NoPullRequest)?;

    let result = watcher::watch(
        deps.cancel,
        deps.ci_spec,
        &deps.retry_policy,
        || (deps.check_lister)(),
        |_, _| {},
    )
    .await?;

    let bytes = serde_json::to_vec_pretty(&result).map_err(|e| ExecutorError::Ai(e.to_string()))?;
    match result.status {
        atlas_core::WatchStatus::Success => Ok(bytes),
        atlas_core::WatchStatus::Failure => Err(ExecutorError::Ci(WatchError::ListerFailed("ci checks failed".to_string()))),
        atlas_core::WatchStatus::Timeout => Err(ExecutorError::Ci(WatchError::ListerFailed("ci watch timed out".to_string()))),
        atlas_core::WatchStatus::Pending => Err(ExecutorError::Ci(WatchError::ListerFailed("ci watch returned while still pending".to_string()))),
    }
}

/// Dispatch `step` to its executor. `Human` steps are handled entirely by
/// the Task Engine (Section 4.8 step 6) and never reach this function.
pub async fn execute(deps: &Deps<'_>, task: &mut Task, task_dir: &Path, step: &StepSpec) -> Result<Vec<String>> {
    info!(step = step.name, kind = ?step.kind, "executing step");
    let artifact_bytes = match step.kind {
        StepKind::Ai | StepKind::Sdd => execute_ai(deps, task, step).await?,
        StepKind::Gather => execute_gather(deps, task).await?,
        StepKind::Validation => execute_validation(deps, task_dir).await?,
        StepKind::Git => execute_git(deps, task, step).await?,
        StepKind::Ci => execute_ci(deps, task).await?,
        StepKind::Human => return Ok(Vec::new()),
    };

    if step.kind == StepKind::Validation {
        return Ok(vec!["validation.json".to_string()]);
    }

    let basename = format!("{}.json", step.name);
    save_versioned_artifact(task_dir, &basename, &artifact_bytes, Utc::now())?;
    Ok(vec![basename])
}
