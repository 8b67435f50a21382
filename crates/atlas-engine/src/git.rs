//! Git plumbing used by the Workspace Manager (C2) and the `git` step executor (C7).
//!
//! Every function shells out to the system `git` binary under a given working
//! directory; none of them touch application state. Higher layers decide what
//! to do with failures.

use std::path::Path;
use std::process::Command;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GitError {
    #[error("git command failed: {0}")]
    CommandFailed(String),
    #[error("failed to execute git: {0}")]
    Execution(#[from] std::io::Error),
    #[error("invalid utf-8 in git output")]
    InvalidUtf8,
}

pub type Result<T> = std::result::Result<T, GitError>;

fn run(workdir: &Path, args: &[&str]) -> Result<std::process::Output> {
    Ok(Command::new("git").args(args).current_dir(workdir).output()?)
}

fn require_success(output: &std::process::Output, label: &str) -> Result<()> {
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    Err(GitError::CommandFailed(format!("{label}: {stderr}")))
}

/// Detect the default branch for a repository: remote `HEAD` symlink first,
/// falling back to `main`.
pub fn detect_default_branch(workspace_root: &Path) -> Result<String> {
    let output = run(workspace_root, &["symbolic-ref", "refs/remotes/origin/HEAD"])?;
    if output.status.success() {
        let stdout = String::from_utf8(output.stdout).map_err(|_| GitError::InvalidUtf8)?;
        if let Some(branch) = stdout.trim().rsplit('/').next() {
            if !branch.is_empty() {
                return Ok(branch.to_string());
            }
        }
    }
    Ok("main".to_string())
}

/// The repository directory name, used as the `<repo>` worktree path token.
pub fn repo_name(workspace_root: &Path) -> String {
    workspace_root
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("repo")
        .to_string()
}

/// Check if a branch exists locally.
pub fn branch_exists(workspace_root: &Path, branch: &str) -> Result<bool> {
    let output = run(
        workspace_root,
        &["rev-parse", "--verify", &format!("refs/heads/{branch}")],
    )?;
    Ok(output.status.success())
}

/// Create a new branch from `base` without checking it out.
pub fn create_branch(workspace_root: &Path, branch: &str, base: &str) -> Result<()> {
    let output = run(workspace_root, &["branch", branch, base])?;
    require_success(&output, &format!("git branch {branch} {base}"))
}

/// Create a git worktree at `worktree_path` for `branch`, creating the branch
/// from `base_branch` first if it does not yet exist.
pub fn create_worktree(
    workspace_root: &Path,
    worktree_path: &Path,
    branch: &str,
    base_branch: &str,
) -> Result<()> {
    if let Some(parent) = worktree_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if !branch_exists(workspace_root, branch)? {
        create_branch(workspace_root, branch, base_branch)?;
    }
    let output = run(
        workspace_root,
        &["worktree", "add", &worktree_path.to_string_lossy(), branch],
    )?;
    require_success(&output, "git worktree add")
}

/// Remove a git worktree, failing if it has uncommitted state git refuses to drop.
pub fn remove_worktree(workspace_root: &Path, worktree_path: &Path) -> Result<()> {
    let output = run(
        workspace_root,
        &["worktree", "remove", &worktree_path.to_string_lossy()],
    )?;
    require_success(&output, "git worktree remove")
}

/// Force-remove a git worktree even with local changes. Used by `Destroy`,
/// which must succeed even when the worktree is already in a bad state.
pub fn remove_worktree_force(workspace_root: &Path, worktree_path: &Path) -> Result<()> {
    let output = run(
        workspace_root,
        &["worktree", "remove", "--force", &worktree_path.to_string_lossy()],
    )?;
    require_success(&output, "git worktree remove --force")
}

/// Check if the working tree has no uncommitted changes.
pub fn is_working_tree_clean(workspace_root: &Path) -> Result<bool> {
    let output = run(workspace_root, &["status", "--porcelain"])?;
    require_success(&output, "git status")?;
    let stdout = String::from_utf8(output.stdout).map_err(|_| GitError::InvalidUtf8)?;
    Ok(stdout.trim().is_empty())
}

/// Stage every change in the working tree.
pub fn stage_all(workspace_root: &Path) -> Result<()> {
    let output = run(workspace_root, &["add", "-A"])?;
    require_success(&output, "git add -A")
}

/// Commit currently staged changes with `message`.
pub fn commit(workspace_root: &Path, message: &str) -> Result<()> {
    let output = run(workspace_root, &["commit", "-m", message])?;
    require_success(&output, "git commit")
}

/// Stage and commit in one step ("smart commit": no-op if nothing is staged
/// after `stage_all`).
pub fn smart_commit(workspace_root: &Path, message: &str) -> Result<bool> {
    stage_all(workspace_root)?;
    if is_working_tree_clean(workspace_root)? {
        return Ok(false);
    }
    commit(workspace_root, message)?;
    Ok(true)
}

/// Push `branch` to `origin`, creating the upstream tracking ref.
pub fn push(workspace_root: &Path, branch: &str) -> Result<()> {
    let output = run(workspace_root, &["push", "-u", "origin", branch])?;
    require_success(&output, &format!("git push origin {branch}"))
}
