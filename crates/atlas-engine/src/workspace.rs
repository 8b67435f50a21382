//! Workspace Manager (C2): lifecycle of isolated git worktrees bound to a task.
//!
//! See spec Section 4.2. A workspace's worktree exists iff its status is not
//! `retired` (Section 3, invariant 5); `Destroy` must be idempotent and must
//! succeed even against corrupted metadata.

use crate::git;
use crate::store::Store;
use atlas_core::{Workspace, WorkspaceName, WorkspaceStatus};
use chrono::Utc;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("git error: {0}")]
    Git(#[from] git::GitError),
    #[error("store error: {0}")]
    Store(#[from] crate::store::StoreError),
    #[error("workspace {0} already exists")]
    AlreadyExists(String),
}

pub type Result<T> = std::result::Result<T, WorkspaceError>;

/// Creates, retires, and destroys per-workspace git worktrees, bounding the
/// filesystem scope every external command runs against (Section 4.2).
pub struct WorkspaceManager<'a> {
    store: &'a Store,
    repo_root: PathBuf,
    branch_prefix: String,
}

impl<'a> WorkspaceManager<'a> {
    #[must_use]
    pub fn new(store: &'a Store, repo_root: PathBuf, branch_prefix: String) -> Self {
        Self { store, repo_root, branch_prefix }
    }

    fn worktree_path(&self, name: &WorkspaceName) -> PathBuf {
        self.store.root().join("worktrees").join(name.as_str())
    }

    /// `Create(name, base_branch_or_current) -> Workspace`. Atomic: either
    /// both the metadata record and the worktree exist afterward, or neither
    /// does (a worktree created but not yet persisted is removed on failure).
    pub fn create(&self, name: &str, base_branch: Option<&str>) -> Result<Workspace> {
        let name = WorkspaceName::sanitize(name);
        if self.store.load_workspace(&name).is_ok() {
            return Err(WorkspaceError::AlreadyExists(name.as_str().to_string()));
        }

        let base_branch = match base_branch {
            Some(b) => b.to_string(),
            None => git::detect_default_branch(&self.repo_root)?,
        };
        let branch = format!("{}/{}", self.branch_prefix, name.as_str());
        let worktree_path = self.worktree_path(&name);

        if let Err(e) = git::create_worktree(&self.repo_root, &worktree_path, &branch, &base_branch) {
            let _ = git::remove_worktree_force(&self.repo_root, &worktree_path);
            return Err(e.into());
        }

        let workspace = Workspace {
            schema_version: atlas_core::SCHEMA_VERSION,
            name: name.clone(),
            branch,
            worktree_path: worktree_path.to_string_lossy().to_string(),
            base_branch,
            status: WorkspaceStatus::Active,
            created_at: Utc::now(),
            latest_task_id: None,
        };

        if let Err(e) = self.store.save_workspace(&workspace) {
            let _ = git::remove_worktree_force(&self.repo_root, &worktree_path);
            return Err(e.into());
        }

        Ok(workspace)
    }

    /// `Retire(name)`: removes the worktree only, preserves metadata.
    pub fn retire(&self, name: &WorkspaceName) -> Result<()> {
        let mut workspace = self.store.load_workspace(name)?;
        if workspace.status != WorkspaceStatus::Retired {
            let path = PathBuf::from(&workspace.worktree_path);
            if path.exists() {
                git::remove_worktree_force(&self.repo_root, &path)?;
            }
            workspace.status = WorkspaceStatus::Retired;
            self.store.save_workspace(&workspace)?;
        }
        Ok(())
    }

    /// `Destroy(name)`: removes worktree and metadata. Best-effort and
    /// idempotent: succeeds even if the worktree is already gone, even if
    /// metadata is unreadable.
    pub fn destroy(&self, name: &WorkspaceName) -> Result<()> {
        if let Ok(workspace) = self.store.load_workspace(name) {
            let path = PathBuf::from(&workspace.worktree_path);
            if path.exists() {
                let _ = git::remove_worktree_force(&self.repo_root, &path);
            }
        } else {
            // Metadata unreadable or absent: still attempt to clear a
            // worktree at the conventional path.
            let path = self.worktree_path(name);
            if path.exists() {
                let _ = git::remove_worktree_force(&self.repo_root, &path);
            }
        }
        self.store.delete_workspace(name)?;
        Ok(())
    }
}
