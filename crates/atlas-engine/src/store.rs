//! Filesystem state store for workspaces and tasks (Section 4.1).
//!
//! Every write goes to a temp file in the same directory followed by a
//! rename, so a reader never observes a half-written file. Writes that touch
//! a given workspace's tasks are additionally serialized by an OS advisory
//! lock on a `.lock` file sibling, held only for the duration of the
//! save/load sequence and released on drop.

use atlas_core::{Event, EventPayload, Task, TaskId, Workspace, WorkspaceName};
use fs2::FileExt;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("corrupted state file: {0}")]
    CorruptedState(PathBuf),
    #[error("workspace not found: {0}")]
    WorkspaceNotFound(String),
    #[error("task not found: {0}")]
    TaskNotFound(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Root of all task/workspace metadata, rooted at `Config::atlas_home`.
#[derive(Debug, Clone)]
pub struct Store {
    root: PathBuf,
}

/// Guard holding a workspace's advisory lock for one save/load sequence.
/// Unlocks the underlying file when dropped.
struct WorkspaceLock {
    file: File,
}

impl Drop for WorkspaceLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

impl Store {
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn init(&self) -> Result<()> {
        fs::create_dir_all(self.workspaces_dir())?;
        Ok(())
    }

    /// Root directory this store persists under (`<atlas_home>`).
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn workspaces_dir(&self) -> PathBuf {
        self.root.join("workspaces")
    }

    /// A workspace's metadata directory: `<atlas_home>/workspaces/<name>/`,
    /// holding `workspace.json` and a nested `tasks/` directory (Section 3
    /// storage layout).
    fn workspace_dir(&self, name: &WorkspaceName) -> PathBuf {
        self.workspaces_dir().join(name.as_str())
    }

    fn workspace_path(&self, name: &WorkspaceName) -> PathBuf {
        self.workspace_dir(name).join("workspace.json")
    }

    fn workspace_lock_path(&self, name: &WorkspaceName) -> PathBuf {
        self.workspace_dir(name).join(".lock")
    }

    fn tasks_dir(&self, workspace: &WorkspaceName) -> PathBuf {
        self.workspace_dir(workspace).join("tasks")
    }

    fn task_dir(&self, workspace: &WorkspaceName, id: &TaskId) -> PathBuf {
        self.tasks_dir(workspace).join(id.as_str())
    }

    fn task_path(&self, workspace: &WorkspaceName, id: &TaskId) -> PathBuf {
        self.task_dir(workspace, id).join("task.json")
    }

    fn events_path(&self, workspace: &WorkspaceName, id: &TaskId) -> PathBuf {
        self.task_dir(workspace, id).join("events.jsonl")
    }

    /// Per-task artifact directory; Task Engine and Validation Pipeline write
    /// versioned artifacts here via `atlas_core::artifacts`.
    #[must_use]
    pub fn task_artifacts_dir(&self, workspace: &WorkspaceName, id: &TaskId) -> PathBuf {
        self.task_dir(workspace, id)
    }

    /// Locate the workspace a task belongs to by scanning workspace
    /// directories for a matching `tasks/<id>/` entry. A `TaskId` is a
    /// back-reference only (Section 9: "cyclic references"), so callers
    /// that hold nothing but the id go through this lookup rather than an
    /// index maintained alongside it.
    fn find_task_workspace(&self, id: &TaskId) -> Result<WorkspaceName> {
        let dir = self.workspaces_dir();
        if dir.exists() {
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                if !entry.file_type()?.is_dir() {
                    continue;
                }
                let name = WorkspaceName::from(entry.file_name().to_string_lossy().into_owned());
                if self.task_dir(&name, id).join("task.json").exists() {
                    return Ok(name);
                }
            }
        }
        Err(StoreError::TaskNotFound(id.to_string()))
    }

    fn acquire_workspace_lock(&self, name: &WorkspaceName) -> Result<WorkspaceLock> {
        fs::create_dir_all(self.workspace_dir(name))?;
        let file = File::create(self.workspace_lock_path(name))?;
        file.lock_exclusive()?;
        Ok(WorkspaceLock { file })
    }

    /// Atomic write: serialize, write to a sibling temp file, then rename.
    fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp_path = path.with_extension(format!(
            "{}.tmp",
            path.extension().and_then(|e| e.to_str()).unwrap_or("json")
        ));
        fs::write(&tmp_path, content)?;
        fs::rename(&tmp_path, path)?;
        Ok(())
    }

    fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
        let content = fs::read(path)?;
        serde_json::from_slice(&content).map_err(|_| StoreError::CorruptedState(path.to_path_buf()))
    }

    pub fn save_workspace(&self, workspace: &Workspace) -> Result<()> {
        let _lock = self.acquire_workspace_lock(&workspace.name)?;
        let content = serde_json::to_vec_pretty(workspace)
            .map_err(|_| StoreError::CorruptedState(self.workspace_path(&workspace.name)))?;
        Self::write_atomic(&self.workspace_path(&workspace.name), &content)
    }

    pub fn load_workspace(&self, name: &WorkspaceName) -> Result<Workspace> {
        let path = self.workspace_path(name);
        if !path.exists() {
            return Err(StoreError::WorkspaceNotFound(name.to_string()));
        }
        Self::read_json(&path)
    }

    pub fn list_workspaces(&self) -> Result<Vec<Workspace>> {
        let dir = self.workspaces_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut workspaces = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let path = entry.path().join("workspace.json");
            if path.exists() {
                workspaces.push(Self::read_json(&path)?);
            }
        }
        workspaces.sort_by(|a: &Workspace, b: &Workspace| a.name.as_str().cmp(b.name.as_str()));
        Ok(workspaces)
    }

    /// Remove a workspace and, as a consequence of the nested layout, every
    /// task filed under it (Section 3: "Task ... removed only by workspace
    /// destruction").
    pub fn delete_workspace(&self, name: &WorkspaceName) -> Result<()> {
        let _lock = self.acquire_workspace_lock(name)?;
        let dir = self.workspace_dir(name);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }

    pub fn save_task(&self, task: &Task) -> Result<()> {
        let _lock = self.acquire_workspace_lock(&task.workspace)?;
        let path = self.task_path(&task.workspace, &task.id);
        let content =
            serde_json::to_vec_pretty(task).map_err(|_| StoreError::CorruptedState(path.clone()))?;
        Self::write_atomic(&path, &content)
    }

    pub fn load_task(&self, id: &TaskId) -> Result<Task> {
        let workspace = self.find_task_workspace(id)?;
        Self::read_json(&self.task_path(&workspace, id))
    }

    pub fn list_tasks_for_workspace(&self, workspace: &WorkspaceName) -> Result<Vec<Task>> {
        let dir = self.tasks_dir(workspace);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut tasks = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let task_json = entry.path().join("task.json");
            if !task_json.exists() {
                continue;
            }
            tasks.push(Self::read_json(&task_json)?);
        }
        tasks.sort_by_key(|t: &Task| t.created_at);
        Ok(tasks)
    }

    /// Append an event to a task's audit log. Returns the stored `Event`.
    pub fn append_event(&self, task_id: &TaskId, payload: EventPayload) -> Result<Event> {
        let workspace = self.find_task_workspace(task_id)?;
        let event = Event {
            timestamp: chrono::Utc::now(),
            event_type: payload.event_type(),
            payload,
        };
        let path = self.events_path(&workspace, task_id);
        let mut line = event
            .to_json_line()
            .map_err(|_| StoreError::CorruptedState(path.clone()))?;
        line.push('\n');

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        use std::io::Write;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        file.write_all(line.as_bytes())?;
        Ok(event)
    }

    pub fn list_events(&self, task_id: &TaskId) -> Result<Vec<Event>> {
        let workspace = match self.find_task_workspace(task_id) {
            Ok(workspace) => workspace,
            Err(StoreError::TaskNotFound(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let path = self.events_path(&workspace, task_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&path)?;
        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                serde_json::from_str(line).map_err(|_| StoreError::CorruptedState(path.clone()))
            })
            .collect()
    }
}

trait EventJsonLine {
    fn to_json_line(&self) -> std::result::Result<String, serde_json::Error>;
}

impl EventJsonLine for Event {
    fn to_json_line(&self) -> std::result::Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atlas_core::events::TaskCreatedPayload;
    use atlas_core::types::{StepRecord, TaskStatus, WorkspaceStatus};
    use tempfile::TempDir;

    struct TestStore {
        store: Store,
        _dir: TempDir,
    }

    fn new_test_store() -> TestStore {
        let dir = TempDir::new().unwrap();
        let store = Store::new(dir.path().to_path_buf());
        store.init().unwrap();
        TestStore { store, _dir: dir }
    }

    fn test_workspace(name: &str) -> Workspace {
        Workspace {
            schema_version: atlas_core::SCHEMA_VERSION,
            name: WorkspaceName::from(name.to_string()),
            branch: format!("atlas/{name}"),
            worktree_path: format!("/tmp/{name}"),
            base_branch: "main".to_string(),
            status: WorkspaceStatus::Active,
            created_at: chrono::Utc::now(),
            latest_task_id: None,
        }
    }

    #[test]
    fn save_and_load_workspace_round_trips() {
        let ts = new_test_store();
        let workspace = test_workspace("feature-x");
        ts.store.save_workspace(&workspace).unwrap();

        let loaded = ts.store.load_workspace(&workspace.name).unwrap();
        assert_eq!(loaded.branch, workspace.branch);
        assert_eq!(loaded.status, WorkspaceStatus::Active);
    }

    #[test]
    fn load_missing_workspace_errors() {
        let ts = new_test_store();
        let result = ts.store.load_workspace(&WorkspaceName::from("ghost".to_string()));
        assert!(matches!(result, Err(StoreError::WorkspaceNotFound(_))));
    }

    #[test]
    fn list_workspaces_returns_all_sorted() {
        let ts = new_test_store();
        ts.store.save_workspace(&test_workspace("zebra")).unwrap();
        ts.store.save_workspace(&test_workspace("alpha")).unwrap();

        let workspaces = ts.store.list_workspaces().unwrap();
        assert_eq!(workspaces.len(), 2);
        assert_eq!(workspaces[0].name.as_str(), "alpha");
        assert_eq!(workspaces[1].name.as_str(), "zebra");
    }

    #[test]
    fn save_overwrites_existing_workspace_atomically() {
        let ts = new_test_store();
        let mut workspace = test_workspace("feature-x");
        ts.store.save_workspace(&workspace).unwrap();

        workspace.status = WorkspaceStatus::Retired;
        ts.store.save_workspace(&workspace).unwrap();

        let loaded = ts.store.load_workspace(&workspace.name).unwrap();
        assert_eq!(loaded.status, WorkspaceStatus::Retired);
    }

    #[test]
    fn delete_workspace_removes_file() {
        let ts = new_test_store();
        let workspace = test_workspace("doomed");
        ts.store.save_workspace(&workspace).unwrap();
        ts.store.delete_workspace(&workspace.name).unwrap();

        assert!(matches!(
            ts.store.load_workspace(&workspace.name),
            Err(StoreError::WorkspaceNotFound(_))
        ));
    }

    fn test_task(workspace: &str) -> Task {
        Task::new(
            WorkspaceName::from(workspace.to_string()),
            "standard".to_string(),
            "add widget support".to_string(),
            vec![StepRecord::pending(
                "gather_context".to_string(),
                atlas_core::types::StepKind::Gather,
            )],
        )
    }

    #[test]
    fn save_and_load_task_round_trips() {
        let ts = new_test_store();
        let task = test_task("feature-x");
        ts.store.save_task(&task).unwrap();

        let loaded = ts.store.load_task(&task.id).unwrap();
        assert_eq!(loaded.description, task.description);
        assert_eq!(loaded.status, TaskStatus::Pending);
    }

    #[test]
    fn load_missing_task_errors() {
        let ts = new_test_store();
        let result = ts.store.load_task(&TaskId::from_string("task-missing"));
        assert!(matches!(result, Err(StoreError::TaskNotFound(_))));
    }

    #[test]
    fn list_tasks_for_workspace_filters_by_workspace() {
        let ts = new_test_store();
        ts.store.save_task(&test_task("feature-x")).unwrap();
        ts.store.save_task(&test_task("feature-x")).unwrap();
        ts.store.save_task(&test_task("feature-y")).unwrap();

        let tasks = ts
            .store
            .list_tasks_for_workspace(&WorkspaceName::from("feature-x".to_string()))
            .unwrap();
        assert_eq!(tasks.len(), 2);
    }

    #[test]
    fn append_and_list_events_preserves_order() {
        let ts = new_test_store();
        let task = test_task("feature-x");
        ts.store.save_task(&task).unwrap();

        let first = ts
            .store
            .append_event(
                &task.id,
                EventPayload::TaskCreated(TaskCreatedPayload {
                    task_id: task.id.clone(),
                    workspace: task.workspace.clone(),
                    template: task.template.clone(),
                }),
            )
            .unwrap();

        let second = ts
            .store
            .append_event(
                &task.id,
                EventPayload::TaskCreated(TaskCreatedPayload {
                    task_id: task.id.clone(),
                    workspace: task.workspace.clone(),
                    template: task.template.clone(),
                }),
            )
            .unwrap();

        let events = ts.store.list_events(&task.id).unwrap();
        assert_eq!(events.len(), 2);
        assert!(events[0].timestamp <= events[1].timestamp);
        assert_eq!(events[0].timestamp, first.timestamp);
        assert_eq!(events[1].timestamp, second.timestamp);
    }

    #[test]
    fn list_events_for_task_with_no_events_is_empty() {
        let ts = new_test_store();
        let events = ts.store.list_events(&TaskId::from_string("task-none")).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn corrupted_task_file_is_reported() {
        let ts = new_test_store();
        let task = test_task("feature-x");
        ts.store.save_task(&task).unwrap();

        fs::write(ts.store.task_path(&task.workspace, &task.id), b"not valid json").unwrap();

        let result = ts.store.load_task(&task.id);
        assert!(matches!(result, Err(StoreError::CorruptedState(_))));
    }
}
