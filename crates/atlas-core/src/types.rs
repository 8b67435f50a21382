//! Core data model for the Task Orchestration Engine.
//!
//! See spec Section 3 (Data Model) and Section 4.5/4.6 (pipeline/watch result shapes).

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Current on-disk schema major version. Readers refuse unknown majors (Section 6).
pub const SCHEMA_VERSION: u32 = 1;

/// A workspace name: lowercase, hyphenated, unique within the host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkspaceName(String);

impl WorkspaceName {
    /// Sanitize an arbitrary string into a valid workspace name: lowercase,
    /// non-alphanumeric runs collapsed to a single hyphen, leading/trailing
    /// hyphens trimmed.
    #[must_use]
    pub fn sanitize(raw: &str) -> Self {
        let mut out = String::with_capacity(raw.len());
        let mut last_was_sep = false;
        for ch in raw.to_lowercase().chars() {
            if ch.is_ascii_alphanumeric() {
                out.push(ch);
                last_was_sep = false;
            } else if !last_was_sep && !out.is_empty() {
                out.push('-');
                last_was_sep = true;
            }
        }
        while out.ends_with('-') {
            out.pop();
        }
        if out.is_empty() {
            out.push_str("workspace");
        }
        Self(out)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkspaceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for WorkspaceName {
    fn from(value: String) -> Self {
        Self::sanitize(&value)
    }
}

/// A task identifier: `task-YYYYMMDD-HHMMSS-<rand>` (Section 3).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Generate a new task id from the current time.
    #[must_use]
    pub fn new() -> Self {
        Self::at(Utc::now())
    }

    /// Generate a task id stamped at a specific instant (used by tests so ids
    /// are reproducible without reaching for wall-clock time).
    #[must_use]
    pub fn at(when: DateTime<Utc>) -> Self {
        let rand_suffix: u32 = rand::thread_rng().gen_range(0..0x0010_0000);
        Self(format!(
            "task-{}-{:05x}",
            when.format("%Y%m%d-%H%M%S"),
            rand_suffix
        ))
    }

    /// Wrap an existing string as a task id without validation (used when
    /// reading ids back from the filesystem's directory names).
    #[must_use]
    pub fn from_string(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle status of a Workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceStatus {
    Active,
    Paused,
    Retired,
}

impl WorkspaceStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Retired => "retired",
        }
    }
}

/// A named, isolated working directory (worktree) and its metadata (Section 3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    pub schema_version: u32,
    pub name: WorkspaceName,
    pub branch: String,
    pub worktree_path: String,
    pub base_branch: String,
    pub status: WorkspaceStatus,
    pub created_at: DateTime<Utc>,
    /// Back-reference to the most recently created task, if any.
    pub latest_task_id: Option<TaskId>,
}

/// Status of a Task (Section 4.8 state machine).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Validating,
    ValidationFailed,
    AwaitingApproval,
    Completed,
    Rejected,
    Abandoned,
    GhFailed,
    CiFailed,
    CiTimeout,
}

impl TaskStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Validating => "validating",
            Self::ValidationFailed => "validation_failed",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Completed => "completed",
            Self::Rejected => "rejected",
            Self::Abandoned => "abandoned",
            Self::GhFailed => "gh_failed",
            Self::CiFailed => "ci_failed",
            Self::CiTimeout => "ci_timeout",
        }
    }

    /// Whether this status is terminal (Section 3, invariant 3).
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Rejected | Self::Abandoned)
    }

    /// Whether this status counts as an "attention state" (Glossary) demanding
    /// user action before further progress.
    #[must_use]
    pub fn needs_attention(self) -> bool {
        matches!(
            self,
            Self::ValidationFailed
                | Self::AwaitingApproval
                | Self::GhFailed
                | Self::CiFailed
                | Self::CiTimeout
        )
    }

    /// Whether `to` is an allowed transition from `self`, per Section 4.8's
    /// state diagram. Used both by the engine (to reject impossible moves)
    /// and by tests validating invariant 1.
    #[must_use]
    pub fn can_transition_to(self, to: Self) -> bool {
        use TaskStatus::{
            Abandoned, AwaitingApproval, CiFailed, CiTimeout, Completed, GhFailed, Pending,
            Rejected, Running, Validating, ValidationFailed,
        };
        matches!(
            (self, to),
            (Pending, Running)
                | (Running, Validating)
                | (Running, GhFailed)
                | (Running, CiFailed)
                | (Running, CiTimeout)
                | (Validating, AwaitingApproval)
                | (Validating, ValidationFailed)
                | (ValidationFailed, Running)
                | (ValidationFailed, Abandoned)
                | (AwaitingApproval, Completed)
                | (AwaitingApproval, Running)
                | (AwaitingApproval, Rejected)
                | (GhFailed, Running)
                | (GhFailed, Abandoned)
                | (CiFailed, Running)
                | (CiFailed, Abandoned)
                | (CiTimeout, Running)
                | (CiTimeout, Abandoned)
        )
    }
}

/// Status of an individual StepRecord.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepRunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

/// The kind of a step, dispatched by the Step Executors (Section 4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Ai,
    Gather,
    Validation,
    Git,
    Ci,
    Human,
    Sdd,
}

impl StepKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ai => "ai",
            Self::Gather => "gather",
            Self::Validation => "validation",
            Self::Git => "git",
            Self::Ci => "ci",
            Self::Human => "human",
            Self::Sdd => "sdd",
        }
    }
}

/// One recorded execution of a step within a task (Section 3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub name: String,
    pub kind: StepKind,
    pub status: StepRunStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub attempt: u32,
    pub artifacts: Vec<String>,
    pub error: Option<String>,
}

impl StepRecord {
    #[must_use]
    pub fn pending(name: impl Into<String>, kind: StepKind) -> Self {
        Self {
            name: name.into(),
            kind,
            status: StepRunStatus::Pending,
            started_at: None,
            completed_at: None,
            attempt: 0,
            artifacts: Vec::new(),
            error: None,
        }
    }
}

/// One run of a template inside a workspace (Section 3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub schema_version: u32,
    pub id: TaskId,
    pub workspace: WorkspaceName,
    pub template: String,
    pub status: TaskStatus,
    pub current_step_index: usize,
    pub total_steps: usize,
    pub steps: Vec<StepRecord>,
    pub description: String,
    /// Free-form template variables, including rejection feedback (Section 4.8).
    pub variables: serde_json::Map<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    #[must_use]
    pub fn new(
        workspace: WorkspaceName,
        template: impl Into<String>,
        description: impl Into<String>,
        steps: Vec<StepRecord>,
    ) -> Self {
        let now = Utc::now();
        let total_steps = steps.len();
        Self {
            schema_version: SCHEMA_VERSION,
            id: TaskId::new(),
            workspace,
            template: template.into(),
            status: TaskStatus::Pending,
            current_step_index: 0,
            total_steps,
            steps,
            description: description.into(),
            variables: serde_json::Map::new(),
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub fn current_step(&self) -> Option<&StepRecord> {
        self.steps.get(self.current_step_index)
    }
}

/// An immutable, versioned payload written under `<task_dir>/artifacts/` (Section 3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub basename: String,
    /// Resolved on-disk filename, e.g. `validation.2.json`.
    pub filename: String,
    pub version: u32,
    pub checksum: String,
    pub written_at: DateTime<Utc>,
}

/// Result of one external command within the validation pipeline (Section 4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandOutcome {
    pub command: String,
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

/// Result of the whole validation pipeline (Section 4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineResult {
    pub success: bool,
    pub format_results: Vec<CommandOutcome>,
    pub lint_results: Vec<CommandOutcome>,
    pub test_results: Vec<CommandOutcome>,
    pub pre_commit_results: Vec<CommandOutcome>,
    pub duration_ms: u64,
    pub failed_step: Option<String>,
}

/// Categorical outcome of an external CI check (Glossary: Bucket).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bucket {
    Pass,
    Fail,
    Pending,
    Skipping,
    Cancel,
}

/// One external check as reported by the check-listing subprocess (Section 4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub state: String,
    pub bucket: Bucket,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub description: Option<String>,
    pub workflow: Option<String>,
    pub url: Option<String>,
    pub duration_ms: Option<u64>,
}

/// Overall status of a CI watch poll (Section 4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchStatus {
    Success,
    Failure,
    Pending,
    Timeout,
}

/// Terminal or in-progress result of a CI watch (Section 4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchResult {
    pub status: WatchStatus,
    pub checks: Vec<CheckResult>,
    pub elapsed_ms: u64,
}
