pub mod artifacts;
pub mod config;
pub mod errors;
pub mod events;
pub mod types;

pub use artifacts::{artifacts_dir, read_latest_artifact, save_versioned_artifact};
pub use config::Config;
pub use errors::{ErrorKind, UserVisibleFailure};
pub use events::{Event, EventPayload, EventType};
pub use types::{
    Artifact, Bucket, CheckResult, CommandOutcome, PipelineResult, StepKind, StepRecord,
    StepRunStatus, Task, TaskId, TaskStatus, WatchResult, WatchStatus, Workspace, WorkspaceName,
    WorkspaceStatus, SCHEMA_VERSION,
};
