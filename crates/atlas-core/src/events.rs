//! Event types for the audit log (Section 4.3: every state transition is
//! recorded as an append-only event alongside the task's state file).

use crate::types::{Bucket, TaskId, TaskStatus, WorkspaceName};
use serde::{Deserialize, Serialize};

/// Event type names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    TaskCreated,
    TaskStarted,
    StepStarted,
    StepFinished,
    StatusChanged,
    ValidationFinished,
    CiCheckObserved,
    CiWatchFinished,
    TaskApproved,
    TaskRejected,
    TaskAbandoned,
    WorkspaceCreated,
    WorkspaceRetired,
    WorkspaceDestroyed,
}

impl EventType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TaskCreated => "TASK_CREATED",
            Self::TaskStarted => "TASK_STARTED",
            Self::StepStarted => "STEP_STARTED",
            Self::StepFinished => "STEP_FINISHED",
            Self::StatusChanged => "STATUS_CHANGED",
            Self::ValidationFinished => "VALIDATION_FINISHED",
            Self::CiCheckObserved => "CI_CHECK_OBSERVED",
            Self::CiWatchFinished => "CI_WATCH_FINISHED",
            Self::TaskApproved => "TASK_APPROVED",
            Self::TaskRejected => "TASK_REJECTED",
            Self::TaskAbandoned => "TASK_ABANDONED",
            Self::WorkspaceCreated => "WORKSPACE_CREATED",
            Self::WorkspaceRetired => "WORKSPACE_RETIRED",
            Self::WorkspaceDestroyed => "WORKSPACE_DESTROYED",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCreatedPayload {
    pub task_id: TaskId,
    pub workspace: WorkspaceName,
    pub template: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStartedPayload {
    pub task_id: TaskId,
    pub total_steps: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepStartedPayload {
    pub task_id: TaskId,
    pub step_name: String,
    pub attempt: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepFinishedPayload {
    pub task_id: TaskId,
    pub step_name: String,
    pub success: bool,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusChangedPayload {
    pub task_id: TaskId,
    pub from: TaskStatus,
    pub to: TaskStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationFinishedPayload {
    pub task_id: TaskId,
    pub success: bool,
    pub failed_step: Option<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CiCheckObservedPayload {
    pub task_id: TaskId,
    pub check_name: String,
    pub bucket: Bucket,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CiWatchFinishedPayload {
    pub task_id: TaskId,
    pub status: String,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskApprovedPayload {
    pub task_id: TaskId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRejectedPayload {
    pub task_id: TaskId,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAbandonedPayload {
    pub task_id: TaskId,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceCreatedPayload {
    pub workspace: WorkspaceName,
    pub branch: String,
    pub worktree_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceRetiredPayload {
    pub workspace: WorkspaceName,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceDestroyedPayload {
    pub workspace: WorkspaceName,
}

/// Union type for all event payloads, tagged by `event_type()` for storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventPayload {
    TaskCreated(TaskCreatedPayload),
    TaskStarted(TaskStartedPayload),
    StepStarted(StepStartedPayload),
    StepFinished(StepFinishedPayload),
    StatusChanged(StatusChangedPayload),
    ValidationFinished(ValidationFinishedPayload),
    CiCheckObserved(CiCheckObservedPayload),
    CiWatchFinished(CiWatchFinishedPayload),
    TaskApproved(TaskApprovedPayload),
    TaskRejected(TaskRejectedPayload),
    TaskAbandoned(TaskAbandonedPayload),
    WorkspaceCreated(WorkspaceCreatedPayload),
    WorkspaceRetired(WorkspaceRetiredPayload),
    WorkspaceDestroyed(WorkspaceDestroyedPayload),
}

impl EventPayload {
    #[must_use]
    pub fn event_type(&self) -> EventType {
        match self {
            Self::TaskCreated(_) => EventType::TaskCreated,
            Self::TaskStarted(_) => EventType::TaskStarted,
            Self::StepStarted(_) => EventType::StepStarted,
            Self::StepFinished(_) => EventType::StepFinished,
            Self::StatusChanged(_) => EventType::StatusChanged,
            Self::ValidationFinished(_) => EventType::ValidationFinished,
            Self::CiCheckObserved(_) => EventType::CiCheckObserved,
            Self::CiWatchFinished(_) => EventType::CiWatchFinished,
            Self::TaskApproved(_) => EventType::TaskApproved,
            Self::TaskRejected(_) => EventType::TaskRejected,
            Self::TaskAbandoned(_) => EventType::TaskAbandoned,
            Self::WorkspaceCreated(_) => EventType::WorkspaceCreated,
            Self::WorkspaceRetired(_) => EventType::WorkspaceRetired,
            Self::WorkspaceDestroyed(_) => EventType::WorkspaceDestroyed,
        }
    }

    /// Serialize to a single JSON line for the append-only event log.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// One line of the audit log: a timestamped, typed event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub event_type: EventType,
    #[serde(flatten)]
    pub payload: EventPayload,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_serializes_screaming_snake_case() {
        assert_eq!(
            serde_json::to_string(&EventType::TaskCreated).unwrap(),
            "\"TASK_CREATED\""
        );
        assert_eq!(
            serde_json::to_string(&EventType::CiWatchFinished).unwrap(),
            "\"CI_WATCH_FINISHED\""
        );
    }

    #[test]
    fn task_created_payload_round_trips() {
        let payload = TaskCreatedPayload {
            task_id: TaskId::from_string("task-20260727-101530-0001a"),
            workspace: WorkspaceName::from("my-feature".to_string()),
            template: "standard".to_string(),
        };
        let json = serde_json::to_string(&payload).unwrap();
        let parsed: TaskCreatedPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.template, "standard");
    }

    #[test]
    fn status_changed_payload_via_union() {
        let event = EventPayload::StatusChanged(StatusChangedPayload {
            task_id: TaskId::from_string("task-1"),
            from: TaskStatus::Running,
            to: TaskStatus::Validating,
        });
        assert_eq!(event.event_type(), EventType::StatusChanged);
        let json = event.to_json().unwrap();
        assert!(json.contains("running"));
        assert!(json.contains("validating"));
    }

    #[test]
    fn ci_check_observed_payload_round_trips() {
        let payload = CiCheckObservedPayload {
            task_id: TaskId::from_string("task-2"),
            check_name: "build".to_string(),
            bucket: Bucket::Pass,
        };
        let json = serde_json::to_string(&payload).unwrap();
        let parsed: CiCheckObservedPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.check_name, "build");
        assert_eq!(parsed.bucket, Bucket::Pass);
    }

    #[test]
    fn event_envelope_flattens_payload_fields() {
        let event = Event {
            timestamp: chrono::Utc::now(),
            event_type: EventType::TaskApproved,
            payload: EventPayload::TaskApproved(TaskApprovedPayload {
                task_id: TaskId::from_string("task-3"),
            }),
        };
        let json = serde_json::to_string(&event).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["task_id"], "task-3");
        assert_eq!(parsed["event_type"], "TASK_APPROVED");
    }
}
