//! Shared error taxonomy (Section 7).
//!
//! Every component error type exposes a `kind() -> ErrorKind` so the engine's
//! failure-to-status mapping (Section 4.8 step 5) is one match over this enum
//! regardless of which component raised the underlying error.

use serde::{Deserialize, Serialize};

/// Disposition-bearing classification of any error the engine can observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Cancelled,
    Transient,
    PermanentAuth,
    NotFound,
    InvalidState,
    CorruptedState,
    ValidationFailed,
    CiFailed,
    CiTimeout,
    CiMissingRequired,
    GitPushRejected,
    PrCreationFailed,
    Io,
}

impl ErrorKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cancelled => "cancelled",
            Self::Transient => "transient",
            Self::PermanentAuth => "permanent_auth",
            Self::NotFound => "not_found",
            Self::InvalidState => "invalid_state",
            Self::CorruptedState => "corrupted_state",
            Self::ValidationFailed => "validation_failed",
            Self::CiFailed => "ci_failed",
            Self::CiTimeout => "ci_timeout",
            Self::CiMissingRequired => "ci_missing_required",
            Self::GitPushRejected => "git_push_rejected",
            Self::PrCreationFailed => "pr_creation_failed",
            Self::Io => "io",
        }
    }

    /// Whether the Retry Controller (C4) should retry an error of this kind,
    /// absent a more specific subsystem classifier (Section 4.4).
    #[must_use]
    pub fn is_retryable_by_default(self) -> bool {
        matches!(self, Self::Transient)
    }
}

/// A user-visible failure record: kind, originating step, short message, and
/// a pointer to the artifact carrying full diagnostics (Section 7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserVisibleFailure {
    pub kind: ErrorKind,
    pub step_name: String,
    pub message: String,
    pub diagnostics_artifact: Option<String>,
}
