//! CI Watcher (C6): polls an opaque check-listing command for a PR, reducing
//! whatever comes back into one of `{success, failure, pending, timeout}`
//! (Section 4.6).

use crate::retry::{self, Disposition, RetryPolicy};
use atlas_core::{Bucket, CheckResult, WatchResult, WatchStatus};
use std::future::Future;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("cancelled")]
    Cancelled,
    #[error("required check pattern matched no checks: {0}")]
    RequiredCheckMissing(String),
    #[error("check lister failed: {0}")]
    ListerFailed(String),
}

impl WatchError {
    #[must_use]
    pub fn kind(&self) -> atlas_core::ErrorKind {
        match self {
            Self::Cancelled => atlas_core::ErrorKind::Cancelled,
            Self::RequiredCheckMissing(_) => atlas_core::ErrorKind::CiMissingRequired,
            Self::ListerFailed(_) => atlas_core::ErrorKind::Transient,
        }
    }
}

pub type Result<T> = std::result::Result<T, WatchError>;

#[derive(Debug, Clone)]
pub struct WatchSpec {
    pub required_checks: Vec<String>,
    pub interval: Duration,
    pub timeout: Duration,
    pub bell_enabled: bool,
}

impl WatchSpec {
    #[must_use]
    pub fn from_config(config: &atlas_core::Config, required_checks: Vec<String>) -> Self {
        Self {
            required_checks,
            interval: Duration::from_secs(u64::from(config.ci_poll_interval_sec).max(1)),
            timeout: Duration::from_secs(u64::from(config.ci_timeout_sec).max(1)),
            bell_enabled: config.bell_enabled,
        }
    }
}

/// Glob-style match over check names (Section 4.6: "may contain wildcards
/// where `*` matches any suffix"). `glob::Pattern` handles this directly even
/// though the crate's usual job is filesystem globbing.
fn matches_pattern(name: &str, pattern: &str) -> bool {
    glob::Pattern::new(pattern).map(|p| p.matches(name)).unwrap_or(false)
}

fn filter_required<'a>(checks: &'a [CheckResult], required: &[String]) -> Vec<&'a CheckResult> {
    if required.is_empty() {
        return checks.iter().collect();
    }
    checks
        .iter()
        .filter(|c| required.iter().any(|p| matches_pattern(&c.name, p)))
        .collect()
}

/// A required check with bucket `skipping` counts as pass (Section 9: penalizing
/// path-based skip rules would make unrelated changes permanently unable to
/// pass CI, which is worse than rarely missing a real skip-masking regression).
fn bucket_counts_as_pass(bucket: Bucket) -> bool {
    matches!(bucket, Bucket::Pass | Bucket::Skipping)
}

fn reduce_status(filtered: &[&CheckResult]) -> WatchStatus {
    // An empty check set is never "vacuously successful" (Section 8: empty
    // required-checks + empty response must read pending, not success).
    if filtered.is_empty() {
        return WatchStatus::Pending;
    }
    if filtered.iter().any(|c| matches!(c.bucket, Bucket::Fail | Bucket::Cancel)) {
        return WatchStatus::Failure;
    }
    if filtered.iter().all(|c| bucket_counts_as_pass(c.bucket)) {
        return WatchStatus::Success;
    }
    WatchStatus::Pending
}

/// Poll `list_checks` (a thunk calling out to the external check lister, e.g.
/// `gh pr checks`) until the required checks settle, time out, or the scope
/// is cancelled.
pub async fn watch<F, Fut>(
    cancel: &CancellationToken,
    spec: &WatchSpec,
    retry_policy: &RetryPolicy,
    mut list_checks: F,
    mut on_progress: impl FnMut(Duration, &[CheckResult]),
) -> Result<WatchResult>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<Vec<CheckResult>, String>>,
{
    let start = Instant::now();
    let mut last_status = WatchStatus::Pending;

    loop {
        if cancel.is_cancelled() {
            return Err(WatchError::Cancelled);
        }

        let checks = retry::with_retry(
            cancel,
            retry_policy,
            &mut list_checks,
            |_: &String| Disposition::Retry,
        )
        .await
        .map_err(WatchError::ListerFailed)?;

        let filtered = filter_required(&checks, &spec.required_checks);
        if !spec.required_checks.is_empty() && filtered.is_empty() {
            return Err(WatchError::RequiredCheckMissing(spec.required_checks.join(",")));
        }

        let elapsed = start.elapsed();
        let filtered_owned: Vec<CheckResult> = filtered.into_iter().cloned().collect();
        on_progress(elapsed, &filtered_owned);

        let status = reduce_status(&filtered_owned.iter().collect::<Vec<_>>());
        if status != WatchStatus::Pending {
            if spec.bell_enabled && last_status == WatchStatus::Pending {
                info!(status = ?status, "ci watch terminal transition");
            }
            return Ok(WatchResult { status, checks: filtered_owned, elapsed_ms: elapsed.as_millis() as u64 });
        }
        last_status = status;

        if elapsed >= spec.timeout {
            if spec.bell_enabled {
                info!("ci watch timed out");
            }
            return Ok(WatchResult {
                status: WatchStatus::Timeout,
                checks: filtered_owned,
                elapsed_ms: elapsed.as_millis() as u64,
            });
        }

        let remaining = spec.timeout.saturating_sub(elapsed);
        let sleep_for = spec.interval.min(remaining);
        tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(WatchError::Cancelled),
            () = tokio::time::sleep(sleep_for) => {}
        }
    }
}
