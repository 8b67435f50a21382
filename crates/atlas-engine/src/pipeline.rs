//! Validation Pipeline (C5): format, then a parallel group of lint/test/
//! pre_commit (Section 4.5). The default and only implemented sibling-failure
//! policy is let-finish: every command in the parallel group runs to
//! completion even after the first failure, so the user sees every failure at
//! once (Section 9 design notes).

use crate::runner::{self, RunnerError};
use atlas_core::{CommandOutcome, PipelineResult};
use chrono::Utc;
use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Commands configured for one validation run (Section 4.5 stage list).
#[derive(Debug, Clone, Default)]
pub struct PipelineSpec {
    pub format_cmds: Vec<String>,
    pub lint_cmds: Vec<String>,
    pub test_cmds: Vec<String>,
    pub pre_commit_cmds: Vec<String>,
}

fn split_cmd(cmd: &str) -> Option<(&str, Vec<&str>)> {
    let mut parts = cmd.split_whitespace();
    let program = parts.next()?;
    Some((program, parts.collect()))
}

async fn run_one(cancel: &CancellationToken, workdir: &Path, cmd: &str, timeout_dur: Duration) -> CommandOutcome {
    let started_at = Utc::now();
    let Some((program, args)) = split_cmd(cmd) else {
        let completed_at = Utc::now();
        return CommandOutcome {
            command: cmd.to_string(),
            success: false,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: 0,
            error: Some("empty command".to_string()),
            started_at,
            completed_at,
        };
    };

    match runner::run(cancel, workdir, program, &args, timeout_dur).await {
        Ok(outcome) => {
            let completed_at = Utc::now();
            CommandOutcome {
                command: cmd.to_string(),
                success: outcome.exit_code == 0,
                exit_code: Some(outcome.exit_code),
                stdout: outcome.stdout,
                stderr: outcome.stderr,
                duration_ms: outcome.duration.as_millis() as u64,
                error: None,
                started_at,
                completed_at,
            }
        }
        Err(err) => {
            let completed_at = Utc::now();
            let is_cancelled = matches!(err, RunnerError::Cancelled);
            CommandOutcome {
                command: cmd.to_string(),
                success: false,
                exit_code: None,
                stdout: String::new(),
                stderr: String::new(),
                duration_ms: (completed_at - started_at).num_milliseconds().max(0) as u64,
                error: Some(if is_cancelled { "cancelled".to_string() } else { err.to_string() }),
                started_at,
                completed_at,
            }
        }
    }
}

/// Run a stage's command list sequentially, short-circuiting after the first
/// failure within the stage (a stage itself is not a parallel group — only
/// lint/test/pre_commit run concurrently *with each other*).
async fn run_stage_sequential(
    cancel: &CancellationToken,
    workdir: &Path,
    cmds: &[String],
    timeout_dur: Duration,
) -> Vec<CommandOutcome> {
    let mut results = Vec::with_capacity(cmds.len());
    for cmd in cmds {
        let outcome = run_one(cancel, workdir, cmd, timeout_dur).await;
        let failed = !outcome.success;
        results.push(outcome);
        if failed {
            break;
        }
    }
    results
}

fn stage_success(results: &[CommandOutcome]) -> bool {
    results.iter().all(|r| r.success)
}

/// Run the full pipeline: format, then lint ∥ test ∥ pre_commit.
pub async fn run_pipeline(
    cancel: &CancellationToken,
    workdir: &Path,
    spec: &PipelineSpec,
    timeout_dur: Duration,
) -> PipelineResult {
    let start = std::time::Instant::now();

    let format_results = run_stage_sequential(cancel, workdir, &spec.format_cmds, timeout_dur).await;
    let format_ok = stage_success(&format_results);

    // Section 4.5: the format stage completes before the parallel group
    // starts. If format itself fails, the group still runs (let-finish
    // applies pipeline-wide, not just within the group) so the caller sees
    // every failure in one report.
    let (lint_results, test_results, pre_commit_results) = tokio::join!(
        run_stage_sequential(cancel, workdir, &spec.lint_cmds, timeout_dur),
        run_stage_sequential(cancel, workdir, &spec.test_cmds, timeout_dur),
        run_stage_sequential(cancel, workdir, &spec.pre_commit_cmds, timeout_dur),
    );

    let lint_ok = stage_success(&lint_results);
    let test_ok = stage_success(&test_results);
    let pre_commit_ok = stage_success(&pre_commit_results);
    let success = format_ok && lint_ok && test_ok && pre_commit_ok;

    let failed_step = if !format_ok {
        Some("format".to_string())
    } else if !lint_ok {
        Some("lint".to_string())
    } else if !test_ok {
        Some("test".to_string())
    } else if !pre_commit_ok {
        Some("pre_commit".to_string())
    } else {
        None
    };

    let duration_ms = start.elapsed().as_millis() as u64;
    info!(success, failed_step = ?failed_step, duration_ms, "validation pipeline finished");

    PipelineResult {
        success,
        format_results,
        lint_results,
        test_results,
        pre_commit_results,
        duration_ms,
        failed_step,
    }
}
