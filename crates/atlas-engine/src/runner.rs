//! Command Runner (C3): the single contract every external command goes
//! through (Section 4.3). AI CLI, git, `gh`, and validation commands all
//! flow through here so cancellation, capture, and timeout behavior is
//! implemented exactly once.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Output captured past this many bytes is truncated with a marker, so a
/// runaway process cannot exhaust memory holding its output in RAM.
const MAX_CAPTURE_BYTES: usize = 1024 * 1024;
const TRUNCATION_MARKER: &str = "\n...[truncated]...\n";

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("command not found: {0}")]
    NotFound(String),
    #[error("cancelled")]
    Cancelled,
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RunnerError {
    #[must_use]
    pub fn kind(&self) -> atlas_core::ErrorKind {
        match self {
            Self::NotFound(_) => atlas_core::ErrorKind::NotFound,
            Self::Cancelled => atlas_core::ErrorKind::Cancelled,
            Self::Timeout(_) => atlas_core::ErrorKind::Transient,
            Self::Io(_) => atlas_core::ErrorKind::Io,
        }
    }
}

pub type Result<T> = std::result::Result<T, RunnerError>;

/// Outcome of one subprocess invocation.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration: Duration,
    pub truncated: bool,
}

async fn read_capped<R: AsyncRead + Unpin>(mut reader: R) -> std::io::Result<(String, bool)> {
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];
    let mut truncated = false;
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        if buf.len() + n > MAX_CAPTURE_BYTES {
            let remaining = MAX_CAPTURE_BYTES.saturating_sub(buf.len());
            buf.extend_from_slice(&chunk[..remaining.min(n)]);
            truncated = true;
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    let mut text = String::from_utf8_lossy(&buf).into_owned();
    if truncated {
        text.push_str(TRUNCATION_MARKER);
    }
    Ok((text, truncated))
}

/// Run `program args...` under `workdir`, bound to `cancel` and `timeout_dur`.
///
/// On cancellation: kills the process and returns `Cancelled` once the wait
/// resolves. On timeout: kills the process and returns `Timeout`. A non-zero
/// exit code is not an error here — it is reported via `RunOutcome::exit_code`
/// so callers (the Validation Pipeline in particular) can distinguish "the
/// command ran and failed" from "the command could not be run at all".
pub async fn run(
    cancel: &CancellationToken,
    workdir: &Path,
    program: &str,
    args: &[&str],
    timeout_dur: Duration,
) -> Result<RunOutcome> {
    if cancel.is_cancelled() {
        return Err(RunnerError::Cancelled);
    }

    let start = std::time::Instant::now();
    debug!(program, workdir = %workdir.display(), "spawning command");

    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(workdir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd.spawn().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            RunnerError::NotFound(program.to_string())
        } else {
            RunnerError::Io(e)
        }
    })?;

    let stdout_pipe = child.stdout.take().expect("stdout piped");
    let stderr_pipe = child.stderr.take().expect("stderr piped");

    let wait = async {
        let (stdout_res, stderr_res, status) = tokio::join!(
            read_capped(stdout_pipe),
            read_capped(stderr_pipe),
            child.wait(),
        );
        (stdout_res, stderr_res, status)
    };

    let raced = tokio::select! {
        biased;
        () = cancel.cancelled() => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            return Err(RunnerError::Cancelled);
        }
        result = timeout(timeout_dur, wait) => result,
    };

    let (stdout_res, stderr_res, status) = match raced {
        Ok(v) => v,
        Err(_) => {
            warn!(program, timeout = ?timeout_dur, "command timed out");
            let _ = child.start_kill();
            let _ = child.wait().await;
            return Err(RunnerError::Timeout(timeout_dur));
        }
    };

    let (stdout, stdout_trunc) = stdout_res?;
    let (stderr, stderr_trunc) = stderr_res?;
    let status = status?;

    Ok(RunOutcome {
        stdout,
        stderr,
        exit_code: status.code().unwrap_or(-1),
        duration: start.elapsed(),
        truncated: stdout_trunc || stderr_trunc,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn runs_successful_command() {
        let cancel = CancellationToken::new();
        let outcome = run(&cancel, Path::new("."), "true", &[], Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, 0);
    }

    #[tokio::test]
    async fn captures_stdout() {
        let cancel = CancellationToken::new();
        let outcome = run(&cancel, Path::new("."), "echo", &["hello"], Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(outcome.stdout.trim(), "hello");
        assert_eq!(outcome.exit_code, 0);
    }

    #[tokio::test]
    async fn nonzero_exit_reports_code_not_error() {
        let cancel = CancellationToken::new();
        let outcome = run(&cancel, Path::new("."), "false", &[], Duration::from_secs(5))
            .await
            .unwrap();
        assert_ne!(outcome.exit_code, 0);
    }

    #[tokio::test]
    async fn missing_binary_is_not_found() {
        let cancel = CancellationToken::new();
        let err = run(&cancel, Path::new("."), "definitely-not-a-real-binary", &[], Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::NotFound(_)));
    }

    #[tokio::test]
    async fn already_cancelled_scope_short_circuits() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = run(&cancel, Path::new("."), "true", &[], Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::Cancelled));
    }

    #[tokio::test]
    async fn timeout_kills_long_running_process() {
        let cancel = CancellationToken::new();
        let err = run(&cancel, Path::new("."), "sleep", &["5"], Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::Timeout(_)));
    }
}
