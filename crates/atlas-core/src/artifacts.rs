//! Versioned artifact storage for a task's directory (Section 4.1:
//! `SaveVersionedArtifact`).
//!
//! Each task gets one `artifacts/` directory under its task directory. The
//! first save for a given basename writes the bare basename (version 0) and
//! is never touched again; every subsequent save writes a new file at the
//! next `basename.<N>` suffix. `read_latest_artifact` returns the
//! highest-numbered version, falling back to the bare basename if no
//! numbered version exists yet.

use crate::types::Artifact;
use sha2::{Digest, Sha256};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, ArtifactError>;

fn compute_checksum(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    format!("{:x}", hasher.finalize())
}

/// Directory holding a task's artifacts: `<task_dir>/artifacts/`.
#[must_use]
pub fn artifacts_dir(task_dir: &Path) -> PathBuf {
    task_dir.join("artifacts")
}

/// Highest existing version suffix for `basename` already present in `dir`,
/// or 0 if only the bare basename (or nothing) exists.
fn highest_existing_version(dir: &Path, basename: &str) -> io::Result<u32> {
    let mut highest = 0;
    if !dir.exists() {
        return Ok(highest);
    }
    let prefix = format!("{basename}.");
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(suffix) = name.strip_prefix(&prefix) {
            if let Ok(version) = suffix.parse::<u32>() {
                highest = highest.max(version);
            }
        }
    }
    Ok(highest)
}

/// Save `content` as the next version of `basename` in the task's artifact
/// directory. The bare basename is written once, on the first save, and
/// never overwritten again; every later save for the same basename lands at
/// `basename.<max prior version + 1>` (Section 8, testable property 2).
pub fn save_versioned_artifact(
    task_dir: &Path,
    basename: &str,
    content: &[u8],
    written_at: chrono::DateTime<chrono::Utc>,
) -> Result<Artifact> {
    let dir = artifacts_dir(task_dir);
    fs::create_dir_all(&dir)?;

    let bare_path = dir.join(basename);
    let (filename, version) = if bare_path.exists() {
        let version = highest_existing_version(&dir, basename)? + 1;
        (format!("{basename}.{version}"), version)
    } else {
        (basename.to_string(), 0)
    };
    fs::write(dir.join(&filename), content)?;

    Ok(Artifact {
        basename: basename.to_string(),
        filename,
        version,
        checksum: compute_checksum(content),
        written_at,
    })
}

/// Read the latest version of an artifact, if present: the highest-numbered
/// `basename.<N>`, or the bare basename if no numbered version exists yet.
pub fn read_latest_artifact(task_dir: &Path, basename: &str) -> Result<Option<Vec<u8>>> {
    let dir = artifacts_dir(task_dir);
    let highest = highest_existing_version(&dir, basename)?;
    let path = if highest > 0 { dir.join(format!("{basename}.{highest}")) } else { dir.join(basename) };
    if !path.exists() {
        return Ok(None);
    }
    Ok(Some(fs::read(&path)?))
}
