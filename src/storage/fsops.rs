//! Atomic file replacement.
//!
//! Every durable write goes through a staged temp file in the scratch
//! directory that is fsynced and then renamed over the canonical path. Readers
//! see either the old file or the new one, never a partial write. The scratch
//! directory must live on the same filesystem as the canonical files.

use std::fs;
use std::io::Write;
use std::path::Path;
use std::time::Duration;

use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::error::{KbError, KbResult};

/// Bounded retry with exponential backoff for transient rename failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(25),
        }
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32, backoff_ms: u64) -> Self {
        Self {
            attempts: attempts.max(1),
            backoff: Duration::from_millis(backoff_ms),
        }
    }

    /// Delay after the given failed attempt (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        self.backoff
            .saturating_mul(1u32 << attempt.saturating_sub(1).min(16))
    }
}

/// Writes `bytes` to a new temp file under `scratch_dir` and fsyncs it.
///
/// Dropping the returned handle without committing deletes the temp file and
/// leaves every canonical file untouched.
pub fn stage_bytes(scratch_dir: &Path, bytes: &[u8]) -> KbResult<NamedTempFile> {
    fs::create_dir_all(scratch_dir).map_err(|e| KbError::FileWrite {
        path: scratch_dir.to_path_buf(),
        source: e,
    })?;

    let wrap = |e: std::io::Error| KbError::FileWrite {
        path: scratch_dir.to_path_buf(),
        source: e,
    };
    let mut staged = tempfile::Builder::new()
        .prefix(".stage-")
        .suffix(".tmp")
        .tempfile_in(scratch_dir)
        .map_err(wrap)?;
    staged.write_all(bytes).map_err(wrap)?;
    staged.as_file().sync_all().map_err(wrap)?;

    debug!(path = %staged.path().display(), bytes = bytes.len(), "staged file");
    Ok(staged)
}

/// Renames a staged file over `dest`, retrying per `policy`.
///
/// On final failure the staged file is removed and `dest` keeps its previous
/// content.
pub fn commit_staged(staged: NamedTempFile, dest: &Path, policy: &RetryPolicy) -> KbResult<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(|e| KbError::FileWrite {
            path: parent.to_path_buf(),
            source: e,
        })?;
    }

    let max_attempts = policy.attempts.max(1);
    let mut staged = staged;
    let mut attempt = 0;
    loop {
        attempt += 1;
        match staged.persist(dest) {
            Ok(_) => {
                sync_parent_dir(dest);
                debug!(path = %dest.display(), attempt, "committed staged file");
                return Ok(());
            }
            Err(err) if attempt >= max_attempts => {
                return Err(KbError::AtomicSwap {
                    path: dest.to_path_buf(),
                    attempts: attempt,
                    source: err.error,
                });
            }
            Err(err) => {
                let delay = policy.delay(attempt);
                warn!(
                    path = %dest.display(),
                    attempt,
                    error = %err.error,
                    "rename failed, retrying in {delay:?}"
                );
                staged = err.file;
                std::thread::sleep(delay);
            }
        }
    }
}

/// Stages and commits `bytes` as the new content of `dest`.
pub fn write_atomically(
    scratch_dir: &Path,
    dest: &Path,
    bytes: &[u8],
    policy: &RetryPolicy,
) -> KbResult<()> {
    let staged = stage_bytes(scratch_dir, bytes)?;
    commit_staged(staged, dest, policy)
}

#[cfg(unix)]
fn sync_parent_dir(path: &Path) {
    if let Some(parent) = path.parent() {
        if let Err(e) = fs::File::open(parent).and_then(|dir| dir.sync_all()) {
            debug!(path = %parent.display(), error = %e, "directory fsync skipped");
        }
    }
}

#[cfg(not(unix))]
fn sync_parent_dir(_path: &Path) {}
