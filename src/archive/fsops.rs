//! Filesystem primitives for the archive: bounded retries, atomic writes
//! and moves that never leave half a directory visible.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use tempfile::NamedTempFile;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::config::TransferConfig;
use crate::error::{is_cross_device, is_transient_io, Result, StationError};

/// Bounded retry for operations that can hit a locked file or a flaky share
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&TransferConfig::default())
    }
}

impl From<&TransferConfig> for RetryPolicy {
    fn from(config: &TransferConfig) -> Self {
        Self {
            attempts: config.retry_attempts.max(1),
            backoff: Duration::from_millis(config.retry_backoff_ms),
        }
    }
}

impl RetryPolicy {
    /// Run `f`, retrying transient failures with linear backoff.
    ///
    /// Non-transient errors are returned immediately.
    pub fn run<T>(
        &self,
        op: &'static str,
        path: &Path,
        mut f: impl FnMut() -> io::Result<T>,
    ) -> Result<T> {
        let mut attempt = 1;
        loop {
            match f() {
                Ok(value) => return Ok(value),
                Err(err) if is_transient_io(&err) => {
                    if attempt >= self.attempts {
                        return Err(StationError::RetriesExhausted {
                            op,
                            path: path.to_path_buf(),
                            attempts: attempt,
                            source: err,
                        });
                    }
                    warn!(op, path = %path.display(), attempt, error = %err, "transient failure, retrying");
                    thread::sleep(self.backoff * attempt);
                    attempt += 1;
                }
                Err(err) => return Err(StationError::io(op, path, err)),
            }
        }
    }
}

/// A fully written temp file waiting to replace its target
#[derive(Debug)]
pub struct StagedWrite {
    temp: NamedTempFile,
    target: PathBuf,
}

impl StagedWrite {
    /// Rename the temp file over the target
    pub fn commit(self) -> Result<()> {
        let target = self.target;
        self.temp
            .persist(&target)
            .map_err(|e| StationError::io("replace", &target, e.error))?;
        Ok(())
    }

    pub fn temp_path(&self) -> &Path {
        self.temp.path()
    }
}

/// Write `bytes` to a synced temp file next to `target`.
///
/// Nothing touches `target` until `commit`; dropping the result discards
/// the temp file.
pub fn stage_atomic(target: &Path, bytes: &[u8]) -> Result<StagedWrite> {
    let parent = match target.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent).map_err(|e| StationError::io("create dir", &parent, e))?;

    let mut temp =
        NamedTempFile::new_in(&parent).map_err(|e| StationError::io("create temp", &parent, e))?;
    temp.write_all(bytes)
        .and_then(|_| temp.as_file().sync_all())
        .map_err(|e| StationError::io("write temp", temp.path(), e))?;

    Ok(StagedWrite {
        temp,
        target: target.to_path_buf(),
    })
}

/// Read-modify-write friendly replacement: temp file, fsync, rename
pub fn write_atomic(target: &Path, bytes: &[u8]) -> Result<()> {
    stage_atomic(target, bytes)?.commit()
}

/// How a move was carried out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveKind {
    Renamed,
    Copied,
}

/// Move a whole directory to `dest` without exposing partial progress.
///
/// Same volume: a single rename. Across volumes: copy to a hidden sibling of
/// `dest`, verify sizes, rename into place, then delete the source.
pub fn move_dir(src: &Path, dest: &Path, policy: &RetryPolicy) -> Result<MoveKind> {
    if dest.exists() {
        return Err(StationError::DestinationExists(dest.to_path_buf()));
    }

    match policy.run("rename", src, || fs::rename(src, dest)) {
        Ok(()) => Ok(MoveKind::Renamed),
        Err(StationError::Io { source, .. }) if is_cross_device(&source) => {
            debug!(src = %src.display(), dest = %dest.display(), "cross-volume move, copying");
            copy_then_swap(src, dest, policy)?;
            Ok(MoveKind::Copied)
        }
        Err(err) => Err(err),
    }
}

/// Move one file, falling back to copy + verify + rename across volumes
pub fn move_file(src: &Path, dest: &Path, policy: &RetryPolicy) -> Result<MoveKind> {
    if dest.exists() {
        return Err(StationError::DestinationExists(dest.to_path_buf()));
    }

    match policy.run("rename", src, || fs::rename(src, dest)) {
        Ok(()) => Ok(MoveKind::Renamed),
        Err(StationError::Io { source, .. }) if is_cross_device(&source) => {
            let temp = partial_sibling(dest);
            let copied = policy
                .run("copy", src, || fs::copy(src, &temp))
                .and_then(|_| verify_size(src, &temp))
                .and_then(|_| policy.run("rename", &temp, || fs::rename(&temp, dest)));
            if let Err(err) = copied {
                let _ = fs::remove_file(&temp);
                return Err(err);
            }
            policy.run("remove", src, || fs::remove_file(src))?;
            Ok(MoveKind::Copied)
        }
        Err(err) => Err(err),
    }
}

/// Copy-based directory move.
///
/// Any failure before the final rename removes the partial copy and leaves
/// `src` untouched, so the caller can simply retry later.
pub(crate) fn copy_then_swap(src: &Path, dest: &Path, policy: &RetryPolicy) -> Result<()> {
    let temp = partial_sibling(dest);
    if temp.exists() {
        // Leftover from an interrupted earlier attempt
        fs::remove_dir_all(&temp).map_err(|e| StationError::io("remove partial", &temp, e))?;
    }

    let staged = copy_tree(src, &temp, policy)
        .and_then(|_| verify_tree(src, &temp))
        .and_then(|_| policy.run("rename", &temp, || fs::rename(&temp, dest)));

    if let Err(err) = staged {
        if let Err(cleanup) = fs::remove_dir_all(&temp) {
            warn!(path = %temp.display(), error = %cleanup, "could not remove partial copy");
        }
        return Err(err);
    }

    if let Err(err) = policy.run("remove", src, || fs::remove_dir_all(src)) {
        // Destination is complete; the leftover source shows up as a
        // duplicate on the next transfer instead of losing pages.
        warn!(src = %src.display(), error = %err, "copied but could not remove source");
    }
    Ok(())
}

pub fn remove_file(path: &Path, policy: &RetryPolicy) -> Result<()> {
    policy.run("remove", path, || match fs::remove_file(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    })
}

fn copy_tree(src: &Path, dest: &Path, policy: &RetryPolicy) -> Result<()> {
    for entry in WalkDir::new(src) {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(src).to_path_buf();
            StationError::io("walk", path, io::Error::other(e))
        })?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| StationError::io("walk", entry.path(), io::Error::other(e)))?;
        let target = dest.join(rel);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&target).map_err(|e| StationError::io("create dir", &target, e))?;
        } else {
            policy.run("copy", entry.path(), || fs::copy(entry.path(), &target))?;
        }
    }
    Ok(())
}

fn verify_tree(src: &Path, copy: &Path) -> Result<()> {
    for entry in WalkDir::new(src).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        if let Ok(rel) = entry.path().strip_prefix(src) {
            verify_size(entry.path(), &copy.join(rel))?;
        }
    }
    Ok(())
}

fn verify_size(original: &Path, copy: &Path) -> Result<()> {
    let expected = fs::metadata(original)
        .map_err(|e| StationError::io("stat", original, e))?
        .len();
    let actual = fs::metadata(copy).map(|m| m.len()).unwrap_or(0);
    if expected != actual {
        return Err(StationError::SizeMismatch {
            path: copy.to_path_buf(),
            expected,
            actual,
        });
    }
    Ok(())
}

/// `<parent>/.<name>.partial-<pid>`; hidden so listings skip it
fn partial_sibling(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    dest.with_file_name(format!(".{}.partial-{}", name, std::process::id()))
}
