//! Backups around destructive edits
//!
//! Edits (crop, rotate, color) rewrite a scan in place. Before the first one
//! the original is copied into the backup folder under its file name; later
//! edits keep that first copy so a restore always goes back to the scan as
//! it came off the scanner.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::archive::fsops::{self, write_atomic, RetryPolicy};
use crate::error::{Result, StationError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backup {
    Created(PathBuf),
    /// An earlier edit already saved the original
    Existing(PathBuf),
}

impl Backup {
    pub fn path(&self) -> &Path {
        match self {
            Backup::Created(path) | Backup::Existing(path) => path,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackupStore {
    dir: PathBuf,
    policy: RetryPolicy,
}

impl BackupStore {
    pub fn new(dir: impl Into<PathBuf>, policy: RetryPolicy) -> Self {
        Self {
            dir: dir.into(),
            policy,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn backup_path(&self, path: &Path) -> PathBuf {
        match path.file_name() {
            Some(name) => self.dir.join(name),
            None => self.dir.clone(),
        }
    }

    pub fn has_backup(&self, path: &Path) -> bool {
        self.backup_path(path).is_file()
    }

    /// Save the original of `path` unless a backup already exists
    pub fn backup_before_edit(&self, path: &Path) -> Result<Backup> {
        let backup = self.backup_path(path);
        if backup.is_file() {
            return Ok(Backup::Existing(backup));
        }

        fs::create_dir_all(&self.dir).map_err(|e| StationError::io("create backup dir", &self.dir, e))?;
        let bytes = self.policy.run("read original", path, || fs::read(path))?;
        write_atomic(&backup, &bytes)?;

        info!(path = %path.display(), backup = %backup.display(), "original backed up");
        Ok(Backup::Created(backup))
    }

    /// Put the saved original back over `path`
    pub fn restore(&self, path: &Path) -> Result<()> {
        let backup = self.backup_path(path);
        if !backup.is_file() {
            return Err(StationError::NoBackup(path.to_path_buf()));
        }
        let bytes = self.policy.run("read backup", &backup, || fs::read(&backup))?;
        write_atomic(path, &bytes)?;

        info!(path = %path.display(), "restored from backup");
        Ok(())
    }

    /// Forget the backup of a scan that is leaving the scan folder
    pub fn discard(&self, path: &Path) -> Result<()> {
        fsops::remove_file(&self.backup_path(path), &self.policy)
    }
}
