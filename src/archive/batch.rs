//! Batches ("books"): creating them from loose scans and listing what is staged

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use serde::Serialize;
use tracing::{info, warn};

use super::fsops::{self, RetryPolicy};
use crate::error::{Result, StationError};
use crate::ingest::naming::{is_hidden, is_image, natural_cmp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Staged,
    Transferred,
}

/// A named group of scans moved out of the scan folder together
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Batch {
    pub name: String,
    /// Where the pages were in the scan folder, in page order
    pub source_paths: Vec<PathBuf>,
    /// Batch directory in the staging folder
    pub path: PathBuf,
    pub created_at: DateTime<Local>,
    pub status: BatchStatus,
}

impl Batch {
    pub fn page_count(&self) -> usize {
        self.source_paths.len()
    }
}

/// A batch directory found in the staging folder
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StagedBatch {
    pub name: String,
    pub path: PathBuf,
    pub pages: usize,
}

/// Names end up as directory names on a network share
pub fn validate_name(name: &str) -> Result<()> {
    const FORBIDDEN: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

    let trimmed = name.trim();
    if trimmed.is_empty()
        || trimmed != name
        || name.starts_with('.')
        || name.contains(FORBIDDEN)
        || name.chars().any(char::is_control)
    {
        return Err(StationError::InvalidBatchName(name.to_string()));
    }
    Ok(())
}

/// Move `files` from the scan folder into `<staging_root>/<name>`.
///
/// Pages are renumbered `0001.ext`, `0002.ext`, ... in natural order of
/// their original names. They are gathered in a hidden directory first and
/// the directory is renamed into place at the end, so nobody watching the
/// staging folder sees a half-built batch. On failure every page already
/// moved goes back to the scan folder.
pub fn create_batch(
    scan_root: &Path,
    staging_root: &Path,
    name: &str,
    files: &[PathBuf],
    policy: &RetryPolicy,
) -> Result<Batch> {
    validate_name(name)?;
    if !staging_root.is_dir() {
        return Err(StationError::RootUnavailable("staging", staging_root.to_path_buf()));
    }

    let target = staging_root.join(name);
    if target.exists() {
        return Err(StationError::BatchExists(name.to_string()));
    }

    let mut pages = collect_pages(scan_root, files)?;
    pages.sort_by(|a, b| natural_cmp(a, b));

    let gathering = staging_root.join(format!(".{}.partial-{}", name, std::process::id()));
    fs::create_dir_all(&gathering).map_err(|e| StationError::io("create dir", &gathering, e))?;

    let mut moved: Vec<(PathBuf, PathBuf)> = Vec::with_capacity(pages.len());
    for (index, page) in pages.iter().enumerate() {
        let dest = gathering.join(page_file_name(index + 1, page));
        match fsops::move_file(page, &dest, policy) {
            Ok(_) => moved.push((page.clone(), dest)),
            Err(err) => {
                roll_back(&moved, &gathering, policy);
                return Err(err);
            }
        }
    }

    if let Err(err) = policy.run("rename", &gathering, || fs::rename(&gathering, &target)) {
        roll_back(&moved, &gathering, policy);
        return Err(err);
    }

    info!(batch = %name, pages = pages.len(), path = %target.display(), "batch created");

    Ok(Batch {
        name: name.to_string(),
        source_paths: pages,
        path: target,
        created_at: Local::now(),
        status: BatchStatus::Staged,
    })
}

/// Batch directories in the staging folder, natural-sorted, hidden ones skipped
pub fn list_staged(staging_root: &Path) -> Result<Vec<StagedBatch>> {
    let entries = fs::read_dir(staging_root)
        .map_err(|e| StationError::io("list staging", staging_root, e))?;

    let mut batches: Vec<StagedBatch> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_dir() && !is_hidden(path))
        .map(|path| StagedBatch {
            name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            pages: count_pages(&path),
            path,
        })
        .collect();

    batches.sort_by(|a, b| natural_cmp(&a.path, &b.path));
    Ok(batches)
}

/// Images directly inside `dir`
pub fn count_pages(dir: &Path) -> usize {
    match fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
            .filter(|entry| is_image(&entry.path()))
            .count(),
        Err(err) => {
            warn!(path = %dir.display(), error = %err, "could not count pages");
            0
        }
    }
}

fn collect_pages(scan_root: &Path, files: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let root = scan_root
        .canonicalize()
        .map_err(|e| StationError::io("resolve scan folder", scan_root, e))?;

    let mut seen = HashSet::new();
    let mut pages = Vec::with_capacity(files.len());
    for file in files {
        let in_root = file
            .parent()
            .and_then(|parent| parent.canonicalize().ok())
            .is_some_and(|parent| parent == root);
        if !in_root || !file.is_file() || !is_image(file) {
            return Err(StationError::NotInScanRoot(file.clone()));
        }
        if seen.insert(file.clone()) {
            pages.push(file.clone());
        }
    }

    if pages.is_empty() {
        return Err(StationError::InvalidBatchName(
            "a batch needs at least one page".to_string(),
        ));
    }
    Ok(pages)
}

fn page_file_name(number: usize, original: &Path) -> String {
    match original.extension() {
        Some(ext) => format!("{:04}.{}", number, ext.to_string_lossy()),
        None => format!("{:04}", number),
    }
}

fn roll_back(moved: &[(PathBuf, PathBuf)], gathering: &Path, policy: &RetryPolicy) {
    for (original, staged) in moved.iter().rev() {
        if let Err(err) = fsops::move_file(staged, original, policy) {
            warn!(page = %staged.display(), error = %err, "could not return page to scan folder");
        }
    }
    if let Err(err) = fs::remove_dir(gathering) {
        warn!(path = %gathering.display(), error = %err, "could not remove gathering folder");
    }
}
