//! Durable, append-only transfer log
//!
//! On disk this is a JSON object keyed by local date (`YYYY-MM-DD`), each
//! value being the records written that day in write order:
//!
//! ```json
//! { "2024-05-02": [ { "name": "BOOK-123-A", "pages": 3,
//!                     "path": "/archive/123/02-05/BOOK-123-A",
//!                     "timestamp": "2024-05-02T10:31:07.123456" } ] }
//! ```
//!
//! The file is never written in place. Each append serializes the whole log
//! to a temp file and renames it over the original.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::fsops::{stage_atomic, StagedWrite};
use crate::error::{Result, StationError};

const DAY_KEY: &str = "%Y-%m-%d";

/// One archived batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRecord {
    #[serde(rename = "name")]
    pub batch_name: String,
    #[serde(rename = "pages")]
    pub page_count: usize,
    #[serde(rename = "path")]
    pub destination_path: PathBuf,
    /// Local wall-clock time, ISO-8601
    pub timestamp: NaiveDateTime,
}

impl TransferRecord {
    pub fn date(&self) -> NaiveDate {
        self.timestamp.date()
    }
}

/// Proof that the operator confirmed wiping the whole log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearConfirmation {
    Confirmed,
    NotConfirmed,
}

/// In-memory view of the log file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferLog {
    path: PathBuf,
    days: BTreeMap<String, Vec<TransferRecord>>,
}

impl TransferLog {
    /// Read the log; a missing file is an empty log, unparseable JSON is an error
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let days = match fs::read(&path) {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => BTreeMap::new(),
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|source| {
                StationError::CorruptLog {
                    path: path.clone(),
                    source,
                }
            })?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(StationError::io("read log", &path, e)),
        };
        Ok(Self { path, days })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Add a record in memory and prepare the new file, without replacing the
    /// original yet. Committing the returned write makes the record durable.
    pub fn stage_append(&mut self, record: TransferRecord) -> Result<StagedWrite> {
        let key = record.date().format(DAY_KEY).to_string();
        self.days.entry(key.clone()).or_default().push(record);

        self.stage().inspect_err(|_| self.forget_last(&key))
    }

    /// Append one record and atomically replace the log file
    pub fn append(&mut self, record: TransferRecord) -> Result<()> {
        let key = record.date().format(DAY_KEY).to_string();
        let staged = self.stage_append(record)?;
        staged.commit().inspect_err(|_| self.forget_last(&key))
    }

    // Keep memory in line with a file that was not replaced
    fn forget_last(&mut self, key: &str) {
        if let Some(day) = self.days.get_mut(key) {
            day.pop();
            if day.is_empty() {
                self.days.remove(key);
            }
        }
    }

    /// Records written on `date`, in write order
    pub fn records_on(&self, date: NaiveDate) -> Vec<&TransferRecord> {
        self.records().filter(|r| r.date() == date).collect()
    }

    pub fn pages_on(&self, date: NaiveDate) -> usize {
        self.records_on(date).iter().map(|r| r.page_count).sum()
    }

    pub fn records(&self) -> impl Iterator<Item = &TransferRecord> {
        self.days.values().flatten()
    }

    pub fn len(&self) -> usize {
        self.days.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wipe every record. Only an explicit operator confirmation gets through.
    pub fn clear(&mut self, confirmation: ClearConfirmation) -> Result<()> {
        if confirmation != ClearConfirmation::Confirmed {
            return Err(StationError::ClearNotConfirmed);
        }
        let previous = std::mem::take(&mut self.days);
        if let Err(err) = self.stage().and_then(StagedWrite::commit) {
            self.days = previous;
            return Err(err);
        }
        warn!(path = %self.path.display(), "transfer log cleared");
        Ok(())
    }

    fn stage(&self) -> Result<StagedWrite> {
        let bytes = serde_json::to_vec_pretty(&self.days).map_err(|source| {
            StationError::CorruptLog {
                path: self.path.clone(),
                source,
            }
        })?;
        stage_atomic(&self.path, &bytes)
    }
}

/// Load just today's records, treating a corrupt log as empty
pub fn read_day_lenient(path: &Path, date: NaiveDate) -> Vec<TransferRecord> {
    match TransferLog::load(path) {
        Ok(log) => log.records_on(date).into_iter().cloned().collect(),
        Err(err) => {
            warn!(error = %err, "could not read transfer log");
            Vec::new()
        }
    }
}
