//! Transfer engine: drains the staging folder into the archive
//!
//! Each batch is routed by the identifier in its name, moved as one
//! directory into `<destination root>/<DD-MM>/<batch>`, and recorded in the
//! transfer log. Batches succeed or fail independently.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{Local, NaiveDate, NaiveDateTime};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{error, info, warn};

use super::batch::{list_staged, StagedBatch};
use super::fsops::{move_dir, MoveKind, RetryPolicy};
use super::log::{TransferLog, TransferRecord};
use super::routing::RoutingTable;
use crate::config::StationConfig;
use crate::error::{ErrorClass, Result, StationError};

/// Dated subfolder name under each destination root
const DATE_FOLDER: &str = "%d-%m";

/// A move the engine would perform, as shown in a dry run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedMove {
    pub batch_name: String,
    pub source_path: PathBuf,
    pub destination_folder: PathBuf,
    pub final_path: PathBuf,
    pub pages: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransferPlan {
    pub moves: Vec<PlannedMove>,
    /// One line per batch that would be skipped, with the reason
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchFailure {
    pub batch_name: String,
    pub reason: String,
    pub class: ErrorClass,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferReport {
    pub records: Vec<TransferRecord>,
    pub failures: Vec<BatchFailure>,
}

impl TransferReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

pub struct TransferEngine {
    staging_root: PathBuf,
    routing: RoutingTable,
    log_path: PathBuf,
    policy: RetryPolicy,
    // Interleaved transfers could race on the same dated folders
    in_flight: Mutex<()>,
}

impl TransferEngine {
    pub fn new(config: &StationConfig) -> Self {
        Self::with_parts(
            config.staging_root.clone(),
            config.routing.clone(),
            config.log_file.clone(),
            RetryPolicy::from(&config.transfer),
        )
    }

    pub fn with_parts(
        staging_root: PathBuf,
        routing: RoutingTable,
        log_path: PathBuf,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            staging_root,
            routing,
            log_path,
            policy,
            in_flight: Mutex::new(()),
        }
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Dry run: what would move where, and what would be skipped
    pub fn plan(&self) -> Result<TransferPlan> {
        self.plan_on(Local::now().date_naive())
    }

    pub fn plan_on(&self, date: NaiveDate) -> Result<TransferPlan> {
        let mut plan = TransferPlan::default();
        for batch in self.staged()? {
            match self.destination_for(&batch.name, date) {
                Ok((destination_folder, final_path)) => plan.moves.push(PlannedMove {
                    batch_name: batch.name,
                    source_path: batch.path,
                    destination_folder,
                    final_path,
                    pages: batch.pages,
                }),
                Err(err) => plan.warnings.push(format!("{}: {}", batch.name, err)),
            }
        }
        Ok(plan)
    }

    /// Transfer every staged batch, stamped with the current local time
    pub fn transfer_all(&self) -> Result<TransferReport> {
        self.transfer_all_at(Local::now().naive_local())
    }

    /// Transfer every staged batch as if it were `now`.
    ///
    /// Only whole-run problems (staging folder gone, log unreadable) return
    /// `Err`, and in that case nothing has been moved. Per-batch problems are
    /// collected in the report.
    pub fn transfer_all_at(&self, now: NaiveDateTime) -> Result<TransferReport> {
        let _flight = self.in_flight.lock();

        let batches = self.staged()?;
        let mut log = TransferLog::load(&self.log_path)?;
        let mut report = TransferReport::default();

        for batch in batches {
            match self.transfer_one(&batch, &mut log, now) {
                Ok(record) => report.records.push(record),
                Err(err) => {
                    warn!(batch = %batch.name, error = %err, "batch left in staging");
                    report.failures.push(BatchFailure {
                        batch_name: batch.name,
                        reason: err.to_string(),
                        class: err.class(),
                    });
                }
            }
        }

        info!(
            moved = report.records.len(),
            failed = report.failures.len(),
            "transfer finished"
        );
        Ok(report)
    }

    fn staged(&self) -> Result<Vec<StagedBatch>> {
        if !self.staging_root.is_dir() {
            return Err(StationError::RootUnavailable(
                "staging",
                self.staging_root.clone(),
            ));
        }
        list_staged(&self.staging_root)
    }

    /// `(<root>/<DD-MM>, <root>/<DD-MM>/<batch>)`
    fn destination_for(&self, batch_name: &str, date: NaiveDate) -> Result<(PathBuf, PathBuf)> {
        let (_, root) = self.routing.route(batch_name)?;
        // An unmounted share must not be recreated as a local folder
        if !root.is_dir() {
            return Err(StationError::DestinationUnavailable(root));
        }
        let dated = root.join(date.format(DATE_FOLDER).to_string());
        let final_path = dated.join(batch_name);
        Ok((dated, final_path))
    }

    fn transfer_one(
        &self,
        batch: &StagedBatch,
        log: &mut TransferLog,
        now: NaiveDateTime,
    ) -> Result<TransferRecord> {
        let (dated, final_path) = self.destination_for(&batch.name, now.date())?;

        // create_dir_all is a no-op when another transfer created it first
        self.policy
            .run("create dated folder", &dated, || fs::create_dir_all(&dated))?;

        let kind = move_dir(&batch.path, &final_path, &self.policy)?;

        let record = TransferRecord {
            batch_name: batch.name.clone(),
            page_count: batch.pages,
            destination_path: final_path.clone(),
            timestamp: now,
        };

        if let Err(err) = log.append(record.clone()) {
            // Put the batch back so staging and log keep agreeing
            match move_dir(&final_path, &batch.path, &self.policy) {
                Ok(_) => warn!(batch = %batch.name, "log write failed, batch returned to staging"),
                Err(rollback) => error!(
                    batch = %batch.name,
                    path = %final_path.display(),
                    error = %rollback,
                    "log write failed and batch could not be returned to staging"
                ),
            }
            return Err(err);
        }

        info!(
            batch = %batch.name,
            pages = batch.pages,
            dest = %final_path.display(),
            copied = (kind == MoveKind::Copied),
            "batch archived"
        );
        Ok(record)
    }
}

impl std::fmt::Debug for TransferEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferEngine")
            .field("staging_root", &self.staging_root)
            .field("routes", &self.routing.len())
            .field("log_path", &self.log_path)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        staging: PathBuf,
        archive: PathBuf,
        log: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let staging = dir.path().join("today");
        let archive = dir.path().join("archive").join("123");
        fs::create_dir_all(&staging).unwrap();
        fs::create_dir_all(&archive).unwrap();
        let log = dir.path().join("log.json");
        Fixture {
            _dir: dir,
            staging,
            archive,
            log,
        }
    }

    fn engine(fx: &Fixture) -> TransferEngine {
        let routing: RoutingTable = [("123", fx.archive.clone())].into_iter().collect();
        TransferEngine::with_parts(
            fx.staging.clone(),
            routing,
            fx.log.clone(),
            RetryPolicy {
                attempts: 2,
                backoff: Duration::from_millis(1),
            },
        )
    }

    fn stage(fx: &Fixture, name: &str, pages: usize) -> PathBuf {
        let book = fx.staging.join(name);
        fs::create_dir(&book).unwrap();
        for page in 1..=pages {
            fs::write(book.join(format!("{:04}.jpg", page)), b"page").unwrap();
        }
        book
    }

    fn noon() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, 2)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    #[test]
    fn test_valid_and_invalid_batches_are_independent() {
        let fx = fixture();
        stage(&fx, "BOOK-123-A", 3);
        let orphan = stage(&fx, "BOOK-NOCODE", 2);

        let report = engine(&fx).transfer_all_at(noon()).unwrap();

        assert_eq!(report.records.len(), 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].batch_name, "BOOK-NOCODE");
        assert_eq!(report.failures[0].class, ErrorClass::Malformed);

        let moved = fx.archive.join("02-05").join("BOOK-123-A");
        assert_eq!(fs::read_dir(&moved).unwrap().count(), 3);
        assert!(!fx.staging.join("BOOK-123-A").exists());
        assert_eq!(fs::read_dir(&orphan).unwrap().count(), 2);

        let log = TransferLog::load(&fx.log).unwrap();
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn test_record_has_pages_and_destination() {
        let fx = fixture();
        stage(&fx, "BOOK-123-A", 4);

        let report = engine(&fx).transfer_all_at(noon()).unwrap();
        let record = &report.records[0];

        assert_eq!(record.page_count, 4);
        assert_eq!(
            record.destination_path,
            fx.archive.join("02-05").join("BOOK-123-A")
        );
        let log = TransferLog::load(&fx.log).unwrap();
        assert_eq!(log.records_on(noon().date()), vec![record]);
    }

    #[test]
    fn test_missing_route_stays_in_staging() {
        let fx = fixture();
        let book = stage(&fx, "BOOK-999-A", 1);

        let report = engine(&fx).transfer_all_at(noon()).unwrap();

        assert!(report.records.is_empty());
        assert_eq!(report.failures[0].class, ErrorClass::Permanent);
        assert!(book.join("0001.jpg").exists());
        assert!(!fx.log.exists());
    }

    #[test]
    fn test_existing_destination_is_not_overwritten() {
        let fx = fixture();
        let book = stage(&fx, "BOOK-123-A", 2);
        let existing = fx.archive.join("02-05").join("BOOK-123-A");
        fs::create_dir_all(&existing).unwrap();
        fs::write(existing.join("0001.jpg"), b"older").unwrap();

        let report = engine(&fx).transfer_all_at(noon()).unwrap();

        assert_eq!(report.failures.len(), 1);
        assert_eq!(fs::read_dir(&book).unwrap().count(), 2);
        assert_eq!(fs::read(existing.join("0001.jpg")).unwrap(), b"older");
    }

    #[test]
    fn test_corrupt_log_aborts_before_moving() {
        let fx = fixture();
        let book = stage(&fx, "BOOK-123-A", 2);
        fs::write(&fx.log, b"{ broken").unwrap();

        let err = engine(&fx).transfer_all_at(noon()).unwrap_err();

        assert!(matches!(err, StationError::CorruptLog { .. }));
        assert!(book.exists());
        assert_eq!(fs::read(&fx.log).unwrap(), b"{ broken");
    }

    #[test]
    fn test_unavailable_destination_root() {
        let fx = fixture();
        let book = stage(&fx, "BOOK-123-A", 1);
        fs::remove_dir_all(&fx.archive).unwrap();

        let report = engine(&fx).transfer_all_at(noon()).unwrap();

        assert_eq!(report.failures.len(), 1);
        assert!(book.exists());
        assert!(!fx.archive.exists());
    }

    #[test]
    fn test_second_batch_same_day_reuses_dated_folder() {
        let fx = fixture();
        stage(&fx, "BOOK-123-A", 1);
        engine(&fx).transfer_all_at(noon()).unwrap();
        stage(&fx, "BOOK-123-B", 2);

        let report = engine(&fx).transfer_all_at(noon()).unwrap();

        assert!(report.is_clean());
        assert_eq!(fs::read_dir(fx.archive.join("02-05")).unwrap().count(), 2);
        assert_eq!(TransferLog::load(&fx.log).unwrap().pages_on(noon().date()), 3);
    }

    #[test]
    fn test_plan_does_not_touch_disk() {
        let fx = fixture();
        let book = stage(&fx, "BOOK-123-A", 2);
        stage(&fx, "LOOSE", 1);

        let plan = engine(&fx).plan_on(noon().date()).unwrap();

        assert_eq!(plan.moves.len(), 1);
        assert_eq!(plan.moves[0].pages, 2);
        assert_eq!(
            plan.moves[0].final_path,
            fx.archive.join("02-05").join("BOOK-123-A")
        );
        assert_eq!(plan.warnings.len(), 1);
        assert!(plan.warnings[0].starts_with("LOOSE"));
        assert!(book.exists());
        assert!(!fx.archive.join("02-05").exists());
    }

    #[test]
    fn test_missing_staging_folder() {
        let fx = fixture();
        fs::remove_dir_all(&fx.staging).unwrap();
        assert!(matches!(
            engine(&fx).transfer_all_at(noon()),
            Err(StationError::RootUnavailable("staging", _))
        ));
    }

    #[test]
    fn test_failed_log_write_returns_batch_to_staging() {
        let fx = fixture();
        let book = stage(&fx, "BOOK-123-A", 2);
        // The log file's place is taken by the archived batch itself, so the
        // log commit fails right after the move
        let blocked_log = fx.archive.join("02-05").join("BOOK-123-A");
        let routing: RoutingTable = [("123", fx.archive.clone())].into_iter().collect();
        let engine = TransferEngine::with_parts(
            fx.staging.clone(),
            routing,
            blocked_log.clone(),
            RetryPolicy {
                attempts: 1,
                backoff: Duration::from_millis(1),
            },
        );

        let report = engine.transfer_all_at(noon()).unwrap();

        assert!(report.records.is_empty());
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].batch_name, "BOOK-123-A");
        assert_eq!(fs::read_dir(&book).unwrap().count(), 2);
        assert!(!blocked_log.exists());
        // Only the dated folder is left behind, empty
        assert_eq!(fs::read_dir(fx.archive.join("02-05")).unwrap().count(), 0);
    }

    #[test]
    fn test_concurrent_transfers_are_serialized() {
        let fx = fixture();
        for i in 0..20 {
            stage(&fx, &format!("BOOK-123-{:02}", i), 1);
        }
        let engine = &engine(&fx);
        let barrier = &std::sync::Barrier::new(2);

        let reports: Vec<TransferReport> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..2)
                .map(|_| {
                    scope.spawn(move || {
                        barrier.wait();
                        engine.transfer_all_at(noon()).unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        // One run archived everything, the other found staging empty
        let moved: usize = reports.iter().map(|r| r.records.len()).sum();
        let failed: usize = reports.iter().map(|r| r.failures.len()).sum();
        assert_eq!((moved, failed), (20, 0));
        assert!(reports.iter().any(|r| r.records.is_empty()));
        assert_eq!(TransferLog::load(&fx.log).unwrap().len(), 20);
        assert_eq!(fs::read_dir(fx.archive.join("02-05")).unwrap().count(), 20);
    }
}
