//! Station counters: pending scans, staged batches, pages archived today
//!
//! Recomputed on a fixed interval in a task of its own. The filesystem work
//! runs on the blocking pool and only reads: staging listing plus the log.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, NaiveDate};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, warn};

use crate::archive::batch::{list_staged, StagedBatch};
use crate::archive::log::{read_day_lenient, TransferRecord};
use crate::error::Result;
use crate::events::{EventBus, StationEvent};

/// Supplies the number of ready scans waiting in the scan folder
pub type PendingCounter = Arc<dyn Fn() -> usize + Send + Sync>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StationStats {
    /// Ready scans not yet in a batch
    pub pending: usize,
    pub staged_books: usize,
    pub staged_pages: usize,
    /// Staged pages plus pages archived today
    pub total_pages_today: usize,
    pub staged: Vec<StagedBatch>,
    pub archived_today: Vec<TransferRecord>,
}

/// One snapshot. Missing staging folder or corrupt log degrade to empty.
pub fn compute(pending: usize, staging_root: &Path, log_path: &Path, today: NaiveDate) -> StationStats {
    let staged = list_staged(staging_root).unwrap_or_else(|err| {
        warn!(error = %err, "could not list staged batches");
        Vec::new()
    });
    let archived_today = read_day_lenient(log_path, today);

    let staged_pages: usize = staged.iter().map(|batch| batch.pages).sum();
    let archived_pages: usize = archived_today.iter().map(|record| record.page_count).sum();

    StationStats {
        pending,
        staged_books: staged.len(),
        staged_pages,
        total_pages_today: staged_pages + archived_pages,
        staged,
        archived_today,
    }
}

pub struct StatsAggregator {
    staging_root: PathBuf,
    log_path: PathBuf,
    pending: PendingCounter,
    period: Duration,
    bus: EventBus,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl StatsAggregator {
    pub fn new(
        staging_root: PathBuf,
        log_path: PathBuf,
        pending: PendingCounter,
        period: Duration,
        bus: EventBus,
    ) -> Self {
        Self {
            staging_root,
            log_path,
            pending,
            period,
            bus,
            ticker: Mutex::new(None),
        }
    }

    pub async fn compute_stats(&self) -> Result<StationStats> {
        let pending = (self.pending)();
        let staging_root = self.staging_root.clone();
        let log_path = self.log_path.clone();
        let today = Local::now().date_naive();

        let stats = tokio::task::spawn_blocking(move || {
            compute(pending, &staging_root, &log_path, today)
        })
        .await?;
        Ok(stats)
    }

    /// Publish `StatsUpdated` every period until stopped
    pub fn start(self: &Arc<Self>) {
        let mut ticker = self.ticker.lock();
        if ticker.is_some() {
            return;
        }
        let this = Arc::clone(self);
        *ticker = Some(tokio::spawn(async move {
            let mut tick = interval(this.period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                match this.compute_stats().await {
                    Ok(stats) => {
                        debug!(pending = stats.pending, staged = stats.staged_books, "stats updated");
                        this.bus.publish(StationEvent::StatsUpdated(stats));
                    }
                    Err(err) => warn!(error = %err, "stats computation failed"),
                }
            }
        }));
    }

    pub fn stop(&self) {
        if let Some(ticker) = self.ticker.lock().take() {
            ticker.abort();
        }
    }
}

impl Drop for StatsAggregator {
    fn drop(&mut self) {
        if let Some(ticker) = self.ticker.get_mut().take() {
            ticker.abort();
        }
    }
}
