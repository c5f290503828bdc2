//! The `Station` facade: owns every component and exposes the commands a
//! front end issues
//!
//! Construction wires the caches into the watcher as path observers; `start`
//! launches the background roles (watcher, thumbnail workers, stats ticker).
//! Blocking filesystem work is always pushed to the blocking pool.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{info, warn};

use crate::archive::batch::{self, Batch};
use crate::archive::fsops::{self, RetryPolicy};
use crate::archive::transfer::{TransferEngine, TransferPlan, TransferReport};
use crate::cache::{CacheStats, ResourceCache, SharedImage};
use crate::config::StationConfig;
use crate::edit::{Backup, BackupStore};
use crate::error::{Result, StationError};
use crate::events::{EventBus, StationEvent};
use crate::ingest::{IngestionWatcher, SourceFile, StabilityDetector};
use crate::stats::{StationStats, StatsAggregator};
use crate::thumbnail::{RequestOutcome, ThumbnailPipeline, ThumbnailRequest};

/// Run blocking filesystem work off the async runtime
async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f).await?
}

pub struct Station {
    config: StationConfig,
    bus: EventBus,
    watcher: Arc<IngestionWatcher>,
    images: Arc<ResourceCache>,
    thumbnails: Arc<ThumbnailPipeline>,
    engine: Arc<TransferEngine>,
    stats: Arc<StatsAggregator>,
    backups: BackupStore,
    policy: RetryPolicy,
}

impl Station {
    /// Build every component from `config`. Nothing runs until `start`.
    pub fn new(config: StationConfig) -> Result<Self> {
        config.validate()?;

        let bus = EventBus::new();
        let policy = RetryPolicy::from(&config.transfer);

        let watcher = Arc::new(IngestionWatcher::new(
            config.scan_root.clone(),
            StabilityDetector::from(&config.stability),
            bus.clone(),
        ));
        let images = Arc::new(ResourceCache::from_config(&config));
        let thumbnails = Arc::new(ThumbnailPipeline::new(&config.thumbnails, bus.clone()));
        watcher.add_observer(images.clone());
        watcher.add_observer(thumbnails.clone());

        let engine = Arc::new(TransferEngine::new(&config));

        let counter = Arc::clone(&watcher);
        let stats = Arc::new(StatsAggregator::new(
            config.staging_root.clone(),
            config.log_file.clone(),
            Arc::new(move || counter.ready_count()),
            config.stats_interval(),
            bus.clone(),
        ));

        let backups = BackupStore::new(config.backup_dir.clone(), policy);

        Ok(Self {
            config,
            bus,
            watcher,
            images,
            thumbnails,
            engine,
            stats,
            backups,
            policy,
        })
    }

    /// Start the watcher, thumbnail workers and stats ticker
    pub fn start(&self) -> Result<()> {
        self.thumbnails.start();
        self.watcher.start()?;
        self.stats.start();
        info!(
            scan = %self.config.scan_root.display(),
            staging = %self.config.staging_root.display(),
            "station started"
        );
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.watcher.stop();
        self.stats.stop();
        self.thumbnails.shutdown().await;
        info!("station stopped");
    }

    pub fn config(&self) -> &StationConfig {
        &self.config
    }

    pub fn subscribe(&self) -> UnboundedReceiver<StationEvent> {
        self.bus.subscribe()
    }

    // Scans

    pub fn source_files(&self) -> Vec<SourceFile> {
        self.watcher.snapshot()
    }

    pub fn ready_count(&self) -> usize {
        self.watcher.ready_count()
    }

    pub fn retry_file(&self, path: &Path) -> bool {
        self.watcher.retry(path)
    }

    /// Delete a scan from the scan folder, dropping everything cached for it
    pub async fn delete_file(&self, path: &Path) -> Result<()> {
        self.ensure_in_scan_root(path)?;

        let owned = path.to_path_buf();
        let policy = self.policy;
        blocking(move || fsops::remove_file(&owned, &policy)).await?;

        self.watcher.forget(path);
        self.invalidate_cache(path);
        if let Err(err) = self.backups.discard(path) {
            warn!(path = %path.display(), error = %err, "could not remove backup");
        }
        info!(path = %path.display(), "scan deleted");
        Ok(())
    }

    // Caches

    pub fn request_thumbnail(&self, request: ThumbnailRequest) -> RequestOutcome {
        self.thumbnails.request(request)
    }

    pub fn thumbnails(&self) -> &ThumbnailPipeline {
        &self.thumbnails
    }

    /// Call after any edit that rewrote `path`
    pub fn invalidate_cache(&self, path: &Path) {
        self.images.invalidate(path);
        self.thumbnails.invalidate(path);
    }

    pub async fn load_image(&self, path: &Path) -> Result<SharedImage> {
        self.images.load(path).await
    }

    pub fn set_caching_enabled(&self, enabled: bool) {
        self.images.set_enabled(enabled);
    }

    pub fn image_cache_stats(&self) -> CacheStats {
        self.images.stats()
    }

    // Edits

    pub async fn backup_before_edit(&self, path: &Path) -> Result<Backup> {
        let owned = path.to_path_buf();
        let backups = self.backups.clone();
        let backup = blocking(move || backups.backup_before_edit(&owned)).await?;
        self.invalidate_cache(path);
        Ok(backup)
    }

    pub async fn restore_image(&self, path: &Path) -> Result<()> {
        let owned = path.to_path_buf();
        let backups = self.backups.clone();
        blocking(move || backups.restore(&owned)).await?;
        self.invalidate_cache(path);
        Ok(())
    }

    // Batches and transfer

    /// Move `paths` out of the scan folder into a new staged batch
    pub async fn create_batch(&self, name: &str, paths: Vec<PathBuf>) -> Result<Batch> {
        let scan_root = self.config.scan_root.clone();
        let staging_root = self.config.staging_root.clone();
        let name = name.to_string();
        let policy = self.policy;

        let batch = blocking(move || {
            batch::create_batch(&scan_root, &staging_root, &name, &paths, &policy)
        })
        .await?;

        for source in &batch.source_paths {
            self.watcher.forget(source);
            self.invalidate_cache(source);
            // A later scan can reuse the name; it must not inherit this backup
            if let Err(err) = self.backups.discard(source) {
                warn!(path = %source.display(), error = %err, "could not remove backup");
            }
        }
        self.bus.publish(StationEvent::BatchCreated(batch.clone()));
        Ok(batch)
    }

    pub async fn plan_transfer(&self) -> Result<TransferPlan> {
        let engine = Arc::clone(&self.engine);
        blocking(move || engine.plan()).await
    }

    /// Archive every staged batch. Per-batch failures are in the report and
    /// published as `TransferFailed`; `Err` means nothing was moved.
    pub async fn transfer_all(&self) -> Result<TransferReport> {
        let engine = Arc::clone(&self.engine);
        let report = blocking(move || engine.transfer_all()).await?;

        if !report.records.is_empty() {
            self.bus
                .publish(StationEvent::TransferComplete(report.records.clone()));
        }
        for failure in &report.failures {
            self.bus.publish(StationEvent::TransferFailed {
                batch_name: failure.batch_name.clone(),
                reason: failure.reason.clone(),
            });
        }
        Ok(report)
    }

    pub async fn compute_stats(&self) -> Result<StationStats> {
        self.stats.compute_stats().await
    }

    fn ensure_in_scan_root(&self, path: &Path) -> Result<()> {
        let root = self
            .config
            .scan_root
            .canonicalize()
            .map_err(|e| StationError::io("resolve scan folder", &self.config.scan_root, e))?;
        let inside = path
            .parent()
            .and_then(|parent| parent.canonicalize().ok())
            .is_some_and(|parent| parent == root);
        if inside {
            Ok(())
        } else {
            Err(StationError::NotInScanRoot(path.to_path_buf()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn station(dir: &TempDir) -> Station {
        let scan = dir.path().join("scan");
        let staging = dir.path().join("staging");
        fs::create_dir_all(&scan).unwrap();
        fs::create_dir_all(&staging).unwrap();

        let mut config = StationConfig::default();
        config.scan_root = scan;
        config.staging_root = staging;
        config.log_file = dir.path().join("log.json");
        config.backup_dir = dir.path().join("backups");
        Station::new(config).unwrap()
    }

    #[test]
    fn test_new_rejects_missing_roots() {
        let config = StationConfig::default();
        assert!(matches!(
            Station::new(config),
            Err(StationError::RootUnavailable(..))
        ));
    }

    #[tokio::test]
    async fn test_delete_file_only_inside_scan_root() {
        let dir = TempDir::new().unwrap();
        let station = station(&dir);
        let inside = station.config().scan_root.join("0001.jpg");
        let outside = dir.path().join("keep.jpg");
        fs::write(&inside, b"x").unwrap();
        fs::write(&outside, b"x").unwrap();

        station.delete_file(&inside).await.unwrap();
        assert!(!inside.exists());

        assert!(matches!(
            station.delete_file(&outside).await,
            Err(StationError::NotInScanRoot(_))
        ));
        assert!(outside.exists());
    }

    #[tokio::test]
    async fn test_restore_invalidates_cached_image() {
        let dir = TempDir::new().unwrap();
        let station = station(&dir);
        let scan = station.config().scan_root.join("0001.png");
        image::RgbImage::new(8, 8).save(&scan).unwrap();

        station.backup_before_edit(&scan).await.unwrap();
        let before = station.load_image(&scan).await.unwrap();
        image::RgbImage::new(4, 4).save(&scan).unwrap();
        station.invalidate_cache(&scan);
        assert_eq!(station.load_image(&scan).await.unwrap().width(), 4);

        station.restore_image(&scan).await.unwrap();
        let after = station.load_image(&scan).await.unwrap();
        assert_eq!(after.width(), before.width());
    }

    #[tokio::test]
    async fn test_transfer_publishes_failures() {
        let dir = TempDir::new().unwrap();
        let station = station(&dir);
        let mut rx = station.subscribe();
        let book = station.config().staging_root.join("NO-CODE");
        fs::create_dir(&book).unwrap();
        fs::write(book.join("0001.jpg"), b"x").unwrap();

        let report = station.transfer_all().await.unwrap();

        assert_eq!(report.failures.len(), 1);
        match rx.try_recv().unwrap() {
            StationEvent::TransferFailed { batch_name, .. } => assert_eq!(batch_name, "NO-CODE"),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_batched_scan_backup_is_not_reused() {
        let dir = TempDir::new().unwrap();
        let station = station(&dir);
        let scan = station.config().scan_root.join("0001.png");
        image::RgbImage::new(8, 8).save(&scan).unwrap();
        station.backup_before_edit(&scan).await.unwrap();

        station.create_batch("BOOK-123-A", vec![scan.clone()]).await.unwrap();

        // Next book starts numbering from 0001 again
        image::RgbImage::new(30, 20).save(&scan).unwrap();
        let backup = station.backup_before_edit(&scan).await.unwrap();
        assert!(matches!(backup, Backup::Created(_)));

        image::RgbImage::new(5, 5).save(&scan).unwrap();
        station.restore_image(&scan).await.unwrap();
        assert_eq!(image::open(&scan).unwrap().width(), 30);
    }
}
