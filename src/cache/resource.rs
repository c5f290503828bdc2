//! Decoded full-resolution images, keyed by source path
//!
//! Decoding happens on the blocking pool. Each load registers itself in an
//! in-flight table under the path's current epoch; invalidation, removal and
//! rename bump that epoch, and a decode that finishes under an older one is
//! thrown away instead of being cached. The table only holds paths with a
//! load still running.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use image::DynamicImage;
use parking_lot::Mutex;
use tracing::{debug, info};

use super::byte_lru::{ByteLru, CacheStats};
use crate::archive::fsops::RetryPolicy;
use crate::config::StationConfig;
use crate::error::{Result, StationError};
use crate::ingest::PathObserver;

pub type SharedImage = Arc<DynamicImage>;

/// Scanner drivers can hold a file open for a moment after it looks complete
const LOAD_RETRY: RetryPolicy = RetryPolicy {
    attempts: 5,
    backoff: Duration::from_millis(200),
};

/// In-memory size of a decoded image
pub fn image_bytes(image: &DynamicImage) -> u64 {
    image.as_bytes().len() as u64
}

/// Read and decode `path`, retrying transient read failures
pub fn decode_file(path: &Path, policy: &RetryPolicy) -> Result<DynamicImage> {
    let bytes = policy.run("read image", path, || fs::read(path))?;
    image::load_from_memory(&bytes).map_err(|source| StationError::Image {
        path: path.to_path_buf(),
        source,
    })
}

#[derive(Debug, Default)]
struct InFlight {
    epoch: u64,
    loads: usize,
}

struct Inner {
    images: ByteLru<PathBuf, SharedImage>,
    in_flight: HashMap<PathBuf, InFlight>,
}

impl Inner {
    /// Register a load of `path` and return the epoch it started under
    fn begin(&mut self, path: &Path) -> u64 {
        let entry = self.in_flight.entry(path.to_path_buf()).or_default();
        entry.loads += 1;
        entry.epoch
    }

    fn is_current(&self, path: &Path, epoch: u64) -> bool {
        self.in_flight
            .get(path)
            .is_some_and(|entry| entry.epoch == epoch)
    }

    fn end(&mut self, path: &Path) {
        if let Some(entry) = self.in_flight.get_mut(path) {
            entry.loads = entry.loads.saturating_sub(1);
            if entry.loads == 0 {
                self.in_flight.remove(path);
            }
        }
    }

    /// Only paths with a load running need an epoch
    fn bump(&mut self, path: &Path) {
        if let Some(entry) = self.in_flight.get_mut(path) {
            entry.epoch += 1;
        }
    }
}

/// Unregisters a load when it finishes, fails or is dropped mid-decode
struct LoadTicket<'a> {
    cache: &'a ResourceCache,
    path: &'a Path,
    epoch: u64,
}

impl Drop for LoadTicket<'_> {
    fn drop(&mut self) {
        self.cache.inner.lock().end(self.path);
    }
}

pub struct ResourceCache {
    inner: Mutex<Inner>,
    enabled: AtomicBool,
    load_retry: RetryPolicy,
}

impl ResourceCache {
    pub fn new(budget_bytes: u64, enabled: bool) -> Self {
        Self {
            inner: Mutex::new(Inner {
                images: ByteLru::new(budget_bytes),
                in_flight: HashMap::new(),
            }),
            enabled: AtomicBool::new(enabled),
            load_retry: LOAD_RETRY,
        }
    }

    pub fn from_config(config: &StationConfig) -> Self {
        Self::new(config.cache.budget_bytes, config.caching_enabled)
    }

    pub fn with_load_retry(mut self, policy: RetryPolicy) -> Self {
        self.load_retry = policy;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Turning caching off also drops everything held
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
        if !enabled {
            self.inner.lock().images.clear();
        }
        info!(enabled, "image caching toggled");
    }

    pub fn get(&self, path: &Path) -> Option<SharedImage> {
        let hit = self.inner.lock().images.get(&path.to_path_buf());
        if hit.is_some() {
            debug!(path = %path.display(), "image cache hit");
        }
        hit
    }

    pub fn put(&self, path: &Path, image: SharedImage) {
        if !self.is_enabled() {
            return;
        }
        let size = image_bytes(&image);
        let evicted = self.inner.lock().images.put(path.to_path_buf(), image, size);
        for old in evicted {
            debug!(path = %old.display(), "evicted from image cache");
        }
    }

    /// Forget `path` and discard any decode of it still in flight
    pub fn invalidate(&self, path: &Path) {
        let mut inner = self.inner.lock();
        inner.bump(path);
        if inner.images.remove(&path.to_path_buf()).is_some() {
            debug!(path = %path.display(), "image cache entry invalidated");
        }
    }

    pub fn rekey(&self, from: &Path, to: &Path) {
        let mut inner = self.inner.lock();
        inner.bump(from);
        inner.bump(to);
        inner.images.rekey(&from.to_path_buf(), to.to_path_buf());
    }

    /// Serve from cache, or decode off the runtime and cache the result
    pub async fn load(&self, path: &Path) -> Result<SharedImage> {
        if let Some(image) = self.get(path) {
            return Ok(image);
        }

        let ticket = self.begin_load(path);
        let owned = path.to_path_buf();
        let policy = self.load_retry;
        let image = tokio::task::spawn_blocking(move || decode_file(&owned, &policy)).await??;

        self.finish_load(&ticket, Arc::new(image))
    }

    fn begin_load<'a>(&'a self, path: &'a Path) -> LoadTicket<'a> {
        let epoch = self.inner.lock().begin(path);
        LoadTicket {
            cache: self,
            path,
            epoch,
        }
    }

    fn finish_load(&self, ticket: &LoadTicket<'_>, image: SharedImage) -> Result<SharedImage> {
        let path = ticket.path;
        let mut inner = self.inner.lock();
        if !inner.is_current(path, ticket.epoch) {
            debug!(path = %path.display(), "discarding stale decode");
            return Err(StationError::Superseded(path.to_path_buf()));
        }
        if self.is_enabled() {
            let size = image_bytes(&image);
            inner.images.put(path.to_path_buf(), Arc::clone(&image), size);
        }
        Ok(image)
    }

    /// Paths with a decode still running
    pub fn loads_in_flight(&self) -> usize {
        self.inner.lock().in_flight.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.lock().images.stats()
    }
}

impl PathObserver for ResourceCache {
    fn path_removed(&self, path: &Path) {
        self.invalidate(path);
    }

    fn path_renamed(&self, from: &Path, to: &Path) {
        self.rekey(from, to);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use tempfile::TempDir;

    fn gray(width: u32, height: u32) -> SharedImage {
        Arc::new(DynamicImage::ImageRgb8(RgbImage::from_pixel(
            width,
            height,
            Rgb([128, 128, 128]),
        )))
    }

    fn write_png(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        RgbImage::from_pixel(16, 8, Rgb([10, 20, 30]))
            .save(&path)
            .unwrap();
        path
    }

    #[test]
    fn test_budget_is_respected() {
        // Each 10x10 RGB image is 300 bytes
        let cache = ResourceCache::new(1_000, true);
        for i in 0..10 {
            cache.put(Path::new(&format!("/scans/{}.jpg", i)), gray(10, 10));
            assert!(cache.stats().used_bytes <= 1_000);
        }
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.stats().evictions, 7);
    }

    #[test]
    fn test_oversized_image_is_still_cached() {
        let cache = ResourceCache::new(100, true);
        cache.put(Path::new("/scans/big.jpg"), gray(10, 10));
        assert!(cache.get(Path::new("/scans/big.jpg")).is_some());
    }

    #[tokio::test]
    async fn test_load_decodes_once() {
        let dir = TempDir::new().unwrap();
        let path = write_png(dir.path(), "0001.png");
        let cache = ResourceCache::new(1 << 20, true);

        let first = cache.load(&path).await.unwrap();
        let second = cache.load(&path).await.unwrap();

        assert_eq!(first.width(), 16);
        assert!(Arc::ptr_eq(&first, &second));
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
    }

    #[tokio::test]
    async fn test_disabled_cache_never_stores() {
        let dir = TempDir::new().unwrap();
        let path = write_png(dir.path(), "0001.png");
        let cache = ResourceCache::new(1 << 20, false);

        cache.load(&path).await.unwrap();
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_undecodable_file_is_malformed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("0001.jpg");
        fs::write(&path, b"not really a jpeg").unwrap();
        let cache = ResourceCache::new(1 << 20, true);

        let err = cache.load(&path).await.unwrap_err();
        assert!(matches!(err, StationError::Image { .. }));
    }

    #[test]
    fn test_decode_racing_invalidation_is_discarded() {
        let cache = ResourceCache::new(1 << 20, true);
        let path = Path::new("/scans/0001.jpg");
        let ticket = cache.begin_load(path);

        // An edit lands while the decode is running
        cache.invalidate(path);

        let result = cache.finish_load(&ticket, gray(4, 4));
        assert!(matches!(result, Err(StationError::Superseded(_))));
        drop(ticket);
        assert!(cache.get(path).is_none());
        assert_eq!(cache.loads_in_flight(), 0);
    }

    #[test]
    fn test_finished_load_is_cached() {
        let cache = ResourceCache::new(1 << 20, true);
        let path = Path::new("/scans/0001.jpg");
        let ticket = cache.begin_load(path);
        assert_eq!(cache.loads_in_flight(), 1);

        cache.finish_load(&ticket, gray(4, 4)).unwrap();
        drop(ticket);

        assert!(cache.get(path).is_some());
        assert_eq!(cache.loads_in_flight(), 0);
    }

    #[test]
    fn test_invalidating_idle_paths_keeps_no_state() {
        let cache = ResourceCache::new(1 << 20, true);
        for i in 0..10_000 {
            let path = PathBuf::from(format!("/scans/{:05}.jpg", i));
            cache.invalidate(&path);
            cache.path_removed(&path);
            cache.path_renamed(&path, Path::new("/scans/renamed.jpg"));
        }
        assert_eq!(cache.loads_in_flight(), 0);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_failed_load_releases_its_slot() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("0001.jpg");
        fs::write(&path, b"garbage").unwrap();
        let cache = ResourceCache::new(1 << 20, true);

        assert!(cache.load(&path).await.is_err());
        assert_eq!(cache.loads_in_flight(), 0);
    }

    #[test]
    fn test_observer_hooks() {
        let cache = ResourceCache::new(1 << 20, true);
        cache.put(Path::new("/scans/a.jpg"), gray(2, 2));
        cache.put(Path::new("/scans/b.jpg"), gray(2, 2));

        cache.path_renamed(Path::new("/scans/a.jpg"), Path::new("/scans/c.jpg"));
        cache.path_removed(Path::new("/scans/b.jpg"));

        assert!(cache.get(Path::new("/scans/a.jpg")).is_none());
        assert!(cache.get(Path::new("/scans/b.jpg")).is_none());
        assert!(cache.get(Path::new("/scans/c.jpg")).is_some());
    }
}
