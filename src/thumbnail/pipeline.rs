//! Background thumbnail generation
//!
//! A fixed pool of worker tasks pulls jobs from the queue, decodes on the
//! blocking pool, crops to the variant region, resizes to the thumbnail
//! footprint and publishes the result on the event bus.

use std::ops::Range;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use image::imageops::FilterType;
use image::{DynamicImage, Rgb, RgbImage};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::job::{Priority, ThumbnailJob, ThumbnailKey, ThumbnailRequest, Variant};
use super::queue::{Enqueued, JobQueue};
use crate::archive::fsops::RetryPolicy;
use crate::cache::byte_lru::{ByteLru, CacheStats};
use crate::cache::resource::{decode_file, image_bytes, SharedImage};
use crate::config::ThumbnailConfig;
use crate::error::Result;
use crate::events::{EventBus, StationEvent};
use crate::ingest::PathObserver;

/// Background fill of the placeholder shown for switched-off pages
const PLACEHOLDER_FILL: Rgb<u8> = Rgb([200, 200, 200]);

/// What happened to a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// Served from the thumbnail cache
    Cached,
    /// Disabled page, placeholder published
    Placeholder,
    Queued,
    /// Already queued or being generated
    Duplicate,
    /// Pipeline is shutting down
    Rejected,
}

struct Inner {
    queue: JobQueue,
    cache: Mutex<ByteLru<ThumbnailKey, SharedImage>>,
    bus: EventBus,
    width: u32,
    height: u32,
    adjacency_window: usize,
    generated: AtomicU64,
    placeholder: SharedImage,
    decode_retry: RetryPolicy,
}

pub struct ThumbnailPipeline {
    inner: Arc<Inner>,
    worker_count: usize,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ThumbnailPipeline {
    pub fn new(config: &ThumbnailConfig, bus: EventBus) -> Self {
        let placeholder = DynamicImage::ImageRgb8(RgbImage::from_pixel(
            config.width.max(1),
            config.height.max(1),
            PLACEHOLDER_FILL,
        ));
        Self {
            inner: Arc::new(Inner {
                queue: JobQueue::new(),
                cache: Mutex::new(
                    ByteLru::new(config.cache_bytes).with_max_entries(config.cache_entries),
                ),
                bus,
                width: config.width.max(1),
                height: config.height.max(1),
                adjacency_window: config.adjacency_window,
                generated: AtomicU64::new(0),
                placeholder: Arc::new(placeholder),
                decode_retry: RetryPolicy::default(),
            }),
            worker_count: config.workers.max(1),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the worker pool. Must run inside a tokio runtime.
    pub fn start(&self) {
        let mut workers = self.workers.lock();
        if !workers.is_empty() {
            return;
        }
        for id in 0..self.worker_count {
            let inner = Arc::clone(&self.inner);
            workers.push(tokio::spawn(async move {
                while let Some(job) = inner.queue.pop().await {
                    inner.process(job).await;
                }
                debug!(worker = id, "thumbnail worker stopped");
            }));
        }
        info!(workers = self.worker_count, "thumbnail workers started");
    }

    /// Close the queue and wait for workers to finish their current job
    pub async fn shutdown(&self) {
        self.inner.queue.close();
        let workers: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        for worker in workers {
            if let Err(err) = worker.await {
                warn!(error = %err, "thumbnail worker ended abnormally");
            }
        }
    }

    pub fn request(&self, request: ThumbnailRequest) -> RequestOutcome {
        let key = request.key();

        if let Variant::Disabled { .. } = request.variant {
            self.inner.publish_ready(key, Arc::clone(&self.inner.placeholder));
            return RequestOutcome::Placeholder;
        }

        let cached = self.inner.cache.lock().get(&key);
        if let Some(image) = cached {
            self.inner.publish_ready(key, image);
            return RequestOutcome::Cached;
        }

        match self.inner.queue.push(request) {
            Enqueued::Queued(_) => RequestOutcome::Queued,
            Enqueued::Duplicate => RequestOutcome::Duplicate,
            Enqueued::Closed => RequestOutcome::Rejected,
        }
    }

    /// Priority for item `index` given the visible range
    pub fn priority_for(&self, index: usize, visible: Range<usize>) -> Priority {
        Priority::from_viewport(index, visible, self.inner.adjacency_window)
    }

    /// Thumbnails actually rendered (cache hits and placeholders excluded)
    pub fn generated(&self) -> u64 {
        self.inner.generated.load(Ordering::Relaxed)
    }

    pub fn pending(&self) -> usize {
        self.inner.queue.len()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.inner.cache.lock().stats()
    }

    /// Drop queued and cached thumbnails of `path`
    pub fn invalidate(&self, path: &Path) {
        self.inner.queue.cancel_path(path);
        let removed = self.inner.cache.lock().remove_where(|key| key.path == path);
        if removed > 0 {
            debug!(path = %path.display(), removed, "thumbnails invalidated");
        }
    }
}

impl PathObserver for ThumbnailPipeline {
    fn path_removed(&self, path: &Path) {
        self.invalidate(path);
    }

    fn path_renamed(&self, from: &Path, to: &Path) {
        {
            let mut cache = self.inner.cache.lock();
            for key in cache.keys_where(|key| key.path == from) {
                let renamed = ThumbnailKey {
                    path: to.to_path_buf(),
                    variant: key.variant,
                };
                cache.rekey(&key, renamed);
            }
        }
        // Pending requests follow the file rather than being dropped
        self.inner.queue.rename_path(from, to);
    }
}

impl Drop for ThumbnailPipeline {
    fn drop(&mut self) {
        self.inner.queue.close();
    }
}

impl Inner {
    fn publish_ready(&self, key: ThumbnailKey, image: SharedImage) {
        self.bus.publish(StationEvent::ThumbnailReady { key, image });
    }

    async fn process(&self, job: ThumbnailJob) {
        let key = job.key();

        // Step 1: generated by an earlier job while this one waited
        let cached = self.cache.lock().get(&key);
        if let Some(image) = cached {
            self.queue.finish(&job);
            self.publish_ready(key, image);
            return;
        }

        // Step 2: decode, crop and resize off the runtime
        let source = job.source_path.clone();
        let variant = job.variant;
        let (width, height) = (self.width, self.height);
        let retry = self.decode_retry;
        let rendered = tokio::task::spawn_blocking(move || {
            render(&source, &variant, width, height, &retry)
        })
        .await;

        // Step 3: the source went away while we were decoding
        if !self.queue.is_current(&job) {
            debug!(%key, "discarding thumbnail for removed source");
            self.queue.finish(&job);
            return;
        }

        let rendered = match rendered {
            Ok(result) => result,
            Err(join) => Err(join.into()),
        };
        match rendered {
            Ok(image) => {
                let image = Arc::new(image);
                self.generated.fetch_add(1, Ordering::Relaxed);
                self.cache
                    .lock()
                    .put(key.clone(), Arc::clone(&image), image_bytes(&image));
                self.queue.finish(&job);
                debug!(%key, "thumbnail generated");
                self.publish_ready(key, image);
            }
            Err(err) => {
                self.queue.finish(&job);
                warn!(%key, error = %err, "thumbnail generation failed");
                self.bus.publish(StationEvent::ThumbnailFailed {
                    key,
                    reason: err.to_string(),
                });
            }
        }
    }
}

/// Decode `path`, crop to the variant's region and fit into `width` x `height`
pub fn render(
    path: &Path,
    variant: &Variant,
    width: u32,
    height: u32,
    retry: &RetryPolicy,
) -> Result<DynamicImage> {
    let image = decode_file(path, retry)?;

    let image = match variant.crop_region() {
        Some(region) => {
            let (x, y, w, h) = region.to_pixels(image.width(), image.height());
            image.crop_imm(x, y, w, h)
        }
        None => image,
    };

    // resize keeps the aspect ratio and fits inside the box
    Ok(image.resize(width, height, FilterType::Lanczos3))
}
