//! Typed events published by the station core
//!
//! Every subscriber gets its own unbounded channel, so a slow consumer never
//! holds up the watcher or the thumbnail workers. Dropping the receiver is
//! enough to unsubscribe.

use std::path::PathBuf;
use std::sync::Arc;

use image::DynamicImage;
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::debug;

use crate::archive::{Batch, TransferRecord};
use crate::stats::StationStats;
use crate::thumbnail::ThumbnailKey;

#[derive(Debug, Clone)]
pub enum StationEvent {
    /// A scan finished writing and can be read
    FileReady(PathBuf),
    /// A scan never settled; it stays on disk and can be retried
    FileFailed(PathBuf),
    FileRemoved(PathBuf),
    FileRenamed { from: PathBuf, to: PathBuf },
    ThumbnailReady {
        key: ThumbnailKey,
        image: Arc<DynamicImage>,
    },
    ThumbnailFailed { key: ThumbnailKey, reason: String },
    BatchCreated(Batch),
    TransferComplete(Vec<TransferRecord>),
    TransferFailed { batch_name: String, reason: String },
    StatsUpdated(StationStats),
}

#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<UnboundedSender<StationEvent>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> UnboundedReceiver<StationEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Deliver to every live subscriber, forgetting the ones that hung up
    pub fn publish(&self, event: StationEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        if subscribers.is_empty() {
            debug!("event published with no subscribers");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
