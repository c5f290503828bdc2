//! Prioritized background thumbnail generation

pub mod job;
pub mod pipeline;
pub mod queue;

pub use job::{CropRegion, Priority, Side, ThumbnailJob, ThumbnailKey, ThumbnailRequest, Variant};
pub use pipeline::{RequestOutcome, ThumbnailPipeline};
pub use queue::JobQueue;
