//! Scan folder ingestion: naming rules, stability checks and the watcher

pub mod naming;
pub mod stability;
pub mod watcher;

pub use stability::StabilityDetector;
pub use watcher::{IngestionWatcher, PathObserver, SourceFile, SourceState};
