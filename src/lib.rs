//! Ingestion, caching and archival core for a book-scanning station.
//!
//! Scans land in a watched folder, are checked for stability, cached and
//! previewed, grouped into named batches ("books") in a staging folder, and
//! finally moved to per-identifier archive roots with a durable transfer log.
//! `Station` ties the pieces together.

pub mod archive;
pub mod cache;
pub mod config;
pub mod edit;
pub mod error;
pub mod events;
pub mod ingest;
pub mod station;
pub mod stats;
pub mod thumbnail;

pub use config::StationConfig;
pub use error::{ErrorClass, Result, StationError};
pub use events::{EventBus, StationEvent};
pub use station::Station;
