//! Error types shared by every station component
//!
//! Each variant belongs to one of three classes (see `ErrorClass`).
//! Transient failures are retried, malformed input fails a single unit and
//! permanent failures are surfaced to the operator with state left untouched.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, StationError>;

/// How a failure should be handled by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Locked file, sharing violation, network hiccup: retry with backoff
    Transient,
    /// Bad input for one unit (one batch, one log, one job): skip and report
    Malformed,
    /// Needs operator action: abort the unit, leave state unchanged
    Permanent,
}

#[derive(Debug, Error)]
pub enum StationError {
    #[error("{op} failed for {path}: {source}")]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{op} still failing for {path} after {attempts} attempts: {source}")]
    RetriesExhausted {
        op: &'static str,
        path: PathBuf,
        attempts: u32,
        #[source]
        source: io::Error,
    },

    #[error("transfer log {path} is corrupted: {source}")]
    CorruptLog {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("config file {path} is invalid: {source}")]
    InvalidConfig {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("{0} folder is not configured or does not exist: {1}")]
    RootUnavailable(&'static str, PathBuf),

    #[error("no routing identifier in batch name '{0}'")]
    NoRoutingIdentifier(String),

    #[error("no destination configured for identifier '{identifier}' (batch '{batch}')")]
    MissingRoute { identifier: String, batch: String },

    #[error("destination root does not exist: {0}")]
    DestinationUnavailable(PathBuf),

    #[error("destination already exists: {0}")]
    DestinationExists(PathBuf),

    #[error("copy of {path} is incomplete: expected {expected} bytes, found {actual}")]
    SizeMismatch {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },

    #[error("invalid batch name '{0}'")]
    InvalidBatchName(String),

    #[error("batch '{0}' already exists in staging")]
    BatchExists(String),

    #[error("{0} is not an image in the scan folder")]
    NotInScanRoot(PathBuf),

    #[error("crop region out of range: {0}")]
    InvalidCropRegion(String),

    #[error("failed to decode {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("{0} changed while it was being loaded")]
    Superseded(PathBuf),

    #[error("no backup found for {0}")]
    NoBackup(PathBuf),

    #[error("log clear was not confirmed")]
    ClearNotConfirmed,

    #[error("file watcher error: {0}")]
    Watch(#[from] notify::Error),

    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl StationError {
    /// Wrap an I/O error with the operation and path it came from
    pub fn io(op: &'static str, path: impl AsRef<Path>, source: io::Error) -> Self {
        StationError::Io {
            op,
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            StationError::Io { source, .. } if is_transient_io(source) => ErrorClass::Transient,
            StationError::Io { .. } => ErrorClass::Permanent,
            StationError::CorruptLog { .. }
            | StationError::InvalidConfig { .. }
            | StationError::NoRoutingIdentifier(_)
            | StationError::SizeMismatch { .. }
            | StationError::InvalidBatchName(_)
            | StationError::NotInScanRoot(_)
            | StationError::InvalidCropRegion(_)
            | StationError::Image { .. } => ErrorClass::Malformed,
            StationError::Superseded(_) => ErrorClass::Transient,
            _ => ErrorClass::Permanent,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

/// Lock and sharing violations, busy resources and interrupted calls.
///
/// `PermissionDenied` is included because Windows reports files held open
/// by the scanner driver that way.
pub fn is_transient_io(err: &io::Error) -> bool {
    use io::ErrorKind::*;

    if matches!(
        err.kind(),
        Interrupted | WouldBlock | TimedOut | PermissionDenied
    ) {
        return true;
    }

    match err.raw_os_error() {
        // EBUSY, ETXTBSY
        #[cfg(unix)]
        Some(16) | Some(26) => true,
        // ERROR_SHARING_VIOLATION, ERROR_LOCK_VIOLATION, ERROR_NETNAME_DELETED
        #[cfg(windows)]
        Some(32) | Some(33) | Some(64) => true,
        _ => false,
    }
}

/// Rename failed because source and destination are on different volumes
pub fn is_cross_device(err: &io::Error) -> bool {
    match err.raw_os_error() {
        // EXDEV
        #[cfg(unix)]
        Some(18) => true,
        // ERROR_NOT_SAME_DEVICE
        #[cfg(windows)]
        Some(17) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_errors_are_transient() {
        let err = StationError::io(
            "rename",
            "/tmp/a",
            io::Error::new(io::ErrorKind::PermissionDenied, "locked"),
        );
        assert_eq!(err.class(), ErrorClass::Transient);
        assert!(err.is_transient());
    }

    #[test]
    fn test_missing_file_is_permanent() {
        let err = StationError::io(
            "open",
            "/tmp/a",
            io::Error::new(io::ErrorKind::NotFound, "gone"),
        );
        assert_eq!(err.class(), ErrorClass::Permanent);
    }

    #[test]
    fn test_routing_errors() {
        assert_eq!(
            StationError::NoRoutingIdentifier("BOOK".into()).class(),
            ErrorClass::Malformed
        );
        let missing = StationError::MissingRoute {
            identifier: "999".into(),
            batch: "BOOK-999-A".into(),
        };
        assert_eq!(missing.class(), ErrorClass::Permanent);
    }

    #[cfg(unix)]
    #[test]
    fn test_exdev_is_cross_device() {
        assert!(is_cross_device(&io::Error::from_raw_os_error(18)));
        assert!(!is_cross_device(&io::Error::from_raw_os_error(2)));
    }
}
