//! Station configuration
//!
//! Persisted as pretty JSON. Keys written by the original station
//! (`scan_folder`, `todays_books_folder`, `city_paths`, `caching_enabled`)
//! are read as-is; every other field falls back to its default.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::archive::fsops::write_atomic;
use crate::archive::routing::RoutingTable;
use crate::error::{Result, StationError};

const APP_DIR: &str = "scan-station";
const CONFIG_FILE: &str = "config.json";
const LOG_FILE: &str = "books_complete_log.json";

/// Everything the core needs to know about the station's folders and tunables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StationConfig {
    /// Folder the scanner writes into
    #[serde(rename = "scan_folder")]
    pub scan_root: PathBuf,
    /// "Today's books": staged batches waiting for transfer
    #[serde(rename = "todays_books_folder")]
    pub staging_root: PathBuf,
    /// Routing identifier -> destination root
    #[serde(rename = "city_paths")]
    pub routing: RoutingTable,
    /// Durable transfer log
    pub log_file: PathBuf,
    /// Copies of originals taken before destructive edits
    pub backup_dir: PathBuf,
    /// Keep decoded full-size images in memory
    pub caching_enabled: bool,
    pub stability: StabilityConfig,
    pub cache: CacheConfig,
    pub thumbnails: ThumbnailConfig,
    pub transfer: TransferConfig,
    /// How often the stats ticker recomputes counters
    pub stats_interval_ms: u64,
}

impl Default for StationConfig {
    fn default() -> Self {
        Self {
            scan_root: PathBuf::new(),
            staging_root: PathBuf::new(),
            routing: RoutingTable::default(),
            log_file: app_data_dir().join(LOG_FILE),
            backup_dir: default_backup_dir(),
            caching_enabled: true,
            stability: StabilityConfig::default(),
            cache: CacheConfig::default(),
            thumbnails: ThumbnailConfig::default(),
            transfer: TransferConfig::default(),
            stats_interval_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StabilityConfig {
    pub poll_interval_ms: u64,
    /// Consecutive identical (size, mtime) samples required
    pub required_samples: u32,
    /// Bytes read by the open-and-read probe
    pub probe_bytes: usize,
    pub timeout_ms: u64,
}

impl Default for StabilityConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 150,
            required_samples: 3,
            probe_bytes: 1024,
            timeout_ms: 10_000,
        }
    }
}

impl StabilityConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Byte budget for decoded full-size images
    pub budget_bytes: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            budget_bytes: 500 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThumbnailConfig {
    pub width: u32,
    pub height: u32,
    pub cache_entries: usize,
    pub cache_bytes: u64,
    pub workers: usize,
    /// Items either side of the visible range that count as "adjacent"
    pub adjacency_window: usize,
}

impl Default for ThumbnailConfig {
    fn default() -> Self {
        Self {
            width: 90,
            height: 110,
            cache_entries: 200,
            cache_bytes: 64 * 1024 * 1024,
            workers: 2,
            adjacency_window: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub retry_attempts: u32,
    /// Backoff grows linearly: attempt * retry_backoff_ms
    pub retry_backoff_ms: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            retry_attempts: 5,
            retry_backoff_ms: 100,
        }
    }
}

impl StationConfig {
    /// Default config file location
    /// - Linux: ~/.local/share/scan-station/config.json
    /// - macOS: ~/Library/Application Support/scan-station/config.json
    /// - Windows: %APPDATA%\scan-station\config.json
    pub fn default_path() -> PathBuf {
        app_data_dir().join(CONFIG_FILE)
    }

    /// Load a config file, falling back to defaults when it does not exist yet
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }

        let bytes = fs::read(path).map_err(|e| StationError::io("read config", path, e))?;
        serde_json::from_slice(&bytes).map_err(|source| StationError::InvalidConfig {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Save atomically (temp file + rename) so a crash never truncates it
    pub fn save(&self, path: &Path) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(self).map_err(|source| {
            StationError::InvalidConfig {
                path: path.to_path_buf(),
                source,
            }
        })?;
        write_atomic(path, &bytes)
    }

    /// Check the folders the core cannot run without
    pub fn validate(&self) -> Result<()> {
        if self.scan_root.as_os_str().is_empty() || !self.scan_root.is_dir() {
            return Err(StationError::RootUnavailable("scan", self.scan_root.clone()));
        }
        if self.staging_root.as_os_str().is_empty() || !self.staging_root.is_dir() {
            return Err(StationError::RootUnavailable(
                "staging",
                self.staging_root.clone(),
            ));
        }
        Ok(())
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms.max(100))
    }
}

fn app_data_dir() -> PathBuf {
    let mut path = dirs::data_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."));
    path.push(APP_DIR);
    path
}

/// ~/.cache/scan-station/backups on Linux
fn default_backup_dir() -> PathBuf {
    let mut path = dirs_next::cache_dir()
        .or_else(dirs_next::home_dir)
        .unwrap_or_else(|| PathBuf::from("."));
    path.push(APP_DIR);
    path.push("backups");
    path
}
