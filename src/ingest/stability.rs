//! Decides when a scan has finished being written
//!
//! Scanners create the file first and fill it over several hundred
//! milliseconds, sometimes holding a lock the whole time. A file is only
//! "ready" once size and mtime have held still for several polls and the
//! head of the file can actually be read.

use std::path::Path;
use std::time::{Duration, SystemTime};

use tokio::fs;
use tokio::io::AsyncReadExt;
use tokio::time::{sleep, Instant};
use tracing::debug;

use crate::config::StabilityConfig;

#[derive(Debug, Clone, Copy)]
pub struct StabilityDetector {
    poll_interval: Duration,
    required_samples: u32,
    probe_bytes: usize,
    timeout: Duration,
}

/// One observation of a file. Two equal samples in a row mean "no change".
#[derive(Debug, PartialEq, Eq)]
struct Sample {
    size: u64,
    modified: Option<SystemTime>,
    head: Vec<u8>,
}

impl Default for StabilityDetector {
    fn default() -> Self {
        Self::from(&StabilityConfig::default())
    }
}

impl From<&StabilityConfig> for StabilityDetector {
    fn from(config: &StabilityConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            required_samples: config.required_samples.max(1),
            probe_bytes: config.probe_bytes.max(1),
            timeout: config.timeout(),
        }
    }
}

impl StabilityDetector {
    /// Configured timeout, for callers that don't pick their own
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Poll `path` until it is stable or `timeout` runs out.
    ///
    /// `false` means "not yet", never "broken": the caller may try again.
    pub async fn is_stable(&self, path: &Path, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut previous: Option<Sample> = None;
        let mut identical = 0u32;

        loop {
            // Step 1: sample. A failed sample resets the run.
            match self.sample(path).await {
                Some(current) if previous.as_ref() == Some(&current) => identical += 1,
                Some(current) => {
                    previous = Some(current);
                    identical = 1;
                }
                None => {
                    previous = None;
                    identical = 0;
                }
            }

            // Step 2: enough identical samples in a row
            if identical >= self.required_samples {
                debug!(path = %path.display(), "file is stable");
                return true;
            }

            // Step 3: wait for the next poll unless it would overshoot
            if Instant::now() + self.poll_interval > deadline {
                debug!(path = %path.display(), samples = identical, "stability timeout");
                return false;
            }
            sleep(self.poll_interval).await;
        }
    }

    async fn sample(&self, path: &Path) -> Option<Sample> {
        let meta = fs::metadata(path).await.ok()?;
        // Zero bytes: the scanner has created the file but not written yet
        if !meta.is_file() || meta.len() == 0 {
            return None;
        }

        let mut file = fs::File::open(path).await.ok()?;
        let mut head = vec![0u8; self.probe_bytes.min(meta.len() as usize)];
        file.read_exact(&mut head).await.ok()?;

        Some(Sample {
            size: meta.len(),
            modified: meta.modified().ok(),
            head,
        })
    }
}
