//! Scan folder watcher
//!
//! Wraps a non-recursive `notify` watcher on the scan root. Raw events are
//! forwarded from notify's callback thread into a tokio task through an
//! unbounded channel; that task keeps the registry of tracked scans, runs the
//! stability check for new files and publishes ready / failed / removed /
//! renamed events on the bus.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use notify::event::{EventKind, ModifyKind, RenameMode};
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use super::naming::{is_hidden, is_image, natural_cmp};
use super::stability::StabilityDetector;
use crate::error::{Result, StationError};
use crate::events::{EventBus, StationEvent};

/// How long a "renamed from" half waits for its "renamed to" partner
const RENAME_PAIRING_WINDOW: Duration = Duration::from_millis(500);

/// Told synchronously about removals and renames, before the matching event
/// is published, so caches never serve a path that is already gone.
pub trait PathObserver: Send + Sync {
    fn path_removed(&self, path: &Path);
    fn path_renamed(&self, from: &Path, to: &Path);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceState {
    Settling,
    Ready,
    Failed,
}

/// A scan the watcher is tracking
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceFile {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub modified_time: Option<DateTime<Local>>,
    pub discovered_at: DateTime<Local>,
    pub state: SourceState,
    /// Bumped whenever a new stability check supersedes the previous one
    #[serde(skip)]
    generation: u64,
}

impl SourceFile {
    fn discovered(path: PathBuf, generation: u64) -> Self {
        Self {
            path,
            size_bytes: 0,
            modified_time: None,
            discovered_at: Local::now(),
            state: SourceState::Settling,
            generation,
        }
    }
}

struct Shared {
    scan_root: PathBuf,
    detector: StabilityDetector,
    registry: Mutex<HashMap<PathBuf, SourceFile>>,
    observers: RwLock<Vec<Arc<dyn PathObserver>>>,
    bus: EventBus,
    generations: AtomicU64,
}

struct Running {
    _watcher: RecommendedWatcher,
    events: JoinHandle<()>,
}

pub struct IngestionWatcher {
    shared: Arc<Shared>,
    running: Mutex<Option<Running>>,
}

impl IngestionWatcher {
    pub fn new(scan_root: impl Into<PathBuf>, detector: StabilityDetector, bus: EventBus) -> Self {
        Self {
            shared: Arc::new(Shared {
                scan_root: scan_root.into(),
                detector,
                registry: Mutex::new(HashMap::new()),
                observers: RwLock::new(Vec::new()),
                bus,
                generations: AtomicU64::new(0),
            }),
            running: Mutex::new(None),
        }
    }

    pub fn scan_root(&self) -> &Path {
        &self.shared.scan_root
    }

    pub fn add_observer(&self, observer: Arc<dyn PathObserver>) {
        self.shared.observers.write().push(observer);
    }

    /// Start watching and sweep what is already in the scan folder.
    ///
    /// Must be called from inside a tokio runtime. Calling it twice is a no-op.
    pub fn start(&self) -> Result<()> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Ok(());
        }

        let root = &self.shared.scan_root;
        if !root.is_dir() {
            return Err(StationError::RootUnavailable("scan", root.clone()));
        }

        // Step 1: subscribe before sweeping so nothing slips between the two
        let (tx, rx) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let _ = tx.send(res);
        })?;
        watcher.watch(root, RecursiveMode::NonRecursive)?;

        let events = tokio::spawn(run_events(Arc::clone(&self.shared), rx));
        *running = Some(Running {
            _watcher: watcher,
            events,
        });
        drop(running);

        // Step 2: everything already on disk counts as newly created
        let existing = self.shared.sweep()?;
        info!(path = %root.display(), existing = existing.len(), "watching scan folder");
        for path in existing {
            self.shared.created(path);
        }
        Ok(())
    }

    pub fn stop(&self) {
        if let Some(running) = self.running.lock().take() {
            running.events.abort();
            info!(path = %self.shared.scan_root.display(), "stopped watching scan folder");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Re-run the stability check for a scan that failed (or was never seen).
    /// Returns `false` when there is nothing to retry.
    pub fn retry(&self, path: &Path) -> bool {
        if !is_image(path) || !path.is_file() {
            return false;
        }
        let generation = {
            let mut registry = self.shared.registry.lock();
            if registry
                .get(path)
                .is_some_and(|file| file.state != SourceState::Failed)
            {
                return false;
            }
            let generation = self.shared.next_generation();
            registry.insert(path.to_path_buf(), SourceFile::discovered(path.to_path_buf(), generation));
            generation
        };
        info!(path = %path.display(), "retrying stability check");
        self.shared.settle(path.to_path_buf(), generation);
        true
    }

    /// Stop tracking `path` without publishing anything (it moved into a batch)
    pub fn forget(&self, path: &Path) {
        self.shared.registry.lock().remove(path);
    }

    /// Tracked scans in natural order
    pub fn snapshot(&self) -> Vec<SourceFile> {
        let mut files: Vec<SourceFile> = self.shared.registry.lock().values().cloned().collect();
        files.sort_by(|a, b| natural_cmp(&a.path, &b.path));
        files
    }

    pub fn state_of(&self, path: &Path) -> Option<SourceState> {
        self.shared.registry.lock().get(path).map(|file| file.state)
    }

    pub fn ready_count(&self) -> usize {
        self.shared
            .registry
            .lock()
            .values()
            .filter(|file| file.state == SourceState::Ready)
            .count()
    }
}

impl Drop for IngestionWatcher {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.events.abort();
        }
    }
}

impl Shared {
    fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn sweep(&self) -> Result<Vec<PathBuf>> {
        let entries = fs::read_dir(&self.scan_root)
            .map_err(|e| StationError::io("list scan folder", &self.scan_root, e))?;
        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && is_image(path) && !is_hidden(path))
            .collect();
        paths.sort_by(|a, b| natural_cmp(a, b));
        Ok(paths)
    }

    fn created(self: &Arc<Self>, path: PathBuf) {
        if !is_image(&path) || is_hidden(&path) {
            return;
        }
        let generation = {
            let mut registry = self.registry.lock();
            // Repeated create events for a known scan are no-ops
            if registry
                .get(&path)
                .is_some_and(|file| file.state != SourceState::Failed)
            {
                return;
            }
            let generation = self.next_generation();
            registry.insert(path.clone(), SourceFile::discovered(path.clone(), generation));
            generation
        };
        debug!(path = %path.display(), "new scan, waiting for it to settle");
        self.settle(path, generation);
    }

    fn settle(self: &Arc<Self>, path: PathBuf, generation: u64) {
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            let stable = shared
                .detector
                .is_stable(&path, shared.detector.timeout())
                .await;
            let meta = tokio::fs::metadata(&path).await.ok();

            let event = {
                let mut registry = shared.registry.lock();
                let Some(file) = registry.get_mut(&path) else {
                    return;
                };
                // Removed, renamed or retried while we were waiting
                if file.generation != generation {
                    return;
                }
                if let Some(meta) = meta {
                    file.size_bytes = meta.len();
                    file.modified_time = meta.modified().ok().map(DateTime::<Local>::from);
                }
                if stable {
                    file.state = SourceState::Ready;
                    StationEvent::FileReady(path.clone())
                } else {
                    file.state = SourceState::Failed;
                    StationEvent::FileFailed(path.clone())
                }
            };

            if stable {
                info!(path = %path.display(), "scan ready");
            } else {
                warn!(path = %path.display(), "scan did not settle in time");
            }
            shared.bus.publish(event);
        });
    }

    fn removed(&self, path: PathBuf) {
        if !is_image(&path) {
            return;
        }
        self.registry.lock().remove(&path);
        for observer in self.observers.read().iter() {
            observer.path_removed(&path);
        }
        debug!(path = %path.display(), "scan removed");
        self.bus.publish(StationEvent::FileRemoved(path));
    }

    fn renamed(self: &Arc<Self>, from: PathBuf, to: PathBuf) {
        let keep = to.parent() == Some(self.scan_root.as_path()) && is_image(&to) && !is_hidden(&to);

        let moved = {
            let mut registry = self.registry.lock();
            let tracked = registry.remove(&from);
            match tracked {
                Some(file) if keep => Some(file),
                Some(_) => None,
                // Already applied (inotify reports both halves and the pair)
                None if registry.contains_key(&to) => return,
                None => {
                    drop(registry);
                    if keep {
                        self.created(to);
                    }
                    return;
                }
            }
        };

        let Some(mut file) = moved else {
            // Renamed to something that is no longer a scan
            for observer in self.observers.read().iter() {
                observer.path_removed(&from);
            }
            self.bus.publish(StationEvent::FileRemoved(from));
            return;
        };

        let resettle = file.state != SourceState::Ready;
        file.path = to.clone();
        if resettle {
            file.generation = self.next_generation();
        }
        let generation = file.generation;
        self.registry.lock().insert(to.clone(), file);

        for observer in self.observers.read().iter() {
            observer.path_renamed(&from, &to);
        }
        debug!(from = %from.display(), to = %to.display(), "scan renamed");
        self.bus.publish(StationEvent::FileRenamed {
            from,
            to: to.clone(),
        });

        if resettle {
            self.settle(to, generation);
        }
    }

    fn dispatch(self: &Arc<Self>, event: Event, pairing: &mut RenamePairing) {
        let tracker = event.tracker();
        let mut paths = event.paths.into_iter();

        match event.kind {
            EventKind::Create(_) => paths.for_each(|path| self.created(path)),
            EventKind::Remove(_) => paths.for_each(|path| self.removed(path)),
            EventKind::Modify(ModifyKind::Name(mode)) => match mode {
                RenameMode::Both => {
                    if let (Some(from), Some(to)) = (paths.next(), paths.next()) {
                        self.renamed(from, to);
                    }
                }
                RenameMode::From => {
                    if let Some(from) = paths.next() {
                        pairing.push(tracker, from, Instant::now());
                    }
                }
                RenameMode::To => {
                    if let Some(to) = paths.next() {
                        match pairing.take(tracker) {
                            Some(from) => self.renamed(from, to),
                            None => self.created(to),
                        }
                    }
                }
                // Platforms that don't say which half this is
                _ => {
                    for path in paths {
                        if path.exists() {
                            self.created(path);
                        } else {
                            self.removed(path);
                        }
                    }
                }
            },
            _ => {}
        }
    }
}

/// "Renamed from" halves waiting for their partner
#[derive(Debug, Default)]
struct RenamePairing {
    pending: Vec<(Option<usize>, PathBuf, Instant)>,
}

impl RenamePairing {
    fn push(&mut self, tracker: Option<usize>, from: PathBuf, at: Instant) {
        self.pending.push((tracker, from, at));
    }

    /// Matching half by tracker id, or the latest untracked one
    fn take(&mut self, tracker: Option<usize>) -> Option<PathBuf> {
        let index = self.pending.iter().rposition(|(t, _, _)| *t == tracker)?;
        Some(self.pending.remove(index).1)
    }

    /// Halves whose partner never showed up: the file left the folder
    fn expired(&mut self, now: Instant) -> Vec<PathBuf> {
        let (expired, waiting): (Vec<_>, Vec<_>) = self
            .pending
            .drain(..)
            .partition(|(_, _, at)| now.duration_since(*at) >= RENAME_PAIRING_WINDOW);
        self.pending = waiting;
        expired.into_iter().map(|(_, path, _)| path).collect()
    }

    fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

async fn run_events(shared: Arc<Shared>, mut rx: UnboundedReceiver<notify::Result<Event>>) {
    let mut pairing = RenamePairing::default();

    loop {
        let next = if pairing.is_empty() {
            Some(rx.recv().await)
        } else {
            // Wake up in time to expire unpaired halves
            timeout(RENAME_PAIRING_WINDOW, rx.recv()).await.ok()
        };

        match next {
            Some(Some(Ok(event))) => shared.dispatch(event, &mut pairing),
            Some(Some(Err(err))) => warn!(error = %err, "scan folder watcher error"),
            Some(None) => {
                debug!("watcher channel closed");
                break;
            }
            None => {}
        }

        for path in pairing.expired(Instant::now()) {
            shared.removed(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StabilityConfig;
    use tempfile::TempDir;

    #[derive(Default)]
    struct Recorder {
        removed: Mutex<Vec<PathBuf>>,
        renamed: Mutex<Vec<(PathBuf, PathBuf)>>,
    }

    impl PathObserver for Recorder {
        fn path_removed(&self, path: &Path) {
            self.removed.lock().push(path.to_path_buf());
        }

        fn path_renamed(&self, from: &Path, to: &Path) {
            self.renamed.lock().push((from.to_path_buf(), to.to_path_buf()));
        }
    }

    fn fast_detector() -> StabilityDetector {
        StabilityDetector::from(&StabilityConfig {
            poll_interval_ms: 10,
            required_samples: 3,
            probe_bytes: 64,
            timeout_ms: 2_000,
        })
    }

    async fn next_event(rx: &mut UnboundedReceiver<StationEvent>) -> StationEvent {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("bus closed")
    }

    #[tokio::test]
    async fn test_startup_sweep_reports_existing_scans() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("page10.jpg"), b"ten").unwrap();
        fs::write(dir.path().join("page2.jpg"), b"two").unwrap();
        fs::write(dir.path().join("notes.txt"), b"skip").unwrap();

        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let watcher = IngestionWatcher::new(dir.path(), fast_detector(), bus);
        watcher.start().unwrap();

        let mut ready = Vec::new();
        while ready.len() < 2 {
            if let StationEvent::FileReady(path) = next_event(&mut rx).await {
                ready.push(path);
            }
        }
        ready.sort_by(|a, b| natural_cmp(a, b));

        assert_eq!(ready, [dir.path().join("page2.jpg"), dir.path().join("page10.jpg")]);
        assert_eq!(watcher.ready_count(), 2);
        let snapshot = watcher.snapshot();
        assert_eq!(snapshot[0].size_bytes, 3);
        assert_eq!(snapshot[0].state, SourceState::Ready);
        watcher.stop();
    }

    #[tokio::test]
    async fn test_removal_notifies_observers_first() {
        let dir = TempDir::new().unwrap();
        let page = dir.path().join("0001.jpg");
        fs::write(&page, b"page").unwrap();

        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let recorder = Arc::new(Recorder::default());
        let watcher = IngestionWatcher::new(dir.path(), fast_detector(), bus);
        watcher.add_observer(recorder.clone());
        watcher.start().unwrap();

        while !matches!(next_event(&mut rx).await, StationEvent::FileReady(_)) {}
        fs::remove_file(&page).unwrap();

        loop {
            if let StationEvent::FileRemoved(path) = next_event(&mut rx).await {
                assert_eq!(path, page);
                break;
            }
        }
        assert_eq!(recorder.removed.lock().as_slice(), [page.clone()]);
        assert_eq!(watcher.state_of(&page), None);
    }

    #[tokio::test]
    async fn test_rename_pairs_halves_by_tracker() {
        let dir = TempDir::new().unwrap();
        let from = dir.path().join("a.jpg");
        let to = dir.path().join("b.jpg");
        fs::write(&to, b"page").unwrap();

        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let recorder = Arc::new(Recorder::default());
        let watcher = IngestionWatcher::new(dir.path(), fast_detector(), bus);
        watcher.add_observer(recorder.clone());

        let generation = watcher.shared.next_generation();
        let mut file = SourceFile::discovered(from.clone(), generation);
        file.state = SourceState::Ready;
        watcher.shared.registry.lock().insert(from.clone(), file);

        let mut pairing = RenamePairing::default();
        let rename = |mode| {
            Event::new(EventKind::Modify(ModifyKind::Name(mode))).set_tracker(7)
        };
        watcher
            .shared
            .dispatch(rename(RenameMode::From).add_path(from.clone()), &mut pairing);
        watcher
            .shared
            .dispatch(rename(RenameMode::To).add_path(to.clone()), &mut pairing);
        // inotify follows up with the combined event; it must not apply twice
        watcher.shared.dispatch(
            rename(RenameMode::Both).add_path(from.clone()).add_path(to.clone()),
            &mut pairing,
        );

        match next_event(&mut rx).await {
            StationEvent::FileRenamed { from: f, to: t } => {
                assert_eq!((f, t), (from.clone(), to.clone()));
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(rx.try_recv().is_err());
        assert_eq!(recorder.renamed.lock().len(), 1);
        assert_eq!(watcher.state_of(&to), Some(SourceState::Ready));
        assert_eq!(watcher.state_of(&from), None);
    }

    #[test]
    fn test_unpaired_from_expires_as_removal() {
        let mut pairing = RenamePairing::default();
        let start = Instant::now();
        pairing.push(Some(1), PathBuf::from("/scans/a.jpg"), start);
        pairing.push(None, PathBuf::from("/scans/b.jpg"), start);

        assert!(pairing.expired(start).is_empty());
        assert_eq!(pairing.take(None), Some(PathBuf::from("/scans/b.jpg")));
        assert_eq!(
            pairing.expired(start + RENAME_PAIRING_WINDOW),
            [PathBuf::from("/scans/a.jpg")]
        );
        assert!(pairing.is_empty());
    }

    #[tokio::test]
    async fn test_retry_only_failed_scans() {
        let dir = TempDir::new().unwrap();
        let page = dir.path().join("0001.jpg");
        fs::write(&page, b"page").unwrap();

        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let watcher = IngestionWatcher::new(dir.path(), fast_detector(), bus);

        let generation = watcher.shared.next_generation();
        let mut file = SourceFile::discovered(page.clone(), generation);
        file.state = SourceState::Failed;
        watcher.shared.registry.lock().insert(page.clone(), file);

        assert!(watcher.retry(&page));
        assert!(matches!(next_event(&mut rx).await, StationEvent::FileReady(_)));
        assert!(!watcher.retry(&page));
        assert!(!watcher.retry(&dir.path().join("missing.jpg")));
    }
}
