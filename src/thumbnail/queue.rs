//! Priority job queue shared by the thumbnail workers
//!
//! Ordered by `(priority, sequence)`: lowest priority value first, FIFO among
//! equals. A key that is queued or being generated is never queued again.
//! Every path with a queued or in-flight job has a slot holding its epoch;
//! removing or renaming the source bumps it, jobs from an older epoch are
//! dropped at dequeue, and workers re-check the epoch after decoding. A slot
//! goes away with the last job that references it.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

use super::job::{Priority, ThumbnailJob, ThumbnailKey, ThumbnailRequest, Variant};

/// Heap wrapper: `BinaryHeap` is a max-heap, so the ordering is reversed
#[derive(Debug)]
struct Queued(ThumbnailJob);

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.0.priority == other.0.priority && self.0.sequence == other.0.sequence
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        (other.0.priority, other.0.sequence).cmp(&(self.0.priority, self.0.sequence))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    /// New job with this sequence number
    Queued(u64),
    /// Same key already queued or in flight
    Duplicate,
    Closed,
}

/// The job queued or in flight for a key
#[derive(Debug, Clone, Copy)]
struct Active {
    sequence: u64,
    priority: Priority,
    variant: Variant,
}

#[derive(Debug, Default)]
struct PathSlot {
    epoch: u64,
    /// Jobs queued or handed to a worker and not yet finished
    jobs: usize,
}

#[derive(Debug, Default)]
struct State {
    heap: BinaryHeap<Queued>,
    active: HashMap<ThumbnailKey, Active>,
    paths: HashMap<PathBuf, PathSlot>,
    next_sequence: u64,
    closed: bool,
}

impl State {
    fn enqueue(&mut self, request: ThumbnailRequest) -> Enqueued {
        if self.closed {
            return Enqueued::Closed;
        }
        let key = request.key();
        if self.active.contains_key(&key) {
            debug!(%key, "thumbnail already queued");
            return Enqueued::Duplicate;
        }

        self.next_sequence += 1;
        let sequence = self.next_sequence;
        let slot = self.paths.entry(request.path.clone()).or_default();
        slot.jobs += 1;
        let job = ThumbnailJob {
            priority: request.priority,
            sequence,
            epoch: slot.epoch,
            source_path: request.path,
            variant: request.variant,
        };
        self.active.insert(
            key,
            Active {
                sequence,
                priority: job.priority,
                variant: job.variant,
            },
        );
        self.heap.push(Queued(job));
        Enqueued::Queued(sequence)
    }

    fn is_current(&self, job: &ThumbnailJob) -> bool {
        self.paths
            .get(&job.source_path)
            .is_some_and(|slot| slot.epoch == job.epoch)
    }

    /// A job referencing `path` is gone for good
    fn release(&mut self, path: &Path) {
        if let Some(slot) = self.paths.get_mut(path) {
            slot.jobs = slot.jobs.saturating_sub(1);
            if slot.jobs == 0 {
                self.paths.remove(path);
            }
        }
    }

    fn forget(&mut self, job: &ThumbnailJob) {
        let key = job.key();
        if self
            .active
            .get(&key)
            .is_some_and(|active| active.sequence == job.sequence)
        {
            self.active.remove(&key);
        }
        self.release(&job.source_path);
    }

    fn cancel(&mut self, path: &Path) -> usize {
        if let Some(slot) = self.paths.get_mut(path) {
            slot.epoch += 1;
        }
        self.active.retain(|key, _| key.path != path);

        let (dropped, kept): (Vec<Queued>, Vec<Queued>) = std::mem::take(&mut self.heap)
            .into_iter()
            .partition(|Queued(job)| job.source_path == path);
        self.heap = kept.into_iter().collect();
        for _ in &dropped {
            self.release(path);
        }
        dropped.len()
    }
}

#[derive(Debug, Default)]
pub struct JobQueue {
    state: Mutex<State>,
    wake: Notify,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, request: ThumbnailRequest) -> Enqueued {
        let outcome = self.state.lock().enqueue(request);
        if let Enqueued::Queued(_) = outcome {
            self.wake.notify_one();
        }
        outcome
    }

    /// Next live job without waiting
    pub fn try_pop(&self) -> Option<ThumbnailJob> {
        let mut state = self.state.lock();
        while let Some(Queued(job)) = state.heap.pop() {
            if state.is_current(&job) {
                return Some(job);
            }
            debug!(path = %job.source_path.display(), "dropping job for removed source");
            state.forget(&job);
        }
        None
    }

    /// Wait for the next live job; `None` once the queue is closed
    pub async fn pop(&self) -> Option<ThumbnailJob> {
        loop {
            let notified = self.wake.notified();
            tokio::pin!(notified);
            // Register before checking so a push in between is not missed
            notified.as_mut().enable();

            if let Some(job) = self.try_pop() {
                return Some(job);
            }
            if self.state.lock().closed {
                return None;
            }
            notified.await;
        }
    }

    /// The job's source has not been removed or renamed since it was queued
    pub fn is_current(&self, job: &ThumbnailJob) -> bool {
        self.state.lock().is_current(job)
    }

    /// Mark a dequeued job as done so its key can be requested again.
    /// Every job handed out by `pop` must be finished exactly once.
    pub fn finish(&self, job: &ThumbnailJob) {
        self.state.lock().forget(job);
    }

    /// Drop queued work for `path` and flag in-flight work as stale
    pub fn cancel_path(&self, path: &Path) {
        let dropped = self.state.lock().cancel(path);
        if dropped > 0 {
            debug!(path = %path.display(), dropped, "cancelled queued thumbnails");
        }
    }

    /// Move work for `from` over to `to`: queued and in-flight jobs of the
    /// old path are cancelled and queued again under the new one with their
    /// original priority. Returns how many were queued again.
    pub fn rename_path(&self, from: &Path, to: &Path) -> usize {
        let mut state = self.state.lock();
        let mut moved: Vec<Active> = state
            .active
            .iter()
            .filter(|(key, _)| key.path == from)
            .map(|(_, active)| *active)
            .collect();
        moved.sort_by_key(|active| active.sequence);
        state.cancel(from);

        let requeued = moved
            .into_iter()
            .map(|active| ThumbnailRequest::new(to, active.variant, active.priority))
            .filter(|request| matches!(state.enqueue(request.clone()), Enqueued::Queued(_)))
            .count();
        drop(state);

        for _ in 0..requeued {
            self.wake.notify_one();
        }
        if requeued > 0 {
            debug!(from = %from.display(), to = %to.display(), requeued, "thumbnails follow rename");
        }
        requeued
    }

    /// Stop handing out jobs and wake every waiting worker
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.wake.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Jobs waiting in the heap
    pub fn len(&self) -> usize {
        self.state.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Paths with a job queued or in flight
    pub fn tracked_paths(&self) -> usize {
        self.state.lock().paths.len()
    }
}
