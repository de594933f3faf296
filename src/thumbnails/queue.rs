//! Thumbnail worker pool.
//!
//! - Bounded set of worker threads pulling the highest-priority request
//! - Disk store consulted first; codec only on a miss
//! - Requests can be cancelled or reprioritized until a worker claims them
//! - Results go to the index (which notifies waiters) and then onto a flume
//!   channel drained by the interface loop
//! - Only results the index accepted are written through to disk, under the
//!   purge lock, so a clear never races with a late write
//! - Out-of-memory decodes are retried once after shrinking the memory tier;
//!   sources over the decode ceiling fail permanently without a retry

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use flume::Sender;
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, error, trace, warn};

use super::disk_store::DiskStore;
use super::error::{CodecError, ThumbError};
use super::generator::{Thumbnail, ThumbnailCodec};
use super::index::{CacheIndex, Outcome};
use super::key::CacheKey;

/// Maximum number of worker threads.
pub const MAX_WORKERS: usize = 8;

/// How long an idle worker sleeps before re-checking for shutdown.
const IDLE_WAIT: Duration = Duration::from_millis(100);

/// Scheduling weight of a request. Higher runs first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(pub u32);

impl Priority {
    /// Off-screen work nobody is waiting on.
    pub const BACKGROUND: Priority = Priority(0);
    /// Rows just outside the viewport.
    pub const PREFETCH: Priority = Priority(1);
    /// Cells currently on screen.
    pub const VISIBLE: Priority = Priority(2);
}

/// A request to generate a thumbnail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    pub key: CacheKey,
    pub priority: Priority,
}

impl GenerationRequest {
    pub fn new(key: CacheKey, priority: Priority) -> Self {
        Self { key, priority }
    }
}

/// Result of a generation, sent to the interface loop.
#[derive(Debug, Clone)]
pub struct Completion {
    pub key: CacheKey,
    pub outcome: Outcome,
}

#[derive(Debug, PartialEq, Eq)]
struct HeapEntry {
    priority: Priority,
    seq: u64,
    key: CacheKey,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Highest priority first, then oldest submission.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct QueueState {
    heap: BinaryHeap<HeapEntry>,
    /// Live requests: key -> (priority, seq). Heap entries not matching this
    /// map are stale (cancelled or reprioritized) and skipped on pop.
    queued: HashMap<CacheKey, (Priority, u64)>,
    next_seq: u64,
    shutdown: bool,
}

impl QueueState {
    fn push(&mut self, key: CacheKey, priority: Priority) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queued.insert(key.clone(), (priority, seq));
        self.heap.push(HeapEntry { priority, seq, key });
    }

    fn pop(&mut self) -> Option<CacheKey> {
        while let Some(entry) = self.heap.pop() {
            if self.queued.get(&entry.key) == Some(&(entry.priority, entry.seq)) {
                self.queued.remove(&entry.key);
                return Some(entry.key);
            }
        }
        None
    }
}

struct Shared {
    state: Mutex<QueueState>,
    available: Condvar,
    index: Arc<CacheIndex>,
    disk: DiskStore,
    codec: Arc<dyn ThumbnailCodec>,
    completions: Sender<Completion>,
    active: AtomicUsize,
    /// Workers hold it shared while completing and writing through; clear
    /// and invalidate hold it exclusively.
    purge: RwLock<()>,
}

/// A generated thumbnail and whether it still needs writing to disk.
struct Generated {
    thumbnail: Thumbnail,
    from_disk: bool,
}

/// Fixed-size pool of generation workers.
pub struct GenerationPool {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl GenerationPool {
    /// Start `workers` threads (clamped to `1..=MAX_WORKERS`).
    pub fn new(
        workers: usize,
        index: Arc<CacheIndex>,
        disk: DiskStore,
        codec: Arc<dyn ThumbnailCodec>,
        completions: Sender<Completion>,
    ) -> Self {
        let num_workers = workers.clamp(1, MAX_WORKERS);
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState::default()),
            available: Condvar::new(),
            index,
            disk,
            codec,
            completions,
            active: AtomicUsize::new(0),
            purge: RwLock::new(()),
        });

        let workers = (0..num_workers)
            .map(|worker_id| {
                let shared = Arc::clone(&shared);
                thread::Builder::new()
                    .name(format!("thumb-worker-{}", worker_id))
                    .spawn(move || worker_loop(worker_id, shared))
                    .expect("Failed to spawn thumbnail worker")
            })
            .collect();

        debug!(num_workers, "Started thumbnail worker pool");
        Self { shared, workers }
    }

    /// Queue a request, or raise/lower the priority of one already queued.
    pub fn submit(&self, req: GenerationRequest) {
        let mut state = self.shared.state.lock();
        if state.shutdown {
            warn!(key = %req.key, "Thumbnail pool is shut down, dropping request");
            return;
        }
        if let Some((priority, _)) = state.queued.get(&req.key) {
            if *priority == req.priority {
                return;
            }
        }
        trace!(key = %req.key, priority = req.priority.0, "Queued thumbnail request");
        state.push(req.key, req.priority);
        drop(state);
        self.shared.available.notify_one();
    }

    /// Change the priority of a queued request. False if a worker already
    /// claimed it (or it was never queued).
    pub fn reprioritize(&self, key: &CacheKey, priority: Priority) -> bool {
        let mut state = self.shared.state.lock();
        match state.queued.get(key) {
            Some((current, _)) if *current == priority => true,
            Some(_) => {
                state.push(key.clone(), priority);
                true
            }
            None => false,
        }
    }

    /// Remove a request that no worker has claimed yet. In-flight work is
    /// never interrupted; returns false in that case.
    pub fn cancel(&self, key: &CacheKey) -> bool {
        self.shared.state.lock().queued.remove(key).is_some()
    }

    /// Remove every unclaimed request and return their keys.
    pub fn cancel_all(&self) -> Vec<CacheKey> {
        let mut state = self.shared.state.lock();
        state.heap.clear();
        let keys: Vec<CacheKey> = state.queued.drain().map(|(key, _)| key).collect();
        debug!(count = keys.len(), "Cancelled queued thumbnail requests");
        keys
    }

    pub fn is_queued(&self, key: &CacheKey) -> bool {
        self.shared.state.lock().queued.contains_key(key)
    }

    /// Run `f` with write-through suspended. A worker finishing meanwhile sees
    /// the index state `f` left behind before it may touch the disk store.
    pub fn purge<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.shared.purge.write();
        f()
    }

    /// Get the number of queued requests.
    pub fn queued_count(&self) -> usize {
        self.shared.state.lock().queued.len()
    }

    /// Get the number of active workers currently processing.
    pub fn active_worker_count(&self) -> usize {
        self.shared.active.load(Ordering::Relaxed)
    }

    /// Check if there is work in progress.
    pub fn is_busy(&self) -> bool {
        self.queued_count() > 0 || self.active_worker_count() > 0
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Stop accepting work and join all workers. Requests still queued are dropped.
    pub fn shutdown(&mut self) {
        debug!("Shutting down thumbnail pool");
        self.shared.state.lock().shutdown = true;
        self.shared.available.notify_all();

        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        debug!("Thumbnail pool shutdown complete");
    }
}

impl Drop for GenerationPool {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            self.shutdown();
        }
    }
}

/// Worker thread loop.
fn worker_loop(worker_id: usize, shared: Arc<Shared>) {
    debug!(worker_id, "Thumbnail worker started");

    loop {
        let key = {
            let mut state = shared.state.lock();
            loop {
                if state.shutdown {
                    break None;
                }
                if let Some(key) = state.pop() {
                    // Counted while still locked so `is_busy` never sees a gap.
                    shared.active.fetch_add(1, Ordering::Relaxed);
                    break Some(key);
                }
                shared.available.wait_for(&mut state, IDLE_WAIT);
            }
        };
        let Some(key) = key else {
            break;
        };

        process_request(worker_id, &shared, key);
        shared.active.fetch_sub(1, Ordering::Relaxed);
    }

    debug!(worker_id, "Thumbnail worker stopped");
}

/// Generate one key, record it in the index and notify the interface loop.
fn process_request(worker_id: usize, shared: &Shared, key: CacheKey) {
    trace!(worker_id, %key, "Processing thumbnail request");

    let generated = catch_unwind(AssertUnwindSafe(|| generate(shared, &key))).unwrap_or_else(|panic| {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "worker panicked".to_string());
        error!(worker_id, %key, %message, "Thumbnail worker panicked");
        Err(ThumbError::Internal(message))
    });

    if let Err(e) = &generated {
        warn!(worker_id, %key, error = %e, "Failed to generate thumbnail");
    }

    let write_back = matches!(&generated, Ok(g) if !g.from_disk);
    let outcome: Outcome = generated.map(|g| g.thumbnail);

    {
        let _purge = shared.purge.read();
        if !shared.index.complete(&key, outcome.clone()) {
            return;
        }
        if let (true, Ok(thumbnail)) = (write_back, &outcome) {
            shared.disk.put(&key, thumbnail);
        }
    }

    if let Err(e) = shared.completions.send(Completion { key, outcome }) {
        warn!(worker_id, error = ?e, "Failed to send thumbnail completion");
    }
}

fn generate(shared: &Shared, key: &CacheKey) -> Result<Generated, ThumbError> {
    if let Some(thumbnail) = shared.disk.get(key) {
        return Ok(Generated {
            thumbnail,
            from_disk: true,
        });
    }

    let decode = || shared.codec.decode_and_scale(key.path(), key.size_class());
    let thumbnail = match decode() {
        Err(CodecError::ResourceExhausted(reason)) => {
            let target = shared.index.max_memory() / 2;
            let evicted = shared.index.shrink_to(target);
            warn!(%key, %reason, evicted, "Decode ran out of memory, retrying once");
            decode()?
        }
        other => other?,
    };

    Ok(Generated {
        thumbnail,
        from_disk: false,
    })
}
