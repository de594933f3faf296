//! Thumbnail manager: the single entry point for thumbnail requests.
//!
//! Constructed once at startup and passed by reference to whoever needs it.
//! Requests never block: they answer from the index or return `Pending` and
//! hand the key to the worker pool. Results arrive later on the completion
//! channel, which only the interface loop drains.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use flume::Receiver;
use tracing::{debug, error, info};

use crate::config::ThumbnailConfig;

use super::disk_store::DiskStore;
use super::error::ThumbError;
use super::generator::{Thumbnail, ThumbnailCodec, ThumbnailGenerator};
use super::index::{CacheIndex, Lookup, Outcome, Subscription};
use super::key::{CacheKey, SizeClass, ZOOM_LEVELS};
use super::queue::{Completion, GenerationPool, GenerationRequest, Priority};

/// Immediate answer to a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestStatus {
    Ready(Thumbnail),
    Pending,
    Failed(ThumbError),
}

/// Handle for a caller that wants to block until a key resolves.
#[derive(Debug)]
pub enum Ticket {
    Ready(Thumbnail),
    Failed(ThumbError),
    Waiting(Receiver<Outcome>),
}

impl Ticket {
    /// Block until the key resolves. A dropped pending entry yields `Cancelled`.
    pub fn wait(self) -> Outcome {
        match self {
            Self::Ready(thumbnail) => Ok(thumbnail),
            Self::Failed(e) => Err(e),
            Self::Waiting(rx) => rx.recv().unwrap_or(Err(ThumbError::Cancelled)),
        }
    }

    /// Like `wait`, but gives up after `timeout`.
    pub fn wait_timeout(self, timeout: Duration) -> Option<Outcome> {
        match self {
            Self::Ready(thumbnail) => Some(Ok(thumbnail)),
            Self::Failed(e) => Some(Err(e)),
            Self::Waiting(rx) => match rx.recv_timeout(timeout) {
                Ok(outcome) => Some(outcome),
                Err(flume::RecvTimeoutError::Timeout) => None,
                Err(flume::RecvTimeoutError::Disconnected) => Some(Err(ThumbError::Cancelled)),
            },
        }
    }
}

/// What the grid may do with the manager: request, look up, deprioritize.
pub trait ThumbnailSource {
    fn request(&self, key: &CacheKey, priority: Priority) -> RequestStatus;

    fn lookup(&self, key: &CacheKey) -> Lookup;

    /// Whether `key` is held as ready, without refreshing its recency.
    fn is_ready(&self, key: &CacheKey) -> bool;

    /// Drop interest in `key`. Unclaimed work is cancelled; in-flight work
    /// runs to completion.
    fn deprioritize(&self, key: &CacheKey) -> bool;

    /// Best bitmap to show for `key` right now, possibly at another size.
    fn best_available(&self, key: &CacheKey) -> Option<Thumbnail>;
}

pub struct ThumbnailManager {
    index: Arc<CacheIndex>,
    disk: DiskStore,
    pool: GenerationPool,
    completions: Receiver<Completion>,
    startup_notice: Option<String>,
}

impl ThumbnailManager {
    /// Build the manager with the `image`-crate codec.
    pub fn new(config: &ThumbnailConfig) -> Self {
        let codec = ThumbnailGenerator::with_decode_limit(config.max_decode_pixels);
        Self::with_codec(config, Arc::new(codec))
    }

    pub fn with_codec(config: &ThumbnailConfig, codec: Arc<dyn ThumbnailCodec>) -> Self {
        let (disk, startup_notice) = Self::open_disk_store(config);
        let index = Arc::new(CacheIndex::new(config.max_memory_bytes()));
        let (tx, rx) = flume::unbounded();
        let pool = GenerationPool::new(config.workers, Arc::clone(&index), disk.clone(), codec, tx);

        info!(
            workers = pool.worker_count(),
            disk_cache = disk.is_enabled(),
            max_memory_bytes = index.max_memory(),
            "Thumbnail manager ready"
        );

        Self {
            index,
            disk,
            pool,
            completions: rx,
            startup_notice,
        }
    }

    /// An unusable disk tier is not fatal: fall back to memory-only caching
    /// and remember one notice for the interface to show.
    fn open_disk_store(config: &ThumbnailConfig) -> (DiskStore, Option<String>) {
        if !config.disk_cache {
            return (DiskStore::disabled(), None);
        }
        let opened = match &config.cache_dir {
            Some(dir) => DiskStore::open(dir),
            None => DiskStore::default_cache_dir().and_then(|dir| DiskStore::open(&dir)),
        };
        match opened {
            Ok(store) => (store, None),
            Err(e) => {
                error!(error = %e, "Thumbnail disk cache unavailable, using memory only");
                let notice = format!("Thumbnail disk cache disabled: {e}");
                (DiskStore::disabled(), Some(notice))
            }
        }
    }

    /// Resolve `key` without blocking.
    pub fn request(&self, key: &CacheKey, priority: Priority) -> RequestStatus {
        match self.index.lookup(key) {
            Lookup::Ready(thumbnail) => RequestStatus::Ready(thumbnail),
            Lookup::Failed(e) => RequestStatus::Failed(e),
            Lookup::Pending => {
                self.pool.reprioritize(key, priority);
                RequestStatus::Pending
            }
            Lookup::Miss => {
                if self.index.insert_pending(key) {
                    self.pool
                        .submit(GenerationRequest::new(key.clone(), priority));
                }
                RequestStatus::Pending
            }
        }
    }

    /// Stat `path` and request its thumbnail at `size_class`.
    pub fn request_path(
        &self,
        path: &Path,
        size_class: SizeClass,
        priority: Priority,
    ) -> std::io::Result<(CacheKey, RequestStatus)> {
        let key = CacheKey::for_file(path, size_class)?;
        let status = self.request(&key, priority);
        Ok((key, status))
    }

    /// Subscribe to `key`. A caller arriving while it is pending attaches to
    /// the generation already in flight.
    pub fn fetch(&self, key: &CacheKey, priority: Priority) -> Ticket {
        match self.index.subscribe(key) {
            Subscription::Ready(thumbnail) => Ticket::Ready(thumbnail),
            Subscription::Failed(e) => Ticket::Failed(e),
            Subscription::Waiting { receiver, dispatch } => {
                if dispatch {
                    self.pool
                        .submit(GenerationRequest::new(key.clone(), priority));
                } else {
                    self.pool.reprioritize(key, priority);
                }
                Ticket::Waiting(receiver)
            }
        }
    }

    pub fn lookup(&self, key: &CacheKey) -> Lookup {
        self.index.lookup(key)
    }

    pub fn is_ready(&self, key: &CacheKey) -> bool {
        self.index.is_ready(key)
    }

    /// Ready thumbnail for `key`, else the same file at the nearest other size.
    pub fn best_available(&self, key: &CacheKey) -> Option<Thumbnail> {
        let mut sizes = ZOOM_LEVELS.to_vec();
        sizes.sort_by_key(|s| s.pixels().abs_diff(key.size_class().pixels()));
        sizes.into_iter().find_map(|size| {
            match self.index.lookup(&key.with_size_class(size)) {
                Lookup::Ready(thumbnail) => Some(thumbnail),
                _ => None,
            }
        })
    }

    /// Cancel `key` if no worker has claimed it yet.
    pub fn cancel(&self, key: &CacheKey) -> bool {
        if self.pool.cancel(key) {
            self.index.cancel(key);
            true
        } else {
            false
        }
    }

    /// Drain finished generations (non-blocking).
    pub fn poll_completions(&self) -> Vec<Completion> {
        self.completions.try_iter().collect()
    }

    /// Wait up to `timeout` for the next finished generation.
    pub fn wait_completion(&self, timeout: Duration) -> Option<Completion> {
        self.completions.recv_timeout(timeout).ok()
    }

    /// Forget thumbnails of files missing from the latest directory listing.
    pub fn evict_stale(&self, valid_paths: &HashSet<PathBuf>) -> usize {
        self.index.evict_stale(valid_paths)
    }

    /// Drop every cached thumbnail of `path`, memory and disk, so the next
    /// request regenerates from source.
    pub fn invalidate_path(&self, path: &Path) {
        let removed = self.pool.purge(|| {
            let removed = self.index.remove_path(path);
            self.disk.remove_path(path);
            removed
        });
        debug!(?path, removed, "Invalidated thumbnails");
    }

    /// Purge the index, queued work and (if enabled) the disk store.
    /// Work already claimed by a worker still finishes, but its result is
    /// neither stored nor written to disk.
    pub fn clear(&self) -> std::io::Result<()> {
        self.pool.purge(|| {
            let cancelled = self.pool.cancel_all();
            let dropped = self.index.clear();
            self.disk.clear()?;
            info!(cancelled = cancelled.len(), dropped, "Cleared thumbnail cache");
            Ok(())
        })
    }

    /// Startup problem the interface should show once, if any.
    pub fn startup_notice(&self) -> Option<&str> {
        self.startup_notice.as_deref()
    }

    pub fn disk_enabled(&self) -> bool {
        self.disk.is_enabled()
    }

    pub fn memory_usage(&self) -> usize {
        self.index.memory_usage()
    }

    pub fn is_busy(&self) -> bool {
        self.pool.is_busy()
    }
}

impl ThumbnailSource for ThumbnailManager {
    fn request(&self, key: &CacheKey, priority: Priority) -> RequestStatus {
        ThumbnailManager::request(self, key, priority)
    }

    fn lookup(&self, key: &CacheKey) -> Lookup {
        ThumbnailManager::lookup(self, key)
    }

    fn is_ready(&self, key: &CacheKey) -> bool {
        ThumbnailManager::is_ready(self, key)
    }

    fn deprioritize(&self, key: &CacheKey) -> bool {
        self.cancel(key)
    }

    fn best_available(&self, key: &CacheKey) -> Option<Thumbnail> {
        ThumbnailManager::best_available(self, key)
    }
}
