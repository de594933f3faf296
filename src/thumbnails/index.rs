//! In-memory thumbnail index.
//!
//! One entry per `CacheKey`, each `Pending`, `Ready` or `Failed`. A pending
//! entry carries the list of waiters subscribed to it, so a second request for
//! a key in flight attaches to the first instead of decoding again. Ready
//! entries are tracked in LRU order and evicted once the memory budget is
//! exceeded; pending entries are never evicted.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use flume::{Receiver, Sender};
use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use super::error::ThumbError;
use super::generator::Thumbnail;
use super::key::{CacheKey, Fingerprint};

/// Terminal result of one generation.
pub type Outcome = Result<Thumbnail, ThumbError>;

/// Snapshot of an index entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Miss,
    Pending,
    Ready(Thumbnail),
    Failed(ThumbError),
}

/// Result of attaching to a key.
#[derive(Debug)]
pub enum Subscription {
    Ready(Thumbnail),
    Failed(ThumbError),
    /// Still generating. `dispatch` is true for exactly one subscriber per
    /// pending period: the one that must hand the key to the worker pool.
    Waiting {
        receiver: Receiver<Outcome>,
        dispatch: bool,
    },
}

enum EntryState {
    Pending { waiters: Vec<Sender<Outcome>> },
    Ready(Thumbnail),
    Failed(ThumbError),
}

struct IndexInner {
    entries: HashMap<CacheKey, EntryState>,
    /// Ready entries only, least recently accessed first; value = bytes.
    recency: LruCache<CacheKey, usize>,
    /// Most recently requested fingerprint per path.
    latest: HashMap<PathBuf, Fingerprint>,
    memory_bytes: usize,
}

impl IndexInner {
    fn claim(&mut self, key: &CacheKey) -> bool {
        if self.entries.contains_key(key) {
            return false;
        }
        self.entries
            .insert(key.clone(), EntryState::Pending { waiters: Vec::new() });
        self.latest
            .insert(key.path().to_path_buf(), key.fingerprint());
        true
    }

    fn forget(&mut self, key: &CacheKey) -> Option<EntryState> {
        let state = self.entries.remove(key)?;
        if let Some(bytes) = self.recency.pop(key) {
            self.memory_bytes = self.memory_bytes.saturating_sub(bytes);
        }
        Some(state)
    }

    /// Evict least-recently-accessed ready entries until usage is at most
    /// `limit`. The most recent entry always survives.
    fn evict_to(&mut self, limit: usize) -> usize {
        let mut evicted = 0;
        while self.memory_bytes > limit && self.recency.len() > 1 {
            let Some((key, bytes)) = self.recency.pop_lru() else {
                break;
            };
            self.entries.remove(&key);
            self.memory_bytes = self.memory_bytes.saturating_sub(bytes);
            evicted += 1;
            trace!(%key, bytes, current_bytes = self.memory_bytes, "Evicted thumbnail from memory");
        }
        evicted
    }
}

/// Thread-safe index of thumbnails; a single mutex guards every mutation.
pub struct CacheIndex {
    inner: Mutex<IndexInner>,
    max_memory_bytes: usize,
}

impl CacheIndex {
    pub fn new(max_memory_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(IndexInner {
                entries: HashMap::new(),
                recency: LruCache::unbounded(),
                latest: HashMap::new(),
                memory_bytes: 0,
            }),
            max_memory_bytes,
        }
    }

    /// Current state of `key`. A ready hit refreshes its recency.
    pub fn lookup(&self, key: &CacheKey) -> Lookup {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        match inner.entries.get(key) {
            None => Lookup::Miss,
            Some(EntryState::Pending { .. }) => Lookup::Pending,
            Some(EntryState::Failed(e)) => Lookup::Failed(e.clone()),
            Some(EntryState::Ready(thumbnail)) => {
                let thumbnail = thumbnail.clone();
                inner.recency.promote(key);
                Lookup::Ready(thumbnail)
            }
        }
    }

    /// Move `key` from Miss to Pending. Returns true only for the caller that
    /// performed the transition, which then owns dispatching the generation.
    pub fn insert_pending(&self, key: &CacheKey) -> bool {
        self.inner.lock().claim(key)
    }

    /// Attach to `key`, creating the pending entry if it does not exist yet.
    pub fn subscribe(&self, key: &CacheKey) -> Subscription {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let dispatch = inner.claim(key);
        match inner.entries.get_mut(key) {
            Some(EntryState::Pending { waiters }) => {
                let (tx, rx) = flume::bounded(1);
                waiters.push(tx);
                Subscription::Waiting {
                    receiver: rx,
                    dispatch,
                }
            }
            Some(EntryState::Ready(thumbnail)) => {
                let thumbnail = thumbnail.clone();
                inner.recency.promote(key);
                Subscription::Ready(thumbnail)
            }
            Some(EntryState::Failed(e)) => Subscription::Failed(e.clone()),
            // claim() inserted it above
            None => Subscription::Failed(ThumbError::Cancelled),
        }
    }

    /// Resolve a pending entry. Every waiter receives the outcome. The index
    /// keeps it only if the entry is still pending and no newer version of the
    /// same file has been requested since; returns whether it was kept.
    pub fn complete(&self, key: &CacheKey, outcome: Outcome) -> bool {
        let (waiters, stored) = {
            let mut inner = self.inner.lock();

            let waiters = match inner.entries.get_mut(key) {
                Some(EntryState::Pending { waiters }) => std::mem::take(waiters),
                Some(_) => {
                    warn!(%key, "Ignoring result for already resolved thumbnail");
                    return false;
                }
                None => {
                    debug!(%key, "Discarding result for evicted thumbnail");
                    return false;
                }
            };

            let superseded = inner
                .latest
                .get(key.path())
                .is_some_and(|fp| *fp != key.fingerprint());

            if superseded {
                debug!(%key, "Discarding result superseded by newer file version");
                inner.entries.remove(key);
                (waiters, false)
            } else {
                match &outcome {
                    Ok(thumbnail) => {
                        let bytes = thumbnail.memory_bytes();
                        inner
                            .entries
                            .insert(key.clone(), EntryState::Ready(thumbnail.clone()));
                        inner.recency.put(key.clone(), bytes);
                        inner.memory_bytes += bytes;
                        let limit = self.max_memory_bytes;
                        inner.evict_to(limit);
                    }
                    Err(e) => {
                        inner.entries.insert(key.clone(), EntryState::Failed(e.clone()));
                    }
                }
                (waiters, true)
            }
        };

        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
        stored
    }

    /// Drop a pending entry whose request never reached a worker. Waiters see
    /// a disconnected channel.
    pub fn cancel(&self, key: &CacheKey) -> bool {
        let mut inner = self.inner.lock();
        if matches!(inner.entries.get(key), Some(EntryState::Pending { .. })) {
            inner.entries.remove(key);
            true
        } else {
            false
        }
    }

    /// Remove resolved entries whose file is not in the current listing.
    pub fn evict_stale(&self, valid_paths: &HashSet<PathBuf>) -> usize {
        let mut inner = self.inner.lock();
        let stale: Vec<CacheKey> = inner
            .entries
            .iter()
            .filter(|(key, state)| {
                !valid_paths.contains(key.path()) && !matches!(state, EntryState::Pending { .. })
            })
            .map(|(key, _)| key.clone())
            .collect();

        for key in &stale {
            inner.forget(key);
        }
        let still_pending: HashSet<PathBuf> = inner
            .entries
            .keys()
            .map(|k| k.path().to_path_buf())
            .collect();
        inner
            .latest
            .retain(|path, _| valid_paths.contains(path) || still_pending.contains(path));

        if !stale.is_empty() {
            debug!(evicted = stale.len(), "Evicted thumbnails of removed files");
        }
        stale.len()
    }

    /// Remove every entry of `path` (all sizes, all versions), pending ones included.
    pub fn remove_path(&self, path: &Path) -> usize {
        let mut inner = self.inner.lock();
        let keys: Vec<CacheKey> = inner
            .entries
            .keys()
            .filter(|k| k.path() == path)
            .cloned()
            .collect();
        for key in &keys {
            inner.forget(key);
        }
        inner.latest.remove(path);
        keys.len()
    }

    /// Drop everything, pending entries included.
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock();
        let count = inner.entries.len();
        inner.entries.clear();
        inner.recency.clear();
        inner.latest.clear();
        inner.memory_bytes = 0;
        debug!(count, "Cleared thumbnail index");
        count
    }

    /// Whether `key` is ready. Unlike `lookup`, leaves its recency alone.
    pub fn is_ready(&self, key: &CacheKey) -> bool {
        matches!(self.inner.lock().entries.get(key), Some(EntryState::Ready(_)))
    }

    /// Evict ready entries until usage is at most `limit` bytes.
    pub fn shrink_to(&self, limit: usize) -> usize {
        self.inner.lock().evict_to(limit)
    }

    /// Get the current memory usage in bytes.
    pub fn memory_usage(&self) -> usize {
        self.inner.lock().memory_bytes
    }

    /// Get the maximum memory limit in bytes.
    pub fn max_memory(&self) -> usize {
        self.max_memory_bytes
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thumbnails::error::CodecError;
    use crate::thumbnails::generator::Bitmap;
    use crate::thumbnails::key::SizeClass;

    fn key(name: &str, mtime: i64) -> CacheKey {
        CacheKey::new(
            format!("/photos/{name}"),
            Fingerprint::new(100, mtime, 0),
            SizeClass::NORMAL,
        )
    }

    /// Square thumbnail of `side` pixels (4 * side^2 bytes).
    fn thumb(side: u32) -> Thumbnail {
        let pixels = vec![side as u8; (side * side * 4) as usize];
        Thumbnail::still(Bitmap::from_raw(side, side, pixels).unwrap())
    }

    #[test]
    fn test_ready_lookup_is_stable() {
        let index = CacheIndex::new(1 << 20);
        let k = key("a.png", 1);

        assert_eq!(index.lookup(&k), Lookup::Miss);
        assert!(index.insert_pending(&k));
        assert_eq!(index.lookup(&k), Lookup::Pending);

        let t = thumb(8);
        assert!(index.complete(&k, Ok(t.clone())));
        for _ in 0..3 {
            assert_eq!(index.lookup(&k), Lookup::Ready(t.clone()));
        }
    }

    #[test]
    fn test_insert_pending_only_once() {
        let index = CacheIndex::new(1 << 20);
        let k = key("a.png", 1);
        assert!(index.insert_pending(&k));
        assert!(!index.insert_pending(&k));
        index.complete(&k, Ok(thumb(2)));
        assert!(!index.insert_pending(&k));
    }

    #[test]
    fn test_subscribers_share_one_dispatch() {
        let index = CacheIndex::new(1 << 20);
        let k = key("a.png", 1);

        let subs: Vec<_> = (0..5).map(|_| index.subscribe(&k)).collect();
        let dispatchers = subs
            .iter()
            .filter(|s| matches!(s, Subscription::Waiting { dispatch: true, .. }))
            .count();
        assert_eq!(dispatchers, 1);

        let t = thumb(4);
        index.complete(&k, Ok(t.clone()));
        for sub in subs {
            let Subscription::Waiting { receiver, .. } = sub else {
                panic!("expected waiting subscription");
            };
            assert_eq!(receiver.recv().unwrap(), Ok(t.clone()));
        }
        assert!(matches!(index.subscribe(&k), Subscription::Ready(_)));
    }

    #[test]
    fn test_complete_after_eviction_is_ignored() {
        let index = CacheIndex::new(1 << 20);
        let k = key("a.png", 1);
        index.insert_pending(&k);
        index.clear();

        assert!(!index.complete(&k, Ok(thumb(2))));
        assert_eq!(index.lookup(&k), Lookup::Miss);
    }

    #[test]
    fn test_failed_is_terminal() {
        let index = CacheIndex::new(1 << 20);
        let k = key("a.txt", 1);
        index.insert_pending(&k);
        let err = ThumbError::Codec(CodecError::Unsupported("txt".into()));
        assert!(index.complete(&k, Err(err.clone())));
        assert_eq!(index.lookup(&k), Lookup::Failed(err));
        assert!(!index.complete(&k, Ok(thumb(2))));
    }

    #[test]
    fn test_superseded_result_is_not_stored() {
        let index = CacheIndex::new(1 << 20);
        let old = key("a.png", 1);
        let new = key("a.png", 2);
        index.insert_pending(&old);
        index.insert_pending(&new);

        assert!(!index.complete(&old, Ok(thumb(2))));
        assert_eq!(index.lookup(&old), Lookup::Miss);
        assert!(index.complete(&new, Ok(thumb(2))));
    }

    #[test]
    fn test_lru_eviction_respects_budget() {
        // Each 16x16 thumbnail is 1024 bytes; budget fits two.
        let index = CacheIndex::new(2048);
        let (a, b, c) = (key("a.png", 1), key("b.png", 1), key("c.png", 1));
        for k in [&a, &b] {
            index.insert_pending(k);
            index.complete(k, Ok(thumb(16)));
        }
        // Touch `a` so `b` becomes the least recently used.
        assert!(matches!(index.lookup(&a), Lookup::Ready(_)));

        index.insert_pending(&c);
        index.complete(&c, Ok(thumb(16)));

        assert!(matches!(index.lookup(&a), Lookup::Ready(_)));
        assert_eq!(index.lookup(&b), Lookup::Miss);
        assert!(matches!(index.lookup(&c), Lookup::Ready(_)));
        assert_eq!(index.memory_usage(), 2048);
    }

    #[test]
    fn test_pending_survives_memory_pressure() {
        let index = CacheIndex::new(1024);
        let pending = key("slow.png", 1);
        index.insert_pending(&pending);
        for name in ["a.png", "b.png", "c.png"] {
            let k = key(name, 1);
            index.insert_pending(&k);
            index.complete(&k, Ok(thumb(16)));
        }
        assert_eq!(index.lookup(&pending), Lookup::Pending);
        index.shrink_to(0);
        assert_eq!(index.lookup(&pending), Lookup::Pending);
    }

    #[test]
    fn test_evict_stale() {
        let index = CacheIndex::new(1 << 20);
        let keep = key("keep.png", 1);
        let gone = key("gone.png", 1);
        let in_flight = key("moving.png", 1);
        for k in [&keep, &gone] {
            index.insert_pending(k);
            index.complete(k, Ok(thumb(4)));
        }
        index.insert_pending(&in_flight);

        let valid: HashSet<PathBuf> = [keep.path().to_path_buf()].into_iter().collect();
        assert_eq!(index.evict_stale(&valid), 1);
        assert!(matches!(index.lookup(&keep), Lookup::Ready(_)));
        assert_eq!(index.lookup(&gone), Lookup::Miss);
        assert_eq!(index.lookup(&in_flight), Lookup::Pending);
    }

    #[test]
    fn test_cancel_disconnects_waiters() {
        let index = CacheIndex::new(1 << 20);
        let k = key("a.png", 1);
        let Subscription::Waiting { receiver, .. } = index.subscribe(&k) else {
            panic!("expected waiting subscription");
        };
        assert!(index.cancel(&k));
        assert!(receiver.recv().is_err());
        assert_eq!(index.lookup(&k), Lookup::Miss);
    }

    #[test]
    fn test_remove_path_covers_all_sizes() {
        let index = CacheIndex::new(1 << 20);
        let small = key("a.png", 1).with_size_class(SizeClass::SMALL);
        let large = small.with_size_class(SizeClass::LARGE);
        for k in [&small, &large] {
            index.insert_pending(k);
            index.complete(k, Ok(thumb(4)));
        }
        assert_eq!(index.remove_path(small.path()), 2);
        assert!(index.is_empty());
        assert_eq!(index.memory_usage(), 0);
    }
}
