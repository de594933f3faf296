//! Cache identity for thumbnails.
//!
//! A key is `(absolute path, fingerprint, size class)`. The fingerprint is
//! derived from file size and mtime so staleness can be detected with a single
//! `stat` instead of reading the file.

use std::fmt;
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use xxhash_rust::xxh3::xxh3_64;

/// Bump when the key derivation changes so old disk blobs stop matching.
const KEY_VERSION: u8 = 1;

/// Discrete zoom levels, smallest first.
pub const ZOOM_LEVELS: [SizeClass; 4] = [
    SizeClass(64),
    SizeClass(128),
    SizeClass(256),
    SizeClass(512),
];

/// Square pixel box a thumbnail must fit into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SizeClass(u32);

impl SizeClass {
    pub const SMALL: SizeClass = ZOOM_LEVELS[0];
    pub const NORMAL: SizeClass = ZOOM_LEVELS[1];
    pub const LARGE: SizeClass = ZOOM_LEVELS[2];
    pub const HUGE: SizeClass = ZOOM_LEVELS[3];

    /// Snap an arbitrary pixel size to the nearest zoom level.
    pub fn nearest(pixels: u32) -> Self {
        ZOOM_LEVELS
            .iter()
            .copied()
            .min_by_key(|level| level.0.abs_diff(pixels))
            .unwrap_or(Self::NORMAL)
    }

    pub fn pixels(self) -> u32 {
        self.0
    }

    /// Position of this class in `ZOOM_LEVELS`.
    pub fn level(self) -> usize {
        ZOOM_LEVELS.iter().position(|l| *l == self).unwrap_or(1)
    }

    /// Next larger class, if any.
    pub fn larger(self) -> Option<Self> {
        ZOOM_LEVELS.get(self.level() + 1).copied()
    }

    /// Next smaller class, if any.
    pub fn smaller(self) -> Option<Self> {
        self.level().checked_sub(1).map(|i| ZOOM_LEVELS[i])
    }
}

impl Default for SizeClass {
    fn default() -> Self {
        Self::NORMAL
    }
}

impl fmt::Display for SizeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}px", self.0)
    }
}

/// Lightweight staleness indicator: file length plus modification time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Fingerprint {
    pub size: u64,
    pub mtime_secs: i64,
    pub mtime_nanos: u32,
}

impl Fingerprint {
    pub fn new(size: u64, mtime_secs: i64, mtime_nanos: u32) -> Self {
        Self {
            size,
            mtime_secs,
            mtime_nanos,
        }
    }

    /// Build a fingerprint from already-fetched metadata.
    pub fn from_metadata(meta: &Metadata) -> Self {
        let (mtime_secs, mtime_nanos) = match meta.modified() {
            Ok(modified) => match modified.duration_since(UNIX_EPOCH) {
                Ok(d) => (d.as_secs() as i64, d.subsec_nanos()),
                // Pre-epoch timestamps still need to be distinct.
                Err(e) => (-(e.duration().as_secs() as i64), e.duration().subsec_nanos()),
            },
            Err(_) => (0, 0),
        };
        Self::new(meta.len(), mtime_secs, mtime_nanos)
    }

    /// Stat `path` and fingerprint it.
    pub fn of(path: &Path) -> std::io::Result<Self> {
        std::fs::metadata(path).map(|meta| Self::from_metadata(&meta))
    }
}

/// Identity of one thumbnail: this file, at this version, at this size.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    path: Arc<Path>,
    fingerprint: Fingerprint,
    size_class: SizeClass,
}

impl CacheKey {
    pub fn new(path: impl Into<PathBuf>, fingerprint: Fingerprint, size_class: SizeClass) -> Self {
        let path: PathBuf = path.into();
        Self {
            path: Arc::from(path.into_boxed_path()),
            fingerprint,
            size_class,
        }
    }

    /// Stat `path` and build the key for its current contents.
    pub fn for_file(path: &Path, size_class: SizeClass) -> std::io::Result<Self> {
        let absolute = std::path::absolute(path)?;
        let fingerprint = Fingerprint::of(&absolute)?;
        Ok(Self::new(absolute, fingerprint, size_class))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    pub fn size_class(&self) -> SizeClass {
        self.size_class
    }

    /// Same file and version at a different size.
    pub fn with_size_class(&self, size_class: SizeClass) -> Self {
        Self {
            path: Arc::clone(&self.path),
            fingerprint: self.fingerprint,
            size_class,
        }
    }

    /// Stable 64-bit digest of every key component.
    pub fn digest(&self) -> u64 {
        let path_bytes = self.path.as_os_str().as_encoded_bytes();
        let mut data = Vec::with_capacity(path_bytes.len() + 29);
        data.push(KEY_VERSION);
        data.extend_from_slice(path_bytes);
        data.extend_from_slice(&self.fingerprint.size.to_le_bytes());
        data.extend_from_slice(&self.fingerprint.mtime_secs.to_le_bytes());
        data.extend_from_slice(&self.fingerprint.mtime_nanos.to_le_bytes());
        data.extend_from_slice(&self.size_class.0.to_le_bytes());
        xxh3_64(&data)
    }

    /// Digest of the path alone; every version and size of a file shares it.
    pub fn path_digest(&self) -> u64 {
        path_digest(&self.path)
    }

    /// Blob file name inside the per-path directory of the disk store.
    pub fn disk_filename(&self) -> String {
        format!("{:016x}.thumb", self.digest())
    }
}

pub(crate) fn path_digest(path: &Path) -> u64 {
    xxh3_64(path.as_os_str().as_encoded_bytes())
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.path.display(), self.size_class)
    }
}
