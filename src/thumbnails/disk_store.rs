//! Content-addressed on-disk thumbnail tier.
//!
//! Layout: `<root>/v<LAYOUT_VERSION>/<path digest>/<key digest>.thumb`.
//! Every blob carries a magic, a format version, the key digest and a trailing
//! xxh3 checksum, so blobs from other versions or torn writes are detected and
//! discarded instead of rendered. Frames are stored as lossless PNG so a disk
//! hit is pixel-identical to a fresh decode.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use directories::ProjectDirs;
use image::codecs::png::PngEncoder;
use image::{ExtendedColorType, ImageEncoder, ImageFormat};
use tracing::{debug, trace, warn};
use xxhash_rust::xxh3::xxh3_64;

use super::error::StoreError;
use super::generator::{Bitmap, Frame, Thumbnail};
use super::key::{path_digest, CacheKey};

/// Bump when the blob format or directory layout changes.
const LAYOUT_VERSION: u16 = 1;

const MAGIC: &[u8; 4] = b"GTHB";

const BLOB_EXTENSION: &str = "thumb";

/// Counter for unique temp file names within this process.
static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Optional persistent tier. When disabled every `get` misses and every `put`
/// is a no-op.
#[derive(Debug, Clone)]
pub struct DiskStore {
    /// Versioned root, or `None` when the tier is off.
    root: Option<PathBuf>,
}

impl DiskStore {
    /// A store that never hits and never writes.
    pub fn disabled() -> Self {
        Self { root: None }
    }

    /// Open (creating if needed) a store under `cache_dir` and verify it is writable.
    pub fn open(cache_dir: &Path) -> Result<Self, StoreError> {
        let root = cache_dir.join(format!("v{LAYOUT_VERSION}"));
        let unwritable = |source| StoreError::Unwritable {
            path: root.clone(),
            source,
        };

        std::fs::create_dir_all(&root).map_err(unwritable)?;
        let probe = root.join(".write-probe");
        std::fs::write(&probe, b"ok").map_err(unwritable)?;
        let _ = std::fs::remove_file(&probe);

        debug!(?root, "Opened thumbnail disk store");
        Ok(Self { root: Some(root) })
    }

    /// Get the default cache directory path.
    pub fn default_cache_dir() -> Result<PathBuf, StoreError> {
        let proj_dirs = ProjectDirs::from("", "", "gridthumb").ok_or(StoreError::NoCacheDir)?;
        Ok(proj_dirs.cache_dir().join("thumbs"))
    }

    pub fn is_enabled(&self) -> bool {
        self.root.is_some()
    }

    /// Blob location for `key`, if the tier is enabled.
    pub fn blob_path(&self, key: &CacheKey) -> Option<PathBuf> {
        self.root.as_ref().map(|root| {
            root.join(format!("{:016x}", key.path_digest()))
                .join(key.disk_filename())
        })
    }

    /// Load the thumbnail stored for `key`. Corrupt or incompatible blobs are
    /// deleted and reported as a miss.
    pub fn get(&self, key: &CacheKey) -> Option<Thumbnail> {
        let blob_path = self.blob_path(key)?;
        let bytes = match std::fs::read(&blob_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(?blob_path, error = ?e, "Failed to read thumbnail blob");
                return None;
            }
        };

        match decode_blob(&bytes, key.digest()) {
            Ok(thumbnail) => {
                trace!(%key, "Disk cache hit");
                Some(thumbnail)
            }
            Err(reason) => {
                warn!(?blob_path, reason, "Discarding unusable thumbnail blob");
                let _ = std::fs::remove_file(&blob_path);
                None
            }
        }
    }

    /// Persist `thumbnail` for `key`. Writes go through a temp file and a
    /// rename, so concurrent writers of the same key leave one complete blob.
    pub fn put(&self, key: &CacheKey, thumbnail: &Thumbnail) {
        let Some(blob_path) = self.blob_path(key) else {
            return;
        };
        if let Err(e) = self.write_blob(&blob_path, key, thumbnail) {
            warn!(?blob_path, error = ?e, "Failed to store thumbnail blob");
        }
    }

    fn write_blob(&self, blob_path: &Path, key: &CacheKey, thumbnail: &Thumbnail) -> anyhow::Result<()> {
        let bytes = encode_blob(thumbnail, key.digest())?;
        let dir = blob_path
            .parent()
            .ok_or_else(|| anyhow::anyhow!("blob path has no parent"))?;
        std::fs::create_dir_all(dir)?;

        let tmp = dir.join(format!(
            ".{}.{}.{}.tmp",
            key.disk_filename(),
            std::process::id(),
            TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        std::fs::write(&tmp, &bytes)?;
        if let Err(e) = std::fs::rename(&tmp, blob_path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }
        trace!(%key, bytes = bytes.len(), "Stored thumbnail blob");
        Ok(())
    }

    /// Remove every blob of `path`, across all versions and size classes.
    pub fn remove_path(&self, path: &Path) {
        let Some(root) = &self.root else {
            return;
        };
        let dir = root.join(format!("{:016x}", path_digest(path)));
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => debug!(?path, "Removed stored thumbnails"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(?dir, error = ?e, "Failed to remove stored thumbnails"),
        }
    }

    /// Delete every stored blob.
    pub fn clear(&self) -> std::io::Result<()> {
        let Some(root) = &self.root else {
            return Ok(());
        };
        for entry in std::fs::read_dir(root)? {
            let path = entry?.path();
            if path.is_dir() {
                std::fs::remove_dir_all(&path)?;
            } else if path.extension().is_some_and(|e| e == BLOB_EXTENSION) {
                std::fs::remove_file(&path)?;
            }
        }
        debug!(?root, "Cleared disk cache");
        Ok(())
    }
}

fn encode_blob(thumbnail: &Thumbnail, digest: u64) -> image::ImageResult<Vec<u8>> {
    let mut out = Vec::with_capacity(thumbnail.memory_bytes() / 2 + 64);
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&LAYOUT_VERSION.to_le_bytes());
    out.extend_from_slice(&digest.to_le_bytes());
    out.extend_from_slice(&(thumbnail.frames().len() as u32).to_le_bytes());

    for frame in thumbnail.frames().iter() {
        let bitmap = &frame.bitmap;
        let mut png = Vec::new();
        PngEncoder::new(&mut png).write_image(
            bitmap.pixels(),
            bitmap.width(),
            bitmap.height(),
            ExtendedColorType::Rgba8,
        )?;

        out.extend_from_slice(&bitmap.width().to_le_bytes());
        out.extend_from_slice(&bitmap.height().to_le_bytes());
        out.extend_from_slice(&(frame.duration.as_millis() as u32).to_le_bytes());
        out.extend_from_slice(&(png.len() as u32).to_le_bytes());
        out.extend_from_slice(&png);
    }

    let checksum = xxh3_64(&out);
    out.extend_from_slice(&checksum.to_le_bytes());
    Ok(out)
}

/// Little-endian field reader over a blob body.
struct BlobReader<'a> {
    bytes: &'a [u8],
}

impl<'a> BlobReader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], &'static str> {
        if self.bytes.len() < n {
            return Err("truncated blob");
        }
        let (head, tail) = self.bytes.split_at(n);
        self.bytes = tail;
        Ok(head)
    }

    fn u16(&mut self) -> Result<u16, &'static str> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().map_err(|_| "bad u16")?))
    }

    fn u32(&mut self) -> Result<u32, &'static str> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().map_err(|_| "bad u32")?))
    }

    fn u64(&mut self) -> Result<u64, &'static str> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().map_err(|_| "bad u64")?))
    }
}

fn decode_blob(bytes: &[u8], expected_digest: u64) -> Result<Thumbnail, &'static str> {
    if bytes.len() < 8 {
        return Err("truncated blob");
    }
    let (body, checksum) = bytes.split_at(bytes.len() - 8);
    let checksum = u64::from_le_bytes(checksum.try_into().map_err(|_| "bad checksum")?);
    if xxh3_64(body) != checksum {
        return Err("checksum mismatch");
    }

    let mut reader = BlobReader { bytes: body };
    if reader.take(MAGIC.len())? != MAGIC {
        return Err("bad magic");
    }
    if reader.u16()? != LAYOUT_VERSION {
        return Err("incompatible layout version");
    }
    if reader.u64()? != expected_digest {
        return Err("key digest mismatch");
    }

    let frame_count = reader.u32()?;
    let mut frames = Vec::with_capacity(frame_count.min(1024) as usize);
    for _ in 0..frame_count {
        let width = reader.u32()?;
        let height = reader.u32()?;
        let duration = Duration::from_millis(reader.u32()? as u64);
        let png_len = reader.u32()? as usize;
        let png = reader.take(png_len)?;

        let img = image::load_from_memory_with_format(png, ImageFormat::Png)
            .map_err(|_| "undecodable frame")?
            .into_rgba8();
        if img.dimensions() != (width, height) {
            return Err("frame size mismatch");
        }
        frames.push(Frame {
            bitmap: Bitmap::from_rgba(img),
            duration,
        });
    }
    if !reader.bytes.is_empty() {
        return Err("trailing data");
    }

    Thumbnail::from_frames(frames).ok_or("blob has no frames")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thumbnails::key::{Fingerprint, SizeClass};
    use image::{Rgba, RgbaImage};
    use tempfile::tempdir;

    fn sample_key(name: &str) -> CacheKey {
        CacheKey::new(
            format!("/photos/{name}"),
            Fingerprint::new(4096, 1_700_000_000, 7),
            SizeClass::NORMAL,
        )
    }

    fn sample_thumbnail(frames: usize) -> Thumbnail {
        let frames = (0..frames)
            .map(|i| Frame {
                bitmap: Bitmap::from_rgba(RgbaImage::from_fn(12, 9, |x, y| {
                    Rgba([x as u8 * 20, y as u8 * 20, i as u8 * 60, 0xff])
                })),
                duration: Duration::from_millis(100 + 50 * i as u64),
            })
            .collect();
        Thumbnail::from_frames(frames).unwrap()
    }

    #[test]
    fn test_disabled_store_is_inert() {
        let store = DiskStore::disabled();
        let key = sample_key("a.png");
        store.put(&key, &sample_thumbnail(1));
        assert!(!store.is_enabled());
        assert!(store.get(&key).is_none());
        assert!(store.blob_path(&key).is_none());
        assert!(store.clear().is_ok());
    }

    #[test]
    fn test_put_then_get_returns_identical_frames() {
        let dir = tempdir().unwrap();
        let store = DiskStore::open(dir.path()).unwrap();
        let key = sample_key("anim.gif");
        let thumbnail = sample_thumbnail(3);

        assert!(store.get(&key).is_none());
        store.put(&key, &thumbnail);

        let loaded = store.get(&key).unwrap();
        assert_eq!(loaded, thumbnail);
    }

    #[test]
    fn test_layout_is_versioned_and_keyed() {
        let dir = tempdir().unwrap();
        let store = DiskStore::open(dir.path()).unwrap();
        let key = sample_key("a.png");

        let blob = store.blob_path(&key).unwrap();
        assert!(blob.starts_with(dir.path().join(format!("v{LAYOUT_VERSION}"))));
        assert!(blob.ends_with(key.disk_filename()));
        assert_ne!(
            store.blob_path(&key.with_size_class(SizeClass::LARGE)),
            Some(blob)
        );
    }

    #[test]
    fn test_corrupt_blob_is_miss_and_deleted() {
        let dir = tempdir().unwrap();
        let store = DiskStore::open(dir.path()).unwrap();
        let key = sample_key("a.png");
        store.put(&key, &sample_thumbnail(1));

        let blob = store.blob_path(&key).unwrap();
        let mut bytes = std::fs::read(&blob).unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xff;
        std::fs::write(&blob, &bytes).unwrap();

        assert!(store.get(&key).is_none());
        assert!(!blob.exists());
    }

    #[test]
    fn test_blob_for_other_key_is_rejected() {
        let dir = tempdir().unwrap();
        let store = DiskStore::open(dir.path()).unwrap();
        let key = sample_key("a.png");
        store.put(&key, &sample_thumbnail(1));

        let bytes = std::fs::read(store.blob_path(&key).unwrap()).unwrap();
        assert_eq!(decode_blob(&bytes, key.digest() ^ 1), Err("key digest mismatch"));
    }

    #[test]
    fn test_remove_path_and_clear() {
        let dir = tempdir().unwrap();
        let store = DiskStore::open(dir.path()).unwrap();
        let a = sample_key("a.png");
        let b = sample_key("b.png");
        store.put(&a, &sample_thumbnail(1));
        store.put(&a.with_size_class(SizeClass::LARGE), &sample_thumbnail(1));
        store.put(&b, &sample_thumbnail(1));

        store.remove_path(a.path());
        assert!(store.get(&a).is_none());
        assert!(store.get(&a.with_size_class(SizeClass::LARGE)).is_none());
        assert!(store.get(&b).is_some());

        store.clear().unwrap();
        assert!(store.get(&b).is_none());
    }

    #[test]
    fn test_open_fails_on_file_root() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("occupied");
        std::fs::write(&file, b"x").unwrap();

        let err = DiskStore::open(&file).unwrap_err();
        assert!(matches!(err, StoreError::Unwritable { .. }));
    }
}
