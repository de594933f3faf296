use std::path::{Path, PathBuf};

use crate::thumbnails::key::{CacheKey, Fingerprint, SizeClass};

/// One image in the current directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaItem {
    pub path: PathBuf,
    pub fingerprint: Fingerprint,
}

impl MediaItem {
    pub fn new(path: PathBuf, fingerprint: Fingerprint) -> Self {
        Self { path, fingerprint }
    }

    /// Stat `path` and build an item for its current version.
    pub fn from_path(path: &Path) -> std::io::Result<Self> {
        let path = std::path::absolute(path)?;
        let fingerprint = Fingerprint::of(&path)?;
        Ok(Self { path, fingerprint })
    }

    /// Cache key of this item's thumbnail at `size_class`.
    pub fn key(&self, size_class: SizeClass) -> CacheKey {
        CacheKey::new(self.path.clone(), self.fingerprint, size_class)
    }

    /// Label shown under the thumbnail: file name without extension.
    pub fn name(&self) -> String {
        self.path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_uses_fingerprint_and_size() {
        let item = MediaItem::new(
            PathBuf::from("/photos/cat.jpg"),
            Fingerprint::new(10, 20, 30),
        );
        let key = item.key(SizeClass::LARGE);
        assert_eq!(key.path(), Path::new("/photos/cat.jpg"));
        assert_eq!(key.fingerprint(), item.fingerprint);
        assert_eq!(key.size_class(), SizeClass::LARGE);
    }

    #[test]
    fn test_name_strips_extension() {
        let item = MediaItem::new(PathBuf::from("/photos/cat.v2.jpg"), Fingerprint::default());
        assert_eq!(item.name(), "cat.v2");
    }
}
