//! Startup configuration for the thumbnail subsystem.
//!
//! Values are read once and handed to `ThumbnailManager::new`; nothing here is
//! polled afterwards.

use std::path::PathBuf;

use crate::thumbnails::key::SizeClass;
use crate::thumbnails::queue::MAX_WORKERS;

/// Default memory budget in megabytes.
const DEFAULT_MAX_MEMORY_MB: usize = 192;

/// Minimum memory budget in megabytes.
const MIN_MEMORY_MB: usize = 16;

/// Maximum memory budget in megabytes.
const MAX_MEMORY_MB: usize = 1024;

/// Default padding around each grid cell in pixels.
const DEFAULT_PADDING: u32 = 9;

#[derive(Debug, Clone)]
pub struct ThumbnailConfig {
    /// Whether the on-disk tier is used at all.
    pub disk_cache: bool,
    /// Disk tier root. `None` = XDG cache directory.
    pub cache_dir: Option<PathBuf>,
    /// Number of generation workers.
    pub workers: usize,
    /// In-memory budget for ready thumbnails.
    pub max_memory_mb: usize,
    /// Refuse to decode sources larger than this many pixels.
    pub max_decode_pixels: Option<u64>,
    /// Initial zoom level of the grid.
    pub size_class: SizeClass,
    /// Padding around each grid cell.
    pub padding: u32,
}

impl Default for ThumbnailConfig {
    fn default() -> Self {
        Self {
            disk_cache: true,
            cache_dir: None,
            workers: default_workers(),
            max_memory_mb: DEFAULT_MAX_MEMORY_MB,
            max_decode_pixels: None,
            size_class: SizeClass::default(),
            padding: DEFAULT_PADDING,
        }
    }
}

/// Half the available processing units, at least one.
pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get() / 2)
        .unwrap_or(2)
        .clamp(1, MAX_WORKERS)
}

impl ThumbnailConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn disk_cache(mut self, enabled: bool) -> Self {
        self.disk_cache = enabled;
        self
    }

    pub fn cache_dir(mut self, dir: PathBuf) -> Self {
        self.cache_dir = Some(dir);
        self
    }

    pub fn workers(mut self, count: usize) -> Self {
        self.workers = count;
        self
    }

    pub fn max_memory_mb(mut self, mb: usize) -> Self {
        self.max_memory_mb = mb;
        self
    }

    pub fn max_decode_pixels(mut self, pixels: u64) -> Self {
        self.max_decode_pixels = Some(pixels);
        self
    }

    pub fn size_class(mut self, size_class: SizeClass) -> Self {
        self.size_class = size_class;
        self
    }

    pub fn padding(mut self, padding: u32) -> Self {
        self.padding = padding;
        self
    }

    /// Memory budget in bytes, clamped to the supported range.
    pub fn max_memory_bytes(&self) -> usize {
        self.max_memory_mb.clamp(MIN_MEMORY_MB, MAX_MEMORY_MB) * 1024 * 1024
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ThumbnailConfig::default();
        assert!(config.disk_cache);
        assert!(config.cache_dir.is_none());
        assert!((1..=MAX_WORKERS).contains(&config.workers));
        assert_eq!(config.size_class, SizeClass::NORMAL);
        assert_eq!(config.max_memory_bytes(), 192 * 1024 * 1024);
    }

    #[test]
    fn test_memory_limit_clamping() {
        let config = ThumbnailConfig::new().max_memory_mb(1);
        assert_eq!(config.max_memory_bytes(), MIN_MEMORY_MB * 1024 * 1024);

        let config = ThumbnailConfig::new().max_memory_mb(100_000);
        assert_eq!(config.max_memory_bytes(), MAX_MEMORY_MB * 1024 * 1024);

        let config = ThumbnailConfig::new().max_memory_mb(200);
        assert_eq!(config.max_memory_bytes(), 200 * 1024 * 1024);
    }

    #[test]
    fn test_builder() {
        let config = ThumbnailConfig::new()
            .disk_cache(false)
            .workers(3)
            .padding(2)
            .size_class(SizeClass::LARGE)
            .max_decode_pixels(1_000);
        assert!(!config.disk_cache);
        assert_eq!(config.workers, 3);
        assert_eq!(config.padding, 2);
        assert_eq!(config.size_class, SizeClass::LARGE);
        assert_eq!(config.max_decode_pixels, Some(1_000));
    }
}
