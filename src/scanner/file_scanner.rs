//! Directory scanner for the thumbnail grid.
//!
//! Walks a directory with walkdir, keeps files whose extension the generator
//! can decode and captures each file's fingerprint from the same metadata
//! call. The result is sorted by path so the grid order is stable across
//! rescans.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::task;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::models::MediaItem;
use crate::thumbnails::generator::ThumbnailGenerator;
use crate::thumbnails::key::Fingerprint;

/// Configuration for the file scanner.
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Whether to scan directories recursively.
    pub recursive: bool,
    /// Maximum directory depth (0 = unlimited).
    pub max_depth: usize,
    /// Whether to follow symbolic links.
    pub follow_symlinks: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            recursive: false,
            max_depth: 0,
            follow_symlinks: false,
        }
    }
}

/// Result of a completed scan.
#[derive(Debug, Clone, Default)]
pub struct ScanResult {
    /// Images found, sorted by path.
    pub items: Vec<MediaItem>,
    /// Entries that could not be read.
    pub error_count: usize,
}

impl ScanResult {
    /// Paths of every item, for stale-entry eviction.
    pub fn paths(&self) -> impl Iterator<Item = &PathBuf> {
        self.items.iter().map(|item| &item.path)
    }
}

pub struct FileScanner {
    config: ScanConfig,
}

impl FileScanner {
    pub fn new() -> Self {
        Self {
            config: ScanConfig::default(),
        }
    }

    pub fn with_config(config: ScanConfig) -> Self {
        Self { config }
    }

    /// Scan `dir` on a blocking task.
    pub async fn scan_directory(&self, dir: &Path) -> Result<ScanResult> {
        let dir = dir.to_path_buf();
        let config = self.config.clone();

        task::spawn_blocking(move || Self::scan_directory_sync(&dir, &config))
            .await
            .context("Scan task panicked")?
    }

    /// Synchronous directory scanning implementation.
    pub fn scan_directory_sync(dir: &Path, config: &ScanConfig) -> Result<ScanResult> {
        let root = std::path::absolute(dir)
            .with_context(|| format!("Failed to resolve {}", dir.display()))?;
        if !root.is_dir() {
            anyhow::bail!("{} is not a directory", root.display());
        }
        info!(path = ?root, "Starting scan");

        let mut walker = WalkDir::new(&root).follow_links(config.follow_symlinks);
        if !config.recursive {
            walker = walker.max_depth(1);
        } else if config.max_depth > 0 {
            walker = walker.max_depth(config.max_depth);
        }

        let mut result = ScanResult::default();

        for entry in walker {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!(error = %e, "Failed to read directory entry");
                    result.error_count += 1;
                    continue;
                }
            };
            if entry.file_type().is_dir() {
                continue;
            }

            let path = entry.path();
            if !ThumbnailGenerator::can_generate(path) {
                continue;
            }

            let metadata = match entry.metadata() {
                Ok(m) => m,
                Err(e) => {
                    warn!(?path, error = %e, "Failed to read metadata");
                    result.error_count += 1;
                    continue;
                }
            };

            result.items.push(MediaItem::new(
                path.to_path_buf(),
                Fingerprint::from_metadata(&metadata),
            ));
        }

        // Sort by path for consistent ordering
        result.items.sort_by(|a, b| a.path.cmp(&b.path));

        debug!(
            found = result.items.len(),
            errors = result.error_count,
            "Scan complete"
        );
        Ok(result)
    }
}

impl Default for FileScanner {
    fn default() -> Self {
        Self::new()
    }
}
