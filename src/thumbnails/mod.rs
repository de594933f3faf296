//! Thumbnail pipeline for the gridthumb image browser.
//!
//! This module provides:
//! - `ThumbnailGenerator` - Decodes and downscales source images
//! - `CacheIndex` - In-memory entries with LRU eviction and waiter fan-out
//! - `DiskStore` - Persistent thumbnail blobs keyed by content fingerprint
//! - `GenerationPool` - Prioritized worker threads
//! - `ThumbnailManager` - The request API used by the grid

pub mod disk_store;
pub mod error;
pub mod generator;
pub mod index;
pub mod key;
pub mod manager;
pub mod queue;

pub use error::{CodecError, StoreError, ThumbError};
pub use generator::{Bitmap, Frame, Thumbnail, ThumbnailCodec, ThumbnailGenerator};
pub use key::{CacheKey, Fingerprint, SizeClass};
pub use manager::{RequestStatus, Ticket, ThumbnailManager, ThumbnailSource};
pub use queue::Priority;
