//! Failure taxonomy for thumbnail generation.

use std::path::PathBuf;

use thiserror::Error;

/// Errors produced by the bitmap codec.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    /// Format is not decodable. Permanent; never retried.
    #[error("unsupported image format: {0}")]
    Unsupported(String),
    /// Truncated or invalid image data.
    #[error("corrupt image data: {0}")]
    Corrupt(String),
    /// File vanished or could not be read.
    #[error("failed to read image: {0}")]
    Io(String),
    /// Ran out of memory while decoding. Worth one retry after the memory
    /// tier has been shrunk.
    #[error("out of memory while decoding: {0}")]
    ResourceExhausted(String),
    /// Source is larger than the configured decode ceiling. Permanent for
    /// this file version.
    #[error("image exceeds decode limit: {0}")]
    TooLarge(String),
}

impl CodecError {
    pub(crate) fn from_io(err: &std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof | std::io::ErrorKind::InvalidData => {
                Self::Corrupt(err.to_string())
            }
            std::io::ErrorKind::OutOfMemory => Self::ResourceExhausted(err.to_string()),
            _ => Self::Io(err.to_string()),
        }
    }
}

impl From<image::ImageError> for CodecError {
    fn from(err: image::ImageError) -> Self {
        use image::ImageError;
        match err {
            ImageError::Unsupported(e) => Self::Unsupported(e.to_string()),
            ImageError::Limits(e) => Self::ResourceExhausted(e.to_string()),
            ImageError::IoError(e) => Self::from_io(&e),
            ImageError::Decoding(e) => Self::Corrupt(e.to_string()),
            ImageError::Parameter(e) => Self::Corrupt(e.to_string()),
            ImageError::Encoding(e) => Self::Corrupt(e.to_string()),
        }
    }
}

/// Why a thumbnail entry ended up `Failed`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ThumbError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// The pending entry was dropped (cleared, cancelled) before it resolved.
    #[error("thumbnail request was cancelled")]
    Cancelled,
    /// A worker panicked while handling the request.
    #[error("thumbnail worker failed: {0}")]
    Internal(String),
}

impl ThumbError {
    /// Whether a later request for the same key may succeed.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::Codec(CodecError::Unsupported(_) | CodecError::TooLarge(_))
        )
    }
}

/// Startup failures of the disk store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("thumbnail cache directory {path:?} is not writable: {source}")]
    Unwritable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no cache directory could be determined for this platform")]
    NoCacheDir,
}
