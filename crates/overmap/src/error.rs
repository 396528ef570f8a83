use std::path::PathBuf;

use thiserror::Error;

use crate::chunk::ChunkPos;

pub type Result<T> = std::result::Result<T, MapError>;

/// Error type for map store operations. Every variant is recoverable:
/// corrupt records are treated as absent, out-of-bounds coordinates are
/// the caller's to clamp or drop, and flush I/O failures are retried.
#[derive(Debug, Error)]
pub enum MapError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt chunk record '{path}': {reason}")]
    CorruptChunk { path: PathBuf, reason: String },

    #[error("unusable world manifest '{path}': {reason}")]
    BadManifest { path: PathBuf, reason: String },

    #[error("chunk {pos:?} is outside the configured world bounds")]
    OutOfBounds { pos: ChunkPos },

    #[error("invalid map update: {reason}")]
    InvalidUpdate { reason: String },
}

impl MapError {
    /// Whether this error means "the stored record is unusable" rather
    /// than an environmental failure. Callers recover by treating the
    /// chunk as absent.
    pub fn is_corrupt_record(&self) -> bool {
        matches!(self, MapError::CorruptChunk { .. })
    }
}
