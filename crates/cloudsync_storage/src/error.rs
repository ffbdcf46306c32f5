//! Error types for storage operations.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Attempted to read beyond the end of storage.
    #[error("read beyond end of storage: offset {offset}, len {len}, size {size}")]
    ReadPastEnd {
        /// The requested read offset.
        offset: u64,
        /// The requested read length.
        len: usize,
        /// The current storage size.
        size: u64,
    },

    /// An append would grow the store past its configured capacity.
    #[error("storage capacity exceeded: {requested} bytes requested, {available} available")]
    CapacityExceeded {
        /// Bytes the append needed.
        requested: u64,
        /// Bytes left before the capacity is reached.
        available: u64,
    },

    /// A complete frame failed validation.
    #[error("storage corrupted at offset {offset}: {reason}")]
    Corrupted {
        /// Offset of the offending frame.
        offset: u64,
        /// What failed to validate.
        reason: String,
    },

    /// A frame payload is larger than the 4-byte length field allows.
    #[error("frame payload too large: {0} bytes")]
    PayloadTooLarge(usize),
}

impl StorageError {
    /// Returns true if this error means the stored bytes cannot be trusted.
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::Corrupted { .. })
    }
}
