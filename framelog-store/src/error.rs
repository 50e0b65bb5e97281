//! Store error types.

use thiserror::Error;

/// Errors that can occur while encoding, appending or reading frames.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encoding error: {0}")]
    Encoding(String),

    #[error("record too large: {size} bytes (max {max})")]
    RecordTooLarge { size: usize, max: usize },

    #[error("frame length mismatch at offset {offset}: declared {declared} bytes, {available} available")]
    FrameLengthMismatch {
        offset: u64,
        declared: u64,
        available: u64,
    },

    #[error("chain mismatch at offset {offset}: expected previous digest {expected}, found {actual}")]
    ChainMismatch {
        offset: u64,
        expected: String,
        actual: String,
    },

    #[error("digest mismatch at offset {offset}: stored {stored}, computed {computed}")]
    DigestMismatch {
        offset: u64,
        stored: String,
        computed: String,
    },

    #[error("invalid file name: {0}")]
    InvalidFileName(String),

    #[error("file session {0} is closed")]
    SessionClosed(u64),
}

impl StoreError {
    /// Returns whether this error describes on-disk corruption found while reading.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            StoreError::FrameLengthMismatch { .. }
                | StoreError::ChainMismatch { .. }
                | StoreError::DigestMismatch { .. }
        )
    }

    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Io(_))
    }

    /// Byte offset of the corrupt frame, if this is a corruption error.
    pub fn offset(&self) -> Option<u64> {
        match self {
            StoreError::FrameLengthMismatch { offset, .. }
            | StoreError::ChainMismatch { offset, .. }
            | StoreError::DigestMismatch { offset, .. } => Some(*offset),
            _ => None,
        }
    }
}
