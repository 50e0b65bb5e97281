//! Codec error types.

use thiserror::Error;

/// Errors raised when decoding text or bytes.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("invalid hex input: {0}")]
    InvalidHex(String),

    #[error("invalid UTF-8 sequence at byte {valid_up_to}")]
    InvalidUtf8 { valid_up_to: usize },

    #[error("unknown digest algorithm: {0}")]
    UnknownAlgorithm(String),
}
