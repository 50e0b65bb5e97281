//! Engine error types.

use crate::config::ConfigError;
use framelog_store::StoreError;
use thiserror::Error;

/// Errors returned by the writer engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("encoding error: {0}")]
    Encoding(String),

    #[error("write failed: {0}")]
    IoWrite(String),

    #[error("queue full")]
    QueueFull,

    #[error("engine closed")]
    EngineClosed,

    #[error("sequence regression: got {got}, last appended {last}")]
    SequenceRegression { last: u64, got: u64 },

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

impl EngineError {
    /// Maps a failure on the append path. Startup failures use [`EngineError::Store`].
    pub(crate) fn from_append(err: StoreError) -> Self {
        match err {
            StoreError::Encoding(msg) => EngineError::Encoding(msg),
            e @ StoreError::RecordTooLarge { .. } => EngineError::Encoding(e.to_string()),
            e => EngineError::IoWrite(e.to_string()),
        }
    }

    /// Returns a stable error code string.
    pub fn error_code(&self) -> &'static str {
        match self {
            EngineError::Encoding(_) => "ENCODING",
            EngineError::IoWrite(_) => "IO_WRITE",
            EngineError::QueueFull => "QUEUE_FULL",
            EngineError::EngineClosed => "ENGINE_CLOSED",
            EngineError::SequenceRegression { .. } => "SEQUENCE_REGRESSION",
            EngineError::Store(_) => "STORE",
            EngineError::Config(_) => "CONFIG",
        }
    }

    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::QueueFull | EngineError::IoWrite(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_error_mapping() {
        let err = EngineError::from_append(StoreError::Encoding("bad field".into()));
        assert!(matches!(err, EngineError::Encoding(ref m) if m == "bad field"));

        let err = EngineError::from_append(StoreError::RecordTooLarge { size: 10, max: 5 });
        assert_eq!(err.error_code(), "ENCODING");

        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        let err = EngineError::from_append(StoreError::Io(io));
        assert!(matches!(err, EngineError::IoWrite(ref m) if m.contains("disk full")));
    }

    #[test]
    fn test_retryable() {
        assert!(EngineError::QueueFull.is_retryable());
        assert!(EngineError::IoWrite("x".into()).is_retryable());
        assert!(!EngineError::EngineClosed.is_retryable());
        assert!(!EngineError::SequenceRegression { last: 2, got: 1 }.is_retryable());
    }
}
