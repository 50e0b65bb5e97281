//! # framelog-store
//!
//! Durable, append-only log files for framelog.
//!
//! This crate provides:
//! - The log record model and its canonical payload encoding
//! - Length-prefixed frames whose digests chain each record to its predecessor
//! - File sessions that append frames and decide when to rotate
//! - Readers that verify frames and report the first corrupt position
//! - Recovery from partial writes at the tail of a file

pub mod error;
pub mod frame;
pub mod reader;
pub mod record;
pub mod recovery;
pub mod session;

pub use error::StoreError;
pub use frame::{ChainLink, DecodedFrame, Digest, FrameCodec, SerializedFrame};
pub use reader::{verify_file, FrameReader, VerifiedFrame, VerifyReport};
pub use record::{FieldValue, Level, LogRecord, Timestamp};
pub use recovery::{repair_dir, verify_dir, RecoveryResult, RecoveryScanner};
pub use session::{
    AppendOutcome, FileNaming, FileScanner, FileSession, RotationPolicy, RotationReason,
    SessionMark,
};

/// Size of the big-endian length prefix in front of every frame.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Maximum frame body size (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Default maximum file size before rotation (10 MiB).
pub const DEFAULT_MAX_FILE_BYTES: u64 = 10 * 1024 * 1024;
