//! Stream recovery utilities.
//!
//! Handles recovery from:
//! - Partial writes (incomplete frames at the end of a file)
//! - Corrupted frames (digest or chain mismatches)

use crate::error::StoreError;
use crate::frame::FrameCodec;
use crate::reader::verify_file;
use crate::session::{FileNaming, FileScanner};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

/// Result of a recovery scan.
#[derive(Debug, Default)]
pub struct RecoveryResult {
    /// Number of files scanned.
    pub files_scanned: u64,
    /// Number of valid frames found.
    pub valid_records: u64,
    /// Bytes after the last valid frame of each file.
    pub bytes_truncated: u64,
    /// Files with invalid bytes, and the first problem found in each.
    pub files_recovered: Vec<(u64, String)>,
    /// Files that could not be read.
    pub files_with_errors: Vec<(u64, String)>,
    /// Highest sequence number found.
    pub max_sequence: Option<u64>,
}

impl RecoveryResult {
    pub fn is_clean(&self) -> bool {
        self.bytes_truncated == 0 && self.files_with_errors.is_empty()
    }
}

/// Stream recovery scanner.
pub struct RecoveryScanner {
    dir: PathBuf,
    naming: FileNaming,
    codec: FrameCodec,
}

impl RecoveryScanner {
    pub fn new(dir: impl AsRef<Path>, naming: FileNaming, codec: FrameCodec) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            naming,
            codec,
        }
    }

    /// Scans and optionally repairs every file of the stream.
    pub fn scan(&self, repair: bool) -> Result<RecoveryResult, StoreError> {
        let indices = FileScanner::list(&self.dir, &self.naming)?;
        let mut result = RecoveryResult::default();

        for index in indices {
            result.files_scanned += 1;
            match self.scan_file(index, repair) {
                Ok(scan) => {
                    result.valid_records += scan.frames;
                    result.bytes_truncated += scan.invalid_bytes;
                    if let Some(seq) = scan.last_sequence {
                        result.max_sequence = Some(result.max_sequence.map_or(seq, |m| m.max(seq)));
                    }
                    if let Some(problem) = scan.problem {
                        result.files_recovered.push((index, problem));
                    }
                }
                Err(e) => {
                    result.files_with_errors.push((index, e.to_string()));
                }
            }
        }

        Ok(result)
    }

    fn scan_file(&self, index: u64, repair: bool) -> Result<FileScan, StoreError> {
        let path = self.naming.path(&self.dir, index);
        let report = verify_file(&path, &self.codec)?;
        let invalid_bytes = report.invalid_bytes();

        if repair && invalid_bytes > 0 {
            let file = OpenOptions::new().write(true).open(&path)?;
            file.set_len(report.last_valid_offset)?;
            file.sync_all()?;
            tracing::warn!(
                "Truncated {} at offset {} (removed {} bytes)",
                path.display(),
                report.last_valid_offset,
                invalid_bytes
            );
        }

        Ok(FileScan {
            frames: report.frames,
            invalid_bytes,
            last_sequence: report.last_sequence,
            problem: report.failure.map(|e| e.to_string()),
        })
    }
}

struct FileScan {
    frames: u64,
    invalid_bytes: u64,
    last_sequence: Option<u64>,
    problem: Option<String>,
}

/// Verifies a stream without modifying anything.
pub fn verify_dir(
    dir: impl AsRef<Path>,
    naming: FileNaming,
    codec: FrameCodec,
) -> Result<RecoveryResult, StoreError> {
    RecoveryScanner::new(dir, naming, codec).scan(false)
}

/// Repairs a stream by truncating each file after its last valid frame.
pub fn repair_dir(
    dir: impl AsRef<Path>,
    naming: FileNaming,
    codec: FrameCodec,
) -> Result<RecoveryResult, StoreError> {
    RecoveryScanner::new(dir, naming, codec).scan(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Level, LogRecord, Timestamp};
    use crate::session::{FileSession, RotationPolicy};
    use framelog_codec::Sha256Digest;
    use std::io::Write;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn codec() -> FrameCodec {
        FrameCodec::with_digest(Arc::new(Sha256Digest))
    }

    fn write_file(dir: &Path, index: u64, sequences: std::ops::RangeInclusive<u64>) -> PathBuf {
        let codec = codec();
        let mut session = FileSession::create(
            dir,
            &FileNaming::default(),
            index,
            &codec,
            RotationPolicy::default(),
        )
        .unwrap();
        for seq in sequences {
            let record = LogRecord::new(seq, Timestamp::now(), Level::Warn, format!("{{\"seq\":{}}}", seq));
            let frame = codec.encode(&record, session.last_digest()).unwrap();
            session.append(&frame).unwrap();
        }
        session.close();
        session.path().to_path_buf()
    }

    #[test]
    fn test_recovery_clean_stream() {
        let dir = TempDir::new().unwrap();
        write_file(dir.path(), 1, 1..=3);
        write_file(dir.path(), 2, 4..=5);

        let result = verify_dir(dir.path(), FileNaming::default(), codec()).unwrap();
        assert!(result.is_clean());
        assert_eq!(result.files_scanned, 2);
        assert_eq!(result.valid_records, 5);
        assert_eq!(result.bytes_truncated, 0);
        assert_eq!(result.max_sequence, Some(5));
    }

    #[test]
    fn test_recovery_partial_write() {
        let dir = TempDir::new().unwrap();
        write_file(dir.path(), 1, 1..=2);
        let path = write_file(dir.path(), 2, 3..=5);

        // Append garbage to simulate a partial write
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[0x00, 0x00, 0x01, 0x00, 0xab]).unwrap();
        drop(file);

        // Verify detects the issue
        let result = verify_dir(dir.path(), FileNaming::default(), codec()).unwrap();
        assert_eq!(result.valid_records, 5);
        assert_eq!(result.bytes_truncated, 5);
        assert_eq!(result.files_recovered.len(), 1);
        assert_eq!(result.files_recovered[0].0, 2);

        // Repair fixes it
        let result = repair_dir(dir.path(), FileNaming::default(), codec()).unwrap();
        assert_eq!(result.valid_records, 5);

        // Verify again - should be clean
        let result = verify_dir(dir.path(), FileNaming::default(), codec()).unwrap();
        assert!(result.is_clean());
        assert_eq!(result.bytes_truncated, 0);
    }

    #[test]
    fn test_recovery_ignores_other_streams() {
        let dir = TempDir::new().unwrap();
        write_file(dir.path(), 1, 1..=2);
        std::fs::write(dir.path().join("framelog.0000000000000002.txt"), b"junk").unwrap();

        let result = verify_dir(dir.path(), FileNaming::default(), codec()).unwrap();
        assert!(result.is_clean());
        assert_eq!(result.files_scanned, 1);
    }
}
