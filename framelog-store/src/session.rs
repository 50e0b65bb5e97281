//! Log file sessions.
//!
//! A stream is a sequence of files sharing one [`FileNaming`]:
//! - Rotation: a new file (next index) once the active one crosses a threshold
//! - Ordering: file names embed the rotation index, so listing-and-sorting
//!   reconstructs the global order
//! - Resume: the latest file can be reopened and its chain continued

use crate::error::StoreError;
use crate::frame::{ChainLink, Digest, FrameCodec, SerializedFrame};
use crate::reader::verify_file;
use crate::record::Timestamp;
use chrono::{DateTime, Utc};
use crate::DEFAULT_MAX_FILE_BYTES;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// File naming scheme: `{name}.{index:016x}.{extension}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileNaming {
    name: String,
    extension: String,
}

impl FileNaming {
    /// Creates a naming scheme. `extension` may be empty.
    pub fn new(name: impl Into<String>, extension: impl Into<String>) -> Result<Self, StoreError> {
        let name = name.into();
        let extension = extension.into();
        validate_name(&name)?;
        validate_extension(&extension)?;
        Ok(Self { name, extension })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    /// File name for the given rotation index.
    pub fn file_name(&self, index: u64) -> String {
        if self.extension.is_empty() {
            format!("{}.{:016x}", self.name, index)
        } else {
            format!("{}.{:016x}.{}", self.name, index, self.extension)
        }
    }

    /// Parses the rotation index from a file name.
    pub fn parse(&self, file_name: &str) -> Option<u64> {
        let rest = file_name.strip_prefix(&self.name)?.strip_prefix('.')?;
        let index = if self.extension.is_empty() {
            rest
        } else {
            rest.strip_suffix(&self.extension)?.strip_suffix('.')?
        };
        if index.len() != 16 {
            return None;
        }
        u64::from_str_radix(index, 16).ok()
    }

    pub fn path(&self, dir: &Path, index: u64) -> PathBuf {
        dir.join(self.file_name(index))
    }
}

impl Default for FileNaming {
    fn default() -> Self {
        Self {
            name: "framelog".to_string(),
            extension: "log".to_string(),
        }
    }
}

fn validate_name(name: &str) -> Result<(), StoreError> {
    let invalid = |reason: &str| Err(StoreError::InvalidFileName(format!("{:?}: {}", name, reason)));
    if name.is_empty() {
        return invalid("name cannot be empty");
    }
    if name.chars().count() > 64 {
        return invalid("name cannot exceed 64 characters");
    }
    if name.ends_with('.') {
        return invalid("name cannot end with '.'");
    }
    if let Some(c) = name
        .chars()
        .find(|c| c.is_whitespace() || matches!(c, '/' | '\\' | '\0'))
    {
        return invalid(&format!("name cannot contain {:?}", c));
    }
    Ok(())
}

fn validate_extension(extension: &str) -> Result<(), StoreError> {
    let invalid =
        |reason: &str| Err(StoreError::InvalidFileName(format!("{:?}: {}", extension, reason)));
    if extension.chars().count() > 8 {
        return invalid("extension cannot exceed 8 characters");
    }
    if let Some(c) = extension
        .chars()
        .find(|c| c.is_whitespace() || matches!(c, '.' | '/' | '\\' | '\0'))
    {
        return invalid(&format!("extension cannot contain {:?}", c));
    }
    if extension == "tmp" {
        return invalid("extension cannot be 'tmp'");
    }
    Ok(())
}

/// Directory scanner for a stream's files.
pub struct FileScanner;

impl FileScanner {
    /// Lists all rotation indices in a directory, sorted ascending.
    pub fn list(dir: &Path, naming: &FileNaming) -> Result<Vec<u64>, StoreError> {
        let mut indices = Vec::new();

        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(index) = naming.parse(&name) {
                indices.push(index);
            }
        }

        indices.sort_unstable();
        Ok(indices)
    }

    /// Returns the latest rotation index, or None if the stream has no files.
    pub fn latest(dir: &Path, naming: &FileNaming) -> Result<Option<u64>, StoreError> {
        Ok(Self::list(dir, naming)?.last().copied())
    }

    /// Deletes the oldest files so that at most `keep` remain. The file at
    /// index `active` is never deleted.
    ///
    /// Returns the indices removed.
    pub fn prune(
        dir: &Path,
        naming: &FileNaming,
        keep: usize,
        active: u64,
    ) -> Result<Vec<u64>, StoreError> {
        let indices = Self::list(dir, naming)?;
        let excess = indices.len().saturating_sub(keep);
        let mut removed = Vec::with_capacity(excess);

        for &index in indices.iter().filter(|&&i| i != active).take(excess) {
            let path = naming.path(dir, index);
            match std::fs::remove_file(&path) {
                Ok(()) => removed.push(index),
                Err(e) => {
                    tracing::warn!("Failed to remove {}: {}", path.display(), e);
                }
            }
        }

        Ok(removed)
    }
}

/// Why a session should be rotated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationReason {
    Bytes,
    Records,
    Age,
}

impl fmt::Display for RotationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RotationReason::Bytes => f.write_str("max bytes"),
            RotationReason::Records => f.write_str("max records"),
            RotationReason::Age => f.write_str("max age"),
        }
    }
}

/// Rotation thresholds. A zero (or absent) threshold is disabled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationPolicy {
    max_bytes: u64,
    max_records: u64,
    max_age: Option<Duration>,
}

impl RotationPolicy {
    pub fn new(max_bytes: u64, max_records: u64, max_age: Option<Duration>) -> Self {
        Self {
            max_bytes,
            max_records,
            max_age: max_age.filter(|age| !age.is_zero()),
        }
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    pub fn max_records(&self) -> u64 {
        self.max_records
    }

    pub fn max_age(&self) -> Option<Duration> {
        self.max_age
    }

    /// Evaluates thresholds in priority order: bytes, records, age.
    pub fn evaluate(&self, bytes: u64, records: u64, age: Duration) -> Option<RotationReason> {
        if self.max_bytes > 0 && bytes >= self.max_bytes {
            return Some(RotationReason::Bytes);
        }
        if self.max_records > 0 && records >= self.max_records {
            return Some(RotationReason::Records);
        }
        match self.max_age {
            Some(max_age) if age >= max_age => Some(RotationReason::Age),
            _ => None,
        }
    }
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FILE_BYTES, 0, None)
    }
}

/// Result of a successful append.
#[derive(Debug, Clone)]
pub struct AppendOutcome {
    /// Offset of the frame within the file.
    pub offset: u64,
    /// Size of the frame in bytes.
    pub len: u64,
    pub link: ChainLink,
}

/// Accounting snapshot used to roll back unsynced appends.
#[derive(Debug, Clone)]
pub struct SessionMark {
    offset: u64,
    record_count: u64,
    last_digest: Digest,
    last_link: Option<ChainLink>,
    last_sequence: Option<u64>,
}

/// The active, exclusively owned file of a stream.
pub struct FileSession {
    index: u64,
    path: PathBuf,
    file: Option<File>,
    offset: u64,
    record_count: u64,
    last_digest: Digest,
    last_link: Option<ChainLink>,
    last_sequence: Option<u64>,
    created_at: Timestamp,
    policy: RotationPolicy,
    sync_pending: bool,
}

impl FileSession {
    /// Creates a new, empty file for the given rotation index.
    pub fn create(
        dir: &Path,
        naming: &FileNaming,
        index: u64,
        codec: &FrameCodec,
        policy: RotationPolicy,
    ) -> Result<Self, StoreError> {
        Self::create_with_mode(dir, naming, index, codec, policy, None)
    }

    /// Like [`FileSession::create`], with explicit Unix permission bits for
    /// the new file. The process umask still applies. Ignored off Unix.
    pub fn create_with_mode(
        dir: &Path,
        naming: &FileNaming,
        index: u64,
        codec: &FrameCodec,
        policy: RotationPolicy,
        mode: Option<u32>,
    ) -> Result<Self, StoreError> {
        let path = naming.path(dir, index);
        let mut options = OpenOptions::new();
        options.create_new(true).read(true).write(true);
        #[cfg(unix)]
        if let Some(mode) = mode {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(mode);
        }
        #[cfg(not(unix))]
        let _ = mode;
        let file = options.open(&path)?;

        Ok(Self {
            index,
            path,
            file: Some(file),
            offset: 0,
            record_count: 0,
            last_digest: codec.zero_digest(),
            last_link: None,
            last_sequence: None,
            created_at: Timestamp::now(),
            policy,
            sync_pending: false,
        })
    }

    /// Reopens an existing file and continues its chain.
    ///
    /// An incomplete last frame left by an interrupted write is trimmed off.
    /// Any other corruption is returned as an error and the file is left
    /// untouched.
    pub fn resume(
        dir: &Path,
        naming: &FileNaming,
        index: u64,
        codec: &FrameCodec,
        policy: RotationPolicy,
    ) -> Result<Self, StoreError> {
        let path = naming.path(dir, index);
        let mut report = verify_file(&path, codec)?;
        let failure = match report.failure.take() {
            Some(failure) if !report.torn_tail => return Err(failure),
            torn => torn,
        };

        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let created_at = file
            .metadata()
            .and_then(|m| m.created())
            .map(|t| Timestamp::from(DateTime::<Utc>::from(t)))
            .unwrap_or_else(|_| Timestamp::now());
        if let Some(failure) = &failure {
            file.set_len(report.last_valid_offset)?;
            file.sync_all()?;
            tracing::warn!(
                "Trimmed {} bytes from {} at offset {}: {}",
                report.file_len - report.last_valid_offset,
                path.display(),
                report.last_valid_offset,
                failure
            );
        }

        let last_digest = report
            .last_link
            .as_ref()
            .map(|link| link.digest.clone())
            .unwrap_or_else(|| codec.zero_digest());

        Ok(Self {
            index,
            path,
            file: Some(file),
            offset: report.last_valid_offset,
            record_count: report.frames,
            last_digest,
            last_link: report.last_link,
            last_sequence: report.last_sequence,
            created_at,
            policy,
            sync_pending: false,
        })
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current write offset (bytes of valid frames).
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn record_count(&self) -> u64 {
        self.record_count
    }

    /// Digest the next frame must chain to.
    pub fn last_digest(&self) -> &Digest {
        &self.last_digest
    }

    pub fn last_link(&self) -> Option<&ChainLink> {
        self.last_link.as_ref()
    }

    pub fn last_sequence(&self) -> Option<u64> {
        self.last_sequence
    }

    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    pub fn policy(&self) -> &RotationPolicy {
        &self.policy
    }

    pub fn is_closed(&self) -> bool {
        self.file.is_none()
    }

    /// Returns true if frames were appended since the last sync.
    pub fn needs_sync(&self) -> bool {
        self.sync_pending
    }

    /// Appends a frame at the current offset.
    ///
    /// On failure the offset, count and chain are left untouched and the file
    /// is trimmed back to the last good offset where possible.
    pub fn append(&mut self, frame: &SerializedFrame) -> Result<AppendOutcome, StoreError> {
        let file = self
            .file
            .as_mut()
            .ok_or(StoreError::SessionClosed(self.index))?;

        if frame.link().previous != self.last_digest {
            return Err(StoreError::ChainMismatch {
                offset: self.offset,
                expected: self.last_digest.to_string(),
                actual: frame.link().previous.to_string(),
            });
        }

        let offset = self.offset;
        let written = file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| file.write_all(frame.as_bytes()));
        if let Err(e) = written {
            if let Err(trim) = file.set_len(offset) {
                tracing::warn!(
                    "Failed to trim {} back to offset {}: {}",
                    self.path.display(),
                    offset,
                    trim
                );
            }
            return Err(e.into());
        }

        let len = frame.disk_size() as u64;
        self.offset += len;
        self.record_count += 1;
        self.last_digest = frame.link().digest.clone();
        self.last_link = Some(frame.link().clone());
        self.last_sequence = Some(frame.sequence());
        self.sync_pending = true;

        Ok(AppendOutcome {
            offset,
            len,
            link: frame.link().clone(),
        })
    }

    /// Syncs appended frames to disk.
    pub fn sync(&mut self) -> Result<(), StoreError> {
        if !self.sync_pending {
            return Ok(());
        }
        let file = self
            .file
            .as_mut()
            .ok_or(StoreError::SessionClosed(self.index))?;
        file.flush()?;
        file.sync_data()?;
        self.sync_pending = false;
        Ok(())
    }

    /// Captures the current accounting so unsynced appends can be undone.
    pub fn mark(&self) -> SessionMark {
        SessionMark {
            offset: self.offset,
            record_count: self.record_count,
            last_digest: self.last_digest.clone(),
            last_link: self.last_link.clone(),
            last_sequence: self.last_sequence,
        }
    }

    /// Discards everything appended after `mark`.
    pub fn rollback(&mut self, mark: SessionMark) {
        if let Some(file) = self.file.as_mut() {
            if let Err(e) = file.set_len(mark.offset) {
                tracing::warn!(
                    "Failed to trim {} back to offset {}: {}",
                    self.path.display(),
                    mark.offset,
                    e
                );
            }
        }
        self.offset = mark.offset;
        self.record_count = mark.record_count;
        self.last_digest = mark.last_digest;
        self.last_link = mark.last_link;
        self.last_sequence = mark.last_sequence;
    }

    /// Returns the first rotation threshold crossed at time `now`, if any.
    pub fn should_rotate(&self, now: Timestamp) -> Option<RotationReason> {
        let age = Duration::from_nanos(now.nanos_since(self.created_at));
        self.policy.evaluate(self.offset, self.record_count, age)
    }

    /// Syncs and closes the file. Idempotent; errors are logged, not returned.
    pub fn close(&mut self) {
        if let Some(mut file) = self.file.take() {
            let result = file.flush().and_then(|_| file.sync_all());
            if let Err(e) = result {
                tracing::warn!("Failed to sync {} on close: {}", self.path.display(), e);
            }
            self.sync_pending = false;
        }
    }
}

impl Drop for FileSession {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for FileSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileSession")
            .field("index", &self.index)
            .field("path", &self.path)
            .field("offset", &self.offset)
            .field("record_count", &self.record_count)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Level, LogRecord};
    use framelog_codec::Sha256Digest;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn codec() -> FrameCodec {
        FrameCodec::with_digest(Arc::new(Sha256Digest))
    }

    fn frame(codec: &FrameCodec, session: &FileSession, seq: u64) -> SerializedFrame {
        let record = LogRecord::new(seq, Timestamp::now(), Level::Info, format!("record {}", seq));
        codec.encode(&record, session.last_digest()).unwrap()
    }

    #[test]
    fn test_file_naming() {
        let naming = FileNaming::new("app", "log").unwrap();
        assert_eq!(naming.file_name(0), "app.0000000000000000.log");
        assert_eq!(naming.file_name(255), "app.00000000000000ff.log");
        assert_eq!(naming.parse("app.00000000000000ff.log"), Some(255));
        assert_eq!(naming.parse("app.00000000000000ff.txt"), None);
        assert_eq!(naming.parse("other.00000000000000ff.log"), None);
        assert_eq!(naming.parse("app.ff.log"), None);

        let bare = FileNaming::new("app", "").unwrap();
        assert_eq!(bare.file_name(1), "app.0000000000000001");
        assert_eq!(bare.parse("app.0000000000000001"), Some(1));
    }

    #[test]
    fn test_file_naming_validation() {
        assert!(FileNaming::new("", "log").is_err());
        assert!(FileNaming::new("a".repeat(65), "log").is_err());
        assert!(FileNaming::new("app.", "log").is_err());
        assert!(FileNaming::new("my app", "log").is_err());
        assert!(FileNaming::new("a/b", "log").is_err());
        assert!(FileNaming::new("app", "toolongext").is_err());
        assert!(FileNaming::new("app", "l.g").is_err());
        assert!(FileNaming::new("app", "tmp").is_err());
        assert!(FileNaming::new("app-1_x", "").is_ok());
    }

    #[test]
    fn test_rotation_policy_priority() {
        let policy = RotationPolicy::new(100, 3, Some(Duration::from_secs(60)));
        assert_eq!(policy.evaluate(10, 1, Duration::ZERO), None);
        assert_eq!(
            policy.evaluate(100, 3, Duration::from_secs(61)),
            Some(RotationReason::Bytes)
        );
        assert_eq!(
            policy.evaluate(99, 3, Duration::from_secs(61)),
            Some(RotationReason::Records)
        );
        assert_eq!(
            policy.evaluate(99, 2, Duration::from_secs(60)),
            Some(RotationReason::Age)
        );

        let unlimited = RotationPolicy::new(0, 0, Some(Duration::ZERO));
        assert_eq!(unlimited.evaluate(u64::MAX, u64::MAX, Duration::MAX), None);
    }

    #[test]
    fn test_session_append_advances_chain() {
        let dir = TempDir::new().unwrap();
        let codec = codec();
        let naming = FileNaming::default();
        let mut session =
            FileSession::create(dir.path(), &naming, 1, &codec, RotationPolicy::default()).unwrap();

        let first = frame(&codec, &session, 1);
        let outcome = session.append(&first).unwrap();
        assert_eq!(outcome.offset, 0);
        assert!(outcome.link.is_first());

        let second = frame(&codec, &session, 2);
        let outcome = session.append(&second).unwrap();
        assert_eq!(outcome.offset, first.disk_size() as u64);
        assert_eq!(outcome.link.previous, first.link().digest);

        session.sync().unwrap();
        assert_eq!(session.record_count(), 2);
        assert_eq!(session.last_sequence(), Some(2));
        assert_eq!(
            std::fs::metadata(session.path()).unwrap().len(),
            session.offset()
        );
    }

    #[test]
    fn test_stale_previous_digest_rejected() {
        let dir = TempDir::new().unwrap();
        let codec = codec();
        let mut session = FileSession::create(
            dir.path(),
            &FileNaming::default(),
            1,
            &codec,
            RotationPolicy::default(),
        )
        .unwrap();

        let stale = frame(&codec, &session, 1);
        session.append(&stale).unwrap();
        let result = session.append(&stale);
        assert!(matches!(result, Err(StoreError::ChainMismatch { .. })));
        assert_eq!(session.record_count(), 1);
    }

    #[test]
    fn test_rollback_restores_accounting() {
        let dir = TempDir::new().unwrap();
        let codec = codec();
        let mut session = FileSession::create(
            dir.path(),
            &FileNaming::default(),
            1,
            &codec,
            RotationPolicy::default(),
        )
        .unwrap();

        session.append(&frame(&codec, &session, 1)).unwrap();
        let mark = session.mark();
        let digest_before = session.last_digest().clone();
        session.append(&frame(&codec, &session, 2)).unwrap();
        session.append(&frame(&codec, &session, 3)).unwrap();

        session.rollback(mark);
        assert_eq!(session.record_count(), 1);
        assert_eq!(session.last_sequence(), Some(1));
        assert_eq!(session.last_digest(), &digest_before);
        assert_eq!(
            std::fs::metadata(session.path()).unwrap().len(),
            session.offset()
        );
    }

    #[test]
    fn test_should_rotate_on_records() {
        let dir = TempDir::new().unwrap();
        let codec = codec();
        let policy = RotationPolicy::new(0, 2, None);
        let mut session =
            FileSession::create(dir.path(), &FileNaming::default(), 1, &codec, policy).unwrap();

        session.append(&frame(&codec, &session, 1)).unwrap();
        assert_eq!(session.should_rotate(Timestamp::now()), None);
        session.append(&frame(&codec, &session, 2)).unwrap();
        assert_eq!(
            session.should_rotate(Timestamp::now()),
            Some(RotationReason::Records)
        );
    }

    #[test]
    fn test_should_rotate_on_age() {
        let dir = TempDir::new().unwrap();
        let codec = codec();
        let policy = RotationPolicy::new(0, 0, Some(Duration::from_secs(5)));
        let session =
            FileSession::create(dir.path(), &FileNaming::default(), 1, &codec, policy).unwrap();

        let later = Timestamp::from_nanos(session.created_at().as_nanos() + 6_000_000_000);
        assert_eq!(session.should_rotate(later), Some(RotationReason::Age));
    }

    #[test]
    fn test_close_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let codec = codec();
        let mut session = FileSession::create(
            dir.path(),
            &FileNaming::default(),
            1,
            &codec,
            RotationPolicy::default(),
        )
        .unwrap();

        session.append(&frame(&codec, &session, 1)).unwrap();
        session.close();
        session.close();
        assert!(session.is_closed());

        let result = session.append(&frame(&codec, &session, 2));
        assert!(matches!(result, Err(StoreError::SessionClosed(1))));
    }

    #[test]
    fn test_resume_continues_chain() {
        let dir = TempDir::new().unwrap();
        let codec = codec();
        let naming = FileNaming::default();

        let last_digest = {
            let mut session =
                FileSession::create(dir.path(), &naming, 3, &codec, RotationPolicy::default())
                    .unwrap();
            for seq in 1..=4 {
                session.append(&frame(&codec, &session, seq)).unwrap();
            }
            session.close();
            session.last_digest().clone()
        };

        let mut session =
            FileSession::resume(dir.path(), &naming, 3, &codec, RotationPolicy::default())
                .unwrap();
        assert_eq!(session.record_count(), 4);
        assert_eq!(session.last_sequence(), Some(4));
        assert_eq!(session.last_digest(), &last_digest);

        let outcome = session.append(&frame(&codec, &session, 5)).unwrap();
        assert_eq!(outcome.link.previous, last_digest);
    }

    #[test]
    fn test_resume_trims_partial_tail() {
        let dir = TempDir::new().unwrap();
        let codec = codec();
        let naming = FileNaming::default();

        let valid_len = {
            let mut session =
                FileSession::create(dir.path(), &naming, 1, &codec, RotationPolicy::default())
                    .unwrap();
            session.append(&frame(&codec, &session, 1)).unwrap();
            session.append(&frame(&codec, &session, 2)).unwrap();
            session.close();
            session.offset()
        };

        // Simulate a torn write.
        let mut file = OpenOptions::new()
            .append(true)
            .open(naming.path(dir.path(), 1))
            .unwrap();
        file.write_all(&[0, 0, 0, 90, 1, 2, 3]).unwrap();
        drop(file);

        let session =
            FileSession::resume(dir.path(), &naming, 1, &codec, RotationPolicy::default())
                .unwrap();
        assert_eq!(session.offset(), valid_len);
        assert_eq!(session.record_count(), 2);
        assert_eq!(
            std::fs::metadata(naming.path(dir.path(), 1)).unwrap().len(),
            valid_len
        );
    }

    #[test]
    fn test_resume_refuses_corrupt_file() {
        let dir = TempDir::new().unwrap();
        let codec = codec();
        let naming = FileNaming::default();
        let path = naming.path(dir.path(), 1);

        let first_len = {
            let mut session =
                FileSession::create(dir.path(), &naming, 1, &codec, RotationPolicy::default())
                    .unwrap();
            let outcome = session.append(&frame(&codec, &session, 1)).unwrap();
            for seq in 2..=5 {
                session.append(&frame(&codec, &session, seq)).unwrap();
            }
            session.close();
            outcome.len
        };

        let mut bytes = std::fs::read(&path).unwrap();
        let target = first_len as usize + crate::LENGTH_PREFIX_SIZE + codec.width() + 2;
        bytes[target] ^= 0x01;
        std::fs::write(&path, &bytes).unwrap();

        let result = FileSession::resume(dir.path(), &naming, 1, &codec, RotationPolicy::default());
        assert!(matches!(result, Err(StoreError::DigestMismatch { .. })));
        assert_eq!(std::fs::read(&path).unwrap(), bytes);
    }

    #[test]
    fn test_resume_age_ignores_record_timestamps() {
        let dir = TempDir::new().unwrap();
        let codec = codec();
        let naming = FileNaming::default();

        {
            let mut session =
                FileSession::create(dir.path(), &naming, 1, &codec, RotationPolicy::default())
                    .unwrap();
            let record = LogRecord::new(1, Timestamp::from_nanos(1), Level::Info, "old clock");
            let frame = codec.encode(&record, session.last_digest()).unwrap();
            session.append(&frame).unwrap();
        }

        let policy = RotationPolicy::new(0, 0, Some(Duration::from_secs(3600)));
        let session = FileSession::resume(dir.path(), &naming, 1, &codec, policy).unwrap();
        assert!(session.created_at() > Timestamp::from_nanos(1));
        assert_eq!(session.should_rotate(Timestamp::now()), None);
    }

    #[test]
    fn test_failed_write_leaves_session_unchanged() {
        let dir = TempDir::new().unwrap();
        let codec = codec();
        let naming = FileNaming::default();
        let path = naming.path(dir.path(), 1);
        let mut session =
            FileSession::create(dir.path(), &naming, 1, &codec, RotationPolicy::default()).unwrap();
        session.append(&frame(&codec, &session, 1)).unwrap();
        let before = session.mark();

        // Writes through a read-only handle fail.
        session.file = Some(File::open(&path).unwrap());
        let second = frame(&codec, &session, 2);
        assert!(matches!(session.append(&second), Err(StoreError::Io(_))));
        assert_eq!(session.offset(), before.offset);
        assert_eq!(session.record_count(), 1);
        assert_eq!(session.last_digest(), &before.last_digest);
        assert_eq!(session.last_sequence(), Some(1));

        session.file = Some(OpenOptions::new().read(true).write(true).open(&path).unwrap());
        let outcome = session.append(&second).unwrap();
        assert_eq!(outcome.offset, before.offset);
        assert_eq!(session.record_count(), 2);
        session.close();

        let report = verify_file(&path, &codec).unwrap();
        assert!(report.is_clean());
        assert_eq!(report.last_sequence, Some(2));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_failed_sync_rolls_back() {
        let dir = TempDir::new().unwrap();
        let codec = codec();
        let naming = FileNaming::default();
        let mut session =
            FileSession::create(dir.path(), &naming, 1, &codec, RotationPolicy::default()).unwrap();
        session.append(&frame(&codec, &session, 1)).unwrap();
        session.sync().unwrap();
        let mark = session.mark();

        // Character devices reject fsync.
        session.file = Some(OpenOptions::new().write(true).open("/dev/null").unwrap());
        session.append(&frame(&codec, &session, 2)).unwrap();
        assert!(matches!(session.sync(), Err(StoreError::Io(_))));
        assert!(session.needs_sync());

        session.rollback(mark);
        assert_eq!(session.record_count(), 1);
        assert_eq!(session.last_sequence(), Some(1));
    }

    #[cfg(unix)]
    #[test]
    fn test_create_with_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let session = FileSession::create_with_mode(
            dir.path(),
            &FileNaming::default(),
            1,
            &codec(),
            RotationPolicy::default(),
            Some(0o600),
        )
        .unwrap();
        let mode = std::fs::metadata(session.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_scanner_lists_sorted() {
        let dir = TempDir::new().unwrap();
        let codec = codec();
        let naming = FileNaming::default();
        for index in [3u64, 1, 2] {
            FileSession::create(dir.path(), &naming, index, &codec, RotationPolicy::default())
                .unwrap();
        }
        std::fs::write(dir.path().join("unrelated.txt"), b"x").unwrap();

        assert_eq!(FileScanner::list(dir.path(), &naming).unwrap(), vec![1, 2, 3]);
        assert_eq!(FileScanner::latest(dir.path(), &naming).unwrap(), Some(3));
    }

    #[test]
    fn test_prune_keeps_newest() {
        let dir = TempDir::new().unwrap();
        let codec = codec();
        let naming = FileNaming::default();
        for index in 1..=5 {
            FileSession::create(dir.path(), &naming, index, &codec, RotationPolicy::default())
                .unwrap();
        }

        let removed = FileScanner::prune(dir.path(), &naming, 2, 5).unwrap();
        assert_eq!(removed, vec![1, 2, 3]);
        assert_eq!(FileScanner::list(dir.path(), &naming).unwrap(), vec![4, 5]);

        assert!(FileScanner::prune(dir.path(), &naming, 2, 5).unwrap().is_empty());
    }
}
