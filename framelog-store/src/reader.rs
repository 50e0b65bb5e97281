//! Sequential frame reading and file verification.

use crate::error::StoreError;
use crate::frame::{ChainLink, Digest, FrameCodec};
use crate::record::{LogRecord, Timestamp};
use crate::LENGTH_PREFIX_SIZE;
use bytes::{Buf, BytesMut};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

const READ_CHUNK_SIZE: usize = 8192;

/// A frame whose digest and chain link have been checked.
#[derive(Debug, Clone)]
pub struct VerifiedFrame {
    /// Offset of the frame within the file.
    pub offset: u64,
    pub record: LogRecord,
    pub link: ChainLink,
}

/// Reads frames in order, verifying digests and the hash chain.
///
/// Yields an error at the first invalid frame and stops. A trailing partial
/// frame is reported as [`StoreError::FrameLengthMismatch`].
pub struct FrameReader<R: Read> {
    reader: BufReader<R>,
    codec: FrameCodec,
    buf: BytesMut,
    offset: u64,
    expected_previous: Digest,
    eof: bool,
    done: bool,
}

impl FrameReader<File> {
    /// Opens a log file for reading from the start.
    pub fn open(path: impl AsRef<Path>, codec: &FrameCodec) -> Result<Self, StoreError> {
        let file = File::open(path)?;
        Ok(Self::new(file, codec))
    }
}

impl<R: Read> FrameReader<R> {
    pub fn new(reader: R, codec: &FrameCodec) -> Self {
        Self {
            reader: BufReader::new(reader),
            codec: codec.clone(),
            buf: BytesMut::new(),
            offset: 0,
            expected_previous: codec.zero_digest(),
            eof: false,
            done: false,
        }
    }

    /// Offset just past the last frame yielded.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    fn fill(&mut self) -> Result<(), StoreError> {
        let mut chunk = vec![0u8; READ_CHUNK_SIZE];
        match self.reader.read(&mut chunk)? {
            0 => self.eof = true,
            n => self.buf.extend_from_slice(&chunk[..n]),
        }
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<VerifiedFrame>, StoreError> {
        loop {
            if let Some(frame) = self.codec.decode_next(&self.buf, self.offset)? {
                if frame.link.previous != self.expected_previous {
                    return Err(StoreError::ChainMismatch {
                        offset: self.offset,
                        expected: self.expected_previous.to_string(),
                        actual: frame.link.previous.to_string(),
                    });
                }

                let offset = self.offset;
                self.buf.advance(frame.size);
                self.offset += frame.size as u64;
                self.expected_previous = frame.link.digest.clone();

                return Ok(Some(VerifiedFrame {
                    offset,
                    record: frame.record,
                    link: frame.link,
                }));
            }

            if self.eof {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(self.partial_frame());
            }

            self.fill()?;
        }
    }

    fn partial_frame(&self) -> StoreError {
        let declared = if self.buf.len() >= LENGTH_PREFIX_SIZE {
            u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as u64
        } else {
            0
        };
        StoreError::FrameLengthMismatch {
            offset: self.offset,
            declared,
            available: self.buf.len().saturating_sub(LENGTH_PREFIX_SIZE) as u64,
        }
    }
}

impl<R: Read> Iterator for FrameReader<R> {
    type Item = Result<VerifiedFrame, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_frame() {
            Ok(Some(frame)) => Some(Ok(frame)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Summary of a verified file.
#[derive(Debug)]
pub struct VerifyReport {
    pub path: PathBuf,
    /// Number of valid frames.
    pub frames: u64,
    /// Offset just past the last valid frame.
    pub last_valid_offset: u64,
    pub file_len: u64,
    pub first_sequence: Option<u64>,
    pub last_sequence: Option<u64>,
    pub first_timestamp: Option<Timestamp>,
    pub last_link: Option<ChainLink>,
    /// First problem found, if any.
    pub failure: Option<StoreError>,
    /// The failure is an incomplete last frame, as left by an interrupted write.
    pub torn_tail: bool,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.failure.is_none() && self.last_valid_offset == self.file_len
    }

    /// Bytes after the last valid frame.
    pub fn invalid_bytes(&self) -> u64 {
        self.file_len - self.last_valid_offset
    }
}

/// Verifies every frame of a file.
///
/// Corruption is recorded in the report; only I/O failures are returned as
/// errors.
pub fn verify_file(path: impl AsRef<Path>, codec: &FrameCodec) -> Result<VerifyReport, StoreError> {
    let path = path.as_ref();
    let file = File::open(path)?;
    let file_len = file.metadata()?.len();

    let mut report = VerifyReport {
        path: path.to_path_buf(),
        frames: 0,
        last_valid_offset: 0,
        file_len,
        first_sequence: None,
        last_sequence: None,
        first_timestamp: None,
        last_link: None,
        failure: None,
        torn_tail: false,
    };

    let mut reader = FrameReader::new(file, codec);
    for frame in reader.by_ref() {
        match frame {
            Ok(frame) => {
                if report.frames == 0 {
                    report.first_sequence = Some(frame.record.sequence());
                    report.first_timestamp = Some(frame.record.timestamp());
                }
                report.frames += 1;
                report.last_sequence = Some(frame.record.sequence());
                report.last_link = Some(frame.link);
            }
            Err(StoreError::Io(e)) => return Err(StoreError::Io(e)),
            Err(e) => {
                report.failure = Some(e);
                break;
            }
        }
    }
    report.last_valid_offset = reader.offset();
    report.torn_tail = match &report.failure {
        Some(StoreError::FrameLengthMismatch { declared, .. }) => {
            let frame_size = LENGTH_PREFIX_SIZE as u64 + *declared + codec.width() as u64;
            frame_size > report.invalid_bytes()
        }
        _ => false,
    };

    Ok(report)
}
