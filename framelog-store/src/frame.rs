//! Frame encoding and hash chaining.
//!
//! Each frame has the following on-disk format:
//!
//! ```text
//! +----------+-------------------+------------------+-------------------+
//! | length   | previous digest   | payload          | digest            |
//! | 4 bytes  | W bytes           | length - W bytes | W bytes           |
//! +----------+-------------------+------------------+-------------------+
//! ```
//!
//! `W` is the width of the configured digest. The digest covers
//! `length || previous || payload`, so every frame commits to the one before
//! it. The first frame of a file uses the all-zero digest as its previous.

use crate::error::StoreError;
use crate::record::LogRecord;
use crate::{LENGTH_PREFIX_SIZE, MAX_FRAME_SIZE};
use bytes::{BufMut, Bytes, BytesMut};
use framelog_codec::{BinaryCodec, DigestAdapter, HexCodec, TextCodec, Utf8Codec};
use std::fmt;
use std::sync::Arc;

/// A fixed-width digest produced by a [`DigestAdapter`].
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Digest(Vec<u8>);

impl Digest {
    /// The all-zero digest used as the previous link of a file's first frame.
    pub fn zero(width: usize) -> Self {
        Self(vec![0u8; width])
    }

    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn width(&self) -> usize {
        self.0.len()
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }

    /// Renders the digest with the given binary codec.
    pub fn render(&self, codec: &dyn BinaryCodec) -> String {
        codec.encode(&self.0)
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.render(&HexCodec);
        let short = &hex[..hex.len().min(16)];
        write!(f, "Digest({}..)", short)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render(&HexCodec))
    }
}

impl AsRef<[u8]> for Digest {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Links a frame's digest to the digest of the frame before it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainLink {
    pub digest: Digest,
    pub previous: Digest,
}

impl ChainLink {
    /// Returns true for the first frame of a file.
    pub fn is_first(&self) -> bool {
        self.previous.is_zero()
    }
}

/// The encoded bytes of one frame, ready to append.
#[derive(Debug, Clone)]
pub struct SerializedFrame {
    bytes: Bytes,
    link: ChainLink,
    sequence: u64,
}

impl SerializedFrame {
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn link(&self) -> &ChainLink {
        &self.link
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Total size of this frame on disk.
    pub fn disk_size(&self) -> usize {
        self.bytes.len()
    }
}

/// A frame decoded from bytes.
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    pub record: LogRecord,
    pub link: ChainLink,
    /// Bytes consumed, including prefix and digest.
    pub size: usize,
}

/// Encodes and decodes frames with a fixed digest and text codec.
#[derive(Clone)]
pub struct FrameCodec {
    digest: Arc<dyn DigestAdapter>,
    text: Arc<dyn TextCodec>,
    width: usize,
}

impl FrameCodec {
    pub fn new(digest: Arc<dyn DigestAdapter>, text: Arc<dyn TextCodec>) -> Self {
        let width = digest.width();
        Self {
            digest,
            text,
            width,
        }
    }

    /// Codec using the given digest and UTF-8 text.
    pub fn with_digest(digest: Arc<dyn DigestAdapter>) -> Self {
        Self::new(digest, Arc::new(Utf8Codec))
    }

    /// Digest width in bytes.
    pub fn width(&self) -> usize {
        self.width
    }

    pub fn digest_name(&self) -> &'static str {
        self.digest.name()
    }

    pub fn zero_digest(&self) -> Digest {
        Digest::zero(self.width)
    }

    /// Hashes arbitrary bytes with the configured adapter.
    pub fn digest(&self, bytes: &[u8]) -> Digest {
        Digest(self.digest.digest(bytes))
    }

    /// Serializes `record` into a frame chained to `previous`.
    pub fn encode(
        &self,
        record: &LogRecord,
        previous: &Digest,
    ) -> Result<SerializedFrame, StoreError> {
        if previous.width() != self.width {
            return Err(StoreError::Encoding(format!(
                "previous digest is {} bytes, expected {}",
                previous.width(),
                self.width
            )));
        }

        let payload = record.encode_payload(self.text.as_ref())?;
        let body_len = self.width + payload.len();
        if body_len > MAX_FRAME_SIZE {
            return Err(StoreError::RecordTooLarge {
                size: body_len,
                max: MAX_FRAME_SIZE,
            });
        }

        let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + body_len + self.width);

        // Length (4 bytes)
        buf.put_u32(body_len as u32);

        // Previous digest (W bytes)
        buf.put_slice(previous.as_bytes());

        // Payload
        buf.put_slice(&payload);

        // Digest over everything written so far (W bytes)
        let digest = self.digest(&buf);
        buf.put_slice(digest.as_bytes());

        Ok(SerializedFrame {
            bytes: buf.freeze(),
            link: ChainLink {
                digest,
                previous: previous.clone(),
            },
            sequence: record.sequence(),
        })
    }

    /// Decodes exactly one frame occupying all of `bytes`.
    pub fn decode(&self, bytes: &[u8]) -> Result<DecodedFrame, StoreError> {
        if bytes.len() < LENGTH_PREFIX_SIZE {
            return Err(StoreError::FrameLengthMismatch {
                offset: 0,
                declared: 0,
                available: 0,
            });
        }
        let declared = read_length(bytes) as usize;
        let available = bytes.len() - LENGTH_PREFIX_SIZE;
        if declared + self.width != available {
            return Err(StoreError::FrameLengthMismatch {
                offset: 0,
                declared: declared as u64,
                available: available.saturating_sub(self.width) as u64,
            });
        }

        match self.decode_next(bytes, 0)? {
            Some(frame) => Ok(frame),
            None => Err(StoreError::FrameLengthMismatch {
                offset: 0,
                declared: declared as u64,
                available: available as u64,
            }),
        }
    }

    /// Decodes the frame at the start of `buf`.
    ///
    /// Returns `Ok(None)` when `buf` holds only part of a frame. `offset` is
    /// the position of `buf[0]` in the file and only used for error reports.
    pub fn decode_next(
        &self,
        buf: &[u8],
        offset: u64,
    ) -> Result<Option<DecodedFrame>, StoreError> {
        if buf.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let declared = read_length(buf) as usize;
        if declared < self.width || declared > MAX_FRAME_SIZE {
            return Err(StoreError::FrameLengthMismatch {
                offset,
                declared: declared as u64,
                available: (buf.len() - LENGTH_PREFIX_SIZE) as u64,
            });
        }

        let body_end = LENGTH_PREFIX_SIZE + declared;
        let total = body_end + self.width;
        if buf.len() < total {
            return Ok(None);
        }

        let stored = &buf[body_end..total];
        let computed = self.digest(&buf[..body_end]);
        if computed.as_bytes() != stored {
            return Err(StoreError::DigestMismatch {
                offset,
                stored: HexCodec.encode(stored),
                computed: computed.to_string(),
            });
        }

        let previous = Digest::from_bytes(&buf[LENGTH_PREFIX_SIZE..LENGTH_PREFIX_SIZE + self.width]);
        let payload = &buf[LENGTH_PREFIX_SIZE + self.width..body_end];
        let record = LogRecord::decode_payload(payload, self.text.as_ref()).map_err(|e| {
            StoreError::Encoding(format!("frame at offset {}: {}", offset, e))
        })?;

        Ok(Some(DecodedFrame {
            record,
            link: ChainLink {
                digest: computed,
                previous,
            },
            size: total,
        }))
    }

    /// Size a record would occupy on disk.
    pub fn frame_size(&self, payload_len: usize) -> usize {
        LENGTH_PREFIX_SIZE + self.width + payload_len + self.width
    }
}

impl fmt::Debug for FrameCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameCodec")
            .field("digest", &self.digest.name())
            .field("width", &self.width)
            .finish()
    }
}

fn read_length(buf: &[u8]) -> u32 {
    u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]])
}
