//! # framelog-codec
//!
//! Stateless adapters consumed by the framelog core:
//! - Digest adapters (SHA-256, CRC32C) producing fixed-width digests
//! - Binary codecs rendering bytes as text (hex)
//! - Text codecs turning text into bytes and back (UTF-8)
//!
//! The core only sees the traits; concrete algorithms are chosen at engine
//! construction time.

pub mod digest;
pub mod error;
pub mod text;

pub use digest::{Crc32cDigest, DigestAdapter, DigestAlgorithm, Sha256Digest};
pub use error::CodecError;
pub use text::{BinaryCodec, HexCodec, TextCodec, Utf8Codec};
