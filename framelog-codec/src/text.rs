//! Byte/text codecs.

use crate::error::CodecError;

/// Renders binary data as text and back (e.g. hex).
pub trait BinaryCodec: Send + Sync {
    fn encode(&self, bytes: &[u8]) -> String;
    fn decode(&self, text: &str) -> Result<Vec<u8>, CodecError>;
}

/// Turns text into bytes and back (e.g. UTF-8).
pub trait TextCodec: Send + Sync {
    fn encode(&self, text: &str) -> Vec<u8>;
    fn decode(&self, bytes: &[u8]) -> Result<String, CodecError>;
}

/// Lower-case base16.
#[derive(Debug, Clone, Copy, Default)]
pub struct HexCodec;

impl BinaryCodec for HexCodec {
    fn encode(&self, bytes: &[u8]) -> String {
        hex::encode(bytes)
    }

    fn decode(&self, text: &str) -> Result<Vec<u8>, CodecError> {
        hex::decode(text).map_err(|e| CodecError::InvalidHex(e.to_string()))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Utf8Codec;

impl TextCodec for Utf8Codec {
    fn encode(&self, text: &str) -> Vec<u8> {
        text.as_bytes().to_vec()
    }

    fn decode(&self, bytes: &[u8]) -> Result<String, CodecError> {
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|e| CodecError::InvalidUtf8 {
                valid_up_to: e.valid_up_to(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_encode_decode() {
        let encoded = HexCodec.encode(&[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(encoded, "deadbeef");
        assert_eq!(HexCodec.decode("DEADBEEF").unwrap(), vec![0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn test_hex_rejects_odd_length() {
        assert!(matches!(HexCodec.decode("abc"), Err(CodecError::InvalidHex(_))));
        assert!(matches!(HexCodec.decode("zz"), Err(CodecError::InvalidHex(_))));
    }

    #[test]
    fn test_utf8_multibyte() {
        let text = "héllo ✓";
        let bytes = Utf8Codec.encode(text);
        assert_eq!(Utf8Codec.decode(&bytes).unwrap(), text);
    }

    #[test]
    fn test_utf8_invalid_sequence() {
        let result = Utf8Codec.decode(&[b'o', b'k', 0xff, 0xfe]);
        assert_eq!(result, Err(CodecError::InvalidUtf8 { valid_up_to: 2 }));
    }
}
