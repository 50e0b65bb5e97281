//! Log record model.
//!
//! A record's payload has the following layout (big-endian):
//!
//! ```text
//! +----------+-----------+-------+-------------+---------+------------------+
//! | sequence | timestamp | level | message_len | message | fields           |
//! | 8 bytes  | 8 bytes   | 1 b   | 4 bytes     | n bytes | JSON (optional)  |
//! +----------+-----------+-------+-------------+---------+------------------+
//! ```
//!
//! The fields section is omitted when the record has no structured fields.

use crate::error::StoreError;
use bytes::{BufMut, BytesMut};
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use framelog_codec::TextCodec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Fixed part of the payload: sequence + timestamp + level + message length.
const PAYLOAD_HEADER_SIZE: usize = 8 + 8 + 1 + 4;

/// Severity of a record. Ordered from least to most severe.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Level {
    Verbose = 1,
    Debug = 2,
    Info = 3,
    Warn = 4,
    Error = 5,
    Fatal = 6,
}

impl Level {
    /// Single-letter tag used in human-readable dumps.
    pub fn tag(&self) -> char {
        match self {
            Level::Verbose => 'V',
            Level::Debug => 'D',
            Level::Info => 'I',
            Level::Warn => 'W',
            Level::Error => 'E',
            Level::Fatal => 'F',
        }
    }
}

impl TryFrom<u8> for Level {
    type Error = StoreError;

    fn try_from(value: u8) -> Result<Self, StoreError> {
        match value {
            1 => Ok(Level::Verbose),
            2 => Ok(Level::Debug),
            3 => Ok(Level::Info),
            4 => Ok(Level::Warn),
            5 => Ok(Level::Error),
            6 => Ok(Level::Fatal),
            _ => Err(StoreError::Encoding(format!("unknown level: {}", value))),
        }
    }
}

impl FromStr for Level {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, StoreError> {
        match s.to_lowercase().as_str() {
            "v" | "verbose" | "trace" => Ok(Level::Verbose),
            "d" | "debug" => Ok(Level::Debug),
            "i" | "info" => Ok(Level::Info),
            "w" | "warn" | "warning" => Ok(Level::Warn),
            "e" | "error" => Ok(Level::Error),
            "f" | "fatal" => Ok(Level::Fatal),
            other => Err(StoreError::Encoding(format!("unknown level: {}", other))),
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Level::Verbose => "VERBOSE",
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
            Level::Fatal => "FATAL",
        };
        f.write_str(name)
    }
}

/// Wall-clock time in nanoseconds since the Unix epoch.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Timestamp(i64);

impl Timestamp {
    pub fn from_nanos(nanos: i64) -> Self {
        Self(nanos)
    }

    pub fn as_nanos(&self) -> i64 {
        self.0
    }

    /// Current wall-clock time.
    pub fn now() -> Self {
        Self(Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX))
    }

    /// Current wall-clock time, but strictly after `prev`.
    ///
    /// Keeps timestamps increasing when the wall clock steps backwards.
    pub fn now_after(prev: Timestamp) -> Self {
        let now = Self::now();
        if now > prev {
            now
        } else {
            Self(prev.0.saturating_add(1))
        }
    }

    pub fn to_datetime(&self) -> DateTime<Utc> {
        Utc.timestamp_nanos(self.0)
    }

    /// Nanoseconds elapsed from `earlier` to `self`, clamped at zero.
    pub fn nanos_since(&self, earlier: Timestamp) -> u64 {
        self.0.saturating_sub(earlier.0).max(0) as u64
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_datetime().to_rfc3339_opts(SecondsFormat::Micros, true))
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(value: DateTime<Utc>) -> Self {
        Self(value.timestamp_nanos_opt().unwrap_or(i64::MAX))
    }
}

/// A scalar structured-field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Int(value)
    }
}

impl From<i32> for FieldValue {
    fn from(value: i32) -> Self {
        FieldValue::Int(value as i64)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Float(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Str(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Str(value)
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Bool(b) => write!(f, "{}", b),
            FieldValue::Int(i) => write!(f, "{}", i),
            FieldValue::Float(x) => write!(f, "{}", x),
            FieldValue::Str(s) => write!(f, "{:?}", s),
        }
    }
}

/// One log entry. Immutable once constructed.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    sequence: u64,
    timestamp: Timestamp,
    level: Level,
    message: String,
    fields: BTreeMap<String, FieldValue>,
}

impl LogRecord {
    pub fn new(
        sequence: u64,
        timestamp: Timestamp,
        level: Level,
        message: impl Into<String>,
    ) -> Self {
        Self {
            sequence,
            timestamp,
            level,
            message: message.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Returns a copy of this record with one more structured field.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    pub fn level(&self) -> Level {
        self.level
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn fields(&self) -> &BTreeMap<String, FieldValue> {
        &self.fields
    }

    /// Checks structured fields for values that cannot be encoded.
    pub fn validate(&self) -> Result<(), StoreError> {
        for (key, value) in &self.fields {
            if key.is_empty() {
                return Err(StoreError::Encoding("field key cannot be empty".to_string()));
            }
            if let FieldValue::Float(x) = value {
                if !x.is_finite() {
                    return Err(StoreError::Encoding(format!(
                        "field '{}' is not a finite number: {}",
                        key, x
                    )));
                }
            }
        }
        Ok(())
    }

    /// Encodes the record payload.
    pub fn encode_payload(&self, text: &dyn TextCodec) -> Result<BytesMut, StoreError> {
        self.validate()?;

        let message = text.encode(&self.message);
        let message_len = u32::try_from(message.len()).map_err(|_| {
            StoreError::Encoding(format!("message too long: {} bytes", message.len()))
        })?;
        let fields = if self.fields.is_empty() {
            Vec::new()
        } else {
            serde_json::to_vec(&self.fields)
                .map_err(|e| StoreError::Encoding(format!("fields: {}", e)))?
        };

        let mut buf = BytesMut::with_capacity(PAYLOAD_HEADER_SIZE + message.len() + fields.len());
        buf.put_u64(self.sequence);
        buf.put_i64(self.timestamp.as_nanos());
        buf.put_u8(self.level as u8);
        buf.put_u32(message_len);
        buf.put_slice(&message);
        buf.put_slice(&fields);

        Ok(buf)
    }

    /// Decodes a record payload produced by [`LogRecord::encode_payload`].
    pub fn decode_payload(payload: &[u8], text: &dyn TextCodec) -> Result<Self, StoreError> {
        if payload.len() < PAYLOAD_HEADER_SIZE {
            return Err(StoreError::Encoding(format!(
                "payload too short: {} bytes",
                payload.len()
            )));
        }

        let sequence = u64::from_be_bytes(read_array(&payload[0..8]));
        let timestamp = Timestamp::from_nanos(i64::from_be_bytes(read_array(&payload[8..16])));
        let level = Level::try_from(payload[16])?;
        let message_len = u32::from_be_bytes(read_array(&payload[17..21])) as usize;

        let rest = &payload[PAYLOAD_HEADER_SIZE..];
        if rest.len() < message_len {
            return Err(StoreError::Encoding(format!(
                "message length {} exceeds payload ({} bytes left)",
                message_len,
                rest.len()
            )));
        }
        let message = text
            .decode(&rest[..message_len])
            .map_err(|e| StoreError::Encoding(format!("message: {}", e)))?;

        let fields_bytes = &rest[message_len..];
        let fields = if fields_bytes.is_empty() {
            BTreeMap::new()
        } else {
            serde_json::from_slice(fields_bytes)
                .map_err(|e| StoreError::Encoding(format!("fields: {}", e)))?
        };

        Ok(Self {
            sequence,
            timestamp,
            level,
            message,
            fields,
        })
    }
}

impl fmt::Display for LogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} #{} {} {}",
            self.timestamp,
            self.sequence,
            self.level.tag(),
            self.message
        )?;
        for (key, value) in &self.fields {
            write!(f, " {}={}", key, value)?;
        }
        Ok(())
    }
}

fn read_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use framelog_codec::Utf8Codec;
    use proptest::prelude::*;

    fn sample() -> LogRecord {
        LogRecord::new(7, Timestamp::from_nanos(1_700_000_000_123_456_789), Level::Warn, "disk at 91%")
            .with_field("mount", "/var")
            .with_field("used_pct", 91.5)
            .with_field("alerting", true)
            .with_field("inodes", 1_024i64)
    }

    #[test]
    fn test_payload_roundtrip() {
        let record = sample();
        let payload = record.encode_payload(&Utf8Codec).unwrap();
        let decoded = LogRecord::decode_payload(&payload, &Utf8Codec).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_payload_without_fields_has_no_json() {
        let record = LogRecord::new(1, Timestamp::from_nanos(0), Level::Info, "hi");
        let payload = record.encode_payload(&Utf8Codec).unwrap();
        assert_eq!(payload.len(), PAYLOAD_HEADER_SIZE + 2);
    }

    #[test]
    fn test_non_finite_field_rejected() {
        let record = LogRecord::new(1, Timestamp::now(), Level::Info, "x").with_field("ratio", f64::NAN);
        assert!(matches!(
            record.encode_payload(&Utf8Codec),
            Err(StoreError::Encoding(_))
        ));

        let record = LogRecord::new(1, Timestamp::now(), Level::Info, "x").with_field("", 1i64);
        assert!(matches!(record.validate(), Err(StoreError::Encoding(_))));
    }

    #[test]
    fn test_invalid_utf8_message_rejected() {
        let mut payload = LogRecord::new(1, Timestamp::from_nanos(0), Level::Info, "ab")
            .encode_payload(&Utf8Codec)
            .unwrap();
        let len = payload.len();
        payload[len - 1] = 0xff;
        assert!(matches!(
            LogRecord::decode_payload(&payload, &Utf8Codec),
            Err(StoreError::Encoding(_))
        ));
    }

    #[test]
    fn test_truncated_payload_rejected() {
        let payload = sample().encode_payload(&Utf8Codec).unwrap();
        assert!(LogRecord::decode_payload(&payload[..10], &Utf8Codec).is_err());
        assert!(LogRecord::decode_payload(&payload[..PAYLOAD_HEADER_SIZE + 3], &Utf8Codec).is_err());
    }

    #[test]
    fn test_level_ordering_and_conversion() {
        assert!(Level::Verbose < Level::Debug);
        assert!(Level::Error < Level::Fatal);
        assert_eq!(Level::try_from(3u8).unwrap(), Level::Info);
        assert_eq!(Level::try_from(5u8).unwrap(), Level::Error);
        assert!(Level::try_from(0u8).is_err());
        assert_eq!("warning".parse::<Level>().unwrap(), Level::Warn);
        assert_eq!(Level::Fatal.to_string(), "FATAL");
    }

    #[test]
    fn test_timestamp_now_after_is_strictly_increasing() {
        let future = Timestamp::from_nanos(i64::MAX - 10);
        assert_eq!(Timestamp::now_after(future).as_nanos(), i64::MAX - 9);

        let past = Timestamp::from_nanos(0);
        assert!(Timestamp::now_after(past) > past);
    }

    #[test]
    fn test_timestamp_display() {
        let ts = Timestamp::from_nanos(1_000_000_000);
        assert_eq!(ts.to_string(), "1970-01-01T00:00:01.000000Z");
        assert_eq!(Timestamp::from_nanos(5).nanos_since(Timestamp::from_nanos(9)), 0);
    }

    fn field_value() -> impl Strategy<Value = FieldValue> {
        prop_oneof![
            any::<bool>().prop_map(FieldValue::Bool),
            any::<i64>().prop_map(FieldValue::Int),
            (-1.0e12f64..1.0e12f64).prop_map(FieldValue::Float),
            "[a-zA-Z0-9 ]{0,16}".prop_map(FieldValue::Str),
        ]
    }

    fn record() -> impl Strategy<Value = LogRecord> {
        (
            any::<u64>(),
            any::<i64>(),
            1u8..=6,
            "\\PC{0,64}",
            proptest::collection::btree_map("[a-z_]{1,8}", field_value(), 0..6),
        )
            .prop_map(|(seq, ts, level, message, fields)| {
                let mut record = LogRecord::new(
                    seq,
                    Timestamp::from_nanos(ts),
                    Level::try_from(level).unwrap(),
                    message,
                );
                for (key, value) in fields {
                    record = record.with_field(key, value);
                }
                record
            })
    }

    proptest! {
        #[test]
        fn prop_payload_roundtrip(record in record()) {
            let payload = record.encode_payload(&Utf8Codec).unwrap();
            let decoded = LogRecord::decode_payload(&payload, &Utf8Codec).unwrap();
            prop_assert_eq!(decoded, record);
        }
    }
}
