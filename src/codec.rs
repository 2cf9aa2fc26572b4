//! # Payload Codec
//!
//! Versioned serialization for cached payloads. Every payload carries a
//! one-byte format version so a future codec change can detect and reject old
//! entries instead of silently misinterpreting bytes. Decode failures of any
//! kind are classified as [`CodecError`]; the engine maps them to a cache
//! miss, never a hard failure.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;

/// Current payload format version. Bump on any incompatible encoding change.
pub const PAYLOAD_FORMAT_VERSION: u8 = 1;

/// Deserialization failure: corrupt bytes or an incompatible format version.
#[derive(Debug)]
pub struct CodecError {
    pub message: String,
}

impl CodecError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "payload decode error: {}", self.message)
    }
}

impl std::error::Error for CodecError {}

/// Encode a payload as `[version byte][json bytes]`.
pub fn encode<T: Serialize>(value: &T) -> anyhow::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(64);
    buf.push(PAYLOAD_FORMAT_VERSION);
    serde_json::to_writer(&mut buf, value)?;
    Ok(buf)
}

/// Decode a payload previously produced by [`encode`].
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    let (&version, body) = bytes
        .split_first()
        .ok_or_else(|| CodecError::new("empty payload"))?;
    if version != PAYLOAD_FORMAT_VERSION {
        return Err(CodecError::new(format!(
            "unsupported format version {version} (expected {PAYLOAD_FORMAT_VERSION})"
        )));
    }
    serde_json::from_slice(body).map_err(|e| CodecError::new(e.to_string()))
}
