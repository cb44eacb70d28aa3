//! Event envelopes, stored records and the encoding helpers shared by the
//! grain, the transaction coordinator and observers.
//!
//! No I/O happens here.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::error::CodecError;

/// Current wall-clock time in Unix epoch milliseconds.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// Version and timestamp of one event.
///
/// Encoded on the wire as 16 big-endian bytes: version then timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventBase {
    /// Position in the aggregate's log, starting at 1.
    pub version: i64,
    /// Unix epoch milliseconds.
    pub timestamp: i64,
}

impl EventBase {
    /// Length of the fixed binary encoding.
    pub const ENCODED_LEN: usize = 16;

    pub fn new(version: i64, timestamp: i64) -> Self {
        Self { version, timestamp }
    }

    /// Encode as 16 big-endian bytes.
    pub fn to_bytes(&self) -> [u8; Self::ENCODED_LEN] {
        let mut out = [0u8; Self::ENCODED_LEN];
        out[..8].copy_from_slice(&self.version.to_be_bytes());
        out[8..].copy_from_slice(&self.timestamp.to_be_bytes());
        out
    }

    /// Decode the 16-byte encoding produced by [`to_bytes`](Self::to_bytes).
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Truncated`] if `bytes` is not exactly 16 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        let raw: [u8; Self::ENCODED_LEN] =
            bytes.try_into().map_err(|_| CodecError::Truncated {
                needed: Self::ENCODED_LEN,
                remaining: bytes.len(),
            })?;
        let mut version = [0u8; 8];
        let mut timestamp = [0u8; 8];
        version.copy_from_slice(&raw[..8]);
        timestamp.copy_from_slice(&raw[8..]);
        Ok(Self {
            version: i64::from_be_bytes(version),
            timestamp: i64::from_be_bytes(timestamp),
        })
    }
}

/// A domain event wrapped with its owner and position.
#[derive(Debug, Clone, PartialEq)]
pub struct FullyEvent<K, E> {
    pub state_id: K,
    pub base: EventBase,
    pub event: E,
}

/// Caller-supplied idempotency token paired with a deterministic timestamp.
///
/// Raising the same event twice with the same `uid` yields exactly one
/// durable event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventUid {
    pub uid: String,
    pub timestamp: i64,
}

impl EventUid {
    pub fn new(uid: impl Into<String>, timestamp: i64) -> Self {
        Self {
            uid: uid.into(),
            timestamp,
        }
    }
}

/// Default idempotency token for an event raised without an [`EventUid`].
pub fn default_unique_id(state_id: &impl std::fmt::Display, version: i64) -> String {
    format!("{state_id}_{version}")
}

/// An event as persisted by an [`EventStore`](crate::ports::EventStore).
///
/// The payload stays serialized; only the grain that owns the aggregate
/// type decodes it.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord<K> {
    pub state_id: K,
    pub base: EventBase,
    /// Adjacently-tagged `type` of the domain event.
    pub type_code: String,
    /// JSON encoding of the full domain event.
    pub payload: Bytes,
    /// Idempotency token the append was keyed by.
    pub unique_id: String,
}

/// A domain event serialized once and reused for storage, bus and
/// observer delivery.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct EncodedEvent {
    pub type_code: String,
    pub payload: Bytes,
}

/// Serialize an adjacently tagged domain event and extract its type code.
///
/// # Errors
///
/// Returns [`CodecError::Json`] if serialization fails, or
/// [`CodecError::MissingTypeTag`] if the event is not an object with a
/// string `type` field.
pub(crate) fn encode_event<E: Serialize>(event: &E) -> Result<EncodedEvent, CodecError> {
    let value = serde_json::to_value(event)?;
    let type_code = value
        .as_object()
        .and_then(|obj| obj.get("type"))
        .and_then(|tag| tag.as_str())
        .ok_or(CodecError::MissingTypeTag)?
        .to_owned();
    let payload = serde_json::to_vec(&value)?;
    Ok(EncodedEvent {
        type_code,
        payload: Bytes::from(payload),
    })
}

/// Decode a JSON payload written by [`encode_event`].
pub(crate) fn decode_event<E: DeserializeOwned>(payload: &[u8]) -> Result<E, CodecError> {
    Ok(serde_json::from_slice(payload)?)
}

impl<K: Clone> EventRecord<K> {
    /// Decode the payload into a [`FullyEvent`].
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Json`] if the payload does not match `E`.
    pub fn decode<E: DeserializeOwned>(&self) -> Result<FullyEvent<K, E>, CodecError> {
        Ok(FullyEvent {
            state_id: self.state_id.clone(),
            base: self.base,
            event: decode_event(&self.payload)?,
        })
    }
}
