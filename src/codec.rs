//! Binary wire envelope for bus transport and observer delivery, and the
//! type-code registry observers use to decode payloads.
//!
//! Layout (all integers big-endian):
//!
//! ```text
//! u8   format (= 1)
//! u16  type_code length, then UTF-8 type code
//! u16  actor_id length,  then actor id bytes (JSON of the key)
//! u32  base length,      then 16-byte EventBase
//! u32  event length,     then event payload (JSON)
//! ```

use std::collections::HashMap;
use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Serialize, de::DeserializeOwned};

use crate::error::CodecError;
use crate::event::{EventBase, EventRecord};

/// Format byte written at the head of every envelope.
pub const WIRE_FORMAT_V1: u8 = 1;

/// A serialized event as it travels over the bus and into observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireEnvelope {
    pub type_code: String,
    pub actor_id: Bytes,
    pub base: EventBase,
    pub event_bytes: Bytes,
}

impl WireEnvelope {
    /// Build an envelope from a stored record, encoding the key as JSON.
    pub fn from_record<K: Serialize>(record: &EventRecord<K>) -> Result<Self, CodecError> {
        Ok(Self {
            type_code: record.type_code.clone(),
            actor_id: Bytes::from(serde_json::to_vec(&record.state_id)?),
            base: record.base,
            event_bytes: record.payload.clone(),
        })
    }

    /// Decode the actor id back into the aggregate key.
    pub fn actor_id<K: DeserializeOwned>(&self) -> Result<K, CodecError> {
        Ok(serde_json::from_slice(&self.actor_id)?)
    }

    /// Serialize to the length-prefixed binary layout.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::FieldTooLarge`] if a field exceeds its length
    /// prefix.
    pub fn encode(&self) -> Result<Bytes, CodecError> {
        let type_code = self.type_code.as_bytes();
        let type_len = u16::try_from(type_code.len()).map_err(|_| CodecError::FieldTooLarge {
            field: "type_code",
            len: type_code.len(),
        })?;
        let actor_len =
            u16::try_from(self.actor_id.len()).map_err(|_| CodecError::FieldTooLarge {
                field: "actor_id",
                len: self.actor_id.len(),
            })?;
        let event_len =
            u32::try_from(self.event_bytes.len()).map_err(|_| CodecError::FieldTooLarge {
                field: "event_bytes",
                len: self.event_bytes.len(),
            })?;

        let mut buf = BytesMut::with_capacity(
            1 + 2
                + type_code.len()
                + 2
                + self.actor_id.len()
                + 4
                + EventBase::ENCODED_LEN
                + 4
                + self.event_bytes.len(),
        );
        buf.put_u8(WIRE_FORMAT_V1);
        buf.put_u16(type_len);
        buf.put_slice(type_code);
        buf.put_u16(actor_len);
        buf.put_slice(&self.actor_id);
        buf.put_u32(EventBase::ENCODED_LEN as u32);
        buf.put_slice(&self.base.to_bytes());
        buf.put_u32(event_len);
        buf.put_slice(&self.event_bytes);
        Ok(buf.freeze())
    }

    /// Parse an envelope produced by [`encode`](Self::encode).
    ///
    /// # Errors
    ///
    /// Fails on an unknown format byte, a truncated buffer, a non-UTF-8
    /// type code, or trailing bytes.
    pub fn decode(mut input: Bytes) -> Result<Self, CodecError> {
        ensure_remaining(&input, 1)?;
        let format = input.get_u8();
        if format != WIRE_FORMAT_V1 {
            return Err(CodecError::UnsupportedFormat(format));
        }

        ensure_remaining(&input, 2)?;
        let type_len = usize::from(input.get_u16());
        let type_code = take(&mut input, type_len)?;
        let type_code =
            String::from_utf8(type_code.to_vec()).map_err(|_| CodecError::InvalidTypeCode)?;

        ensure_remaining(&input, 2)?;
        let actor_len = usize::from(input.get_u16());
        let actor_id = take(&mut input, actor_len)?;

        ensure_remaining(&input, 4)?;
        let base_len = input.get_u32() as usize;
        let base = EventBase::from_bytes(&take(&mut input, base_len)?)?;

        ensure_remaining(&input, 4)?;
        let event_len = input.get_u32() as usize;
        let event_bytes = take(&mut input, event_len)?;

        if input.has_remaining() {
            return Err(CodecError::TrailingBytes(input.remaining()));
        }

        Ok(Self {
            type_code,
            actor_id,
            base,
            event_bytes,
        })
    }
}

fn ensure_remaining(buf: &Bytes, needed: usize) -> Result<(), CodecError> {
    if buf.remaining() < needed {
        return Err(CodecError::Truncated {
            needed,
            remaining: buf.remaining(),
        });
    }
    Ok(())
}

fn take(buf: &mut Bytes, len: usize) -> Result<Bytes, CodecError> {
    ensure_remaining(buf, len)?;
    Ok(buf.split_to(len))
}

type DecodeFn<E> = fn(&[u8]) -> Result<E, CodecError>;

/// Startup-time map from event type code to decode function.
///
/// Observers consult the registry for every delivered envelope. A code
/// without an entry yields [`CodecError::UnknownTypeCode`], which observers
/// treat as "not for me" and skip.
pub struct EventRegistry<E> {
    decoders: HashMap<String, DecodeFn<E>>,
}

impl<E> EventRegistry<E> {
    pub fn new() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }

    /// Register `decode` for `type_code`, replacing any previous entry.
    pub fn register(&mut self, type_code: impl Into<String>, decode: DecodeFn<E>) -> &mut Self {
        self.decoders.insert(type_code.into(), decode);
        self
    }

    pub fn contains(&self, type_code: &str) -> bool {
        self.decoders.contains_key(type_code)
    }

    /// Decode `payload` with the decoder registered for `type_code`.
    pub fn decode(&self, type_code: &str, payload: &[u8]) -> Result<E, CodecError> {
        let decode = self
            .decoders
            .get(type_code)
            .ok_or_else(|| CodecError::UnknownTypeCode(type_code.to_owned()))?;
        decode(payload)
    }
}

impl<E: DeserializeOwned> EventRegistry<E> {
    /// Registry that decodes each listed code as JSON of `E`.
    ///
    /// Suits adjacently tagged enums, where every variant tag maps to the
    /// same deserializer.
    pub fn json(type_codes: &[&str]) -> Self {
        let mut registry = Self::new();
        for code in type_codes {
            registry.register(*code, |payload| Ok(serde_json::from_slice(payload)?));
        }
        registry
    }
}

impl<E> Default for EventRegistry<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> fmt::Debug for EventRegistry<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut codes: Vec<_> = self.decoders.keys().collect();
        codes.sort();
        f.debug_struct("EventRegistry")
            .field("type_codes", &codes)
            .finish()
    }
}
