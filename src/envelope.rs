//! Message envelope codec.
//!
//! Every message exchanged through the broker is wrapped in the same
//! `{event, timestamp, payload}` JSON object. The `event` string is the only
//! dispatch key, so decoding happens in two phases: [`decode`] reads the
//! envelope and keeps the payload as raw JSON, then
//! [`RawEnvelope::decode_payload`] parses it into the shape the event implies.
//!
//! # Wire format
//!
//! ```json
//! {
//!   "event": "journal.index",
//!   "timestamp": "2024-01-01T00:00:00Z",
//!   "correlation_id": "4b1d...",
//!   "payload": { "id": "...", "title": "..." }
//! }
//! ```
//!
//! `correlation_id` is only present on bridge traffic.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use thiserror::Error;

/// Errors produced while encoding or decoding envelopes.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The envelope itself could not be serialized
    #[error("failed to encode '{event}' envelope: {source}")]
    Encode {
        event: String,
        #[source]
        source: serde_json::Error,
    },

    /// The bytes are not a well-formed envelope
    #[error("malformed envelope: {0}")]
    Envelope(#[source] serde_json::Error),

    /// The payload does not have the shape its event requires
    #[error("payload of '{event}' is not a valid {shape}: {source}")]
    Payload {
        event: String,
        shape: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Serialize)]
struct OutboundEnvelope<'a, P: ?Sized> {
    event: &'a str,
    timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    correlation_id: Option<&'a str>,
    payload: &'a P,
}

/// Encode an envelope for `event` with a producer-assigned timestamp.
pub fn encode<P: Serialize + ?Sized>(
    event: &str,
    timestamp: DateTime<Utc>,
    payload: &P,
) -> Result<Vec<u8>, CodecError> {
    encode_correlated(event, timestamp, None, payload)
}

/// Encode an envelope that carries a bridge correlation id.
pub fn encode_correlated<P: Serialize + ?Sized>(
    event: &str,
    timestamp: DateTime<Utc>,
    correlation_id: Option<&str>,
    payload: &P,
) -> Result<Vec<u8>, CodecError> {
    let envelope = OutboundEnvelope {
        event,
        timestamp,
        correlation_id,
        payload,
    };

    serde_json::to_vec(&envelope).map_err(|source| CodecError::Encode {
        event: event.to_string(),
        source,
    })
}

/// A decoded envelope whose payload has not been interpreted yet.
#[derive(Debug, Deserialize)]
pub struct RawEnvelope {
    /// Dot-separated dispatch key, e.g. `user_journal.create`
    pub event: String,

    /// When the producer created the message
    pub timestamp: DateTime<Utc>,

    /// Present on request/response traffic only
    #[serde(default)]
    pub correlation_id: Option<String>,

    /// Payload exactly as it appeared on the wire
    pub payload: Box<RawValue>,
}

impl RawEnvelope {
    /// Parse the payload into the shape the event requires.
    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        decode_payload(&self.event, &self.payload)
    }

    /// The payload bytes, untouched.
    pub fn raw_payload(&self) -> &str {
        self.payload.get()
    }
}

/// First decoding phase: read the envelope and keep the payload raw.
pub fn decode(bytes: &[u8]) -> Result<RawEnvelope, CodecError> {
    serde_json::from_slice(bytes).map_err(CodecError::Envelope)
}

/// Second decoding phase: interpret a raw payload as `T`.
///
/// A payload missing fields `T` requires is an error; nothing is filled in
/// with defaults unless `T` declares them.
pub fn decode_payload<T: DeserializeOwned>(event: &str, raw: &RawValue) -> Result<T, CodecError> {
    serde_json::from_str(raw.get()).map_err(|source| CodecError::Payload {
        event: event.to_string(),
        shape: short_type_name::<T>(),
        source,
    })
}

fn short_type_name<T>() -> &'static str {
    let full = std::any::type_name::<T>();
    full.rsplit("::").next().unwrap_or(full)
}
