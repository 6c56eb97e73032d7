// Wire envelope model and byte codecs for calls and replies.
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub mod pattern;

pub use pattern::Pattern;

pub type Result<T> = std::result::Result<T, Error>;

/// Reserved error code published when a request names no registered handler.
pub const NO_HANDLER: &str = "no handler registered for pattern";
/// Reserved error code published when inbound request bytes cannot be decoded.
pub const MALFORMED_REQUEST: &str = "malformed request envelope";
/// Status value carried by error reply frames.
pub const STATUS_ERROR: &str = "error";

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to serialize envelope")]
    Serialize(serde_json::Error),
    #[error("failed to deserialize envelope")]
    Deserialize(serde_json::Error),
    #[error("empty payload")]
    EmptyPayload,
}

/// Out-of-band string headers carried next to the payload bytes, never
/// inside them. Ordered so equal header sets always render identically.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Headers(BTreeMap<String, String>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl FromIterator<(String, String)> for Headers {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Structured wire form of a call or reply.
///
/// Absence of `id` marks a fire-and-forget event. Reply frames reuse the
/// same shape: zero or more non-disposed frames followed by exactly one
/// disposed frame per correlation id.
///
/// ```
/// use tether_wire::{Envelope, EnvelopeCodec, JsonCodec};
///
/// let envelope = Envelope::request("r-1", "math.sum", serde_json::json!([1, 2, 3]));
/// let codec = JsonCodec;
/// let bytes = codec.encode(&envelope).expect("encode");
/// let decoded = codec.decode(&bytes).expect("decode");
/// assert_eq!(envelope, decoded);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disposed: Option<bool>,
}

impl Envelope {
    /// Correlated call envelope.
    pub fn request(id: impl Into<String>, pattern: impl Into<String>, data: Value) -> Self {
        Self {
            id: Some(id.into()),
            pattern: Some(pattern.into()),
            data,
            ..Self::default()
        }
    }

    /// Fire-and-forget event envelope. Carries no correlation id.
    pub fn event(pattern: impl Into<String>, data: Value) -> Self {
        Self {
            pattern: Some(pattern.into()),
            data,
            ..Self::default()
        }
    }

    /// Terminal reply frame carrying a single value.
    pub fn reply(id: Option<String>, data: Value) -> Self {
        Self {
            id,
            data,
            disposed: Some(true),
            ..Self::default()
        }
    }

    /// Non-terminal frame of a streamed reply.
    pub fn reply_item(id: Option<String>, data: Value) -> Self {
        Self {
            id,
            data,
            ..Self::default()
        }
    }

    /// Bare terminal frame ending a streamed reply.
    pub fn reply_end(id: Option<String>) -> Self {
        Self {
            id,
            disposed: Some(true),
            ..Self::default()
        }
    }

    /// Terminal error frame.
    pub fn reply_error(id: Option<String>, err: Value) -> Self {
        Self {
            id,
            status: Some(STATUS_ERROR.to_string()),
            err: Some(err),
            disposed: Some(true),
            ..Self::default()
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.unwrap_or(false)
    }

    pub fn is_error(&self) -> bool {
        self.err.is_some() || self.status.as_deref() == Some(STATUS_ERROR)
    }

    /// Whether this envelope marks a fire-and-forget event.
    pub fn is_event(&self) -> bool {
        self.id.is_none()
    }
}

/// Pluggable byte codec for envelopes.
pub trait EnvelopeCodec: Send + Sync {
    fn encode(&self, envelope: &Envelope) -> Result<Bytes>;
    fn decode(&self, payload: &[u8]) -> Result<Envelope>;
}

/// Default JSON codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl EnvelopeCodec for JsonCodec {
    fn encode(&self, envelope: &Envelope) -> Result<Bytes> {
        let payload = serde_json::to_vec(envelope).map_err(Error::Serialize)?;
        Ok(Bytes::from(payload))
    }

    fn decode(&self, payload: &[u8]) -> Result<Envelope> {
        // Zero-length payloads are reserved to signal "no response received"
        // and must never decode as a valid value, empty ones included.
        if payload.is_empty() {
            return Err(Error::EmptyPayload);
        }
        serde_json::from_slice(payload).map_err(Error::Deserialize)
    }
}

/// Outbound payload wrapper: the value to send plus optional per-call
/// headers travelling out of band.
///
/// ```
/// use tether_wire::{Headers, Record};
///
/// let mut headers = Headers::new();
/// headers.set("x-version", "1.0.0");
/// let record = Record::builder(serde_json::json!({"items": [1, 2, 3]}))
///     .headers(headers)
///     .build();
/// assert!(record.headers.is_some());
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    pub data: Value,
    pub headers: Option<Headers>,
}

impl Record {
    pub fn builder(data: Value) -> RecordBuilder {
        RecordBuilder {
            data,
            headers: None,
        }
    }
}

impl From<Value> for Record {
    fn from(data: Value) -> Self {
        Self {
            data,
            headers: None,
        }
    }
}

#[derive(Debug, Default)]
pub struct RecordBuilder {
    data: Value,
    headers: Option<Headers>,
}

impl RecordBuilder {
    pub fn headers(mut self, headers: Headers) -> Self {
        self.headers = Some(headers);
        self
    }

    pub fn build(self) -> Record {
        Record {
            data: self.data,
            headers: self.headers,
        }
    }
}

/// Encode an outbound call, lifting headers out of a header-bearing record.
///
/// The record's value becomes the envelope's `data`; its headers are
/// returned out of band for the dispatcher to merge with connection
/// defaults. A bare value travels with no headers at all.
pub fn encode_call<C>(
    codec: &C,
    mut envelope: Envelope,
    payload: Record,
) -> Result<(Bytes, Option<Headers>)>
where
    C: EnvelopeCodec + ?Sized,
{
    envelope.data = payload.data;
    let bytes = codec.encode(&envelope)?;
    Ok((bytes, payload.headers))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_round_trip() {
        let envelope = Envelope::request("r-1", "math.sum", json!([1, 2, 3, 4, 5]));
        let codec = JsonCodec;
        let bytes = codec.encode(&envelope).expect("encode");
        let decoded = codec.decode(&bytes).expect("decode");
        assert_eq!(envelope, decoded);
        assert!(!decoded.is_event());
        assert!(!decoded.is_disposed());
    }

    #[test]
    fn event_envelope_has_no_id() {
        let envelope = Envelope::event("notification", json!(true));
        assert!(envelope.is_event());
        let codec = JsonCodec;
        let bytes = codec.encode(&envelope).expect("encode");
        // The id field is absent on the wire, not null.
        let raw: Value = serde_json::from_slice(&bytes).expect("json");
        assert!(raw.get("id").is_none());
    }

    #[test]
    fn decode_rejects_empty_payload() {
        let err = JsonCodec.decode(b"").expect_err("empty payload");
        assert!(matches!(err, Error::EmptyPayload));
    }

    #[test]
    fn decode_rejects_malformed_payload() {
        let err = JsonCodec.decode(b"{not json").expect_err("malformed");
        assert!(matches!(err, Error::Deserialize(_)));
    }

    #[test]
    fn error_frame_is_terminal() {
        let frame = Envelope::reply_error(Some("r-1".into()), json!({"message": "test"}));
        assert!(frame.is_disposed());
        assert!(frame.is_error());
        assert_eq!(frame.status.as_deref(), Some(STATUS_ERROR));
    }

    #[test]
    fn bare_terminal_frame_carries_no_value() {
        let frame = Envelope::reply_end(Some("r-1".into()));
        assert!(frame.is_disposed());
        assert!(!frame.is_error());
        assert_eq!(frame.data, Value::Null);
    }

    #[test]
    fn encode_call_lifts_record_headers() {
        let mut headers = Headers::new();
        headers.set("x-version", "1.0.0");
        let record = Record::builder(json!({"items": [1]})).headers(headers).build();
        let envelope = Envelope::request("r-1", "record.duplex", Value::Null);
        let (bytes, call_headers) =
            encode_call(&JsonCodec, envelope, record).expect("encode call");

        let decoded = JsonCodec.decode(&bytes).expect("decode");
        assert_eq!(decoded.data, json!({"items": [1]}));
        let call_headers = call_headers.expect("headers");
        assert_eq!(call_headers.get("x-version"), Some("1.0.0"));
    }

    #[test]
    fn encode_call_plain_value_has_no_headers() {
        let envelope = Envelope::request("r-1", "math.sum", Value::Null);
        let (_, headers) =
            encode_call(&JsonCodec, envelope, Record::from(json!([1, 2]))).expect("encode call");
        assert!(headers.is_none());
    }

    #[test]
    fn headers_are_ordered() {
        let mut a = Headers::new();
        a.set("b", "2");
        a.set("a", "1");
        let b: Headers = [
            ("a".to_string(), "1".to_string()),
            ("b".to_string(), "2".to_string()),
        ]
        .into_iter()
        .collect();
        assert_eq!(a, b);
        let keys: Vec<&str> = a.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["a", "b"]);
    }
}
