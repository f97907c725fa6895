//! Message envelope and the codec that maps it onto stream entry fields.
//!
//! Every stream entry produced by this crate carries an [`Envelope`]: a set of
//! delivery [`Headers`] plus an application payload. The [`Codec`] trait owns
//! the flat field layout; consumers treat the field map opaquely.

use crate::error::CodecError;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Flat string field map, the shape a stream entry stores.
pub type FieldMap = BTreeMap<String, String>;

/// Current time as epoch milliseconds.
pub(crate) fn epoch_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Delivery headers carried alongside every payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Headers {
    /// Application-defined message kind.
    #[serde(rename = "type")]
    pub kind: String,

    /// Delivery attempt, 0 on first enqueue, incremented on each retry
    /// re-enqueue. Never decreases along a retry chain.
    pub attempt: u32,

    /// Epoch milliseconds when the current stream entry was produced.
    /// Refreshed on retry re-enqueue.
    pub enqueued_at: i64,

    /// Optional idempotency key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    /// Optional trace id, propagated unchanged through retries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

impl Headers {
    /// Headers for a freshly produced message.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            attempt: 0,
            enqueued_at: epoch_ms(),
            key: None,
            trace_id: None,
        }
    }

    pub fn with_key(mut self, key: Option<String>) -> Self {
        self.key = key;
        self
    }

    pub fn with_trace_id(mut self, trace_id: Option<String>) -> Self {
        self.trace_id = trace_id;
        self
    }

    /// Headers for the retry successor of this delivery: attempt bumped,
    /// enqueue timestamp refreshed, everything else carried over.
    pub fn next_attempt(&self) -> Self {
        Self {
            kind: self.kind.clone(),
            attempt: self.attempt + 1,
            enqueued_at: epoch_ms(),
            key: self.key.clone(),
            trace_id: self.trace_id.clone(),
        }
    }
}

/// The `{headers, payload}` unit exchanged between producer and consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope<P> {
    pub headers: Headers,
    pub payload: P,
}

impl<P> Envelope<P> {
    pub fn new(headers: Headers, payload: P) -> Self {
        Self { headers, payload }
    }
}

/// Encodes an envelope into a flat field map and back.
///
/// `decode` must round-trip any output of `encode`. Codecs are pure and do no
/// I/O.
pub trait Codec<P>: Send + Sync {
    fn encode(&self, envelope: &Envelope<P>) -> Result<FieldMap, CodecError>;
    fn decode(&self, fields: &FieldMap) -> Result<Envelope<P>, CodecError>;
}

/// Default layout: headers and payload serialized as independent JSON strings
/// under the `headers` and `payload` fields.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl JsonCodec {
    pub const HEADERS_FIELD: &'static str = "headers";
    pub const PAYLOAD_FIELD: &'static str = "payload";
}

impl<P> Codec<P> for JsonCodec
where
    P: Serialize + DeserializeOwned + Send + Sync,
{
    fn encode(&self, envelope: &Envelope<P>) -> Result<FieldMap, CodecError> {
        let headers = serde_json::to_string(&envelope.headers).map_err(|source| {
            CodecError::Malformed {
                field: Self::HEADERS_FIELD,
                source,
            }
        })?;
        let payload = serde_json::to_string(&envelope.payload).map_err(|source| {
            CodecError::Malformed {
                field: Self::PAYLOAD_FIELD,
                source,
            }
        })?;

        let mut fields = FieldMap::new();
        fields.insert(Self::HEADERS_FIELD.to_string(), headers);
        fields.insert(Self::PAYLOAD_FIELD.to_string(), payload);
        Ok(fields)
    }

    fn decode(&self, fields: &FieldMap) -> Result<Envelope<P>, CodecError> {
        let headers_raw = fields
            .get(Self::HEADERS_FIELD)
            .ok_or(CodecError::MissingField(Self::HEADERS_FIELD))?;
        let payload_raw = fields
            .get(Self::PAYLOAD_FIELD)
            .ok_or(CodecError::MissingField(Self::PAYLOAD_FIELD))?;

        let headers: Headers =
            serde_json::from_str(headers_raw).map_err(|source| CodecError::Malformed {
                field: Self::HEADERS_FIELD,
                source,
            })?;
        let payload: P =
            serde_json::from_str(payload_raw).map_err(|source| CodecError::Malformed {
                field: Self::PAYLOAD_FIELD,
                source,
            })?;

        Ok(Envelope { headers, payload })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    struct TestPayload {
        value: String,
        count: u32,
    }

    fn sample_envelope() -> Envelope<TestPayload> {
        Envelope::new(
            Headers::new("test.event"),
            TestPayload {
                value: "hello".to_string(),
                count: 7,
            },
        )
    }

    #[test]
    fn test_round_trip() {
        let codec = JsonCodec;
        let envelope = sample_envelope();

        let fields = codec.encode(&envelope).unwrap();
        let decoded: Envelope<TestPayload> = codec.decode(&fields).unwrap();

        assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_round_trip_with_optional_headers() {
        let codec = JsonCodec;
        let mut envelope = sample_envelope();
        envelope.headers = envelope
            .headers
            .with_key(Some("order-42".to_string()))
            .with_trace_id(Some("trace-1".to_string()));

        let fields = codec.encode(&envelope).unwrap();
        let decoded: Envelope<TestPayload> = codec.decode(&fields).unwrap();

        assert_eq!(decoded.headers.key.as_deref(), Some("order-42"));
        assert_eq!(decoded.headers.trace_id.as_deref(), Some("trace-1"));
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_header_wire_names() {
        let headers = Headers::new("invoice.created").with_key(Some("k1".to_string()));
        let json = serde_json::to_string(&headers).unwrap();

        assert!(json.contains("\"type\":\"invoice.created\""));
        assert!(json.contains("\"enqueuedAt\""));
        assert!(json.contains("\"attempt\":0"));
        // Absent optionals are omitted entirely
        assert!(!json.contains("traceId"));
    }

    #[test]
    fn test_decode_missing_field() {
        let codec = JsonCodec;
        let mut fields = FieldMap::new();
        fields.insert("payload".to_string(), "{}".to_string());

        let err = Codec::<TestPayload>::decode(&codec, &fields).unwrap_err();
        assert!(matches!(err, CodecError::MissingField("headers")));
    }

    #[test]
    fn test_decode_malformed_payload() {
        let codec = JsonCodec;
        let envelope = sample_envelope();
        let mut fields = codec.encode(&envelope).unwrap();
        fields.insert("payload".to_string(), "not json".to_string());

        let err = Codec::<TestPayload>::decode(&codec, &fields).unwrap_err();
        assert!(matches!(err, CodecError::Malformed { field: "payload", .. }));
    }

    #[test]
    fn test_next_attempt_increments() {
        let headers = Headers::new("msg").with_key(Some("k".to_string()));
        let next = headers.next_attempt();

        assert_eq!(next.attempt, 1);
        assert_eq!(next.kind, headers.kind);
        assert_eq!(next.key, headers.key);
        assert!(next.enqueued_at >= headers.enqueued_at);

        let after = next.next_attempt();
        assert_eq!(after.attempt, 2);
    }
}
