//! Producer: serialize an envelope and append it to the target stream.
//!
//! With idempotency configured and a key on the send, the append goes through
//! the client's atomic reserve-and-append script so that at most one entry is
//! created per `(stream, type, key)` within the TTL window.

use crate::client::StreamClient;
use crate::config::ProducerConfig;
use crate::envelope::{Codec, Envelope, Headers};
use crate::error::QueueError;
use std::sync::Arc;
use tracing::{debug, warn};

/// Per-send options.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Message kind; falls back to the producer's default, then `"msg"`.
    pub kind: Option<String>,
    /// Idempotency key; activates the dedup path when the producer has
    /// idempotency configured.
    pub key: Option<String>,
    /// Trace id propagated unchanged through the message's lifetime.
    pub trace_id: Option<String>,
}

impl SendOptions {
    pub fn kind(kind: impl Into<String>) -> Self {
        Self {
            kind: Some(kind.into()),
            ..Self::default()
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }
}

/// Outcome of a send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendReceipt {
    /// A new entry was appended.
    Enqueued { id: String },
    /// A keyed duplicate; the id of the previously appended entry.
    Deduplicated { id: String },
    /// Another producer holds the reservation but has not finished its
    /// append yet.
    InFlight,
}

impl SendReceipt {
    /// The stream id, when one is known.
    pub fn id(&self) -> Option<&str> {
        match self {
            Self::Enqueued { id } | Self::Deduplicated { id } => Some(id),
            Self::InFlight => None,
        }
    }
}

/// Appends typed payloads to a stream.
pub struct Producer<P> {
    client: Arc<dyn StreamClient>,
    codec: Arc<dyn Codec<P>>,
    config: ProducerConfig,
}

impl<P> Producer<P>
where
    P: Send + Sync,
{
    pub fn new(
        client: Arc<dyn StreamClient>,
        codec: Arc<dyn Codec<P>>,
        config: ProducerConfig,
    ) -> Self {
        Self {
            client,
            codec,
            config,
        }
    }

    pub fn stream(&self) -> &str {
        &self.config.stream
    }

    /// Send one payload.
    pub async fn send(&self, payload: P, opts: SendOptions) -> Result<SendReceipt, QueueError> {
        let kind = opts
            .kind
            .or_else(|| self.config.default_kind.clone())
            .unwrap_or_else(|| "msg".to_string());
        let headers = Headers::new(kind)
            .with_key(opts.key)
            .with_trace_id(opts.trace_id);
        let envelope = Envelope::new(headers, payload);
        let fields = self.codec.encode(&envelope)?;

        if let (Some(idempotency), Some(key)) = (&self.config.idempotency, &envelope.headers.key) {
            if let Some(scripts) = self.client.scripts() {
                let reservation_key = self
                    .config
                    .idempotency_key(&envelope.headers.kind, key);
                let reservation = scripts
                    .reserve_and_append(
                        &reservation_key,
                        idempotency.ttl,
                        &self.config.stream,
                        &fields,
                    )
                    .await?;

                let receipt = if reservation.created {
                    SendReceipt::Enqueued {
                        id: reservation.value,
                    }
                } else if reservation.value == "PENDING" {
                    SendReceipt::InFlight
                } else {
                    SendReceipt::Deduplicated {
                        id: reservation.value,
                    }
                };
                debug!(
                    stream = %self.config.stream,
                    key = %key,
                    receipt = ?receipt.id(),
                    "Keyed send completed"
                );
                return Ok(receipt);
            }
            debug!("Script capability absent, sending without producer idempotency");
        }

        let id = self.client.append(&self.config.stream, &fields).await?;
        self.trim_if_configured().await;

        debug!(
            stream = %self.config.stream,
            message_id = %id,
            "Added message to stream"
        );
        Ok(SendReceipt::Enqueued { id })
    }

    /// Send several payloads under the same options, returning the receipts
    /// in order.
    pub async fn send_batch(
        &self,
        payloads: Vec<P>,
        opts: SendOptions,
    ) -> Result<Vec<SendReceipt>, QueueError> {
        let mut receipts = Vec::with_capacity(payloads.len());
        for payload in payloads {
            receipts.push(self.send(payload, opts.clone()).await?);
        }
        Ok(receipts)
    }

    /// Current length of the target stream.
    pub async fn stream_length(&self) -> Result<u64, QueueError> {
        self.client.len(&self.config.stream).await
    }

    async fn trim_if_configured(&self) {
        if let Some(max_length) = self.config.max_length
            && let Err(e) = self.client.trim(&self.config.stream, max_length).await
        {
            warn!(stream = %self.config.stream, error = %e, "Stream trim failed");
        }
    }
}

impl<P> Clone for Producer<P> {
    fn clone(&self) -> Self {
        Self {
            client: Arc::clone(&self.client),
            codec: Arc::clone(&self.codec),
            config: self.config.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MemoryStreamClient;
    use crate::envelope::JsonCodec;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct TestPayload {
        value: String,
    }

    fn producer(client: MemoryStreamClient, config: ProducerConfig) -> Producer<TestPayload> {
        Producer::new(Arc::new(client), Arc::new(JsonCodec), config)
    }

    #[tokio::test]
    async fn test_send_appends_envelope() {
        let client = MemoryStreamClient::new();
        let producer = producer(client.clone(), ProducerConfig::new("orders"));

        let receipt = producer
            .send(
                TestPayload {
                    value: "hello".into(),
                },
                SendOptions::kind("order.created"),
            )
            .await
            .unwrap();

        assert!(matches!(receipt, SendReceipt::Enqueued { .. }));
        assert_eq!(producer.stream_length().await.unwrap(), 1);

        let entries = client.entries("orders");
        let headers: crate::Headers =
            serde_json::from_str(entries[0].fields.get("headers").unwrap()).unwrap();
        assert_eq!(headers.kind, "order.created");
        assert_eq!(headers.attempt, 0);
        assert!(headers.key.is_none());
    }

    #[tokio::test]
    async fn test_send_falls_back_to_default_kind() {
        let client = MemoryStreamClient::new();
        let producer = producer(
            client.clone(),
            ProducerConfig::new("orders").with_default_kind("order.default"),
        );

        producer
            .send(TestPayload { value: "x".into() }, SendOptions::default())
            .await
            .unwrap();

        let entries = client.entries("orders");
        let headers: crate::Headers =
            serde_json::from_str(entries[0].fields.get("headers").unwrap()).unwrap();
        assert_eq!(headers.kind, "order.default");
    }

    #[tokio::test]
    async fn test_send_without_any_kind_uses_msg() {
        let client = MemoryStreamClient::new();
        let producer = producer(client.clone(), ProducerConfig::new("orders"));

        producer
            .send(TestPayload { value: "x".into() }, SendOptions::default())
            .await
            .unwrap();

        let headers: crate::Headers =
            serde_json::from_str(client.entries("orders")[0].fields.get("headers").unwrap())
                .unwrap();
        assert_eq!(headers.kind, "msg");
    }

    #[tokio::test]
    async fn test_keyed_send_deduplicates() {
        let client = MemoryStreamClient::new();
        let producer = producer(
            client.clone(),
            ProducerConfig::new("orders")
                .with_default_kind("order.created")
                .with_idempotency(std::time::Duration::from_secs(60)),
        );

        let opts = SendOptions::default().with_key("o-42");
        let first = producer
            .send(TestPayload { value: "a".into() }, opts.clone())
            .await
            .unwrap();
        let second = producer
            .send(TestPayload { value: "a".into() }, opts)
            .await
            .unwrap();

        let SendReceipt::Enqueued { id: first_id } = first else {
            panic!("expected enqueued, got {first:?}");
        };
        let SendReceipt::Deduplicated { id: second_id } = second else {
            panic!("expected deduplicated, got {second:?}");
        };
        assert_eq!(first_id, second_id);
        assert_eq!(producer.stream_length().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_keyed_send_degrades_without_scripts() {
        let client = MemoryStreamClient::new().without_scripts();
        let producer = producer(
            client.clone(),
            ProducerConfig::new("orders").with_idempotency(std::time::Duration::from_secs(60)),
        );

        let opts = SendOptions::kind("order.created").with_key("o-42");
        producer
            .send(TestPayload { value: "a".into() }, opts.clone())
            .await
            .unwrap();
        producer
            .send(TestPayload { value: "a".into() }, opts)
            .await
            .unwrap();

        // No dedup without the script capability; both sends land.
        assert_eq!(producer.stream_length().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_send_batch_preserves_order() {
        let client = MemoryStreamClient::new();
        let producer = producer(client.clone(), ProducerConfig::new("orders"));

        let receipts = producer
            .send_batch(
                vec![
                    TestPayload { value: "1".into() },
                    TestPayload { value: "2".into() },
                    TestPayload { value: "3".into() },
                ],
                SendOptions::kind("order.created"),
            )
            .await
            .unwrap();

        assert_eq!(receipts.len(), 3);
        let entries = client.entries("orders");
        let values: Vec<String> = entries
            .iter()
            .map(|e| {
                let payload: TestPayload =
                    serde_json::from_str(e.fields.get("payload").unwrap()).unwrap();
                payload.value
            })
            .collect();
        assert_eq!(values, vec!["1", "2", "3"]);
    }

    #[tokio::test]
    async fn test_max_length_trims() {
        let client = MemoryStreamClient::new();
        let producer = producer(
            client.clone(),
            ProducerConfig::new("orders").with_max_length(2),
        );

        for i in 0..4 {
            producer
                .send(
                    TestPayload {
                        value: i.to_string(),
                    },
                    SendOptions::default(),
                )
                .await
                .unwrap();
        }

        assert_eq!(producer.stream_length().await.unwrap(), 2);
    }
}
