//! streamq - Typed at-least-once job runner on Valkey/Redis streams
//!
//! A reusable library for running background jobs over a stream server with:
//! - Consumer group support for horizontal scaling
//! - Typed envelopes (`{headers, payload}`) with a pluggable codec
//! - Delayed retries through a sorted-set time wheel and a drain daemon
//! - Dead letter stream for exhausted or unrecoverable messages
//! - Pending-entry recovery for deliveries abandoned by crashed consumers
//! - Producer- and handler-level idempotency windows
//! - Graceful, drain-aware shutdown
//!
//! # Architecture
//!
//! ```text
//! Producer -> stream (jobs)
//!               | (consumer group)
//!             Worker -> Handler -> { ack | retry | dlq }
//!               |                     |        |
//!               |              jobs:retry   jobs:dlq
//!               |                     |
//!               |              RetryDaemon (due entries -> stream)
//!               |
//!             claim loop (idle pending entries -> this consumer)
//! ```
//!
//! # Example Usage
//!
//! ```rust,ignore
//! use streamq::{
//!     Delivery, Handler, JsonCodec, Producer, ProducerConfig, RetryPolicy,
//!     SendOptions, Verdict, Worker, WorkerConfig,
//! };
//!
//! struct Charge;
//!
//! #[async_trait::async_trait]
//! impl Handler<Payment> for Charge {
//!     async fn handle(&self, payment: &Payment, _delivery: &Delivery) -> eyre::Result<Verdict> {
//!         charge(payment).await?;
//!         Ok(Verdict::Ack)
//!     }
//! }
//!
//! let client = Arc::new(RedisStreamClient::connect("redis://localhost:6379").await?);
//! let worker = Worker::new(
//!     client.clone(),
//!     Arc::new(JsonCodec),
//!     Arc::new(Charge),
//!     RetryPolicy::new(5),
//!     WorkerConfig::new("payments", "billing"),
//! );
//! worker.start().await?;
//! ```

mod client;
mod config;
mod envelope;
mod error;
pub mod metrics;
mod producer;
mod retry;
mod scheduler;
mod sweeper;
mod worker;

// Re-export all public types
pub use client::{
    KeyValueOps, MemoryStreamClient, PendingEntry, PendingOps, RedisStreamClient, Reservation,
    ScriptOps, SortedSetOps, StreamClient, StreamMessage, StreamOps,
};
pub use config::{
    BatchConfig, ClaimConfig, ConsumerIdempotency, DaemonConfig, DrainStrategy, ProducerConfig,
    ProducerIdempotency, Scheduling, SweeperConfig, WorkerConfig,
};
pub use envelope::{Codec, Envelope, FieldMap, Headers, JsonCodec};
pub use error::{CodecError, QueueError};
pub use producer::{Producer, SendOptions, SendReceipt};
pub use retry::{Backoff, RetryPolicy, RetryPredicate, Verdict};
pub use scheduler::{RetryDaemon, ScheduledEntry};
pub use sweeper::PendingSweeper;
pub use worker::{Delivery, Handler, StopOptions, Worker};

/// Result type alias for queue operations.
pub type QueueResult<T> = Result<T, QueueError>;
