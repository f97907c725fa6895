//! Queue observability through the `metrics` facade.
//!
//! The crate only records; installing a recorder/exporter is the embedding
//! process's concern.
//!
//! ## Available metrics
//!
//! - `queue_messages_total` - Counter of handled messages by terminal
//! - `queue_retries_total` - Counter of retry re-enqueues by attempt
//! - `queue_errors_total` - Counter of errors by kind
//! - `queue_in_flight` - Gauge of messages currently being processed

use metrics::{counter, gauge};

/// Metric names as constants for consistency
pub mod names {
    pub const MESSAGES: &str = "queue_messages_total";
    pub const RETRIES: &str = "queue_retries_total";
    pub const ERRORS: &str = "queue_errors_total";
    pub const IN_FLIGHT: &str = "queue_in_flight";
}

/// Terminal applied to a handled message, for labeling.
#[derive(Debug, Clone, Copy)]
pub enum Terminal {
    Acked,
    Retried,
    DeadLettered,
}

impl Terminal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Acked => "ack",
            Self::Retried => "retry",
            Self::DeadLettered => "dlq",
        }
    }
}

/// Error kind for labeling.
#[derive(Debug, Clone, Copy)]
pub enum ErrorKind {
    /// An inbound entry failed to decode.
    Decode,
    /// A client call failed.
    Transport,
    /// A terminal action could not be applied.
    Terminal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Decode => "decode",
            Self::Transport => "transport",
            Self::Terminal => "terminal",
        }
    }
}

/// Record a message reaching its terminal.
pub fn record_message(stream: &str, terminal: Terminal) {
    counter!(
        names::MESSAGES,
        "stream" => stream.to_string(),
        "terminal" => terminal.as_str().to_string()
    )
    .increment(1);
}

/// Record a retry re-enqueue.
pub fn record_retry(stream: &str, attempt: u32) {
    counter!(
        names::RETRIES,
        "stream" => stream.to_string(),
        "attempt" => attempt.to_string()
    )
    .increment(1);
}

/// Record an error by kind.
pub fn record_error(stream: &str, kind: ErrorKind) {
    counter!(
        names::ERRORS,
        "stream" => stream.to_string(),
        "kind" => kind.as_str().to_string()
    )
    .increment(1);
}

/// Update the in-flight gauge.
pub fn set_in_flight(stream: &str, count: f64) {
    gauge!(
        names::IN_FLIGHT,
        "stream" => stream.to_string()
    )
    .set(count);
}
