//! Error types for queue operations.

use thiserror::Error;

/// Errors that can occur while talking to the stream server or while
/// encoding/decoding envelopes.
#[derive(Error, Debug)]
pub enum QueueError {
    /// Redis connection or command error.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// JSON serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Envelope codec error.
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Consumer group error.
    #[error("Consumer group error: {0}")]
    ConsumerGroup(String),

    /// The client does not provide an optional capability.
    #[error("Client capability not available: {0}")]
    Unsupported(&'static str),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl QueueError {
    /// Check if this is a "group already exists" error (BUSYGROUP).
    pub fn is_busygroup(&self) -> bool {
        match self {
            Self::Redis(e) => e.to_string().contains("BUSYGROUP"),
            Self::ConsumerGroup(s) => s.contains("BUSYGROUP"),
            _ => false,
        }
    }

    /// Check if this is a consumer group missing error (NOGROUP).
    pub fn is_nogroup(&self) -> bool {
        match self {
            Self::Redis(e) => e.to_string().contains("NOGROUP"),
            Self::ConsumerGroup(s) => s.contains("NOGROUP"),
            _ => false,
        }
    }

    /// Check if this is a timeout error.
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Redis(e) => {
                let err_str = e.to_string().to_lowercase();
                err_str.contains("timeout") || err_str.contains("timed out")
            }
            _ => false,
        }
    }
}

/// Errors produced by an envelope codec.
#[derive(Error, Debug)]
pub enum CodecError {
    /// A required field is absent from the stream entry.
    #[error("missing '{0}' field in stream entry")]
    MissingField(&'static str),

    /// A field exists but does not deserialize.
    #[error("malformed '{field}' field: {source}")]
    Malformed {
        field: &'static str,
        #[source]
        source: serde_json::Error,
    },
}
