//! Retry policy: decide what happens to a delivery after its handler fails.
//!
//! The policy is pure. It looks at the current headers (specifically
//! `attempt`) and the handler error, and returns a [`Verdict`]. Callers
//! interpret the delay; the policy never sleeps or performs I/O.

use crate::envelope::Headers;
use rand::RngExt;
use std::sync::Arc;
use std::time::Duration;

/// Final disposition of a handler invocation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Verdict {
    /// Acknowledge the entry; the message is done.
    #[default]
    Ack,
    /// Re-enqueue a successor after the given delay.
    Retry { delay: Duration },
    /// Append to the dead-letter stream with the given reason.
    DeadLetter { reason: String },
}

/// Backoff strategy for retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Fixed delay for every attempt.
    Constant { delay_ms: u64 },

    /// Full jitter: the delay is drawn uniformly from
    /// `[0, min(max_ms, base_ms * 2^attempt)]` inclusive.
    ExponentialJitter { base_ms: u64, max_ms: u64 },
}

impl Backoff {
    /// Compute the delay before re-enqueueing a message currently on
    /// `attempt`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self {
            Self::Constant { delay_ms } => Duration::from_millis(*delay_ms),
            Self::ExponentialJitter { base_ms, max_ms } => {
                let exp = base_ms.saturating_mul(2u64.saturating_pow(attempt));
                let cap = exp.min(*max_ms);
                let jittered = rand::rng().random_range(0..=cap);
                Duration::from_millis(jittered)
            }
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::ExponentialJitter {
            base_ms: 250,
            max_ms: 60_000,
        }
    }
}

/// Predicate deciding whether a handler error is worth retrying at all.
pub type RetryPredicate = Arc<dyn Fn(&eyre::Report) -> bool + Send + Sync>;

/// Maps `(headers, error)` to the next terminal.
///
/// Rules, evaluated in order:
/// 1. error classified non-retryable -> dead-letter `"non-retryable"`;
/// 2. `attempt + 1 >= max_attempts` -> dead-letter `"maxAttempts(<N>)"`;
/// 3. otherwise retry with a delay from the backoff strategy.
#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: Backoff,
    is_retryable: Option<RetryPredicate>,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::default(),
            is_retryable: None,
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Install a retryability classifier. Without one, every error is
    /// considered retryable.
    pub fn with_retryable<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&eyre::Report) -> bool + Send + Sync + 'static,
    {
        self.is_retryable = Some(Arc::new(predicate));
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Decide the terminal for a failed delivery.
    pub fn next(&self, headers: &Headers, error: &eyre::Report) -> Verdict {
        if let Some(predicate) = &self.is_retryable
            && !predicate(error)
        {
            return Verdict::DeadLetter {
                reason: "non-retryable".to_string(),
            };
        }

        let next_attempt = headers.attempt + 1;
        if next_attempt >= self.max_attempts {
            return Verdict::DeadLetter {
                reason: format!("maxAttempts({})", self.max_attempts),
            };
        }

        Verdict::Retry {
            delay: self.backoff.delay_for_attempt(headers.attempt),
        }
    }
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .field("is_retryable", &self.is_retryable.is_some())
            .finish()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5)
    }
}
