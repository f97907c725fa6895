//! Configuration for producers, consumer workers, the retry daemon and the
//! standalone pending sweeper.

use std::time::Duration;
use uuid::Uuid;

/// Producer-side idempotency window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProducerIdempotency {
    /// How long a `(stream, type, key)` reservation suppresses duplicates.
    pub ttl: Duration,
}

/// Configuration for a [`Producer`](crate::Producer).
#[derive(Debug, Clone)]
pub struct ProducerConfig {
    /// Target stream name.
    pub stream: String,

    /// Message kind used when `send` is not given one (falls back to `"msg"`
    /// when unset).
    pub default_kind: Option<String>,

    /// Enable the atomic reserve-and-append dedup path for keyed sends.
    pub idempotency: Option<ProducerIdempotency>,

    /// Approximate maximum stream length; older entries are trimmed away.
    pub max_length: Option<u64>,
}

impl ProducerConfig {
    pub fn new(stream: impl Into<String>) -> Self {
        Self {
            stream: stream.into(),
            default_kind: None,
            idempotency: None,
            max_length: None,
        }
    }

    pub fn with_default_kind(mut self, kind: impl Into<String>) -> Self {
        self.default_kind = Some(kind.into());
        self
    }

    pub fn with_idempotency(mut self, ttl: Duration) -> Self {
        self.idempotency = Some(ProducerIdempotency { ttl });
        self
    }

    pub fn with_max_length(mut self, max_length: u64) -> Self {
        self.max_length = Some(max_length);
        self
    }

    /// Reservation key for a keyed send: `idempotency:<stream>:<type>:<key>`.
    pub fn idempotency_key(&self, kind: &str, key: &str) -> String {
        format!("idempotency:{}:{}:{}", self.stream, kind, key)
    }
}

/// Read-batch tuning for the consumer read loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchConfig {
    /// Maximum entries fetched per read.
    pub count: usize,
    /// Blocking wait when no entries are available.
    pub block: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            count: 16,
            block: Duration::from_millis(2_000),
        }
    }
}

/// Pending-entry recovery tuning for the in-worker claim loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClaimConfig {
    pub enabled: bool,
    /// Minimum idle time before a delivery is considered abandoned.
    pub min_idle: Duration,
    /// Cap on reclaimed entries per tick.
    pub max_per_tick: usize,
    /// Cadence of the claim loop.
    pub interval: Duration,
}

impl Default for ClaimConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_idle: Duration::from_secs(30),
            max_per_tick: 128,
            interval: Duration::from_millis(1_000),
        }
    }
}

/// How retry terminals are re-enqueued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scheduling {
    /// Park the successor in a retry sorted set (default `<stream>:retry`)
    /// until its due time; the retry daemon re-appends it.
    Zset { retry_zset: Option<String> },
    /// Re-append straight onto the stream, ignoring the computed delay.
    Immediate,
}

impl Default for Scheduling {
    fn default() -> Self {
        Self::Zset { retry_zset: None }
    }
}

/// Handler-level idempotency windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerIdempotency {
    /// TTL of the `PENDING:<consumer>` reservation while a handler runs.
    pub pending_ttl: Duration,
    /// TTL of the `DONE` marker after a successful ack.
    pub done_ttl: Duration,
}

/// Configuration for a consumer [`Worker`](crate::Worker).
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Stream to consume.
    pub stream: String,

    /// Consumer group name.
    pub group: String,

    /// Consumer name within the group (auto-generated if not provided).
    pub consumer: String,

    pub batch: BatchConfig,

    pub scheduling: Scheduling,

    pub claim: ClaimConfig,

    pub idempotency: Option<ConsumerIdempotency>,
}

impl WorkerConfig {
    pub fn new(stream: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            stream: stream.into(),
            group: group.into(),
            consumer: format!("worker-{}", Uuid::new_v4()),
            batch: BatchConfig::default(),
            scheduling: Scheduling::default(),
            claim: ClaimConfig::default(),
            idempotency: None,
        }
    }

    pub fn with_consumer(mut self, consumer: impl Into<String>) -> Self {
        self.consumer = consumer.into();
        self
    }

    pub fn with_batch(mut self, count: usize, block: Duration) -> Self {
        self.batch = BatchConfig { count, block };
        self
    }

    pub fn with_scheduling(mut self, scheduling: Scheduling) -> Self {
        self.scheduling = scheduling;
        self
    }

    pub fn with_claim(mut self, claim: ClaimConfig) -> Self {
        self.claim = claim;
        self
    }

    pub fn without_claim(mut self) -> Self {
        self.claim.enabled = false;
        self
    }

    pub fn with_idempotency(mut self, pending_ttl: Duration, done_ttl: Duration) -> Self {
        self.idempotency = Some(ConsumerIdempotency {
            pending_ttl,
            done_ttl,
        });
        self
    }

    /// Name of the retry sorted set (default `<stream>:retry`).
    pub fn retry_zset(&self) -> String {
        match &self.scheduling {
            Scheduling::Zset {
                retry_zset: Some(name),
            } => name.clone(),
            _ => format!("{}:retry", self.stream),
        }
    }

    /// Name of the dead-letter stream: `<stream>:dlq`.
    pub fn dlq_stream(&self) -> String {
        format!("{}:dlq", self.stream)
    }

    /// Handler idempotency key: `consumed:<stream>:<key>`.
    pub fn consumed_key(&self, key: &str) -> String {
        format!("consumed:{}:{}", self.stream, key)
    }
}

/// How the retry daemon takes ownership of due members.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DrainStrategy {
    /// Pop the smallest score; re-insert on overshoot.
    #[default]
    PopMin,
    /// Range-read due members, then own only those actually removed.
    RangeRemove,
}

/// Configuration for the [`RetryDaemon`](crate::RetryDaemon).
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Sorted set holding delayed entries.
    pub retry_zset: String,

    /// Stream to append to when a member does not name one.
    pub target_stream: String,

    /// Cap on members drained per tick.
    pub max_batch: usize,

    /// Base tick cadence.
    pub tick: Duration,

    /// Relative tick jitter, `0.2` = ±20%.
    pub jitter_pct: f64,

    pub strategy: DrainStrategy,
}

impl DaemonConfig {
    pub fn new(retry_zset: impl Into<String>, target_stream: impl Into<String>) -> Self {
        Self {
            retry_zset: retry_zset.into(),
            target_stream: target_stream.into(),
            max_batch: 256,
            tick: Duration::from_millis(250),
            jitter_pct: 0.2,
            strategy: DrainStrategy::default(),
        }
    }

    pub fn with_max_batch(mut self, max_batch: usize) -> Self {
        self.max_batch = max_batch;
        self
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn with_jitter_pct(mut self, jitter_pct: f64) -> Self {
        self.jitter_pct = jitter_pct;
        self
    }

    pub fn with_strategy(mut self, strategy: DrainStrategy) -> Self {
        self.strategy = strategy;
        self
    }
}

/// Configuration for the standalone [`PendingSweeper`](crate::PendingSweeper).
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    pub stream: String,
    pub group: String,
    /// Consumer the swept entries are assigned to.
    pub consumer: String,
    pub min_idle: Duration,
    pub max_per_tick: usize,
    pub interval: Duration,
}

impl SweeperConfig {
    pub fn new(
        stream: impl Into<String>,
        group: impl Into<String>,
        consumer: impl Into<String>,
    ) -> Self {
        Self {
            stream: stream.into(),
            group: group.into(),
            consumer: consumer.into(),
            min_idle: Duration::from_secs(30),
            max_per_tick: 128,
            interval: Duration::from_millis(1_000),
        }
    }

    pub fn with_min_idle(mut self, min_idle: Duration) -> Self {
        self.min_idle = min_idle;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_defaults() {
        let config = WorkerConfig::new("orders", "billing");

        assert_eq!(config.stream, "orders");
        assert_eq!(config.group, "billing");
        assert!(config.consumer.starts_with("worker-"));
        assert_eq!(config.batch.count, 16);
        assert_eq!(config.batch.block, Duration::from_millis(2_000));
        assert!(config.claim.enabled);
        assert_eq!(config.claim.max_per_tick, 128);
        assert_eq!(config.claim.interval, Duration::from_millis(1_000));
        assert!(config.idempotency.is_none());
    }

    #[test]
    fn test_worker_derived_names() {
        let config = WorkerConfig::new("orders", "billing");
        assert_eq!(config.retry_zset(), "orders:retry");
        assert_eq!(config.dlq_stream(), "orders:dlq");
        assert_eq!(config.consumed_key("k1"), "consumed:orders:k1");

        let named = config.with_scheduling(Scheduling::Zset {
            retry_zset: Some("orders:delayed".to_string()),
        });
        assert_eq!(named.retry_zset(), "orders:delayed");
    }

    #[test]
    fn test_worker_builder() {
        let config = WorkerConfig::new("orders", "billing")
            .with_consumer("worker-1")
            .with_batch(50, Duration::from_millis(1_000))
            .without_claim()
            .with_idempotency(Duration::from_secs(30), Duration::from_secs(3_600));

        assert_eq!(config.consumer, "worker-1");
        assert_eq!(config.batch.count, 50);
        assert!(!config.claim.enabled);
        let idem = config.idempotency.unwrap();
        assert_eq!(idem.pending_ttl, Duration::from_secs(30));
        assert_eq!(idem.done_ttl, Duration::from_secs(3_600));
    }

    #[test]
    fn test_producer_idempotency_key() {
        let config = ProducerConfig::new("orders").with_default_kind("order.created");
        assert_eq!(
            config.idempotency_key("order.created", "o-42"),
            "idempotency:orders:order.created:o-42"
        );
    }

    #[test]
    fn test_daemon_defaults() {
        let config = DaemonConfig::new("orders:retry", "orders");

        assert_eq!(config.max_batch, 256);
        assert_eq!(config.tick, Duration::from_millis(250));
        assert!((config.jitter_pct - 0.2).abs() < f64::EPSILON);
        assert_eq!(config.strategy, DrainStrategy::PopMin);
    }
}
