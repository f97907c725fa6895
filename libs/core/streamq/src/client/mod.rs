//! Client capability surface over the stream server.
//!
//! The queue core never touches a concrete client type. It depends on
//! [`StreamClient`], a small set of capability traits: the stream operations
//! every deployment needs, plus optional capability groups (pending/claim,
//! sorted sets, key-values, atomic scripts) that a client may or may not
//! provide. Optional capabilities are exposed as nullable accessors;
//! dependents check for presence and degrade when a capability is absent.
//!
//! Two implementations ship with the crate:
//! - [`RedisStreamClient`]: the production client over a Redis/Valkey
//!   connection manager.
//! - [`MemoryStreamClient`]: a complete in-memory implementation used in
//!   tests and local development.

mod memory;
mod redis;

pub use memory::MemoryStreamClient;
pub use redis::RedisStreamClient;

use crate::envelope::FieldMap;
use crate::error::QueueError;
use async_trait::async_trait;
use std::time::Duration;

/// A delivered stream entry: server-assigned id plus its field map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMessage {
    pub id: String,
    pub fields: FieldMap,
}

/// A delivered-but-unacknowledged entry in a group's pending list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    pub id: String,
    pub consumer: String,
    pub idle: Duration,
    pub deliveries: u64,
}

/// Result of an atomic reserve-and-append invocation.
///
/// `created` is true when this call reserved the key and appended the entry;
/// `value` is then the new stream id. Otherwise `value` is whatever the key
/// already held (`"PENDING"` or a previously stored id).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub created: bool,
    pub value: String,
}

/// Required stream operations.
#[async_trait]
pub trait StreamOps: Send + Sync {
    /// Append a field map to a stream, returning the server-assigned id.
    async fn append(&self, stream: &str, fields: &FieldMap) -> Result<String, QueueError>;

    /// Read up to `count` new entries for `consumer` in `group`, blocking up
    /// to `block` when no entries are available. A `None` block returns
    /// immediately.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Option<Duration>,
    ) -> Result<Vec<StreamMessage>, QueueError>;

    /// Acknowledge delivered ids, returning how many were newly acked.
    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<u64, QueueError>;

    /// Create a consumer group cursored at `$`, creating the stream if it
    /// does not exist. Returns false if the group already existed.
    async fn create_group(&self, stream: &str, group: &str) -> Result<bool, QueueError>;

    /// Names of the groups defined on a stream (empty if the stream is
    /// missing).
    async fn group_names(&self, stream: &str) -> Result<Vec<String>, QueueError>;

    /// Number of entries in the stream (0 if the stream is missing).
    async fn len(&self, stream: &str) -> Result<u64, QueueError>;

    /// Trim the stream to approximately `max_len` entries, dropping the
    /// oldest ones.
    async fn trim(&self, stream: &str, max_len: u64) -> Result<(), QueueError>;
}

/// Optional: pending-list inspection and claim (crash recovery).
#[async_trait]
pub trait PendingOps: Send + Sync {
    /// List up to `count` pending entries idle for at least `min_idle`.
    async fn pending(
        &self,
        stream: &str,
        group: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<PendingEntry>, QueueError>;

    /// Transfer ownership of pending `ids` idle for at least `min_idle` to
    /// `consumer`, returning the claimed entries with their fields.
    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[String],
    ) -> Result<Vec<StreamMessage>, QueueError>;
}

/// Optional: sorted-set operations (the retry scheduler's time wheel).
#[async_trait]
pub trait SortedSetOps: Send + Sync {
    /// Insert or update a member with the given score.
    async fn zadd(&self, key: &str, member: &str, score: i64) -> Result<(), QueueError>;

    /// Pop up to `count` members with the smallest scores.
    async fn zpop_min(&self, key: &str, count: usize) -> Result<Vec<(String, i64)>, QueueError>;

    /// Members with score `<= max`, ascending, limited to `limit`.
    async fn zrange_by_score(
        &self,
        key: &str,
        max: i64,
        limit: usize,
    ) -> Result<Vec<String>, QueueError>;

    /// Remove members, returning how many were present.
    async fn zrem(&self, key: &str, members: &[String]) -> Result<u64, QueueError>;
}

/// Optional: plain keys with TTLs (idempotency reservations).
#[async_trait]
pub trait KeyValueOps: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, QueueError>;

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), QueueError>;

    /// Set only if absent. Returns true when the value was set.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, QueueError>;

    async fn del(&self, key: &str) -> Result<(), QueueError>;
}

/// Optional: server-side atomic multi-step operations.
#[async_trait]
pub trait ScriptOps: Send + Sync {
    /// Atomically: reserve `key` with value `"PENDING"` and `ttl` if absent;
    /// on success append `fields` to `stream` and overwrite the key with the
    /// new id, preserving the TTL. Never splits these steps across round
    /// trips.
    async fn reserve_and_append(
        &self,
        key: &str,
        ttl: Duration,
        stream: &str,
        fields: &FieldMap,
    ) -> Result<Reservation, QueueError>;
}

/// The full capability surface. Optional capability groups default to absent.
pub trait StreamClient: StreamOps {
    fn pending_ops(&self) -> Option<&dyn PendingOps> {
        None
    }

    fn sorted_sets(&self) -> Option<&dyn SortedSetOps> {
        None
    }

    fn key_values(&self) -> Option<&dyn KeyValueOps> {
        None
    }

    fn scripts(&self) -> Option<&dyn ScriptOps> {
        None
    }
}
