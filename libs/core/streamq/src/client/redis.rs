//! Redis/Valkey implementation of the client capability surface.
//!
//! All commands go through a cloned [`ConnectionManager`], which reconnects
//! transparently. Blocking group reads translate BLOCK timeouts into empty
//! batches instead of errors.

use super::{
    PendingEntry, PendingOps, KeyValueOps, Reservation, ScriptOps, SortedSetOps, StreamClient,
    StreamMessage, StreamOps,
};
use crate::envelope::FieldMap;
use crate::error::QueueError;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{StreamInfoGroupsReply, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Atomic producer-side idempotency: reserve the key, append the entry,
/// store the resulting id under the reservation without touching its TTL.
const RESERVE_AND_APPEND: &str = r#"
local reserved = redis.call('SET', KEYS[1], 'PENDING', 'PX', ARGV[1], 'NX')
if reserved then
    local id = redis.call('XADD', KEYS[2], '*', unpack(ARGV, 2, #ARGV))
    redis.call('SET', KEYS[1], id, 'KEEPTTL')
    return {1, id}
end
local current = redis.call('GET', KEYS[1])
return {0, current or 'PENDING'}
"#;

/// Production stream client over a Redis/Valkey server.
pub struct RedisStreamClient {
    redis: Arc<ConnectionManager>,
}

impl RedisStreamClient {
    /// Wrap an existing connection manager.
    pub fn new(redis: ConnectionManager) -> Self {
        Self {
            redis: Arc::new(redis),
        }
    }

    /// Open a connection manager against the given URI.
    pub async fn connect(uri: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(uri)?;
        let manager = ConnectionManager::new(client).await?;
        Ok(Self::new(manager))
    }

    fn conn(&self) -> ConnectionManager {
        (*self.redis).clone()
    }
}

/// Extract a UTF-8 string out of a bulk or simple string reply.
fn value_to_string(value: &redis::Value) -> Option<String> {
    match value {
        redis::Value::BulkString(bytes) => Some(String::from_utf8_lossy(bytes).to_string()),
        redis::Value::SimpleString(s) => Some(s.clone()),
        _ => None,
    }
}

/// Convert a typed stream-entry map into our flat field map.
fn field_map_from_entry(map: &HashMap<String, redis::Value>) -> FieldMap {
    let mut fields = FieldMap::new();
    for (key, value) in map {
        if let Some(text) = value_to_string(value) {
            fields.insert(key.clone(), text);
        }
    }
    fields
}

#[async_trait]
impl StreamOps for RedisStreamClient {
    async fn append(&self, stream: &str, fields: &FieldMap) -> Result<String, QueueError> {
        let mut conn = self.conn();

        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream).arg("*");
        for (key, value) in fields {
            cmd.arg(key).arg(value);
        }

        let id: String = cmd.query_async(&mut conn).await?;
        debug!(stream = %stream, message_id = %id, "Appended entry to stream");
        Ok(id)
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Option<Duration>,
    ) -> Result<Vec<StreamMessage>, QueueError> {
        let mut conn = self.conn();

        let mut opts = StreamReadOptions::default()
            .group(group, consumer)
            .count(count);
        if let Some(block) = block {
            opts = opts.block(block.as_millis() as usize);
        }

        let result: Result<StreamReadReply, _> =
            conn.xread_options(&[stream], &[">"], &opts).await;

        match result {
            Ok(reply) => {
                let mut messages = Vec::new();
                for stream_key in reply.keys {
                    for entry in stream_key.ids {
                        messages.push(StreamMessage {
                            id: entry.id,
                            fields: field_map_from_entry(&entry.map),
                        });
                    }
                }
                Ok(messages)
            }
            // BLOCK timeout returns nil - no messages arrived, not an error
            Err(e) => {
                let err_str = e.to_string().to_lowercase();
                if err_str.contains("timeout")
                    || err_str.contains("timed out")
                    || err_str.contains("nil")
                    || (err_str.contains("response") && err_str.contains("type"))
                {
                    Ok(vec![])
                } else {
                    Err(QueueError::Redis(e))
                }
            }
        }
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<u64, QueueError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn();

        let mut cmd = redis::cmd("XACK");
        cmd.arg(stream).arg(group);
        for id in ids {
            cmd.arg(id);
        }

        let acked: u64 = cmd.query_async(&mut conn).await?;
        Ok(acked)
    }

    async fn create_group(&self, stream: &str, group: &str) -> Result<bool, QueueError> {
        let mut conn = self.conn();

        let result: Result<(), redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg("$")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(false),
            Err(e) => Err(QueueError::ConsumerGroup(e.to_string())),
        }
    }

    async fn group_names(&self, stream: &str) -> Result<Vec<String>, QueueError> {
        let mut conn = self.conn();

        let result: Result<StreamInfoGroupsReply, _> = redis::cmd("XINFO")
            .arg("GROUPS")
            .arg(stream)
            .query_async(&mut conn)
            .await;

        match result {
            Ok(reply) => Ok(reply.groups.into_iter().map(|g| g.name).collect()),
            Err(e) if e.to_string().contains("no such key") => Ok(vec![]),
            Err(e) => Err(QueueError::Redis(e)),
        }
    }

    async fn len(&self, stream: &str) -> Result<u64, QueueError> {
        let mut conn = self.conn();

        let length: u64 = redis::cmd("XLEN")
            .arg(stream)
            .query_async(&mut conn)
            .await?;
        Ok(length)
    }

    async fn trim(&self, stream: &str, max_len: u64) -> Result<(), QueueError> {
        let mut conn = self.conn();

        // Approximate trimming (~) lets the server trim on node boundaries
        let _: u64 = redis::cmd("XTRIM")
            .arg(stream)
            .arg("MAXLEN")
            .arg("~")
            .arg(max_len)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl PendingOps for RedisStreamClient {
    async fn pending(
        &self,
        stream: &str,
        group: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<PendingEntry>, QueueError> {
        let mut conn = self.conn();

        let rows: Vec<(String, String, u64, u64)> = redis::cmd("XPENDING")
            .arg(stream)
            .arg(group)
            .arg("IDLE")
            .arg(min_idle.as_millis() as u64)
            .arg("-")
            .arg("+")
            .arg(count)
            .query_async(&mut conn)
            .await?;

        Ok(rows
            .into_iter()
            .map(|(id, consumer, idle_ms, deliveries)| PendingEntry {
                id,
                consumer,
                idle: Duration::from_millis(idle_ms),
                deliveries,
            })
            .collect())
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[String],
    ) -> Result<Vec<StreamMessage>, QueueError> {
        if ids.is_empty() {
            return Ok(vec![]);
        }
        let mut conn = self.conn();

        let mut cmd = redis::cmd("XCLAIM");
        cmd.arg(stream)
            .arg(group)
            .arg(consumer)
            .arg(min_idle.as_millis() as u64);
        for id in ids {
            cmd.arg(id);
        }

        let reply: redis::Value = cmd.query_async(&mut conn).await?;

        let mut messages = Vec::new();
        if let redis::Value::Array(rows) = reply {
            for row in rows {
                // Deleted entries surface as nil rows; skip them
                if let Ok((id, pairs)) =
                    redis::from_redis_value::<(String, Vec<(String, String)>)>(row)
                {
                    messages.push(StreamMessage {
                        id,
                        fields: pairs.into_iter().collect(),
                    });
                }
            }
        }
        Ok(messages)
    }
}

#[async_trait]
impl SortedSetOps for RedisStreamClient {
    async fn zadd(&self, key: &str, member: &str, score: i64) -> Result<(), QueueError> {
        let mut conn = self.conn();

        let _: u64 = redis::cmd("ZADD")
            .arg(key)
            .arg(score)
            .arg(member)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn zpop_min(&self, key: &str, count: usize) -> Result<Vec<(String, i64)>, QueueError> {
        let mut conn = self.conn();

        let popped: Vec<(String, f64)> = redis::cmd("ZPOPMIN")
            .arg(key)
            .arg(count)
            .query_async(&mut conn)
            .await?;

        Ok(popped
            .into_iter()
            .map(|(member, score)| (member, score as i64))
            .collect())
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        max: i64,
        limit: usize,
    ) -> Result<Vec<String>, QueueError> {
        let mut conn = self.conn();

        let members: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(key)
            .arg("-inf")
            .arg(max)
            .arg("LIMIT")
            .arg(0)
            .arg(limit)
            .query_async(&mut conn)
            .await?;
        Ok(members)
    }

    async fn zrem(&self, key: &str, members: &[String]) -> Result<u64, QueueError> {
        if members.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn();

        let mut cmd = redis::cmd("ZREM");
        cmd.arg(key);
        for member in members {
            cmd.arg(member);
        }

        let removed: u64 = cmd.query_async(&mut conn).await?;
        Ok(removed)
    }
}

#[async_trait]
impl KeyValueOps for RedisStreamClient {
    async fn get(&self, key: &str) -> Result<Option<String>, QueueError> {
        let mut conn = self.conn();

        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), QueueError> {
        let mut conn = self.conn();

        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, QueueError> {
        let mut conn = self.conn();

        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .arg("NX")
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn del(&self, key: &str) -> Result<(), QueueError> {
        let mut conn = self.conn();

        let _: u64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(())
    }
}

#[async_trait]
impl ScriptOps for RedisStreamClient {
    async fn reserve_and_append(
        &self,
        key: &str,
        ttl: Duration,
        stream: &str,
        fields: &FieldMap,
    ) -> Result<Reservation, QueueError> {
        let mut conn = self.conn();

        let mut cmd = redis::cmd("EVAL");
        cmd.arg(RESERVE_AND_APPEND)
            .arg(2)
            .arg(key)
            .arg(stream)
            .arg(ttl.as_millis() as u64);
        for (field, value) in fields {
            cmd.arg(field).arg(value);
        }

        let (created, value): (i64, String) = cmd.query_async(&mut conn).await?;
        Ok(Reservation {
            created: created == 1,
            value,
        })
    }
}

impl StreamClient for RedisStreamClient {
    fn pending_ops(&self) -> Option<&dyn PendingOps> {
        Some(self)
    }

    fn sorted_sets(&self) -> Option<&dyn SortedSetOps> {
        Some(self)
    }

    fn key_values(&self) -> Option<&dyn KeyValueOps> {
        Some(self)
    }

    fn scripts(&self) -> Option<&dyn ScriptOps> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_to_string() {
        let bulk = redis::Value::BulkString(b"hello".to_vec());
        assert_eq!(value_to_string(&bulk).as_deref(), Some("hello"));

        let simple = redis::Value::SimpleString("ok".to_string());
        assert_eq!(value_to_string(&simple).as_deref(), Some("ok"));

        assert_eq!(value_to_string(&redis::Value::Nil), None);
    }

    #[test]
    fn test_field_map_from_entry() {
        let mut map = HashMap::new();
        map.insert(
            "headers".to_string(),
            redis::Value::BulkString(b"{}".to_vec()),
        );
        map.insert("skip".to_string(), redis::Value::Nil);

        let fields = field_map_from_entry(&map);
        assert_eq!(fields.get("headers").map(String::as_str), Some("{}"));
        assert!(!fields.contains_key("skip"));
    }

    #[test]
    fn test_reserve_script_is_single_round_trip() {
        // The reservation, append and id store must all live in one script.
        assert!(RESERVE_AND_APPEND.contains("SET"));
        assert!(RESERVE_AND_APPEND.contains("XADD"));
        assert!(RESERVE_AND_APPEND.contains("KEEPTTL"));
    }
}
