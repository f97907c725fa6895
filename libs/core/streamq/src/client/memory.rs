//! In-memory implementation of the client capability surface.
//!
//! Mirrors the server-side structures the queue relies on: streams with
//! per-group pending lists, sorted sets, and TTL'd keys. Blocking group reads
//! are backed by a [`Notify`] so consumer loops behave like they do against a
//! real server. Used by the test suites and handy for local development.
//!
//! Capabilities can be switched off (`without_sorted_sets()` etc.) to
//! exercise the degraded paths a reduced server would force.

use super::{
    PendingEntry, PendingOps, KeyValueOps, Reservation, ScriptOps, SortedSetOps, StreamClient,
    StreamMessage, StreamOps,
};
use crate::envelope::{epoch_ms, FieldMap};
use crate::error::QueueError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct State {
    streams: HashMap<String, StreamState>,
    zsets: HashMap<String, Vec<(String, i64)>>,
    keys: HashMap<String, KeyEntry>,
}

#[derive(Debug, Default)]
struct StreamState {
    entries: Vec<Entry>,
    next_offset: u64,
    last_id_ms: i64,
    last_id_seq: u64,
    groups: HashMap<String, GroupState>,
}

#[derive(Debug, Clone)]
struct Entry {
    id: String,
    offset: u64,
    fields: FieldMap,
}

#[derive(Debug, Default)]
struct GroupState {
    /// Offset of the last entry delivered to any consumer in this group.
    cursor: u64,
    pending: HashMap<String, PendingState>,
}

#[derive(Debug, Clone)]
struct PendingState {
    consumer: String,
    delivered_at: Instant,
    /// Extra idle time granted by `age_pending` (test clock control).
    idle_boost: Duration,
    deliveries: u64,
    fields: FieldMap,
}

impl PendingState {
    fn idle(&self) -> Duration {
        self.delivered_at.elapsed() + self.idle_boost
    }
}

#[derive(Debug, Clone)]
struct KeyEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl KeyEntry {
    fn is_live(&self) -> bool {
        self.expires_at.is_none_or(|at| at > Instant::now())
    }
}

impl StreamState {
    fn next_id(&mut self) -> String {
        let ms = epoch_ms();
        if ms > self.last_id_ms {
            self.last_id_ms = ms;
            self.last_id_seq = 0;
        } else {
            self.last_id_seq += 1;
        }
        format!("{}-{}", self.last_id_ms, self.last_id_seq)
    }

    fn append(&mut self, fields: FieldMap) -> String {
        let id = self.next_id();
        let offset = self.next_offset;
        self.next_offset += 1;
        self.entries.push(Entry {
            id: id.clone(),
            offset,
            fields,
        });
        id
    }
}

impl State {
    fn append(&mut self, stream: &str, fields: &FieldMap) -> String {
        self.streams
            .entry(stream.to_string())
            .or_default()
            .append(fields.clone())
    }

    fn deliver(
        &mut self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamMessage>, QueueError> {
        let stream_state = self
            .streams
            .get_mut(stream)
            .ok_or_else(|| nogroup(stream, group))?;
        let StreamState {
            ref entries,
            ref mut groups,
            ..
        } = *stream_state;
        let group_state = groups
            .get_mut(group)
            .ok_or_else(|| nogroup(stream, group))?;

        let mut delivered = Vec::new();
        for entry in entries {
            if delivered.len() >= count {
                break;
            }
            if entry.offset >= group_state.cursor {
                group_state.cursor = entry.offset + 1;
                group_state.pending.insert(
                    entry.id.clone(),
                    PendingState {
                        consumer: consumer.to_string(),
                        delivered_at: Instant::now(),
                        idle_boost: Duration::ZERO,
                        deliveries: 1,
                        fields: entry.fields.clone(),
                    },
                );
                delivered.push(StreamMessage {
                    id: entry.id.clone(),
                    fields: entry.fields.clone(),
                });
            }
        }
        Ok(delivered)
    }

    fn live_key(&mut self, key: &str) -> Option<String> {
        match self.keys.get(key) {
            Some(entry) if entry.is_live() => Some(entry.value.clone()),
            Some(_) => {
                self.keys.remove(key);
                None
            }
            None => None,
        }
    }
}

fn nogroup(stream: &str, group: &str) -> QueueError {
    QueueError::ConsumerGroup(format!(
        "NOGROUP No such consumer group '{group}' for key name '{stream}'"
    ))
}

/// In-memory stream client with the full capability surface.
#[derive(Clone)]
pub struct MemoryStreamClient {
    state: Arc<Mutex<State>>,
    notify: Arc<Notify>,
    pending_enabled: bool,
    sorted_sets_enabled: bool,
    key_values_enabled: bool,
    scripts_enabled: bool,
}

impl Default for MemoryStreamClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStreamClient {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            notify: Arc::new(Notify::new()),
            pending_enabled: true,
            sorted_sets_enabled: true,
            key_values_enabled: true,
            scripts_enabled: true,
        }
    }

    /// Disable the pending/claim capability (shares state with `self`).
    pub fn without_pending(mut self) -> Self {
        self.pending_enabled = false;
        self
    }

    /// Disable the sorted-set capability (shares state with `self`).
    pub fn without_sorted_sets(mut self) -> Self {
        self.sorted_sets_enabled = false;
        self
    }

    /// Disable the key-value capability (shares state with `self`).
    pub fn without_key_values(mut self) -> Self {
        self.key_values_enabled = false;
        self
    }

    /// Disable the script capability (shares state with `self`).
    pub fn without_scripts(mut self) -> Self {
        self.scripts_enabled = false;
        self
    }

    /// All entries currently in a stream, oldest first. Test inspection aid.
    pub fn entries(&self, stream: &str) -> Vec<StreamMessage> {
        let state = self.state.lock().unwrap();
        state
            .streams
            .get(stream)
            .map(|s| {
                s.entries
                    .iter()
                    .map(|e| StreamMessage {
                        id: e.id.clone(),
                        fields: e.fields.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Members of a sorted set with their scores, ascending. Test inspection
    /// aid.
    pub fn zset_members(&self, key: &str) -> Vec<(String, i64)> {
        let state = self.state.lock().unwrap();
        let mut members = state.zsets.get(key).cloned().unwrap_or_default();
        members.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        members
    }

    /// Age a specific pending entry so claim thresholds can be crossed
    /// without real waiting. Test clock aid.
    pub fn age_pending(&self, stream: &str, group: &str, id: &str, by: Duration) {
        let mut state = self.state.lock().unwrap();
        if let Some(stream_state) = state.streams.get_mut(stream)
            && let Some(group_state) = stream_state.groups.get_mut(group)
            && let Some(pending) = group_state.pending.get_mut(id)
        {
            pending.idle_boost += by;
        }
    }
}

#[async_trait]
impl StreamOps for MemoryStreamClient {
    async fn append(&self, stream: &str, fields: &FieldMap) -> Result<String, QueueError> {
        let id = {
            let mut state = self.state.lock().unwrap();
            state.append(stream, fields)
        };
        self.notify.notify_waiters();
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
        let deadline = block.map(|b| tokio::time::Instant::now() + b);

        loop {
            let notified = self.notify.notified();

            {
                let mut state = self.state.lock().unwrap();
                let delivered = state.deliver(stream, group, consumer, count)?;
                if !delivered.is_empty() {
                    return Ok(delivered);
                }
            }

            let Some(deadline) = deadline else {
                return Ok(vec![]);
            };
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                let mut state = self.state.lock().unwrap();
                return state.deliver(stream, group, consumer, count);
            }
        }
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<u64, QueueError> {
        let mut state = self.state.lock().unwrap();
        let Some(stream_state) = state.streams.get_mut(stream) else {
            return Ok(0);
        };
        let Some(group_state) = stream_state.groups.get_mut(group) else {
            return Ok(0);
        };

        let mut acked = 0;
        for id in ids {
            if group_state.pending.remove(id).is_some() {
                acked += 1;
            }
        }
        Ok(acked)
    }

    async fn create_group(&self, stream: &str, group: &str) -> Result<bool, QueueError> {
        let mut state = self.state.lock().unwrap();
        let stream_state = state.streams.entry(stream.to_string()).or_default();

        if stream_state.groups.contains_key(group) {
            return Ok(false);
        }

        // New groups start at `$`: only entries appended afterwards are seen.
        let cursor = stream_state.next_offset;
        stream_state.groups.insert(
            group.to_string(),
            GroupState {
                cursor,
                pending: HashMap::new(),
            },
        );
        Ok(true)
    }

    async fn group_names(&self, stream: &str) -> Result<Vec<String>, QueueError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .streams
            .get(stream)
            .map(|s| s.groups.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn len(&self, stream: &str) -> Result<u64, QueueError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .streams
            .get(stream)
            .map(|s| s.entries.len() as u64)
            .unwrap_or(0))
    }

    async fn trim(&self, stream: &str, max_len: u64) -> Result<(), QueueError> {
        let mut state = self.state.lock().unwrap();
        if let Some(stream_state) = state.streams.get_mut(stream) {
            let len = stream_state.entries.len() as u64;
            if len > max_len {
                stream_state.entries.drain(0..(len - max_len) as usize);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl PendingOps for MemoryStreamClient {
    async fn pending(
        &self,
        stream: &str,
        group: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<PendingEntry>, QueueError> {
        let state = self.state.lock().unwrap();
        let stream_state = state
            .streams
            .get(stream)
            .ok_or_else(|| nogroup(stream, group))?;
        let group_state = stream_state
            .groups
            .get(group)
            .ok_or_else(|| nogroup(stream, group))?;

        let mut entries: Vec<PendingEntry> = group_state
            .pending
            .iter()
            .filter_map(|(id, p)| {
                let idle = p.idle();
                (idle >= min_idle).then(|| PendingEntry {
                    id: id.clone(),
                    consumer: p.consumer.clone(),
                    idle,
                    deliveries: p.deliveries,
                })
            })
            .collect();
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        entries.truncate(count);
        Ok(entries)
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[String],
    ) -> Result<Vec<StreamMessage>, QueueError> {
        let mut state = self.state.lock().unwrap();
        let stream_state = state
            .streams
            .get_mut(stream)
            .ok_or_else(|| nogroup(stream, group))?;
        let group_state = stream_state
            .groups
            .get_mut(group)
            .ok_or_else(|| nogroup(stream, group))?;

        let mut claimed = Vec::new();
        for id in ids {
            if let Some(pending) = group_state.pending.get_mut(id)
                && pending.idle() >= min_idle
            {
                pending.consumer = consumer.to_string();
                pending.delivered_at = Instant::now();
                pending.idle_boost = Duration::ZERO;
                pending.deliveries += 1;
                claimed.push(StreamMessage {
                    id: id.clone(),
                    fields: pending.fields.clone(),
                });
            }
        }
        Ok(claimed)
    }
}

#[async_trait]
impl SortedSetOps for MemoryStreamClient {
    async fn zadd(&self, key: &str, member: &str, score: i64) -> Result<(), QueueError> {
        let mut state = self.state.lock().unwrap();
        let zset = state.zsets.entry(key.to_string()).or_default();

        if let Some(existing) = zset.iter_mut().find(|(m, _)| m == member) {
            existing.1 = score;
        } else {
            zset.push((member.to_string(), score));
        }
        Ok(())
    }

    async fn zpop_min(&self, key: &str, count: usize) -> Result<Vec<(String, i64)>, QueueError> {
        let mut state = self.state.lock().unwrap();
        let Some(zset) = state.zsets.get_mut(key) else {
            return Ok(vec![]);
        };

        zset.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        let take = count.min(zset.len());
        Ok(zset.drain(0..take).collect())
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        max: i64,
        limit: usize,
    ) -> Result<Vec<String>, QueueError> {
        let state = self.state.lock().unwrap();
        let Some(zset) = state.zsets.get(key) else {
            return Ok(vec![]);
        };

        let mut due: Vec<(String, i64)> = zset
            .iter()
            .filter(|(_, score)| *score <= max)
            .cloned()
            .collect();
        due.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        Ok(due.into_iter().take(limit).map(|(m, _)| m).collect())
    }

    async fn zrem(&self, key: &str, members: &[String]) -> Result<u64, QueueError> {
        let mut state = self.state.lock().unwrap();
        let Some(zset) = state.zsets.get_mut(key) else {
            return Ok(0);
        };

        let before = zset.len();
        zset.retain(|(m, _)| !members.contains(m));
        Ok((before - zset.len()) as u64)
    }
}

#[async_trait]
impl KeyValueOps for MemoryStreamClient {
    async fn get(&self, key: &str) -> Result<Option<String>, QueueError> {
        let mut state = self.state.lock().unwrap();
        Ok(state.live_key(key))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), QueueError> {
        let mut state = self.state.lock().unwrap();
        state.keys.insert(
            key.to_string(),
            KeyEntry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, QueueError> {
        let mut state = self.state.lock().unwrap();
        if state.live_key(key).is_some() {
            return Ok(false);
        }
        state.keys.insert(
            key.to_string(),
            KeyEntry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn del(&self, key: &str) -> Result<(), QueueError> {
        let mut state = self.state.lock().unwrap();
        state.keys.remove(key);
        Ok(())
    }
}

#[async_trait]
impl ScriptOps for MemoryStreamClient {
    async fn reserve_and_append(
        &self,
        key: &str,
        ttl: Duration,
        stream: &str,
        fields: &FieldMap,
    ) -> Result<Reservation, QueueError> {
        let reservation = {
            let mut state = self.state.lock().unwrap();

            if let Some(current) = state.live_key(key) {
                return Ok(Reservation {
                    created: false,
                    value: current,
                });
            }

            let expires_at = Some(Instant::now() + ttl);
            let id = state.append(stream, fields);
            state.keys.insert(
                key.to_string(),
                KeyEntry {
                    value: id.clone(),
                    expires_at,
                },
            );
            Reservation {
                created: true,
                value: id,
            }
        };
        self.notify.notify_waiters();
        Ok(reservation)
    }
}

impl StreamClient for MemoryStreamClient {
    fn pending_ops(&self) -> Option<&dyn PendingOps> {
        self.pending_enabled.then_some(self as &dyn PendingOps)
    }

    fn sorted_sets(&self) -> Option<&dyn SortedSetOps> {
        self.sorted_sets_enabled.then_some(self as &dyn SortedSetOps)
    }

    fn key_values(&self) -> Option<&dyn KeyValueOps> {
        self.key_values_enabled.then_some(self as &dyn KeyValueOps)
    }

    fn scripts(&self) -> Option<&dyn ScriptOps> {
        self.scripts_enabled.then_some(self as &dyn ScriptOps)
    }
}
