//! Retry daemon: drains due entries from the retry sorted set back into
//! their target stream.
//!
//! The sorted set is a time wheel: score = due epoch milliseconds, member =
//! a serialized [`ScheduledEntry`]. Each tick the daemon takes ownership of
//! up to `max_batch` due members (removal from the set IS the ownership
//! transfer) and re-appends them in ascending due-time order.

use crate::client::{SortedSetOps, StreamClient};
use crate::config::{DaemonConfig, DrainStrategy};
use crate::envelope::{epoch_ms, FieldMap};
use crate::error::QueueError;
use rand::RngExt;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Lower bound on the inter-tick sleep.
const MIN_TICK: Duration = Duration::from_millis(25);

/// A parked future stream entry: the exact field map to re-append, and the
/// stream to append it to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledEntry {
    /// Target stream; the daemon's `target_stream` is used when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<String>,

    pub fields: FieldMap,
}

impl ScheduledEntry {
    pub fn new(stream: impl Into<String>, fields: FieldMap) -> Self {
        Self {
            stream: Some(stream.into()),
            fields,
        }
    }
}

struct DaemonInner {
    client: Arc<dyn StreamClient>,
    config: DaemonConfig,
    running: AtomicBool,
}

/// Moves due retry entries back into their streams. Created stopped.
pub struct RetryDaemon {
    inner: Arc<DaemonInner>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl RetryDaemon {
    pub fn new(client: Arc<dyn StreamClient>, config: DaemonConfig) -> Self {
        Self {
            inner: Arc::new(DaemonInner {
                client,
                config,
                running: AtomicBool::new(false),
            }),
            task: tokio::sync::Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Spawn the tick loop. No-op when already running. Fails when the
    /// client lacks sorted sets.
    pub async fn start(&self) -> Result<(), QueueError> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            debug!("Retry daemon already running");
            return Ok(());
        }

        if self.inner.client.sorted_sets().is_none() {
            self.inner.running.store(false, Ordering::SeqCst);
            return Err(QueueError::Unsupported("sorted sets"));
        }

        info!(
            retry_zset = %self.inner.config.retry_zset,
            target_stream = %self.inner.config.target_stream,
            tick_ms = %self.inner.config.tick.as_millis(),
            "Starting retry daemon"
        );

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            while inner.running.load(Ordering::SeqCst) {
                inner.tick().await;
                tokio::time::sleep(inner.jittered_tick()).await;
            }
            info!("Retry daemon stopped");
        });
        *self.task.lock().await = Some(handle);
        Ok(())
    }

    /// Clear the running flag and await the tick loop. No-op when stopped.
    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.task.lock().await.take() {
            let _ = handle.await;
        }
    }

    /// Run a single drain pass. Exposed for operational tooling.
    pub async fn drain_once(&self) -> usize {
        self.inner.tick().await
    }
}

impl DaemonInner {
    /// One tick: take ownership of due members and re-append them.
    /// Returns how many members were forwarded.
    async fn tick(&self) -> usize {
        let Some(sorted_sets) = self.client.sorted_sets() else {
            return 0;
        };

        let now = epoch_ms();
        let members = match self.collect_due(sorted_sets, now).await {
            Ok(members) => members,
            Err(e) => {
                warn!(error = %e, retry_zset = %self.config.retry_zset, "Retry drain failed");
                return 0;
            }
        };

        let mut forwarded = 0;
        for member in members {
            let entry: ScheduledEntry = match serde_json::from_str(&member) {
                Ok(entry) => entry,
                Err(e) => {
                    // Dropped rather than re-queued: a malformed member would
                    // fail forever and churn the set.
                    error!(error = %e, member = %member, "Dropping malformed retry member");
                    continue;
                }
            };

            let stream = entry
                .stream
                .as_deref()
                .unwrap_or(&self.config.target_stream);
            match self.client.append(stream, &entry.fields).await {
                Ok(id) => {
                    debug!(stream = %stream, message_id = %id, "Re-injected delayed entry");
                    forwarded += 1;
                }
                Err(e) => {
                    error!(error = %e, stream = %stream, "Dropping undeliverable retry member");
                }
            }
        }
        forwarded
    }

    /// Collect up to `max_batch` members with score <= now. Members returned
    /// here have already been removed from the set and belong to this daemon.
    async fn collect_due(
        &self,
        sorted_sets: &dyn SortedSetOps,
        now: i64,
    ) -> Result<Vec<String>, QueueError> {
        let key = &self.config.retry_zset;

        match self.config.strategy {
            DrainStrategy::PopMin => {
                let mut owned = Vec::new();
                while owned.len() < self.config.max_batch {
                    let Some((member, score)) =
                        sorted_sets.zpop_min(key, 1).await?.into_iter().next()
                    else {
                        break;
                    };
                    if score > now {
                        // Not due yet; put it back and stop collecting.
                        sorted_sets.zadd(key, &member, score).await?;
                        break;
                    }
                    owned.push(member);
                }
                Ok(owned)
            }
            DrainStrategy::RangeRemove => {
                let candidates = sorted_sets
                    .zrange_by_score(key, now, self.config.max_batch)
                    .await?;
                let mut owned = Vec::new();
                for member in candidates {
                    // Only a successful removal makes the member ours; a
                    // concurrent drainer may have taken it first.
                    if sorted_sets
                        .zrem(key, std::slice::from_ref(&member))
                        .await?
                        == 1
                    {
                        owned.push(member);
                    }
                }
                Ok(owned)
            }
        }
    }

    fn jittered_tick(&self) -> Duration {
        let base = self.config.tick.as_millis() as f64;
        let spread = self.config.jitter_pct.clamp(0.0, 1.0);
        let factor = 1.0 + rand::rng().random_range(-spread..=spread);
        MIN_TICK.max(Duration::from_millis((base * factor) as u64))
    }
}
