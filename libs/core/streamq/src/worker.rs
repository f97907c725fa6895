//! Consumer worker: the read loop, the terminal pipeline and the in-worker
//! pending-claim loop.
//!
//! A worker owns one consumer name inside one group. It reads batches of new
//! entries, decodes them, dispatches to the [`Handler`], and applies exactly
//! one terminal per delivery: acknowledge, schedule a retry successor, or
//! dead-letter. Horizontal scaling comes from running more workers in the
//! same group; within a worker, processing is strictly sequential.

use crate::client::{StreamClient, StreamMessage};
use crate::config::{Scheduling, WorkerConfig};
use crate::envelope::{epoch_ms, Codec, Envelope, FieldMap};
use crate::error::QueueError;
use crate::metrics::{self, ErrorKind, Terminal};
use crate::retry::{RetryPolicy, Verdict};
use crate::scheduler::ScheduledEntry;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Backoff after a failed group read.
const READ_ERROR_BACKOFF: Duration = Duration::from_millis(250);

/// Poll cadence while draining in-flight work during stop.
const DRAIN_POLL: Duration = Duration::from_millis(25);

/// Delay before a deferred duplicate is offered again.
const DUPLICATE_DEFER_DELAY: Duration = Duration::from_millis(500);

/// Marker a completed keyed message leaves behind.
const DONE_MARKER: &str = "DONE";

/// Delivery metadata handed to the handler alongside the payload.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Stream entry id of this delivery.
    pub id: String,
    /// Decoded envelope headers.
    pub headers: crate::envelope::Headers,
}

/// Processes one payload and decides its terminal.
///
/// Returning `Ok(Verdict::Ack)` (or just `Ok(Verdict::default())`)
/// acknowledges the message. Returning an error routes the failure through
/// the worker's [`RetryPolicy`].
#[async_trait]
pub trait Handler<P>: Send + Sync {
    async fn handle(&self, payload: &P, delivery: &Delivery) -> eyre::Result<Verdict>;

    /// Handler name for logging.
    fn name(&self) -> &'static str {
        "handler"
    }
}

/// Shutdown behavior for [`Worker::stop`].
#[derive(Debug, Clone, Copy)]
pub struct StopOptions {
    /// Wait for in-flight processing to finish before returning.
    pub drain: bool,
    /// Upper bound on the drain wait.
    pub timeout: Duration,
}

impl Default for StopOptions {
    fn default() -> Self {
        Self {
            drain: true,
            timeout: Duration::from_millis(10_000),
        }
    }
}

#[derive(Default)]
struct LoopTasks {
    read: Option<JoinHandle<()>>,
    claim: Option<JoinHandle<()>>,
}

struct WorkerInner<P> {
    client: Arc<dyn StreamClient>,
    codec: Arc<dyn Codec<P>>,
    handler: Arc<dyn Handler<P>>,
    policy: RetryPolicy,
    config: WorkerConfig,
    running: AtomicBool,
    in_flight: AtomicUsize,
}

/// A consumer worker. Created stopped; `start` spawns the loops, `stop`
/// winds them down.
pub struct Worker<P> {
    inner: Arc<WorkerInner<P>>,
    tasks: tokio::sync::Mutex<LoopTasks>,
}

impl<P> Worker<P>
where
    P: Serialize + Clone + Send + Sync + 'static,
{
    pub fn new(
        client: Arc<dyn StreamClient>,
        codec: Arc<dyn Codec<P>>,
        handler: Arc<dyn Handler<P>>,
        policy: RetryPolicy,
        config: WorkerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(WorkerInner {
                client,
                codec,
                handler,
                policy,
                config,
                running: AtomicBool::new(false),
                in_flight: AtomicUsize::new(0),
            }),
            tasks: tokio::sync::Mutex::new(LoopTasks::default()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Messages currently inside the handler/terminal pipeline.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.inner.config
    }

    /// Ensure the consumer group exists, then spawn the read loop (and the
    /// claim loop when enabled and supported).
    ///
    /// Idempotent: a second `start` on a running worker is a no-op. The only
    /// error surfaced synchronously is the group-ensure failure, which leaves
    /// the worker stopped.
    pub async fn start(&self) -> Result<(), QueueError> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            debug!(consumer = %self.inner.config.consumer, "Worker already running");
            return Ok(());
        }

        if let Err(e) = self.inner.ensure_group().await {
            self.inner.running.store(false, Ordering::SeqCst);
            return Err(e);
        }

        info!(
            stream = %self.inner.config.stream,
            group = %self.inner.config.group,
            consumer = %self.inner.config.consumer,
            handler = %self.inner.handler.name(),
            "Starting consumer worker"
        );

        let mut tasks = self.tasks.lock().await;

        let inner = Arc::clone(&self.inner);
        tasks.read = Some(tokio::spawn(async move { inner.read_loop().await }));

        if self.inner.config.claim.enabled {
            if self.inner.client.pending_ops().is_some() {
                let inner = Arc::clone(&self.inner);
                tasks.claim = Some(tokio::spawn(async move { inner.claim_loop().await }));
            } else {
                warn!("Pending/claim capability absent, claim loop disabled");
            }
        }

        Ok(())
    }

    /// Clear the running flag; with `drain`, wait for in-flight work and the
    /// loops to wind down. No-op on a stopped worker.
    pub async fn stop(&self, opts: StopOptions) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }

        info!(
            consumer = %self.inner.config.consumer,
            drain = opts.drain,
            "Stopping consumer worker"
        );

        if !opts.drain {
            // In-flight work finishes asynchronously; detach the loops.
            let mut tasks = self.tasks.lock().await;
            tasks.read.take();
            tasks.claim.take();
            return;
        }

        let deadline = tokio::time::Instant::now() + opts.timeout;
        while self.inner.in_flight.load(Ordering::SeqCst) > 0
            && tokio::time::Instant::now() < deadline
        {
            tokio::time::sleep(DRAIN_POLL).await;
        }

        let mut tasks = self.tasks.lock().await;
        if let Some(read) = tasks.read.take() {
            let _ = read.await;
        }
        if let Some(claim) = tasks.claim.take() {
            let _ = claim.await;
        }
    }
}

impl<P> WorkerInner<P>
where
    P: Serialize + Clone + Send + Sync + 'static,
{
    /// Group creation is idempotent: an existing group is success.
    async fn ensure_group(&self) -> Result<(), QueueError> {
        let groups = self.client.group_names(&self.config.stream).await?;
        if groups.iter().any(|g| g == &self.config.group) {
            debug!(group = %self.config.group, "Consumer group already exists");
            return Ok(());
        }

        match self
            .client
            .create_group(&self.config.stream, &self.config.group)
            .await
        {
            Ok(true) => {
                info!(group = %self.config.group, "Created consumer group");
                Ok(())
            }
            Ok(false) => {
                debug!(group = %self.config.group, "Consumer group already exists");
                Ok(())
            }
            Err(e) if e.is_busygroup() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn read_loop(self: Arc<Self>) {
        let config = &self.config;

        while self.running.load(Ordering::SeqCst) {
            let batch = self
                .client
                .read_group(
                    &config.stream,
                    &config.group,
                    &config.consumer,
                    config.batch.count,
                    Some(config.batch.block),
                )
                .await;

            match batch {
                Ok(messages) => {
                    for message in messages {
                        self.track_in_flight(&message).await;
                    }
                }
                Err(e) => {
                    metrics::record_error(&config.stream, ErrorKind::Transport);
                    if e.is_nogroup() {
                        warn!(error = %e, "Consumer group missing, recreating");
                        if let Err(create_err) = self.ensure_group().await {
                            error!(error = %create_err, "Failed to recreate consumer group");
                        }
                    } else {
                        warn!(error = %e, "Stream read failed, backing off");
                    }
                    tokio::time::sleep(READ_ERROR_BACKOFF).await;
                }
            }
        }

        debug!(consumer = %config.consumer, "Read loop stopped");
    }

    async fn claim_loop(self: Arc<Self>) {
        let config = &self.config;

        while self.running.load(Ordering::SeqCst) {
            tokio::time::sleep(config.claim.interval).await;
            if !self.running.load(Ordering::SeqCst) {
                break;
            }

            let Some(pending_ops) = self.client.pending_ops() else {
                break;
            };

            let pending = match pending_ops
                .pending(
                    &config.stream,
                    &config.group,
                    config.claim.min_idle,
                    config.claim.max_per_tick,
                )
                .await
            {
                Ok(pending) => pending,
                Err(e) => {
                    warn!(error = %e, "Pending lookup failed");
                    continue;
                }
            };
            if pending.is_empty() {
                continue;
            }

            let ids: Vec<String> = pending.into_iter().map(|p| p.id).collect();
            match pending_ops
                .claim(
                    &config.stream,
                    &config.group,
                    &config.consumer,
                    config.claim.min_idle,
                    &ids,
                )
                .await
            {
                Ok(claimed) => {
                    if !claimed.is_empty() {
                        info!(
                            count = claimed.len(),
                            consumer = %config.consumer,
                            "Reclaimed idle deliveries"
                        );
                    }
                    for message in claimed {
                        self.track_in_flight(&message).await;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Claim failed");
                }
            }
        }

        debug!(consumer = %config.consumer, "Claim loop stopped");
    }

    async fn track_in_flight(&self, message: &StreamMessage) {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::set_in_flight(&self.config.stream, current as f64);

        self.process_message(&message.id, &message.fields).await;

        let current = self.in_flight.fetch_sub(1, Ordering::SeqCst) - 1;
        metrics::set_in_flight(&self.config.stream, current as f64);
    }

    /// Decode, dispatch and apply exactly one terminal for one delivery.
    async fn process_message(&self, id: &str, fields: &FieldMap) {
        let envelope = match self.codec.decode(fields) {
            Ok(envelope) => envelope,
            Err(e) => {
                // Retrying cannot repair a malformed entry; ack it away.
                error!(message_id = %id, error = %e, "Failed to decode entry, acknowledging");
                metrics::record_error(&self.config.stream, ErrorKind::Decode);
                self.ack_entry(id).await;
                return;
            }
        };

        let mut reserved_key = None;
        if self.config.idempotency.is_some()
            && let Some(key) = envelope.headers.key.clone()
        {
            match self.try_reserve(id, &key, fields).await {
                ReserveOutcome::Reserved(consumed_key) => reserved_key = Some(consumed_key),
                ReserveOutcome::Unavailable => {}
                ReserveOutcome::Finished => return,
            }
        }

        let delivery = Delivery {
            id: id.to_string(),
            headers: envelope.headers.clone(),
        };

        let mut handler_error = None;
        let verdict = match self.handler.handle(&envelope.payload, &delivery).await {
            Ok(verdict) => verdict,
            Err(err) => {
                debug!(
                    message_id = %id,
                    attempt = envelope.headers.attempt,
                    error = %err,
                    "Handler failed, consulting retry policy"
                );
                let verdict = self.policy.next(&envelope.headers, &err);
                handler_error = Some(err);
                verdict
            }
        };

        if let Err(e) = self
            .apply_verdict(id, &envelope, verdict, handler_error.as_ref(), reserved_key.as_deref())
            .await
        {
            // Availability over strict delivery: an entry whose terminal
            // keeps failing must not wedge the loop.
            error!(
                message_id = %id,
                error = %e,
                "Terminal action failed, acknowledging to avoid a poison loop"
            );
            metrics::record_error(&self.config.stream, ErrorKind::Terminal);
            if let Some(key) = reserved_key.as_deref() {
                self.clear_reservation(key).await;
            }
            self.ack_entry(id).await;
        }
    }

    /// Handler-level idempotency, step one: try to own the key.
    async fn try_reserve(&self, id: &str, key: &str, fields: &FieldMap) -> ReserveOutcome {
        let Some(idempotency) = &self.config.idempotency else {
            return ReserveOutcome::Unavailable;
        };
        let Some(kv) = self.client.key_values() else {
            return ReserveOutcome::Unavailable;
        };

        let consumed_key = self.config.consumed_key(key);
        let marker = format!("PENDING:{}", self.config.consumer);

        match kv
            .set_nx_ex(&consumed_key, &marker, idempotency.pending_ttl)
            .await
        {
            Ok(true) => ReserveOutcome::Reserved(consumed_key),
            Ok(false) => match kv.get(&consumed_key).await {
                Ok(Some(value)) if value == DONE_MARKER => {
                    debug!(message_id = %id, key = %key, "Duplicate of a completed message, acknowledging");
                    self.ack_entry(id).await;
                    ReserveOutcome::Finished
                }
                Ok(_) => {
                    // Another consumer is mid-flight on this key. Hand the
                    // entry back through the scheduler untouched so the
                    // rightful owner (or a later attempt) completes it.
                    debug!(message_id = %id, key = %key, "Key reserved elsewhere, deferring duplicate");
                    if let Err(e) = self.schedule_fields(fields, DUPLICATE_DEFER_DELAY).await {
                        warn!(error = %e, "Failed to defer duplicate");
                    }
                    self.ack_entry(id).await;
                    ReserveOutcome::Finished
                }
                Err(e) => {
                    warn!(error = %e, "Idempotency read failed, continuing unreserved");
                    ReserveOutcome::Unavailable
                }
            },
            Err(e) => {
                warn!(error = %e, "Idempotency reserve failed, continuing unreserved");
                ReserveOutcome::Unavailable
            }
        }
    }

    async fn apply_verdict(
        &self,
        id: &str,
        envelope: &Envelope<P>,
        verdict: Verdict,
        handler_error: Option<&eyre::Report>,
        reserved_key: Option<&str>,
    ) -> Result<(), QueueError> {
        match verdict {
            Verdict::Ack => {
                self.client
                    .ack(&self.config.stream, &self.config.group, &[id.to_string()])
                    .await?;
                if let (Some(key), Some(kv), Some(idempotency)) = (
                    reserved_key,
                    self.client.key_values(),
                    &self.config.idempotency,
                ) {
                    kv.set_ex(key, DONE_MARKER, idempotency.done_ttl).await?;
                }
                metrics::record_message(&self.config.stream, Terminal::Acked);
                debug!(message_id = %id, "Message acknowledged");
            }
            Verdict::Retry { delay } => {
                if let Some(key) = reserved_key {
                    self.clear_reservation(key).await;
                }

                let successor =
                    Envelope::new(envelope.headers.next_attempt(), envelope.payload.clone());
                let fields = self.codec.encode(&successor)?;
                self.schedule_fields(&fields, delay).await?;
                self.client
                    .ack(&self.config.stream, &self.config.group, &[id.to_string()])
                    .await?;

                metrics::record_message(&self.config.stream, Terminal::Retried);
                metrics::record_retry(&self.config.stream, successor.headers.attempt);
                info!(
                    message_id = %id,
                    attempt = successor.headers.attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Message scheduled for retry"
                );
            }
            Verdict::DeadLetter { reason } => {
                if let Some(key) = reserved_key {
                    self.clear_reservation(key).await;
                }

                let fields = self.dlq_fields(envelope, &reason, handler_error)?;
                self.client
                    .append(&self.config.dlq_stream(), &fields)
                    .await?;
                self.client
                    .ack(&self.config.stream, &self.config.group, &[id.to_string()])
                    .await?;

                metrics::record_message(&self.config.stream, Terminal::DeadLettered);
                warn!(
                    message_id = %id,
                    reason = %reason,
                    attempt = envelope.headers.attempt,
                    "Message dead-lettered"
                );
            }
        }
        Ok(())
    }

    /// Park a field map for later delivery. Zset scheduling when configured
    /// and available, direct re-append otherwise.
    async fn schedule_fields(&self, fields: &FieldMap, delay: Duration) -> Result<(), QueueError> {
        match (&self.config.scheduling, self.client.sorted_sets()) {
            (Scheduling::Zset { .. }, Some(sorted_sets)) => {
                let entry = ScheduledEntry::new(self.config.stream.clone(), fields.clone());
                let member = serde_json::to_string(&entry)?;
                let due = epoch_ms() + delay.as_millis() as i64;
                sorted_sets
                    .zadd(&self.config.retry_zset(), &member, due)
                    .await
            }
            _ => {
                // No scheduler available; the delay collapses to "now".
                self.client.append(&self.config.stream, fields).await?;
                Ok(())
            }
        }
    }

    fn dlq_fields(
        &self,
        envelope: &Envelope<P>,
        reason: &str,
        handler_error: Option<&eyre::Report>,
    ) -> Result<FieldMap, QueueError> {
        #[derive(Serialize)]
        struct DlqError<'a> {
            reason: &'a str,
            #[serde(skip_serializing_if = "Option::is_none")]
            meta: Option<serde_json::Value>,
        }

        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct HandledBy<'a> {
            group: &'a str,
            consumer: &'a str,
        }

        let error = DlqError {
            reason,
            meta: handler_error.map(|e| serde_json::json!({ "message": e.to_string() })),
        };
        let handled_by = HandledBy {
            group: &self.config.group,
            consumer: &self.config.consumer,
        };

        let mut fields = FieldMap::new();
        fields.insert(
            "headers".to_string(),
            serde_json::to_string(&envelope.headers)?,
        );
        fields.insert(
            "payload".to_string(),
            serde_json::to_string(&envelope.payload)?,
        );
        fields.insert("error".to_string(), serde_json::to_string(&error)?);
        fields.insert("handledBy".to_string(), serde_json::to_string(&handled_by)?);
        Ok(fields)
    }

    async fn clear_reservation(&self, key: &str) {
        if let Some(kv) = self.client.key_values()
            && let Err(e) = kv.del(key).await
        {
            warn!(key = %key, error = %e, "Failed to clear idempotency reservation");
        }
    }

    /// Best-effort ack for paths that must not propagate errors.
    async fn ack_entry(&self, id: &str) {
        if let Err(e) = self
            .client
            .ack(&self.config.stream, &self.config.group, &[id.to_string()])
            .await
        {
            error!(message_id = %id, error = %e, "Failed to acknowledge entry");
        }
    }
}

enum ReserveOutcome {
    /// This worker owns the key; remember it for the terminal step.
    Reserved(String),
    /// No reservation possible; proceed without idempotency.
    Unavailable,
    /// The delivery was fully handled inside the reserve step.
    Finished,
}
