//! Standalone pending sweeper: an operational variant of the in-worker
//! claim loop.
//!
//! The sweeper only transfers ownership. It periodically claims long-idle
//! pending entries onto a configured consumer name and relies on that
//! consumer's read loop to actually process them.

use crate::client::StreamClient;
use crate::config::SweeperConfig;
use crate::error::QueueError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

struct SweeperInner {
    client: Arc<dyn StreamClient>,
    config: SweeperConfig,
    running: AtomicBool,
}

/// Claims abandoned deliveries for a consumer. Created stopped.
pub struct PendingSweeper {
    inner: Arc<SweeperInner>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl PendingSweeper {
    pub fn new(client: Arc<dyn StreamClient>, config: SweeperConfig) -> Self {
        Self {
            inner: Arc::new(SweeperInner {
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

    /// Spawn the sweep loop. No-op when already running. Fails when the
    /// client lacks pending/claim support.
    pub async fn start(&self) -> Result<(), QueueError> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if self.inner.client.pending_ops().is_none() {
            self.inner.running.store(false, Ordering::SeqCst);
            return Err(QueueError::Unsupported("pending/claim"));
        }

        info!(
            stream = %self.inner.config.stream,
            group = %self.inner.config.group,
            consumer = %self.inner.config.consumer,
            min_idle_ms = %self.inner.config.min_idle.as_millis(),
            "Starting pending sweeper"
        );

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            while inner.running.load(Ordering::SeqCst) {
                tokio::time::sleep(inner.config.interval).await;
                if !inner.running.load(Ordering::SeqCst) {
                    break;
                }
                inner.sweep().await;
            }
            info!("Pending sweeper stopped");
        });
        *self.task.lock().await = Some(handle);
        Ok(())
    }

    /// Clear the running flag and await the loop. No-op when stopped.
    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.task.lock().await.take() {
            let _ = handle.await;
        }
    }

    /// Run a single sweep pass, returning how many entries were claimed.
    /// Exposed for operational tooling.
    pub async fn sweep_once(&self) -> usize {
        self.inner.sweep().await
    }
}

impl SweeperInner {
    async fn sweep(&self) -> usize {
        let Some(pending_ops) = self.client.pending_ops() else {
            return 0;
        };
        let config = &self.config;

        let pending = match pending_ops
            .pending(
                &config.stream,
                &config.group,
                config.min_idle,
                config.max_per_tick,
            )
            .await
        {
            Ok(pending) => pending,
            Err(e) => {
                warn!(error = %e, "Pending lookup failed");
                return 0;
            }
        };
        if pending.is_empty() {
            return 0;
        }

        let ids: Vec<String> = pending.into_iter().map(|p| p.id).collect();
        match pending_ops
            .claim(
                &config.stream,
                &config.group,
                &config.consumer,
                config.min_idle,
                &ids,
            )
            .await
        {
            Ok(claimed) => {
                if claimed.is_empty() {
                    debug!("No entries idle enough to claim");
                } else {
                    info!(
                        count = claimed.len(),
                        consumer = %config.consumer,
                        "Swept idle deliveries to consumer"
                    );
                }
                claimed.len()
            }
            Err(e) => {
                warn!(error = %e, "Claim failed");
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{MemoryStreamClient, PendingOps, StreamOps};
    use crate::envelope::FieldMap;
    use std::time::Duration;

    fn entry_fields() -> FieldMap {
        let mut fields = FieldMap::new();
        fields.insert("payload".to_string(), "x".to_string());
        fields
    }

    #[tokio::test]
    async fn test_sweep_reassigns_idle_entries() {
        let client = MemoryStreamClient::new();
        client.create_group("jobs", "workers").await.unwrap();
        client.append("jobs", &entry_fields()).await.unwrap();

        // A consumer that read and then died.
        let messages = client
            .read_group("jobs", "workers", "dead-worker", 10, None)
            .await
            .unwrap();
        let id = messages[0].id.clone();
        client.age_pending("jobs", "workers", &id, Duration::from_secs(120));

        let sweeper = PendingSweeper::new(
            Arc::new(client.clone()),
            SweeperConfig::new("jobs", "workers", "rescuer")
                .with_min_idle(Duration::from_secs(60)),
        );

        assert_eq!(sweeper.sweep_once().await, 1);

        let pending = client
            .pending("jobs", "workers", Duration::ZERO, 10)
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].consumer, "rescuer");
        assert_eq!(pending[0].deliveries, 2);
    }

    #[tokio::test]
    async fn test_sweep_skips_fresh_entries() {
        let client = MemoryStreamClient::new();
        client.create_group("jobs", "workers").await.unwrap();
        client.append("jobs", &entry_fields()).await.unwrap();
        client
            .read_group("jobs", "workers", "busy-worker", 10, None)
            .await
            .unwrap();

        let sweeper = PendingSweeper::new(
            Arc::new(client.clone()),
            SweeperConfig::new("jobs", "workers", "rescuer")
                .with_min_idle(Duration::from_secs(60)),
        );

        assert_eq!(sweeper.sweep_once().await, 0);
        let pending = client
            .pending("jobs", "workers", Duration::ZERO, 10)
            .await
            .unwrap();
        assert_eq!(pending[0].consumer, "busy-worker");
    }

    #[tokio::test]
    async fn test_start_requires_pending_capability() {
        let client = MemoryStreamClient::new().without_pending();
        let sweeper = PendingSweeper::new(
            Arc::new(client),
            SweeperConfig::new("jobs", "workers", "rescuer"),
        );

        let err = sweeper.start().await.unwrap_err();
        assert!(matches!(err, QueueError::Unsupported(_)));
        assert!(!sweeper.is_running());
    }

    #[tokio::test]
    async fn test_lifecycle_is_idempotent() {
        let client = MemoryStreamClient::new();
        client.create_group("jobs", "workers").await.unwrap();

        let sweeper = PendingSweeper::new(
            Arc::new(client),
            SweeperConfig::new("jobs", "workers", "rescuer")
                .with_interval(Duration::from_millis(25)),
        );

        sweeper.start().await.unwrap();
        sweeper.start().await.unwrap();
        assert!(sweeper.is_running());

        sweeper.stop().await;
        sweeper.stop().await;
        assert!(!sweeper.is_running());
    }
}
