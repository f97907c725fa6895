//! Smoke tests against a real Redis server.
//!
//! These spin up a Redis container through test-utils and are ignored by
//! default; run them with `cargo test -- --ignored` on a machine with a
//! Docker daemon.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use streamq::{
    Backoff, Delivery, Handler, JsonCodec, KeyValueOps, PendingOps, Producer, ProducerConfig,
    RedisStreamClient, RetryPolicy, ScriptOps, SendOptions, SendReceipt, SortedSetOps,
    StopOptions, StreamOps, Verdict, Worker, WorkerConfig,
};
use test_utils::TestRedis;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Job {
    value: String,
}

struct CountingHandler {
    calls: Mutex<Vec<String>>,
    fail_first: usize,
}

impl CountingHandler {
    fn new(fail_first: usize) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            fail_first,
        })
    }

    fn count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl Handler<Job> for CountingHandler {
    async fn handle(&self, payload: &Job, _delivery: &Delivery) -> eyre::Result<Verdict> {
        let count = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(payload.value.clone());
            calls.len()
        };
        if count <= self.fail_first {
            Err(eyre::eyre!("simulated failure {count}"))
        } else {
            Ok(Verdict::Ack)
        }
    }
}

async fn wait_until(mut cond: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    cond()
}

#[tokio::test]
#[ignore = "needs a running Docker daemon"]
async fn append_read_ack_roundtrip() {
    let redis = TestRedis::new().await;
    let client = RedisStreamClient::connect(redis.uri())
        .await
        .unwrap();

    assert!(client.create_group("it:jobs", "workers").await.unwrap());
    // BUSYGROUP surfaces as "already existed"
    assert!(!client.create_group("it:jobs", "workers").await.unwrap());
    assert_eq!(client.group_names("it:jobs").await.unwrap(), vec!["workers"]);

    let mut fields = streamq::FieldMap::new();
    fields.insert("headers".to_string(), "{}".to_string());
    fields.insert("payload".to_string(), "\"x\"".to_string());
    let id = client.append("it:jobs", &fields).await.unwrap();
    assert_eq!(client.len("it:jobs").await.unwrap(), 1);

    let messages = client
        .read_group("it:jobs", "workers", "c1", 10, Some(Duration::from_millis(500)))
        .await
        .unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].id, id);
    assert_eq!(messages[0].fields, fields);

    let pending = client
        .pending("it:jobs", "workers", Duration::ZERO, 10)
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].consumer, "c1");

    assert_eq!(client.ack("it:jobs", "workers", &[id]).await.unwrap(), 1);
    let pending = client
        .pending("it:jobs", "workers", Duration::ZERO, 10)
        .await
        .unwrap();
    assert!(pending.is_empty());
}

#[tokio::test]
#[ignore = "needs a running Docker daemon"]
async fn sorted_set_and_key_ops() {
    let redis = TestRedis::new().await;
    let client = RedisStreamClient::connect(redis.uri())
        .await
        .unwrap();

    client.zadd("it:retry", "b", 200).await.unwrap();
    client.zadd("it:retry", "a", 100).await.unwrap();
    assert_eq!(
        client.zrange_by_score("it:retry", 150, 10).await.unwrap(),
        vec!["a"]
    );
    assert_eq!(
        client.zpop_min("it:retry", 1).await.unwrap(),
        vec![("a".to_string(), 100)]
    );
    assert_eq!(client.zrem("it:retry", &["b".to_string()]).await.unwrap(), 1);

    assert!(client
        .set_nx_ex("it:key", "v1", Duration::from_secs(30))
        .await
        .unwrap());
    assert!(!client
        .set_nx_ex("it:key", "v2", Duration::from_secs(30))
        .await
        .unwrap());
    assert_eq!(client.get("it:key").await.unwrap().as_deref(), Some("v1"));
    client.del("it:key").await.unwrap();
    assert_eq!(client.get("it:key").await.unwrap(), None);
}

#[tokio::test]
#[ignore = "needs a running Docker daemon"]
async fn reserve_and_append_script_deduplicates() {
    let redis = TestRedis::new().await;
    let client = RedisStreamClient::connect(redis.uri())
        .await
        .unwrap();

    let mut fields = streamq::FieldMap::new();
    fields.insert("payload".to_string(), "\"x\"".to_string());

    let first = client
        .reserve_and_append("it:idem", Duration::from_secs(60), "it:jobs", &fields)
        .await
        .unwrap();
    assert!(first.created);

    let second = client
        .reserve_and_append("it:idem", Duration::from_secs(60), "it:jobs", &fields)
        .await
        .unwrap();
    assert!(!second.created);
    assert_eq!(second.value, first.value);
    assert_eq!(client.len("it:jobs").await.unwrap(), 1);
}

#[tokio::test]
#[ignore = "needs a running Docker daemon"]
async fn producer_idempotency_end_to_end() {
    let redis = TestRedis::new().await;
    let client = Arc::new(
        RedisStreamClient::connect(redis.uri())
            .await
            .unwrap(),
    );

    let producer: Producer<Job> = Producer::new(
        client.clone(),
        Arc::new(JsonCodec),
        ProducerConfig::new("it:orders")
            .with_default_kind("order.created")
            .with_idempotency(Duration::from_secs(60)),
    );

    let opts = SendOptions::default().with_key("o-1");
    let first = producer
        .send(Job { value: "a".into() }, opts.clone())
        .await
        .unwrap();
    let second = producer
        .send(Job { value: "a".into() }, opts)
        .await
        .unwrap();

    assert!(matches!(first, SendReceipt::Enqueued { .. }));
    assert!(matches!(second, SendReceipt::Deduplicated { .. }));
    assert_eq!(first.id(), second.id());
    assert_eq!(producer.stream_length().await.unwrap(), 1);
}

#[tokio::test]
#[ignore = "needs a running Docker daemon"]
async fn worker_retries_against_real_redis() {
    let redis = TestRedis::new().await;
    let client = Arc::new(
        RedisStreamClient::connect(redis.uri())
            .await
            .unwrap(),
    );

    let handler = CountingHandler::new(1);
    let worker: Worker<Job> = Worker::new(
        client.clone(),
        Arc::new(JsonCodec),
        handler.clone(),
        RetryPolicy::new(5).with_backoff(Backoff::Constant { delay_ms: 50 }),
        WorkerConfig::new("it:jobs", "workers")
            .with_batch(16, Duration::from_millis(100))
            .without_claim(),
    );
    worker.start().await.unwrap();

    let daemon = streamq::RetryDaemon::new(
        client.clone(),
        streamq::DaemonConfig::new("it:jobs:retry", "it:jobs")
            .with_tick(Duration::from_millis(50)),
    );
    daemon.start().await.unwrap();

    let producer: Producer<Job> = Producer::new(
        client.clone(),
        Arc::new(JsonCodec),
        ProducerConfig::new("it:jobs"),
    );
    producer
        .send(Job { value: "retry-me".into() }, SendOptions::kind("job"))
        .await
        .unwrap();

    assert!(wait_until(|| handler.count() == 2, Duration::from_secs(10)).await);
    assert_eq!(client.len("it:jobs:dlq").await.unwrap(), 0);

    daemon.stop().await;
    worker.stop(StopOptions::default()).await;
}
