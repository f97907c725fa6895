//! Redis test infrastructure
//!
//! Provides a `TestRedis` helper that runs a throwaway Redis container and
//! hands out connections to it. The container is removed when the helper is
//! dropped (testcontainers handles cleanup).

use redis::aio::MultiplexedConnection;
use redis::Client;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::redis::Redis;

/// Image tag used by [`TestRedis::new`].
const DEFAULT_TAG: &str = "8-alpine";

/// A throwaway Redis server for integration tests.
///
/// `new()` blocks until the server answers a PING, so a test that gets a
/// `TestRedis` back can start issuing commands immediately.
pub struct TestRedis {
    #[allow(dead_code)]
    container: ContainerAsync<Redis>,
    uri: String,
}

impl TestRedis {
    /// Start a Redis container with the default image tag.
    pub async fn new() -> Self {
        Self::with_tag(DEFAULT_TAG).await
    }

    /// Start a Redis container with a specific image tag, e.g. to pin a
    /// server version a regression depends on.
    pub async fn with_tag(tag: &str) -> Self {
        let container = Redis::default()
            .with_tag(tag)
            .start()
            .await
            .unwrap_or_else(|e| panic!("Redis container ({tag}) failed to start: {e}"));

        let port = container
            .get_host_port_ipv4(6379)
            .await
            .unwrap_or_else(|e| panic!("Redis container exposes no port 6379: {e}"));
        let uri = format!("redis://127.0.0.1:{port}");

        // Probe the server once so a broken container fails the test here,
        // not in its first real command.
        let mut conn = Self::open(&uri).await;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .unwrap_or_else(|e| panic!("Redis at {uri} did not answer PING: {e}"));

        tracing::info!(uri = %uri, tag = %tag, "Test Redis ready");

        Self { container, uri }
    }

    /// Connection URI of the containerized server.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Open a fresh multiplexed connection. Each caller gets its own, so
    /// tests can simulate independent clients against one server.
    pub async fn connection(&self) -> MultiplexedConnection {
        Self::open(&self.uri).await
    }

    async fn open(uri: &str) -> MultiplexedConnection {
        let client =
            Client::open(uri).unwrap_or_else(|e| panic!("Invalid Redis URI {uri}: {e}"));
        client
            .get_multiplexed_async_connection()
            .await
            .unwrap_or_else(|e| panic!("Could not connect to Redis at {uri}: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redis::AsyncCommands;

    #[tokio::test]
    #[ignore = "needs a running Docker daemon"]
    async fn test_round_trip_through_container() {
        let redis = TestRedis::new().await;
        assert!(redis.uri().starts_with("redis://127.0.0.1:"));

        let mut conn = redis.connection().await;
        conn.set::<_, _, ()>("probe", "alive").await.unwrap();

        // A second connection sees the same server.
        let mut other = redis.connection().await;
        let value: String = other.get("probe").await.unwrap();
        assert_eq!(value, "alive");
    }
}
