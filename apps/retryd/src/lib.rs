//! Retry Daemon Service
//!
//! Drains the retry sorted set back into its target stream at due time.
//!
//! ```text
//! <stream>:retry (sorted set, score = due epoch-ms)
//!   | (RetryDaemon, tick + jitter)
//! <stream> (main jobs stream)
//! ```
//!
//! Configuration comes from the environment:
//! - `REDIS_HOST`: Redis/Valkey URI (required)
//! - `RETRY_ZSET`: sorted set to drain (required)
//! - `TARGET_STREAM`: fallback stream for members that don't name one (required)
//! - `RETRY_MAX_BATCH`: members per tick (default 256)
//! - `RETRY_TICK_MS`: tick cadence in milliseconds (default 250)
//! - `RETRY_JITTER_PCT`: relative tick jitter (default 0.2)

use core_config::{env_parse_or, env_required, redis::RedisConfig, ConfigError, Environment, FromEnv};
use eyre::{Result, WrapErr};
use std::sync::Arc;
use std::time::Duration;
use streamq::{DaemonConfig, RedisStreamClient, RetryDaemon};
use tokio::signal;
use tracing::info;

/// Daemon settings loaded from the environment.
#[derive(Debug, Clone)]
pub struct RetrydConfig {
    pub redis: RedisConfig,
    pub daemon: DaemonConfig,
}

impl RetrydConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let redis = RedisConfig::from_env()?;

        let retry_zset = env_required("RETRY_ZSET")?;
        let target_stream = env_required("TARGET_STREAM")?;
        let max_batch: usize = env_parse_or("RETRY_MAX_BATCH", 256)?;
        let tick_ms: u64 = env_parse_or("RETRY_TICK_MS", 250)?;
        let jitter_pct: f64 = env_parse_or("RETRY_JITTER_PCT", 0.2)?;

        let daemon = DaemonConfig::new(retry_zset, target_stream)
            .with_max_batch(max_batch)
            .with_tick(Duration::from_millis(tick_ms))
            .with_jitter_pct(jitter_pct);

        Ok(Self { redis, daemon })
    }
}

/// Run the retry daemon until SIGINT/SIGTERM.
pub async fn run() -> Result<()> {
    let environment = Environment::from_env();
    core_config::tracing::init_tracing(&environment);

    let config = RetrydConfig::from_env().wrap_err("Failed to load retry daemon configuration")?;
    info!(
        retry_zset = %config.daemon.retry_zset,
        target_stream = %config.daemon.target_stream,
        tick_ms = %config.daemon.tick.as_millis(),
        "Starting retry daemon service"
    );

    info!("Connecting to Redis...");
    let client = RedisStreamClient::connect(&config.redis.uri)
        .await
        .wrap_err("Failed to connect to Redis")?;
    info!("Connected to Redis successfully");

    let daemon = RetryDaemon::new(Arc::new(client), config.daemon);
    daemon.start().await.wrap_err("Failed to start retry daemon")?;

    shutdown_signal().await?;

    info!("Draining and stopping retry daemon...");
    daemon.stop().await;
    info!("Retry daemon service stopped");
    Ok(())
}

/// Wait for a shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() -> Result<()> {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown...");
        },
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        },
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_from_env() {
        temp_env::with_vars(
            [
                ("REDIS_HOST", Some("redis://localhost:6379")),
                ("RETRY_ZSET", Some("jobs:retry")),
                ("TARGET_STREAM", Some("jobs")),
                ("RETRY_TICK_MS", Some("100")),
            ],
            || {
                let config = RetrydConfig::from_env().unwrap();
                assert_eq!(config.redis.uri, "redis://localhost:6379");
                assert_eq!(config.daemon.retry_zset, "jobs:retry");
                assert_eq!(config.daemon.target_stream, "jobs");
                assert_eq!(config.daemon.tick, Duration::from_millis(100));
                assert_eq!(config.daemon.max_batch, 256);
            },
        );
    }

    #[test]
    fn test_config_requires_zset() {
        temp_env::with_vars(
            [
                ("REDIS_HOST", Some("redis://localhost:6379")),
                ("RETRY_ZSET", None::<&str>),
                ("TARGET_STREAM", Some("jobs")),
            ],
            || {
                let err = RetrydConfig::from_env().unwrap_err();
                assert!(err.to_string().contains("RETRY_ZSET"));
            },
        );
    }
}
