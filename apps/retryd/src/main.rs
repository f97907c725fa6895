//! Retry Daemon - Entry Point
//!
//! Background daemon that moves due retry entries back into their streams.

#[tokio::main]
async fn main() -> eyre::Result<()> {
    streamq_retryd::run().await
}
