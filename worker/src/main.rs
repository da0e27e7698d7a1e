//! Mail relay worker - async RabbitMQ consumer delivering jobs to SES.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use mailrelay::{consumer, Config, SesMailer, Shutdown};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    tracing::info!("worker_starting");

    // Load configuration from environment; missing credentials abort
    // here, before anything is consumed
    let config = Config::from_env()?;
    tracing::info!(
        worker_name = %config.worker_name,
        queue = %config.queue_name,
        region = %config.aws_region,
        consumers = config.worker_consumers,
        max_delivery_attempts = config.max_delivery_attempts,
        "config_loaded"
    );

    let mailer = SesMailer::from_config(&config)?;

    // Advisory check that the sender is a known SES identity
    mailer.verify_sender_identity().await;

    let shutdown = Shutdown::new(Duration::from_millis(config.shutdown_grace_ms));
    let signals = shutdown.clone();
    tokio::spawn(async move { signals.listen_for_signals().await });

    consumer::run(config, Arc::new(mailer), shutdown).await?;

    Ok(())
}
