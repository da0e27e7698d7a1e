//! Manual test publisher - enqueues one mail job.
//!
//! External client of the queue, not part of the worker. Reads the
//! broker and recipient from the environment and publishes a single
//! persistent job the worker will pick up.

use std::env;

use anyhow::{bail, Result};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use mailrelay::{MailJob, Publisher};

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    let uri = require("AMQP_URI")?;
    let queue_name = require("QUEUE_NAME")?;
    let send_to = require("SEND_TO")?;

    let subject = env::var("SEND_SUBJECT").unwrap_or_else(|_| "Test Email".to_string());
    let message = env::var("SEND_MESSAGE")
        .unwrap_or_else(|_| "This is a test email from the mail relay worker.".to_string());
    let dead_letter_exchange = env::var("DEAD_LETTER_EXCHANGE").ok().filter(|v| !v.is_empty());

    let job = MailJob::new(send_to, subject, message);

    let publisher = Publisher::new(uri, queue_name, dead_letter_exchange);
    let message_id = publisher.publish(&job).await?;
    publisher.close().await;

    tracing::info!(message_id = %message_id, "test_job_published");

    Ok(())
}

fn require(name: &str) -> Result<String> {
    match env::var(name) {
        Ok(v) if !v.is_empty() => Ok(v),
        _ => bail!("required environment variable {} is not set", name),
    }
}
