//! Async RabbitMQ publisher for enqueueing mail jobs.
//!
//! Used by the standalone test publisher binary. The publisher keeps
//! one connection and channel, reconnecting when the broker drops
//! them, and publishes persistent JSON messages with publisher
//! confirms so a returned `Ok` means the broker has the message.

use std::sync::Arc;

use anyhow::{Context, Result};
use lapin::{
    options::BasicPublishOptions, BasicProperties, Channel, Connection, ConnectionProperties,
};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::job::MailJob;

/// Async RabbitMQ publisher with connection management.
#[derive(Clone)]
pub struct Publisher {
    inner: Arc<PublisherInner>,
}

struct PublisherInner {
    uri: String,
    queue_name: String,
    dead_letter_exchange: Option<String>,
    connection: RwLock<Option<Connection>>,
    channel: RwLock<Option<Channel>>,
}

impl Publisher {
    /// Create a new publisher for the given broker and queue.
    ///
    /// The dead-letter exchange must match what the worker declares,
    /// or the two declarations will conflict at the broker.
    pub fn new(uri: String, queue_name: String, dead_letter_exchange: Option<String>) -> Self {
        Self {
            inner: Arc::new(PublisherInner {
                uri,
                queue_name,
                dead_letter_exchange,
                connection: RwLock::new(None),
                channel: RwLock::new(None),
            }),
        }
    }

    /// Ensure we have a valid connection and channel.
    async fn ensure_connected(&self) -> Result<Channel> {
        // Check if we have a valid channel
        {
            let channel = self.inner.channel.read().await;
            if let Some(ch) = channel.as_ref() {
                if ch.status().connected() {
                    return Ok(ch.clone());
                }
            }
        }

        // Need to reconnect
        let mut connection = self.inner.connection.write().await;
        let mut channel = self.inner.channel.write().await;

        // Double-check after acquiring write lock
        if let Some(ch) = channel.as_ref() {
            if ch.status().connected() {
                return Ok(ch.clone());
            }
        }

        info!("rabbitmq_publisher_connecting");

        let conn = Connection::connect(&self.inner.uri, ConnectionProperties::default())
            .await
            .context("Failed to connect to RabbitMQ")?;

        info!("rabbitmq_publisher_connected");

        let ch = conn
            .create_channel()
            .await
            .context("Failed to create channel")?;

        // Declare the queue with the same options as the worker
        ch.queue_declare(
            &self.inner.queue_name,
            super::declare_options(),
            super::declare_args(self.inner.dead_letter_exchange.as_deref()),
        )
        .await
        .context("Failed to declare queue")?;

        info!(queue = %self.inner.queue_name, "rabbitmq_queue_declared");

        *connection = Some(conn);
        *channel = Some(ch.clone());

        Ok(ch)
    }

    /// Publish one mail job and return its message id.
    pub async fn publish(&self, job: &MailJob) -> Result<String> {
        let channel = self.ensure_connected().await?;

        let body = job.encode().context("Failed to serialize job")?;
        let message_id = generate_message_id(&job.to);

        channel
            .basic_publish(
                "",
                &self.inner.queue_name,
                BasicPublishOptions::default(),
                &body,
                BasicProperties::default()
                    .with_delivery_mode(2) // Persistent
                    .with_content_type("application/json".into())
                    .with_message_id(message_id.clone().into()),
            )
            .await
            .context("Failed to publish job")?
            .await
            .context("Failed to confirm publish")?;

        info!(
            queue = %self.inner.queue_name,
            message_id = %message_id,
            body_length = body.len(),
            "rabbitmq_job_published"
        );

        Ok(message_id)
    }

    /// Close the connection gracefully.
    pub async fn close(&self) {
        let mut connection = self.inner.connection.write().await;
        let mut channel = self.inner.channel.write().await;

        if let Some(ch) = channel.take() {
            if let Err(e) = ch.close(200, "Normal shutdown").await {
                warn!(error = %e, "rabbitmq_channel_close_error");
            }
        }

        if let Some(conn) = connection.take() {
            if let Err(e) = conn.close(200, "Normal shutdown").await {
                warn!(error = %e, "rabbitmq_connection_close_error");
            }
        }

        info!("rabbitmq_publisher_closed");
    }
}

/// Content-addressed message id: recipient plus publish instant, hashed
/// so retained logs carry no address.
fn generate_message_id(to: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(to.as_bytes());
    hasher.update(
        OffsetDateTime::now_utc()
            .unix_timestamp_nanos()
            .to_be_bytes(),
    );
    format!("job-{}", &hex::encode(hasher.finalize())[..16])
}
