//! RabbitMQ consumer pool.
//!
//! Connects once, then runs a fixed-size pool of consumer tasks, each
//! with its own channel, prefetch of 1, and a unique consumer tag.
//! Every message is processed sequentially within its task and settled
//! with the broker only after its disposition is known - manual ack,
//! never ack on receipt.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use futures::StreamExt;
use lapin::{
    message::Delivery,
    options::{BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions},
    types::FieldTable,
    Connection, ConnectionProperties,
};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::mailer::MailSender;
use crate::processor::{process_delivery, Disposition, RetryPolicy};
use crate::queue;
use crate::shutdown::Shutdown;

/// Run the consumer pool until shutdown or broker loss.
///
/// Startup failures (connect, channel, declare) are fatal; a consumer
/// stream ending while the worker is running is also an error so a
/// supervisor restarts the process, rather than leaving it idle with a
/// dead subscription.
pub async fn run(
    config: Config,
    mailer: Arc<dyn MailSender>,
    shutdown: Shutdown,
) -> Result<()> {
    info!(consumers = config.worker_consumers, "rabbitmq_connecting");

    let conn = Connection::connect(&config.amqp_uri, ConnectionProperties::default())
        .await
        .context("Failed to connect to RabbitMQ")?;

    info!("rabbitmq_connected");

    let config = Arc::new(config);
    let retry = Arc::new(RetryPolicy::from_config(&config));

    let mut tasks = Vec::with_capacity(config.worker_consumers);
    for index in 0..config.worker_consumers {
        let channel = conn
            .create_channel()
            .await
            .context("Failed to create channel")?;

        // One unsettled message per consumer; an idle consumer elsewhere
        // should pick up the next message instead
        channel
            .basic_qos(1, BasicQosOptions::default())
            .await
            .context("Failed to set QoS")?;

        channel
            .queue_declare(
                &config.queue_name,
                queue::declare_options(),
                queue::declare_args(config.dead_letter_exchange.as_deref()),
            )
            .await
            .context("Failed to declare queue")?;

        let consumer_tag = config.consumer_tag(index);
        let consumer = channel
            .basic_consume(
                &config.queue_name,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .context("Failed to start consumer")?;

        info!(
            queue = %config.queue_name,
            consumer_tag = %consumer_tag,
            "rabbitmq_consumer_started"
        );

        let config = Arc::clone(&config);
        let mailer = Arc::clone(&mailer);
        let retry = Arc::clone(&retry);
        let shutdown = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            consume_loop(consumer, consumer_tag, config, mailer, retry, shutdown).await
        }));
    }

    info!("worker_ready");

    let results = futures::future::join_all(tasks).await;

    if let Err(e) = conn.close(200, "Normal shutdown").await {
        warn!(error = %e, "rabbitmq_connection_close_error");
    }

    for result in results {
        result.context("Consumer task panicked")??;
    }

    info!("worker_shutdown_complete");
    Ok(())
}

/// One consumer task: pull, process, settle, repeat until told to stop.
async fn consume_loop(
    mut consumer: lapin::Consumer,
    consumer_tag: String,
    config: Arc<Config>,
    mailer: Arc<dyn MailSender>,
    retry: Arc<RetryPolicy>,
    shutdown: Shutdown,
) -> Result<()> {
    let stop = shutdown.stop_token();
    let abort = shutdown.abort_token();

    loop {
        tokio::select! {
            biased;

            _ = stop.cancelled() => {
                info!(consumer_tag = %consumer_tag, "consumer_stopping");
                return Ok(());
            }

            delivery = consumer.next() => {
                match delivery {
                    Some(Ok(delivery)) => {
                        handle_message(&delivery, &consumer_tag, &mailer, &retry, &stop, &abort)
                            .await;
                    }
                    Some(Err(e)) => {
                        // One bad frame must not halt consumption
                        error!(consumer_tag = %consumer_tag, error = %e, "rabbitmq_delivery_error");
                    }
                    None => {
                        warn!(
                            consumer_tag = %consumer_tag,
                            queue = %config.queue_name,
                            "rabbitmq_consumer_closed"
                        );
                        // Wind down the rest of the pool so the process
                        // exits and a supervisor can restart it
                        shutdown.begin();
                        bail!("consumer stream for {} closed unexpectedly", consumer_tag);
                    }
                }
            }
        }
    }
}

/// Process one delivery through the state machine and settle it.
async fn handle_message(
    delivery: &Delivery,
    consumer_tag: &str,
    mailer: &Arc<dyn MailSender>,
    retry: &RetryPolicy,
    stop: &tokio_util::sync::CancellationToken,
    abort: &tokio_util::sync::CancellationToken,
) {
    let message_id = delivery
        .properties
        .message_id()
        .as_ref()
        .map(|s| s.to_string())
        .unwrap_or_else(|| "unknown".to_string());

    info!(
        consumer_tag = %consumer_tag,
        message_id = %message_id,
        delivery_tag = delivery.delivery_tag,
        redelivered = delivery.redelivered,
        "rabbitmq_job_received"
    );

    let disposition = process_delivery(
        mailer.as_ref(),
        retry,
        stop,
        abort,
        &message_id,
        &delivery.data,
        delivery.redelivered,
    )
    .await;

    settle(delivery, disposition, &message_id).await;
}

/// Settle a processed message with the broker.
///
/// The ack handle is consumed exactly once; a settle failure means the
/// channel is gone and the broker will redeliver the message anyway, so
/// it is logged and not retried here.
async fn settle(delivery: &Delivery, disposition: Disposition, message_id: &str) {
    let result = match disposition {
        Disposition::Ack => delivery.ack(BasicAckOptions::default()).await,
        Disposition::Requeue => {
            delivery
                .nack(BasicNackOptions {
                    requeue: true,
                    ..Default::default()
                })
                .await
        }
        Disposition::Drop => {
            delivery
                .nack(BasicNackOptions {
                    requeue: false,
                    ..Default::default()
                })
                .await
        }
    };

    match result {
        Ok(()) => {
            info!(
                message_id = %message_id,
                delivery_tag = delivery.delivery_tag,
                disposition = ?disposition,
                "rabbitmq_job_settled"
            );
        }
        Err(e) => {
            error!(
                message_id = %message_id,
                delivery_tag = delivery.delivery_tag,
                disposition = ?disposition,
                error = %e,
                "rabbitmq_settle_failed"
            );
        }
    }
}
