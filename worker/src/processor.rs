//! Per-message processing - decode, deliver, decide.
//!
//! `process_delivery` runs one queue message through the state machine
//! `Received → Decoding → Delivering → {Ack | Requeue | Drop}` and hands
//! the resulting `Disposition` back to the consumer, which settles the
//! message with the broker. Nothing here touches the broker directly,
//! which keeps the whole state machine testable with a scripted sender.

use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::job::MailJob;
use crate::mailer::MailSender;

/// Terminal state for one queue message.
///
/// Acknowledgment is performed only after the disposition is known;
/// the consumer never acks on receipt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Delivery succeeded; acknowledge.
    Ack,
    /// Transient failure with retry budget left at the broker; nack
    /// with requeue.
    Requeue,
    /// The message can never succeed (or has exhausted its budget);
    /// nack without requeue. The broker dead-letters it when the queue
    /// has a dead-letter exchange configured.
    Drop,
}

/// Bounded exponential backoff between in-process delivery attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts per consumption, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt, in milliseconds.
    pub base_ms: u64,
    /// Upper bound on any delay, in milliseconds.
    pub cap_ms: u64,
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_attempts: config.max_delivery_attempts.max(1),
            base_ms: config.retry_backoff_ms.0,
            cap_ms: config.retry_backoff_ms.1,
        }
    }

    /// Delay before the attempt following `attempt` (1-indexed).
    ///
    /// Doubles per attempt from the base, capped, with up to ±25%
    /// jitter to spread redelivery storms across workers.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let raw = self
            .base_ms
            .saturating_mul(1u64 << exponent)
            .min(self.cap_ms);

        let jitter_span = raw / 4;
        let jittered = if jitter_span > 0 {
            let offset = rand::thread_rng().gen_range(0..=jitter_span * 2);
            raw - jitter_span + offset
        } else {
            raw
        };

        Duration::from_millis(jittered.min(self.cap_ms))
    }
}

/// Process one queue message through to its disposition.
///
/// `stop` marks shutdown: no more backoff waiting, and transient
/// failures are always requeued so shutdown cannot lose messages.
/// `abort` propagates into the delivery call to cut off in-flight
/// provider I/O once the grace period expires. `redelivered` is the
/// broker's flag for a message consumed before; it bounds cross-delivery
/// retries to a single requeue.
pub async fn process_delivery(
    mailer: &dyn MailSender,
    retry: &RetryPolicy,
    stop: &CancellationToken,
    abort: &CancellationToken,
    message_id: &str,
    payload: &[u8],
    redelivered: bool,
) -> Disposition {
    let job = match MailJob::decode(payload) {
        Ok(job) => job,
        Err(e) => {
            // A payload that does not decode now will not decode on
            // redelivery either
            warn!(
                message_id = %message_id,
                error = %e,
                "job_decode_failed"
            );
            return Disposition::Drop;
        }
    };

    debug!(message_id = %message_id, to = %job.to, "job_decoded");

    let mut attempt = 1u32;
    loop {
        match mailer.send(abort, &job).await {
            Ok(receipt) => {
                info!(
                    message_id = %message_id,
                    attempt = attempt,
                    provider_message_id = receipt.provider_message_id.as_deref().unwrap_or("none"),
                    "job_delivered"
                );
                return Disposition::Ack;
            }
            Err(e) if !e.is_transient() => {
                warn!(
                    message_id = %message_id,
                    attempt = attempt,
                    error = %e,
                    "job_delivery_permanent_failure"
                );
                return Disposition::Drop;
            }
            Err(e) => {
                warn!(
                    message_id = %message_id,
                    attempt = attempt,
                    max_attempts = retry.max_attempts,
                    error = %e,
                    "job_delivery_transient_failure"
                );

                // Dropping because the worker is exiting would turn
                // shutdown into message loss
                if stop.is_cancelled() {
                    return Disposition::Requeue;
                }

                if attempt >= retry.max_attempts {
                    return if redelivered {
                        info!(
                            message_id = %message_id,
                            "job_retry_budget_exhausted"
                        );
                        Disposition::Drop
                    } else {
                        Disposition::Requeue
                    };
                }

                let delay = retry.delay_for(attempt);
                tokio::select! {
                    _ = stop.cancelled() => return Disposition::Requeue,
                    _ = sleep(delay) => {}
                }
                attempt += 1;
            }
        }
    }
}
