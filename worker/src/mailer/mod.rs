//! Mail delivery adapter.
//!
//! The `MailSender` trait isolates the consumption loop from
//! provider-specific protocol details; `SesMailer` is the Amazon SES
//! implementation. Delivery failures are classified as permanent or
//! transient, which is what drives acknowledgment decisions upstream.

pub mod ses;
pub mod sigv4;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::job::MailJob;

pub use ses::SesMailer;

/// Error returned by a failed delivery attempt.
///
/// The classification decides what happens to the message: permanent
/// failures are dropped without retry, transient failures are retried up
/// to the configured bound.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The provider rejected the job and will reject it again
    /// (bad recipient, rejected content, authorization failure).
    #[error("permanent delivery failure: {0}")]
    Permanent(String),

    /// The attempt failed for a reason that may clear up
    /// (network error, timeout, provider unavailable, throttling).
    #[error("transient delivery failure: {0}")]
    Transient(String),
}

impl DeliveryError {
    /// Whether a retry of the same job could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, DeliveryError::Transient(_))
    }
}

/// Successful delivery acknowledgment from the provider.
#[derive(Debug, Clone)]
pub struct SendReceipt {
    /// Provider-assigned message id, when the provider returns one.
    pub provider_message_id: Option<String>,
}

/// Async mail sending trait.
///
/// Implement this trait to provide alternative delivery backends; the
/// consumption loop only ever sees this seam.
#[async_trait]
pub trait MailSender: Send + Sync + 'static {
    /// Submit one job for delivery.
    ///
    /// Must respect cancellation: if `cancel` is already cancelled the
    /// call fails fast with a transient error instead of starting I/O,
    /// and an in-flight request is abandoned when `cancel` fires.
    async fn send(
        &self,
        cancel: &CancellationToken,
        job: &MailJob,
    ) -> Result<SendReceipt, DeliveryError>;
}
