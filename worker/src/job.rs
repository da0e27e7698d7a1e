//! Mail job wire format.
//!
//! A `MailJob` is the unit of work carried by the queue: one recipient,
//! one subject, one plain-text body. Jobs are published as JSON and
//! decoded back on the consumer side.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error raised when a queue payload cannot be turned into a usable job.
///
/// Decode failures are terminal for the message that carried them: a
/// payload that does not parse today will not parse on redelivery either.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The payload is not valid JSON or is missing required fields.
    #[error("malformed mail job payload: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The payload parsed, but a required field is empty.
    #[error("mail job field `{0}` is empty")]
    EmptyField(&'static str),
}

/// One email-send request.
///
/// Field names match the publisher's wire format:
/// `{"to": "...", "subject": "...", "message": "..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailJob {
    /// Recipient email address.
    pub to: String,
    /// Subject line.
    pub subject: String,
    /// Plain-text body.
    pub message: String,
}

impl MailJob {
    /// Create a new mail job.
    pub fn new(
        to: impl Into<String>,
        subject: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            to: to.into(),
            subject: subject.into(),
            message: message.into(),
        }
    }

    /// Decode a queue message payload into a job.
    ///
    /// All three fields must be present and non-empty; the provider
    /// rejects anything less, so incomplete jobs are caught here instead
    /// of wasting a delivery attempt. Unknown fields are ignored.
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        let job: Self = serde_json::from_slice(data)?;

        if job.to.is_empty() {
            return Err(DecodeError::EmptyField("to"));
        }
        if job.subject.is_empty() {
            return Err(DecodeError::EmptyField("subject"));
        }
        if job.message.is_empty() {
            return Err(DecodeError::EmptyField("message"));
        }

        Ok(job)
    }

    /// Serialize the job for transport.
    ///
    /// Deterministic: decoding the result yields a job equal to `self`.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let job = MailJob::new("user@example.com", "Greetings", "Hello there.");

        let encoded = job.encode().unwrap();
        let decoded = MailJob::decode(&encoded).unwrap();

        assert_eq!(decoded, job);
    }

    #[test]
    fn test_decode_full_payload() {
        let payload = br#"{"to":"a@example.com","subject":"Hi","message":"Body"}"#;

        let job = MailJob::decode(payload).unwrap();

        assert_eq!(job.to, "a@example.com");
        assert_eq!(job.subject, "Hi");
        assert_eq!(job.message, "Body");
    }

    #[test]
    fn test_decode_missing_fields() {
        let result = MailJob::decode(br#"{"to":"bad"}"#);

        assert!(matches!(result, Err(DecodeError::Malformed(_))));
    }

    #[test]
    fn test_decode_not_json() {
        let result = MailJob::decode(b"not-json");

        assert!(matches!(result, Err(DecodeError::Malformed(_))));
    }

    #[test]
    fn test_decode_empty_field() {
        let payload = br#"{"to":"","subject":"Hi","message":"Body"}"#;

        let result = MailJob::decode(payload);

        assert!(matches!(result, Err(DecodeError::EmptyField("to"))));
    }

    #[test]
    fn test_decode_ignores_unknown_fields() {
        let payload =
            br#"{"to":"a@example.com","subject":"Hi","message":"Body","priority":"high"}"#;

        let job = MailJob::decode(payload).unwrap();

        assert_eq!(job.to, "a@example.com");
    }
}
