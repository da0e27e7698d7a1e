//! Amazon SES v2 delivery client.
//!
//! Submits jobs through the `SendEmail` JSON API with SigV4-signed
//! requests and classifies every failure as permanent or transient.
//! The client is built once at startup and shared across all consumer
//! tasks; nothing here holds per-job state.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use super::sigv4::{sign_request, SignedHeaders, SigningKey};
use super::{DeliveryError, MailSender, SendReceipt};
use crate::config::{Config, ConfigError};
use crate::job::MailJob;

const SEND_PATH: &str = "/v2/email/outbound-emails";
const IDENTITIES_PATH: &str = "/v2/email/identities";

/// SES mail sender.
pub struct SesMailer {
    client: Client,
    key: SigningKey,
    endpoint: Url,
    host: String,
    send_from: String,
    timeout: Duration,
}

/// Successful `SendEmail` response body.
#[derive(Debug, Deserialize)]
struct SendEmailResponse {
    #[serde(rename = "MessageId")]
    message_id: Option<String>,
}

/// SES error response body.
#[derive(Debug, Deserialize)]
struct SesErrorResponse {
    #[serde(rename = "message", alias = "Message")]
    message: Option<String>,
}

/// One entry in the `ListEmailIdentities` response.
#[derive(Debug, Deserialize)]
struct EmailIdentity {
    #[serde(rename = "IdentityName")]
    identity_name: String,
    #[serde(rename = "SendingEnabled", default)]
    sending_enabled: bool,
}

#[derive(Debug, Deserialize)]
struct ListIdentitiesResponse {
    #[serde(rename = "EmailIdentities", default)]
    email_identities: Vec<EmailIdentity>,
}

/// `SendEmail` request body: single recipient, UTF-8 subject and
/// plain-text body.
#[derive(Debug, Serialize)]
struct SendEmailRequest<'a> {
    #[serde(rename = "FromEmailAddress")]
    from: &'a str,
    #[serde(rename = "Destination")]
    destination: Destination<'a>,
    #[serde(rename = "Content")]
    content: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct Destination<'a> {
    #[serde(rename = "ToAddresses")]
    to_addresses: [&'a str; 1],
}

impl SesMailer {
    /// Build the SES client from startup configuration.
    ///
    /// Constructed once and reused across jobs; per-request timeouts are
    /// applied at send time so the shared client carries no timeout of
    /// its own.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let endpoint = match &config.ses_endpoint {
            Some(url) => url.clone(),
            None => {
                let default = format!("https://email.{}.amazonaws.com", config.aws_region);
                // Region names contain no URL metacharacters
                Url::parse(&default).map_err(|e| ConfigError::InvalidVar {
                    name: "AWS_REGION",
                    reason: e.to_string(),
                })?
            }
        };

        let host = match (endpoint.host_str(), endpoint.port()) {
            (Some(h), Some(p)) => format!("{}:{}", h, p),
            (Some(h), None) => h.to_string(),
            (None, _) => {
                return Err(ConfigError::InvalidVar {
                    name: "SES_ENDPOINT",
                    reason: "endpoint has no host".to_string(),
                })
            }
        };

        let client = Client::builder().build()?;

        Ok(SesMailer {
            client,
            key: SigningKey {
                access_key_id: config.aws_access_key_id.clone(),
                secret_access_key: config.aws_secret_access_key.clone(),
                region: config.aws_region.clone(),
            },
            endpoint,
            host,
            send_from: config.send_from.clone(),
            timeout: Duration::from_millis(config.request_timeout_ms),
        })
    }

    fn signed(&self, method: &str, path: &str, body: &[u8]) -> SignedHeaders {
        sign_request(
            &self.key,
            method,
            &self.host,
            path,
            body,
            OffsetDateTime::now_utc(),
        )
    }

    fn url_for(&self, path: &str) -> String {
        // endpoint is origin-only; path starts with '/'
        format!(
            "{}{}",
            self.endpoint.as_str().trim_end_matches('/'),
            path
        )
    }

    /// Advisory startup check that the configured sender is a known,
    /// sending-enabled SES identity. Logs the result; never fatal, so
    /// transient SES API trouble cannot block the worker from starting.
    pub async fn verify_sender_identity(&self) {
        let headers = self.signed("GET", IDENTITIES_PATH, b"");

        let response = self
            .client
            .get(self.url_for(IDENTITIES_PATH))
            .timeout(self.timeout)
            .header("authorization", &headers.authorization)
            .header("x-amz-date", &headers.amz_date)
            .header("x-amz-content-sha256", &headers.content_sha256)
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "ses_identity_check_failed");
                return;
            }
        };

        if !response.status().is_success() {
            warn!(status = response.status().as_u16(), "ses_identity_check_rejected");
            return;
        }

        match response.json::<ListIdentitiesResponse>().await {
            Ok(list) => {
                let sender = list
                    .email_identities
                    .iter()
                    .find(|id| id.identity_name == self.send_from);

                match sender {
                    Some(id) if id.sending_enabled => {
                        info!(identities = list.email_identities.len(), "ses_sender_verified");
                    }
                    Some(_) => {
                        warn!("ses_sender_not_enabled_for_sending");
                    }
                    None => {
                        warn!(
                            identities = list.email_identities.len(),
                            "ses_sender_not_among_identities"
                        );
                    }
                }
            }
            Err(e) => warn!(error = %e, "ses_identity_check_unreadable"),
        }
    }
}

#[async_trait]
impl MailSender for SesMailer {
    async fn send(
        &self,
        cancel: &CancellationToken,
        job: &MailJob,
    ) -> Result<SendReceipt, DeliveryError> {
        // Fail fast rather than starting I/O that will be abandoned
        if cancel.is_cancelled() {
            return Err(DeliveryError::Transient(
                "delivery cancelled before submission".to_string(),
            ));
        }

        let request = SendEmailRequest {
            from: &self.send_from,
            destination: Destination {
                to_addresses: [&job.to],
            },
            content: json!({
                "Simple": {
                    "Subject": { "Data": job.subject, "Charset": "UTF-8" },
                    "Body": {
                        "Text": { "Data": job.message, "Charset": "UTF-8" }
                    }
                }
            }),
        };

        let body = serde_json::to_vec(&request)
            .map_err(|e| DeliveryError::Permanent(format!("unserializable job: {}", e)))?;

        let headers = self.signed("POST", SEND_PATH, &body);

        debug!(to = %job.to, body_length = body.len(), "ses_send_starting");

        let call = self
            .client
            .post(self.url_for(SEND_PATH))
            .timeout(self.timeout)
            .header("content-type", "application/json")
            .header("authorization", &headers.authorization)
            .header("x-amz-date", &headers.amz_date)
            .header("x-amz-content-sha256", &headers.content_sha256)
            .body(body)
            .send();

        let response = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(DeliveryError::Transient(
                    "delivery cancelled in flight".to_string(),
                ));
            }
            result = call => result.map_err(classify_request_error)?,
        };

        let status = response.status();

        if status.is_success() {
            let receipt = response
                .json::<SendEmailResponse>()
                .await
                .map(|r| SendReceipt {
                    provider_message_id: r.message_id,
                })
                .unwrap_or(SendReceipt {
                    provider_message_id: None,
                });

            return Ok(receipt);
        }

        let error_type = response
            .headers()
            .get("x-amzn-errortype")
            .and_then(|v| v.to_str().ok())
            .map(normalize_error_type);

        let reason = response
            .json::<SesErrorResponse>()
            .await
            .ok()
            .and_then(|e| e.message)
            .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));

        Err(classify_failure(status, error_type.as_deref(), reason))
    }
}

/// Classify a reqwest transport error.
///
/// Everything that never reached the provider, or timed out on the way,
/// may succeed on retry.
fn classify_request_error(error: reqwest::Error) -> DeliveryError {
    if error.is_timeout() || error.is_connect() || error.is_request() {
        DeliveryError::Transient(error.to_string())
    } else {
        DeliveryError::Permanent(error.to_string())
    }
}

/// Classify an SES failure response.
///
/// Server errors, throttling, and sending-limit errors are worth
/// retrying; any other client error (bad recipient, rejected content,
/// bad credentials) will fail the same way every time.
fn classify_failure(status: StatusCode, error_type: Option<&str>, reason: String) -> DeliveryError {
    let throttled = matches!(
        error_type,
        Some(
            "TooManyRequestsException"
                | "ThrottlingException"
                | "LimitExceededException"
                | "ServiceUnavailableException"
        )
    );

    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS || throttled {
        DeliveryError::Transient(format!("{}: {}", status.as_u16(), reason))
    } else {
        DeliveryError::Permanent(format!("{}: {}", status.as_u16(), reason))
    }
}

/// Normalize an `x-amzn-ErrorType` header value.
///
/// AWS sends values like `TooManyRequestsException:http://...` or
/// `com.amazonaws.ses#BadRequestException`; strip both decorations down
/// to the bare exception name.
fn normalize_error_type(raw: &str) -> String {
    let before_colon = raw.split(':').next().unwrap_or(raw);
    let after_hash = before_colon.rsplit('#').next().unwrap_or(before_colon);
    after_hash.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_server_errors_transient() {
        for code in [500u16, 502, 503, 504] {
            let status = StatusCode::from_u16(code).unwrap();
            let result = classify_failure(status, None, "oops".to_string());
            assert!(result.is_transient(), "HTTP {} should be transient", code);
        }
    }

    #[test]
    fn test_classify_throttling_transient() {
        let result = classify_failure(StatusCode::TOO_MANY_REQUESTS, None, "slow down".to_string());
        assert!(result.is_transient());
    }

    #[test]
    fn test_classify_throttling_error_type_overrides_status() {
        // SES sometimes reports throttling under a 400
        let result = classify_failure(
            StatusCode::BAD_REQUEST,
            Some("TooManyRequestsException"),
            "rate exceeded".to_string(),
        );
        assert!(result.is_transient());
    }

    #[test]
    fn test_classify_client_errors_permanent() {
        for code in [400u16, 403, 404] {
            let status = StatusCode::from_u16(code).unwrap();
            let result = classify_failure(status, Some("BadRequestException"), "rejected".to_string());
            assert!(!result.is_transient(), "HTTP {} should be permanent", code);
        }
    }

    #[test]
    fn test_classify_carries_reason() {
        let result = classify_failure(StatusCode::BAD_REQUEST, None, "address malformed".to_string());
        assert!(result.to_string().contains("address malformed"));
        assert!(result.to_string().contains("400"));
    }

    #[test]
    fn test_normalize_error_type() {
        assert_eq!(
            normalize_error_type("TooManyRequestsException:http://ses.amazonaws.com/"),
            "TooManyRequestsException"
        );
        assert_eq!(
            normalize_error_type("com.amazonaws.ses#BadRequestException"),
            "BadRequestException"
        );
        assert_eq!(normalize_error_type("NotFoundException"), "NotFoundException");
    }

    #[test]
    fn test_send_request_json_shape() {
        let request = SendEmailRequest {
            from: "sender@example.com",
            destination: Destination {
                to_addresses: ["a@example.com"],
            },
            content: json!({
                "Simple": {
                    "Subject": { "Data": "Hi", "Charset": "UTF-8" },
                    "Body": { "Text": { "Data": "Body", "Charset": "UTF-8" } }
                }
            }),
        };

        let value: serde_json::Value =
            serde_json::from_slice(&serde_json::to_vec(&request).unwrap()).unwrap();

        assert_eq!(value["FromEmailAddress"], "sender@example.com");
        assert_eq!(value["Destination"]["ToAddresses"][0], "a@example.com");
        assert_eq!(value["Content"]["Simple"]["Subject"]["Data"], "Hi");
        assert_eq!(value["Content"]["Simple"]["Body"]["Text"]["Data"], "Body");
    }

    #[tokio::test]
    async fn test_send_fails_fast_when_cancelled() {
        let mailer = SesMailer::from_config(&Config::test_default()).unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();

        let job = MailJob::new("a@example.com", "Hi", "Body");
        let result = mailer.send(&cancel, &job).await;

        // No request is made; the error is transient so the message is requeued
        match result {
            Err(DeliveryError::Transient(_)) => {}
            other => panic!("expected transient failure, got {:?}", other.map(|r| r.provider_message_id)),
        }
    }

    #[test]
    fn test_endpoint_defaults_to_region() {
        let mut config = Config::test_default();
        config.aws_region = "eu-west-1".to_string();

        let mailer = SesMailer::from_config(&config).unwrap();
        assert_eq!(mailer.host, "email.eu-west-1.amazonaws.com");
        assert_eq!(
            mailer.url_for(SEND_PATH),
            "https://email.eu-west-1.amazonaws.com/v2/email/outbound-emails"
        );
    }

    #[test]
    fn test_endpoint_override_keeps_port() {
        let mut config = Config::test_default();
        config.ses_endpoint = Some(Url::parse("http://localhost:8005").unwrap());

        let mailer = SesMailer::from_config(&config).unwrap();
        assert_eq!(mailer.host, "localhost:8005");
    }
}
