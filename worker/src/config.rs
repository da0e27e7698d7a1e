//! Configuration module for environment variable parsing.
//!
//! All configuration is read once at startup into an immutable `Config`
//! that is passed explicitly into each component. Required variables
//! produce a typed `ConfigError` so a missing credential aborts the
//! process before any message is consumed.

use std::env;

use thiserror::Error;
use tracing::warn;
use url::Url;

/// Error raised when startup configuration is missing or invalid.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is unset or empty.
    #[error("required environment variable {0} is not set")]
    MissingVar(&'static str),

    /// An environment variable is set but cannot be parsed.
    #[error("environment variable {name} is invalid: {reason}")]
    InvalidVar { name: &'static str, reason: String },

    /// The HTTP client for the delivery provider could not be built.
    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),
}

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Worker name used as the consumer identity prefix
    pub worker_name: String,

    /// RabbitMQ connection URI
    pub amqp_uri: String,

    /// Durable queue to consume mail jobs from
    pub queue_name: String,

    /// AWS access key id for the SES API
    pub aws_access_key_id: String,

    /// AWS secret access key for the SES API
    pub aws_secret_access_key: String,

    /// AWS region the SES endpoint lives in
    pub aws_region: String,

    /// Optional SES endpoint override (local stack / test double)
    pub ses_endpoint: Option<Url>,

    /// Verified sender address for outbound mail
    pub send_from: String,

    /// Number of consumer tasks, each with its own channel
    pub worker_consumers: usize,

    /// Maximum in-process delivery attempts per consumption
    pub max_delivery_attempts: u32,

    /// Backoff delay range in milliseconds between attempts (base, cap)
    pub retry_backoff_ms: (u64, u64),

    /// HTTP request timeout in milliseconds
    pub request_timeout_ms: u64,

    /// Grace period in milliseconds for in-flight deliveries at shutdown
    pub shutdown_grace_ms: u64,

    /// Optional dead-letter exchange for dropped messages
    pub dead_letter_exchange: Option<String>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required variables fail with `ConfigError`; optional tunables warn
    /// and fall back to their defaults when unparseable.
    pub fn from_env() -> Result<Self, ConfigError> {
        let ses_endpoint = match optional("SES_ENDPOINT") {
            Some(raw) => Some(Url::parse(&raw).map_err(|e| ConfigError::InvalidVar {
                name: "SES_ENDPOINT",
                reason: e.to_string(),
            })?),
            None => None,
        };

        Ok(Config {
            worker_name: required("WORKER_NAME")?,

            amqp_uri: required("AMQP_URI")?,

            queue_name: required("QUEUE_NAME")?,

            aws_access_key_id: required("AWS_ACCESS_KEY_ID")?,

            aws_secret_access_key: required("AWS_SECRET_ACCESS_KEY")?,

            aws_region: optional("AWS_REGION").unwrap_or_else(|| "us-east-1".to_string()),

            ses_endpoint,

            send_from: required("SEND_FROM")?,

            worker_consumers: parse_or("WORKER_CONSUMERS", 4),

            max_delivery_attempts: parse_or("MAX_DELIVERY_ATTEMPTS", 3),

            retry_backoff_ms: parse_range("RETRY_BACKOFF_MS", (250, 5000)),

            request_timeout_ms: parse_or("REQUEST_TIMEOUT_MS", 10_000),

            shutdown_grace_ms: parse_or("SHUTDOWN_GRACE_MS", 20_000),

            dead_letter_exchange: optional("DEAD_LETTER_EXCHANGE"),
        })
    }

    /// Consumer tag for one consumer task in the pool.
    ///
    /// Composed from worker name, process id, user id, and pool index so
    /// every consumer of every worker instance is distinguishable at the
    /// broker.
    pub fn consumer_tag(&self, index: usize) -> String {
        format!(
            "{}-{}-{}-{}",
            self.worker_name,
            std::process::id(),
            current_uid(),
            index
        )
    }
}

#[cfg(test)]
impl Config {
    /// Baseline configuration for unit tests.
    pub(crate) fn test_default() -> Self {
        Config {
            worker_name: "relay".to_string(),
            amqp_uri: "amqp://localhost:5672".to_string(),
            queue_name: "mail_jobs".to_string(),
            aws_access_key_id: "AKIDEXAMPLE".to_string(),
            aws_secret_access_key: "secret".to_string(),
            aws_region: "us-east-1".to_string(),
            ses_endpoint: None,
            send_from: "sender@example.com".to_string(),
            worker_consumers: 1,
            max_delivery_attempts: 3,
            retry_backoff_ms: (250, 5000),
            request_timeout_ms: 10_000,
            shutdown_grace_ms: 20_000,
            dead_letter_exchange: None,
        }
    }
}

#[cfg(unix)]
fn current_uid() -> u32 {
    // Safe: getuid has no failure modes
    unsafe { libc::getuid() }
}

#[cfg(not(unix))]
fn current_uid() -> u32 {
    0
}

/// Read a required variable; empty counts as unset.
fn required(name: &'static str) -> Result<String, ConfigError> {
    match env::var(name) {
        Ok(v) if !v.is_empty() => Ok(v),
        _ => Err(ConfigError::MissingVar(name)),
    }
}

/// Read an optional variable; empty counts as unset.
fn optional(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.is_empty())
}

/// Parse an optional numeric variable, warning and defaulting on failure.
fn parse_or<T: std::str::FromStr + Copy>(name: &str, default: T) -> T {
    let raw = match env::var(name) {
        Ok(v) if !v.is_empty() => v,
        _ => return default,
    };

    match raw.parse() {
        Ok(v) => v,
        Err(_) => {
            warn!(env_var = name, value = %raw, "Invalid value, using default");
            default
        }
    }
}

/// Parse a comma-separated range like "250,5000" into a tuple.
fn parse_range(name: &str, default: (u64, u64)) -> (u64, u64) {
    let raw = match env::var(name) {
        Ok(v) if !v.is_empty() => v,
        _ => return default,
    };

    let parts: Vec<&str> = raw.split(',').collect();
    if parts.len() != 2 {
        warn!(env_var = name, value = %raw, "Invalid range format, using default");
        return default;
    }

    let min = parts[0].trim().parse::<u64>();
    let max = parts[1].trim().parse::<u64>();

    match (min, max) {
        (Ok(min), Ok(max)) if min <= max => (min, max),
        _ => {
            warn!(env_var = name, value = %raw, "Invalid range values, using default");
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_required_missing() {
        let result = required("MAILRELAY_TEST_UNSET_VAR");
        assert!(matches!(
            result,
            Err(ConfigError::MissingVar("MAILRELAY_TEST_UNSET_VAR"))
        ));
    }

    #[test]
    fn test_required_empty_counts_as_unset() {
        env::set_var("MAILRELAY_TEST_EMPTY_VAR", "");
        let result = required("MAILRELAY_TEST_EMPTY_VAR");
        assert!(matches!(result, Err(ConfigError::MissingVar(_))));
        env::remove_var("MAILRELAY_TEST_EMPTY_VAR");
    }

    #[test]
    fn test_required_present() {
        env::set_var("MAILRELAY_TEST_SET_VAR", "value");
        assert_eq!(required("MAILRELAY_TEST_SET_VAR").unwrap(), "value");
        env::remove_var("MAILRELAY_TEST_SET_VAR");
    }

    #[test]
    fn test_parse_or_valid() {
        env::set_var("MAILRELAY_TEST_NUM", "7");
        assert_eq!(parse_or("MAILRELAY_TEST_NUM", 4usize), 7);
        env::remove_var("MAILRELAY_TEST_NUM");
    }

    #[test]
    fn test_parse_or_invalid_falls_back() {
        env::set_var("MAILRELAY_TEST_BAD_NUM", "many");
        assert_eq!(parse_or("MAILRELAY_TEST_BAD_NUM", 4usize), 4);
        env::remove_var("MAILRELAY_TEST_BAD_NUM");
    }

    #[test]
    fn test_parse_range_valid() {
        env::set_var("MAILRELAY_TEST_RANGE", "100,500");
        let result = parse_range("MAILRELAY_TEST_RANGE", (0, 0));
        assert_eq!(result, (100, 500));
        env::remove_var("MAILRELAY_TEST_RANGE");
    }

    #[test]
    fn test_parse_range_default() {
        let result = parse_range("MAILRELAY_TEST_NO_RANGE", (10, 20));
        assert_eq!(result, (10, 20));
    }

    #[test]
    fn test_parse_range_inverted_falls_back() {
        env::set_var("MAILRELAY_TEST_INV_RANGE", "500,100");
        let result = parse_range("MAILRELAY_TEST_INV_RANGE", (10, 20));
        assert_eq!(result, (10, 20));
        env::remove_var("MAILRELAY_TEST_INV_RANGE");
    }

    #[test]
    fn test_consumer_tag_shape() {
        let config = Config::test_default();

        let tag = config.consumer_tag(2);
        let parts: Vec<&str> = tag.split('-').collect();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0], "relay");
        assert_eq!(parts[3], "2");
        assert!(parts[1].parse::<u32>().is_ok());
        assert!(parts[2].parse::<u32>().is_ok());
    }
}
