//! Queue module for RabbitMQ operations.
//!
//! Both sides of the queue - the worker's consumers and the test
//! publisher - declare it with the same options and arguments, so
//! whichever connects first creates it and the other's declaration is
//! a no-op instead of a channel error.

pub mod publisher;

pub use publisher::Publisher;

use lapin::options::QueueDeclareOptions;
use lapin::types::{AMQPValue, FieldTable};

/// Declaration options for the mail job queue: durable, non-exclusive,
/// non-auto-delete.
pub fn declare_options() -> QueueDeclareOptions {
    QueueDeclareOptions {
        durable: true,
        ..Default::default()
    }
}

/// Declaration arguments for the mail job queue.
///
/// When a dead-letter exchange is configured, dropped messages are
/// routed there for inspection instead of being discarded by the
/// broker.
pub fn declare_args(dead_letter_exchange: Option<&str>) -> FieldTable {
    let mut args = FieldTable::default();
    if let Some(exchange) = dead_letter_exchange {
        args.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(exchange.into()),
        );
    }
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_declare_options_durable() {
        let options = declare_options();
        assert!(options.durable);
        assert!(!options.exclusive);
        assert!(!options.auto_delete);
    }

    #[test]
    fn test_declare_args_without_dlx() {
        let args = declare_args(None);
        assert!(args.inner().is_empty());
    }

    #[test]
    fn test_declare_args_with_dlx() {
        let args = declare_args(Some("mail_jobs_dlx"));
        assert!(args
            .inner()
            .iter()
            .any(|(key, _)| key.as_str() == "x-dead-letter-exchange"));
    }
}
