//! Mail relay worker - RabbitMQ to Amazon SES.
//!
//! This library provides the shared modules for the two binaries:
//! - `mailrelay-worker`: consumes mail jobs and delivers them via SES
//! - `mailrelay-publish`: enqueues a single test job
//!
//! ## Architecture
//!
//! ```text
//! Publisher → mail job queue → Consumer pool → Processor → SES
//!                  ↑                               │
//!                  └────── ack / requeue / drop ───┘
//! ```

pub mod config;
pub mod consumer;
pub mod job;
pub mod mailer;
pub mod processor;
pub mod queue;
pub mod shutdown;

// Re-export commonly used types
pub use config::{Config, ConfigError};
pub use job::{DecodeError, MailJob};
pub use mailer::{DeliveryError, MailSender, SendReceipt, SesMailer};
pub use processor::{Disposition, RetryPolicy};
pub use queue::Publisher;
pub use shutdown::Shutdown;
