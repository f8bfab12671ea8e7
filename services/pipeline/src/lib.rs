//! Logflow Pipeline - Kafka plumbing shared by the log consumer and producer
//!
//! This library provides the broker-facing building blocks of the log
//! shipping pipeline:
//!
//! - [`Timber`], the canonical log record, and its wire conversions
//! - [`Worker`], a per-topic consumption loop over a [`Subscription`]
//! - [`KafkaFactory`] / [`KafkaAdmin`] for topic discovery and consumer creation
//! - [`LogProducer`] and the [`Publisher`] seam for synchronous publishing
//! - [`MemoryBroker`], an in-process broker for tests and local runs
//!
//! # Example
//!
//! ```rust,no_run
//! use logflow_pipeline::{KafkaConfig, KafkaFactory, RdKafkaFactory};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = KafkaConfig::from_env()?;
//!     let factory = RdKafkaFactory::new(config);
//!
//!     let admin = factory.make_admin().await?;
//!     for topic in admin.topics().await? {
//!         println!("{topic}");
//!     }
//!     admin.close().await;
//!
//!     Ok(())
//! }
//! ```

pub mod admin;
pub mod config;
pub mod consumer;
pub mod instrumentation;
pub mod memory;
pub mod producer;
pub mod timber;
pub mod worker;

// Re-export main types
pub use admin::{AdminError, KafkaAdmin, KafkaFactory, RdKafkaAdmin, RdKafkaFactory};
pub use config::{
    ConfigError, ConsumerConfig, KafkaConfig, ProducerConfig, SaslConfig, SaslMechanism,
    SecurityProtocol, SslConfig, TopicConfig,
};
pub use consumer::{
    ConsumerError, IncomingMessage, KafkaSubscription, MessageHandler, MessageMetadata,
    StartOffset, Subscription,
};
pub use instrumentation::{install_recorder, InstrumentationError, MetricsPusher};
pub use memory::{ConsumerRecord, MemoryBroker};
pub use producer::{
    DeliveryResult, LogProducer, OutgoingMessage, ProducerError, Publisher, SOURCE_HEADER,
};
pub use timber::{Timber, TimberContext, TimberError};
pub use worker::Worker;

pub use async_trait::async_trait;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::admin::{KafkaAdmin, KafkaFactory};
    pub use crate::config::KafkaConfig;
    pub use crate::consumer::{
        ConsumerError, IncomingMessage, MessageHandler, StartOffset, Subscription,
    };
    pub use crate::producer::{OutgoingMessage, ProducerError, Publisher};
    pub use crate::timber::Timber;
    pub use crate::worker::Worker;
    pub use async_trait::async_trait;
}
