//! Kafka subscriptions for the log pipeline.
//!
//! A [`Subscription`] is one consumer group membership on one topic. The
//! [`Worker`](crate::worker::Worker) drives it and hands every message to a
//! [`MessageHandler`].

use crate::config::KafkaConfig;
use async_trait::async_trait;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{Headers, Message as KafkaMessage};
use rdkafka::{Offset, TopicPartitionList};
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors that can occur during message consumption
#[derive(Error, Debug, Clone)]
pub enum ConsumerError {
    #[error("Failed to create consumer: {0}")]
    CreationError(String),

    #[error("Failed to subscribe to topic {topic}: {message}")]
    SubscriptionError { topic: String, message: String },

    #[error("Failed to commit offset: {0}")]
    CommitError(String),

    #[error("Consumer delivery error: {0}")]
    DeliveryError(String),
}

/// Where a new group membership starts reading when it has no committed offset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StartOffset {
    Oldest,
    Newest,
}

impl StartOffset {
    pub fn as_reset_policy(&self) -> &'static str {
        match self {
            StartOffset::Oldest => "earliest",
            StartOffset::Newest => "latest",
        }
    }
}

/// Metadata about a received message
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageMetadata {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    /// Broker timestamp in milliseconds
    pub timestamp: Option<i64>,
    pub headers: HashMap<String, String>,
}

/// A received message with payload and metadata
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingMessage {
    pub payload: Vec<u8>,
    pub metadata: MessageMetadata,
}

impl IncomingMessage {
    /// The payload as UTF-8 text, if it is valid UTF-8
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.metadata.headers.get(key).map(|s| s.as_str())
    }
}

/// Callbacks invoked by a worker.
///
/// `handle` is awaited before the next message is pulled, so messages of one
/// topic are processed in order.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Process a single message
    async fn handle(&self, message: IncomingMessage);

    /// Called when the subscription reports a delivery error
    async fn on_error(&self, error: ConsumerError) {
        warn!(error = %error, "Consumer delivery error");
    }
}

/// One consumer group membership on one topic
#[async_trait]
pub trait Subscription: Send {
    /// Topic this subscription is bound to
    fn topic(&self) -> &str;

    /// Wait for the next message. `None` means the stream has ended.
    async fn recv(&mut self) -> Option<Result<IncomingMessage, ConsumerError>>;

    /// Mark `message` as processed
    async fn commit(&mut self, _message: &IncomingMessage) -> Result<(), ConsumerError> {
        Ok(())
    }

    /// Leave the group and release the underlying handle
    async fn close(&mut self);
}

/// rdkafka-backed subscription
pub struct KafkaSubscription {
    consumer: StreamConsumer,
    topic: String,
    auto_commit: bool,
}

impl KafkaSubscription {
    /// Create a consumer in `group_id` and subscribe it to `topic`
    pub fn new(
        config: &KafkaConfig,
        group_id: &str,
        topic: &str,
        offset: StartOffset,
    ) -> Result<Self, ConsumerError> {
        let consumer: StreamConsumer = config
            .build_consumer_config(group_id, offset)
            .create()
            .map_err(|e| ConsumerError::CreationError(e.to_string()))?;

        consumer
            .subscribe(&[topic])
            .map_err(|e| ConsumerError::SubscriptionError {
                topic: topic.to_string(),
                message: e.to_string(),
            })?;

        info!(
            topic = %topic,
            group = %group_id,
            offset = offset.as_reset_policy(),
            "Subscribed to Kafka topic"
        );

        Ok(Self {
            consumer,
            topic: topic.to_string(),
            auto_commit: config.consumer.enable_auto_commit,
        })
    }
}

#[async_trait]
impl Subscription for KafkaSubscription {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn recv(&mut self) -> Option<Result<IncomingMessage, ConsumerError>> {
        let result = match self.consumer.recv().await {
            Ok(message) => Ok(convert_message(&message)),
            Err(e) => Err(ConsumerError::DeliveryError(e.to_string())),
        };
        Some(result)
    }

    async fn commit(&mut self, message: &IncomingMessage) -> Result<(), ConsumerError> {
        if self.auto_commit {
            return Ok(());
        }

        let mut offsets = TopicPartitionList::new();
        offsets
            .add_partition_offset(
                &message.metadata.topic,
                message.metadata.partition,
                Offset::Offset(message.metadata.offset + 1),
            )
            .map_err(|e| ConsumerError::CommitError(e.to_string()))?;

        self.consumer
            .commit(&offsets, CommitMode::Async)
            .map_err(|e| ConsumerError::CommitError(e.to_string()))
    }

    async fn close(&mut self) {
        debug!(topic = %self.topic, "Unsubscribing Kafka consumer");
        self.consumer.unsubscribe();
    }
}

/// Convert a borrowed Kafka message to our IncomingMessage type
fn convert_message<M: KafkaMessage>(msg: &M) -> IncomingMessage {
    let payload = msg.payload().unwrap_or(&[]).to_vec();
    let key = msg.key().map(|k| k.to_vec());

    let mut headers = HashMap::new();
    if let Some(h) = msg.headers() {
        for header in h.iter() {
            if let Some(value) = header.value {
                if let Ok(v) = String::from_utf8(value.to_vec()) {
                    headers.insert(header.key.to_string(), v);
                }
            }
        }
    }

    IncomingMessage {
        payload,
        metadata: MessageMetadata {
            topic: msg.topic().to_string(),
            partition: msg.partition(),
            offset: msg.offset(),
            key,
            timestamp: msg.timestamp().to_millis(),
            headers,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rdkafka::message::{Header, OwnedHeaders, OwnedMessage, Timestamp};

    #[test]
    fn test_convert_owned_message() {
        let headers = OwnedHeaders::new().insert(Header {
            key: "source",
            value: Some("http"),
        });
        let owned = OwnedMessage::new(
            Some(b"payload".to_vec()),
            Some(b"key".to_vec()),
            "app_logs".to_string(),
            Timestamp::CreateTime(1_700_000_000_000),
            2,
            42,
            Some(headers),
        );

        let message = convert_message(&owned);
        assert_eq!(message.payload_str(), Some("payload"));
        assert_eq!(message.metadata.key.as_deref(), Some(&b"key"[..]));
        assert_eq!(message.header("source"), Some("http"));
        assert_eq!(message.metadata.topic, "app_logs");
        assert_eq!(message.metadata.partition, 2);
        assert_eq!(message.metadata.offset, 42);
        assert_eq!(message.metadata.timestamp, Some(1_700_000_000_000));
    }

    #[test]
    fn test_start_offset_policy() {
        assert_eq!(StartOffset::Oldest.as_reset_policy(), "earliest");
        assert_eq!(StartOffset::Newest.as_reset_policy(), "latest");
    }
}
