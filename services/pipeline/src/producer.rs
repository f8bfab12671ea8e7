//! Kafka producer wrapper used by the ingestion service.

use crate::config::KafkaConfig;
use crate::timber::Timber;
use async_trait::async_trait;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Header naming the surface a record entered the pipeline through
pub const SOURCE_HEADER: &str = "source";

/// Errors that can occur during message production
#[derive(Error, Debug, Clone)]
pub enum ProducerError {
    #[error("Failed to create producer: {0}")]
    CreationError(String),

    #[error("Failed to send message to topic {topic}: {message}")]
    SendError { topic: String, message: String },

    #[error("Producer timeout after {0:?}")]
    Timeout(Duration),
}

/// Result of a successful message delivery
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryResult {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

/// Message to be sent to Kafka
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub headers: Vec<(String, String)>,
}

impl OutgoingMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            headers: Vec::new(),
        }
    }

    /// Wire form of `timber`, routed to its log topic
    pub fn from_timber(timber: &Timber, topic_suffix: &str) -> Self {
        Self::new(timber.kafka_topic(topic_suffix), timber.to_vec())
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }
}

/// Synchronous publishing: resolves once the broker acknowledged the message
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, message: OutgoingMessage) -> Result<DeliveryResult, ProducerError>;
}

/// rdkafka-backed producer
pub struct LogProducer {
    producer: FutureProducer,
    config: Arc<KafkaConfig>,
    default_timeout: Duration,
}

impl LogProducer {
    pub fn new(config: KafkaConfig) -> Result<Self, ProducerError> {
        info!("Creating Kafka producer for {}", config.bootstrap_servers);

        let producer: FutureProducer = config
            .build_producer_config()
            .create()
            .map_err(|e| ProducerError::CreationError(e.to_string()))?;

        let default_timeout = config.request_timeout();

        Ok(Self {
            producer,
            config: Arc::new(config),
            default_timeout,
        })
    }

    pub fn config(&self) -> &KafkaConfig {
        &self.config
    }

    /// Send a message and wait for delivery confirmation
    #[instrument(skip(self, message), fields(topic = %message.topic))]
    pub async fn send(&self, message: OutgoingMessage) -> Result<DeliveryResult, ProducerError> {
        let topic = message.topic.clone();

        let mut record: FutureRecord<'_, (), Vec<u8>> =
            FutureRecord::to(&topic).payload(&message.payload);
        if !message.headers.is_empty() {
            let headers = message
                .headers
                .iter()
                .fold(OwnedHeaders::new(), |headers, (key, value)| {
                    headers.insert(Header {
                        key: key.as_str(),
                        value: Some(value.as_str()),
                    })
                });
            record = record.headers(headers);
        }

        debug!(
            "Sending message to topic {} (size: {} bytes)",
            topic,
            message.payload.len()
        );

        let (partition, offset) = self
            .producer
            .send(record, Timeout::After(self.default_timeout))
            .await
            .map_err(|(e, _)| ProducerError::SendError {
                topic: topic.clone(),
                message: e.to_string(),
            })?;

        debug!("Message delivered to partition {} at offset {}", partition, offset);

        Ok(DeliveryResult {
            topic,
            partition,
            offset,
        })
    }

    /// Flush all pending messages
    pub fn flush(&self, timeout: Duration) -> Result<(), ProducerError> {
        self.producer
            .flush(Timeout::After(timeout))
            .map_err(|_| ProducerError::Timeout(timeout))
    }
}

#[async_trait]
impl Publisher for LogProducer {
    async fn publish(&self, message: OutgoingMessage) -> Result<DeliveryResult, ProducerError> {
        self.send(message).await
    }
}

impl Drop for LogProducer {
    fn drop(&mut self) {
        info!("Shutting down Kafka producer");
        if let Err(e) = self.flush(Duration::from_secs(5)) {
            warn!("Failed to flush producer on shutdown: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outgoing_message_builder() {
        let message = OutgoingMessage::new("app_logs", b"{}".to_vec())
            .with_header("source", "http");

        assert_eq!(message.headers, vec![("source".to_string(), "http".to_string())]);
    }

    #[test]
    fn test_outgoing_message_from_timber() {
        let timber = Timber::from_slice(br#"{"_ctx": {"kafka_topic": "app"}, "msg": "hi"}"#).unwrap();
        let message = OutgoingMessage::from_timber(&timber, "_logs");

        assert_eq!(message.topic, "app_logs");
        assert_eq!(Timber::from_slice(&message.payload).unwrap(), timber);
    }
}
