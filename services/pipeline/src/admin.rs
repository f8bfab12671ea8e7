//! Broker administration: topic discovery and consumer creation.

use crate::config::KafkaConfig;
use crate::consumer::{ConsumerError, KafkaSubscription, StartOffset, Subscription};
use async_trait::async_trait;
use rdkafka::consumer::{BaseConsumer, Consumer};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug, Clone)]
pub enum AdminError {
    #[error("Failed to connect to Kafka: {0}")]
    ConnectionError(String),

    #[error("Failed to fetch topic metadata: {0}")]
    MetadataError(String),

    #[error("Admin client is closed")]
    Closed,
}

/// Narrow view over broker administration
#[async_trait]
pub trait KafkaAdmin: Send + Sync {
    /// Names of every topic currently known to the cluster
    async fn topics(&self) -> Result<Vec<String>, AdminError>;

    async fn close(&self);
}

/// Creates admin handles and subscriptions
#[async_trait]
pub trait KafkaFactory: Send + Sync {
    async fn make_admin(&self) -> Result<Box<dyn KafkaAdmin>, AdminError>;

    async fn make_consumer(
        &self,
        group_id: &str,
        topic: &str,
        offset: StartOffset,
    ) -> Result<Box<dyn Subscription>, ConsumerError>;
}

/// rdkafka-backed factory
#[derive(Clone)]
pub struct RdKafkaFactory {
    config: Arc<KafkaConfig>,
}

impl RdKafkaFactory {
    pub fn new(config: KafkaConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

#[async_trait]
impl KafkaFactory for RdKafkaFactory {
    async fn make_admin(&self) -> Result<Box<dyn KafkaAdmin>, AdminError> {
        let admin = RdKafkaAdmin::connect(&self.config).await?;
        Ok(Box::new(admin))
    }

    async fn make_consumer(
        &self,
        group_id: &str,
        topic: &str,
        offset: StartOffset,
    ) -> Result<Box<dyn Subscription>, ConsumerError> {
        let subscription = KafkaSubscription::new(&self.config, group_id, topic, offset)?;
        Ok(Box::new(subscription))
    }
}

/// Metadata-only client used for topic listing
pub struct RdKafkaAdmin {
    client: parking_lot::RwLock<Option<Arc<BaseConsumer>>>,
    timeout: Duration,
}

impl RdKafkaAdmin {
    /// Create the client and verify the cluster is reachable
    pub async fn connect(config: &KafkaConfig) -> Result<Self, AdminError> {
        let client: BaseConsumer = config
            .build_admin_config()
            .create()
            .map_err(|e| AdminError::ConnectionError(e.to_string()))?;

        let admin = Self {
            client: parking_lot::RwLock::new(Some(Arc::new(client))),
            timeout: config.metadata_timeout(),
        };

        // librdkafka connects lazily; a metadata round trip proves the brokers are up
        let topics = admin
            .topics()
            .await
            .map_err(|e| AdminError::ConnectionError(e.to_string()))?;

        info!(
            brokers = %config.bootstrap_servers,
            topic_count = topics.len(),
            "Connected Kafka admin client"
        );

        Ok(admin)
    }
}

#[async_trait]
impl KafkaAdmin for RdKafkaAdmin {
    async fn topics(&self) -> Result<Vec<String>, AdminError> {
        let client = self.client.read().clone().ok_or(AdminError::Closed)?;
        let timeout = self.timeout;

        // fetch_metadata blocks the calling thread
        let topics = tokio::task::spawn_blocking(move || {
            client.fetch_metadata(None, timeout).map(|metadata| {
                metadata
                    .topics()
                    .iter()
                    .map(|t| t.name().to_string())
                    .collect::<Vec<_>>()
            })
        })
        .await
        .map_err(|e| AdminError::MetadataError(e.to_string()))?
        .map_err(|e| AdminError::MetadataError(e.to_string()))?;

        debug!(count = topics.len(), "Fetched topic metadata");
        Ok(topics)
    }

    async fn close(&self) {
        if self.client.write().take().is_some() {
            debug!("Closed Kafka admin client");
        }
    }
}
