//! Kafka configuration shared by the log producer and the consumer supervisor.
//!
//! Holds broker connection settings (with SSL/SASL support) and the topic
//! naming convention: log-carrying topics end with `topic_suffix`, and new
//! topics are announced on the `new_topic_events` control topic.

use crate::consumer::StartOffset;
use rdkafka::config::ClientConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Security protocol for Kafka connections
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SecurityProtocol {
    #[default]
    Plaintext,
    Ssl,
    SaslPlaintext,
    SaslSsl,
}

impl SecurityProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityProtocol::Plaintext => "plaintext",
            SecurityProtocol::Ssl => "ssl",
            SecurityProtocol::SaslPlaintext => "sasl_plaintext",
            SecurityProtocol::SaslSsl => "sasl_ssl",
        }
    }

    fn uses_sasl(&self) -> bool {
        matches!(self, SecurityProtocol::SaslPlaintext | SecurityProtocol::SaslSsl)
    }
}

/// SASL mechanism for authentication
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SaslMechanism {
    #[default]
    Plain,
    ScramSha256,
    ScramSha512,
}

impl SaslMechanism {
    pub fn as_str(&self) -> &'static str {
        match self {
            SaslMechanism::Plain => "PLAIN",
            SaslMechanism::ScramSha256 => "SCRAM-SHA-256",
            SaslMechanism::ScramSha512 => "SCRAM-SHA-512",
        }
    }
}

/// SSL/TLS configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SslConfig {
    /// Path to CA certificate file
    pub ca_location: Option<String>,
    /// Path to client certificate file
    pub certificate_location: Option<String>,
    /// Path to client private key file
    pub key_location: Option<String>,
}

/// SASL authentication configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SaslConfig {
    #[serde(default)]
    pub mechanism: SaslMechanism,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Producer-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducerConfig {
    /// Delivery timeout in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Required acknowledgments: 0, 1, or all
    #[serde(default = "default_acks")]
    pub acks: String,
    /// Compression type: none, gzip, snappy, lz4, zstd
    #[serde(default = "default_compression")]
    pub compression_type: String,
}

fn default_request_timeout_ms() -> u64 {
    30000
}

fn default_acks() -> String {
    "all".to_string()
}

fn default_compression() -> String {
    "lz4".to_string()
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
            acks: default_acks(),
            compression_type: default_compression(),
        }
    }
}

/// Consumer-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Shared consumer group ID for log topics
    #[serde(default = "default_group_id")]
    pub group_id: String,
    /// Enable auto commit; when disabled offsets are committed after each message
    #[serde(default)]
    pub enable_auto_commit: bool,
    /// Session timeout in milliseconds
    #[serde(default = "default_session_timeout")]
    pub session_timeout_ms: u64,
    /// Timeout for metadata requests in milliseconds
    #[serde(default = "default_metadata_timeout")]
    pub metadata_timeout_ms: u64,
}

fn default_group_id() -> String {
    "logflow-consumer".to_string()
}

fn default_session_timeout() -> u64 {
    30000
}

fn default_metadata_timeout() -> u64 {
    10000
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            group_id: default_group_id(),
            enable_auto_commit: false,
            session_timeout_ms: default_session_timeout(),
            metadata_timeout_ms: default_metadata_timeout(),
        }
    }
}

/// Topic naming convention
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicConfig {
    /// Suffix that marks a topic as log-carrying
    #[serde(default = "default_topic_suffix")]
    pub topic_suffix: String,
    /// Control topic carrying new-topic notifications
    #[serde(default = "default_new_topic_events")]
    pub new_topic_events: String,
}

fn default_topic_suffix() -> String {
    "_logs".to_string()
}

fn default_new_topic_events() -> String {
    "new_topic_events".to_string()
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            topic_suffix: default_topic_suffix(),
            new_topic_events: default_new_topic_events(),
        }
    }
}

impl TopicConfig {
    /// Whether `topic` carries log records
    pub fn is_log_topic(&self, topic: &str) -> bool {
        topic.ends_with(&self.topic_suffix)
    }
}

/// Main Kafka configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaConfig {
    /// Comma-separated list of broker addresses
    #[serde(default = "default_bootstrap_servers")]
    pub bootstrap_servers: String,
    /// Client ID for this connection
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default)]
    pub security_protocol: SecurityProtocol,
    #[serde(default)]
    pub ssl: SslConfig,
    #[serde(default)]
    pub sasl: SaslConfig,
    #[serde(default)]
    pub producer: ProducerConfig,
    #[serde(default)]
    pub consumer: ConsumerConfig,
    #[serde(default)]
    pub topics: TopicConfig,
    /// Additional librdkafka properties
    #[serde(default)]
    pub extra_properties: HashMap<String, String>,
}

fn default_bootstrap_servers() -> String {
    "localhost:9092".to_string()
}

fn default_client_id() -> String {
    "logflow".to_string()
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: default_bootstrap_servers(),
            client_id: default_client_id(),
            security_protocol: SecurityProtocol::default(),
            ssl: SslConfig::default(),
            sasl: SaslConfig::default(),
            producer: ProducerConfig::default(),
            consumer: ConsumerConfig::default(),
            topics: TopicConfig::default(),
            extra_properties: HashMap::new(),
        }
    }
}

impl KafkaConfig {
    pub fn new(bootstrap_servers: impl Into<String>) -> Self {
        Self {
            bootstrap_servers: bootstrap_servers.into(),
            ..Default::default()
        }
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let bootstrap_servers =
            std::env::var("KAFKA_BOOTSTRAP_SERVERS").unwrap_or_else(|_| default_bootstrap_servers());

        let mut config = Self::new(bootstrap_servers);

        if let Ok(client_id) = std::env::var("KAFKA_CLIENT_ID") {
            config.client_id = client_id;
        }
        if let Ok(group_id) = std::env::var("KAFKA_GROUP_ID") {
            config.consumer.group_id = group_id;
        }
        if let Ok(suffix) = std::env::var("KAFKA_TOPIC_SUFFIX") {
            config.topics.topic_suffix = suffix;
        }
        if let Ok(name) = std::env::var("KAFKA_NEW_TOPIC_EVENT") {
            config.topics.new_topic_events = name;
        }
        if let Ok(protocol) = std::env::var("KAFKA_SECURITY_PROTOCOL") {
            config.security_protocol = match protocol.to_lowercase().as_str() {
                "ssl" => SecurityProtocol::Ssl,
                "sasl_plaintext" => SecurityProtocol::SaslPlaintext,
                "sasl_ssl" => SecurityProtocol::SaslSsl,
                _ => SecurityProtocol::Plaintext,
            };
        }
        if let Ok(username) = std::env::var("KAFKA_SASL_USERNAME") {
            config.sasl.username = Some(username);
        }
        if let Ok(password) = std::env::var("KAFKA_SASL_PASSWORD") {
            config.sasl.password = Some(password);
        }
        if let Ok(ca) = std::env::var("KAFKA_SSL_CA_LOCATION") {
            config.ssl.ca_location = Some(ca);
        }

        config.validate()?;
        Ok(config)
    }

    fn build_base_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();

        config.set("bootstrap.servers", &self.bootstrap_servers);
        config.set("client.id", &self.client_id);
        config.set("security.protocol", self.security_protocol.as_str());

        if let Some(ref ca) = self.ssl.ca_location {
            config.set("ssl.ca.location", ca);
        }
        if let Some(ref cert) = self.ssl.certificate_location {
            config.set("ssl.certificate.location", cert);
        }
        if let Some(ref key) = self.ssl.key_location {
            config.set("ssl.key.location", key);
        }

        if self.security_protocol.uses_sasl() {
            config.set("sasl.mechanism", self.sasl.mechanism.as_str());
            if let Some(ref username) = self.sasl.username {
                config.set("sasl.username", username);
            }
            if let Some(ref password) = self.sasl.password {
                config.set("sasl.password", password);
            }
        }

        for (key, value) in &self.extra_properties {
            config.set(key, value);
        }

        config
    }

    /// Build a producer ClientConfig
    pub fn build_producer_config(&self) -> ClientConfig {
        let mut config = self.build_base_config();

        config.set("acks", &self.producer.acks);
        config.set("compression.type", &self.producer.compression_type);
        config.set(
            "message.timeout.ms",
            self.producer.request_timeout_ms.to_string(),
        );

        config
    }

    /// Build a consumer ClientConfig bound to `group_id`, starting at `offset`
    /// when the group has no committed position yet.
    pub fn build_consumer_config(&self, group_id: &str, offset: StartOffset) -> ClientConfig {
        let mut config = self.build_base_config();

        config.set("group.id", group_id);
        config.set("auto.offset.reset", offset.as_reset_policy());
        config.set("enable.partition.eof", "false");
        config.set(
            "enable.auto.commit",
            self.consumer.enable_auto_commit.to_string(),
        );
        config.set(
            "session.timeout.ms",
            self.consumer.session_timeout_ms.to_string(),
        );

        config
    }

    /// Build the ClientConfig used for metadata-only (admin) connections
    pub fn build_admin_config(&self) -> ClientConfig {
        let mut config = self.build_base_config();
        config.set("group.id", format!("{}-admin", self.client_id));
        config
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.producer.request_timeout_ms)
    }

    pub fn metadata_timeout(&self) -> Duration {
        Duration::from_millis(self.consumer.metadata_timeout_ms)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bootstrap_servers.is_empty() {
            return Err(ConfigError::MissingRequired("bootstrap_servers".to_string()));
        }

        if self.consumer.group_id.is_empty() {
            return Err(ConfigError::MissingRequired("consumer.group_id".to_string()));
        }

        if self.topics.topic_suffix.is_empty() {
            return Err(ConfigError::MissingRequired("topics.topic_suffix".to_string()));
        }

        if self.topics.new_topic_events.is_empty() {
            return Err(ConfigError::MissingRequired(
                "topics.new_topic_events".to_string(),
            ));
        }

        if self.topics.is_log_topic(&self.topics.new_topic_events) {
            return Err(ConfigError::InvalidValue {
                key: "topics.new_topic_events".to_string(),
                message: "control topic must not carry the log topic suffix".to_string(),
            });
        }

        if self.security_protocol.uses_sasl() && self.sasl.username.is_none() {
            return Err(ConfigError::MissingRequired(
                "sasl.username (required for SASL)".to_string(),
            ));
        }

        Ok(())
    }
}
