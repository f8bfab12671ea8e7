use logflow_pipeline::{ConfigError, KafkaConfig};
use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the consumer service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Kafka configuration
    #[serde(default)]
    pub kafka: KafkaConfig,
    /// Elasticsearch configuration
    #[serde(default)]
    pub elasticsearch: ElasticsearchConfig,
    /// Admin retry policy of the supervisor
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    /// Optional metrics push hook
    #[serde(default)]
    pub push_metric: PushMetricConfig,
    /// Admin API configuration
    #[serde(default)]
    pub api: ApiConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log format (json or pretty)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

/// Elasticsearch store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ElasticsearchConfig {
    /// Node URLs; requests rotate over them
    #[serde(default = "default_elastic_urls")]
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Request timeout in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Wait between store attempts in milliseconds
    #[serde(default = "default_retrier_interval_ms")]
    pub retrier_interval_ms: u64,
    /// Attempts per document before the workers are halted (0 = forever)
    #[serde(default = "default_retrier_max_retry")]
    pub retrier_max_retry: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorConfig {
    /// Attempts to reach the Kafka admin API (0 = forever)
    #[serde(default = "default_kafka_max_retry")]
    pub kafka_max_retry: u32,
    #[serde(default = "default_kafka_retry_interval_secs")]
    pub kafka_retry_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct PushMetricConfig {
    /// Push endpoint; pushing is disabled unless both url and token are set
    pub url: Option<String>,
    pub token: Option<String>,
    #[serde(default = "default_push_interval_secs")]
    pub interval_secs: u64,
}

/// Admin API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
}

// Default value functions
fn default_service_name() -> String {
    "logflow-consumer".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_elastic_urls() -> Vec<String> {
    vec!["http://localhost:9200".to_string()]
}

fn default_request_timeout_ms() -> u64 {
    10000
}

fn default_retrier_interval_ms() -> u64 {
    10000
}

fn default_retrier_max_retry() -> u32 {
    10
}

fn default_kafka_max_retry() -> u32 {
    0
}

fn default_kafka_retry_interval_secs() -> u64 {
    10
}

fn default_push_interval_secs() -> u64 {
    30
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8090
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> Result<Self, config::ConfigError> {
        let config = config::Config::builder()
            // Add config file if present
            .add_source(config::File::with_name("config/consumer").required(false))
            .add_source(config::File::with_name("/etc/logflow/consumer").required(false))
            // Override with environment variables
            // CONSUMER__KAFKA__BOOTSTRAP_SERVERS -> kafka.bootstrap_servers
            .add_source(
                config::Environment::with_prefix("CONSUMER")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("elasticsearch.urls"),
            )
            .build()?;

        config.try_deserialize()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.kafka.validate()?;

        if self.elasticsearch.urls.is_empty() {
            return Err(ConfigError::MissingRequired("elasticsearch.urls".to_string()));
        }

        if self.elasticsearch.password.is_some() && self.elasticsearch.username.is_none() {
            return Err(ConfigError::MissingRequired(
                "elasticsearch.username (required with password)".to_string(),
            ));
        }

        Ok(())
    }

    pub fn kafka_retry_interval(&self) -> Duration {
        Duration::from_secs(self.supervisor.kafka_retry_interval_secs)
    }

    pub fn retrier_interval(&self) -> Duration {
        Duration::from_millis(self.elasticsearch.retrier_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.elasticsearch.request_timeout_ms)
    }

    /// Push endpoint and token, when both are configured
    pub fn push_target(&self) -> Option<(&str, &str)> {
        match (&self.push_metric.url, &self.push_metric.token) {
            (Some(url), Some(token)) if !url.is_empty() && !token.is_empty() => {
                Some((url.as_str(), token.as_str()))
            }
            _ => None,
        }
    }

    pub fn push_interval(&self) -> Duration {
        Duration::from_secs(self.push_metric.interval_secs)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

impl Default for ElasticsearchConfig {
    fn default() -> Self {
        Self {
            urls: default_elastic_urls(),
            username: None,
            password: None,
            request_timeout_ms: default_request_timeout_ms(),
            retrier_interval_ms: default_retrier_interval_ms(),
            retrier_max_retry: default_retrier_max_retry(),
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            kafka_max_retry: default_kafka_max_retry(),
            kafka_retry_interval_secs: default_kafka_retry_interval_secs(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_toml(raw: &str) -> Config {
        config::Config::builder()
            .add_source(config::File::from_str(raw, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    #[test]
    fn test_default_values() {
        let config = from_toml("");
        assert_eq!(config.service.name, "logflow-consumer");
        assert_eq!(config.kafka.topics.topic_suffix, "_logs");
        assert_eq!(config.elasticsearch.urls, vec!["http://localhost:9200"]);
        assert_eq!(config.supervisor.kafka_max_retry, 0);
        assert_eq!(config.kafka_retry_interval(), Duration::from_secs(10));
        assert!(config.push_target().is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_sections_override_defaults() {
        let config = from_toml(
            r#"
            [kafka]
            bootstrap_servers = "kafka-1:9092"

            [kafka.consumer]
            group_id = "es-shipper"

            [elasticsearch]
            urls = ["http://es-1:9200", "http://es-2:9200"]
            username = "elastic"
            password = "changeme"
            retrier_max_retry = 3

            [push_metric]
            url = "http://market/push"
            token = "abc"
            "#,
        );

        assert_eq!(config.kafka.bootstrap_servers, "kafka-1:9092");
        assert_eq!(config.kafka.consumer.group_id, "es-shipper");
        assert_eq!(config.elasticsearch.urls.len(), 2);
        assert_eq!(config.elasticsearch.retrier_max_retry, 3);
        assert_eq!(config.push_target(), Some(("http://market/push", "abc")));
    }

    #[test]
    fn test_password_requires_username() {
        let mut config = from_toml("");
        config.elasticsearch.password = Some("secret".to_string());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingRequired(_))
        ));
    }

    #[test]
    fn test_empty_urls_rejected() {
        let mut config = from_toml("");
        config.elasticsearch.urls.clear();
        assert!(config.validate().is_err());
    }
}
