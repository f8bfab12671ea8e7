use logflow_pipeline::{ConfigError, KafkaConfig};
use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the producer service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub kafka: KafkaConfig,
    #[serde(default)]
    pub ingestion: IngestionConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log format (json or pretty)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngestionConfig {
    /// Bucket capacity per window
    #[serde(default = "default_max_tps")]
    pub max_tps: u32,
    /// Bucket refill window in milliseconds
    #[serde(default = "default_refill_interval_ms")]
    pub refill_interval_ms: u64,
    /// Publish the topic name to the new-topic event topic on first use
    #[serde(default = "default_true")]
    pub announce_new_topics: bool,
}

/// HTTP listener configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_host")]
    pub host: String,
    #[serde(default = "default_api_port")]
    pub port: u16,
}

fn default_service_name() -> String {
    "logflow-producer".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_max_tps() -> u32 {
    100
}

fn default_refill_interval_ms() -> u64 {
    1000
}

fn default_true() -> bool {
    true
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> Result<Self, config::ConfigError> {
        let config = config::Config::builder()
            .add_source(config::File::with_name("config/producer").required(false))
            .add_source(config::File::with_name("/etc/logflow/producer").required(false))
            // PRODUCER__INGESTION__MAX_TPS -> ingestion.max_tps
            .add_source(
                config::Environment::with_prefix("PRODUCER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.kafka.validate()?;

        if self.ingestion.max_tps == 0 {
            return Err(ConfigError::InvalidValue {
                key: "ingestion.max_tps".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        if self.ingestion.refill_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "ingestion.refill_interval_ms".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        Ok(())
    }

    pub fn refill_interval(&self) -> Duration {
        Duration::from_millis(self.ingestion.refill_interval_ms)
    }

    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.api.host, self.api.port)
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

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            max_tps: default_max_tps(),
            refill_interval_ms: default_refill_interval_ms(),
            announce_new_topics: true,
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
    fn test_defaults() {
        let config = from_toml("");
        assert_eq!(config.ingestion.max_tps, 100);
        assert_eq!(config.refill_interval(), Duration::from_secs(1));
        assert!(config.ingestion.announce_new_topics);
        assert_eq!(config.listen_address(), "0.0.0.0:8080");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_tps_rejected() {
        let config = from_toml("[ingestion]\nmax_tps = 0\n");
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }
}
