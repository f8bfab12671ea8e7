//! Timber, the canonical log record, and the conversions into it.
//!
//! A Timber travels as a single JSON object. The `_ctx` key carries routing
//! information, `@timestamp` the ingestion time, and every other key is part
//! of the log payload:
//!
//! ```json
//! {
//!   "_ctx": { "kafka_topic": "app", "es_index_prefix": "app" },
//!   "@timestamp": "2024-01-15T10:30:00Z",
//!   "message": "user logged in",
//!   "level": "info"
//! }
//! ```

use crate::consumer::IncomingMessage;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub const CONTEXT_KEY: &str = "_ctx";
pub const TIMESTAMP_KEY: &str = "@timestamp";

const DEFAULT_DOCUMENT_TYPE: &str = "_doc";

#[derive(Error, Debug)]
pub enum TimberError {
    #[error("Timber must be a JSON object: {0}")]
    InvalidJson(String),

    #[error("Timber has no _ctx context")]
    MissingContext,

    #[error("Invalid _ctx context: {0}")]
    InvalidContext(String),

    #[error("Invalid @timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("Message has no payload")]
    EmptyPayload,
}

/// Routing information attached to every Timber
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimberContext {
    /// Topic name without the log suffix
    pub kafka_topic: String,
    /// Prefix of the daily search index; defaults to the topic name
    #[serde(default)]
    pub es_index_prefix: String,
    #[serde(default = "default_document_type")]
    pub es_document_type: String,
}

fn default_document_type() -> String {
    DEFAULT_DOCUMENT_TYPE.to_string()
}

/// A canonical log record. Immutable once constructed.
#[derive(Debug, Clone, PartialEq)]
pub struct Timber {
    context: TimberContext,
    timestamp: DateTime<Utc>,
    fields: Map<String, Value>,
}

impl Timber {
    pub fn new(context: TimberContext, fields: Map<String, Value>) -> Self {
        Self {
            context,
            timestamp: Utc::now(),
            fields,
        }
    }

    /// Parse a Timber from its JSON wire form
    pub fn from_slice(data: &[u8]) -> Result<Self, TimberError> {
        let value: Value =
            serde_json::from_slice(data).map_err(|e| TimberError::InvalidJson(e.to_string()))?;

        let Value::Object(mut fields) = value else {
            return Err(TimberError::InvalidJson("not an object".to_string()));
        };

        let context = fields.remove(CONTEXT_KEY).ok_or(TimberError::MissingContext)?;
        let context: TimberContext = serde_json::from_value(context)
            .map_err(|e| TimberError::InvalidContext(e.to_string()))?;
        if context.kafka_topic.is_empty() {
            return Err(TimberError::InvalidContext(
                "kafka_topic is empty".to_string(),
            ));
        }

        let timestamp = match fields.remove(TIMESTAMP_KEY) {
            Some(Value::String(raw)) => DateTime::parse_from_rfc3339(&raw)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| TimberError::InvalidTimestamp(e.to_string()))?,
            Some(other) => return Err(TimberError::InvalidTimestamp(other.to_string())),
            None => Utc::now(),
        };

        Ok(Self {
            context,
            timestamp,
            fields,
        })
    }

    /// Convert an inbound HTTP request body
    pub fn from_request_body(body: &[u8]) -> Result<Self, TimberError> {
        if body.is_empty() {
            return Err(TimberError::EmptyPayload);
        }
        Self::from_slice(body)
    }

    /// Convert a message consumed from a log topic
    pub fn from_message(message: &IncomingMessage) -> Result<Self, TimberError> {
        if message.payload.is_empty() {
            return Err(TimberError::EmptyPayload);
        }
        Self::from_slice(&message.payload)
    }

    pub fn context(&self) -> &TimberContext {
        &self.context
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Broker topic this record is published to
    pub fn kafka_topic(&self, topic_suffix: &str) -> String {
        format!("{}{}", self.context.kafka_topic, topic_suffix)
    }

    /// Daily search index, e.g. `app-2024.01.15`
    pub fn index_name(&self) -> String {
        let prefix = if self.context.es_index_prefix.is_empty() {
            &self.context.kafka_topic
        } else {
            &self.context.es_index_prefix
        };
        format!("{}-{}", prefix, self.timestamp.format("%Y.%m.%d"))
    }

    pub fn document_type(&self) -> &str {
        &self.context.es_document_type
    }

    /// The document persisted to the search store: payload plus timestamp
    pub fn to_document(&self) -> Value {
        let mut document = self.fields.clone();
        document.insert(TIMESTAMP_KEY.to_string(), Value::String(self.timestamp_str()));
        Value::Object(document)
    }

    /// The JSON wire form, including the context
    pub fn to_vec(&self) -> Vec<u8> {
        let mut wire = self.fields.clone();
        wire.insert(
            CONTEXT_KEY.to_string(),
            serde_json::to_value(&self.context).unwrap_or(Value::Null),
        );
        wire.insert(TIMESTAMP_KEY.to_string(), Value::String(self.timestamp_str()));
        Value::Object(wire).to_string().into_bytes()
    }

    fn timestamp_str(&self) -> String {
        self.timestamp.to_rfc3339_opts(SecondsFormat::AutoSi, true)
    }
}
