//! Logflow Producer Service
//!
//! HTTP front door of the log pipeline. Each request body is a Timber in its
//! JSON wire form; it is rate limited by a [`BucketLimiter`], converted, and
//! synchronously published to `<kafka_topic><topic_suffix>`.

pub mod api;
pub mod config;
pub mod limiter;

pub use api::{create_router, start_api_server, AppState, TopicAnnouncer};
pub use config::Config;
pub use limiter::BucketLimiter;
