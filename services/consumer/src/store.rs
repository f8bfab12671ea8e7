//! Search store for Timbers.

use crate::config::ElasticsearchConfig;
use async_trait::async_trait;
use logflow_pipeline::Timber;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument};

#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("Failed to build Elasticsearch client: {0}")]
    Client(String),

    #[error("No Elasticsearch URL configured")]
    NoUrls,

    #[error("Elasticsearch request failed: {0}")]
    Request(String),

    #[error("Elasticsearch rejected document with status {status}: {body}")]
    Rejected { status: u16, body: String },
}

/// Persists one Timber per call
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TimberStore: Send + Sync {
    async fn store(&self, timber: &Timber) -> Result<(), StoreError>;
}

/// Elasticsearch document API client
pub struct ElasticStore {
    http: reqwest::Client,
    urls: Vec<String>,
    next: AtomicUsize,
    username: Option<String>,
    password: Option<String>,
}

impl ElasticStore {
    pub fn new(config: &ElasticsearchConfig, timeout: Duration) -> Result<Self, StoreError> {
        if config.urls.is_empty() {
            return Err(StoreError::NoUrls);
        }

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StoreError::Client(e.to_string()))?;

        Ok(Self {
            http,
            urls: config
                .urls
                .iter()
                .map(|u| u.trim_end_matches('/').to_string())
                .collect(),
            next: AtomicUsize::new(0),
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    fn next_url(&self) -> &str {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.urls.len();
        &self.urls[i]
    }

    /// Document endpoint for `timber` on the next node
    pub fn document_url(&self, timber: &Timber) -> String {
        format!(
            "{}/{}/{}",
            self.next_url(),
            timber.index_name(),
            timber.document_type()
        )
    }
}

#[async_trait]
impl TimberStore for ElasticStore {
    #[instrument(skip_all, fields(index = %timber.index_name()))]
    async fn store(&self, timber: &Timber) -> Result<(), StoreError> {
        let url = self.document_url(timber);

        let mut request = self.http.post(&url).json(&timber.to_document());
        if let Some(username) = &self.username {
            request = request.basic_auth(username, self.password.as_ref());
        }

        let resp = request
            .send()
            .await
            .map_err(|e| StoreError::Request(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(StoreError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        debug!(url = %url, "Stored timber");
        Ok(())
    }
}
