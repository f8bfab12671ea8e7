//! Prometheus recorder setup and the optional metrics push hook.

use chrono::Utc;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum InstrumentationError {
    #[error("Failed to install metrics recorder: {0}")]
    Install(String),

    #[error("Failed to build HTTP client: {0}")]
    Client(String),
}

/// Install the global Prometheus recorder and return a handle for rendering
pub fn install_recorder() -> Result<PrometheusHandle, InstrumentationError> {
    PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| InstrumentationError::Install(e.to_string()))
}

/// Body POSTed to the push endpoint
#[derive(Debug, Serialize)]
pub struct PushPayload {
    pub token: String,
    pub timestamp: String,
    pub metrics: String,
}

/// Periodically pushes the rendered metrics to a remote collector
pub struct MetricsPusher {
    client: reqwest::Client,
    handle: PrometheusHandle,
    url: String,
    token: String,
    interval: Duration,
}

impl MetricsPusher {
    pub fn new(
        handle: PrometheusHandle,
        url: impl Into<String>,
        token: impl Into<String>,
        interval: Duration,
    ) -> Result<Self, InstrumentationError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| InstrumentationError::Client(e.to_string()))?;

        Ok(Self {
            client,
            handle,
            url: url.into(),
            token: token.into(),
            interval,
        })
    }

    pub fn payload(&self) -> PushPayload {
        PushPayload {
            token: self.token.clone(),
            timestamp: Utc::now().to_rfc3339(),
            metrics: self.handle.render(),
        }
    }

    /// Push once
    pub async fn push(&self) -> Result<(), reqwest::Error> {
        self.client
            .post(&self.url)
            .json(&self.payload())
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Run the push loop on its own task until `cancel` fires
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(url = %self.url, interval = ?self.interval, "Starting metrics push");
            let mut ticker = tokio::time::interval(self.interval);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        match self.push().await {
                            Ok(()) => debug!("Pushed metrics"),
                            Err(e) => warn!(error = %e, "Failed to push metrics"),
                        }
                    }
                }
            }

            debug!("Metrics push stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_payload_carries_token_and_rendered_metrics() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        metrics::with_local_recorder(&recorder, || {
            metrics::counter!("pusher_test_total").increment(3);
        });

        let pusher = MetricsPusher::new(
            handle,
            "http://127.0.0.1:9/push",
            "secret",
            Duration::from_secs(60),
        )
        .unwrap();

        let payload = pusher.payload();
        assert_eq!(payload.token, "secret");
        assert!(payload.metrics.contains("pusher_test_total 3"));
        assert!(chrono::DateTime::parse_from_rfc3339(&payload.timestamp).is_ok());
    }

    #[tokio::test]
    async fn test_push_loop_stops_on_cancel() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let pusher = MetricsPusher::new(
            recorder.handle(),
            "http://127.0.0.1:9/push",
            "secret",
            Duration::from_secs(3600),
        )
        .unwrap();

        let cancel = CancellationToken::new();
        let task = pusher.spawn(cancel.clone());
        cancel.cancel();

        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }
}
