//! HTTP ingestion endpoint: one request in, one record published.

use crate::limiter::BucketLimiter;
use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use logflow_pipeline::{OutgoingMessage, Publisher, Timber, TopicConfig, SOURCE_HEADER};
use metrics_exporter_prometheus::PrometheusHandle;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, instrument, warn};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub publisher: Arc<dyn Publisher>,
    pub limiter: Arc<BucketLimiter>,
    pub topics: Arc<TopicConfig>,
    pub announcer: Arc<TopicAnnouncer>,
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(
        publisher: Arc<dyn Publisher>,
        limiter: Arc<BucketLimiter>,
        topics: TopicConfig,
        announce_new_topics: bool,
    ) -> Self {
        let announcer = TopicAnnouncer::new(&topics.new_topic_events, announce_new_topics);
        Self {
            publisher,
            limiter,
            topics: Arc::new(topics),
            announcer: Arc::new(announcer),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }
}

/// Publishes each topic name to the new-topic event topic once per process
pub struct TopicAnnouncer {
    control_topic: String,
    enabled: bool,
    announced: Mutex<HashSet<String>>,
}

impl TopicAnnouncer {
    pub fn new(control_topic: impl Into<String>, enabled: bool) -> Self {
        Self {
            control_topic: control_topic.into(),
            enabled,
            announced: Mutex::new(HashSet::new()),
        }
    }

    pub fn is_announced(&self, topic: &str) -> bool {
        self.announced.lock().contains(topic)
    }

    /// Concurrent first requests may both announce; consumers ignore repeats.
    pub async fn announce(&self, publisher: &dyn Publisher, topic: &str) {
        if !self.enabled || self.is_announced(topic) {
            return;
        }

        let event = OutgoingMessage::new(&self.control_topic, topic.as_bytes().to_vec());
        match publisher.publish(event).await {
            Ok(_) => {
                self.announced.lock().insert(topic.to_string());
                info!(topic = %topic, "Announced new topic");
            }
            Err(e) => {
                warn!(topic = %topic, error = %e, "Failed to announce new topic");
            }
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ProduceResponse {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

fn error_response(status: StatusCode, code: &str, error: impl ToString) -> Response {
    metrics::counter!("producer_requests", "outcome" => code.to_lowercase()).increment(1);
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
            code: code.to_string(),
        }),
    )
        .into_response()
}

/// Create the ingestion router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", post(produce))
        .route("/produce", post(produce))
        .route("/health", get(health_check))
        .route("/metrics", get(render_metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[instrument(skip_all, fields(size = body.len()))]
async fn produce(State(state): State<AppState>, body: Bytes) -> Response {
    if !state.limiter.try_acquire() {
        return error_response(
            StatusCode::TOO_MANY_REQUESTS,
            "RATE_LIMITED",
            "Bucket is full",
        );
    }

    let timber = match Timber::from_request_body(&body) {
        Ok(timber) => timber,
        Err(e) => {
            debug!(error = %e, "Rejected request body");
            return error_response(StatusCode::BAD_REQUEST, "BAD_REQUEST", e);
        }
    };

    let message = OutgoingMessage::from_timber(&timber, &state.topics.topic_suffix)
        .with_header(SOURCE_HEADER, "http");
    let delivery = match state.publisher.publish(message).await {
        Ok(delivery) => delivery,
        Err(e) => {
            warn!(error = %e, "Failed to publish timber");
            return error_response(StatusCode::SERVICE_UNAVAILABLE, "STORE_ERROR", e);
        }
    };

    state
        .announcer
        .announce(state.publisher.as_ref(), &delivery.topic)
        .await;

    metrics::counter!("producer_requests", "outcome" => "success").increment(1);
    (
        StatusCode::OK,
        Json(ProduceResponse {
            topic: delivery.topic,
            partition: delivery.partition,
            offset: delivery.offset,
        }),
    )
        .into_response()
}

async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "logflow-producer",
        "max_tps": state.limiter.max_tps(),
        "available": state.limiter.available(),
    }))
}

async fn render_metrics(State(state): State<AppState>) -> impl IntoResponse {
    match &state.metrics {
        Some(handle) => (StatusCode::OK, handle.render()),
        None => (StatusCode::NOT_FOUND, String::new()),
    }
}

/// Serve the ingestion API on `addr` until `shutdown` resolves
pub async fn start_api_server(
    state: AppState,
    addr: &str,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    info!(address = %addr, "Starting ingestion API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(shutdown)
        .await
}
