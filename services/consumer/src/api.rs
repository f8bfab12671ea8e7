use crate::config::ApiConfig;
use crate::supervisor::{Supervisor, SupervisorState};
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use std::future::Future;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub supervisor: Supervisor,
    pub metrics: Option<PrometheusHandle>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
    pub state: SupervisorState,
    pub topics: Vec<String>,
    pub last_error: Option<String>,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// Create the admin API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(render_metrics))
        .route("/resume", post(resume))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let supervisor_state = state.supervisor.state().await;
    let mut topics: Vec<String> = state.supervisor.worker_map().await.into_keys().collect();
    topics.sort();

    let (code, status) = match supervisor_state {
        SupervisorState::Halted => (StatusCode::SERVICE_UNAVAILABLE, "halted"),
        _ => (StatusCode::OK, "healthy"),
    };

    (
        code,
        Json(HealthResponse {
            status,
            service: "logflow-consumer",
            state: supervisor_state,
            topics,
            last_error: state.supervisor.last_error(),
        }),
    )
}

async fn render_metrics(State(state): State<AppState>) -> impl IntoResponse {
    match &state.metrics {
        Some(handle) => (StatusCode::OK, handle.render()),
        None => (StatusCode::NOT_FOUND, String::new()),
    }
}

/// Resume a halted supervisor
async fn resume(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<ErrorResponse>)> {
    if state.supervisor.state().await != SupervisorState::Halted {
        return Err((
            StatusCode::CONFLICT,
            Json(ErrorResponse {
                error: "Consumer workers are not halted".to_string(),
                code: "NOT_HALTED".to_string(),
            }),
        ));
    }

    state.supervisor.resume_worker().await.map_err(|e| {
        error!(error = %e, "Failed to resume consumer workers");
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorResponse {
                error: e.to_string(),
                code: "RESUME_FAILED".to_string(),
            }),
        )
    })?;

    Ok(Json(serde_json::json!({
        "state": state.supervisor.state().await,
    })))
}

/// Serve the admin API until `shutdown` resolves
pub async fn start_api_server(
    state: AppState,
    config: &ApiConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let router = create_router(state);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting consumer admin API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
}
