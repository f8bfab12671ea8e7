use anyhow::{Context, Result};
use logflow_pipeline::{install_recorder, LogProducer};
use logflow_producer::{start_api_server, AppState, BucketLimiter, Config};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load().context("Failed to load configuration")?;

    init_tracing(&config.service.log_level, &config.service.log_format);

    config.validate().context("Invalid configuration")?;

    info!(
        service = %config.service.name,
        brokers = %config.kafka.bootstrap_servers,
        max_tps = config.ingestion.max_tps,
        "Starting logflow producer"
    );

    let metrics = install_recorder().context("Failed to install metrics recorder")?;
    let producer = LogProducer::new(config.kafka.clone()).context("Failed to create producer")?;

    let cancel = CancellationToken::new();
    let limiter = Arc::new(BucketLimiter::new(config.ingestion.max_tps));
    let refill_handle = limiter.spawn_refill(config.refill_interval(), cancel.child_token());

    let state = AppState::new(
        Arc::new(producer),
        limiter,
        config.kafka.topics.clone(),
        config.ingestion.announce_new_topics,
    )
    .with_metrics(metrics);

    let shutdown_token = cancel.clone();
    let server = tokio::spawn({
        let addr = config.listen_address();
        async move {
            let shutdown = async move { shutdown_token.cancelled().await };
            if let Err(e) = start_api_server(state, &addr, shutdown).await {
                error!(error = %e, "API server error");
            }
        }
    });

    info!("Producer service started successfully");

    shutdown_signal().await;

    info!("Shutting down producer service");
    cancel.cancel();

    // dropping the state on server exit flushes the producer
    let _ = server.await;
    let _ = refill_handle.await;

    info!("Producer service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str, log_format: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);
    if log_format == "pretty" {
        registry.with(fmt::layer().pretty()).init();
    } else {
        registry.with(fmt::layer().json()).init();
    }
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
