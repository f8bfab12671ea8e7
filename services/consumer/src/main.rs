use anyhow::{Context, Result};
use logflow_consumer::{start_api_server, AppState, Config, ElasticStore, Supervisor, SupervisorSettings};
use logflow_pipeline::{install_recorder, MetricsPusher, RdKafkaFactory};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level, &config.service.log_format);

    config.validate().context("Invalid configuration")?;

    info!(
        service = %config.service.name,
        brokers = %config.kafka.bootstrap_servers,
        group_id = %config.kafka.consumer.group_id,
        "Starting logflow consumer"
    );

    // Initialize metrics
    let metrics = install_recorder().context("Failed to install metrics recorder")?;
    let cancel = CancellationToken::new();

    let pusher_handle = match config.push_target() {
        Some((url, token)) => {
            let pusher = MetricsPusher::new(metrics.clone(), url, token, config.push_interval())
                .context("Failed to create metrics pusher")?;
            Some(pusher.spawn(cancel.child_token()))
        }
        None => None,
    };

    // Initialize components
    let store = match ElasticStore::new(&config.elasticsearch, config.request_timeout()) {
        Ok(store) => store,
        Err(e) => {
            metrics::counter!("consumer_elasticsearch_client_failed", "phase" => "init")
                .increment(1);
            return Err(e).context("Failed to create Elasticsearch client");
        }
    };

    let factory = RdKafkaFactory::new(config.kafka.clone());
    let supervisor = Supervisor::new(
        Arc::new(factory),
        Arc::new(store),
        SupervisorSettings::from_config(&config),
    );

    supervisor
        .start()
        .await
        .context("Failed to start consumer supervisor")?;

    // Spawn API server task
    let api_state = AppState {
        supervisor: supervisor.clone(),
        metrics: Some(metrics),
    };
    let api_config = config.api.clone();
    let api_cancel = cancel.clone();
    let api_handle = tokio::spawn(async move {
        let shutdown = async move { api_cancel.cancelled().await };
        if let Err(e) = start_api_server(api_state, &api_config, shutdown).await {
            error!(error = %e, "API server error");
        }
    });

    info!("Consumer service started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down consumer service");

    cancel.cancel();
    if tokio::time::timeout(Duration::from_secs(30), supervisor.close())
        .await
        .is_err()
    {
        warn!("Timed out waiting for workers to stop");
    }

    let _ = api_handle.await;
    if let Some(handle) = pusher_handle {
        let _ = handle.await;
    }

    info!("Consumer service stopped");

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
