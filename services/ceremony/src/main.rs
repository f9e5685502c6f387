use anyhow::{Context, Result};
use ceremony_service::api::{start_api_server, AppState};
use ceremony_service::cache::CacheManager;
use ceremony_service::clock::{Clock, SystemClock};
use ceremony_service::config::Config;
use ceremony_service::datastore::Datastore;
use ceremony_service::performance::PerformanceMonitor;
use ceremony_service::pg_store::PgDatastore;
use ceremony_service::rule_engine::RuleEngineBuilder;
use ceremony_service::telemetry::AsyncTelemetry;
use ceremony_service::trigger::TriggerHandler;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level, &config.service.log_format);

    info!(
        service = %config.service.name,
        "Starting Nier Ceremony Service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    // Initialize components
    let datastore: Arc<dyn Datastore> = Arc::new(
        PgDatastore::new(&config.database)
            .await
            .context("Failed to initialize datastore")?,
    );
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let zone = config.rules.zone();

    let cache = Arc::new(CacheManager::new(
        datastore.clone(),
        clock.clone(),
        config.member_ttl(),
    ));
    cache
        .initialize()
        .await
        .context("Failed to load rule and video caches")?;

    let engine = RuleEngineBuilder::new()
        .clock(clock.clone())
        .zone(zone)
        .build();
    let telemetry = Arc::new(AsyncTelemetry::new(datastore.clone(), zone));
    let monitor = Arc::new(PerformanceMonitor::new(
        clock.clone(),
        zone,
        config.performance.sla_threshold_ms,
        config.performance.target_score,
        config.performance.retention_days,
    ));

    let handler = Arc::new(TriggerHandler::new(
        cache.clone(),
        datastore.clone(),
        engine,
        telemetry.clone(),
        monitor.clone(),
        clock,
        config.member_lookup_timeout(),
    ));

    // Create API state
    let api_state = AppState {
        handler,
        cache: cache.clone(),
        datastore,
        telemetry,
        monitor,
        health_check_timeout: config.health_check_timeout(),
        default_report_days: config.performance.default_report_days,
        max_preload_videos: config.api.max_preload_videos,
    };

    let shutdown = CancellationToken::new();

    // Spawn cache refresh task
    let refresh_handle = cache.spawn_refresh_task(config.refresh_interval(), shutdown.clone());

    // Spawn API server task
    let api_config = config.api.clone();
    let api_shutdown = shutdown.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(api_state, &api_config, api_shutdown).await {
            error!(error = %e, "API server error");
        }
    });

    info!("Ceremony service started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down ceremony service");

    shutdown.cancel();
    if let Err(e) = refresh_handle.await {
        error!(error = %e, "Cache refresh task panicked");
    }
    if let Err(e) = api_handle.await {
        error!(error = %e, "API server task panicked");
    }

    info!("Ceremony service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str, log_format: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);

    if log_format.eq_ignore_ascii_case("pretty") {
        registry.with(fmt::layer().pretty()).init();
    } else {
        registry.with(fmt::layer().json()).init();
    }
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
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
