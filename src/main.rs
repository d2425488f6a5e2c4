use anyhow::{Context, Result};
use gatekeep::admission::AdmissionPipeline;
use gatekeep::api::{
    create_admin_router, create_gateway_router, create_keys_router, AdminAppState,
    AdmissionLayerState, KeysAppState,
};
use gatekeep::config::{load_config, new_runtime_config, GatewayConfig};
use gatekeep::keys::{KeyRegistry, SqliteKeyStore};
use gatekeep::nats::{NatsClient, NotificationPublisher};
use gatekeep::quota::{run_quota_reset, QuotaTracker};
use gatekeep::rate_limit::RateLimiter;
use gatekeep::store::{run_counter_purge, CounterStore, MemoryCounterStore};
use gatekeep::telemetry::{
    spawn_workers, LogNotifier, Notifier, SqliteUsageLog, UsageEmitter, UsageTelemetry,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gatekeep=info".into()),
        )
        .init();

    info!("Gatekeep starting...");

    let config_path =
        std::env::var("GATEKEEP_CONFIG").unwrap_or_else(|_| "config.toml".to_string());
    let mut config = if std::path::Path::new(&config_path).exists() {
        load_config(&config_path)
            .map_err(|e| anyhow::anyhow!("Failed to load config {}: {}", config_path, e))?
    } else {
        info!(path = %config_path, "No config file, using defaults");
        GatewayConfig::default()
    };
    if let Ok(token) = std::env::var("GATEKEEP_ADMIN_TOKEN") {
        config.server.admin_token = Some(token);
    }
    if config.server.admin_token.is_none() {
        warn!("No admin token configured; key management and admin routes are unrestricted");
    }

    info!(
        bind_addr = %config.server.bind_addr,
        database = %config.storage.database_path,
        nats_enabled = config.nats.enabled,
        "Configuration loaded"
    );

    // Persistence
    let key_store = Arc::new(
        SqliteKeyStore::new(&config.storage.database_path)
            .context("Failed to initialize key store")?,
    );
    let usage_log = Arc::new(
        SqliteUsageLog::new(&config.storage.database_path)
            .context("Failed to initialize usage log")?,
    );
    let counters: Arc<dyn CounterStore> = Arc::new(MemoryCounterStore::new());

    // Notifications
    let notifier: Arc<dyn Notifier> = if config.nats.enabled {
        match NatsClient::connect(config.nats.clone()).await {
            Ok(client) => {
                info!("Notifications will be published to NATS");
                Arc::new(NotificationPublisher::new(client.jetstream().clone()))
            }
            Err(e) => {
                warn!(error = %e, "NATS unavailable, notifications will only be logged");
                Arc::new(LogNotifier)
            }
        }
    } else {
        Arc::new(LogNotifier)
    };

    // Core components
    let registry = KeyRegistry::new(key_store.clone(), config.keys.settings());
    let quota = QuotaTracker::new(key_store.clone());
    let limiter = RateLimiter::new(Arc::clone(&counters), config.rate_limit.grace());
    let runtime_config = new_runtime_config();

    // Usage telemetry
    let (emitter, usage_rx) = UsageEmitter::channel(config.telemetry.queue_capacity);
    let telemetry = UsageTelemetry::new(
        Arc::clone(&counters),
        quota.clone(),
        usage_log,
        notifier,
        config.telemetry.settings(),
    );
    let workers = spawn_workers(telemetry, usage_rx, config.telemetry.workers);

    // Background jobs
    tokio::spawn(run_quota_reset(
        quota.clone(),
        config.quota.reset_interval_seconds,
    ));
    tokio::spawn(run_counter_purge(
        Arc::clone(&counters),
        config.telemetry.purge_interval_seconds,
    ));

    let pipeline = AdmissionPipeline::new(
        registry.clone(),
        limiter,
        config.rate_limit.windows(),
        runtime_config.clone(),
        config.storage.timeout(),
        emitter,
    );

    let app = create_gateway_router(AdmissionLayerState {
        pipeline,
        product_id: None,
    })
    .layer(CorsLayer::permissive())
    .merge(create_keys_router(KeysAppState {
        registry,
        quota,
        admin_token: config.server.admin_token.clone(),
    }))
    .merge(create_admin_router(AdminAppState {
        runtime_config,
        admin_token: config.server.admin_token.clone(),
    }));

    let listener = tokio::net::TcpListener::bind(&config.server.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind_addr))?;
    info!(addr = %config.server.bind_addr, "Gatekeep listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for ctrl_c signal");
        }
        info!("Shutdown signal received");
    })
    .await
    .context("HTTP server error")?;

    // Server and its emitters are gone; let workers drain the queue
    futures::future::join_all(workers).await;
    info!("Gatekeep stopped");

    Ok(())
}
