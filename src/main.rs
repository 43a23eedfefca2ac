use axum::{
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod config;
mod constants;
mod crypto;
mod db;
mod error;
mod integrations;
mod models;
mod services;
mod utils;

use config::Config;
use constants::{API_VERSION, JOB_DRAIN_TIMEOUT_SECS};
use db::Database;
use services::{
    AdjustmentService, DispatcherSettings, JobDispatcher, OracleSettings, PriceOracle, RedisStore,
    SharedStore,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "casino_ledger=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env()?;
    config.validate()?;

    tracing::info!("Starting casino ledger");
    tracing::info!("Environment: {}", config.environment);
    tracing::info!("API Version: {}", API_VERSION);

    // Initialize database
    let db = Database::new(&config).await?;

    // Run migrations
    tracing::info!("Running database migrations...");
    db.run_migrations().await?;

    // Initialize Redis
    let redis = redis::Client::open(config.redis_url.clone())?;
    let redis_manager = redis::aio::ConnectionManager::new(redis).await?;
    let store: Arc<dyn SharedStore> = Arc::new(RedisStore::new(redis_manager));
    let ledger = Arc::new(db.clone());

    // Price oracle
    let providers = integrations::default_feeds(&config)?;
    let oracle = Arc::new(PriceOracle::new(
        store.clone(),
        ledger.clone(),
        providers,
        OracleSettings::from_config(&config),
    ));
    oracle.warm_up().await;

    // Durable job hand-off
    let (jobs, jobs_handle) = JobDispatcher::start(
        store.clone(),
        DispatcherSettings {
            stream: config.job_stream.clone(),
            max_len: config.job_stream_max_len,
            capacity: config.job_queue_capacity,
            signing_secret: config.job_signing_secret.clone(),
        },
    );

    let adjustments = Arc::new(AdjustmentService::new(
        &config,
        store.clone(),
        ledger,
        oracle.clone(),
        jobs,
    ));

    let app_state = api::AppState {
        db,
        store,
        config: config.clone(),
        oracle: oracle.clone(),
        adjustments,
    };

    // Build router
    let app = build_router(app_state);

    // Start server
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    // Router and its state are gone; the dispatcher channel is closed.
    tracing::info!("Draining balance job queue...");
    match tokio::time::timeout(Duration::from_secs(JOB_DRAIN_TIMEOUT_SECS), jobs_handle).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!("Job dispatcher task failed: {}", e),
        Err(_) => tracing::error!(
            "Job queue not drained within {}s; remaining jobs need reconciliation",
            JOB_DRAIN_TIMEOUT_SECS
        ),
    }
    oracle.shutdown().await;

    tracing::info!("Shutdown complete");
    Ok(())
}

fn build_router(state: api::AppState) -> Router {
    let cors = api::cors_layer(&state.config);

    Router::new()
        // Health check
        .route("/health", get(api::health::health_check))
        // Game provider callback
        .route("/api/v1/balance/adjust", post(api::balance::adjust_balance))
        // Admin (price oracle test mode)
        .route("/api/v1/admin/oracle/lock", post(api::admin::lock_oracle))
        .route("/api/v1/admin/oracle/unlock", post(api::admin::unlock_oracle))
        .route("/api/v1/admin/oracle/status", get(api::admin::oracle_status))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}
