//! Herald API server binary entrypoint.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::middleware::from_fn_with_state;
use chrono::Duration;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use herald_common::clock::{Clock, SystemClock};
use herald_common::config::AppConfig;
use herald_common::db::create_pool;
use herald_common::redis_pool::create_redis_pool;
use herald_engine::blackout::BlackoutPolicy;
use herald_engine::pacing::{PacingConfig, PacingCoordinator, RedisPacingStore};
use herald_engine::queue::RedisDelayedQueue;
use herald_engine::receipts::ReceiptRecorder;
use herald_engine::scheduler::{BatchScheduler, SchedulingPolicy};
use herald_engine::settings::PgProviderSettings;
use herald_engine::store::PgJobStore;

use herald_api::forwarder::ReceiptForwarder;
use herald_api::middleware::rate_limit::{RateLimiter, RedisHitCounter, rate_limit};
use herald_api::routes::create_router;
use herald_api::state::AppState;

/// Bulk submissions may carry base64 images.
const BODY_LIMIT_BYTES: usize = 16 * 1024 * 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("herald_api=debug,herald_engine=debug,tower_http=debug")
        }))
        .init();

    tracing::info!("Starting Herald API server...");

    // Load configuration
    let config = AppConfig::from_env()?;
    let blackout = BlackoutPolicy::new(config.blackout_windows.clone(), config.timezone)?;
    tracing::info!(
        timezone = %config.timezone,
        windows = ?config.blackout_windows.iter().map(ToString::to_string).collect::<Vec<_>>(),
        "Blackout policy loaded"
    );

    // Create database connection pool
    let pool = create_pool(&config.database_url, config.db_max_connections).await?;
    sqlx::migrate!("../../migrations").run(&pool).await?;
    tracing::info!("Database pool created, migrations applied");

    // Create Redis connection
    let redis = create_redis_pool(&config.redis_url).await?;
    tracing::info!("Redis connection established");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let jobs = Arc::new(PgJobStore::new(pool.clone()));
    let settings = Arc::new(PgProviderSettings::new(pool));
    let limiter = Arc::new(RateLimiter::per_minute(
        Arc::new(RedisHitCounter::new(redis.clone())),
        clock.clone(),
        config.rate_limit_per_minute,
    ));
    let scheduler = BatchScheduler::new(
        SchedulingPolicy::from_config(&config),
        blackout,
        Arc::new(PacingCoordinator::new(
            Arc::new(RedisPacingStore::new(redis.clone())),
            clock.clone(),
            PacingConfig::from_config(&config),
        )),
        jobs.clone(),
        Arc::new(RedisDelayedQueue::new(
            redis,
            clock.clone(),
            Duration::milliseconds(config.queue_visibility_timeout_ms as i64),
        )),
        settings.clone(),
        clock,
    );

    // Build application state
    let receipts = Arc::new(ReceiptRecorder::new(jobs.clone(), settings));
    let mut state = AppState::new(Arc::new(scheduler), jobs, receipts);
    if let Some(url) = &config.receipt_forward_url {
        let timeout = std::time::Duration::from_millis(config.provider_timeout_ms);
        state = state.with_forwarder(ReceiptForwarder::new(url.clone(), timeout)?);
        tracing::info!(url = %url, "Delivery receipts will be forwarded");
    }

    // Build router
    let app = create_router(state)
        .layer(from_fn_with_state(limiter, rate_limit))
        .layer(RequestBodyLimitLayer::new(BODY_LIMIT_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.api_port));
    tracing::info!("API server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Received shutdown signal, stopping gracefully...");
        })
        .await?;

    Ok(())
}
