//! Herald delivery worker binary: one delivery loop per channel.

use std::sync::Arc;

use chrono::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;

use herald_common::clock::{Clock, SystemClock};
use herald_common::config::AppConfig;
use herald_common::db::create_pool;
use herald_common::redis_pool::create_redis_pool;
use herald_common::types::Channel;
use herald_engine::pacing::{PacingConfig, PacingCoordinator, RedisPacingStore};
use herald_engine::queue::RedisDelayedQueue;
use herald_engine::settings::PgProviderSettings;
use herald_engine::store::PgJobStore;

use herald_notifier::provider::ProviderGateway;
use herald_notifier::retry::RetryPolicy;
use herald_notifier::worker::{DeliveryWorker, WorkerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "herald_notifier=info,herald_engine=info".into()),
        )
        .json()
        .init();

    tracing::info!("Herald worker starting...");

    let config = AppConfig::from_env()?;

    let pool = create_pool(&config.database_url, config.db_max_connections).await?;
    let redis = create_redis_pool(&config.redis_url).await?;
    tracing::info!("Database and Redis connections established");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let worker_config = WorkerConfig::from_config(&config);

    let worker = Arc::new(DeliveryWorker::new(
        Arc::new(PgJobStore::new(pool.clone())),
        Arc::new(RedisDelayedQueue::new(
            redis.clone(),
            clock.clone(),
            Duration::milliseconds(config.queue_visibility_timeout_ms as i64),
        )),
        Arc::new(PgProviderSettings::new(pool)),
        Arc::new(PacingCoordinator::new(
            Arc::new(RedisPacingStore::new(redis)),
            clock.clone(),
            PacingConfig::from_config(&config),
        )),
        Arc::new(ProviderGateway::new(worker_config.provider_timeout)?),
        RetryPolicy::from_config(&config),
        clock,
        worker_config,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut loops = JoinSet::new();
    for channel in Channel::ALL {
        loops.spawn(Arc::clone(&worker).run(channel, shutdown_rx.clone()));
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal, finishing in-flight deliveries...");
    shutdown_tx.send(true)?;

    while let Some(joined) = loops.join_next().await {
        if let Err(e) = joined {
            tracing::error!(error = %e, "Delivery loop panicked");
        }
    }

    tracing::info!("Herald worker stopped.");
    Ok(())
}
