use redis::Client;
use redis::aio::ConnectionManager;

/// Open the shared Redis connection used for pacing state and delayed queues.
///
/// `ConnectionManager` reconnects on its own and is cheap to clone per operation.
pub async fn create_redis_pool(redis_url: &str) -> anyhow::Result<ConnectionManager> {
    let client = Client::open(redis_url)?;
    let manager = ConnectionManager::new(client).await?;

    tracing::info!("Connected to Redis");
    Ok(manager)
}
