//! Per-client request budget.
//!
//! Fixed one-minute windows counted in Redis (`INCR`, then `PEXPIRE` on the first hit). Clients
//! are keyed by the `X-Real-IP` header set by the reverse proxy, falling back to the peer address.
//! If the counter store is unreachable requests are let through.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::{ConnectInfo, Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Duration, Utc};
use redis::aio::ConnectionManager;
use tokio::sync::Mutex;

use herald_common::clock::Clock;
use herald_common::error::AppError;

pub const REAL_IP_HEADER: &str = "x-real-ip";

/// Counter of hits per key, each key living for `ttl` after its first hit.
#[async_trait]
pub trait HitCounter: Send + Sync {
    async fn hit(&self, key: &str, ttl: Duration) -> anyhow::Result<u64>;
}

pub struct RedisHitCounter {
    redis: ConnectionManager,
}

impl RedisHitCounter {
    pub fn new(redis: ConnectionManager) -> Self {
        Self { redis }
    }
}

#[async_trait]
impl HitCounter for RedisHitCounter {
    async fn hit(&self, key: &str, ttl: Duration) -> anyhow::Result<u64> {
        let mut redis = self.redis.clone();
        let count: u64 = redis::cmd("INCR").arg(key).query_async(&mut redis).await?;
        if count == 1 {
            let _: () = redis::cmd("PEXPIRE")
                .arg(key)
                .arg(ttl.num_milliseconds().max(1))
                .query_async(&mut redis)
                .await?;
        }
        Ok(count)
    }
}

pub struct InMemoryHitCounter {
    hits: Mutex<HashMap<String, (u64, DateTime<Utc>)>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryHitCounter {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            hits: Mutex::new(HashMap::new()),
            clock,
        }
    }
}

#[async_trait]
impl HitCounter for InMemoryHitCounter {
    async fn hit(&self, key: &str, ttl: Duration) -> anyhow::Result<u64> {
        let now = self.clock.now();
        let mut hits = self.hits.lock().await;
        hits.retain(|_, (_, expires_at)| *expires_at > now);
        let entry = hits.entry(key.to_string()).or_insert((0, now + ttl));
        entry.0 += 1;
        Ok(entry.0)
    }
}

pub struct RateLimiter {
    counter: Arc<dyn HitCounter>,
    clock: Arc<dyn Clock>,
    limit: u64,
    window: Duration,
}

impl RateLimiter {
    /// Allow `limit` requests per client and minute.
    pub fn per_minute(counter: Arc<dyn HitCounter>, clock: Arc<dyn Clock>, limit: u64) -> Self {
        Self {
            counter,
            clock,
            limit,
            window: Duration::minutes(1),
        }
    }

    /// `Ok(())` when `client` still has budget, otherwise the seconds until the window resets.
    pub async fn check(&self, client: &str) -> Result<(), u64> {
        let now_ms = self.clock.now().timestamp_millis();
        let window_ms = self.window.num_milliseconds().max(1);
        let slot = now_ms.div_euclid(window_ms);
        let key = format!("herald:ratelimit:{}:{}", client, slot);

        match self.counter.hit(&key, self.window).await {
            Ok(count) if count > self.limit => {
                let remaining_ms = (slot + 1) * window_ms - now_ms;
                Err((remaining_ms as u64).div_ceil(1000))
            }
            Ok(_) => Ok(()),
            Err(e) => {
                tracing::warn!(client, error = %e, "Rate limit counter unavailable");
                Ok(())
            }
        }
    }
}

fn client_key(request: &Request) -> String {
    if let Some(ip) = request
        .headers()
        .get(REAL_IP_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return ip.to_string();
    }
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Axum middleware; install with `axum::middleware::from_fn_with_state`.
pub async fn rate_limit(
    State(limiter): State<Arc<RateLimiter>>,
    request: Request,
    next: Next,
) -> Response {
    let client = client_key(&request);
    match limiter.check(&client).await {
        Ok(()) => next.run(request).await,
        Err(retry_after_secs) => {
            tracing::debug!(client = %client, retry_after_secs, "Request rate limited");
            AppError::RateLimited { retry_after_secs }.into_response()
        }
    }
}
