//! Pacing coordinator: Redis-backed per-customer dispatch cursors.
//!
//! Two records are kept per customer, both with a TTL so idle customers reset to "now":
//! - the scheduling cursor, the latest dispatch instant handed out by any batch;
//! - per channel, the instant of the last actual send, read by workers right before calling a
//!   provider.
//!
//! Access is plain `GET` then `SET ... PX ttl`. Two concurrent batches for the same customer may
//! interleave and the last write wins, possibly rewinding the cursor.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tokio::sync::RwLock;
use uuid::Uuid;

use herald_common::clock::Clock;
use herald_common::config::AppConfig;
use herald_common::types::Channel;

/// Shared key-value store with expiry. Values are epoch milliseconds.
#[async_trait]
pub trait PacingStore: Send + Sync {
    async fn get_millis(&self, key: &str) -> anyhow::Result<Option<i64>>;
    async fn set_millis(&self, key: &str, value: i64, ttl: Duration) -> anyhow::Result<()>;
}

/// Redis implementation (`GET` / `SET key value PX ttl`).
#[derive(Clone)]
pub struct RedisPacingStore {
    redis: ConnectionManager,
}

impl RedisPacingStore {
    pub fn new(redis: ConnectionManager) -> Self {
        Self { redis }
    }
}

#[async_trait]
impl PacingStore for RedisPacingStore {
    async fn get_millis(&self, key: &str) -> anyhow::Result<Option<i64>> {
        let mut redis = self.redis.clone();
        let value: Option<i64> = redis.get(key).await?;
        Ok(value)
    }

    async fn set_millis(&self, key: &str, value: i64, ttl: Duration) -> anyhow::Result<()> {
        let mut redis = self.redis.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl.num_milliseconds().max(1))
            .query_async(&mut redis)
            .await?;
        Ok(())
    }
}

/// In-process store with clock-driven expiry.
pub struct InMemoryPacingStore {
    entries: RwLock<HashMap<String, (i64, DateTime<Utc>)>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryPacingStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            clock,
        }
    }
}

#[async_trait]
impl PacingStore for InMemoryPacingStore {
    async fn get_millis(&self, key: &str) -> anyhow::Result<Option<i64>> {
        let now = self.clock.now();
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|(_, expires_at)| *expires_at > now)
            .map(|(value, _)| *value))
    }

    async fn set_millis(&self, key: &str, value: i64, ttl: Duration) -> anyhow::Result<()> {
        let expires_at = self.clock.now() + ttl;
        let mut entries = self.entries.write().await;
        entries.insert(key.to_string(), (value, expires_at));
        Ok(())
    }
}

/// Tunables of the coordinator.
#[derive(Debug, Clone, Copy)]
pub struct PacingConfig {
    /// Added to a stored cursor that is still in the future.
    pub floor_cushion: Duration,
    /// Expiry of every record.
    pub ttl: Duration,
}

impl PacingConfig {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            floor_cushion: Duration::milliseconds(config.pacing_floor_cushion_ms as i64),
            ttl: Duration::seconds(config.pacing_ttl_secs as i64),
        }
    }
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            floor_cushion: Duration::seconds(1),
            ttl: Duration::hours(2),
        }
    }
}

pub struct PacingCoordinator {
    store: Arc<dyn PacingStore>,
    clock: Arc<dyn Clock>,
    config: PacingConfig,
}

impl PacingCoordinator {
    pub fn new(store: Arc<dyn PacingStore>, clock: Arc<dyn Clock>, config: PacingConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    /// Margin added on top of a cursor that is still ahead of "now".
    pub fn floor_cushion(&self) -> Duration {
        self.config.floor_cushion
    }

    /// Earliest instant a new job of `customer_id` may be scheduled at.
    ///
    /// Returns the stored cursor plus the floor cushion while that cursor lies in the future,
    /// otherwise "now". Missing or expired state also means "now".
    pub async fn earliest_available(&self, customer_id: Uuid) -> anyhow::Result<DateTime<Utc>> {
        let now = self.clock.now();
        let stored = self
            .store
            .get_millis(&Self::cursor_key(customer_id))
            .await?
            .and_then(from_millis);

        Ok(match stored {
            Some(cursor) if cursor > now => cursor + self.config.floor_cushion,
            _ => now,
        })
    }

    /// Store the customer's cursor. Unconditional: a concurrent writer may be overwritten.
    pub async fn set_earliest_available(
        &self,
        customer_id: Uuid,
        instant: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        self.store
            .set_millis(
                &Self::cursor_key(customer_id),
                instant.timestamp_millis(),
                self.config.ttl,
            )
            .await?;

        tracing::debug!(
            customer_id = %customer_id,
            cursor = %instant,
            "Pacing cursor updated"
        );
        Ok(())
    }

    /// How long a worker must still wait so that `floor` separates this send from the
    /// customer's previous send on `channel`.
    pub async fn send_slot_wait(
        &self,
        customer_id: Uuid,
        channel: Channel,
        floor: Duration,
    ) -> anyhow::Result<Duration> {
        if floor <= Duration::zero() {
            return Ok(Duration::zero());
        }

        let last = self
            .store
            .get_millis(&Self::last_send_key(customer_id, channel))
            .await?
            .and_then(from_millis);

        let Some(last) = last else {
            return Ok(Duration::zero());
        };

        let elapsed = self.clock.now() - last;
        Ok((floor - elapsed).max(Duration::zero()))
    }

    /// Remember that `customer_id` just sent on `channel`.
    pub async fn record_send(
        &self,
        customer_id: Uuid,
        channel: Channel,
        at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        self.store
            .set_millis(
                &Self::last_send_key(customer_id, channel),
                at.timestamp_millis(),
                self.config.ttl,
            )
            .await
    }

    fn cursor_key(customer_id: Uuid) -> String {
        format!("herald:pacing:cursor:{}", customer_id)
    }

    fn last_send_key(customer_id: Uuid, channel: Channel) -> String {
        format!("herald:pacing:last_send:{}:{}", channel, customer_id)
    }
}

fn from_millis(millis: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis).single()
}

#[cfg(test)]
mod tests {
    use super::*;
    use herald_common::clock::ManualClock;

    fn setup() -> (Arc<ManualClock>, PacingCoordinator) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 1, 17, 12, 0, 0).unwrap(),
        ));
        let store = Arc::new(InMemoryPacingStore::new(clock.clone()));
        let coordinator = PacingCoordinator::new(store, clock.clone(), PacingConfig::default());
        (clock, coordinator)
    }

    #[tokio::test]
    async fn test_absent_state_means_now() {
        let (clock, pacing) = setup();
        let earliest = pacing.earliest_available(Uuid::new_v4()).await.unwrap();
        assert_eq!(earliest, clock.now());
    }

    #[tokio::test]
    async fn test_future_cursor_gets_cushion() {
        let (clock, pacing) = setup();
        let customer = Uuid::new_v4();
        let cursor = clock.now() + Duration::minutes(5);

        pacing.set_earliest_available(customer, cursor).await.unwrap();
        let earliest = pacing.earliest_available(customer).await.unwrap();
        assert_eq!(earliest, cursor + Duration::seconds(1));
    }

    #[tokio::test]
    async fn test_elapsed_cursor_means_now() {
        let (clock, pacing) = setup();
        let customer = Uuid::new_v4();
        pacing
            .set_earliest_available(customer, clock.now() + Duration::seconds(30))
            .await
            .unwrap();

        clock.advance(Duration::seconds(31));
        assert_eq!(pacing.earliest_available(customer).await.unwrap(), clock.now());
    }

    #[tokio::test]
    async fn test_state_expires_after_ttl() {
        let (clock, pacing) = setup();
        let customer = Uuid::new_v4();
        pacing
            .set_earliest_available(customer, clock.now() + Duration::hours(5))
            .await
            .unwrap();

        clock.advance(Duration::hours(2) + Duration::seconds(1));
        assert_eq!(pacing.earliest_available(customer).await.unwrap(), clock.now());
    }

    #[tokio::test]
    async fn test_last_write_wins() {
        let (clock, pacing) = setup();
        let customer = Uuid::new_v4();
        let far = clock.now() + Duration::minutes(30);
        let near = clock.now() + Duration::minutes(2);

        pacing.set_earliest_available(customer, far).await.unwrap();
        pacing.set_earliest_available(customer, near).await.unwrap();

        assert_eq!(
            pacing.earliest_available(customer).await.unwrap(),
            near + Duration::seconds(1)
        );
    }

    #[tokio::test]
    async fn test_send_slot_wait() {
        let (clock, pacing) = setup();
        let customer = Uuid::new_v4();
        let floor = Duration::seconds(10);

        assert_eq!(
            pacing
                .send_slot_wait(customer, Channel::Whatsapp, floor)
                .await
                .unwrap(),
            Duration::zero()
        );

        pacing
            .record_send(customer, Channel::Whatsapp, clock.now())
            .await
            .unwrap();
        clock.advance(Duration::seconds(4));

        assert_eq!(
            pacing
                .send_slot_wait(customer, Channel::Whatsapp, floor)
                .await
                .unwrap(),
            Duration::seconds(6)
        );
        // Channels are tracked separately.
        assert_eq!(
            pacing
                .send_slot_wait(customer, Channel::Sms, floor)
                .await
                .unwrap(),
            Duration::zero()
        );

        clock.advance(Duration::seconds(20));
        assert_eq!(
            pacing
                .send_slot_wait(customer, Channel::Whatsapp, floor)
                .await
                .unwrap(),
            Duration::zero()
        );
    }
}
