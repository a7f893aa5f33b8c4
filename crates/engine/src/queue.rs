//! Durable delayed queue, one per channel.
//!
//! Redis layout per channel: a sorted set `herald:queue:{channel}` of job ids scored by the
//! epoch millisecond they become due, plus a hash `herald:queue:{channel}:payloads` holding the
//! serialized [`QueuedJob`]. Claiming pushes the score forward by the visibility timeout instead
//! of removing the entry; only an ack removes it. A worker that dies mid-job therefore loses its
//! claim and the job is delivered again (at-least-once).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use redis::aio::ConnectionManager;
use tokio::sync::Mutex;
use uuid::Uuid;

use herald_common::clock::Clock;
use herald_common::types::{Channel, QueuedJob};

/// Atomically select due ids, lease them, and return their payloads.
const CLAIM_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, tonumber(ARGV[3]))
local claimed = {}
for _, id in ipairs(due) do
  local payload = redis.call('HGET', KEYS[2], id)
  if payload then
    redis.call('ZADD', KEYS[1], ARGV[2], id)
    table.insert(claimed, payload)
  else
    redis.call('ZREM', KEYS[1], id)
  end
end
return claimed
"#;

#[async_trait]
pub trait DelayedQueue: Send + Sync {
    /// Make `job` visible once `delay` has elapsed. Enqueuing a job id that is already present
    /// replaces its payload and due time (this is how retries are rescheduled).
    async fn enqueue(&self, job: &QueuedJob, delay: Duration) -> anyhow::Result<()>;

    /// Claim up to `limit` due jobs. A claimed job is hidden for the visibility timeout.
    async fn claim_due(&self, channel: Channel, limit: usize) -> anyhow::Result<Vec<QueuedJob>>;

    /// Remove a finished job for good.
    async fn ack(&self, channel: Channel, job_id: Uuid) -> anyhow::Result<()>;

    /// Number of entries (due or not) on the channel's queue.
    async fn depth(&self, channel: Channel) -> anyhow::Result<usize>;
}

pub fn queue_key(channel: Channel) -> String {
    format!("herald:queue:{}", channel)
}

fn payload_key(channel: Channel) -> String {
    format!("herald:queue:{}:payloads", channel)
}

pub struct RedisDelayedQueue {
    redis: ConnectionManager,
    clock: Arc<dyn Clock>,
    visibility_timeout: Duration,
    claim: redis::Script,
}

impl RedisDelayedQueue {
    pub fn new(
        redis: ConnectionManager,
        clock: Arc<dyn Clock>,
        visibility_timeout: Duration,
    ) -> Self {
        Self {
            redis,
            clock,
            visibility_timeout,
            claim: redis::Script::new(CLAIM_SCRIPT),
        }
    }
}

#[async_trait]
impl DelayedQueue for RedisDelayedQueue {
    async fn enqueue(&self, job: &QueuedJob, delay: Duration) -> anyhow::Result<()> {
        let due = self.clock.now() + delay.max(Duration::zero());
        let payload = serde_json::to_string(job)?;
        let id = job.job_id.to_string();
        let mut redis = self.redis.clone();

        let _: () = redis::pipe()
            .atomic()
            .hset(payload_key(job.channel), &id, payload)
            .ignore()
            .zadd(queue_key(job.channel), &id, due.timestamp_millis())
            .ignore()
            .query_async(&mut redis)
            .await?;

        tracing::debug!(
            job_id = %job.job_id,
            channel = %job.channel,
            attempt = job.attempt,
            delay_ms = delay.num_milliseconds(),
            "Job enqueued"
        );
        Ok(())
    }

    async fn claim_due(&self, channel: Channel, limit: usize) -> anyhow::Result<Vec<QueuedJob>> {
        let now = self.clock.now();
        let lease_until = now + self.visibility_timeout;
        let mut redis = self.redis.clone();

        let payloads: Vec<String> = self
            .claim
            .key(queue_key(channel))
            .key(payload_key(channel))
            .arg(now.timestamp_millis())
            .arg(lease_until.timestamp_millis())
            .arg(limit)
            .invoke_async(&mut redis)
            .await?;

        let mut jobs = Vec::with_capacity(payloads.len());
        for payload in payloads {
            match serde_json::from_str::<QueuedJob>(&payload) {
                Ok(job) => jobs.push(job),
                Err(e) => {
                    tracing::warn!(channel = %channel, error = %e, "Skipping unreadable queue payload")
                }
            }
        }
        Ok(jobs)
    }

    async fn ack(&self, channel: Channel, job_id: Uuid) -> anyhow::Result<()> {
        let id = job_id.to_string();
        let mut redis = self.redis.clone();
        let _: () = redis::pipe()
            .atomic()
            .zrem(queue_key(channel), &id)
            .ignore()
            .hdel(payload_key(channel), &id)
            .ignore()
            .query_async(&mut redis)
            .await?;
        Ok(())
    }

    async fn depth(&self, channel: Channel) -> anyhow::Result<usize> {
        let mut redis = self.redis.clone();
        let depth: usize = redis::cmd("ZCARD")
            .arg(queue_key(channel))
            .query_async(&mut redis)
            .await?;
        Ok(depth)
    }
}

/// In-process queue with the same claim/lease semantics.
pub struct InMemoryDelayedQueue {
    entries: Mutex<HashMap<Channel, HashMap<Uuid, (DateTime<Utc>, QueuedJob)>>>,
    clock: Arc<dyn Clock>,
    visibility_timeout: Duration,
}

impl InMemoryDelayedQueue {
    pub fn new(clock: Arc<dyn Clock>, visibility_timeout: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
            visibility_timeout,
        }
    }

    /// Due time and payload of a queued job.
    pub async fn get(&self, channel: Channel, job_id: Uuid) -> Option<(DateTime<Utc>, QueuedJob)> {
        let entries = self.entries.lock().await;
        entries
            .get(&channel)
            .and_then(|queue| queue.get(&job_id))
            .cloned()
    }
}

#[async_trait]
impl DelayedQueue for InMemoryDelayedQueue {
    async fn enqueue(&self, job: &QueuedJob, delay: Duration) -> anyhow::Result<()> {
        let due = self.clock.now() + delay.max(Duration::zero());
        let mut entries = self.entries.lock().await;
        entries
            .entry(job.channel)
            .or_default()
            .insert(job.job_id, (due, job.clone()));
        Ok(())
    }

    async fn claim_due(&self, channel: Channel, limit: usize) -> anyhow::Result<Vec<QueuedJob>> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        let Some(queue) = entries.get_mut(&channel) else {
            return Ok(Vec::new());
        };

        let mut due: Vec<(DateTime<Utc>, Uuid)> = queue
            .iter()
            .filter(|(_, (at, _))| *at <= now)
            .map(|(id, (at, _))| (*at, *id))
            .collect();
        due.sort();
        due.truncate(limit);

        let lease_until = now + self.visibility_timeout;
        let mut claimed = Vec::with_capacity(due.len());
        for (_, id) in due {
            if let Some(entry) = queue.get_mut(&id) {
                entry.0 = lease_until;
                claimed.push(entry.1.clone());
            }
        }
        Ok(claimed)
    }

    async fn ack(&self, channel: Channel, job_id: Uuid) -> anyhow::Result<()> {
        let mut entries = self.entries.lock().await;
        if let Some(queue) = entries.get_mut(&channel) {
            queue.remove(&job_id);
        }
        Ok(())
    }

    async fn depth(&self, channel: Channel) -> anyhow::Result<usize> {
        let entries = self.entries.lock().await;
        Ok(entries.get(&channel).map_or(0, HashMap::len))
    }
}
