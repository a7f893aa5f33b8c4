//! Delivery worker: drains one channel's delayed queue and calls the provider.
//!
//! Per job: `queued|retrying -> sending -> sent | retrying | failed`. Redelivered jobs whose
//! record is already terminal are acknowledged without sending again.

use std::sync::Arc;

use chrono::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;

use herald_common::clock::Clock;
use herald_common::config::AppConfig;
use herald_common::types::{Channel, DispatchJob, JobStatus, QueuedJob};
use herald_engine::pacing::PacingCoordinator;
use herald_engine::queue::DelayedQueue;
use herald_engine::settings::ProviderSettingsRepository;
use herald_engine::store::JobStore;

use crate::provider::{DeliveryError, Provider};
use crate::retry::{RetryDecision, RetryPolicy};

/// Minimum spacing between two sends of one customer on one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendFloor {
    None,
    Fixed(Duration),
    /// Half the scheduling delay of the job, clamped to `[min, max]`.
    Adaptive { min: Duration, max: Duration },
}

impl SendFloor {
    pub fn floor(&self, pacing_hint_ms: u64) -> Duration {
        match *self {
            SendFloor::None => Duration::zero(),
            SendFloor::Fixed(floor) => floor,
            SendFloor::Adaptive { min, max } => {
                let half = Duration::milliseconds((pacing_hint_ms / 2) as i64);
                half.clamp(min, max.max(min))
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub provider_timeout: std::time::Duration,
    pub poll_interval: std::time::Duration,
    pub whatsapp_floor: SendFloor,
    pub sms_floor: SendFloor,
    pub email_concurrency: usize,
}

impl WorkerConfig {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            provider_timeout: std::time::Duration::from_millis(config.provider_timeout_ms),
            poll_interval: std::time::Duration::from_millis(config.worker_poll_interval_ms),
            whatsapp_floor: SendFloor::Adaptive {
                min: Duration::milliseconds(config.whatsapp_send_floor_min_ms as i64),
                max: Duration::milliseconds(config.whatsapp_send_floor_max_ms as i64),
            },
            sms_floor: SendFloor::Fixed(Duration::milliseconds(config.sms_send_floor_ms as i64)),
            email_concurrency: config.email_concurrency,
        }
    }

    pub fn send_floor(&self, channel: Channel) -> SendFloor {
        match channel {
            Channel::Whatsapp => self.whatsapp_floor,
            Channel::Sms => self.sms_floor,
            Channel::Email => SendFloor::None,
        }
    }

    /// Jobs processed at once. Pacing-sensitive channels are strictly sequential.
    pub fn concurrency(&self, channel: Channel) -> usize {
        match channel {
            Channel::Whatsapp | Channel::Sms => 1,
            Channel::Email => self.email_concurrency.max(1),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            provider_timeout: std::time::Duration::from_secs(20),
            poll_interval: std::time::Duration::from_secs(1),
            whatsapp_floor: SendFloor::Adaptive {
                min: Duration::seconds(10),
                max: Duration::seconds(30),
            },
            sms_floor: SendFloor::Fixed(Duration::seconds(1)),
            email_concurrency: 4,
        }
    }
}

/// What happened to one claimed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    Sent,
    Retrying(Duration),
    Failed,
    /// Unknown or already terminal; acknowledged without sending.
    Skipped,
}

pub struct DeliveryWorker {
    jobs: Arc<dyn JobStore>,
    queue: Arc<dyn DelayedQueue>,
    settings: Arc<dyn ProviderSettingsRepository>,
    pacing: Arc<PacingCoordinator>,
    provider: Arc<dyn Provider>,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
    config: WorkerConfig,
}

impl DeliveryWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        jobs: Arc<dyn JobStore>,
        queue: Arc<dyn DelayedQueue>,
        settings: Arc<dyn ProviderSettingsRepository>,
        pacing: Arc<PacingCoordinator>,
        provider: Arc<dyn Provider>,
        retry: RetryPolicy,
        clock: Arc<dyn Clock>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            jobs,
            queue,
            settings,
            pacing,
            provider,
            retry,
            clock,
            config,
        }
    }

    /// Poll `channel` until `shutdown` flips to true. Shutdown is honoured between ticks.
    pub async fn run(self: Arc<Self>, channel: Channel, mut shutdown: watch::Receiver<bool>) {
        match self.queue.depth(channel).await {
            Ok(depth) => tracing::info!(channel = %channel, depth, "Delivery worker started"),
            Err(e) => tracing::warn!(channel = %channel, error = %e, "Queue depth unavailable"),
        }

        while !*shutdown.borrow() {
            let idle = match self.tick(channel).await {
                Ok(processed) => processed == 0,
                Err(e) => {
                    tracing::error!(channel = %channel, error = %e, "Delivery tick failed");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }

        tracing::info!(channel = %channel, "Delivery worker stopped");
    }

    /// Claim the due jobs of `channel` and process them. Returns how many were claimed.
    pub async fn tick(self: &Arc<Self>, channel: Channel) -> anyhow::Result<usize> {
        let concurrency = self.config.concurrency(channel);
        let claimed = self.queue.claim_due(channel, concurrency).await?;
        let count = claimed.len();

        if concurrency == 1 {
            for queued in claimed {
                self.process_logged(queued).await;
            }
        } else {
            let mut tasks = JoinSet::new();
            for queued in claimed {
                let worker = Arc::clone(self);
                tasks.spawn(async move { worker.process_logged(queued).await });
            }
            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = joined {
                    tracing::error!(channel = %channel, error = %e, "Delivery task panicked");
                }
            }
        }

        Ok(count)
    }

    async fn process_logged(&self, queued: QueuedJob) {
        let job_id = queued.job_id;
        // The claim lease expires on error, so the job is delivered again later.
        if let Err(e) = self.process(queued).await {
            tracing::error!(job_id = %job_id, error = %e, "Failed to process job");
        }
    }

    /// Run one delivery attempt for a claimed job.
    pub async fn process(&self, queued: QueuedJob) -> anyhow::Result<ProcessOutcome> {
        let Some(mut job) = self.jobs.get(queued.job_id).await? else {
            tracing::warn!(job_id = %queued.job_id, "Claimed job has no record, dropping");
            self.queue.ack(queued.channel, queued.job_id).await?;
            return Ok(ProcessOutcome::Skipped);
        };

        if job.status.is_terminal() {
            tracing::debug!(job_id = %job.id, status = %job.status, "Job already finished");
            self.queue.ack(queued.channel, queued.job_id).await?;
            return Ok(ProcessOutcome::Skipped);
        }

        self.wait_for_send_slot(&job, &queued).await;

        job.transition(JobStatus::Sending, self.clock.now())?;
        job.attempts += 1;
        self.jobs.update(&job).await?;

        if let Err(e) = self
            .pacing
            .record_send(job.customer_id, job.channel(), self.clock.now())
            .await
        {
            tracing::warn!(job_id = %job.id, error = %e, "Failed to record send time");
        }

        match self.deliver(&job).await {
            Ok(response) => {
                job.provider_response = Some(response);
                job.last_error = None;
                job.transition(JobStatus::Sent, self.clock.now())?;
                self.jobs.update(&job).await?;
                self.queue.ack(queued.channel, job.id).await?;

                tracing::info!(
                    job_id = %job.id,
                    customer_id = %job.customer_id,
                    channel = %job.channel(),
                    attempt = job.attempts,
                    "Message sent"
                );
                Ok(ProcessOutcome::Sent)
            }
            Err(e) => self.handle_failure(job, &queued, e).await,
        }
    }

    async fn deliver(&self, job: &DispatchJob) -> Result<serde_json::Value, DeliveryError> {
        let settings = self
            .settings
            .find(job.customer_id, job.channel())
            .await
            .map_err(|e| DeliveryError::Transport(e.to_string()))?
            .ok_or(DeliveryError::MissingSettings(job.channel()))?;

        let timeout = self.config.provider_timeout;
        match tokio::time::timeout(timeout, self.provider.send(&settings, &job.request)).await {
            Ok(result) => result,
            Err(_) => Err(DeliveryError::Timeout(timeout)),
        }
    }

    async fn handle_failure(
        &self,
        mut job: DispatchJob,
        queued: &QueuedJob,
        error: DeliveryError,
    ) -> anyhow::Result<ProcessOutcome> {
        job.last_error = Some(error.to_string());

        match self.retry.decide(job.attempts) {
            RetryDecision::RetryAfter(delay) => {
                job.transition(JobStatus::Retrying, self.clock.now())?;
                self.jobs.update(&job).await?;
                // Re-enqueuing the same id replaces the claimed entry.
                self.queue.enqueue(&queued.next_attempt(), delay).await?;

                tracing::warn!(
                    job_id = %job.id,
                    attempt = job.attempts,
                    retry_in_ms = delay.num_milliseconds(),
                    error = %error,
                    "Delivery failed, retrying"
                );
                Ok(ProcessOutcome::Retrying(delay))
            }
            RetryDecision::GiveUp => {
                job.transition(JobStatus::Failed, self.clock.now())?;
                self.jobs.update(&job).await?;
                self.queue.ack(queued.channel, job.id).await?;

                tracing::error!(
                    job_id = %job.id,
                    customer_id = %job.customer_id,
                    attempts = job.attempts,
                    error = %error,
                    "Delivery failed permanently"
                );
                Ok(ProcessOutcome::Failed)
            }
        }
    }

    async fn wait_for_send_slot(&self, job: &DispatchJob, queued: &QueuedJob) {
        let floor = self
            .config
            .send_floor(job.channel())
            .floor(queued.pacing_hint_ms);

        let wait = match self
            .pacing
            .send_slot_wait(job.customer_id, job.channel(), floor)
            .await
        {
            Ok(wait) => wait,
            Err(e) => {
                tracing::warn!(job_id = %job.id, error = %e, "Pacing state unavailable, not waiting");
                Duration::zero()
            }
        };

        if let Ok(wait) = wait.to_std()
            && !wait.is_zero()
        {
            tracing::debug!(job_id = %job.id, wait_ms = wait.as_millis() as u64, "Waiting for send slot");
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adaptive_floor_clamps() {
        let floor = WorkerConfig::default().send_floor(Channel::Whatsapp);
        assert_eq!(floor.floor(0), Duration::seconds(10));
        assert_eq!(floor.floor(40_000), Duration::seconds(20));
        assert_eq!(floor.floor(600_000), Duration::seconds(30));
    }

    #[test]
    fn test_channel_floors_and_concurrency() {
        let config = WorkerConfig::default();
        assert_eq!(config.send_floor(Channel::Sms).floor(90_000), Duration::seconds(1));
        assert_eq!(config.send_floor(Channel::Email).floor(90_000), Duration::zero());
        assert_eq!(config.concurrency(Channel::Whatsapp), 1);
        assert_eq!(config.concurrency(Channel::Sms), 1);
        assert_eq!(config.concurrency(Channel::Email), 4);
    }
}
