//! Batch scheduler: assigns every accepted message a dispatch instant and hands it to the
//! channel's delayed queue.
//!
//! Messages are grouped by requested send time (first appearance order). Each group starts at a
//! base instant, never earlier than the customer's pacing cursor, and spaces its items with a
//! randomized delay plus a fixed minimum gap. No instant ever lands inside a blackout window.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use uuid::Uuid;

use herald_common::clock::Clock;
use herald_common::config::AppConfig;
use herald_common::types::{Channel, DispatchJob, JobStatus, MessageInput, MessageRequest, QueuedJob};

use crate::blackout::BlackoutPolicy;
use crate::error::ScheduleError;
use crate::pacing::PacingCoordinator;
use crate::queue::DelayedQueue;
use crate::settings::ProviderSettingsRepository;
use crate::store::JobStore;
use crate::validation;

/// Inclusive millisecond range a random delay is drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayRange {
    pub min_ms: u64,
    pub max_ms: u64,
}

impl DelayRange {
    /// Bounds given in the wrong order are swapped.
    pub fn new(min_ms: u64, max_ms: u64) -> Self {
        Self {
            min_ms: min_ms.min(max_ms),
            max_ms: min_ms.max(max_ms),
        }
    }

    pub fn fixed(ms: u64) -> Self {
        Self::new(ms, ms)
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        let ms = if self.max_ms > self.min_ms {
            rng.gen_range(self.min_ms..=self.max_ms)
        } else {
            self.min_ms
        };
        Duration::milliseconds(ms as i64)
    }
}

/// Every tunable of the scheduling algorithm.
#[derive(Debug, Clone)]
pub struct SchedulingPolicy {
    /// Zone requested send times are written in.
    pub request_tz: Tz,
    pub max_batch_size: usize,
    /// Spacing added before each item of a group.
    pub message_delay: DelayRange,
    /// Replaces a requested send time that has already passed.
    pub past_due_delay: DelayRange,
    /// Added after leaving a blackout window so jobs do not pile up on the boundary.
    pub boundary_jitter: DelayRange,
    pub min_gap: Duration,
    /// Stored on top of a group's final cursor.
    pub group_cushion: Duration,
}

impl SchedulingPolicy {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            request_tz: config.timezone,
            max_batch_size: config.max_batch_size,
            message_delay: DelayRange::new(config.message_delay_min_ms, config.message_delay_max_ms),
            past_due_delay: DelayRange::new(
                config.past_due_delay_min_ms,
                config.past_due_delay_max_ms,
            ),
            boundary_jitter: DelayRange::new(0, config.boundary_jitter_max_ms),
            min_gap: Duration::milliseconds(config.min_gap_ms as i64),
            group_cushion: Duration::milliseconds(config.group_cushion_ms as i64),
        }
    }
}

impl Default for SchedulingPolicy {
    fn default() -> Self {
        Self {
            request_tz: chrono_tz::America::Sao_Paulo,
            max_batch_size: 500,
            message_delay: DelayRange::new(1_000, 5_000),
            past_due_delay: DelayRange::new(15_000, 90_000),
            boundary_jitter: DelayRange::new(0, 60_000),
            min_gap: Duration::milliseconds(1_000),
            group_cushion: Duration::milliseconds(10_000),
        }
    }
}

/// Instants assigned to one group, in input order, and the cursor left after the last one.
#[derive(Debug, Clone)]
pub struct GroupPlan {
    pub instants: Vec<DateTime<Utc>>,
    pub cursor: DateTime<Utc>,
}

/// Pure part of the algorithm; all randomness comes from the caller's RNG.
pub struct Planner<'a> {
    policy: &'a SchedulingPolicy,
    blackout: &'a BlackoutPolicy,
}

impl<'a> Planner<'a> {
    pub fn new(policy: &'a SchedulingPolicy, blackout: &'a BlackoutPolicy) -> Self {
        Self { policy, blackout }
    }

    /// Starting instant of a group. Elapsed requests are pushed a short random delay past `now`.
    pub fn base_instant<R: Rng + ?Sized>(
        &self,
        requested: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        rng: &mut R,
    ) -> DateTime<Utc> {
        let base = match requested {
            Some(at) if at >= now => at,
            Some(_) => now + self.policy.past_due_delay.sample(rng),
            None => now,
        };
        self.blackout.next_allowed(base)
    }

    /// Assign `count` instants starting from `max(base, earliest)`.
    pub fn plan_group<R: Rng + ?Sized>(
        &self,
        base: DateTime<Utc>,
        earliest: DateTime<Utc>,
        count: usize,
        now: DateTime<Utc>,
        rng: &mut R,
    ) -> GroupPlan {
        let mut cursor = base.max(earliest);
        let mut instants = Vec::with_capacity(count);

        for _ in 0..count {
            let mut at = cursor + self.policy.message_delay.sample(rng);
            if self.blackout.is_blocked(at) {
                at = self.leave_blackout(at, rng);
            }
            let at = at.max(now);
            instants.push(at);
            cursor = at + self.policy.min_gap;
        }

        GroupPlan { instants, cursor }
    }

    fn leave_blackout<R: Rng + ?Sized>(&self, at: DateTime<Utc>, rng: &mut R) -> DateTime<Utc> {
        let allowed = self.blackout.next_allowed(at);
        let jittered = allowed + self.policy.boundary_jitter.sample(rng);
        if self.blackout.is_blocked(jittered) {
            allowed
        } else {
            jittered
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScheduledJob {
    /// Position of the item in the submitted batch.
    pub index: usize,
    pub job_id: Uuid,
    pub channel: Channel,
    pub status: JobStatus,
    pub scheduled_at: DateTime<Utc>,
    pub delay_ms: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ItemFailure {
    pub index: usize,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchOutcome {
    pub total: usize,
    pub scheduled: Vec<ScheduledJob>,
    pub failures: Vec<ItemFailure>,
}

pub struct BatchScheduler {
    policy: SchedulingPolicy,
    blackout: BlackoutPolicy,
    pacing: Arc<PacingCoordinator>,
    jobs: Arc<dyn JobStore>,
    queue: Arc<dyn DelayedQueue>,
    settings: Arc<dyn ProviderSettingsRepository>,
    clock: Arc<dyn Clock>,
}

impl BatchScheduler {
    pub fn new(
        policy: SchedulingPolicy,
        blackout: BlackoutPolicy,
        pacing: Arc<PacingCoordinator>,
        jobs: Arc<dyn JobStore>,
        queue: Arc<dyn DelayedQueue>,
        settings: Arc<dyn ProviderSettingsRepository>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            policy,
            blackout,
            pacing,
            jobs,
            queue,
            settings,
            clock,
        }
    }

    pub fn policy(&self) -> &SchedulingPolicy {
        &self.policy
    }

    /// Validate and schedule a batch.
    ///
    /// Malformed items become per-item failures. An empty or oversized batch, or a channel
    /// without provider settings, rejects the whole batch before anything is created.
    pub async fn schedule_batch(
        &self,
        customer_id: Uuid,
        inputs: Vec<MessageInput>,
    ) -> Result<BatchOutcome, ScheduleError> {
        if inputs.is_empty() {
            return Err(ScheduleError::EmptyBatch);
        }
        if inputs.len() > self.policy.max_batch_size {
            return Err(ScheduleError::BatchTooLarge {
                size: inputs.len(),
                max: self.policy.max_batch_size,
            });
        }

        let total = inputs.len();
        let mut accepted = Vec::with_capacity(total);
        let mut failures = Vec::new();
        for (index, input) in inputs.iter().enumerate() {
            match validation::validate(input, self.policy.request_tz) {
                Ok(request) => accepted.push((index, request)),
                Err(e) => failures.push(ItemFailure {
                    index,
                    error: e.to_string(),
                }),
            }
        }

        let mut outcome = self.schedule_accepted(customer_id, accepted).await?;
        outcome.total = total;
        outcome.failures.extend(failures);
        outcome.failures.sort_by_key(|f| f.index);

        tracing::info!(
            customer_id = %customer_id,
            total = outcome.total,
            scheduled = outcome.scheduled.len(),
            failed = outcome.failures.len(),
            "Batch scheduled"
        );

        Ok(outcome)
    }

    /// Schedule one message. Validation and storage failures are returned as errors.
    pub async fn schedule_single(
        &self,
        customer_id: Uuid,
        input: MessageInput,
    ) -> Result<ScheduledJob, ScheduleError> {
        let request = validation::validate(&input, self.policy.request_tz)?;
        let mut outcome = self
            .schedule_accepted(customer_id, vec![(0, request)])
            .await?;

        if let Some(failure) = outcome.failures.pop() {
            return Err(ScheduleError::Internal(anyhow::anyhow!(failure.error)));
        }
        outcome
            .scheduled
            .pop()
            .ok_or_else(|| ScheduleError::Internal(anyhow::anyhow!("message was not scheduled")))
    }

    async fn schedule_accepted(
        &self,
        customer_id: Uuid,
        accepted: Vec<(usize, MessageRequest)>,
    ) -> Result<BatchOutcome, ScheduleError> {
        self.ensure_providers(customer_id, &accepted).await?;

        let mut rng = StdRng::from_entropy();
        let planner = Planner::new(&self.policy, &self.blackout);
        let mut outcome = BatchOutcome {
            total: accepted.len(),
            scheduled: Vec::with_capacity(accepted.len()),
            failures: Vec::new(),
        };

        // Read once: after the first group jobs exist, so nothing below may fail the request.
        let mut earliest = self.pacing.earliest_available(customer_id).await?;

        for (requested, items) in group_by_send_at(accepted) {
            let now = self.clock.now();
            let base = planner.base_instant(requested, now, &mut rng);
            let plan = planner.plan_group(base, earliest, items.len(), now, &mut rng);

            for ((index, request), dispatch_at) in items.into_iter().zip(plan.instants) {
                let job = DispatchJob::new(customer_id, request, dispatch_at, now);
                match self.persist_and_enqueue(&job).await {
                    Ok(()) => outcome.scheduled.push(ScheduledJob {
                        index,
                        job_id: job.id,
                        channel: job.channel(),
                        status: job.status,
                        scheduled_at: job.dispatch_at,
                        delay_ms: job.delay_ms,
                    }),
                    Err(e) => {
                        tracing::error!(
                            customer_id = %customer_id,
                            job_id = %job.id,
                            error = %e,
                            "Failed to schedule message"
                        );
                        outcome.failures.push(ItemFailure {
                            index,
                            error: format!("failed to schedule message: {}", e),
                        });
                    }
                }
            }

            let next = plan.cursor + self.policy.group_cushion;
            earliest = next + self.pacing.floor_cushion();
            if let Err(e) = self.pacing.set_earliest_available(customer_id, next).await {
                // Jobs of this group already exist; only the cursor is lost.
                tracing::warn!(customer_id = %customer_id, error = %e, "Failed to store pacing cursor");
            }
        }

        Ok(outcome)
    }

    async fn ensure_providers(
        &self,
        customer_id: Uuid,
        accepted: &[(usize, MessageRequest)],
    ) -> Result<(), ScheduleError> {
        let mut checked: Vec<Channel> = Vec::new();
        for (_, request) in accepted {
            if checked.contains(&request.channel) {
                continue;
            }
            if self
                .settings
                .find(customer_id, request.channel)
                .await?
                .is_none()
            {
                return Err(ScheduleError::MissingProviderConfig {
                    channel: request.channel,
                });
            }
            checked.push(request.channel);
        }
        Ok(())
    }

    async fn persist_and_enqueue(&self, job: &DispatchJob) -> anyhow::Result<()> {
        self.jobs.insert(job).await?;
        self.queue
            .enqueue(
                &QueuedJob::first_attempt(job),
                Duration::milliseconds(job.delay_ms),
            )
            .await?;

        tracing::debug!(
            job_id = %job.id,
            channel = %job.channel(),
            dispatch_at = %job.dispatch_at,
            delay_ms = job.delay_ms,
            "Message scheduled"
        );
        Ok(())
    }
}

type Group = (Option<DateTime<Utc>>, Vec<(usize, MessageRequest)>);

/// Group by requested send time, keeping groups in order of first appearance.
fn group_by_send_at(accepted: Vec<(usize, MessageRequest)>) -> Vec<Group> {
    let mut groups: Vec<Group> = Vec::new();
    let mut positions: HashMap<Option<DateTime<Utc>>, usize> = HashMap::new();

    for (index, request) in accepted {
        let key = request.send_at;
        let position = *positions.entry(key).or_insert_with(|| {
            groups.push((key, Vec::new()));
            groups.len() - 1
        });
        groups[position].1.push((index, request));
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use chrono_tz::UTC;
    use herald_common::types::{BlackoutWindow, MessageContent, Recipient};

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 17, h, m, s).unwrap()
    }

    fn noon_blackout() -> BlackoutPolicy {
        BlackoutPolicy::new(vec![BlackoutWindow::new(12, 14).unwrap()], UTC).unwrap()
    }

    fn request(send_at: Option<DateTime<Utc>>) -> MessageRequest {
        MessageRequest {
            channel: Channel::Sms,
            recipient: Recipient::Phone {
                country: "+55".to_string(),
                area_code: "86".to_string(),
                number: "994873708".to_string(),
            },
            content: MessageContent {
                body: "hi".to_string(),
                subject: None,
                header_title: None,
                footer: None,
            },
            send_at,
            media: None,
        }
    }

    #[test]
    fn test_delay_range_bounds() {
        let mut rng = StdRng::seed_from_u64(1);
        let range = DelayRange::new(5_000, 1_000);
        assert_eq!(range, DelayRange::new(1_000, 5_000));
        for _ in 0..500 {
            let d = range.sample(&mut rng);
            assert!(d >= Duration::seconds(1) && d <= Duration::seconds(5));
        }
        assert_eq!(DelayRange::fixed(250).sample(&mut rng), Duration::milliseconds(250));
    }

    #[test]
    fn test_base_instant_future_request_kept() {
        let policy = SchedulingPolicy::default();
        let blackout = BlackoutPolicy::unrestricted(UTC);
        let planner = Planner::new(&policy, &blackout);
        let mut rng = StdRng::seed_from_u64(2);

        assert_eq!(planner.base_instant(Some(at(9, 30, 0)), at(9, 0, 0), &mut rng), at(9, 30, 0));
        assert_eq!(planner.base_instant(None, at(9, 0, 0), &mut rng), at(9, 0, 0));
    }

    #[test]
    fn test_base_instant_past_due_gets_short_delay() {
        let policy = SchedulingPolicy::default();
        let blackout = BlackoutPolicy::unrestricted(UTC);
        let planner = Planner::new(&policy, &blackout);
        let mut rng = StdRng::seed_from_u64(3);
        let now = at(9, 0, 0);

        for _ in 0..100 {
            let base = planner.base_instant(Some(at(8, 0, 0)), now, &mut rng);
            assert!(base >= now + Duration::seconds(15));
            assert!(base <= now + Duration::seconds(90));
        }
    }

    #[test]
    fn test_base_instant_leaves_blackout_in_steps() {
        let policy = SchedulingPolicy::default();
        let blackout = noon_blackout();
        let planner = Planner::new(&policy, &blackout);
        let mut rng = StdRng::seed_from_u64(4);

        let base = planner.base_instant(Some(at(13, 47, 23)), at(9, 0, 0), &mut rng);
        assert_eq!(base, at(14, 2, 23));
    }

    #[test]
    fn test_plan_group_spacing_and_blackout() {
        let policy = SchedulingPolicy {
            message_delay: DelayRange::new(1_000, 90_000),
            ..SchedulingPolicy::default()
        };
        let blackout = noon_blackout();
        let planner = Planner::new(&policy, &blackout);
        let mut rng = StdRng::seed_from_u64(5);
        let now = at(11, 50, 0);

        let plan = planner.plan_group(now, now, 50, now, &mut rng);
        assert_eq!(plan.instants.len(), 50);
        for pair in plan.instants.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::seconds(1));
        }
        assert!(plan.instants.iter().all(|t| !blackout.is_blocked(*t) && *t >= now));
        assert_eq!(plan.cursor, *plan.instants.last().unwrap() + Duration::seconds(1));
    }

    #[test]
    fn test_plan_group_starts_after_pacing_cursor() {
        let policy = SchedulingPolicy::default();
        let blackout = BlackoutPolicy::unrestricted(UTC);
        let planner = Planner::new(&policy, &blackout);
        let mut rng = StdRng::seed_from_u64(6);
        let now = at(9, 0, 0);
        let earliest = at(9, 10, 0);

        let plan = planner.plan_group(now, earliest, 3, now, &mut rng);
        assert!(plan.instants.iter().all(|t| *t >= earliest));
    }

    #[test]
    fn test_boundary_jitter_falls_back_when_blocked() {
        // 14:00-14:59 is open, 15:00 onward blocked again; a 2h jitter always lands in it.
        let policy = SchedulingPolicy {
            message_delay: DelayRange::fixed(0),
            boundary_jitter: DelayRange::fixed(2 * 3_600_000),
            ..SchedulingPolicy::default()
        };
        let blackout = BlackoutPolicy::new(
            vec![
                BlackoutWindow::new(12, 14).unwrap(),
                BlackoutWindow::new(15, 24).unwrap(),
            ],
            UTC,
        )
        .unwrap();
        let planner = Planner::new(&policy, &blackout);
        let mut rng = StdRng::seed_from_u64(7);
        let now = at(9, 0, 0);

        let plan = planner.plan_group(at(12, 30, 0), now, 1, now, &mut rng);
        assert_eq!(plan.instants, vec![at(14, 0, 0)]);
    }

    #[test]
    fn test_groups_keep_first_appearance_order() {
        let late = Some(at(18, 0, 0));
        let early = Some(at(10, 0, 0));
        let groups = group_by_send_at(vec![
            (0, request(late)),
            (1, request(None)),
            (2, request(early)),
            (3, request(late)),
        ]);

        let keys: Vec<_> = groups.iter().map(|(k, _)| *k).collect();
        assert_eq!(keys, vec![late, None, early]);
        let first: Vec<_> = groups[0].1.iter().map(|(i, _)| *i).collect();
        assert_eq!(first, vec![0, 3]);
    }
}
