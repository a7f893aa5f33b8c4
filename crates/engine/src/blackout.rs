//! Blackout policy: daily hour ranges during which nothing is dispatched.
//!
//! Hours are evaluated in an explicit time zone. Rounding forward walks in fixed 15-minute
//! steps, so a blocked instant keeps its minute/second offset (10:47:23 → 11:02:23 → ...).

use chrono::{DateTime, Duration, Timelike, Utc};
use chrono_tz::Tz;
use thiserror::Error;

use herald_common::types::BlackoutWindow;

/// Step used by [`BlackoutPolicy::next_allowed`].
pub const BLACKOUT_STEP_MINUTES: i64 = 15;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BlackoutError {
    #[error("blackout windows cover the whole day; nothing could ever be sent")]
    WholeDayBlocked,
}

#[derive(Debug, Clone)]
pub struct BlackoutPolicy {
    windows: Vec<BlackoutWindow>,
    tz: Tz,
    step: Duration,
}

impl BlackoutPolicy {
    /// Build a policy. At least one hour of the day must stay open, which bounds
    /// [`next_allowed`](Self::next_allowed) to a single day of steps.
    pub fn new(windows: Vec<BlackoutWindow>, tz: Tz) -> Result<Self, BlackoutError> {
        let open_hours = (0..24u32)
            .filter(|hour| !windows.iter().any(|w| w.contains(*hour)))
            .count();
        if open_hours == 0 {
            return Err(BlackoutError::WholeDayBlocked);
        }

        Ok(Self {
            windows,
            tz,
            step: Duration::minutes(BLACKOUT_STEP_MINUTES),
        })
    }

    /// A policy that never blocks.
    pub fn unrestricted(tz: Tz) -> Self {
        Self {
            windows: Vec::new(),
            tz,
            step: Duration::minutes(BLACKOUT_STEP_MINUTES),
        }
    }

    pub fn windows(&self) -> &[BlackoutWindow] {
        &self.windows
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    /// Whether the local hour of `instant` falls inside any window.
    pub fn is_blocked(&self, instant: DateTime<Utc>) -> bool {
        let hour = instant.with_timezone(&self.tz).hour();
        self.windows.iter().any(|w| w.contains(hour))
    }

    /// First instant at or after `instant`, reachable in whole steps, that is not blocked.
    pub fn next_allowed(&self, instant: DateTime<Utc>) -> DateTime<Utc> {
        let mut candidate = instant;
        while self.is_blocked(candidate) {
            candidate += self.step;
        }
        if candidate != instant {
            tracing::trace!(
                from = %instant,
                to = %candidate,
                "Instant moved out of blackout window"
            );
        }
        candidate
    }
}
