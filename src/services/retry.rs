use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::services::generator::ErrorClass;

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again once the clock reaches this instant.
    RetryAt(DateTime<Utc>),
    /// Record a terminal failure.
    GiveUp,
}

/// Retry bookkeeping for one item. Driven explicitly by the worker loop
/// instead of rescheduling itself.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryState {
    pub attempts: u32,
    pub next_eligible_at: Option<DateTime<Utc>>,
}

impl RetryState {
    /// Counts a new attempt and returns its 1-based number.
    pub fn begin_attempt(&mut self) -> u32 {
        self.attempts += 1;
        self.next_eligible_at = None;
        self.attempts
    }

    /// Time left before the next attempt may start.
    pub fn wait_from(&self, now: DateTime<Utc>) -> Duration {
        self.next_eligible_at
            .and_then(|at| (at - now).to_std().ok())
            .unwrap_or_default()
    }
}

/// Exponential backoff: `base`, `2 * base`, `4 * base`, ... capped at `max_delay`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(2, Duration::from_secs(1), Duration::from_secs(30))
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
        }
    }

    /// Upper bound on attempts for a single item.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    /// Delay after the given failed attempt (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Updates `state` after a failed attempt and decides whether to go again.
    /// A provider-supplied `retry_after` stretches the delay, never shortens it.
    pub fn on_failure(
        &self,
        state: &mut RetryState,
        class: ErrorClass,
        retry_after: Option<Duration>,
        now: DateTime<Utc>,
    ) -> RetryDecision {
        if class == ErrorClass::Permanent || state.attempts >= self.max_attempts() {
            state.next_eligible_at = None;
            return RetryDecision::GiveUp;
        }

        let delay = retry_after
            .map_or(self.backoff(state.attempts), |hint| {
                hint.max(self.backoff(state.attempts))
            })
            .min(self.max_delay);
        let at = now + chrono::Duration::milliseconds(delay.as_millis() as i64);
        state.next_eligible_at = Some(at);
        RetryDecision::RetryAt(at)
    }
}
