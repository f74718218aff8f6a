use std::time::Duration;

use time::OffsetDateTime;

/// Queue-level retry limits for the video-processing lane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Fixed delay before a failed attempt is redelivered.
    pub delay: Duration,
    /// Measured from the first dispatch. No attempt starts after this.
    pub retry_until: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay: Duration::from_secs(30),
            retry_until: Duration::from_secs(4 * 60 * 60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp,
}

impl RetryPolicy {
    /// Whether the retry window for a job first dispatched at
    /// `first_dispatched_at` has closed.
    pub fn expired(&self, first_dispatched_at: OffsetDateTime, now: OffsetDateTime) -> bool {
        now - first_dispatched_at >= self.retry_until
    }

    /// Decide what happens after attempt number `attempt` (1-based) failed.
    pub fn decide(
        &self,
        attempt: u32,
        first_dispatched_at: OffsetDateTime,
        now: OffsetDateTime,
    ) -> RetryDecision {
        if attempt >= self.max_attempts {
            return RetryDecision::GiveUp;
        }
        // The redelivery itself would land after the deadline.
        if self.expired(first_dispatched_at, now + self.delay) {
            return RetryDecision::GiveUp;
        }
        RetryDecision::RetryAfter(self.delay)
    }
}
