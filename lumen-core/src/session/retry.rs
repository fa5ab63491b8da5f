//! Communication retry per the Server object's retry resources.

use std::time::{Duration, Instant};
use tracing::debug;

/// `{retry_count, retry_timer, seq_retry_count, seq_delay}` from the
/// Server object (LwM2M defaults).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommRetryParams {
    /// Registration attempts per sequence.
    pub retry_count: u32,
    /// Delay between attempts within a sequence.
    pub retry_timer: Duration,
    /// How many sequences run in total.
    pub seq_retry_count: u32,
    /// Delay before a new sequence starts.
    pub seq_delay: Duration,
}

impl Default for CommRetryParams {
    fn default() -> Self {
        CommRetryParams {
            retry_count: 5,
            retry_timer: Duration::from_secs(60),
            seq_retry_count: 1,
            seq_delay: Duration::from_secs(24 * 60 * 60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAt(Instant),
    /// All sequences exhausted; the session parks in `Failure`.
    GiveUp,
}

/// Counts failed registration attempts across sequences.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryTracker {
    attempt: u32,
    sequence: u32,
}

impl RetryTracker {
    pub fn new() -> RetryTracker {
        RetryTracker::default()
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
        self.sequence = 0;
    }

    pub fn on_failure(&mut self, params: &CommRetryParams, now: Instant) -> RetryDecision {
        self.attempt += 1;
        if self.attempt < params.retry_count {
            debug!(
                attempt = self.attempt,
                sequence = self.sequence,
                "registration retry scheduled"
            );
            return RetryDecision::RetryAt(now + params.retry_timer);
        }
        self.attempt = 0;
        self.sequence += 1;
        if self.sequence < params.seq_retry_count {
            debug!(sequence = self.sequence, "registration retry sequence scheduled");
            RetryDecision::RetryAt(now + params.seq_delay)
        } else {
            RetryDecision::GiveUp
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhausts_after_configured_attempts() {
        let params = CommRetryParams {
            retry_count: 3,
            retry_timer: Duration::from_secs(10),
            seq_retry_count: 2,
            seq_delay: Duration::from_secs(100),
        };
        let mut tracker = RetryTracker::new();
        let now = Instant::now();

        // First sequence: two quick retries, then the sequence delay.
        assert_eq!(
            tracker.on_failure(&params, now),
            RetryDecision::RetryAt(now + Duration::from_secs(10))
        );
        assert_eq!(
            tracker.on_failure(&params, now),
            RetryDecision::RetryAt(now + Duration::from_secs(10))
        );
        assert_eq!(
            tracker.on_failure(&params, now),
            RetryDecision::RetryAt(now + Duration::from_secs(100))
        );

        // Second sequence exhausts for good.
        assert_eq!(
            tracker.on_failure(&params, now),
            RetryDecision::RetryAt(now + Duration::from_secs(10))
        );
        assert_eq!(
            tracker.on_failure(&params, now),
            RetryDecision::RetryAt(now + Duration::from_secs(10))
        );
        assert_eq!(tracker.on_failure(&params, now), RetryDecision::GiveUp);
    }
}
