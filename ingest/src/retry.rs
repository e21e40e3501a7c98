use std::time;

use rand::Rng;

/// Backoff policy for retrying transient stage failures in the coordinator.
#[derive(Copy, Clone, Debug)]
pub struct RetryPolicy {
    /// Coefficient to multiply initial_interval with for every past attempt.
    backoff_coefficient: u32,
    /// The backoff interval for the first retry.
    initial_interval: time::Duration,
    /// The maximum possible backoff between retries.
    maximum_interval: time::Duration,
}

impl RetryPolicy {
    pub fn new(
        backoff_coefficient: u32,
        initial_interval: time::Duration,
        maximum_interval: time::Duration,
    ) -> Self {
        Self {
            backoff_coefficient,
            initial_interval,
            maximum_interval,
        }
    }

    /// Time to wait before retry number `attempt` (1-based), with a little
    /// jitter so concurrent batches don't hammer the source in lockstep.
    pub fn time_until_next_retry(&self, attempt: u32) -> time::Duration {
        let candidate = self
            .initial_interval
            .saturating_mul(self.backoff_coefficient.saturating_pow(attempt.saturating_sub(1)));
        let capped = std::cmp::min(candidate, self.maximum_interval);

        let jitter = rand::thread_rng().gen_range(0..=capped.as_millis().max(1) / 10);
        capped + time::Duration::from_millis(jitter as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff_coefficient: 2,
            initial_interval: time::Duration::from_secs(1),
            maximum_interval: time::Duration::from_secs(60),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::RetryPolicy;

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy::new(
            2,
            Duration::from_millis(100),
            Duration::from_millis(500),
        );

        let first = policy.time_until_next_retry(1);
        assert!(first >= Duration::from_millis(100));
        assert!(first < Duration::from_millis(200));

        let second = policy.time_until_next_retry(2);
        assert!(second >= Duration::from_millis(200));

        // Attempt 10 would be 51_200ms uncapped
        let late = policy.time_until_next_retry(10);
        assert!(late <= Duration::from_millis(550 + 50));
    }
}
