//! Retry delays.

use crate::config::RetryPolicy;
use std::time::Duration;

/// Delay sequence for the retries of one batch.
///
/// Delay `n` is `initial_delay * multiplier^(n-1)`, stretched by a random
/// factor in `[1, 1 + jitter]` and capped at `max_delay`. Each delay is then
/// raised above the previous one, so the sequence strictly increases even
/// once the cap is reached.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    previous: Option<Duration>,
}

impl Backoff {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            previous: None,
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn next_delay(&mut self, attempt: u32) -> Duration {
        let jitter = self.policy.jitter.max(0.0) * rand::random::<f64>();
        let delay = self.delay_with_jitter(attempt, jitter);
        self.previous = Some(delay);
        delay
    }

    fn delay_with_jitter(&self, attempt: u32, jitter: f64) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base = self.policy.initial_delay().as_secs_f64() * self.policy.multiplier.powi(exponent);
        let capped = (base * (1.0 + jitter)).min(self.policy.max_delay().as_secs_f64());
        let delay = Duration::from_secs_f64(capped.max(0.0));

        match self.previous {
            Some(previous) if delay <= previous => previous + Duration::from_millis(1),
            _ => delay,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_growth() {
        let policy = RetryPolicy::new()
            .with_initial_delay(Duration::from_millis(100))
            .with_jitter(0.0);
        let mut backoff = Backoff::new(policy);

        assert_eq!(backoff.next_delay(1), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(2), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(3), Duration::from_millis(400));
    }

    #[test]
    fn test_strictly_increasing_past_the_cap() {
        let policy = RetryPolicy::new()
            .with_initial_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(250))
            .with_jitter(0.5);
        let mut backoff = Backoff::new(policy);

        let delays: Vec<Duration> = (1..=6).map(|n| backoff.next_delay(n)).collect();
        assert!(delays.windows(2).all(|pair| pair[0] < pair[1]), "{delays:?}");
        assert!(delays[0] >= Duration::from_millis(100));
        assert!(delays[0] <= Duration::from_millis(150));
    }

    #[test]
    fn test_flat_multiplier_still_increases() {
        let policy = RetryPolicy::new()
            .with_initial_delay(Duration::from_millis(10))
            .with_multiplier(1.0)
            .with_jitter(0.0);
        let mut backoff = Backoff::new(policy);

        let first = backoff.next_delay(1);
        let second = backoff.next_delay(2);
        assert_eq!(first, Duration::from_millis(10));
        assert_eq!(second, Duration::from_millis(11));
    }
}
