//! Delay between failover attempts.

use std::time::Duration;

use rand::Rng;

use crate::config::schema::RetryConfig;

/// Exponential delay doubling from `base` up to `max`, plus up to 10% jitter
/// so that requests failing over together do not reconnect in lockstep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max: max.max(base) }
    }

    /// Delay before failover attempt `attempt`; attempt 0 is the first try.
    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        let delay = self.base.saturating_mul(factor).min(self.max);

        let spread = delay.as_millis() as u64 / 10;
        if spread == 0 {
            return delay;
        }
        delay + Duration::from_millis(rand::thread_rng().gen_range(0..spread))
    }
}

impl From<&RetryConfig> for Backoff {
    fn from(config: &RetryConfig) -> Self {
        Self::new(
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_delay_doubles_until_capped() {
        let backoff = Backoff::new(ms(100), ms(1000));
        assert_eq!(backoff.delay(0), Duration::ZERO);

        let first = backoff.delay(1);
        assert!(first >= ms(100) && first < ms(110));
        let second = backoff.delay(2);
        assert!(second >= ms(200) && second < ms(220));

        let capped = backoff.delay(10);
        assert!(capped >= ms(1000) && capped < ms(1100));
    }

    #[test]
    fn test_huge_attempt_saturates() {
        let d = Backoff::new(ms(50), ms(400)).delay(80);
        assert!(d >= ms(400) && d < ms(440));
    }

    #[test]
    fn test_from_config() {
        let config = RetryConfig {
            base_delay_ms: 20,
            max_delay_ms: 5,
            ..RetryConfig::default()
        };
        let backoff = Backoff::from(&config);
        assert!(backoff.delay(1) >= ms(20));
        assert_eq!(backoff.delay(0), Duration::ZERO);
    }
}
