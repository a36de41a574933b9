//! Retry policy: decides backoff delays for failed tasks.

use std::time::Duration;

use rand::Rng;

/// Capped exponential backoff with optional jitter.
///
/// The delay before a retried task becomes eligible again is
/// `base_delay * multiplier^(retries - 1)`, clamped to `max_delay`.
/// With jitter enabled the result is scaled by a random factor in
/// [0.75, 1.25] so simultaneous failures do not retry in lockstep.
///
/// A fixed delay is `multiplier = 1.0`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retries` (1-indexed) becomes eligible.
    pub fn next_delay(&self, retries: u32) -> Duration {
        let exponent = retries.saturating_sub(1).min(31) as i32;
        let raw = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = raw.min(self.max_delay.as_secs_f64());

        let secs = if self.jitter {
            capped * rand::thread_rng().gen_range(0.75..=1.25)
        } else {
            capped
        };
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }

    /// Deterministic variant used where reproducible timing matters.
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_then_caps() {
        let policy = RetryPolicy::default().without_jitter();

        let d1 = policy.next_delay(1);
        let d2 = policy.next_delay(2);
        let d3 = policy.next_delay(3);
        assert_eq!(d1, Duration::from_millis(500));
        assert_eq!(d2, Duration::from_secs(1));
        assert_eq!(d3, Duration::from_secs(2));

        // Far beyond the cap the delay stops growing.
        assert_eq!(policy.next_delay(30), Duration::from_secs(30));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy {
            base_delay: Duration::from_secs(4),
            multiplier: 1.0,
            max_delay: Duration::from_secs(60),
            jitter: true,
        };

        for _ in 0..100 {
            let d = policy.next_delay(1);
            assert!(d >= Duration::from_secs(3));
            assert!(d <= Duration::from_secs(5));
        }
    }

    #[test]
    fn fixed_delay_via_unit_multiplier() {
        let policy = RetryPolicy {
            base_delay: Duration::from_secs(2),
            multiplier: 1.0,
            max_delay: Duration::from_secs(60),
            jitter: false,
        };
        assert_eq!(policy.next_delay(1), policy.next_delay(5));
    }
}
