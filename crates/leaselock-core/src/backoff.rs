use std::time::Duration;

use rand::Rng;

/// Capped exponential backoff with equal jitter.
///
/// Delay `n` is half of `min(base * 2^n, max)` plus a uniformly random share
/// of the other half, so competing waiters spread out instead of hitting the
/// store in lockstep.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            attempt: 0,
        }
    }

    /// Upper bound of the next delay, before jitter.
    fn ceiling(&self) -> Duration {
        self.base
            .saturating_mul(1u32 << self.attempt.min(16))
            .min(self.max)
    }

    /// Delay to sleep before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let ceiling = self.ceiling();
        self.attempt = self.attempt.saturating_add(1);

        let half = ceiling / 2;
        let spread = (ceiling - half).as_micros() as u64;
        let jitter = rand::rng().random_range(0..=spread);
        half + Duration::from_micros(jitter)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_grow_and_cap() {
        let base = Duration::from_millis(100);
        let max = Duration::from_millis(800);
        let mut backoff = Backoff::new(base, max);

        let expected_ceilings = [100, 200, 400, 800, 800, 800];
        for ceiling in expected_ceilings {
            let ceiling = Duration::from_millis(ceiling);
            let delay = backoff.next_delay();
            assert!(delay >= ceiling / 2, "{:?} < {:?}", delay, ceiling / 2);
            assert!(delay <= ceiling, "{:?} > {:?}", delay, ceiling);
        }
    }

    #[test]
    fn test_reset() {
        let mut backoff = Backoff::new(Duration::from_millis(10), Duration::from_secs(10));
        for _ in 0..10 {
            backoff.next_delay();
        }
        backoff.reset();
        assert!(backoff.next_delay() <= Duration::from_millis(10));
    }
}
