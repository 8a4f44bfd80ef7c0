use std::time::Duration;

use rand::{Rng, SeedableRng, rngs::SmallRng};

use super::types::ReconnectStrategy;

/// Exponential backoff with bounded upward jitter.
///
/// Jitter only ever stretches a delay by less than the growth factor. Growth stops at
/// `max / (1 + jitter)` so a capped delay still lands somewhere in `[max / (1 + jitter), max)`
/// instead of every client retrying on the same `max` boundary. Successive delays never
/// decrease and never exceed `max`. `reset` returns to `base`; the supervisor calls it on every
/// transition into Ready.
#[derive(Clone, Debug)]
pub struct ExponentialBackoffReconnect {
    base: Duration,
    max: Duration,
    factor: f64,
    jitter: f64,
    current: Duration,
    last: Duration,
    retry: bool,
    rng: SmallRng,
}

impl ExponentialBackoffReconnect {
    pub fn new(base: Duration, max: Duration, factor: f64) -> Self {
        let factor = if factor.is_finite() && factor > 1.0 {
            factor
        } else {
            2.0
        };
        let max = max.max(base);
        Self {
            base,
            max,
            factor,
            jitter: 0.0,
            current: base,
            last: Duration::ZERO,
            retry: true,
            rng: SmallRng::from_entropy(),
        }
    }

    /// Stretch each delay by a random fraction in `[0, ratio)`; clamped below `factor - 1`.
    pub fn with_jitter(mut self, ratio: f64) -> Self {
        let ceiling = (self.factor - 1.0) * 0.99;
        self.jitter = if ratio.is_finite() {
            ratio.clamp(0.0, ceiling)
        } else {
            0.0
        };
        self
    }

    pub fn abort(mut self) -> Self {
        self.retry = false;
        self
    }

    pub fn max_delay(&self) -> Duration {
        self.max
    }
}

impl Default for ExponentialBackoffReconnect {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30), 2.0).with_jitter(0.2)
    }
}

impl ReconnectStrategy for ExponentialBackoffReconnect {
    fn next_delay(&mut self) -> Duration {
        let max = self.max.as_secs_f64();
        let ceiling = max / (1.0 + self.jitter);
        let base = self.current.as_secs_f64().min(ceiling);
        let stretch = if self.jitter > 0.0 {
            self.rng.gen_range(0.0..self.jitter)
        } else {
            0.0
        };
        let delay = Duration::from_secs_f64((base * (1.0 + stretch)).min(max)).max(self.last);
        self.current = Duration::from_secs_f64((base * self.factor).min(ceiling));
        self.last = delay;
        delay
    }

    fn reset(&mut self) {
        self.current = self.base;
        self.last = Duration::ZERO;
    }

    fn should_retry(&self) -> bool {
        self.retry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn five_failures_are_non_decreasing_and_capped() {
        for _ in 0..200 {
            let mut backoff = ExponentialBackoffReconnect::default();
            let delays: Vec<Duration> = (0..5).map(|_| backoff.next_delay()).collect();
            for pair in delays.windows(2) {
                assert!(pair[0] <= pair[1], "delays decreased: {delays:?}");
            }
            assert!(delays.iter().all(|d| *d <= Duration::from_secs(30)));
            assert!(delays[0] >= Duration::from_secs(1));
        }
    }

    #[test]
    fn long_failure_streak_stays_at_cap() {
        let mut backoff = ExponentialBackoffReconnect::default();
        let delays: Vec<Duration> = (0..20).map(|_| backoff.next_delay()).collect();
        let last = *delays.last().unwrap();
        assert!(last >= Duration::from_secs(25) && last <= Duration::from_secs(30));
        for pair in delays.windows(2) {
            assert!(pair[0] <= pair[1]);
        }
    }

    #[test]
    fn capped_delays_keep_their_jitter() {
        let first_capped: Vec<Duration> = (0..50)
            .map(|_| {
                let mut backoff = ExponentialBackoffReconnect::default();
                let delays: Vec<Duration> = (0..12).map(|_| backoff.next_delay()).collect();
                for pair in delays.windows(2) {
                    assert!(pair[0] <= pair[1], "delays decreased: {delays:?}");
                }
                assert!(delays.iter().all(|d| *d <= Duration::from_secs(30)));
                // 1, 2, 4, 8, 16 then capped at 25 before jitter.
                delays[5]
            })
            .collect();
        assert!(first_capped.iter().all(|d| *d >= Duration::from_secs(25)));
        assert!(
            first_capped.iter().any(|d| *d < Duration::from_secs(30)),
            "capped delays all collapsed onto the maximum"
        );
        assert!(first_capped.windows(2).any(|pair| pair[0] != pair[1]));
    }

    #[test]
    fn without_jitter_the_cap_is_exact() {
        let mut backoff =
            ExponentialBackoffReconnect::new(Duration::from_secs(1), Duration::from_secs(5), 2.0);
        let delays: Vec<u64> = (0..5).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 5, 5]);
    }

    #[test]
    fn reset_returns_to_base() {
        let mut backoff =
            ExponentialBackoffReconnect::new(Duration::from_secs(1), Duration::from_secs(30), 2.0);
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(), Duration::from_secs(4));
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn invalid_factor_and_jitter_are_sanitised() {
        let mut backoff = ExponentialBackoffReconnect::new(
            Duration::from_millis(100),
            Duration::from_millis(50),
            f64::NAN,
        )
        .with_jitter(5.0);
        assert_eq!(backoff.max_delay(), Duration::from_millis(100));
        assert!(backoff.next_delay() <= Duration::from_millis(100));
        assert!(!backoff.clone().abort().should_retry());
    }
}
