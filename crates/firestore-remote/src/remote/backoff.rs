//! Reconnection delay policy for streams.

use core::time::Duration;
use rand::Rng;

/// Decides how long a stream waits before reconnecting after an error.
pub trait BackoffPolicy: Send + 'static {
    /// The delay before the next attempt. Advances the policy.
    fn next_delay(&mut self) -> Duration;

    /// Called after a successful exchange; the next delay starts over.
    fn reset(&mut self);

    /// Called when the server reports it is overloaded; the next delay is
    /// the maximum.
    fn reset_to_max(&mut self);
}

/// Exponential growth with random jitter.
///
/// The first delay after a reset is zero. After that the base delay starts at
/// `initial` and is multiplied by `factor` on every attempt, capped at `max`.
/// Each returned delay is the base shifted by up to `jitter` times the base
/// in either direction.
///
/// A `factor` below one or not finite is treated as one, and `max` never
/// exceeds [`ExponentialBackoff::MAX_DELAY`].
#[derive(Clone, Debug)]
pub struct ExponentialBackoff {
    initial: Duration,
    factor: f64,
    max: Duration,
    jitter: f64,
    current_base: Duration,
}

impl ExponentialBackoff {
    pub const DEFAULT_INITIAL: Duration = Duration::from_secs(1);
    pub const DEFAULT_FACTOR: f64 = 1.5;
    pub const DEFAULT_MAX: Duration = Duration::from_secs(60);
    pub const DEFAULT_JITTER: f64 = 0.5;
    pub const MAX_DELAY: Duration = Duration::from_secs(60 * 60);

    pub fn new(initial: Duration, factor: f64, max: Duration) -> Self {
        let factor = if factor.is_finite() && factor >= 1.0 {
            factor
        } else {
            1.0
        };
        let max = max.min(Self::MAX_DELAY);
        Self {
            initial: initial.min(max),
            factor,
            max,
            jitter: Self::DEFAULT_JITTER,
            current_base: Duration::ZERO,
        }
    }

    /// Sets the jitter factor, clamped to `[0.0, 1.0]`. NaN disables jitter.
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = if jitter.is_nan() {
            0.0
        } else {
            jitter.clamp(0.0, 1.0)
        };
        self
    }

    /// The base the next delay is derived from.
    pub fn current_base(&self) -> Duration {
        self.current_base
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(
            Self::DEFAULT_INITIAL,
            Self::DEFAULT_FACTOR,
            Self::DEFAULT_MAX,
        )
    }
}

impl BackoffPolicy for ExponentialBackoff {
    fn next_delay(&mut self) -> Duration {
        let delay = apply_jitter(self.current_base, self.jitter);

        // Computed in floating point so a large factor saturates at `max`.
        let next = (self.current_base.as_secs_f64() * self.factor).min(self.max.as_secs_f64());
        self.current_base = Duration::from_secs_f64(next).max(self.initial);

        delay
    }

    fn reset(&mut self) {
        self.current_base = Duration::ZERO;
    }

    fn reset_to_max(&mut self) {
        self.current_base = self.max;
    }
}

fn apply_jitter(base: Duration, factor: f64) -> Duration {
    if factor == 0.0 || base.is_zero() {
        return base;
    }

    let base = base.as_secs_f64();
    let jittered = rand::rng().random_range(base * (1.0 - factor)..=base * (1.0 + factor));
    Duration::from_secs_f64(jittered.max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff() -> ExponentialBackoff {
        ExponentialBackoff::new(Duration::from_millis(100), 2.0, Duration::from_millis(500))
            .with_jitter(0.0)
    }

    #[test]
    fn first_delay_is_zero_then_grows_to_the_cap() {
        let mut backoff = backoff();
        let delays: Vec<_> = (0..6).map(|_| backoff.next_delay()).collect();
        assert_eq!(
            delays,
            [0, 100, 200, 400, 500, 500].map(Duration::from_millis)
        );
    }

    #[test]
    fn reset_starts_over() {
        let mut backoff = backoff();
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::ZERO);
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn reset_to_max_jumps_to_the_cap() {
        let mut backoff = backoff();
        backoff.reset_to_max();
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
    }

    #[test]
    fn unusable_factors_do_not_grow_the_delay() {
        for factor in [f64::NAN, -2.0, 0.5, f64::NEG_INFINITY] {
            let mut backoff =
                ExponentialBackoff::new(Duration::from_millis(100), factor, Duration::from_secs(1))
                    .with_jitter(0.0);
            backoff.next_delay();
            for _ in 0..50 {
                assert_eq!(backoff.next_delay(), Duration::from_millis(100));
            }
        }
    }

    #[test]
    fn large_factor_saturates_at_max() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_millis(100), f64::MAX, Duration::from_secs(2))
                .with_jitter(0.0);
        backoff.next_delay();
        backoff.next_delay();
        for _ in 0..10 {
            assert_eq!(backoff.next_delay(), Duration::from_secs(2));
        }
    }

    #[test]
    fn max_is_capped() {
        let mut backoff = ExponentialBackoff::new(Duration::MAX, 2.0, Duration::MAX)
            .with_jitter(f64::NAN);
        backoff.reset_to_max();
        assert_eq!(backoff.next_delay(), ExponentialBackoff::MAX_DELAY);
        for _ in 0..10 {
            assert!(backoff.next_delay() <= ExponentialBackoff::MAX_DELAY);
        }

        let mut backoff = ExponentialBackoff::new(Duration::MAX, 2.0, Duration::MAX);
        backoff.reset_to_max();
        for _ in 0..100 {
            assert!(backoff.next_delay() <= ExponentialBackoff::MAX_DELAY * 2);
        }
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_secs(1), 1.5, Duration::from_secs(60));
        backoff.next_delay();
        for _ in 0..100 {
            let base = backoff.current_base().as_secs_f64();
            let delay = backoff.next_delay().as_secs_f64();
            assert!(delay >= base * 0.5 - 1e-6 && delay <= base * 1.5 + 1e-6);
        }
    }
}
