//! Exponential reconnect backoff.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Reconnect delay schedule: `initial`, then multiplied each attempt up to `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
            multiplier: 2,
        }
    }
}

impl BackoffPolicy {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self { initial, max, ..Self::default() }.normalized()
    }

    /// Clamp nonsensical settings so delays never shrink or exceed the cap.
    pub fn normalized(self) -> Self {
        Self {
            initial: self.initial,
            max: self.max.max(self.initial),
            multiplier: self.multiplier.max(1),
        }
    }

    pub fn start(self) -> Backoff {
        Backoff::new(self)
    }
}

/// Running backoff state for one reconnect episode.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    current: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        let policy = policy.normalized();
        Self { policy, current: policy.initial, attempts: 0 }
    }

    /// Delay to wait before the next attempt. Advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.attempts = self.attempts.saturating_add(1);
        self.current = self
            .current
            .checked_mul(self.policy.multiplier)
            .map_or(self.policy.max, |next| next.min(self.policy.max));
        delay
    }

    /// Delay the next call to [`Backoff::next_delay`] would return.
    pub fn peek(&self) -> Duration {
        self.current
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Back to `initial` after a successful connect.
    pub fn reset(&mut self) {
        self.current = self.policy.initial;
        self.attempts = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn default_schedule_doubles_to_thirty_seconds() {
        let mut backoff = BackoffPolicy::default().start();
        let delays: Vec<u64> = (0..8).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30, 30]);
        assert_eq!(backoff.attempts(), 8);
    }

    #[test]
    fn reset_returns_to_initial_delay() {
        let mut backoff = BackoffPolicy::default().start();
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.peek(), Duration::from_secs(4));

        backoff.reset();
        assert_eq!(backoff.peek(), Duration::from_secs(1));
        assert_eq!(backoff.attempts(), 0);
    }

    #[test]
    fn inverted_bounds_are_normalized() {
        let policy = BackoffPolicy {
            initial: Duration::from_secs(10),
            max: Duration::from_secs(2),
            multiplier: 0,
        }
        .normalized();
        assert_eq!(policy.max, Duration::from_secs(10));
        assert_eq!(policy.multiplier, 1);
    }

    proptest! {
        #[test]
        fn delays_never_decrease_and_never_exceed_cap(
            initial_ms in 1u64..5_000,
            max_ms in 1u64..120_000,
            multiplier in 0u32..6,
            steps in 1usize..64,
        ) {
            let policy = BackoffPolicy {
                initial: Duration::from_millis(initial_ms),
                max: Duration::from_millis(max_ms),
                multiplier,
            };
            let cap = policy.normalized().max;
            let mut backoff = policy.start();
            let mut previous = Duration::ZERO;
            for _ in 0..steps {
                let delay = backoff.next_delay();
                prop_assert!(delay >= previous);
                prop_assert!(delay <= cap);
                previous = delay;
            }
        }

        #[test]
        fn huge_multipliers_saturate_at_cap(multiplier in 1_000u32..u32::MAX) {
            let mut backoff = BackoffPolicy {
                initial: Duration::from_secs(1),
                max: Duration::from_secs(30),
                multiplier,
            }
            .start();
            backoff.next_delay();
            prop_assert_eq!(backoff.next_delay(), Duration::from_secs(30));
        }
    }
}
