//! Retry delays for lock acquire loops.
//!
//! Every spin in the lock manager sleeps `base * 2^attempt`, capped at
//! `max`, then randomized by a [`Jitter`] policy so contending processes
//! do not retry in lockstep.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use rand::prelude::*;
use serde::{Deserialize, Serialize};

/// Randomization applied to each backoff delay.
///
/// - `None`: the exact exponential delay.
/// - `Full`: uniform in `[0, delay]`.
/// - `Equal`: `delay / 2` plus uniform in `[0, delay / 2]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Jitter {
    /// No randomization.
    None,
    /// Random delay in `[0, delay]`.
    Full,
    /// Half the delay fixed, half random.
    #[default]
    Equal,
}

impl Jitter {
    /// Applies the policy to `delay`.
    pub fn apply(self, delay: Duration) -> Duration {
        let ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        if ms == 0 {
            return Duration::ZERO;
        }
        match self {
            Self::None => delay,
            Self::Full => Duration::from_millis(rand::rng().random_range(0..=ms)),
            Self::Equal => {
                let half = ms / 2;
                let extra = if half == 0 {
                    0
                } else {
                    rand::rng().random_range(0..=half)
                };
                Duration::from_millis(ms - half + extra)
            },
        }
    }
}

impl fmt::Display for Jitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Full => write!(f, "full"),
            Self::Equal => write!(f, "equal"),
        }
    }
}

impl FromStr for Jitter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "full" => Ok(Self::Full),
            "equal" => Ok(Self::Equal),
            other => Err(format!("unknown jitter policy: {other}")),
        }
    }
}

/// Exponential backoff state for one acquire loop.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: Jitter,
    attempt: u32,
}

impl Backoff {
    /// Starts a fresh sequence.
    pub fn new(base: Duration, max: Duration, jitter: Jitter) -> Self {
        Self {
            base,
            max: max.max(base),
            jitter,
            attempt: 0,
        }
    }

    /// Un-jittered delay for the current attempt.
    pub fn current(&self) -> Duration {
        let factor = 2u32.saturating_pow(self.attempt.min(20));
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Returns the next delay and advances the sequence.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.jitter.apply(self.current());
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Number of delays handed out so far.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, 10)]
    #[case(1, 20)]
    #[case(2, 40)]
    #[case(5, 320)]
    #[case(6, 500)]
    #[case(30, 500)]
    fn exponential_growth_is_capped(#[case] attempt: u32, #[case] expected_ms: u64) {
        let mut backoff = Backoff::new(
            Duration::from_millis(10),
            Duration::from_millis(500),
            Jitter::None,
        );
        for _ in 0..attempt {
            backoff.next_delay();
        }
        assert_eq!(backoff.current(), Duration::from_millis(expected_ms));
    }

    #[rstest]
    #[case("none", Jitter::None)]
    #[case("Full", Jitter::Full)]
    #[case(" equal ", Jitter::Equal)]
    fn jitter_parses_names(#[case] raw: &str, #[case] expected: Jitter) {
        assert_eq!(raw.parse::<Jitter>().unwrap(), expected);
    }

    #[test]
    fn unknown_jitter_name_is_rejected() {
        assert!("decorrelated".parse::<Jitter>().is_err());
    }

    #[test]
    fn zero_delay_stays_zero() {
        for jitter in [Jitter::None, Jitter::Full, Jitter::Equal] {
            assert_eq!(jitter.apply(Duration::ZERO), Duration::ZERO);
        }
    }

    proptest! {
        #[test]
        fn full_jitter_within_delay(ms in 1u64..10_000) {
            let delay = Duration::from_millis(ms);
            prop_assert!(Jitter::Full.apply(delay) <= delay);
        }

        #[test]
        fn equal_jitter_keeps_half(ms in 1u64..10_000) {
            let delay = Duration::from_millis(ms);
            let jittered = Jitter::Equal.apply(delay);
            prop_assert!(jittered <= delay);
            prop_assert!(jittered >= Duration::from_millis(ms - ms / 2));
        }

        #[test]
        fn delays_never_exceed_max(base in 1u64..100, max in 1u64..2_000, steps in 0usize..40) {
            let mut backoff = Backoff::new(
                Duration::from_millis(base),
                Duration::from_millis(max),
                Jitter::Full,
            );
            let cap = Duration::from_millis(base.max(max));
            for _ in 0..steps {
                prop_assert!(backoff.next_delay() <= cap);
            }
        }
    }
}
