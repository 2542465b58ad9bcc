//! Backoff policies for computing the delay before the next retry attempt.

use std::time::Duration;

use rand::Rng;

use crate::error::{ConfigError, ConfigResult};

/// Strategy for calculating retry delays.
#[derive(Debug, Clone, PartialEq)]
pub enum BackoffPolicy {
    /// Fixed delay between retries.
    Constant { delay: Duration },
    /// Linear backoff: `initial_delay + attempt * increment`.
    Linear { initial_delay: Duration, increment: Duration },
    /// Exponential backoff with jitter:
    /// `base_delay * 2^attempt * (1 ± jitter_fraction)`, capped at
    /// `max_delay`. The random perturbation spreads retries from many
    /// independent callers so they do not land on the dependency in
    /// synchronized waves.
    Exponential { base_delay: Duration, max_delay: Duration, jitter_fraction: f64 },
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::Exponential {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            jitter_fraction: 0.2,
        }
    }
}

impl BackoffPolicy {
    /// Calculate the delay to sleep before attempt `attempt + 1`, given that
    /// attempt `attempt` (0-based) just failed.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self {
            Self::Constant { delay } => *delay,
            Self::Linear { initial_delay, increment } => {
                *initial_delay + increment.saturating_mul(attempt)
            }
            Self::Exponential { base_delay, max_delay, jitter_fraction } => {
                // 2^32 seconds is already beyond any practical cap; clamping the
                // exponent keeps the f64 math finite.
                let exponent = attempt.min(32) as i32;
                let raw = base_delay.as_secs_f64() * 2f64.powi(exponent);
                let capped = raw.min(max_delay.as_secs_f64());
                let jittered = if *jitter_fraction > 0.0 {
                    let factor = rand::thread_rng()
                        .gen_range(1.0 - jitter_fraction..=1.0 + jitter_fraction);
                    capped * factor
                } else {
                    capped
                };
                Duration::from_secs_f64(jittered.min(max_delay.as_secs_f64()))
            }
        }
    }

    /// Validate the policy parameters.
    pub fn validate(&self) -> ConfigResult<()> {
        if let Self::Exponential { base_delay, max_delay, jitter_fraction } = self {
            if !(0.0..1.0).contains(jitter_fraction) {
                return Err(ConfigError::invalid("jitter_fraction must be within [0, 1)"));
            }
            if max_delay < base_delay {
                return Err(ConfigError::invalid("max_delay must be at least base_delay"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_policy_ignores_attempt() {
        let policy = BackoffPolicy::Constant { delay: Duration::from_millis(100) };

        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(5), Duration::from_millis(100));
        assert_eq!(policy.delay_for(100), Duration::from_millis(100));
    }

    #[test]
    fn linear_policy_grows_by_increment() {
        let policy = BackoffPolicy::Linear {
            initial_delay: Duration::from_millis(100),
            increment: Duration::from_millis(50),
        };

        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(150));
        assert_eq!(policy.delay_for(10), Duration::from_millis(600));
    }

    #[test]
    fn exponential_policy_doubles_without_jitter() {
        let policy = BackoffPolicy::Exponential {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            jitter_fraction: 0.0,
        };

        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for(3), Duration::from_millis(800));
    }

    #[test]
    fn exponential_policy_caps_at_max_delay() {
        let policy = BackoffPolicy::Exponential {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            jitter_fraction: 0.0,
        };

        assert_eq!(policy.delay_for(20), Duration::from_secs(10));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn exponential_jitter_stays_within_bounds() {
        let policy = BackoffPolicy::Exponential {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(60),
            jitter_fraction: 0.5,
        };

        for _ in 0..100 {
            let delay = policy.delay_for(2);
            // 400ms * (1 ± 0.5)
            assert!(delay >= Duration::from_millis(200), "delay {delay:?} below jitter floor");
            assert!(delay <= Duration::from_millis(600), "delay {delay:?} above jitter ceiling");
        }
    }

    #[test]
    fn validation_rejects_bad_jitter() {
        let policy = BackoffPolicy::Exponential {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            jitter_fraction: 1.5,
        };
        assert!(policy.validate().is_err());

        let policy = BackoffPolicy::Exponential {
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(1),
            jitter_fraction: 0.0,
        };
        assert!(policy.validate().is_err());

        assert!(BackoffPolicy::default().validate().is_ok());
    }
}
