//! Explicit retry state for transient delivery failures.
//!
//! Backoff is a value threaded through the retry loop, never unwind-driven:
//! each failure either yields the next sleep or reports the budget exhausted.

use rand::RngExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Delay ceiling.
    pub max_delay: Duration,
    /// Multiplier applied per consecutive failure.
    pub growth_factor: f64,
    /// Randomized jitter fraction added to each delay, in [0, 1).
    pub jitter: f64,
    /// Maximum delivery attempts before the failure is fatal.
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            growth_factor: 2.0,
            jitter: 0.2,
            max_attempts: 4,
        }
    }
}

/// Current backoff position: delay for the next retry plus the consecutive
/// failure count. Reset on any success.
#[derive(Debug, Clone)]
pub struct RetryState {
    delay: Duration,
    attempts: u32,
}

impl RetryState {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            delay: config.initial_delay,
            attempts: 0,
        }
    }

    /// Record one failed attempt. Returns the jittered delay to sleep before
    /// retrying, or `None` once the attempt budget is spent.
    pub fn record_failure(&mut self, config: &RetryConfig) -> Option<Duration> {
        self.attempts += 1;
        if self.attempts >= config.max_attempts {
            return None;
        }

        let base = self.delay;
        self.delay = base.mul_f64(config.growth_factor).min(config.max_delay);

        let jitter = if config.jitter > 0.0 {
            rand::rng().random_range(0.0..config.jitter)
        } else {
            0.0
        };
        Some(base.mul_f64(1.0 + jitter).min(config.max_delay))
    }

    pub fn reset(&mut self, config: &RetryConfig) {
        self.delay = config.initial_delay;
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> RetryConfig {
        RetryConfig {
            jitter: 0.0,
            max_attempts: 10,
            ..Default::default()
        }
    }

    #[test]
    fn test_delay_progression() {
        let config = no_jitter();
        let mut state = RetryState::new(&config);
        assert_eq!(state.record_failure(&config), Some(Duration::from_millis(200)));
        assert_eq!(state.record_failure(&config), Some(Duration::from_millis(400)));
        assert_eq!(state.record_failure(&config), Some(Duration::from_millis(800)));
        assert_eq!(state.record_failure(&config), Some(Duration::from_millis(1600)));
        assert_eq!(state.record_failure(&config), Some(Duration::from_millis(3200)));
        // Capped at the ceiling from here on.
        assert_eq!(state.record_failure(&config), Some(Duration::from_secs(5)));
        assert_eq!(state.record_failure(&config), Some(Duration::from_secs(5)));
    }

    #[test]
    fn delays_grow_strictly_and_respect_the_ceiling() {
        let config = RetryConfig {
            max_attempts: 10,
            ..Default::default()
        };
        let mut state = RetryState::new(&config);
        let d1 = state.record_failure(&config).unwrap();
        let d2 = state.record_failure(&config).unwrap();
        let d3 = state.record_failure(&config).unwrap();

        // Growth dominates jitter (factor 2.0 vs jitter < 1.0).
        assert!(d2 > d1);
        assert!(d3 > d2);
        assert!(d3 <= config.max_delay);
    }

    #[test]
    fn budget_exhausts_after_max_attempts() {
        let config = RetryConfig {
            jitter: 0.0,
            max_attempts: 3,
            ..Default::default()
        };
        let mut state = RetryState::new(&config);
        assert!(state.record_failure(&config).is_some());
        assert!(state.record_failure(&config).is_some());
        assert!(state.record_failure(&config).is_none());
        assert_eq!(state.attempts(), 3);
    }

    #[test]
    fn reset_returns_to_initial_delay() {
        let config = no_jitter();
        let mut state = RetryState::new(&config);
        state.record_failure(&config);
        state.record_failure(&config);
        state.reset(&config);
        assert_eq!(state.attempts(), 0);
        assert_eq!(state.record_failure(&config), Some(Duration::from_millis(200)));
    }
}
