//! Exponential backoff with jitter.

use rand::rngs::OsRng;
use rand::Rng;
use std::time::Duration;

use crate::config::ConnectionConfig;
use crate::connection::ConnectionError;

/// Retry schedule shared by every call through one transport.
///
/// `next_backoff` is pure apart from the jitter draw, so one strategy can be
/// shared by any number of concurrent callers.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryStrategy {
    /// Total attempts, first call included.
    pub max_attempts: u32,
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub multiplier: f64,
    /// Jitter spread: the delay is scaled by a factor in `[1 - rf, 1 + rf]`.
    pub random_factor: f64,
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(10),
            multiplier: 2.0,
            random_factor: 0.5,
        }
    }
}

impl RetryStrategy {
    /// Read `retry_strategy.*` properties, falling back to defaults.
    pub fn from_properties(config: &ConnectionConfig) -> Result<Self, ConnectionError> {
        let defaults = Self::default();
        let strategy = Self {
            max_attempts: config.property_or("retry_strategy.max_attempts", defaults.max_attempts)?,
            initial_interval: config
                .duration_ms("retry_strategy.initial_interval_ms")?
                .unwrap_or(defaults.initial_interval),
            max_interval: config
                .duration_ms("retry_strategy.max_interval_ms")?
                .unwrap_or(defaults.max_interval),
            multiplier: config.property_or("retry_strategy.multiplier", defaults.multiplier)?,
            random_factor: config.property_or("retry_strategy.random_factor", defaults.random_factor)?,
        };
        if strategy.max_attempts == 0 {
            return Err(ConnectionError::Config(
                "retry_strategy.max_attempts must be greater than 0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&strategy.random_factor) {
            return Err(ConnectionError::Config(
                "retry_strategy.random_factor must be within [0, 1]".to_string(),
            ));
        }
        if strategy.multiplier < 1.0 {
            return Err(ConnectionError::Config(
                "retry_strategy.multiplier must be at least 1".to_string(),
            ));
        }
        Ok(strategy)
    }

    /// Delay to wait before attempt number `attempt` (zero-based).
    ///
    /// Zero once `attempt` reaches `max_attempts`; otherwise
    /// `initial * multiplier^attempt` with jitter, capped at `max_interval`.
    pub fn next_backoff(&self, attempt: u32) -> Duration {
        if attempt >= self.max_attempts {
            return Duration::ZERO;
        }

        let base = self.initial_interval.as_secs_f64() * self.multiplier.powi(attempt as i32);

        // Jitter comes from the OS CSPRNG so concurrent clients never share a sequence.
        let factor = if self.random_factor > 0.0 {
            OsRng.gen_range((1.0 - self.random_factor)..=(1.0 + self.random_factor))
        } else {
            1.0
        };

        // f64::min drops NaN, so an overflowing base still lands on the cap.
        let delay = (base * factor).min(self.max_interval.as_secs_f64()).max(0.0);
        Duration::from_secs_f64(delay)
    }
}
