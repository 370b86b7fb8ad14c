//! Circuit breaker for upstream protection.
//!
//! # States
//! - Closed: normal operation, calls pass through
//! - Open: upstream assumed down, calls fail fast
//! - Half-Open: probing whether the upstream recovered
//!
//! # State Transitions
//! ```text
//! Closed → Open: consecutive failures >= failure_threshold
//! Open → Half-Open: first allowance check after reset_timeout
//! Half-Open → Closed: successes >= half_open_successes
//! Half-Open → Open: any failure
//! ```
//!
//! # Design Decisions
//! - One breaker per transport (per logical upstream), not global
//! - A success while Closed clears the failure streak
//! - Counters reset on every transition
//! - One mutex makes every operation atomic with respect to the others

use serde::Serialize;
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::config::ConnectionConfig;
use crate::connection::ConnectionError;
use crate::observability::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    HalfOpen,
    Open,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::HalfOpen => "half_open",
            CircuitState::Open => "open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Breaker thresholds.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Time spent Open before a probe is allowed.
    pub reset_timeout: Duration,
    /// Successes in Half-Open needed to close again.
    pub half_open_successes: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            half_open_successes: 1,
        }
    }
}

impl CircuitBreakerConfig {
    /// Read `circuit_breaker.*` properties, falling back to defaults.
    pub fn from_properties(config: &ConnectionConfig) -> Result<Self, ConnectionError> {
        let defaults = Self::default();
        let cfg = Self {
            failure_threshold: config
                .property_or("circuit_breaker.failure_threshold", defaults.failure_threshold)?,
            reset_timeout: config
                .duration_ms("circuit_breaker.reset_timeout_ms")?
                .unwrap_or(defaults.reset_timeout),
            half_open_successes: config
                .property_or("circuit_breaker.half_open_successes", defaults.half_open_successes)?,
        };
        if cfg.failure_threshold == 0 || cfg.half_open_successes == 0 {
            return Err(ConnectionError::Config(
                "circuit breaker thresholds must be greater than 0".to_string(),
            ));
        }
        Ok(cfg)
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failures: u32,
    half_open_successes: u32,
    last_failure: Option<Instant>,
}

impl Inner {
    fn transition(&mut self, name: &str, to: CircuitState) {
        let from = self.state;
        self.state = to;
        self.failures = 0;
        self.half_open_successes = 0;
        match to {
            CircuitState::Open => tracing::warn!(upstream = %name, from = %from, "Circuit opened"),
            _ => tracing::info!(upstream = %name, from = %from, to = %to, "Circuit state changed"),
        }
        metrics::record_circuit_state(name, to);
    }
}

/// Three-state failure gate guarding one upstream.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failures: 0,
                half_open_successes: 0,
                last_failure: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // State stays consistent even if a holder panicked mid-update:
        // every write is a plain field store.
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Whether a call may proceed now. Moves Open → Half-Open once the
    /// reset timeout has elapsed.
    pub fn is_allowed(&self) -> bool {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let expired = inner
                    .last_failure
                    .map(|at| at.elapsed() > self.config.reset_timeout)
                    .unwrap_or(true);
                if expired {
                    inner.transition(&self.name, CircuitState::HalfOpen);
                }
                expired
            }
        }
    }

    pub fn on_success(&self) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => inner.failures = 0,
            CircuitState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.half_open_successes {
                    inner.transition(&self.name, CircuitState::Closed);
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn on_failure(&self) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.failures += 1;
                if inner.failures >= self.config.failure_threshold {
                    inner.transition(&self.name, CircuitState::Open);
                    inner.last_failure = Some(Instant::now());
                }
            }
            CircuitState::HalfOpen => {
                inner.transition(&self.name, CircuitState::Open);
                inner.last_failure = Some(Instant::now());
            }
            CircuitState::Open => inner.last_failure = Some(Instant::now()),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Current failure streak while Closed; zero in other states.
    pub fn failure_count(&self) -> u32 {
        self.lock().failures
    }
}
