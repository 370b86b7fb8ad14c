//! Resilient outbound transport.
//!
//! # Data Flow
//! ```text
//! send(request)
//!     → breaker gate (Open → CircuitOpen, no call made)
//!     → body cloneable? (no → NonRetriableBody, no call made)
//!     → attempt loop:
//!         backoff sleep (attempt > 0), racing cancellation
//!         inner.send(clone of request)
//!         status < threshold → breaker success, return response
//!         error / status >= threshold → breaker failure
//!             breaker now Open → CircuitOpen
//!     → exhausted: RetriesExhausted (last was a response)
//!                  AllAttemptsFailed (last was a transport error)
//! ```
//!
//! # Design Decisions
//! - Same call shape as the plain client, so it substitutes transparently
//! - Whichever of breaker and retry budget hits its limit first decides the error
//! - The last server-error response is kept inside the error, never returned as Ok
//! - A single-attempt run hands back whatever the upstream answered

use async_trait::async_trait;
use reqwest::{Request, Response, StatusCode};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::ConnectionConfig;
use crate::connection::ConnectionError;
use crate::observability::metrics;
use crate::resilience::backoff::RetryStrategy;
use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};

/// Terminal outcome of a call that did not produce a usable response.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("circuit breaker open for {0}")]
    CircuitOpen(String),

    #[error("retries exhausted after {attempts} attempts, last status {status}")]
    RetriesExhausted {
        attempts: u32,
        status: StatusCode,
        last_response: Box<Response>,
    },

    #[error("all {attempts} attempts failed: {last_error}")]
    AllAttemptsFailed {
        attempts: u32,
        #[source]
        last_error: Box<TransportError>,
    },

    #[error("request cancelled")]
    Cancelled,

    #[error("request body cannot be replayed, refusing to retry")]
    NonRetriableBody,

    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
}

impl TransportError {
    /// The last raw upstream response, when retries ran out on server errors.
    pub fn into_last_response(self) -> Option<Response> {
        match self {
            TransportError::RetriesExhausted { last_response, .. } => Some(*last_response),
            _ => None,
        }
    }

    fn outcome(&self) -> &'static str {
        match self {
            TransportError::CircuitOpen(_) => "circuit_open",
            TransportError::RetriesExhausted { .. } => "retries_exhausted",
            TransportError::AllAttemptsFailed { .. } => "all_attempts_failed",
            TransportError::Cancelled => "cancelled",
            TransportError::NonRetriableBody => "non_retriable_body",
            TransportError::Request(_) => "request_error",
        }
    }
}

/// Request in, response out.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: Request, cancel: &CancellationToken) -> Result<Response, TransportError>;
}

#[async_trait]
impl HttpTransport for reqwest::Client {
    async fn send(&self, request: Request, cancel: &CancellationToken) -> Result<Response, TransportError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(TransportError::Cancelled),
            result = self.execute(request) => result.map_err(TransportError::from),
        }
    }
}

/// Which mechanisms wrap the inner transport.
#[derive(Debug, Clone, PartialEq)]
pub struct ResilienceConfig {
    /// `None` disables circuit breaking.
    pub circuit_breaker: Option<CircuitBreakerConfig>,
    /// `None` means exactly one attempt.
    pub retry: Option<RetryStrategy>,
    /// Statuses at or above this count as failures.
    pub server_error_threshold: u16,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            circuit_breaker: Some(CircuitBreakerConfig::default()),
            retry: Some(RetryStrategy::default()),
            server_error_threshold: 500,
        }
    }
}

impl ResilienceConfig {
    /// Both mechanisms off: a pass-through transport.
    pub fn disabled() -> Self {
        Self {
            circuit_breaker: None,
            retry: None,
            server_error_threshold: 500,
        }
    }

    pub fn from_properties(config: &ConnectionConfig) -> Result<Self, ConnectionError> {
        let circuit_breaker = if config.property_or("circuit_breaker.enabled", true)? {
            Some(CircuitBreakerConfig::from_properties(config)?)
        } else {
            None
        };
        let retry = if config.property_or("retry_strategy.enabled", true)? {
            Some(RetryStrategy::from_properties(config)?)
        } else {
            None
        };
        let server_error_threshold = config.property_or("server_error_threshold", 500u16)?;
        if !(100..=599).contains(&server_error_threshold) {
            return Err(ConnectionError::Config(format!(
                "server_error_threshold {} is not an HTTP status",
                server_error_threshold
            )));
        }
        Ok(Self {
            circuit_breaker,
            retry,
            server_error_threshold,
        })
    }
}

/// Failure kept from the latest attempt.
enum Failure {
    Status(Response),
    Error(TransportError),
}

/// Circuit breaker plus retry around any [`HttpTransport`].
pub struct ResilientTransport<T> {
    name: String,
    inner: T,
    breaker: Option<CircuitBreaker>,
    retry: Option<RetryStrategy>,
    server_error_threshold: u16,
}

impl<T: HttpTransport> ResilientTransport<T> {
    pub fn new(name: impl Into<String>, inner: T, config: ResilienceConfig) -> Self {
        let name = name.into();
        let breaker = config
            .circuit_breaker
            .map(|cfg| CircuitBreaker::new(name.clone(), cfg));
        Self {
            name,
            inner,
            breaker,
            retry: config.retry,
            server_error_threshold: config.server_error_threshold,
        }
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }

    pub fn breaker(&self) -> Option<&CircuitBreaker> {
        self.breaker.as_ref()
    }

    pub fn retry_strategy(&self) -> Option<&RetryStrategy> {
        self.retry.as_ref()
    }

    fn max_attempts(&self) -> u32 {
        self.retry.as_ref().map(|r| r.max_attempts.max(1)).unwrap_or(1)
    }

    fn allowed(&self) -> bool {
        self.breaker.as_ref().map(|b| b.is_allowed()).unwrap_or(true)
    }

    fn record_success(&self) {
        if let Some(breaker) = &self.breaker {
            breaker.on_success();
        }
    }

    /// Count a failure; true when it left the breaker Open.
    fn record_failure(&self) -> bool {
        match &self.breaker {
            Some(breaker) => {
                breaker.on_failure();
                breaker.state() == CircuitState::Open
            }
            None => false,
        }
    }

    async fn run(&self, request: Request, cancel: &CancellationToken) -> Result<Response, TransportError> {
        if !self.allowed() {
            return Err(TransportError::CircuitOpen(self.name.clone()));
        }

        let max_attempts = self.max_attempts();
        if max_attempts > 1 && request.try_clone().is_none() {
            return Err(TransportError::NonRetriableBody);
        }

        let mut original = Some(request);
        let mut attempt = 0u32;
        loop {
            if attempt > 0 {
                if let Some(strategy) = &self.retry {
                    let delay = strategy.next_backoff(attempt);
                    tracing::debug!(upstream = %self.name, attempt, delay_ms = delay.as_millis() as u64, "Backing off before retry");
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(TransportError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                // Another caller may have opened the breaker while we slept.
                if !self.allowed() {
                    return Err(TransportError::CircuitOpen(self.name.clone()));
                }
            }

            let request = if attempt + 1 >= max_attempts {
                original.take()
            } else {
                original.as_ref().and_then(Request::try_clone)
            }
            .ok_or(TransportError::NonRetriableBody)?;

            attempt += 1;
            metrics::record_transport_attempt(&self.name);

            let failure = match self.inner.send(request, cancel).await {
                Ok(response) if response.status().as_u16() < self.server_error_threshold => {
                    self.record_success();
                    return Ok(response);
                }
                Ok(response) => {
                    tracing::warn!(upstream = %self.name, attempt, status = %response.status(), "Upstream returned server error");
                    Failure::Status(response)
                }
                Err(TransportError::Cancelled) => return Err(TransportError::Cancelled),
                Err(e) => {
                    tracing::warn!(upstream = %self.name, attempt, error = %e, "Upstream call failed");
                    Failure::Error(e)
                }
            };

            if self.record_failure() {
                return Err(TransportError::CircuitOpen(self.name.clone()));
            }

            if attempt >= max_attempts {
                return match failure {
                    Failure::Status(response) if max_attempts == 1 => Ok(response),
                    Failure::Error(e) if max_attempts == 1 => Err(e),
                    Failure::Status(response) => Err(TransportError::RetriesExhausted {
                        attempts: attempt,
                        status: response.status(),
                        last_response: Box::new(response),
                    }),
                    Failure::Error(e) => Err(TransportError::AllAttemptsFailed {
                        attempts: attempt,
                        last_error: Box::new(e),
                    }),
                };
            }
        }
    }
}

#[async_trait]
impl<T: HttpTransport> HttpTransport for ResilientTransport<T> {
    async fn send(&self, request: Request, cancel: &CancellationToken) -> Result<Response, TransportError> {
        let result = self.run(request, cancel).await;
        match &result {
            Ok(_) => metrics::record_transport_outcome(&self.name, "success"),
            Err(e) => {
                metrics::record_transport_outcome(&self.name, e.outcome());
                tracing::debug!(upstream = %self.name, error = %e, "Call ended without a usable response");
            }
        }
        result
    }
}
