//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Outbound call:
//!     → transport.rs (orchestrates attempts, classifies outcomes)
//!     → circuit_breaker.rs (gate before each attempt, fed by each outcome)
//!     → backoff.rs (delay between attempts)
//!     → inner transport (reqwest::Client)
//! ```
//!
//! # Design Decisions
//! - Every external call races a cancellation token; nothing hangs
//! - Retries only when the request body can be replayed
//! - Circuit breaker prevents cascading failures
//! - The wrapper has the same shape as the thing it wraps

pub mod backoff;
pub mod circuit_breaker;
pub mod transport;

pub use backoff::RetryStrategy;
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use transport::{HttpTransport, ResilienceConfig, ResilientTransport, TransportError};
