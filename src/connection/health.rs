//! Shared shape of every adapter health check.
//!
//! # Data Flow
//! ```text
//! Probe::start()
//!     → adapter verifies its handle exists      (missing → Error)
//!     → one cheap liveness probe                (failure → Error, stop)
//!     → adapter-specific secondary signals      (Connected / Live / Ready)
//!     → Probe::finish() stores state + returns HealthStatus
//! ```

use std::time::{Instant, SystemTime};

use crate::connection::state::StateCell;
use crate::connection::types::{ConnectionState, HealthStatus};

/// Timing and bookkeeping for one health check.
#[derive(Debug)]
pub struct Probe {
    started_at: SystemTime,
    started: Instant,
}

impl Probe {
    pub fn start() -> Self {
        Self {
            started_at: SystemTime::now(),
            started: Instant::now(),
        }
    }

    /// Record the outcome: store it in the connection's state cell and
    /// return the matching status.
    pub fn finish(
        self,
        cell: &StateCell,
        state: ConnectionState,
        message: impl Into<String>,
        error: Option<String>,
    ) -> HealthStatus {
        let latency = self.started.elapsed();
        let previous = cell.set(state);
        if previous != state {
            tracing::debug!(from = %previous, to = %state, "Connection state changed");
        }
        HealthStatus {
            timestamp: self.started_at,
            state,
            error,
            message: message.into(),
            latency,
        }
    }

    pub fn ok(self, cell: &StateCell, state: ConnectionState, message: impl Into<String>) -> HealthStatus {
        self.finish(cell, state, message, None)
    }

    pub fn failed(self, cell: &StateCell, message: impl Into<String>, error: impl ToString) -> HealthStatus {
        self.finish(cell, ConnectionState::Error, message, Some(error.to_string()))
    }
}
