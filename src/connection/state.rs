//! Atomically stored connection state.

use std::sync::atomic::{AtomicU8, Ordering};

use crate::connection::types::ConnectionState;

/// Lock-free holder for a connection's current state.
///
/// Written by health checks and lifecycle methods, read cheaply by
/// `Connection::state` without re-probing.
#[derive(Debug)]
pub struct StateCell {
    state: AtomicU8,
}

impl StateCell {
    pub fn new(initial: ConnectionState) -> Self {
        Self {
            state: AtomicU8::new(initial as u8),
        }
    }

    pub fn get(&self) -> ConnectionState {
        ConnectionState::from(self.state.load(Ordering::Acquire))
    }

    /// Store a new state, returning the previous one.
    pub fn set(&self, state: ConnectionState) -> ConnectionState {
        ConnectionState::from(self.state.swap(state as u8, Ordering::AcqRel))
    }

    /// Move from `from` to `to` only if the current state is `from`.
    pub fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new(ConnectionState::NotInitialized)
    }
}
