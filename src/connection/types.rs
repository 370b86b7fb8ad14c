//! Connection vocabulary: behaviors, capabilities, lifecycle state, health results.

use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::time::{Duration, SystemTime};
use thiserror::Error;

/// Interaction style of a connection. A connection may declare several.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Behavior {
    Stateful,
    Stateless,
    Streaming,
}

/// Semantic operation set a connection supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    KeyValue,
    Document,
    Relational,
    Transactional,
    Cache,
    Queue,
    Observability,
    Logging,
    Metrics,
    Tracing,
}

impl Capability {
    /// Capabilities that make a connection usable as a generic repository.
    pub const STORAGE: [Capability; 3] = [
        Capability::KeyValue,
        Capability::Document,
        Capability::Relational,
    ];
}

/// Lifecycle state of a connection.
///
/// # State Transitions
/// ```text
/// NotInitialized → Connected → Live → Ready
/// any → Disconnected | Error | Reconnecting
/// ```
/// Ready serves requests now; Live answers but capacity is uncertain;
/// Connected is a liveness-only signal.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    NotInitialized = 0,
    Connected = 1,
    Live = 2,
    Ready = 3,
    Disconnected = 4,
    Error = 5,
    Reconnecting = 6,
}

impl From<u8> for ConnectionState {
    fn from(val: u8) -> Self {
        match val {
            1 => ConnectionState::Connected,
            2 => ConnectionState::Live,
            3 => ConnectionState::Ready,
            4 => ConnectionState::Disconnected,
            5 => ConnectionState::Error,
            6 => ConnectionState::Reconnecting,
            _ => ConnectionState::NotInitialized,
        }
    }
}

impl ConnectionState {
    /// Whether requests can be attempted in this state.
    pub fn is_usable(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connected | ConnectionState::Live | ConnectionState::Ready
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::NotInitialized => "not_initialized",
            ConnectionState::Connected => "connected",
            ConnectionState::Live => "live",
            ConnectionState::Ready => "ready",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Error => "error",
            ConnectionState::Reconnecting => "reconnecting",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one health probe.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub timestamp: SystemTime,
    pub state: ConnectionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub message: String,
    #[serde(rename = "latency_ms", serialize_with = "serialize_millis")]
    pub latency: Duration,
}

impl HealthStatus {
    /// A status that was not produced by a probe (e.g. the probe timed out).
    pub fn unprobed(state: ConnectionState, message: impl Into<String>, error: Option<String>) -> Self {
        Self {
            timestamp: SystemTime::now(),
            state,
            error,
            message: message.into(),
            latency: Duration::ZERO,
        }
    }
}

fn serialize_millis<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

/// Errors raised by adapters and factories.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("{protocol} connect failed: {message}")]
    Connect { protocol: &'static str, message: String },

    #[error("{protocol} {operation} failed: {message}")]
    Operation {
        protocol: &'static str,
        operation: &'static str,
        message: String,
    },

    #[error("{0} connection is not initialized")]
    NotInitialized(&'static str),

    #[error("{0} connection is closed")]
    Closed(&'static str),
}

impl ConnectionError {
    pub fn operation(protocol: &'static str, operation: &'static str, err: impl fmt::Display) -> Self {
        ConnectionError::Operation {
            protocol,
            operation,
            message: err.to_string(),
        }
    }

    pub fn connect(protocol: &'static str, err: impl fmt::Display) -> Self {
        ConnectionError::Connect {
            protocol,
            message: err.to_string(),
        }
    }
}

/// Result type for adapter operations.
pub type ConnectionResult<T> = Result<T, ConnectionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_round_trips_through_u8() {
        for state in [
            ConnectionState::NotInitialized,
            ConnectionState::Connected,
            ConnectionState::Live,
            ConnectionState::Ready,
            ConnectionState::Disconnected,
            ConnectionState::Error,
            ConnectionState::Reconnecting,
        ] {
            assert_eq!(ConnectionState::from(state as u8), state);
        }
        assert_eq!(ConnectionState::from(42), ConnectionState::NotInitialized);
    }

    #[test]
    fn test_health_status_serializes_latency_in_millis() {
        let mut status = HealthStatus::unprobed(ConnectionState::Ready, "ok", None);
        status.latency = Duration::from_millis(15);
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["latency_ms"], 15);
        assert_eq!(json["state"], "ready");
        assert!(json.get("error").is_none());
    }

    #[test]
    fn test_error_display() {
        let err = ConnectionError::operation("redis", "get", "boom");
        assert_eq!(err.to_string(), "redis get failed: boom");
    }
}
