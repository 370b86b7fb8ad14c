//! Configuration schema definitions.
//!
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use crate::connection::ConnectionError;

/// Root configuration: every named connection target plus runtime settings.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct RegistryConfig {
    /// Named connection targets.
    pub connections: BTreeMap<String, ConnectionConfig>,

    /// Periodic health monitor settings.
    pub health_monitor: HealthMonitorConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// One connection target.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
pub struct ConnectionConfig {
    /// Protocol name used to pick the factory (e.g. "sqlite", "redis").
    pub protocol: String,

    /// DSN or URL. Takes precedence over host/port.
    #[serde(default)]
    pub dsn: Option<String>,

    #[serde(default)]
    pub host: Option<String>,

    #[serde(default)]
    pub port: Option<u16>,

    /// Optional TLS material.
    #[serde(default)]
    pub tls: Option<TlsConfig>,

    /// Connect/request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Adapter-specific settings, e.g. `retry_strategy.max_attempts`.
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

fn default_timeout_secs() -> u64 {
    10
}

impl ConnectionConfig {
    /// Minimal config for a protocol and DSN.
    pub fn new(protocol: impl Into<String>, dsn: impl Into<String>) -> Self {
        Self {
            protocol: protocol.into(),
            dsn: Some(dsn.into()),
            timeout_secs: default_timeout_secs(),
            ..Default::default()
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.properties.insert(key.into(), value.to_string());
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// The DSN if set, otherwise `scheme://host:port` when both are present.
    pub fn endpoint(&self, scheme: &str) -> Option<String> {
        if let Some(dsn) = &self.dsn {
            return Some(dsn.clone());
        }
        match (&self.host, self.port) {
            (Some(host), Some(port)) => Some(format!("{}://{}:{}", scheme, host, port)),
            (Some(host), None) => Some(format!("{}://{}", scheme, host)),
            _ => None,
        }
    }

    /// Parse an optional property; a present but malformed value is an error.
    pub fn property<T: FromStr>(&self, key: &str) -> Result<Option<T>, ConnectionError> {
        match self.properties.get(key) {
            None => Ok(None),
            Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|_| {
                ConnectionError::Config(format!("property '{}' has invalid value '{}'", key, raw))
            }),
        }
    }

    pub fn property_or<T: FromStr>(&self, key: &str, default: T) -> Result<T, ConnectionError> {
        Ok(self.property(key)?.unwrap_or(default))
    }

    /// Millisecond-valued property as a `Duration`.
    pub fn duration_ms(&self, key: &str) -> Result<Option<Duration>, ConnectionError> {
        Ok(self.property::<u64>(key)?.map(Duration::from_millis))
    }
}

/// TLS material for a connection.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct TlsConfig {
    /// Path to client certificate file (PEM).
    pub cert_path: Option<String>,

    /// Path to client private key file (PEM).
    pub key_path: Option<String>,

    /// Path to CA bundle (PEM).
    pub ca_path: Option<String>,

    /// Accept invalid certificates. Development only.
    pub skip_verify: bool,
}

/// Periodic health monitor configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct HealthMonitorConfig {
    /// Enable the periodic monitor.
    pub enabled: bool,

    /// Interval between registry-wide checks in seconds.
    pub interval_secs: u64,

    /// Per-connection probe timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 30,
            timeout_secs: 10,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// "json" or "pretty".
    pub log_format: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
