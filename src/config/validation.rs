//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Every connection names a protocol and a target
//! - Validate value ranges (timeouts > 0, intervals > 0)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: RegistryConfig → Result<(), Vec<ValidationError>>
//! - Protocol support is checked later by the registry, which owns the factories

use std::fmt;

use crate::config::schema::RegistryConfig;

/// One semantic problem in a config document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path of the offending field.
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

pub fn validate_config(config: &RegistryConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    for (name, conn) in &config.connections {
        let prefix = format!("connections.{}", name);

        if name.trim().is_empty() {
            errors.push(ValidationError::new("connections", "connection name must not be empty"));
        }
        if conn.protocol.trim().is_empty() {
            errors.push(ValidationError::new(format!("{}.protocol", prefix), "protocol is required"));
        }
        let has_dsn = conn.dsn.as_deref().map(|d| !d.trim().is_empty()).unwrap_or(false);
        if !has_dsn && conn.host.is_none() {
            errors.push(ValidationError::new(
                prefix.clone(),
                "either dsn or host must be set",
            ));
        }
        if conn.timeout_secs == 0 {
            errors.push(ValidationError::new(
                format!("{}.timeout_secs", prefix),
                "must be greater than 0",
            ));
        }
        if let Some(tls) = &conn.tls {
            if tls.cert_path.is_some() != tls.key_path.is_some() {
                errors.push(ValidationError::new(
                    format!("{}.tls", prefix),
                    "cert_path and key_path must be set together",
                ));
            }
        }
    }

    if config.health_monitor.enabled {
        if config.health_monitor.interval_secs == 0 {
            errors.push(ValidationError::new(
                "health_monitor.interval_secs",
                "must be greater than 0",
            ));
        }
        if config.health_monitor.timeout_secs == 0 {
            errors.push(ValidationError::new(
                "health_monitor.timeout_secs",
                "must be greater than 0",
            ));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
