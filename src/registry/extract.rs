//! Typed access to a connection's underlying handle.

use std::any::{type_name, Any};
use std::sync::Arc;
use thiserror::Error;

use crate::registry::Registry;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExtractError {
    #[error("no registry available")]
    RegistryAbsent,

    #[error("connection '{0}' not found")]
    NotFound(String),

    #[error("connection '{0}' has no underlying handle")]
    NilHandle(String),

    #[error("connection '{name}' does not hold a {expected}")]
    TypeMismatch { name: String, expected: &'static str },
}

/// Fetch the raw handle of `name` as a `T`, e.g. `sqlx::SqlitePool`,
/// `deadpool_redis::Pool` or `reqwest::Client`.
pub async fn extract<T>(registry: Option<&Registry>, name: &str) -> Result<Arc<T>, ExtractError>
where
    T: Any + Send + Sync,
{
    let registry = registry.ok_or(ExtractError::RegistryAbsent)?;
    let connection = registry
        .get(name)
        .await
        .ok_or_else(|| ExtractError::NotFound(name.to_string()))?;
    let raw = connection
        .raw_connection()
        .ok_or_else(|| ExtractError::NilHandle(name.to_string()))?;
    raw.downcast::<T>().map_err(|_| ExtractError::TypeMismatch {
        name: name.to_string(),
        expected: type_name::<T>(),
    })
}
