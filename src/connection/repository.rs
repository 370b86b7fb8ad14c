//! Protocol-neutral store operations.
//!
//! Generic data-access code obtains a `Repository` through
//! `Registry::get_repository` and never names a concrete adapter.

use async_trait::async_trait;
use serde_json::Value;

use crate::connection::types::{ConnectionError, ConnectionResult};

/// Document-style storage keyed by collection and id.
#[async_trait]
pub trait Repository: Send + Sync {
    async fn get(&self, collection: &str, id: &str) -> ConnectionResult<Option<Value>>;

    /// Insert or replace a document.
    async fn put(&self, collection: &str, id: &str, document: &Value) -> ConnectionResult<()>;

    /// Returns true if a document was removed.
    async fn delete(&self, collection: &str, id: &str) -> ConnectionResult<bool>;

    /// All ids currently stored in a collection, sorted.
    async fn list_ids(&self, collection: &str) -> ConnectionResult<Vec<String>>;
}

/// Collections become table names or key prefixes, so keep them to
/// identifier characters.
pub fn validate_collection(collection: &str) -> ConnectionResult<()> {
    let mut chars = collection.chars();
    let valid_start = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    if valid_start && chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(())
    } else {
        Err(ConnectionError::Config(format!(
            "invalid collection name '{}'",
            collection
        )))
    }
}
