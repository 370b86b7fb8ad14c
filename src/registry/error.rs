//! Registry error types.

use thiserror::Error;

use crate::connection::ConnectionError;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("connection '{0}' already exists")]
    AlreadyExists(String),

    #[error("unsupported protocol '{protocol}' for connection '{name}'")]
    UnsupportedProtocol { name: String, protocol: String },

    #[error("failed to create connection '{name}' ({protocol}): {source}")]
    CreationFailed {
        name: String,
        protocol: String,
        #[source]
        source: ConnectionError,
    },

    #[error("connection '{0}' not found")]
    NotFound(String),

    #[error("connection '{0}' does not expose a repository")]
    NotRepository(String),

    #[error("connection '{0}' does not expose a message queue")]
    NotMessageQueue(String),

    #[error("failed to load connection '{name}': {source}")]
    Load {
        name: String,
        #[source]
        source: Box<RegistryError>,
    },

    #[error("failed to close {}", describe_close(.0))]
    Close(Vec<(String, ConnectionError)>),
}

fn describe_close(failures: &[(String, ConnectionError)]) -> String {
    failures
        .iter()
        .map(|(name, e)| format!("'{}': {}", name, e))
        .collect::<Vec<_>>()
        .join(", ")
}
