//! Error types for registry and repository operations

use std::fmt;

/// Result type alias for registry and repository operations
pub type LinkResult<T> = Result<T, LinkError>;

/// Errors surfaced by the public registry API
///
/// Transport failures never show up here; they only flip a host offline.
#[derive(Debug)]
pub enum LinkError {
    /// No host with this id is configured
    UnknownHost(String),

    /// The actor backing a host has already stopped
    ActorStopped(String),

    /// Host list could not be (de)serialized
    SerializationError(String),

    /// I/O error while reading or writing the host list
    IoError(std::io::Error),
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkError::UnknownHost(id) => write!(f, "unknown host: {}", id),
            LinkError::ActorStopped(id) => write!(f, "actor for host {} has stopped", id),
            LinkError::SerializationError(msg) => write!(f, "host list serialization error: {}", msg),
            LinkError::IoError(err) => write!(f, "I/O error: {}", err),
        }
    }
}

impl std::error::Error for LinkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LinkError::IoError(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for LinkError {
    fn from(err: std::io::Error) -> Self {
        LinkError::IoError(err)
    }
}

impl From<serde_json::Error> for LinkError {
    fn from(err: serde_json::Error) -> Self {
        LinkError::SerializationError(err.to_string())
    }
}
