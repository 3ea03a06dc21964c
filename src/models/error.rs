//! Error types for the Mesh Hub

use thiserror::Error;

/// Hub errors
#[derive(Debug, Error)]
pub enum HubError {
    #[error("Not connected to the message bus")]
    NotConnected,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unknown target: {kind} {id}")]
    UnknownTarget { kind: String, id: String },

    #[error("Not found: {kind} with id {id}")]
    NotFound { kind: String, id: String },

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Probe failed: {0}")]
    ProbeFailed(String),

    #[error("Rate limit exceeded for {0}")]
    RateLimitExceeded(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl HubError {
    pub fn not_found(kind: impl Into<String>, id: impl Into<String>) -> Self {
        HubError::NotFound {
            kind: kind.into(),
            id: id.into(),
        }
    }

    pub fn unknown_target(kind: impl Into<String>, id: impl Into<String>) -> Self {
        HubError::UnknownTarget {
            kind: kind.into(),
            id: id.into(),
        }
    }

    /// True for errors caused by the bus being unreachable
    pub fn is_transport(&self) -> bool {
        matches!(self, HubError::NotConnected | HubError::Transport(_))
    }
}

// Convert from standard library errors
impl From<std::io::Error> for HubError {
    fn from(err: std::io::Error) -> Self {
        HubError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for HubError {
    fn from(err: serde_json::Error) -> Self {
        HubError::SerializationError(err.to_string())
    }
}

impl From<config::ConfigError> for HubError {
    fn from(err: config::ConfigError) -> Self {
        HubError::ConfigError(err.to_string())
    }
}

impl From<rocksdb::Error> for HubError {
    fn from(err: rocksdb::Error) -> Self {
        HubError::DatabaseError(err.to_string())
    }
}

/// Result type for hub operations
pub type HubResult<T> = Result<T, HubError>;
