//! Error types for pubpoll
//!
//! Defines all error types used throughout the application.

use thiserror::Error;

use crate::id::StorageId;

/// Main error type for pubpoll operations
#[derive(Error, Debug)]
pub enum Error {
    /// Channel ID does not resolve to any configured channel
    #[error("Invalid channel: {0}")]
    InvalidChannel(String),

    /// Malformed identifier
    #[error("Invalid {kind}: {value:?}")]
    InvalidId { kind: &'static str, value: String },

    /// Malformed request parameter
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Authentication failed
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Capability is not provided by the configured storage
    #[error("Not supported: {0}")]
    Unsupported(&'static str),

    /// Operation gave up because its deadline passed
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Invalid configuration detected while building components
    #[error("Configuration error: {0}")]
    Config(String),

    /// Failures of several storages, one entry per failing storage
    #[error("{}", display_aggregate(.0))]
    Aggregate(Vec<(StorageId, Error)>),

    /// Storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns true if the error (or every aggregated child error) is a cancellation
    pub fn is_cancelled(&self) -> bool {
        match self {
            Error::Cancelled(_) => true,
            Error::Aggregate(children) => {
                !children.is_empty() && children.iter().all(|(_, err)| err.is_cancelled())
            }
            _ => false,
        }
    }
}

fn display_aggregate(errors: &[(StorageId, Error)]) -> String {
    let details: Vec<String> = errors
        .iter()
        .map(|(id, err)| format!("storage \"{}\": {}", id, err))
        .collect();
    format!("{} storage(s) failed: {}", errors.len(), details.join("; "))
}

/// Result type alias for pubpoll operations
pub type Result<T> = std::result::Result<T, Error>;
