//! Error module
//!
//! Defines the errors that can occur while extracting, emitting and
//! checkpointing backend records.

use std::io;
use thiserror::Error;

/// Result type for crmtrail operations
pub type Result<T> = std::result::Result<T, CrmTrailError>;

/// Errors that can occur in crmtrail
#[derive(Error, Debug)]
pub enum CrmTrailError {
    /// Missing or malformed setting, or an unreadable watermark
    #[error("Configuration error: {0}")]
    Config(String),

    /// A single connection attempt failed (bad credential, unreachable backend)
    #[error("Connection error: {0}")]
    Connection(String),

    /// Every connection candidate failed for one operation
    #[error("Backend unavailable for {operation} after {attempts} attempt(s)")]
    Unavailable {
        /// Operation that could not be served
        operation: String,
        /// Number of candidates tried
        attempts: usize,
    },

    /// The backend rejected or failed a query
    #[error("Query error: {0}")]
    Query(String),

    /// Checkpoint or state store failure
    #[error("State error: {0}")]
    State(String),

    /// Telemetry sink failure
    #[error("Telemetry error: {0}")]
    Telemetry(String),

    /// Serialization / deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Serde JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Serde YAML error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CrmTrailError::Config("missing backend url".to_string());
        assert_eq!(format!("{}", err), "Configuration error: missing backend url");

        let err = CrmTrailError::Unavailable {
            operation: "RetrieveMultiple(plugintracelog)".to_string(),
            attempts: 3,
        };
        assert_eq!(
            err.to_string(),
            "Backend unavailable for RetrieveMultiple(plugintracelog) after 3 attempt(s)"
        );
    }

    #[test]
    fn test_from_io_error() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "File not found");
        let err: CrmTrailError = io_err.into();
        assert!(matches!(err, CrmTrailError::Io(_)));
    }
}
