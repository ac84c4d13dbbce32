//! Error types for coursehub.

use serde::Serialize;
use thiserror::Error;

/// A shared error type for the entire coursehub workspace.
///
/// This provides typed, structured error variants with automatic conversion
/// from common error types via the `From` trait.
#[derive(Error, Debug, Clone, Serialize)]
pub enum CourseHubError {
    /// Entity not found error with type information
    #[error("Entity not found: {entity_type} '{id}'")]
    NotFound {
        entity_type: &'static str,
        id: String,
    },

    /// IO error (file system operations)
    #[error("IO error: {message}")]
    Io { message: String },

    /// Serialization/deserialization error
    #[error("Serialization error: {format} - {message}")]
    Serialization {
        format: String, // "TOML", "JSON", etc.
        message: String,
    },

    /// Configuration error. Fatal before any session is launched.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Directory service protocol error
    #[error("Directory service error: {0}")]
    Directory(String),

    /// Orchestrator API error with the raw detail preserved
    #[error("Orchestrator error{}: {message}", .status_code.map(|c| format!(" ({c})")).unwrap_or_default())]
    Orchestrator {
        status_code: Option<u16>,
        message: String,
    },

    /// Consistency violation (duplicate task, vanished record, ...)
    #[error("Consistency violation: {0}")]
    Consistency(String),

    /// A session launch ended in the `Failed` state
    #[error("Launch of service '{service}' failed: {status}")]
    LaunchFailed { service: String, status: String },

    /// A state transition the lifecycle does not allow
    #[error("Invalid session transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    /// The caller cancelled or timed out an operation
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Internal error (should not happen in normal operation)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CourseHubError {
    // ============================================================================
    // Constructor helpers
    // ============================================================================

    /// Creates a NotFound error
    pub fn not_found(entity_type: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type,
            id: id.into(),
        }
    }

    /// Creates an IO error
    pub fn io(message: impl Into<String>) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    /// Creates a Config error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Creates a Directory error
    pub fn directory(message: impl Into<String>) -> Self {
        Self::Directory(message.into())
    }

    /// Creates a Consistency error
    pub fn consistency(message: impl Into<String>) -> Self {
        Self::Consistency(message.into())
    }

    /// Creates an Internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    // ============================================================================
    // Type checking methods
    // ============================================================================

    /// Check if this is a NotFound error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Check if this is a config error
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    /// Check if this is a consistency violation
    pub fn is_consistency(&self) -> bool {
        matches!(self, Self::Consistency(_))
    }

    /// Check if this error came from a cancelled or timed-out operation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }
}

// ============================================================================
// From implementations for automatic conversion
// ============================================================================

impl From<std::io::Error> for CourseHubError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            return Self::not_found("path", err.to_string());
        }
        Self::Io {
            message: format!("{} (kind: {:?})", err, err.kind()),
        }
    }
}

impl From<serde_json::Error> for CourseHubError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            format: "JSON".to_string(),
            message: err.to_string(),
        }
    }
}

impl From<toml::de::Error> for CourseHubError {
    fn from(err: toml::de::Error) -> Self {
        Self::Serialization {
            format: "TOML".to_string(),
            message: err.to_string(),
        }
    }
}

impl From<toml::ser::Error> for CourseHubError {
    fn from(err: toml::ser::Error) -> Self {
        Self::Serialization {
            format: "TOML".to_string(),
            message: err.to_string(),
        }
    }
}

/// Conversion from anyhow::Error (used at adapter boundaries)
impl From<anyhow::Error> for CourseHubError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

/// A type alias for `Result<T, CourseHubError>`.
pub type Result<T> = std::result::Result<T, CourseHubError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_not_found_maps_to_not_found() {
        let err: CourseHubError =
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert!(err.is_not_found());

        let err: CourseHubError =
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope").into();
        assert!(matches!(err, CourseHubError::Io { .. }));
    }

    #[test]
    fn test_orchestrator_error_display_keeps_status_code() {
        let err = CourseHubError::Orchestrator {
            status_code: Some(500),
            message: "swarm unavailable".to_string(),
        };
        assert_eq!(err.to_string(), "Orchestrator error (500): swarm unavailable");

        let err = CourseHubError::Orchestrator {
            status_code: None,
            message: "connection refused".to_string(),
        };
        assert_eq!(err.to_string(), "Orchestrator error: connection refused");
    }
}
