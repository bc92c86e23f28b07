//! Error types for the protection engine
//!
//! Only the configuration surface and the dispatcher internals ever see these;
//! the event pipeline converts every failure into a log line or a drop.

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur inside the protection engine
#[derive(Debug, Error)]
pub enum ProtectionError {
    /// Discord API error
    #[error("Discord API error: {0}")]
    Platform(#[from] Box<serenity::Error>),

    /// An external call did not complete in time
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// The configuration store could not be read
    #[error("Configuration store unavailable: {0}")]
    StoreUnavailable(String),

    /// The configuration store could not be written
    #[error("Failed to persist configuration: {0}")]
    Persistence(String),

    /// Thresholds start at one
    #[error("Invalid threshold: {0} (must be at least 1)")]
    InvalidThreshold(u32),

    /// Protection was never enabled for this community
    #[error("Protection is not enabled for community {0}")]
    NotEnabled(u64),

    /// Failed to resolve the member being punished
    #[error("Member {actor_id} not found in community {community_id}")]
    MemberNotFound { community_id: u64, actor_id: u64 },

    /// Generic error
    #[error("Protection error: {0}")]
    Other(String),
}

impl From<serenity::Error> for ProtectionError {
    fn from(error: serenity::Error) -> Self {
        Self::Platform(Box::new(error))
    }
}

impl From<serde_yaml::Error> for ProtectionError {
    fn from(error: serde_yaml::Error) -> Self {
        Self::Persistence(error.to_string())
    }
}

impl From<std::io::Error> for ProtectionError {
    fn from(error: std::io::Error) -> Self {
        Self::Persistence(error.to_string())
    }
}

/// Convert a string into a `ProtectionError`
impl From<String> for ProtectionError {
    fn from(message: String) -> Self {
        Self::Other(message)
    }
}

/// Result type for protection operations
pub type ProtectionResult<T> = Result<T, ProtectionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = ProtectionError::InvalidThreshold(0);
        assert_eq!(error.to_string(), "Invalid threshold: 0 (must be at least 1)");

        let error = ProtectionError::NotEnabled(42);
        assert_eq!(error.to_string(), "Protection is not enabled for community 42");

        let error = ProtectionError::MemberNotFound {
            community_id: 1,
            actor_id: 2,
        };
        assert_eq!(error.to_string(), "Member 2 not found in community 1");

        let error = ProtectionError::from("Something went wrong".to_string());
        assert_eq!(error.to_string(), "Protection error: Something went wrong");
    }

    #[test]
    fn test_io_error_is_persistence() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only");
        let error = ProtectionError::from(io);
        assert!(matches!(error, ProtectionError::Persistence(_)));
    }
}
