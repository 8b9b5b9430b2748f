//! Error types for the indexq domain model.

use thiserror::Error;

/// Unified error type for domain-level validation and loading.
#[derive(Debug, Error)]
pub enum TypesError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid input error
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Session cursor would not move forward
    #[error("Invalid cursor for session {session_id}: {reason}")]
    InvalidCursor { session_id: String, reason: String },

    /// Illegal session state transition
    #[error("Invalid session transition: {0}")]
    InvalidTransition(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TypesError::Config("missing db_path".to_string());
        assert_eq!(err.to_string(), "Configuration error: missing db_path");

        let err = TypesError::InvalidCursor {
            session_id: "s1".to_string(),
            reason: "went backwards".to_string(),
        };
        assert!(err.to_string().contains("s1"));
        assert!(err.to_string().contains("went backwards"));
    }
}
