//! Error types for the judgeloop evaluation engine
//!
//! This module provides comprehensive error handling using thiserror for
//! structured error definitions and anyhow for error propagation.

use thiserror::Error;

/// Main error type for judgeloop operations
#[derive(Error, Debug)]
pub enum JudgeloopError {
    /// Judge provider call failed
    #[error("Provider error: {0}")]
    Provider(String),

    /// Judge call exceeded its deadline
    #[error("Judge call timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Judge output did not match the expected structured shape
    #[error("Parse error: {0}")]
    Parse(String),

    /// Referenced endpoint, record, evaluator or version is missing
    #[error("Not found: {0}")]
    NotFound(String),

    /// Operation conflicts with the current persisted state
    #[error("State conflict: {0}")]
    StateConflict(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP request error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl JudgeloopError {
    /// Status code reported by the control surface for this error
    pub fn status_code(&self) -> u16 {
        match self {
            JudgeloopError::NotFound(_) => 404,
            JudgeloopError::StateConflict(_) => 409,
            JudgeloopError::Provider(_) | JudgeloopError::Parse(_) => 400,
            JudgeloopError::InvalidConfig(_) | JudgeloopError::Config(_) => 422,
            JudgeloopError::Timeout(_) => 504,
            JudgeloopError::Http(_) => 502,
            _ => 500,
        }
    }

    /// Whether a retry of the same call may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            JudgeloopError::Provider(_)
                | JudgeloopError::Timeout(_)
                | JudgeloopError::Http(_)
                | JudgeloopError::Parse(_)
        )
    }
}

/// Result type alias for judgeloop operations
pub type Result<T> = std::result::Result<T, JudgeloopError>;

/// Convert anyhow::Error to JudgeloopError
impl From<anyhow::Error> for JudgeloopError {
    fn from(err: anyhow::Error) -> Self {
        JudgeloopError::Other(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = JudgeloopError::NotFound("endpoint 42".to_string());
        assert_eq!(err.to_string(), "Not found: endpoint 42");
    }

    #[test]
    fn test_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("{not json");
        assert!(json_err.is_err());

        let err: JudgeloopError = json_err.unwrap_err().into();
        assert!(matches!(err, JudgeloopError::Serialization(_)));
        assert_eq!(err.status_code(), 500);
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(JudgeloopError::NotFound("x".into()).status_code(), 404);
        assert_eq!(JudgeloopError::Provider("x".into()).status_code(), 400);
        assert_eq!(JudgeloopError::StateConflict("x".into()).status_code(), 409);
    }

    #[test]
    fn test_retryable() {
        assert!(JudgeloopError::Timeout(std::time::Duration::from_secs(1)).is_retryable());
        assert!(!JudgeloopError::NotFound("x".into()).is_retryable());
    }
}
