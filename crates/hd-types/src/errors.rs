use thiserror::Error;

/// Main error type for hyperdrive.
///
/// Construction-time variants (`InvalidArgument`,
/// `UnsupportedDistributionForStrategy`) are raised before any network call.
/// The remaining variants come back from the control plane or from waiting on
/// a run.
#[derive(Error, Debug)]
pub enum HdError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Distribution '{distribution}' for parameter '{parameter}' is not supported by {strategy} sampling")]
    UnsupportedDistributionForStrategy {
        parameter: String,
        distribution: String,
        strategy: String,
    },

    #[error("Submission rejected: {reason}")]
    SubmissionRejected { reason: String },

    #[error("Transport error: {message}")]
    Transport { message: String },

    #[error("No child run of {run_id} has reported the primary metric yet")]
    NoCompletedRuns { run_id: String },

    #[error("Run not found: {run_id}")]
    RunNotFound { run_id: String },

    #[error("Wait for run {run_id} was cancelled locally")]
    WaitCancelled { run_id: String },

    #[error("Run {run_id} did not reach a terminal state within {waited_secs} seconds")]
    WaitTimedOut { run_id: String, waited_secs: u64 },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl HdError {
    /// Whether the caller may retry the failed operation later.
    ///
    /// Nothing in hyperdrive retries on its own.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            HdError::Transport { .. } | HdError::NoCompletedRuns { .. } | HdError::WaitTimedOut { .. }
        )
    }
}

/// Result type alias for hyperdrive operations
pub type HdResult<T> = Result<T, HdError>;

/// Macro for creating invalid-argument errors
#[macro_export]
macro_rules! invalid_argument {
    ($($arg:tt)*) => {
        $crate::HdError::InvalidArgument(format!($($arg)*))
    };
}

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::HdError::Config(format!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = HdError::UnsupportedDistributionForStrategy {
            parameter: "lr".to_string(),
            distribution: "normal".to_string(),
            strategy: "GRID".to_string(),
        };

        let text = error.to_string();
        assert!(text.contains("lr"));
        assert!(text.contains("normal"));
        assert!(text.contains("GRID"));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(HdError::Transport { message: "reset".into() }.is_retryable());
        assert!(HdError::NoCompletedRuns { run_id: "r1".into() }.is_retryable());
        assert!(!HdError::SubmissionRejected { reason: "quota".into() }.is_retryable());
        assert!(!invalid_argument!("q must be positive").is_retryable());
    }

    #[test]
    fn test_serde_error_conversion() {
        let parse: Result<serde_json::Value, _> = serde_json::from_str("{");
        let err: HdError = parse.unwrap_err().into();

        match err {
            HdError::Serialization(_) => (),
            _ => panic!("Expected Serialization error"),
        }
    }

    #[test]
    fn test_macros() {
        let err = invalid_argument!("upper must be positive, got {}", -1);
        assert_eq!(err.to_string(), "Invalid argument: upper must be positive, got -1");

        let err = config_error!("missing {}", "HYPERDRIVE_ENDPOINT");
        assert!(matches!(err, HdError::Config(_)));
    }
}
