//! Error types for the JivaVolume operator
//!
//! Provides structured error types for all operator components and maps each
//! error onto a requeue decision so reconciliation failures feed the worker
//! pool's backoff policy instead of crashing a worker.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the operator
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Kubernetes Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("State store call timed out: {operation}")]
    Timeout { operation: &'static str },

    // =========================================================================
    // Spec Validation Errors
    // =========================================================================
    #[error("Invalid spec for volume {volume}: {reason}")]
    InvalidSpec { volume: String, reason: String },

    #[error("Capacity parse error: {0}")]
    CapacityParse(String),

    // =========================================================================
    // Jiva Controller API Errors
    // =========================================================================
    #[error("Jiva controller API error: {0}")]
    TargetApi(#[from] reqwest::Error),

    #[error("Jiva controller response parse error: {0}")]
    TargetResponseParse(String),

    // =========================================================================
    // Teardown Errors
    // =========================================================================
    #[error("Deletion pending for volume {volume}: {remaining} sub-resources still present")]
    DeletionPending { volume: String, remaining: usize },

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),
}

/// Action to take on error during reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Requeue with exponential backoff
    RequeueWithBackoff,
    /// Requeue after specific duration
    RequeueAfter(Duration),
    /// Don't requeue, wait for changes
    NoRequeue,
}

impl Error {
    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Transient errors - retry with backoff
            Error::Kube(_) | Error::Timeout { .. } | Error::TargetApi(_) => {
                ErrorAction::RequeueWithBackoff
            }

            // Teardown still draining - keep retrying with backoff, never
            // drop the volume record while children remain
            Error::DeletionPending { .. } => ErrorAction::RequeueWithBackoff,

            // Controller answered with a payload we do not understand
            // (likely engine version skew) - medium retry
            Error::TargetResponseParse(_) => ErrorAction::RequeueAfter(Duration::from_secs(30)),

            // Configuration/validation errors - don't retry automatically
            Error::Configuration(_) | Error::InvalidSpec { .. } | Error::CapacityParse(_) => {
                ErrorAction::NoRequeue
            }

            // All other errors - retry with backoff
            _ => ErrorAction::RequeueWithBackoff,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRequeue)
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Kube(_) | Error::Timeout { .. } | Error::TargetApi(_)
        )
    }

    /// Check if this error is a version conflict from an optimistic write
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(resp)) if resp.code == 409)
    }
}

/// Result type alias for the operator
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_actions() {
        let err = Error::Timeout { operation: "get" };
        assert_eq!(err.action(), ErrorAction::RequeueWithBackoff);

        let err = Error::InvalidSpec {
            volume: "pvc-1".into(),
            reason: "replicationFactor must be >= 1".into(),
        };
        assert_eq!(err.action(), ErrorAction::NoRequeue);

        let err = Error::TargetResponseParse("unexpected mode".into());
        assert_eq!(
            err.action(),
            ErrorAction::RequeueAfter(Duration::from_secs(30))
        );

        let err = Error::DeletionPending {
            volume: "pvc-1".into(),
            remaining: 3,
        };
        assert_eq!(err.action(), ErrorAction::RequeueWithBackoff);
    }

    #[test]
    fn test_error_retryable() {
        let stuck = Error::DeletionPending {
            volume: "pvc-1".into(),
            remaining: 1,
        };
        assert!(stuck.is_retryable());
        assert!(!stuck.is_transient());

        let config_err = Error::Configuration("invalid".into());
        assert!(!config_err.is_retryable());
        assert!(!config_err.is_transient());

        let spec_err = Error::CapacityParse("10Xi".into());
        assert!(!spec_err.is_retryable());
    }

    #[test]
    fn test_conflict_detection() {
        let resp = kube::error::ErrorResponse {
            status: "Failure".into(),
            message: "conflict".into(),
            reason: "Conflict".into(),
            code: 409,
        };
        let err = Error::Kube(kube::Error::Api(resp));
        assert!(err.is_conflict());
        assert!(err.is_transient());

        let err = Error::Internal("boom".into());
        assert!(!err.is_conflict());
    }
}
