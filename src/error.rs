//! Error types for the DevServer Kubernetes operator.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur during operator operations.
#[derive(Debug, Error)]
pub enum OperatorError {
    /// Kubernetes API error.
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Referenced DevServerFlavor does not exist.
    #[error("DevServerFlavor '{name}' not found")]
    FlavorNotFound {
        /// Flavor name.
        name: String,
    },

    /// Referenced shared volume claim does not exist.
    #[error("Shared volume claim '{name}' not found")]
    SharedClaimMissing {
        /// Claim name.
        name: String,
    },

    /// Malformed time-to-live duration in the spec.
    #[error("Invalid duration '{value}': expected one or more <integer><unit> tokens with units d, h, m, s")]
    InvalidDuration {
        /// The rejected input.
        value: String,
    },

    /// Spec validation error.
    #[error("Validation failed: {0}")]
    ValidationError(String),

    /// Attempt to change a field that is immutable after first reconcile.
    #[error("Field '{field}' is immutable after first reconcile")]
    ImmutableField {
        /// Field name.
        field: String,
    },

    /// Serialization error.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// The per-reconcile deadline elapsed.
    #[error("Reconcile deadline exceeded")]
    DeadlineExceeded,

    /// Error from the finalizer machinery.
    #[error("Finalizer error: {0}")]
    FinalizerError(String),

    /// Host key generation failed.
    #[error("Host key generation failed: {0}")]
    HostKeyError(String),

    /// The leader-election lease was lost or could not be renewed.
    #[error("Leader election failed: {0}")]
    LeaseError(String),
}

/// Result type for operator operations.
pub type OperatorResult<T> = Result<T, OperatorError>;

/// How a failed reconcile should be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retry {
    /// Transient failure, requeue with the controller's backoff.
    Backoff,
    /// Unsatisfied precondition, requeue after the given delay.
    After(Duration),
    /// Permanent for this spec generation, wait for the object to change.
    AwaitChange,
    /// Unrecoverable; the process should exit and be restarted.
    Fatal,
}

impl OperatorError {
    /// Classify this error for requeue purposes.
    pub fn retry(&self) -> Retry {
        match self {
            OperatorError::KubeError(_)
            | OperatorError::SerializationError(_)
            | OperatorError::DeadlineExceeded
            | OperatorError::FinalizerError(_)
            | OperatorError::HostKeyError(_) => Retry::Backoff,
            OperatorError::FlavorNotFound { .. } | OperatorError::SharedClaimMissing { .. } => {
                Retry::After(Duration::from_secs(300))
            }
            OperatorError::InvalidDuration { .. }
            | OperatorError::ValidationError(_)
            | OperatorError::ImmutableField { .. } => Retry::AwaitChange,
            OperatorError::LeaseError(_) => Retry::Fatal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_backoff() {
        let err = OperatorError::DeadlineExceeded;
        assert_eq!(err.retry(), Retry::Backoff);
    }

    #[test]
    fn missing_flavor_requeues_after_five_minutes() {
        let err = OperatorError::FlavorNotFound {
            name: "gpu-large".into(),
        };
        assert_eq!(err.retry(), Retry::After(Duration::from_secs(300)));
    }

    #[test]
    fn validation_errors_wait_for_spec_change() {
        let err = OperatorError::InvalidDuration { value: "2x".into() };
        assert_eq!(err.retry(), Retry::AwaitChange);
    }

    #[test]
    fn lease_loss_is_fatal() {
        let err = OperatorError::LeaseError("lease stolen".into());
        assert_eq!(err.retry(), Retry::Fatal);
    }
}
