//! Controller-specific error types.
//!
//! This module defines the error type shared by the reconciler, the
//! Kubernetes adapters and the controller runtime. Library errors convert into
//! it with `?`.

use crate::ipam::AllocatorError;
use kube::Error as KubeError;
use nbdb_client::NbdbError;
use thiserror::Error;

/// Errors that can occur in the pod network controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Northbound database error outside a port transaction
    #[error("Northbound database error: {0}")]
    Nbdb(#[from] NbdbError),

    /// Address allocator error
    #[error("Address allocation error: {0}")]
    Allocator(#[from] AllocatorError),

    /// Invalid configuration or malformed input (not retried)
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// The node's logical switch is not known yet
    #[error("Logical switch not ready: {0}")]
    SwitchUnknown(String),

    /// A database call or the switch readiness wait ran out of time
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The port transaction was rejected; nothing was applied
    #[error("Transaction failed: {0}")]
    TransactionFailed(String),

    /// Pod or node annotation could not be parsed or encoded
    #[error("Invalid annotation: {0}")]
    Annotation(String),

    /// Metric registration failed
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),
}

impl ControllerError {
    /// Whether the failed operation should be queued for another attempt.
    ///
    /// Configuration and malformed-input errors are surfaced to the operator
    /// and not retried; everything transient is.
    pub fn is_retryable(&self) -> bool {
        match self {
            ControllerError::Config(_)
            | ControllerError::Annotation(_)
            | ControllerError::Metrics(_) => false,
            ControllerError::Allocator(err) => matches!(
                err,
                AllocatorError::SwitchUnknown(_) | AllocatorError::PoolExhausted { .. }
            ),
            ControllerError::Nbdb(err) => !matches!(
                err,
                NbdbError::InvalidOperation(_) | NbdbError::UnexpectedRow { .. }
            ),
            ControllerError::Kube(_)
            | ControllerError::SwitchUnknown(_)
            | ControllerError::Timeout(_)
            | ControllerError::TransactionFailed(_)
            | ControllerError::Watch(_) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipam::IpFamily;

    #[test]
    fn test_config_errors_are_not_retried() {
        assert!(!ControllerError::Config("bad subnet".to_string()).is_retryable());
        let out_of_range = AllocatorError::OutOfRange {
            switch: "node1".to_string(),
            address: "10.9.9.9".parse().unwrap(),
        };
        assert!(!ControllerError::from(out_of_range).is_retryable());
    }

    #[test]
    fn test_transient_errors_are_retried() {
        assert!(ControllerError::Timeout("nbdb get".to_string()).is_retryable());
        assert!(ControllerError::TransactionFailed("node1".to_string()).is_retryable());
        let exhausted = AllocatorError::PoolExhausted {
            switch: "node1".to_string(),
            family: IpFamily::V4,
        };
        assert!(ControllerError::from(exhausted).is_retryable());
    }
}
