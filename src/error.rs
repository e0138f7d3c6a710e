//! Error taxonomy shared by the control loop and its collaborators.
//!
//! Each layer has its own error enum (`BridgeError`, `ProviderError`, ...).
//! All of them collapse to a flat [`ErrorKind`] that the recovery controller
//! uses to pick between local retry, replanning and termination.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Flat classification of every failure the loop can observe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// The device could not be reached (disconnected, offline, capture timed out)
    BridgeUnavailable,
    /// The device rejected or failed a primitive action
    BridgeActionFailed,
    /// The reasoning provider did not answer within its timeout
    ProviderTimeout,
    /// The reasoning provider could not be reached or returned a transport error
    ProviderUnavailable,
    /// The reasoning provider answered with output that violates the schema
    ProviderMalformedOutput,
    /// An element reference no longer resolves on the current screen
    StaleReference,
    /// A coordinate lies outside the known screen bounds
    OutOfBounds,
    /// The validator could not decide whether the goal holds
    GoalUnverifiable,
}

impl ErrorKind {
    /// Transient kinds are retried in place; all others consume the failure budget.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ErrorKind::BridgeUnavailable | ErrorKind::ProviderTimeout | ErrorKind::ProviderUnavailable
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::BridgeUnavailable => "BridgeUnavailable",
            ErrorKind::BridgeActionFailed => "BridgeActionFailed",
            ErrorKind::ProviderTimeout => "ProviderTimeout",
            ErrorKind::ProviderUnavailable => "ProviderUnavailable",
            ErrorKind::ProviderMalformedOutput => "ProviderMalformedOutput",
            ErrorKind::StaleReference => "StaleReference",
            ErrorKind::OutOfBounds => "OutOfBounds",
            ErrorKind::GoalUnverifiable => "GoalUnverifiable",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result type for device bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Errors raised by a device bridge
#[derive(Debug, Clone, thiserror::Error)]
pub enum BridgeError {
    /// Device is disconnected, offline or its tooling is missing
    #[error("device unavailable: {0}")]
    Unavailable(String),

    /// Device call did not finish in time
    #[error("device call timed out after {0:?}")]
    Timeout(Duration),

    /// Device executed the call but reported failure
    #[error("device action failed: {0}")]
    ActionFailed(String),

    /// Capture or hierarchy output could not be decoded
    #[error("invalid device output: {0}")]
    InvalidOutput(String),
}

impl BridgeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BridgeError::Unavailable(_) | BridgeError::Timeout(_) => ErrorKind::BridgeUnavailable,
            BridgeError::ActionFailed(_) | BridgeError::InvalidOutput(_) => {
                ErrorKind::BridgeActionFailed
            }
        }
    }
}

impl From<std::io::Error> for BridgeError {
    fn from(err: std::io::Error) -> Self {
        BridgeError::Unavailable(err.to_string())
    }
}

/// Result type for reasoning provider calls
pub type ProviderResult<T> = Result<T, ProviderError>;

/// Errors raised by a reasoning provider backend
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    /// No answer within the allowed time
    #[error("provider timed out after {0:?}")]
    Timeout(Duration),

    /// Endpoint unreachable or returned a retryable HTTP status
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    /// Endpoint answered with a body that is not a completion
    #[error("invalid provider response: {0}")]
    InvalidResponse(String),
}

impl ProviderError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProviderError::Timeout(_) => ErrorKind::ProviderTimeout,
            ProviderError::Unavailable(_) => ErrorKind::ProviderUnavailable,
            ProviderError::InvalidResponse(_) => ErrorKind::ProviderMalformedOutput,
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::Timeout(Duration::ZERO)
        } else if err.is_decode() {
            ProviderError::InvalidResponse(err.to_string())
        } else {
            ProviderError::Unavailable(err.to_string())
        }
    }
}

/// Errors produced while asking the planner for the next action
#[derive(Debug, Clone, thiserror::Error)]
pub enum PlanError {
    /// Every configured provider failed to answer
    #[error("no provider answered: {0}")]
    Provider(#[from] ProviderError),

    /// A provider answered but the answer violates the action schema
    #[error("malformed proposal: {0}")]
    Malformed(String),

    /// No providers were configured
    #[error("no reasoning providers configured")]
    NoProviders,
}

impl PlanError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PlanError::Provider(err) => err.kind(),
            PlanError::Malformed(_) => ErrorKind::ProviderMalformedOutput,
            PlanError::NoProviders => ErrorKind::ProviderUnavailable,
        }
    }
}

/// Errors produced by a result validator
#[derive(Debug, Clone, thiserror::Error)]
pub enum ValidationError {
    /// The validator's own sub-call failed
    #[error("validation call failed: {0}")]
    Provider(#[from] ProviderError),

    /// The validator answered but the verdict could not be read
    #[error("unreadable verdict: {0}")]
    Unreadable(String),

    /// The validator did not finish in time
    #[error("validation timed out after {0:?}")]
    Timeout(Duration),
}

impl ValidationError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::GoalUnverifiable
    }
}

/// Rejected loop configuration
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_kinds() {
        assert!(ErrorKind::BridgeUnavailable.is_transient());
        assert!(ErrorKind::ProviderTimeout.is_transient());
        assert!(ErrorKind::ProviderUnavailable.is_transient());
        assert!(!ErrorKind::BridgeActionFailed.is_transient());
        assert!(!ErrorKind::StaleReference.is_transient());
        assert!(!ErrorKind::ProviderMalformedOutput.is_transient());
        assert!(!ErrorKind::GoalUnverifiable.is_transient());
    }

    #[test]
    fn test_bridge_error_classification() {
        assert_eq!(
            BridgeError::Timeout(Duration::from_secs(1)).kind(),
            ErrorKind::BridgeUnavailable
        );
        assert_eq!(
            BridgeError::ActionFailed("boom".into()).kind(),
            ErrorKind::BridgeActionFailed
        );
    }

    #[test]
    fn test_plan_error_classification() {
        assert_eq!(
            PlanError::Malformed("x".into()).kind(),
            ErrorKind::ProviderMalformedOutput
        );
        assert_eq!(
            PlanError::Provider(ProviderError::Timeout(Duration::from_secs(2))).kind(),
            ErrorKind::ProviderTimeout
        );
    }

    #[test]
    fn test_kind_serializes_as_name() {
        let json = serde_json::to_string(&ErrorKind::StaleReference).unwrap();
        assert_eq!(json, "\"StaleReference\"");
    }
}
