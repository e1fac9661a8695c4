/*!
 * Error types for Tether
 */

use serde::Serialize;
use std::fmt;
use tether_core_discovery::DiscoveryError;
use tether_core_locking::{LockError, LockErrorKind, ProviderError};
use tether_core_resilience::ResilienceError;
use tether_core_resources::ResourceError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, TetherError>;

#[derive(Debug, Error)]
pub enum TetherError {
    #[error(transparent)]
    Resilience(#[from] ResilienceError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    LockProvider(#[from] ProviderError),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error(transparent)]
    Resource(#[from] ResourceError),

    /// Unreadable or malformed configuration file
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration values that parse but make no sense together
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Caller-facing failure classification shared by every component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    DeadlockDetected,
    ConnectionError,
    Timeout,
    ResourceLimitsExceeded,
    InsufficientResources,
    NotFound,
    ValidationError,
    /// Refused by an open or saturated circuit breaker
    CircuitOpen,
    /// The protected operation itself failed
    OperationFailed,
    Io,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::DeadlockDetected => "deadlock_detected",
            ErrorKind::ConnectionError => "connection_error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ResourceLimitsExceeded => "resource_limits_exceeded",
            ErrorKind::InsufficientResources => "insufficient_resources",
            ErrorKind::NotFound => "not_found",
            ErrorKind::ValidationError => "validation_error",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::OperationFailed => "operation_failed",
            ErrorKind::Io => "io",
        };
        f.write_str(s)
    }
}

impl TetherError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TetherError::Resilience(e) if e.is_rejection() => ErrorKind::CircuitOpen,
            TetherError::Resilience(e) if e.is_timeout() => ErrorKind::Timeout,
            TetherError::Resilience(_) => ErrorKind::OperationFailed,
            TetherError::Lock(e) => match e.kind {
                LockErrorKind::Timeout => ErrorKind::Timeout,
                LockErrorKind::DeadlockDetected => ErrorKind::DeadlockDetected,
                LockErrorKind::ConnectionError => ErrorKind::ConnectionError,
                LockErrorKind::ValidationError => ErrorKind::ValidationError,
            },
            TetherError::LockProvider(_) => ErrorKind::ConnectionError,
            TetherError::Discovery(e) => match e {
                DiscoveryError::NotFound(_) => ErrorKind::NotFound,
                DiscoveryError::Validation(_) => ErrorKind::ValidationError,
                DiscoveryError::Connection(_) => ErrorKind::ConnectionError,
            },
            TetherError::Resource(e) => match e {
                ResourceError::LimitsExceeded(_) => ErrorKind::ResourceLimitsExceeded,
                ResourceError::InsufficientResources(_) => ErrorKind::InsufficientResources,
                ResourceError::NotFound(_) => ErrorKind::NotFound,
                ResourceError::Connection(_) => ErrorKind::ConnectionError,
                ResourceError::Validation(_) => ErrorKind::ValidationError,
            },
            TetherError::Config(_) | TetherError::Validation(_) => ErrorKind::ValidationError,
            TetherError::Io(_) => ErrorKind::Io,
        }
    }

    /// Worth retrying after a delay
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Timeout | ErrorKind::ConnectionError | ErrorKind::CircuitOpen
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_kind_mapping() {
        let lock: TetherError =
            LockError::new(LockErrorKind::DeadlockDetected, "cycle", "r1", "a").into();
        assert_eq!(lock.kind(), ErrorKind::DeadlockDetected);

        let res: TetherError = ResourceError::LimitsExceeded("cpu".into()).into();
        assert_eq!(res.kind(), ErrorKind::ResourceLimitsExceeded);
        assert_eq!(res.kind().to_string(), "resource_limits_exceeded");

        let missing: TetherError = DiscoveryError::NotFound("svc".into()).into();
        assert_eq!(missing.kind(), ErrorKind::NotFound);

        let provider: TetherError = ProviderError::NotConnected.into();
        assert_eq!(provider.kind(), ErrorKind::ConnectionError);
        assert!(provider.is_transient());
    }

    #[test]
    fn test_resilience_mapping() {
        let open: TetherError = ResilienceError::CircuitOpen("db".into()).into();
        assert_eq!(open.kind(), ErrorKind::CircuitOpen);

        let slow: TetherError = ResilienceError::Timeout {
            duration: Duration::from_millis(10),
            message: "slow".into(),
        }
        .into();
        assert_eq!(slow.kind(), ErrorKind::Timeout);

        let failed: TetherError = ResilienceError::Permanent("bad input".into()).into();
        assert_eq!(failed.kind(), ErrorKind::OperationFailed);
        assert!(!failed.is_transient());
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&ErrorKind::InsufficientResources).unwrap(),
            "\"insufficient_resources\""
        );
        assert_eq!(
            TetherError::Validation("x".into()).kind(),
            ErrorKind::ValidationError
        );
    }
}
