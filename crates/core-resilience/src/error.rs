//! Error types for the resilience module

use std::time::Duration;
use thiserror::Error;

/// Errors produced by protected operations and by the circuit breaker itself
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ResilienceError {
    /// Circuit breaker is open, rejecting requests
    #[error("Circuit breaker '{0}' is OPEN, rejecting requests")]
    CircuitOpen(String),

    /// Half-open probe window is saturated
    #[error("Circuit breaker '{0}' is HALF_OPEN and all trial slots are in use")]
    HalfOpenSaturated(String),

    /// Transient error that may be retried
    #[error("Transient error: {0}")]
    Transient(String),

    /// Permanent error that should not be retried
    #[error("Permanent error: {0}")]
    Permanent(String),

    /// Caller-classified error; `kind` is matched against retry allow/deny lists
    #[error("{kind}: {message}")]
    Operation { kind: String, message: String },

    /// The operation did not complete before its deadline
    #[error("{message} (after {duration:?})")]
    Timeout { duration: Duration, message: String },

    /// The fallback did not complete before its deadline
    #[error("Fallback timeout after {0:?}")]
    FallbackTimeout(Duration),

    /// Fallback was enabled but neither a function nor a value was supplied
    #[error("No fallback configured")]
    NoFallback,
}

impl ResilienceError {
    /// Shorthand for a caller-classified error
    pub fn operation(kind: impl Into<String>, message: impl Into<String>) -> Self {
        ResilienceError::Operation {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Name used when matching retryable / non-retryable error lists
    pub fn kind(&self) -> &str {
        match self {
            ResilienceError::CircuitOpen(_) => "CircuitOpen",
            ResilienceError::HalfOpenSaturated(_) => "HalfOpenSaturated",
            ResilienceError::Transient(_) => "Transient",
            ResilienceError::Permanent(_) => "Permanent",
            ResilienceError::Operation { kind, .. } => kind,
            ResilienceError::Timeout { .. } => "Timeout",
            ResilienceError::FallbackTimeout(_) => "FallbackTimeout",
            ResilienceError::NoFallback => "NoFallback",
        }
    }

    /// Check if this error is transient and can be retried
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ResilienceError::Transient(_) | ResilienceError::Timeout { .. }
        )
    }

    /// Check if this error was a rejection by the breaker rather than an operation failure
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            ResilienceError::CircuitOpen(_) | ResilienceError::HalfOpenSaturated(_)
        )
    }

    /// Check if this error is a timeout of either the operation or its fallback
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            ResilienceError::Timeout { .. } | ResilienceError::FallbackTimeout(_)
        )
    }
}
