//! Error types for lock acquisition and lock providers

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Classification of a failed lock operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LockErrorKind {
    /// All attempts were exhausted or the acquisition deadline passed
    Timeout,
    /// Granting the request would close a wait-for cycle, or the waiter was aborted
    DeadlockDetected,
    /// The lock provider failed or is unreachable
    ConnectionError,
    /// Malformed request
    ValidationError,
}

impl fmt::Display for LockErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LockErrorKind::Timeout => "timeout",
            LockErrorKind::DeadlockDetected => "deadlock_detected",
            LockErrorKind::ConnectionError => "connection_error",
            LockErrorKind::ValidationError => "validation_error",
        };
        f.write_str(s)
    }
}

/// Structured failure returned from `acquire_lock`
#[derive(Debug, Clone, Error, Serialize)]
#[error("{kind}: {message} (resource={resource_id}, owner={owner_id})")]
pub struct LockError {
    pub kind: LockErrorKind,
    pub message: String,
    pub resource_id: String,
    pub owner_id: String,
    pub timestamp: DateTime<Utc>,
}

impl LockError {
    pub fn new(
        kind: LockErrorKind,
        message: impl Into<String>,
        resource_id: impl Into<String>,
        owner_id: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            resource_id: resource_id.into(),
            owner_id: owner_id.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Failure reported by a [`LockProvider`](crate::provider::LockProvider)
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("Lock provider is not connected")]
    NotConnected,

    #[error("Lock provider connection failed: {0}")]
    Connection(String),

    #[error("Lock provider error: {0}")]
    Backend(String),
}
