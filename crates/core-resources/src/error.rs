//! Error types for resource accounting

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ResourceError {
    /// A critical limit violation is active; nothing new is admitted until it clears
    #[error("Resource limits exceeded: {0}")]
    LimitsExceeded(String),

    /// The request does not fit in what is left
    #[error("Insufficient resources: {0}")]
    InsufficientResources(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

pub type Result<T> = std::result::Result<T, ResourceError>;
