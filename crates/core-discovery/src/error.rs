//! Error types for service discovery

use thiserror::Error;

pub type Result<T> = std::result::Result<T, DiscoveryError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DiscoveryError {
    /// Unknown service id
    #[error("Service not found: {0}")]
    NotFound(String),

    /// Malformed registration or query
    #[error("Invalid registration: {0}")]
    Validation(String),

    /// The registry backend failed or is unreachable
    #[error("Registry connection error: {0}")]
    Connection(String),
}
