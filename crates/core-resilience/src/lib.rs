//! Tether Core Resilience: Pure-logic failure isolation primitives
//!
//! # Overview
//!
//! This crate protects callers from dependencies that fail systemically. It includes:
//!
//! - **Circuit Breaker**: Fails fast while a dependency is unhealthy and re-probes it with
//!   a bounded number of half-open trial calls
//! - **Execution Policies**: Retry with exponential backoff, an overall timeout, and a
//!   fallback function or value
//! - **Circuit Breaker Manager**: Named registry that creates breakers on first use
//! - **Events**: Typed state-change and call events on a broadcast channel
//!
//! # Key Principles
//!
//! This crate is **pure logic** with zero knowledge of:
//! - The operations being protected
//! - Network protocols or storage backends
//! - Application-specific concerns
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │         Your Application                │
//! └─────────────┬───────────────────────────┘
//!               │ execute(op, policy)
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Circuit Breaker                   │  ← Admission gate
//! │  (CLOSED / OPEN / HALF_OPEN)            │
//! └─────────────┬───────────────────────────┘
//!               │ admitted
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Timeout ( Retry ( op ) )          │  ← Backoff inside a deadline
//! └─────────────┬───────────────────────────┘
//!               │ rejected or failed
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Fallback                          │  ← Safe default
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Usage Example
//!
//! ```no_run
//! use tether_core_resilience::{
//!     CircuitBreaker, CircuitBreakerConfig, ExecutionPolicy, FallbackConfig, ResilienceError,
//!     RetryConfig, TimeoutConfig,
//! };
//! use std::time::Duration;
//!
//! # async fn example() {
//! let breaker = CircuitBreaker::new(CircuitBreakerConfig {
//!     failure_threshold: 5,
//!     reset_timeout: Duration::from_secs(30),
//!     ..CircuitBreakerConfig::named("pricing")
//! });
//!
//! let policy = ExecutionPolicy::new()
//!     .with_retry(RetryConfig::default())
//!     .with_timeout(TimeoutConfig::new(Duration::from_secs(2)))
//!     .with_fallback(FallbackConfig::value(0u64));
//!
//! let result = breaker
//!     .execute_with(|| async { Ok::<_, ResilienceError>(42u64) }, policy)
//!     .await;
//!
//! println!("value={:?} from_fallback={}", result.value(), result.from_fallback);
//! # }
//! ```

pub mod circuit_breaker;
pub mod error;
pub mod events;
pub mod manager;
pub mod policy;

// Re-export main types for convenience
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerMetrics, CircuitBreakerOverrides,
    CircuitBreakerStatus, CircuitState, ExecutionResult, StateTransition, TransitionReason,
};
pub use error::ResilienceError;
pub use events::{CircuitBreakerEvent, CircuitBreakerEventKind, CircuitBreakerEventType};
pub use manager::{CircuitBreakerManager, CircuitBreakerManagerConfig};
pub use policy::{ExecutionPolicy, FallbackConfig, RetryConfig, TimeoutConfig};

/// Prelude module for convenient imports
///
/// # Example
/// ```
/// use tether_core_resilience::prelude::*;
/// ```
pub mod prelude {
    pub use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
    pub use super::error::ResilienceError;
    pub use super::manager::CircuitBreakerManager;
    pub use super::policy::{ExecutionPolicy, FallbackConfig, RetryConfig, TimeoutConfig};
}
