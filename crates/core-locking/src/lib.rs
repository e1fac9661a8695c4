//! Tether Core Locking: Lease-based mutual exclusion over named resources
//!
//! # Overview
//!
//! - **DistributedLockManager**: Acquires, renews and releases locks through a pluggable
//!   [`LockProvider`], retrying contended acquisitions with a fixed delay
//! - **DeadlockDetector**: Wait-for graph analysis, both as a pre-check before every
//!   attempt and as a periodic scan that aborts one waiter per cycle
//! - **MemoryLockProvider**: In-process provider for tests and single-node deployments
//!
//! Cross-process compare-and-set semantics belong to the provider. This crate only
//! defines the retry, lease and detection policy around it.
//!
//! # Usage Example
//!
//! ```no_run
//! use tether_core_locking::{DistributedLockManager, LockManagerConfig, LockRequest};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = DistributedLockManager::in_memory(LockManagerConfig::default());
//! manager.connect().await?;
//!
//! let result = manager
//!     .acquire_lock(LockRequest::new("invoice-42", "worker-1").with_ttl(Duration::from_secs(10)))
//!     .await;
//!
//! if let Some(lock) = result.lock() {
//!     // critical section
//!     manager.release_lock(lock.lock_id).await;
//! }
//!
//! manager.disconnect().await;
//! # Ok(())
//! # }
//! ```

pub mod deadlock;
pub mod error;
pub mod manager;
pub mod provider;
pub mod types;

pub use deadlock::{DeadlockDetector, WaitGuard};
pub use error::{LockError, LockErrorKind, ProviderError};
pub use manager::DistributedLockManager;
pub use provider::{LockProvider, MemoryLockProvider};
pub use types::{
    ConnectionStatus, DeadlockInfo, DeadlockResolution, DeadlockStrategy, LockInfo,
    LockManagerConfig, LockRequest, LockResult, LockStatistics, LockStatus, LockType,
    MAX_LOCK_TTL,
};
