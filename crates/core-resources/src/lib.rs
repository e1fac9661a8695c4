//! Tether Core Resources: Allocation accounting, connection pools and a result cache
//!
//! # Overview
//!
//! - **ResourceManager**: Grants [`ResourceAllocation`]s against configured
//!   [`ResourceLimits`], classifies usage against warning and critical thresholds, and
//!   sweeps expired allocations on a fixed interval
//! - **Connection pools**: One pool per module; idle connections are reused, new ones are
//!   opened through a [`Connector`] within `connection_timeout`
//! - **Result cache**: JSON values with per-entry TTL and optional LRU bound
//!
//! # Usage Example
//!
//! ```no_run
//! use tether_core_resources::{ResourceManager, ResourceManagerConfig, ResourceRequirements};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), tether_core_resources::ResourceError> {
//! let manager = ResourceManager::new(ResourceManagerConfig::default());
//!
//! let allocation = manager.allocate_resources(
//!     ResourceRequirements::new(2.0, 512)
//!         .with_connections(1)
//!         .with_duration(Duration::from_secs(60)),
//! )?;
//! let conn = manager.attach_connection(allocation.allocation_id, "reports").await?;
//! // talk to conn.endpoint
//!
//! manager.set_cached_result("report:42", &vec![1, 2, 3], Some(Duration::from_secs(30)))?;
//! manager.release_resources(allocation.allocation_id)?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod error;
pub mod host;
pub mod manager;
pub mod pool;
pub mod types;

pub use cache::{CacheStats, CachedResult, ResultCache};
pub use error::{ResourceError, Result};
pub use host::{HostSampler, HostSnapshot};
pub use manager::ResourceManager;
pub use pool::{
    ConnectionPools, ConnectionStatus, Connector, ModuleConnection, PoolConfig, SimulatedConnector,
};
pub use types::{
    AllocatedResources, AllocationStatus, Bottleneck, CacheConfig, ConnectionUsage,
    DimensionUsage, HeldConnection, ResourceAllocation, ResourceKind, ResourceLimitStatus,
    ResourceLimits, ResourceManagerConfig, ResourcePriority, ResourceRequirements,
    ResourceUsage, ResourceViolation, ResourceWarning, UsageSummary, ViolationAction,
    ViolationSeverity,
};
