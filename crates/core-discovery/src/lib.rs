//! Tether Core Discovery: Service registry, health probing and load balancing
//!
//! # Overview
//!
//! - **ServiceDiscovery**: Registers services through a pluggable [`RegistryProvider`],
//!   answers filtered discovery queries, and runs a background health-check loop
//! - **Health probes**: HTTP (`reqwest`), TCP connect and heartbeat TTL checks behind the
//!   [`ProbeExecutor`] trait
//! - **LoadBalancer**: Round-robin, weighted, random and least-connections selection
//!
//! # Usage Example
//!
//! ```no_run
//! use tether_core_discovery::{DiscoveryConfig, ServiceDefinition, ServiceDiscovery};
//!
//! # async fn example() -> Result<(), tether_core_discovery::DiscoveryError> {
//! let discovery = ServiceDiscovery::in_memory(DiscoveryConfig::default())?;
//!
//! let registration = discovery
//!     .register_service(ServiceDefinition::new("billing", "10.0.0.7", 8080))
//!     .await?;
//!
//! if let Some(instance) = discovery.get_service_instance("billing", None).await? {
//!     let _guard = discovery.load_balancer().track(instance.instance_id);
//!     // call instance.endpoint()
//! }
//!
//! discovery.deregister_service(registration.service_id).await?;
//! # Ok(())
//! # }
//! ```

pub mod balancer;
pub mod discovery;
pub mod error;
pub mod probe;
pub mod registry;
pub mod types;

pub use balancer::{ConnectionTracker, LoadBalancer};
pub use discovery::ServiceDiscovery;
pub use error::{DiscoveryError, Result};
pub use probe::{check_ttl, NetworkProbe, ProbeExecutor, ProbeOutcome, ScriptedProbe};
pub use registry::{MemoryRegistry, RegistryProvider};
pub use types::{
    DiscoveryConfig, HealthCheckConfig, HealthCheckKind, HealthState, HealthStatus,
    LoadBalancingConfig, LoadBalancingStrategy, Protocol, RoutingContext, ServiceDefinition,
    ServiceInstance, ServiceMetadata, ServiceQuery, ServiceRegistration,
};
