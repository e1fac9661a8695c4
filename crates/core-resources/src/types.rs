//! Requests, allocations, limits and usage snapshots

use crate::cache::CacheStats;
use crate::host::HostSnapshot;
use crate::pool::PoolConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourcePriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// What a caller asks for before starting expensive work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    pub cpu_cores: f64,
    pub memory_mb: u64,
    pub disk_space_mb: u64,
    /// Mbit/s
    pub network_bandwidth: u64,
    pub max_connections: u32,
    #[serde(skip)]
    pub estimated_duration: Duration,
    pub priority: ResourcePriority,
}

impl Default for ResourceRequirements {
    fn default() -> Self {
        Self {
            cpu_cores: 0.0,
            memory_mb: 0,
            disk_space_mb: 0,
            network_bandwidth: 0,
            max_connections: 0,
            estimated_duration: Duration::ZERO,
            priority: ResourcePriority::Normal,
        }
    }
}

impl ResourceRequirements {
    pub fn new(cpu_cores: f64, memory_mb: u64) -> Self {
        Self {
            cpu_cores,
            memory_mb,
            ..Default::default()
        }
    }

    pub fn with_disk(mut self, disk_space_mb: u64) -> Self {
        self.disk_space_mb = disk_space_mb;
        self
    }

    pub fn with_network(mut self, network_bandwidth: u64) -> Self {
        self.network_bandwidth = network_bandwidth;
        self
    }

    pub fn with_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn with_duration(mut self, estimated_duration: Duration) -> Self {
        self.estimated_duration = estimated_duration;
        self
    }

    pub fn with_priority(mut self, priority: ResourcePriority) -> Self {
        self.priority = priority;
        self
    }
}

/// Configured maximums
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceLimits {
    pub max_cpu_cores: f64,
    pub max_memory_mb: u64,
    pub max_disk_space_mb: u64,
    pub max_network_bandwidth: u64,
    pub max_connections: u32,
    pub max_concurrent_allocations: usize,
    /// Upper bound on an allocation's estimated duration
    pub allocation_timeout: Duration,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_cpu_cores: 8.0,
            max_memory_mb: 4096,
            max_disk_space_mb: 10240,
            max_network_bandwidth: 1000,
            max_connections: 1000,
            max_concurrent_allocations: 100,
            allocation_timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationStatus {
    Allocated,
    Released,
    Expired,
}

impl fmt::Display for AllocationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocationStatus::Allocated => write!(f, "allocated"),
            AllocationStatus::Released => write!(f, "released"),
            AllocationStatus::Expired => write!(f, "expired"),
        }
    }
}

/// A pooled connection checked out on behalf of an allocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeldConnection {
    pub connection_id: Uuid,
    pub module_id: String,
}

/// Quantities actually granted, each clamped to its configured maximum
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocatedResources {
    pub cpu_cores: f64,
    pub memory_mb: u64,
    pub disk_space_mb: u64,
    pub network_bandwidth: u64,
    pub max_connections: u32,
    pub connections: Vec<HeldConnection>,
    pub reserved_until: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceAllocation {
    pub allocation_id: Uuid,
    pub requirements: ResourceRequirements,
    pub allocated: AllocatedResources,
    pub status: AllocationStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub released_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub(crate) deadline: Option<Instant>,
    #[serde(skip)]
    pub(crate) settled: Option<Instant>,
}

impl ResourceAllocation {
    pub fn is_live(&self) -> bool {
        self.status == AllocationStatus::Allocated
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Cpu,
    Memory,
    Disk,
    Network,
    Connections,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Cpu => write!(f, "cpu"),
            ResourceKind::Memory => write!(f, "memory"),
            ResourceKind::Disk => write!(f, "disk"),
            ResourceKind::Network => write!(f, "network"),
            ResourceKind::Connections => write!(f, "connections"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationSeverity {
    Warning,
    Critical,
}

/// What the caller is expected to do about a violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationAction {
    Cleanup,
    Throttle,
    Reject,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceViolation {
    pub violation_id: Uuid,
    pub resource_type: ResourceKind,
    pub limit: f64,
    pub current: f64,
    pub severity: ViolationSeverity,
    pub action: ViolationAction,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceWarning {
    pub warning_id: Uuid,
    pub resource_type: ResourceKind,
    pub threshold: f64,
    pub current: f64,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Used versus available for one dimension
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct DimensionUsage {
    pub used: f64,
    pub total: f64,
    /// Percent of `total`
    pub utilization: f64,
}

impl DimensionUsage {
    pub fn new(used: f64, total: f64) -> Self {
        let utilization = if total > 0.0 { used / total * 100.0 } else { 0.0 };
        Self {
            used,
            total,
            utilization,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ConnectionUsage {
    pub total: usize,
    pub active: usize,
    pub idle: usize,
    pub error: usize,
    /// Active connections as a percent of the connection limit
    pub pool_utilization: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub timestamp: DateTime<Utc>,
    pub cpu: DimensionUsage,
    pub memory: DimensionUsage,
    pub disk: DimensionUsage,
    pub network: DimensionUsage,
    pub connections: ConnectionUsage,
    /// Connections counted against `max_connections`: pooled plus reserved by allocations
    pub connection_slots: DimensionUsage,
    pub active_allocations: usize,
    pub cache: CacheStats,
    pub host: Option<HostSnapshot>,
    pub overall: UsageSummary,
}

impl ResourceUsage {
    pub fn dimension(&self, kind: ResourceKind) -> DimensionUsage {
        match kind {
            ResourceKind::Cpu => self.cpu,
            ResourceKind::Memory => self.memory,
            ResourceKind::Disk => self.disk,
            ResourceKind::Network => self.network,
            ResourceKind::Connections => self.connection_slots,
        }
    }
}

/// Resource that is limiting throughput
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bottleneck {
    /// Active connections at or above the warning share of `max_connections`
    ConnectionPool,
    /// Cache holds more entries than is advisable, or sits at its bound
    CacheSize,
    /// Live allocations at or above the warning share of `max_concurrent_allocations`
    Allocations,
}

impl fmt::Display for Bottleneck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Bottleneck::ConnectionPool => "connection_pool",
            Bottleneck::CacheSize => "cache_size",
            Bottleneck::Allocations => "allocations",
        };
        f.write_str(s)
    }
}

/// Scores in `0..=100`, higher is better
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageSummary {
    /// 100 minus half the worst utilization across pool and accounted dimensions
    pub health_score: f64,
    /// Stepped down as pool utilization approaches the warning threshold
    pub performance_score: f64,
    pub resource_efficiency: f64,
    pub bottlenecks: Vec<Bottleneck>,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceLimitStatus {
    pub current: ResourceUsage,
    pub violations: Vec<ResourceViolation>,
    pub warnings: Vec<ResourceWarning>,
    pub recommendations: Vec<String>,
}

impl ResourceLimitStatus {
    pub fn has_critical(&self) -> bool {
        self.violations
            .iter()
            .any(|v| v.severity == ViolationSeverity::Critical)
    }
}

/// Result cache settings
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    /// TTL used when a caller passes none
    pub default_ttl: Duration,
    /// Least-recently accessed entries are evicted past this many; `None` is unbounded
    pub max_entries: Option<usize>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(300),
            max_entries: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResourceManagerConfig {
    pub limits: ResourceLimits,
    /// Percent utilization that raises a warning
    pub warning_threshold: f64,
    /// Percent utilization that raises a violation
    pub critical_threshold: f64,
    pub pool: PoolConfig,
    pub cache: CacheConfig,
    /// Period of the expiry and eviction sweep; zero disables the task
    pub sweep_interval: Duration,
    /// How long released or expired allocations stay readable
    pub release_grace: Duration,
    /// Attach a sysinfo host snapshot to usage reports
    pub sample_host: bool,
}

impl Default for ResourceManagerConfig {
    fn default() -> Self {
        Self {
            limits: ResourceLimits::default(),
            warning_threshold: 80.0,
            critical_threshold: 90.0,
            pool: PoolConfig::default(),
            cache: CacheConfig::default(),
            sweep_interval: Duration::from_secs(30),
            release_grace: Duration::from_secs(60),
            sample_host: true,
        }
    }
}
