//! Resource manager: allocation accounting, connection pools and the result cache
//!
//! Limit decisions are made from accounting rather than host measurements: usage is the
//! sum of live allocations plus connections held by the pools. Allocation checks and the
//! insert happen under the allocation-table lock so concurrent callers cannot both
//! squeeze past a limit.

use crate::cache::{CacheStats, CachedResult, ResultCache};
use crate::error::{ResourceError, Result};
use crate::host::HostSampler;
use crate::pool::{ConnectionPools, Connector, ModuleConnection, SimulatedConnector};
use crate::types::{
    AllocatedResources, AllocationStatus, Bottleneck, DimensionUsage, HeldConnection,
    ResourceAllocation, ResourceKind, ResourceLimitStatus, ResourceManagerConfig,
    ResourceRequirements, ResourceUsage, ResourceViolation, ResourceWarning, UsageSummary,
    ViolationAction, ViolationSeverity,
};
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// More cached entries than this earns a recommendation
const CACHE_ENTRY_ADVISORY: usize = 500;
/// More cached entries than this marks the cache as a bottleneck
const CACHE_ENTRY_BOTTLENECK: usize = 1000;

const DIMENSIONS: [ResourceKind; 5] = [
    ResourceKind::Cpu,
    ResourceKind::Memory,
    ResourceKind::Disk,
    ResourceKind::Network,
    ResourceKind::Connections,
];

/// Totals over live allocations
#[derive(Debug, Default)]
struct Accounted {
    cpu: f64,
    memory: u64,
    disk: u64,
    network: u64,
    /// Reserved connection slots not yet backed by a pooled connection
    reserved_connections: u64,
    live: usize,
}

impl Accounted {
    fn of(allocations: &HashMap<Uuid, ResourceAllocation>) -> Self {
        let mut totals = Self::default();
        for allocation in allocations.values().filter(|a| a.is_live()) {
            let granted = &allocation.allocated;
            totals.cpu += granted.cpu_cores;
            totals.memory += granted.memory_mb;
            totals.disk += granted.disk_space_mb;
            totals.network += granted.network_bandwidth;
            totals.reserved_connections += (granted.max_connections as u64)
                .saturating_sub(granted.connections.len() as u64);
            totals.live += 1;
        }
        totals
    }
}

pub struct ResourceManager {
    config: ResourceManagerConfig,
    allocations: Mutex<HashMap<Uuid, ResourceAllocation>>,
    pools: ConnectionPools,
    cache: ResultCache,
    host: Option<HostSampler>,
    shutdown: CancellationToken,
    me: Weak<Self>,
}

impl std::fmt::Debug for ResourceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ResourceManager {
    /// Manager with a [`SimulatedConnector`] behind its pools
    pub fn new(config: ResourceManagerConfig) -> Arc<Self> {
        Self::with_connector(config, Arc::new(SimulatedConnector::default()))
    }

    /// Must be called from within a tokio runtime; the sweep task starts immediately.
    pub fn with_connector(
        config: ResourceManagerConfig,
        connector: Arc<dyn Connector>,
    ) -> Arc<Self> {
        let manager = Arc::new_cyclic(|me| Self {
            pools: ConnectionPools::new(config.pool.clone(), connector)
                .with_total_limit(config.limits.max_connections as usize),
            cache: ResultCache::new(config.cache.max_entries),
            host: config.sample_host.then(HostSampler::new),
            allocations: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            me: me.clone(),
            config,
        });

        if !manager.config.sweep_interval.is_zero() {
            tokio::spawn(Self::sweep_loop(
                Arc::downgrade(&manager),
                manager.shutdown.clone(),
                manager.config.sweep_interval,
            ));
        }

        manager
    }

    pub fn config(&self) -> &ResourceManagerConfig {
        &self.config
    }

    /// Reserve resources for a unit of work.
    ///
    /// Fails with `LimitsExceeded` while any critical violation is active and with
    /// `InsufficientResources` when the clamped request does not fit.
    pub fn allocate_resources(
        &self,
        requirements: ResourceRequirements,
    ) -> Result<ResourceAllocation> {
        if !requirements.cpu_cores.is_finite() || requirements.cpu_cores < 0.0 {
            return Err(ResourceError::Validation(format!(
                "cpu_cores must be a non-negative number, got {}",
                requirements.cpu_cores
            )));
        }

        self.expire_due();

        let status = self.check_resource_limits();
        if status.has_critical() {
            let kinds: Vec<String> = status
                .violations
                .iter()
                .filter(|v| v.severity == ViolationSeverity::Critical)
                .map(|v| format!("{} at {:.1}%", v.resource_type, v.current / v.limit * 100.0))
                .collect();
            warn!(violations = %kinds.join(", "), "allocation refused, critical limit violation");
            return Err(ResourceError::LimitsExceeded(kinds.join(", ")));
        }

        let limits = &self.config.limits;
        let mut allocations = self.table();
        let used = Accounted::of(&allocations);

        if used.live >= limits.max_concurrent_allocations {
            return Err(ResourceError::InsufficientResources(format!(
                "{} allocations already live (max {})",
                used.live, limits.max_concurrent_allocations
            )));
        }

        let granted_cpu = requirements.cpu_cores.min(limits.max_cpu_cores);
        let granted_memory = requirements.memory_mb.min(limits.max_memory_mb);
        let granted_disk = requirements.disk_space_mb.min(limits.max_disk_space_mb);
        let granted_network = requirements.network_bandwidth.min(limits.max_network_bandwidth);
        let granted_connections = requirements.max_connections.min(limits.max_connections);

        let connection_slots = self.pools.open_count() as u64 + used.reserved_connections;
        let shortfalls: Vec<String> = [
            (ResourceKind::Cpu, used.cpu + granted_cpu, limits.max_cpu_cores),
            (
                ResourceKind::Memory,
                (used.memory + granted_memory) as f64,
                limits.max_memory_mb as f64,
            ),
            (
                ResourceKind::Disk,
                (used.disk + granted_disk) as f64,
                limits.max_disk_space_mb as f64,
            ),
            (
                ResourceKind::Network,
                (used.network + granted_network) as f64,
                limits.max_network_bandwidth as f64,
            ),
            (
                ResourceKind::Connections,
                (connection_slots + granted_connections as u64) as f64,
                limits.max_connections as f64,
            ),
        ]
        .into_iter()
        .filter(|(_, projected, limit)| projected > limit)
        .map(|(kind, projected, limit)| format!("{} would reach {} of {}", kind, projected, limit))
        .collect();

        if !shortfalls.is_empty() {
            warn!(
                shortfalls = %shortfalls.join(", "),
                "allocation refused, insufficient resources"
            );
            return Err(ResourceError::InsufficientResources(shortfalls.join(", ")));
        }

        let duration = requirements.estimated_duration.min(limits.allocation_timeout);
        let now = Utc::now();
        let span = chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::zero());

        let allocation = ResourceAllocation {
            allocation_id: Uuid::new_v4(),
            allocated: AllocatedResources {
                cpu_cores: granted_cpu,
                memory_mb: granted_memory,
                disk_space_mb: granted_disk,
                network_bandwidth: granted_network,
                max_connections: granted_connections,
                connections: Vec::new(),
                reserved_until: now + span,
            },
            requirements,
            status: AllocationStatus::Allocated,
            created_at: now,
            expires_at: (!duration.is_zero()).then(|| now + span),
            released_at: None,
            deadline: (!duration.is_zero()).then(|| Instant::now() + duration),
            settled: None,
        };

        allocations.insert(allocation.allocation_id, allocation.clone());
        info!(
            allocation_id = %allocation.allocation_id,
            cpu = granted_cpu,
            memory_mb = granted_memory,
            connections = granted_connections,
            "allocated resources"
        );
        Ok(allocation)
    }

    /// Release an allocation and every connection it holds.
    ///
    /// The allocation stays readable in its terminal state for the release grace window.
    /// Releasing an allocation that already ended returns it unchanged.
    pub fn release_resources(&self, allocation_id: Uuid) -> Result<ResourceAllocation> {
        let (allocation, held) = {
            let mut allocations = self.table();
            let allocation = allocations
                .get_mut(&allocation_id)
                .ok_or_else(|| ResourceError::NotFound(format!("allocation {}", allocation_id)))?;

            if !allocation.is_live() {
                return Ok(allocation.clone());
            }

            allocation.status = AllocationStatus::Released;
            allocation.released_at = Some(Utc::now());
            allocation.settled = Some(Instant::now());
            let held = allocation.allocated.connections.clone();
            (allocation.clone(), held)
        };

        for conn in &held {
            self.pools.release_connection(conn.connection_id);
        }

        self.schedule_removal(allocation_id);
        info!(allocation_id = %allocation_id, connections = held.len(), "released resources");
        Ok(allocation)
    }

    pub fn get_allocation(&self, allocation_id: Uuid) -> Option<ResourceAllocation> {
        self.table().get(&allocation_id).cloned()
    }

    pub fn allocations(&self) -> Vec<ResourceAllocation> {
        let mut all: Vec<_> = self.table().values().cloned().collect();
        all.sort_by_key(|a| a.created_at);
        all
    }

    /// Check out a pooled connection on behalf of an allocation.
    ///
    /// The connection counts toward the allocation's `max_connections` and goes back
    /// to idle when the allocation is released.
    pub async fn attach_connection(
        &self,
        allocation_id: Uuid,
        module_id: &str,
    ) -> Result<ModuleConnection> {
        {
            let allocations = self.table();
            let allocation = allocations
                .get(&allocation_id)
                .filter(|a| a.is_live())
                .ok_or_else(|| ResourceError::NotFound(format!("allocation {}", allocation_id)))?;
            let granted = &allocation.allocated;
            if granted.connections.len() >= granted.max_connections as usize {
                return Err(ResourceError::InsufficientResources(format!(
                    "allocation {} already holds {} of {} connections",
                    allocation_id,
                    granted.connections.len(),
                    granted.max_connections
                )));
            }
        }

        let conn = self.pools.get_connection(module_id).await?;

        let attached = {
            let mut allocations = self.table();
            match allocations.get_mut(&allocation_id).filter(|a| a.is_live()) {
                Some(allocation) => {
                    allocation.allocated.connections.push(HeldConnection {
                        connection_id: conn.connection_id,
                        module_id: conn.module_id.clone(),
                    });
                    true
                }
                None => false,
            }
        };

        if !attached {
            self.pools.release_connection(conn.connection_id);
            return Err(ResourceError::NotFound(format!("allocation {}", allocation_id)));
        }
        Ok(conn)
    }

    /// Current accounting-based usage, plus a host snapshot when enabled
    pub fn monitor_resource_usage(&self) -> ResourceUsage {
        let limits = &self.config.limits;
        let used = Accounted::of(&self.table());
        let connections = self.pools.usage(limits.max_connections);
        let slots = self.pools.open_count() as u64 + used.reserved_connections;

        let mut usage = ResourceUsage {
            timestamp: Utc::now(),
            cpu: DimensionUsage::new(used.cpu, limits.max_cpu_cores),
            memory: DimensionUsage::new(used.memory as f64, limits.max_memory_mb as f64),
            disk: DimensionUsage::new(used.disk as f64, limits.max_disk_space_mb as f64),
            network: DimensionUsage::new(
                used.network as f64,
                limits.max_network_bandwidth as f64,
            ),
            connections,
            connection_slots: DimensionUsage::new(slots as f64, limits.max_connections as f64),
            active_allocations: used.live,
            cache: self.cache.stats(),
            host: self.host.as_ref().map(HostSampler::sample),
            overall: UsageSummary::default(),
        };
        usage.overall = self.summarize(&usage);
        usage
    }

    fn summarize(&self, usage: &ResourceUsage) -> UsageSummary {
        let warning = self.config.warning_threshold;
        let pool = usage.connections.pool_utilization;
        let allocation_pressure = usage.active_allocations as f64
            / self.config.limits.max_concurrent_allocations.max(1) as f64
            * 100.0;
        let worst = DIMENSIONS
            .iter()
            .map(|kind| usage.dimension(*kind).utilization)
            .fold(pool, f64::max);

        let performance_score = if pool >= warning {
            60.0
        } else if pool >= warning * 0.75 {
            80.0
        } else {
            100.0
        };
        let resource_efficiency = if usage.active_allocations == 0 {
            100.0
        } else {
            (100.0 - allocation_pressure).clamp(0.0, 100.0)
        };

        let cache_bound = self
            .config
            .cache
            .max_entries
            .is_some_and(|max| usage.cache.total_entries >= max);
        let mut bottlenecks = Vec::new();
        let mut recommendations = Vec::new();
        if pool >= warning {
            bottlenecks.push(Bottleneck::ConnectionPool);
            recommendations.push("Consider increasing connection pool size".to_string());
        }
        if usage.cache.total_entries > CACHE_ENTRY_BOTTLENECK || cache_bound {
            bottlenecks.push(Bottleneck::CacheSize);
        }
        if usage.cache.total_entries > CACHE_ENTRY_ADVISORY || cache_bound {
            recommendations
                .push("Consider lowering cache TTLs or bounding cache entries".to_string());
        }
        if allocation_pressure >= warning {
            bottlenecks.push(Bottleneck::Allocations);
            recommendations
                .push("Live allocations are close to max_concurrent_allocations".to_string());
        }

        UsageSummary {
            health_score: (100.0 - worst * 0.5).clamp(0.0, 100.0),
            performance_score,
            resource_efficiency,
            bottlenecks,
            recommendations,
        }
    }

    /// Classify every dimension against the warning and critical thresholds
    pub fn check_resource_limits(&self) -> ResourceLimitStatus {
        let current = self.monitor_resource_usage();
        let now = Utc::now();
        let mut violations = Vec::new();
        let mut warnings = Vec::new();

        for kind in DIMENSIONS {
            let dim = current.dimension(kind);
            if dim.total <= 0.0 {
                continue;
            }

            if dim.utilization >= self.config.critical_threshold {
                let (severity, action) = match kind {
                    ResourceKind::Connections => {
                        (ViolationSeverity::Warning, ViolationAction::Throttle)
                    }
                    ResourceKind::Memory | ResourceKind::Disk => {
                        (ViolationSeverity::Critical, ViolationAction::Cleanup)
                    }
                    ResourceKind::Cpu | ResourceKind::Network => {
                        (ViolationSeverity::Critical, ViolationAction::Reject)
                    }
                };
                violations.push(ResourceViolation {
                    violation_id: Uuid::new_v4(),
                    resource_type: kind,
                    limit: dim.total,
                    current: dim.used,
                    severity,
                    action,
                    timestamp: now,
                });
            } else if dim.utilization >= self.config.warning_threshold {
                warnings.push(ResourceWarning {
                    warning_id: Uuid::new_v4(),
                    resource_type: kind,
                    threshold: dim.total * self.config.warning_threshold / 100.0,
                    current: dim.used,
                    message: format!("{} utilization at {:.1}%", kind, dim.utilization),
                    timestamp: now,
                });
            }
        }

        let recommendations = current.overall.recommendations.clone();

        ResourceLimitStatus {
            current,
            violations,
            warnings,
            recommendations,
        }
    }

    pub async fn get_connection(&self, module_id: &str) -> Result<ModuleConnection> {
        self.pools.get_connection(module_id).await
    }

    pub fn release_connection(&self, connection_id: Uuid) -> bool {
        self.pools.release_connection(connection_id)
    }

    pub fn pools(&self) -> &ConnectionPools {
        &self.pools
    }

    pub fn get_cached_result(&self, key: &str) -> Option<CachedResult> {
        self.cache.get(key)
    }

    /// Cache `value` under `key`; `None` uses the configured default TTL
    pub fn set_cached_result<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let value = serde_json::to_value(value).map_err(|e| {
            ResourceError::Validation(format!("value for '{}' is not serializable: {}", key, e))
        })?;
        self.cache
            .set(key, value, ttl.unwrap_or(self.config.cache.default_ttl));
        Ok(())
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Stop the sweep task and close every pooled connection
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        let closed = self.pools.close_all();
        debug!(connections = closed, "resource manager shut down");
    }

    /// Mark allocations past their expiry and return their connections. Returns how many expired.
    fn expire_due(&self) -> usize {
        let now = Instant::now();
        let mut freed = Vec::new();
        let mut expired = Vec::new();

        {
            let mut allocations = self.table();
            for allocation in allocations.values_mut() {
                let due = allocation.is_live() && allocation.deadline.is_some_and(|d| now >= d);
                if due {
                    allocation.status = AllocationStatus::Expired;
                    allocation.released_at = Some(Utc::now());
                    allocation.settled = Some(now);
                    freed.extend(allocation.allocated.connections.iter().map(|c| c.connection_id));
                    expired.push(allocation.allocation_id);
                }
            }
        }

        for connection_id in freed {
            self.pools.release_connection(connection_id);
        }
        for allocation_id in &expired {
            debug!(allocation_id = %allocation_id, "allocation expired");
            self.schedule_removal(*allocation_id);
        }
        expired.len()
    }

    /// Drop terminal allocations whose grace window has passed
    fn purge_settled(&self) -> usize {
        let grace = self.config.release_grace;
        let mut allocations = self.table();
        let before = allocations.len();
        allocations.retain(|_, a| a.settled.map_or(true, |at| at.elapsed() < grace));
        before - allocations.len()
    }

    fn schedule_removal(&self, allocation_id: Uuid) {
        let grace = self.config.release_grace;
        if grace.is_zero() {
            self.table().remove(&allocation_id);
            return;
        }

        let manager = self.me.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(grace) => {
                    if let Some(manager) = manager.upgrade() {
                        let mut allocations = manager.table();
                        if allocations.get(&allocation_id).is_some_and(|a| !a.is_live()) {
                            allocations.remove(&allocation_id);
                        }
                    }
                }
            }
        });
    }

    async fn sweep_loop(manager: Weak<Self>, shutdown: CancellationToken, period: Duration) {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let Some(manager) = manager.upgrade() else {
                break;
            };

            let expired = manager.expire_due();
            let purged = manager.purge_settled();
            let evicted = manager.cache.evict_expired();
            let closed = manager.pools.sweep();
            debug!(
                expired_allocations = expired,
                purged_allocations = purged,
                evicted_cache_entries = evicted,
                closed_connections = closed,
                "resource sweep"
            );
        }
    }

    fn table(&self) -> MutexGuard<'_, HashMap<Uuid, ResourceAllocation>> {
        self.allocations.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for ResourceManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
