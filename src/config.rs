/*!
 * Configuration types for Tether
 *
 * Every section and field has a default, so an empty file is a valid configuration.
 * Durations are written in milliseconds (`*_ms`).
 */

use crate::error::{Result, TetherError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tether_core_discovery::{DiscoveryConfig, LoadBalancingConfig, LoadBalancingStrategy};
use tether_core_locking::{DeadlockStrategy, LockManagerConfig, MAX_LOCK_TTL};
use tether_core_resilience::{CircuitBreakerManagerConfig, CircuitBreakerOverrides};
use tether_core_resources::{
    CacheConfig, PoolConfig, ResourceLimits, ResourceManagerConfig,
};

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TetherConfig {
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSection,

    #[serde(default)]
    pub locking: LockingSection,

    #[serde(default)]
    pub discovery: DiscoverySection,

    #[serde(default)]
    pub resources: ResourcesSection,
}

/// Log level for diagnostic output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Convert to tracing::Level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: LogLevel,

    /// Write JSON logs to this file instead of compact output on stdout
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    /// Force debug level
    #[serde(default)]
    pub verbose: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSection {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub reset_timeout_ms: u64,
    pub half_open_max_calls: u32,
    pub fallback_enabled: bool,
    pub notification_enabled: bool,
    pub metrics_enabled: bool,
    pub monitoring_period_ms: u64,

    /// Per-breaker overrides keyed by breaker name
    pub breakers: BTreeMap<String, CircuitBreakerOverrides>,
}

impl Default for CircuitBreakerSection {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            reset_timeout_ms: 60_000,
            half_open_max_calls: 3,
            fallback_enabled: true,
            notification_enabled: true,
            metrics_enabled: true,
            monitoring_period_ms: 10_000,
            breakers: BTreeMap::new(),
        }
    }
}

impl CircuitBreakerSection {
    pub fn to_manager_config(&self) -> CircuitBreakerManagerConfig {
        CircuitBreakerManagerConfig {
            defaults: CircuitBreakerOverrides {
                failure_threshold: Some(self.failure_threshold),
                success_threshold: Some(self.success_threshold),
                reset_timeout_ms: Some(self.reset_timeout_ms),
                half_open_max_calls: Some(self.half_open_max_calls),
                fallback_enabled: Some(self.fallback_enabled),
                notification_enabled: Some(self.notification_enabled),
            },
            metrics_enabled: self.metrics_enabled,
            monitoring_period: Duration::from_millis(self.monitoring_period_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockingSection {
    pub default_ttl_ms: u64,
    /// Zero disables automatic renewal
    pub renewal_interval_ms: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub deadlock_detection: bool,
    pub deadlock_scan_interval_ms: u64,
    pub deadlock_strategy: DeadlockStrategy,
    /// Overall acquisition deadline applied when a request sets none
    pub lock_timeout_ms: Option<u64>,
}

impl Default for LockingSection {
    fn default() -> Self {
        Self {
            default_ttl_ms: 30_000,
            renewal_interval_ms: 0,
            max_retries: 3,
            retry_delay_ms: 100,
            deadlock_detection: true,
            deadlock_scan_interval_ms: 5_000,
            deadlock_strategy: DeadlockStrategy::AbortYoungest,
            lock_timeout_ms: None,
        }
    }
}

impl LockingSection {
    pub fn to_lock_config(&self) -> LockManagerConfig {
        LockManagerConfig {
            default_ttl: Duration::from_millis(self.default_ttl_ms),
            renewal_interval: Duration::from_millis(self.renewal_interval_ms),
            max_retries: self.max_retries,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            deadlock_detection: self.deadlock_detection,
            deadlock_scan_interval: Duration::from_millis(self.deadlock_scan_interval_ms),
            deadlock_strategy: self.deadlock_strategy,
            lock_timeout: self.lock_timeout_ms.map(Duration::from_millis),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoverySection {
    pub health_check_interval_ms: u64,
    /// Heartbeat age after which a TTL-checked service is unhealthy
    pub ttl_ms: u64,
    pub strategy: LoadBalancingStrategy,
    pub health_check_enabled: bool,
    pub failover_enabled: bool,
    pub sticky_sessions: bool,
    pub sticky_session_ttl_ms: u64,
}

impl Default for DiscoverySection {
    fn default() -> Self {
        Self {
            health_check_interval_ms: 30_000,
            ttl_ms: 30_000,
            strategy: LoadBalancingStrategy::RoundRobin,
            health_check_enabled: true,
            failover_enabled: true,
            sticky_sessions: false,
            sticky_session_ttl_ms: 3_600_000,
        }
    }
}

impl DiscoverySection {
    pub fn to_discovery_config(&self) -> DiscoveryConfig {
        DiscoveryConfig {
            health_check_interval: Duration::from_millis(self.health_check_interval_ms),
            ttl: Duration::from_millis(self.ttl_ms),
            load_balancing: LoadBalancingConfig {
                strategy: self.strategy,
                health_check_enabled: self.health_check_enabled,
                failover_enabled: self.failover_enabled,
                sticky_sessions: self.sticky_sessions,
                sticky_session_ttl: Duration::from_millis(self.sticky_session_ttl_ms),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourcesSection {
    pub max_cpu_cores: f64,
    pub max_memory_mb: u64,
    pub max_disk_space_mb: u64,
    pub max_network_bandwidth: u64,
    pub max_connections: u32,
    pub max_concurrent_allocations: usize,
    pub allocation_timeout_ms: u64,

    /// Percent utilization
    pub warning_threshold: f64,
    /// Percent utilization
    pub critical_threshold: f64,

    pub max_connections_per_module: usize,
    pub idle_timeout_ms: u64,
    pub connection_timeout_ms: u64,
    /// Latency of the simulated connector used when no connector is supplied
    pub connect_latency_ms: u64,

    pub cache_default_ttl_ms: u64,
    pub cache_max_entries: Option<usize>,

    pub sweep_interval_ms: u64,
    pub release_grace_ms: u64,
    pub sample_host: bool,
}

impl Default for ResourcesSection {
    fn default() -> Self {
        Self {
            max_cpu_cores: 8.0,
            max_memory_mb: 4096,
            max_disk_space_mb: 10240,
            max_network_bandwidth: 1000,
            max_connections: 1000,
            max_concurrent_allocations: 100,
            allocation_timeout_ms: 300_000,
            warning_threshold: 80.0,
            critical_threshold: 90.0,
            max_connections_per_module: 10,
            idle_timeout_ms: 300_000,
            connection_timeout_ms: 5_000,
            connect_latency_ms: 100,
            cache_default_ttl_ms: 300_000,
            cache_max_entries: None,
            sweep_interval_ms: 30_000,
            release_grace_ms: 60_000,
            sample_host: true,
        }
    }
}

impl ResourcesSection {
    pub fn to_resource_config(&self) -> ResourceManagerConfig {
        ResourceManagerConfig {
            limits: ResourceLimits {
                max_cpu_cores: self.max_cpu_cores,
                max_memory_mb: self.max_memory_mb,
                max_disk_space_mb: self.max_disk_space_mb,
                max_network_bandwidth: self.max_network_bandwidth,
                max_connections: self.max_connections,
                max_concurrent_allocations: self.max_concurrent_allocations,
                allocation_timeout: Duration::from_millis(self.allocation_timeout_ms),
            },
            warning_threshold: self.warning_threshold,
            critical_threshold: self.critical_threshold,
            pool: PoolConfig {
                max_connections_per_module: self.max_connections_per_module,
                idle_timeout: Duration::from_millis(self.idle_timeout_ms),
                connection_timeout: Duration::from_millis(self.connection_timeout_ms),
            },
            cache: CacheConfig {
                default_ttl: Duration::from_millis(self.cache_default_ttl_ms),
                max_entries: self.cache_max_entries,
            },
            sweep_interval: Duration::from_millis(self.sweep_interval_ms),
            release_grace: Duration::from_millis(self.release_grace_ms),
            sample_host: self.sample_host,
        }
    }
}

impl TetherConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
            .map_err(|e| TetherError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| TetherError::Config(e.to_string()))
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, self.to_toml()?)?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| TetherError::Config(e.to_string()))
    }

    /// Reject values that would stall a background loop or make a threshold meaningless.
    ///
    /// All problems are reported together.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();
        let mut require = |ok: bool, message: &str| {
            if !ok {
                problems.push(message.to_string());
            }
        };

        let cb = &self.circuit_breaker;
        require(cb.failure_threshold > 0, "circuit_breaker.failure_threshold must be > 0");
        require(cb.success_threshold > 0, "circuit_breaker.success_threshold must be > 0");
        require(cb.half_open_max_calls > 0, "circuit_breaker.half_open_max_calls must be > 0");
        require(cb.reset_timeout_ms > 0, "circuit_breaker.reset_timeout_ms must be > 0");
        require(
            !cb.metrics_enabled || cb.monitoring_period_ms > 0,
            "circuit_breaker.monitoring_period_ms must be > 0 when metrics are enabled",
        );

        let lk = &self.locking;
        require(lk.default_ttl_ms > 0, "locking.default_ttl_ms must be > 0");
        require(
            u128::from(lk.default_ttl_ms) <= MAX_LOCK_TTL.as_millis(),
            "locking.default_ttl_ms exceeds the maximum lease length",
        );
        require(
            !lk.deadlock_detection || lk.deadlock_scan_interval_ms > 0,
            "locking.deadlock_scan_interval_ms must be > 0 when deadlock detection is enabled",
        );
        require(
            lk.renewal_interval_ms == 0 || lk.renewal_interval_ms < lk.default_ttl_ms,
            "locking.renewal_interval_ms must be shorter than locking.default_ttl_ms",
        );
        require(
            lk.lock_timeout_ms != Some(0),
            "locking.lock_timeout_ms must be > 0 when set",
        );

        let ds = &self.discovery;
        require(ds.health_check_interval_ms > 0, "discovery.health_check_interval_ms must be > 0");
        require(ds.ttl_ms > 0, "discovery.ttl_ms must be > 0");
        require(
            !ds.sticky_sessions || ds.sticky_session_ttl_ms > 0,
            "discovery.sticky_session_ttl_ms must be > 0 when sticky sessions are enabled",
        );

        let rs = &self.resources;
        require(
            rs.max_cpu_cores.is_finite() && rs.max_cpu_cores > 0.0,
            "resources.max_cpu_cores must be > 0",
        );
        require(rs.max_memory_mb > 0, "resources.max_memory_mb must be > 0");
        require(rs.max_disk_space_mb > 0, "resources.max_disk_space_mb must be > 0");
        require(rs.max_network_bandwidth > 0, "resources.max_network_bandwidth must be > 0");
        require(rs.max_connections > 0, "resources.max_connections must be > 0");
        require(
            rs.max_concurrent_allocations > 0,
            "resources.max_concurrent_allocations must be > 0",
        );
        require(
            rs.warning_threshold > 0.0 && rs.critical_threshold <= 100.0,
            "resources thresholds must lie in (0, 100]",
        );
        require(
            rs.warning_threshold < rs.critical_threshold,
            "resources.warning_threshold must be below resources.critical_threshold",
        );
        require(
            rs.max_connections_per_module > 0,
            "resources.max_connections_per_module must be > 0",
        );
        require(rs.connection_timeout_ms > 0, "resources.connection_timeout_ms must be > 0");
        require(rs.sweep_interval_ms > 0, "resources.sweep_interval_ms must be > 0");
        require(rs.cache_default_ttl_ms > 0, "resources.cache_default_ttl_ms must be > 0");
        require(
            rs.cache_max_entries != Some(0),
            "resources.cache_max_entries must be > 0 when set",
        );

        if problems.is_empty() {
            Ok(())
        } else {
            Err(TetherError::Validation(problems.join("; ")))
        }
    }
}
