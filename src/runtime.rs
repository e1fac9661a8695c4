/*!
 * Tether runtime: one handle over every coordination component
 *
 * `Tether::start` validates the configuration, builds the four components with
 * in-memory backends (or the ones handed to `TetherBuilder`), and connects the lock
 * manager. `shutdown` stops every background task and disconnects.
 */

use crate::config::TetherConfig;
use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tether_core_discovery::{
    MemoryRegistry, NetworkProbe, ProbeExecutor, RegistryProvider, ServiceDiscovery,
    ServiceInstance, ServiceQuery,
};
use tether_core_locking::{DistributedLockManager, LockProvider, LockStatistics, MemoryLockProvider};
use tether_core_resilience::{CircuitBreaker, CircuitBreakerManager, CircuitBreakerStatus};
use tether_core_resources::{Connector, ResourceLimitStatus, ResourceManager, SimulatedConnector};
use tracing::{info, warn};

/// Point-in-time view across all components
#[derive(Debug, Clone, Serialize)]
pub struct TetherStatus {
    pub timestamp: DateTime<Utc>,
    pub circuit_breakers: BTreeMap<String, CircuitBreakerStatus>,
    pub locks: LockStatistics,
    pub services: Vec<ServiceInstance>,
    pub resources: ResourceLimitStatus,
}

/// Builder for [`Tether`] with optional backend overrides
pub struct TetherBuilder {
    config: TetherConfig,
    lock_provider: Option<Arc<dyn LockProvider>>,
    registry: Option<Arc<dyn RegistryProvider>>,
    probe: Option<Arc<dyn ProbeExecutor>>,
    connector: Option<Arc<dyn Connector>>,
}

impl TetherBuilder {
    pub fn new(config: TetherConfig) -> Self {
        Self {
            config,
            lock_provider: None,
            registry: None,
            probe: None,
            connector: None,
        }
    }

    pub fn lock_provider(mut self, provider: Arc<dyn LockProvider>) -> Self {
        self.lock_provider = Some(provider);
        self
    }

    pub fn registry(mut self, registry: Arc<dyn RegistryProvider>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn probe(mut self, probe: Arc<dyn ProbeExecutor>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Build every component and connect the lock manager
    pub async fn start(self) -> Result<Tether> {
        self.config.validate()?;
        let config = self.config;

        let probe: Arc<dyn ProbeExecutor> = match self.probe {
            Some(probe) => probe,
            None => Arc::new(NetworkProbe::new()?),
        };
        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(MemoryRegistry::new()) as Arc<dyn RegistryProvider>);
        let lock_provider = self
            .lock_provider
            .unwrap_or_else(|| Arc::new(MemoryLockProvider::new()) as Arc<dyn LockProvider>);
        let connector = self.connector.unwrap_or_else(|| {
            Arc::new(SimulatedConnector::new(Duration::from_millis(
                config.resources.connect_latency_ms,
            ))) as Arc<dyn Connector>
        });

        let breakers = CircuitBreakerManager::new(config.circuit_breaker.to_manager_config());
        let locks = DistributedLockManager::new(config.locking.to_lock_config(), lock_provider);
        let discovery =
            ServiceDiscovery::new(config.discovery.to_discovery_config(), registry, probe);
        let resources =
            ResourceManager::with_connector(config.resources.to_resource_config(), connector);

        if let Err(e) = locks.connect().await {
            breakers.shutdown();
            discovery.shutdown();
            resources.shutdown();
            return Err(e.into());
        }

        info!("tether started");
        Ok(Tether {
            config,
            breakers,
            locks,
            discovery,
            resources,
        })
    }
}

#[derive(Debug)]
pub struct Tether {
    config: TetherConfig,
    breakers: Arc<CircuitBreakerManager>,
    locks: Arc<DistributedLockManager>,
    discovery: Arc<ServiceDiscovery>,
    resources: Arc<ResourceManager>,
}

impl Tether {
    /// Start with in-memory backends
    pub async fn start(config: TetherConfig) -> Result<Self> {
        TetherBuilder::new(config).start().await
    }

    pub fn builder(config: TetherConfig) -> TetherBuilder {
        TetherBuilder::new(config)
    }

    pub fn config(&self) -> &TetherConfig {
        &self.config
    }

    pub fn circuit_breakers(&self) -> &Arc<CircuitBreakerManager> {
        &self.breakers
    }

    pub fn locks(&self) -> &Arc<DistributedLockManager> {
        &self.locks
    }

    pub fn discovery(&self) -> &Arc<ServiceDiscovery> {
        &self.discovery
    }

    pub fn resources(&self) -> &Arc<ResourceManager> {
        &self.resources
    }

    /// Breaker for `name`, created with any per-name overrides from the configuration
    pub async fn circuit_breaker(&self, name: &str) -> CircuitBreaker {
        self.breakers
            .get_circuit_breaker(name, self.config.circuit_breaker.breakers.get(name))
            .await
    }

    pub async fn status(&self) -> TetherStatus {
        let services = match self.discovery.discover_services(&ServiceQuery::default()).await {
            Ok(services) => services,
            Err(e) => {
                warn!(error = %e, "service listing failed while building status");
                Vec::new()
            }
        };

        TetherStatus {
            timestamp: Utc::now(),
            circuit_breakers: self.breakers.get_all_status().await.into_iter().collect(),
            locks: self.locks.get_statistics().await,
            services,
            resources: self.resources.check_resource_limits(),
        }
    }

    /// Stop background tasks, release held locks and close pooled connections.
    ///
    /// Teardown is best-effort; backend errors are logged by the components.
    pub async fn shutdown(&self) {
        self.breakers.shutdown();
        self.discovery.shutdown();
        self.resources.shutdown();
        self.locks.disconnect().await;
        info!("tether stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core_discovery::{ScriptedProbe, ServiceDefinition};
    use tether_core_locking::LockRequest;

    fn quiet_config() -> TetherConfig {
        let mut config = TetherConfig::default();
        config.circuit_breaker.metrics_enabled = false;
        config.resources.sample_host = false;
        config.resources.connect_latency_ms = 1;
        config
    }

    async fn start() -> Tether {
        Tether::builder(quiet_config())
            .probe(Arc::new(ScriptedProbe::new()))
            .start()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let mut config = quiet_config();
        config.resources.critical_threshold = 50.0;

        let err = Tether::start(config).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ValidationError);
    }

    #[tokio::test]
    async fn test_per_name_overrides() {
        let mut config = quiet_config();
        config.circuit_breaker.breakers.insert(
            "payments".into(),
            tether_core_resilience::CircuitBreakerOverrides {
                failure_threshold: Some(1),
                ..Default::default()
            },
        );
        let tether = Tether::builder(config)
            .probe(Arc::new(ScriptedProbe::new()))
            .start()
            .await
            .unwrap();

        assert_eq!(tether.circuit_breaker("payments").await.config().failure_threshold, 1);
        assert_eq!(tether.circuit_breaker("search").await.config().failure_threshold, 5);
        tether.shutdown().await;
    }

    #[tokio::test]
    async fn test_status_snapshot() {
        let tether = start().await;
        tether.circuit_breaker("db").await;
        tether
            .discovery()
            .register_service(ServiceDefinition::new("api", "127.0.0.1", 8080))
            .await
            .unwrap();
        let held = tether
            .locks()
            .acquire_lock(LockRequest::new("report", "worker-1"))
            .await;
        assert!(held.is_success());

        let status = tether.status().await;
        assert!(status.circuit_breakers.contains_key("db"));
        assert_eq!(status.services.len(), 1);
        assert_eq!(status.locks.active_locks, 1);
        assert!(status.resources.violations.is_empty());

        let json = serde_json::to_value(&status).unwrap();
        assert!(json.get("circuit_breakers").is_some());
        assert!(json["resources"]["current"]["cpu"].is_object());

        tether.shutdown().await;
        assert_eq!(tether.locks().get_statistics().await.active_locks, 0);
    }
}
