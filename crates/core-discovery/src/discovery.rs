//! Service directory with background health checking
//!
//! Registrations and their instances are mirrored locally; the registry provider is the
//! source of discovery results and local health is overlaid on top of them.

use crate::balancer::LoadBalancer;
use crate::error::{DiscoveryError, Result};
use crate::probe::{NetworkProbe, ProbeExecutor, ProbeOutcome};
use crate::registry::{MemoryRegistry, RegistryProvider};
use crate::types::{
    DiscoveryConfig, HealthCheckKind, HealthState, HealthStatus, RoutingContext,
    ServiceDefinition, ServiceInstance, ServiceQuery, ServiceRegistration,
};
use chrono::Utc;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub struct ServiceDiscovery {
    config: DiscoveryConfig,
    provider: Arc<dyn RegistryProvider>,
    probe: Arc<dyn ProbeExecutor>,
    balancer: Arc<LoadBalancer>,
    registrations: RwLock<HashMap<Uuid, ServiceRegistration>>,
    instances: RwLock<HashMap<Uuid, ServiceInstance>>,
    last_checked: StdMutex<HashMap<Uuid, Instant>>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for ServiceDiscovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceDiscovery")
            .field("config", &self.config)
            .field("provider", &self.provider.name())
            .finish()
    }
}

impl ServiceDiscovery {
    /// Create the directory and start the health-check loop.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        config: DiscoveryConfig,
        provider: Arc<dyn RegistryProvider>,
        probe: Arc<dyn ProbeExecutor>,
    ) -> Arc<Self> {
        let discovery = Arc::new(Self {
            balancer: Arc::new(LoadBalancer::new(config.load_balancing.clone())),
            config,
            provider,
            probe,
            registrations: RwLock::new(HashMap::new()),
            instances: RwLock::new(HashMap::new()),
            last_checked: StdMutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        });

        if !discovery.config.health_check_interval.is_zero() {
            tokio::spawn(Self::health_loop(
                Arc::downgrade(&discovery),
                discovery.shutdown.clone(),
                discovery.config.health_check_interval,
            ));
        }

        discovery
    }

    /// In-memory registry with network probes
    pub fn in_memory(config: DiscoveryConfig) -> Result<Arc<Self>> {
        Ok(Self::new(
            config,
            Arc::new(MemoryRegistry::new()),
            Arc::new(NetworkProbe::new()?),
        ))
    }

    pub fn load_balancer(&self) -> &Arc<LoadBalancer> {
        &self.balancer
    }

    pub async fn register_service(
        &self,
        definition: ServiceDefinition,
    ) -> Result<ServiceRegistration> {
        validate(&definition)?;

        let registration = ServiceRegistration::from_definition(definition);
        let instance = self.provider.register(&registration).await?;

        self.instances
            .write()
            .await
            .insert(registration.service_id, instance);
        self.registrations
            .write()
            .await
            .insert(registration.service_id, registration.clone());

        info!(
            service_id = %registration.service_id,
            service = %registration.service_name,
            endpoint = %format!("{}:{}", registration.address, registration.port),
            "service registered"
        );
        Ok(registration)
    }

    pub async fn deregister_service(&self, service_id: Uuid) -> Result<()> {
        let Some(registration) = self.registrations.write().await.remove(&service_id) else {
            return Err(DiscoveryError::NotFound(service_id.to_string()));
        };

        let instance = self.instances.write().await.remove(&service_id);
        if let Ok(mut last) = self.last_checked.lock() {
            last.remove(&service_id);
        }
        if let Some(instance) = instance {
            self.balancer
                .forget(&registration.service_name, instance.instance_id);
        }

        match self.provider.deregister(service_id).await {
            Ok(()) | Err(DiscoveryError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        info!(
            service_id = %service_id,
            service = %registration.service_name,
            "service deregistered"
        );
        Ok(())
    }

    /// Provider lookup by name, local health overlay, then client-side filters
    pub async fn discover_services(&self, query: &ServiceQuery) -> Result<Vec<ServiceInstance>> {
        let mut found = self.provider.discover(query.service_name.as_deref()).await?;

        {
            let local = self.instances.read().await;
            for instance in &mut found {
                if let Some(known) = local.get(&instance.service_id) {
                    instance.health = known.health.clone();
                    instance.last_seen = known.last_seen;
                }
            }
        }

        found.retain(|i| query.matches(i));
        Ok(found)
    }

    /// Discover instances of `service_name` and let the load balancer pick one
    pub async fn get_service_instance(
        &self,
        service_name: &str,
        query: Option<ServiceQuery>,
    ) -> Result<Option<ServiceInstance>> {
        self.get_service_instance_for(service_name, query, &RoutingContext::default())
            .await
    }

    /// [`get_service_instance`](Self::get_service_instance) with routing keys for hash
    /// strategies and sticky sessions
    pub async fn get_service_instance_for(
        &self,
        service_name: &str,
        query: Option<ServiceQuery>,
        context: &RoutingContext,
    ) -> Result<Option<ServiceInstance>> {
        let query = ServiceQuery {
            service_name: Some(service_name.to_string()),
            ..query.unwrap_or_default()
        };
        let instances = self.discover_services(&query).await?;
        Ok(self.balancer.route(service_name, &instances, context))
    }

    pub async fn update_health_status(&self, service_id: Uuid, health: HealthStatus) -> Result<()> {
        {
            let mut instances = self.instances.write().await;
            let instance = instances
                .get_mut(&service_id)
                .ok_or_else(|| DiscoveryError::NotFound(service_id.to_string()))?;
            instance.health = health.clone();
            instance.last_seen = Utc::now();
        }

        self.provider.update_health(service_id, &health).await
    }

    /// Refresh the heartbeat used by `ttl` health checks
    pub async fn heartbeat(&self, service_id: Uuid) -> Result<()> {
        let mut registrations = self.registrations.write().await;
        let registration = registrations
            .get_mut(&service_id)
            .ok_or_else(|| DiscoveryError::NotFound(service_id.to_string()))?;
        registration.last_heartbeat = Utc::now();
        debug!(service_id = %service_id, "heartbeat");
        Ok(())
    }

    pub async fn registrations(&self) -> Vec<ServiceRegistration> {
        self.registrations.read().await.values().cloned().collect()
    }

    pub async fn get_registration(&self, service_id: Uuid) -> Option<ServiceRegistration> {
        self.registrations.read().await.get(&service_id).cloned()
    }

    /// Probe every registration whose own interval has elapsed
    pub async fn run_health_checks(&self) {
        let due: Vec<ServiceRegistration> = {
            let registrations = self.registrations.read().await;
            let last = self.last_checked.lock().unwrap_or_else(|e| e.into_inner());
            registrations
                .values()
                .filter(|r| {
                    last.get(&r.service_id)
                        .map_or(true, |at| at.elapsed() >= r.health_check.interval)
                })
                .cloned()
                .collect()
        };

        if due.is_empty() {
            return;
        }

        let checks = due.iter().map(|r| self.check_one(r));
        let outcomes = join_all(checks).await;

        for (registration, outcome) in due.iter().zip(outcomes) {
            self.apply_outcome(registration, outcome).await;
        }
    }

    async fn check_one(&self, registration: &ServiceRegistration) -> ProbeOutcome {
        let attempts = match registration.health_check.kind {
            HealthCheckKind::Ttl => 1,
            _ => registration.health_check.retries + 1,
        };

        let mut outcome = ProbeOutcome::unhealthy("not probed");
        for _ in 0..attempts {
            outcome = self.probe.probe(registration, self.config.ttl).await;
            if outcome.healthy {
                break;
            }
        }

        self.last_checked
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(registration.service_id, Instant::now());
        outcome
    }

    async fn apply_outcome(&self, registration: &ServiceRegistration, outcome: ProbeOutcome) {
        let previous_failures = self
            .instances
            .read()
            .await
            .get(&registration.service_id)
            .map(|i| i.health.consecutive_failures)
            .unwrap_or(0);

        let consecutive_failures = if outcome.healthy {
            0
        } else {
            previous_failures + 1
        };

        let health = HealthStatus {
            status: if outcome.healthy {
                HealthState::Healthy
            } else {
                HealthState::Unhealthy
            },
            last_check: Utc::now(),
            consecutive_failures,
            message: outcome.message,
            response_time_ms: outcome.response_time.map(|d| d.as_secs_f64() * 1000.0),
        };

        if !health.is_healthy() {
            warn!(
                service_id = %registration.service_id,
                service = %registration.service_name,
                failures = consecutive_failures,
                message = health.message.as_deref().unwrap_or(""),
                "health check failed"
            );
        }

        let threshold = registration.health_check.deregister_after;
        if threshold > 0 && consecutive_failures >= threshold {
            warn!(
                service_id = %registration.service_id,
                "deregistering service after repeated health check failures"
            );
            if let Err(e) = self.deregister_service(registration.service_id).await {
                warn!(
                    service_id = %registration.service_id,
                    error = %e,
                    "automatic deregistration failed"
                );
            }
            return;
        }

        if let Err(e) = self.update_health_status(registration.service_id, health).await {
            // Deregistered while the probe was in flight
            debug!(service_id = %registration.service_id, error = %e, "health update skipped");
        }
    }

    /// Stop the health-check loop
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    async fn health_loop(discovery: Weak<Self>, shutdown: CancellationToken, period: Duration) {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let Some(discovery) = discovery.upgrade() else {
                break;
            };
            discovery.run_health_checks().await;
        }
    }
}

impl Drop for ServiceDiscovery {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn validate(definition: &ServiceDefinition) -> Result<()> {
    if definition.service_name.trim().is_empty() {
        return Err(DiscoveryError::Validation("service_name must not be empty".into()));
    }
    if definition.address.trim().is_empty() {
        return Err(DiscoveryError::Validation("address must not be empty".into()));
    }
    if definition.port == 0 {
        return Err(DiscoveryError::Validation("port must not be zero".into()));
    }
    if definition.health_check.kind != HealthCheckKind::Ttl
        && definition.health_check.timeout.is_zero()
    {
        return Err(DiscoveryError::Validation("health check timeout must not be zero".into()));
    }
    Ok(())
}
