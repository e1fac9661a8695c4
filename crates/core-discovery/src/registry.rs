//! Registry backend interface and the in-memory registry

use crate::error::{DiscoveryError, Result};
use crate::types::{HealthStatus, ServiceInstance, ServiceRegistration};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Persistence for registrations (Consul, etcd, ZooKeeper, ...)
#[async_trait]
pub trait RegistryProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Store a registration and return its discoverable instance
    async fn register(&self, registration: &ServiceRegistration) -> Result<ServiceInstance>;

    async fn deregister(&self, service_id: Uuid) -> Result<()>;

    /// Instances of `service_name`, or of every service when `None`
    async fn discover(&self, service_name: Option<&str>) -> Result<Vec<ServiceInstance>>;

    async fn update_health(&self, service_id: Uuid, health: &HealthStatus) -> Result<()>;
}

/// One instance per registration, kept in process
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    instances: RwLock<HashMap<Uuid, ServiceInstance>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RegistryProvider for MemoryRegistry {
    fn name(&self) -> &str {
        "memory"
    }

    async fn register(&self, registration: &ServiceRegistration) -> Result<ServiceInstance> {
        let instance = ServiceInstance::from_registration(registration);
        self.instances
            .write()
            .await
            .insert(registration.service_id, instance.clone());
        Ok(instance)
    }

    async fn deregister(&self, service_id: Uuid) -> Result<()> {
        self.instances
            .write()
            .await
            .remove(&service_id)
            .map(|_| ())
            .ok_or_else(|| DiscoveryError::NotFound(service_id.to_string()))
    }

    async fn discover(&self, service_name: Option<&str>) -> Result<Vec<ServiceInstance>> {
        Ok(self
            .instances
            .read()
            .await
            .values()
            .filter(|i| service_name.map_or(true, |name| i.service_name == name))
            .cloned()
            .collect())
    }

    async fn update_health(&self, service_id: Uuid, health: &HealthStatus) -> Result<()> {
        let mut instances = self.instances.write().await;
        let instance = instances
            .get_mut(&service_id)
            .ok_or_else(|| DiscoveryError::NotFound(service_id.to_string()))?;
        instance.health = health.clone();
        instance.last_seen = Utc::now();
        Ok(())
    }
}
