//! Registrations, instances, queries and discovery configuration

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    #[default]
    Http,
    Https,
    Tcp,
    Grpc,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceMetadata {
    pub module_id: String,
    pub capabilities: Vec<String>,
    pub dependencies: Vec<String>,
    pub environment: String,
    pub region: Option<String>,
    pub zone: Option<String>,
    /// Relative share under `weighted_round_robin`
    pub weight: u32,
    pub priority: i32,
}

impl Default for ServiceMetadata {
    fn default() -> Self {
        Self {
            module_id: String::new(),
            capabilities: Vec::new(),
            dependencies: Vec::new(),
            environment: "production".to_string(),
            region: None,
            zone: None,
            weight: 1,
            priority: 0,
        }
    }
}

impl ServiceMetadata {
    /// String view of the metadata used by query filters
    pub fn get(&self, key: &str) -> Option<String> {
        match key {
            "module_id" => Some(self.module_id.clone()),
            "environment" => Some(self.environment.clone()),
            "region" => self.region.clone(),
            "zone" => self.zone.clone(),
            "weight" => Some(self.weight.to_string()),
            "priority" => Some(self.priority.to_string()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthCheckKind {
    Http,
    Tcp,
    /// Liveness pushed by the service through heartbeats
    #[default]
    Ttl,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    pub kind: HealthCheckKind,
    /// Path or full URL for HTTP checks; `/health` when unset
    pub endpoint: Option<String>,
    /// Minimum time between two checks of this service
    pub interval: Duration,
    pub timeout: Duration,
    /// Extra attempts within one check
    pub retries: u32,
    /// Consecutive failed checks before automatic deregistration; zero disables it
    pub deregister_after: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            kind: HealthCheckKind::Ttl,
            endpoint: None,
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
            retries: 0,
            deregister_after: 0,
        }
    }
}

/// What a service submits to become discoverable
#[derive(Debug, Clone, Default)]
pub struct ServiceDefinition {
    pub service_name: String,
    pub version: String,
    pub address: String,
    pub port: u16,
    pub protocol: Protocol,
    pub metadata: ServiceMetadata,
    pub health_check: HealthCheckConfig,
    pub tags: Vec<String>,
}

impl ServiceDefinition {
    pub fn new(service_name: impl Into<String>, address: impl Into<String>, port: u16) -> Self {
        Self {
            service_name: service_name.into(),
            version: "1.0.0".to_string(),
            address: address.into(),
            port,
            ..Default::default()
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_metadata(mut self, metadata: ServiceMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_health_check(mut self, health_check: HealthCheckConfig) -> Self {
        self.health_check = health_check;
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }
}

/// A registered service
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceRegistration {
    pub service_id: Uuid,
    pub service_name: String,
    pub version: String,
    pub address: String,
    pub port: u16,
    pub protocol: Protocol,
    pub metadata: ServiceMetadata,
    pub health_check: HealthCheckConfig,
    pub tags: Vec<String>,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

impl ServiceRegistration {
    pub(crate) fn from_definition(definition: ServiceDefinition) -> Self {
        let now = Utc::now();
        Self {
            service_id: Uuid::new_v4(),
            service_name: definition.service_name,
            version: definition.version,
            address: definition.address,
            port: definition.port,
            protocol: definition.protocol,
            metadata: definition.metadata,
            health_check: definition.health_check,
            tags: definition.tags,
            registered_at: now,
            last_heartbeat: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Unhealthy,
    Warning,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthStatus {
    pub status: HealthState,
    pub last_check: DateTime<Utc>,
    pub consecutive_failures: u32,
    pub message: Option<String>,
    pub response_time_ms: Option<f64>,
}

impl HealthStatus {
    pub fn healthy() -> Self {
        Self {
            status: HealthState::Healthy,
            last_check: Utc::now(),
            consecutive_failures: 0,
            message: None,
            response_time_ms: None,
        }
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self {
            status: HealthState::Unhealthy,
            last_check: Utc::now(),
            consecutive_failures: 1,
            message: Some(message.into()),
            response_time_ms: None,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthState::Healthy
    }
}

/// Discoverable, health-annotated view of a registration
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceInstance {
    pub instance_id: Uuid,
    pub service_id: Uuid,
    pub service_name: String,
    pub version: String,
    pub address: String,
    pub port: u16,
    pub protocol: Protocol,
    pub metadata: ServiceMetadata,
    pub tags: Vec<String>,
    pub health: HealthStatus,
    pub last_seen: DateTime<Utc>,
}

impl ServiceInstance {
    pub fn from_registration(registration: &ServiceRegistration) -> Self {
        Self {
            instance_id: Uuid::new_v4(),
            service_id: registration.service_id,
            service_name: registration.service_name.clone(),
            version: registration.version.clone(),
            address: registration.address.clone(),
            port: registration.port,
            protocol: registration.protocol,
            metadata: registration.metadata.clone(),
            tags: registration.tags.clone(),
            health: HealthStatus::healthy(),
            last_seen: Utc::now(),
        }
    }

    /// `address:port`
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// Filters for `discover_services`; every supplied predicate must match
#[derive(Debug, Clone, Default)]
pub struct ServiceQuery {
    pub service_name: Option<String>,
    pub healthy_only: bool,
    pub region: Option<String>,
    pub zone: Option<String>,
    /// Instance must carry every listed tag
    pub tags: Vec<String>,
    pub metadata: HashMap<String, String>,
}

impl ServiceQuery {
    pub fn service(name: impl Into<String>) -> Self {
        Self {
            service_name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn healthy_only(mut self) -> Self {
        self.healthy_only = true;
        self
    }

    pub fn in_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn in_zone(mut self, zone: impl Into<String>) -> Self {
        self.zone = Some(zone.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn matches(&self, instance: &ServiceInstance) -> bool {
        if let Some(name) = &self.service_name {
            if &instance.service_name != name {
                return false;
            }
        }
        if self.healthy_only && !instance.health.is_healthy() {
            return false;
        }
        if let Some(region) = &self.region {
            if instance.metadata.region.as_ref() != Some(region) {
                return false;
            }
        }
        if let Some(zone) = &self.zone {
            if instance.metadata.zone.as_ref() != Some(zone) {
                return false;
            }
        }
        if !self.tags.iter().all(|t| instance.tags.contains(t)) {
            return false;
        }
        self.metadata
            .iter()
            .all(|(k, v)| instance.metadata.get(k).as_ref() == Some(v))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingStrategy {
    #[default]
    RoundRobin,
    WeightedRoundRobin,
    Random,
    LeastConnections,
    /// Fewest open connections relative to `metadata.weight`
    WeightedLeastConnections,
    /// Lowest last measured probe response time
    ResponseTime,
    /// Rendezvous hash of the routing key and client address
    ConsistentHash,
    /// Hash of the client address
    IpHash,
}

impl LoadBalancingStrategy {
    /// Whether selection depends on [`RoutingContext`] keys
    pub fn is_hash_based(&self) -> bool {
        matches!(
            self,
            LoadBalancingStrategy::ConsistentHash | LoadBalancingStrategy::IpHash
        )
    }
}

#[derive(Debug, Clone)]
pub struct LoadBalancingConfig {
    pub strategy: LoadBalancingStrategy,
    /// Only select healthy instances
    pub health_check_enabled: bool,
    /// Fall back to unhealthy instances when no healthy one exists
    pub failover_enabled: bool,
    /// Route calls carrying the same session id to the same instance
    pub sticky_sessions: bool,
    pub sticky_session_ttl: Duration,
}

impl Default for LoadBalancingConfig {
    fn default() -> Self {
        Self {
            strategy: LoadBalancingStrategy::RoundRobin,
            health_check_enabled: true,
            failover_enabled: true,
            sticky_sessions: false,
            sticky_session_ttl: Duration::from_secs(3600),
        }
    }
}

/// Per-call hints for hash strategies and sticky sessions
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingContext {
    /// Affinity key such as a request path or tenant id
    pub key: Option<String>,
    pub client_ip: Option<String>,
    pub session_id: Option<String>,
}

impl RoutingContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_client_ip(mut self, client_ip: impl Into<String>) -> Self {
        self.client_ip = Some(client_ip.into());
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Period of the health-check loop; zero disables the loop
    pub health_check_interval: Duration,
    /// Heartbeat age after which a TTL-checked service is unhealthy
    pub ttl: Duration,
    pub load_balancing: LoadBalancingConfig,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            health_check_interval: Duration::from_secs(30),
            ttl: Duration::from_secs(30),
            load_balancing: LoadBalancingConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(tags: &[&str], region: Option<&str>) -> ServiceInstance {
        let registration = ServiceRegistration::from_definition(
            ServiceDefinition::new("billing", "10.0.0.1", 8080)
                .with_tags(tags.iter().copied())
                .with_metadata(ServiceMetadata {
                    region: region.map(str::to_string),
                    module_id: "billing-core".into(),
                    ..Default::default()
                }),
        );
        ServiceInstance::from_registration(&registration)
    }

    #[test]
    fn test_query_predicates_are_anded() {
        let i = instance(&["v2", "canary"], Some("eu-west"));

        assert!(ServiceQuery::service("billing").matches(&i));
        assert!(!ServiceQuery::service("search").matches(&i));
        assert!(ServiceQuery::service("billing")
            .in_region("eu-west")
            .with_tag("canary")
            .matches(&i));
        assert!(!ServiceQuery::default()
            .in_region("eu-west")
            .with_tag("stable")
            .matches(&i));
        assert!(!ServiceQuery::default().in_zone("a").matches(&i));
    }

    #[test]
    fn test_metadata_filter() {
        let i = instance(&[], None);
        assert!(ServiceQuery::default()
            .with_metadata("module_id", "billing-core")
            .with_metadata("weight", "1")
            .matches(&i));
        assert!(!ServiceQuery::default()
            .with_metadata("environment", "staging")
            .matches(&i));
    }

    #[test]
    fn test_healthy_only() {
        let mut i = instance(&[], None);
        assert!(ServiceQuery::default().healthy_only().matches(&i));
        i.health = HealthStatus::unhealthy("down");
        assert!(!ServiceQuery::default().healthy_only().matches(&i));
    }
}
