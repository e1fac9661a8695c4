//! Instance selection strategies
//!
//! Candidates are ordered by instance id before a strategy runs, so round-robin walks
//! the same cycle no matter how the registry orders its results.

use crate::types::{LoadBalancingConfig, LoadBalancingStrategy, RoutingContext, ServiceInstance};
use rand::Rng;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
struct StickySession {
    instance_id: Uuid,
    expires: Instant,
}

#[derive(Debug)]
pub struct LoadBalancer {
    config: LoadBalancingConfig,
    /// Per-service round-robin position
    counters: Mutex<HashMap<String, u64>>,
    /// Open connections per instance
    connections: Mutex<HashMap<Uuid, u64>>,
    sessions: Mutex<HashMap<String, StickySession>>,
}

impl LoadBalancer {
    pub fn new(config: LoadBalancingConfig) -> Self {
        Self {
            config,
            counters: Mutex::new(HashMap::new()),
            connections: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &LoadBalancingConfig {
        &self.config
    }

    /// Pick one instance for `service_name`, or `None` when no candidate is eligible
    pub fn select_instance(
        &self,
        service_name: &str,
        instances: &[ServiceInstance],
    ) -> Option<ServiceInstance> {
        self.route(service_name, instances, &RoutingContext::default())
    }

    /// Like [`select_instance`](Self::select_instance), with keys for the hash
    /// strategies and sticky sessions.
    ///
    /// Hash strategies without a usable key fall back to round-robin.
    pub fn route(
        &self,
        service_name: &str,
        instances: &[ServiceInstance],
        context: &RoutingContext,
    ) -> Option<ServiceInstance> {
        let mut candidates: Vec<&ServiceInstance> = if self.config.health_check_enabled {
            instances.iter().filter(|i| i.health.is_healthy()).collect()
        } else {
            instances.iter().collect()
        };

        if candidates.is_empty() && self.config.failover_enabled && !instances.is_empty() {
            debug!(service = %service_name, "no healthy instance, failing over to full list");
            candidates = instances.iter().collect();
        }

        if candidates.is_empty() {
            return None;
        }

        candidates.sort_by_key(|i| i.instance_id);

        let session_id = context
            .session_id
            .as_deref()
            .filter(|_| self.config.sticky_sessions);

        let pinned = session_id.and_then(|id| self.pinned_instance(id, &candidates));
        let chosen = match pinned {
            Some(instance) => instance,
            None => self.pick(service_name, &candidates, context),
        };

        if let Some(id) = session_id {
            self.pin(id, chosen.instance_id);
        }

        Some(chosen.clone())
    }

    fn pick<'a>(
        &self,
        service_name: &str,
        candidates: &[&'a ServiceInstance],
        context: &RoutingContext,
    ) -> &'a ServiceInstance {
        match self.config.strategy {
            LoadBalancingStrategy::RoundRobin => self.round_robin(service_name, candidates),
            LoadBalancingStrategy::WeightedRoundRobin => Self::weighted(candidates),
            LoadBalancingStrategy::Random => Self::random(candidates),
            LoadBalancingStrategy::LeastConnections => self.least_connections(candidates),
            LoadBalancingStrategy::WeightedLeastConnections => {
                self.weighted_least_connections(candidates)
            }
            LoadBalancingStrategy::ResponseTime => Self::fastest(candidates),
            LoadBalancingStrategy::ConsistentHash => {
                match (context.key.as_deref(), context.client_ip.as_deref()) {
                    (None, None) => self.unkeyed(service_name, candidates),
                    (key, ip) => Self::rendezvous(&(key, ip), candidates),
                }
            }
            LoadBalancingStrategy::IpHash => match context.client_ip.as_deref() {
                Some(ip) => candidates[(stable_hash(ip) % candidates.len() as u64) as usize],
                None => self.unkeyed(service_name, candidates),
            },
        }
    }

    fn unkeyed<'a>(
        &self,
        service_name: &str,
        candidates: &[&'a ServiceInstance],
    ) -> &'a ServiceInstance {
        debug!(service = %service_name, "hash strategy without a routing key, using round-robin");
        self.round_robin(service_name, candidates)
    }

    pub fn connection_opened(&self, instance_id: Uuid) {
        *self.connections_mut().entry(instance_id).or_insert(0) += 1;
    }

    pub fn connection_closed(&self, instance_id: Uuid) {
        let mut connections = self.connections_mut();
        if let Some(count) = connections.get_mut(&instance_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                connections.remove(&instance_id);
            }
        }
    }

    pub fn active_connections(&self, instance_id: Uuid) -> u64 {
        self.connections_mut().get(&instance_id).copied().unwrap_or(0)
    }

    /// Count a connection for as long as the returned guard lives
    pub fn track(self: &Arc<Self>, instance_id: Uuid) -> ConnectionTracker {
        self.connection_opened(instance_id);
        ConnectionTracker {
            balancer: Arc::clone(self),
            instance_id,
        }
    }

    /// Drop all state kept for a service and its instance
    pub fn forget(&self, service_name: &str, instance_id: Uuid) {
        self.connections_mut().remove(&instance_id);
        self.sessions_mut().retain(|_, s| s.instance_id != instance_id);
        if let Ok(mut counters) = self.counters.lock() {
            counters.remove(service_name);
        }
    }

    fn round_robin<'a>(
        &self,
        service_name: &str,
        candidates: &[&'a ServiceInstance],
    ) -> &'a ServiceInstance {
        let position = {
            let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
            let counter = counters.entry(service_name.to_string()).or_insert(0);
            let position = *counter;
            *counter = counter.wrapping_add(1);
            position
        };
        candidates[(position % candidates.len() as u64) as usize]
    }

    fn weighted<'a>(candidates: &[&'a ServiceInstance]) -> &'a ServiceInstance {
        let total: u64 = candidates.iter().map(|i| i.metadata.weight as u64).sum();
        if total == 0 {
            return Self::random(candidates);
        }

        let draw = rand::rng().random_range(0..total);
        let mut cumulative = 0;
        for &instance in candidates {
            cumulative += instance.metadata.weight as u64;
            if draw < cumulative {
                return instance;
            }
        }
        candidates[candidates.len() - 1]
    }

    fn random<'a>(candidates: &[&'a ServiceInstance]) -> &'a ServiceInstance {
        candidates[rand::rng().random_range(0..candidates.len())]
    }

    fn least_connections<'a>(&self, candidates: &[&'a ServiceInstance]) -> &'a ServiceInstance {
        let connections = self.connections_mut();
        let mut best = candidates[0];
        let mut best_count = connections.get(&best.instance_id).copied().unwrap_or(0);

        for &instance in &candidates[1..] {
            let count = connections.get(&instance.instance_id).copied().unwrap_or(0);
            if count < best_count {
                best = instance;
                best_count = count;
            }
        }
        best
    }

    fn weighted_least_connections<'a>(
        &self,
        candidates: &[&'a ServiceInstance],
    ) -> &'a ServiceInstance {
        let connections = self.connections_mut();
        let load = |i: &ServiceInstance| connections.get(&i.instance_id).copied().unwrap_or(0);

        let mut best = candidates[0];
        for &instance in &candidates[1..] {
            if lighter(
                (load(instance), instance.metadata.weight),
                (load(best), best.metadata.weight),
            ) {
                best = instance;
            }
        }
        best
    }

    /// Lowest measured response time; unmeasured instances rank last
    fn fastest<'a>(candidates: &[&'a ServiceInstance]) -> &'a ServiceInstance {
        let mut best = candidates[0];
        for &instance in &candidates[1..] {
            let faster = match (instance.health.response_time_ms, best.health.response_time_ms) {
                (Some(a), Some(b)) => a < b,
                (Some(_), None) => true,
                _ => false,
            };
            if faster {
                best = instance;
            }
        }
        best
    }

    /// Highest score of `hash(key, instance)`; only keys owned by a removed instance move
    fn rendezvous<'a, K: Hash>(
        key: &K,
        candidates: &[&'a ServiceInstance],
    ) -> &'a ServiceInstance {
        let mut best = candidates[0];
        let mut best_score = stable_hash(&(key, best.instance_id));
        for &instance in &candidates[1..] {
            let score = stable_hash(&(key, instance.instance_id));
            if score > best_score {
                best = instance;
                best_score = score;
            }
        }
        best
    }

    fn pinned_instance<'a>(
        &self,
        session_id: &str,
        candidates: &[&'a ServiceInstance],
    ) -> Option<&'a ServiceInstance> {
        let mut sessions = self.sessions_mut();
        let session = *sessions.get(session_id)?;
        if session.expires <= Instant::now() {
            sessions.remove(session_id);
            return None;
        }
        candidates
            .iter()
            .copied()
            .find(|i| i.instance_id == session.instance_id && i.health.is_healthy())
    }

    fn pin(&self, session_id: &str, instance_id: Uuid) {
        let now = Instant::now();
        let mut sessions = self.sessions_mut();
        sessions.retain(|_, s| s.expires > now);
        sessions.insert(
            session_id.to_string(),
            StickySession {
                instance_id,
                expires: now + self.config.sticky_session_ttl,
            },
        );
    }

    /// Live sticky sessions
    pub fn session_count(&self) -> usize {
        let now = Instant::now();
        self.sessions_mut().values().filter(|s| s.expires > now).count()
    }

    fn sessions_mut(&self) -> MutexGuard<'_, HashMap<String, StickySession>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn connections_mut(&self) -> MutexGuard<'_, HashMap<Uuid, u64>> {
        self.connections.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// `a.0 / a.1 < b.0 / b.1` over (connections, weight); zero weight ranks last
fn lighter(a: (u64, u32), b: (u64, u32)) -> bool {
    match (a.1, b.1) {
        (0, _) => false,
        (_, 0) => true,
        (wa, wb) => u128::from(a.0) * u128::from(wb) < u128::from(b.0) * u128::from(wa),
    }
}

fn stable_hash<T: Hash + ?Sized>(value: &T) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

/// Open-connection guard returned by [`LoadBalancer::track`]
#[derive(Debug)]
pub struct ConnectionTracker {
    balancer: Arc<LoadBalancer>,
    instance_id: Uuid,
}

impl ConnectionTracker {
    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }
}

impl Drop for ConnectionTracker {
    fn drop(&mut self) {
        self.balancer.connection_closed(self.instance_id);
    }
}
