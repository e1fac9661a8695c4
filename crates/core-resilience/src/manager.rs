//! Named registry of circuit breakers
//!
//! Breakers are created on first use by merging the built-in defaults, the manager's
//! global overrides and the per-call overrides, in that order.

use super::circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerMetrics, CircuitBreakerOverrides,
    CircuitBreakerStatus,
};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Manager-wide settings
#[derive(Debug, Clone)]
pub struct CircuitBreakerManagerConfig {
    /// Global overrides applied to every breaker the manager creates
    pub defaults: CircuitBreakerOverrides,
    /// Periodically log per-breaker metrics
    pub metrics_enabled: bool,
    pub monitoring_period: Duration,
}

impl Default for CircuitBreakerManagerConfig {
    fn default() -> Self {
        Self {
            defaults: CircuitBreakerOverrides::default(),
            metrics_enabled: true,
            monitoring_period: Duration::from_secs(10),
        }
    }
}

#[derive(Debug)]
pub struct CircuitBreakerManager {
    config: CircuitBreakerManagerConfig,
    breakers: RwLock<HashMap<String, CircuitBreaker>>,
    shutdown: CancellationToken,
}

impl CircuitBreakerManager {
    /// Create the manager and, when metrics are enabled, start the monitoring task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: CircuitBreakerManagerConfig) -> Arc<Self> {
        let manager = Arc::new(Self {
            config,
            breakers: RwLock::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        });

        if manager.config.metrics_enabled && !manager.config.monitoring_period.is_zero() {
            tokio::spawn(Self::monitor(
                Arc::downgrade(&manager),
                manager.shutdown.clone(),
                manager.config.monitoring_period,
            ));
        }

        manager
    }

    /// Get the breaker registered under `name`, creating it if needed.
    ///
    /// Overrides are only used on creation; an existing breaker is returned unchanged.
    pub async fn get_circuit_breaker(
        &self,
        name: &str,
        overrides: Option<&CircuitBreakerOverrides>,
    ) -> CircuitBreaker {
        if let Some(breaker) = self.breakers.read().await.get(name) {
            return breaker.clone();
        }

        let mut breakers = self.breakers.write().await;
        breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                let mut config = CircuitBreakerConfig::named(name).apply(&self.config.defaults);
                if let Some(overrides) = overrides {
                    config = config.apply(overrides);
                }
                info!(breaker = %name, "created circuit breaker");
                CircuitBreaker::new(config)
            })
            .clone()
    }

    pub async fn get_all_status(&self) -> HashMap<String, CircuitBreakerStatus> {
        let breakers: Vec<_> = self.breakers.read().await.values().cloned().collect();
        let mut out = HashMap::with_capacity(breakers.len());
        for breaker in breakers {
            out.insert(breaker.name().to_string(), breaker.get_status().await);
        }
        out
    }

    pub async fn get_all_metrics(&self) -> HashMap<String, CircuitBreakerMetrics> {
        let breakers: Vec<_> = self.breakers.read().await.values().cloned().collect();
        let mut out = HashMap::with_capacity(breakers.len());
        for breaker in breakers {
            out.insert(breaker.name().to_string(), breaker.get_metrics().await);
        }
        out
    }

    pub async fn reset_all(&self) {
        let breakers: Vec<_> = self.breakers.read().await.values().cloned().collect();
        for breaker in &breakers {
            breaker.reset().await;
        }
        info!(count = breakers.len(), "reset all circuit breakers");
    }

    /// Remove a breaker; clones held by callers keep working
    pub async fn remove(&self, name: &str) -> bool {
        self.breakers.write().await.remove(name).is_some()
    }

    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.breakers.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Stop the monitoring task
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    async fn monitor(manager: Weak<Self>, shutdown: CancellationToken, period: Duration) {
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

            for (name, metrics) in manager.get_all_metrics().await {
                debug!(
                    breaker = %name,
                    state = %metrics.current_state,
                    total_calls = metrics.total_calls,
                    failure_rate = metrics.failure_rate,
                    avg_response_ms = metrics.average_response_time_ms,
                    "circuit breaker metrics"
                );
            }
        }
    }
}

impl Drop for CircuitBreakerManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitState;
    use crate::error::ResilienceError;

    fn quiet() -> CircuitBreakerManagerConfig {
        CircuitBreakerManagerConfig {
            metrics_enabled: false,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_get_circuit_breaker_is_lazy_and_shared() {
        let manager = CircuitBreakerManager::new(quiet());
        assert!(manager.names().await.is_empty());

        let a = manager.get_circuit_breaker("payments", None).await;
        let b = manager.get_circuit_breaker("payments", None).await;

        a.execute(|| async { Err::<(), _>(ResilienceError::Transient("x".into())) })
            .await;
        assert_eq!(b.get_failure_count().await, 1);
        assert_eq!(manager.names().await, vec!["payments".to_string()]);
    }

    #[tokio::test]
    async fn test_overrides_merge_order() {
        let manager = CircuitBreakerManager::new(CircuitBreakerManagerConfig {
            defaults: CircuitBreakerOverrides {
                failure_threshold: Some(10),
                success_threshold: Some(4),
                ..Default::default()
            },
            metrics_enabled: false,
            ..Default::default()
        });

        let breaker = manager
            .get_circuit_breaker(
                "search",
                Some(&CircuitBreakerOverrides {
                    failure_threshold: Some(2),
                    ..Default::default()
                }),
            )
            .await;

        assert_eq!(breaker.config().failure_threshold, 2);
        assert_eq!(breaker.config().success_threshold, 4);
        assert_eq!(breaker.config().half_open_max_calls, 3);
        assert_eq!(breaker.name(), "search");
    }

    #[tokio::test]
    async fn test_reset_all_and_status() {
        let manager = CircuitBreakerManager::new(quiet());
        let overrides = CircuitBreakerOverrides {
            failure_threshold: Some(1),
            ..Default::default()
        };

        for name in ["a", "b"] {
            let breaker = manager.get_circuit_breaker(name, Some(&overrides)).await;
            breaker
                .execute(|| async { Err::<(), _>(ResilienceError::Transient("x".into())) })
                .await;
        }

        let status = manager.get_all_status().await;
        assert_eq!(status.len(), 2);
        assert!(status.values().all(|s| s.state == CircuitState::Open));

        manager.reset_all().await;

        let metrics = manager.get_all_metrics().await;
        assert!(metrics
            .values()
            .all(|m| m.current_state == CircuitState::Closed));
    }

    #[tokio::test]
    async fn test_remove() {
        let manager = CircuitBreakerManager::new(quiet());
        manager.get_circuit_breaker("gone", None).await;

        assert!(manager.remove("gone").await);
        assert!(!manager.remove("gone").await);
        assert!(manager.names().await.is_empty());
    }

    #[tokio::test]
    async fn test_monitor_stops_on_shutdown() {
        let manager = CircuitBreakerManager::new(CircuitBreakerManagerConfig {
            monitoring_period: Duration::from_millis(5),
            ..Default::default()
        });
        manager.get_circuit_breaker("watched", None).await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        manager.shutdown();
        assert!(manager.shutdown.is_cancelled());
    }
}
