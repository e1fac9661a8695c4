//! End-to-end behaviour through the `Tether` handle

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tether::discovery::{ScriptedProbe, ServiceDefinition};
use tether::locking::{LockErrorKind, LockRequest};
use tether::resilience::{CircuitBreakerOverrides, CircuitState, ResilienceError};
use tether::resources::ResourceRequirements;
use tether::{Tether, TetherConfig};
use uuid::Uuid;

fn quiet_config() -> TetherConfig {
    let mut config = TetherConfig::default();
    config.circuit_breaker.metrics_enabled = false;
    config.resources.sample_host = false;
    config.resources.connect_latency_ms = 1;
    config
}

async fn start(config: TetherConfig) -> Tether {
    Tether::builder(config)
        .probe(Arc::new(ScriptedProbe::new()))
        .start()
        .await
        .unwrap()
}

#[tokio::test]
async fn breaker_opens_after_threshold_and_short_circuits() {
    let mut config = quiet_config();
    config.circuit_breaker.breakers.insert(
        "inventory".into(),
        CircuitBreakerOverrides {
            failure_threshold: Some(3),
            ..Default::default()
        },
    );
    let tether = start(config).await;
    let breaker = tether.circuit_breaker("inventory").await;

    let invocations = Arc::new(AtomicUsize::new(0));
    let call = || {
        let invocations = invocations.clone();
        async move {
            invocations.fetch_add(1, Ordering::SeqCst);
            Err::<u32, _>(ResilienceError::Transient("backend down".into()))
        }
    };

    for _ in 0..3 {
        let result = breaker.execute(call).await;
        assert!(!result.is_success());
    }
    assert_eq!(breaker.get_state().await, CircuitState::Open);
    assert_eq!(invocations.load(Ordering::SeqCst), 3);

    let rejected = breaker.execute(call).await;
    assert!(rejected.error().is_some_and(|e| e.is_rejection()));
    assert_eq!(invocations.load(Ordering::SeqCst), 3);

    let status = tether.status().await;
    assert_eq!(status.circuit_breakers["inventory"].state, CircuitState::Open);

    tether.shutdown().await;
}

#[tokio::test]
async fn contended_lock_times_out_after_retries() {
    let mut config = quiet_config();
    config.locking.max_retries = 3;
    config.locking.retry_delay_ms = 20;
    let tether = start(config).await;
    let locks = tether.locks();

    let held = locks
        .acquire_lock(LockRequest::new("R1", "A").with_ttl(Duration::from_secs(5)))
        .await;
    assert!(held.is_success());

    let contender = locks
        .acquire_lock(LockRequest::new("R1", "B").with_ttl(Duration::from_secs(5)))
        .await;
    assert!(!contender.is_success());
    assert_eq!(contender.error().unwrap().kind, LockErrorKind::Timeout);
    assert_eq!(contender.attempts, 4);
    assert!(contender.wait_time >= Duration::from_millis(60));
    assert!(contender.wait_time < Duration::from_secs(2));

    assert!(!locks.release_lock(Uuid::new_v4()).await);

    let lock_id = held.lock().unwrap().lock_id;
    assert!(locks.release_lock(lock_id).await);
    assert!(!locks.release_lock(lock_id).await);

    let retry = locks.acquire_lock(LockRequest::new("R1", "B")).await;
    assert!(retry.is_success());

    tether.shutdown().await;
}

#[tokio::test]
async fn cached_result_expires_after_ttl() {
    let tether = start(quiet_config()).await;
    let resources = tether.resources();

    resources
        .set_cached_result("k", &serde_json::json!({ "v": 1 }), Some(Duration::from_millis(100)))
        .unwrap();
    let hit = resources.get_cached_result("k").unwrap();
    assert_eq!(hit.value["v"], 1);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(resources.get_cached_result("k").is_none());

    let stats = resources.cache_stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);

    tether.shutdown().await;
}

#[tokio::test]
async fn oversized_request_is_clamped_to_limits() {
    let tether = start(quiet_config()).await;
    let resources = tether.resources();

    let allocation = resources
        .allocate_resources(ResourceRequirements::new(16.0, 1024))
        .unwrap();
    assert_eq!(allocation.allocated.cpu_cores, 8.0);
    assert_eq!(allocation.allocated.memory_mb, 1024);

    // cpu is now fully committed
    let err = resources
        .allocate_resources(ResourceRequirements::new(1.0, 64))
        .unwrap_err();
    assert_eq!(
        tether::TetherError::from(err).kind(),
        tether::ErrorKind::ResourceLimitsExceeded
    );

    resources.release_resources(allocation.allocation_id).unwrap();
    assert!(resources
        .allocate_resources(ResourceRequirements::new(1.0, 64))
        .is_ok());

    tether.shutdown().await;
}

#[tokio::test]
async fn round_robin_cycles_through_every_instance() {
    let tether = start(quiet_config()).await;
    let discovery = tether.discovery();

    for port in 9000..9010 {
        discovery
            .register_service(ServiceDefinition::new("search", "10.0.0.1", port))
            .await
            .unwrap();
    }

    let mut first_cycle = Vec::new();
    for _ in 0..10 {
        let instance = discovery
            .get_service_instance("search", None)
            .await
            .unwrap()
            .unwrap();
        first_cycle.push(instance.instance_id);
    }
    let distinct: HashSet<_> = first_cycle.iter().collect();
    assert_eq!(distinct.len(), 10);

    for expected in &first_cycle {
        let instance = discovery
            .get_service_instance("search", None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&instance.instance_id, expected);
    }

    tether.shutdown().await;
}
