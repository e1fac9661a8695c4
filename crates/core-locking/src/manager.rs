//! Lease-based lock manager on top of a pluggable [`LockProvider`]
//!
//! The manager keeps the table of locks granted through it, retries contended
//! acquisitions with a fixed delay, renews leases in the background, and consults the
//! [`DeadlockDetector`] before every attempt.

use crate::deadlock::{DeadlockDetector, WaitGuard};
use crate::error::{LockError, LockErrorKind, ProviderError};
use crate::provider::{LockProvider, MemoryLockProvider};
use crate::types::{
    ConnectionStatus, DeadlockInfo, LockInfo, LockManagerConfig, LockRequest, LockResult,
    LockStatistics, MAX_LOCK_TTL,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Default)]
struct Counters {
    total_locks: u64,
    expired_locks: u64,
    successful_acquisitions: u64,
    failed_acquisitions: u64,
    released_locks: u64,
    total_hold_time: Duration,
    total_wait_time: Duration,
    renewal_count: u64,
}

pub struct DistributedLockManager {
    config: LockManagerConfig,
    provider: Arc<dyn LockProvider>,
    locks: Mutex<HashMap<Uuid, LockInfo>>,
    renewals: StdMutex<HashMap<Uuid, JoinHandle<()>>>,
    detector: DeadlockDetector,
    counters: StdMutex<Counters>,
    connection: StdMutex<ConnectionStatus>,
    scan_task: StdMutex<Option<CancellationToken>>,
    me: Weak<Self>,
}

impl std::fmt::Debug for DistributedLockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedLockManager")
            .field("config", &self.config)
            .field("provider", &self.provider.name())
            .field("connection", &self.connection_status())
            .finish()
    }
}

impl DistributedLockManager {
    pub fn new(config: LockManagerConfig, provider: Arc<dyn LockProvider>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            detector: DeadlockDetector::new(config.deadlock_strategy),
            config,
            provider,
            locks: Mutex::new(HashMap::new()),
            renewals: StdMutex::new(HashMap::new()),
            counters: StdMutex::new(Counters::default()),
            connection: StdMutex::new(ConnectionStatus::Disconnected),
            scan_task: StdMutex::new(None),
            me: me.clone(),
        })
    }

    /// Manager backed by a [`MemoryLockProvider`]
    pub fn in_memory(config: LockManagerConfig) -> Arc<Self> {
        Self::new(config, Arc::new(MemoryLockProvider::new()))
    }

    pub fn config(&self) -> &LockManagerConfig {
        &self.config
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        *lock_std(&self.connection)
    }

    /// Connect the provider and start the periodic deadlock scan.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn connect(&self) -> Result<(), ProviderError> {
        if let Err(e) = self.provider.connect().await {
            self.set_connection(ConnectionStatus::Error);
            return Err(e);
        }
        self.set_connection(ConnectionStatus::Connected);
        info!(provider = self.provider.name(), "lock manager connected");

        if self.config.deadlock_detection && !self.config.deadlock_scan_interval.is_zero() {
            let token = CancellationToken::new();
            if let Some(previous) = lock_std(&self.scan_task).replace(token.clone()) {
                previous.cancel();
            }
            tokio::spawn(Self::scan_loop(
                self.me.clone(),
                token,
                self.config.deadlock_scan_interval,
            ));
        }

        Ok(())
    }

    /// Release every held lock, cancel renewals and disconnect the provider.
    ///
    /// Provider errors during teardown are logged and otherwise ignored.
    pub async fn disconnect(&self) {
        if let Some(token) = lock_std(&self.scan_task).take() {
            token.cancel();
        }

        for (_, handle) in lock_std(&self.renewals).drain() {
            handle.abort();
        }

        let held: Vec<LockInfo> = self.locks.lock().await.drain().map(|(_, l)| l).collect();
        for lock in &held {
            if let Err(e) = self.provider.try_release(&lock.resource_id, lock.lock_id).await {
                warn!(
                    lock_id = %lock.lock_id,
                    resource = %lock.resource_id,
                    error = %e,
                    "failed to release lock during disconnect"
                );
            }
        }

        if let Err(e) = self.provider.disconnect().await {
            warn!(provider = self.provider.name(), error = %e, "lock provider disconnect failed");
        }

        self.set_connection(ConnectionStatus::Disconnected);
        info!(released = held.len(), "lock manager disconnected");
    }

    /// Acquire a lock, retrying up to `max_retries` times while it is contended
    pub async fn acquire_lock(&self, request: LockRequest) -> LockResult {
        let started = Instant::now();

        let ttl = request.ttl.unwrap_or(self.config.default_ttl);
        if let Some(message) = validate(&request, ttl) {
            lock_std(&self.counters).failed_acquisitions += 1;
            return LockResult {
                outcome: Err(failure(&request, LockErrorKind::ValidationError, message)),
                wait_time: started.elapsed(),
                attempts: 0,
            };
        }

        let guard = self
            .detector
            .register_waiter(&request.owner_id, &request.resource_id, request.priority);

        let mut attempts = 0;
        let outcome = {
            let attempt_loop = self.attempt_loop(&request, ttl, &guard, &mut attempts);
            match request.timeout.or(self.config.lock_timeout) {
                Some(deadline) => match tokio::time::timeout(deadline, attempt_loop).await {
                    Ok(result) => result,
                    Err(_) => Err(failure(
                        &request,
                        LockErrorKind::Timeout,
                        format!("acquisition deadline of {:?} exceeded", deadline),
                    )),
                },
                None => attempt_loop.await,
            }
        };
        drop(guard);

        let wait_time = started.elapsed();
        {
            let mut counters = lock_std(&self.counters);
            match &outcome {
                Ok(_) => {
                    counters.total_locks += 1;
                    counters.successful_acquisitions += 1;
                    counters.total_wait_time += wait_time;
                }
                Err(_) => counters.failed_acquisitions += 1,
            }
        }

        match &outcome {
            Ok(lock) => info!(
                lock_id = %lock.lock_id,
                resource = %lock.resource_id,
                owner = %lock.owner_id,
                attempts,
                "lock acquired"
            ),
            Err(e) => debug!(
                resource = %request.resource_id,
                owner = %request.owner_id,
                kind = %e.kind,
                attempts,
                "lock acquisition failed"
            ),
        }

        LockResult {
            outcome,
            wait_time,
            attempts,
        }
    }

    async fn attempt_loop(
        &self,
        request: &LockRequest,
        ttl: Duration,
        guard: &WaitGuard,
        attempts: &mut u32,
    ) -> Result<LockInfo, LockError> {
        let max_attempts = self.config.max_retries + 1;

        for attempt in 1..=max_attempts {
            *attempts = attempt;

            if guard.aborted().is_cancelled() {
                return Err(aborted(request));
            }

            if self.config.deadlock_detection {
                let snapshot = self.active_snapshot().await;
                if let Some(info) =
                    self.detector
                        .check_request(&request.owner_id, &request.resource_id, &snapshot)
                {
                    warn!(
                        resource = %request.resource_id,
                        owner = %request.owner_id,
                        cycle = ?info.cycle,
                        "lock request would deadlock"
                    );
                    return Err(failure(
                        request,
                        LockErrorKind::DeadlockDetected,
                        format!("granting this request closes the cycle {:?}", info.cycle),
                    ));
                }
            }

            match self.try_acquire_once(request, ttl).await {
                Ok(Some(lock)) => return Ok(lock),
                Ok(None) => {}
                Err(e) => {
                    self.set_connection(ConnectionStatus::Error);
                    return Err(failure(request, LockErrorKind::ConnectionError, e.to_string()));
                }
            }

            if attempt < max_attempts {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.retry_delay) => {}
                    _ = guard.aborted().cancelled() => return Err(aborted(request)),
                }
            }
        }

        Err(failure(
            request,
            LockErrorKind::Timeout,
            format!("resource still held after {} attempts", max_attempts),
        ))
    }

    /// One attempt; the table lock is held across the provider call so local grants
    /// are serialized
    async fn try_acquire_once(
        &self,
        request: &LockRequest,
        ttl: Duration,
    ) -> Result<Option<LockInfo>, ProviderError> {
        let mut locks = self.locks.lock().await;
        self.evict_expired(&mut locks, |l| l.resource_id == request.resource_id);

        if locks.values().any(|l| l.resource_id == request.resource_id) {
            return Ok(None);
        }

        let candidate = LockInfo::new(request, ttl);
        if !self.provider.try_acquire(&candidate, ttl).await? {
            return Ok(None);
        }

        locks.insert(candidate.lock_id, candidate.clone());
        drop(locks);

        self.schedule_renewal(candidate.lock_id);
        Ok(Some(candidate))
    }

    /// Release a lock; `false` when it is not held
    pub async fn release_lock(&self, lock_id: Uuid) -> bool {
        if let Some(handle) = lock_std(&self.renewals).remove(&lock_id) {
            handle.abort();
        }

        let mut locks = self.locks.lock().await;
        let Some(lock) = locks.get(&lock_id).cloned() else {
            return false;
        };

        match self.provider.try_release(&lock.resource_id, lock_id).await {
            Ok(true) => {
                locks.remove(&lock_id);
                let mut counters = lock_std(&self.counters);
                counters.released_locks += 1;
                counters.total_hold_time += lock.held_for();
                info!(lock_id = %lock_id, resource = %lock.resource_id, "lock released");
                true
            }
            Ok(false) => {
                // Provider no longer knows this lease
                locks.remove(&lock_id);
                if lock.is_expired() {
                    lock_std(&self.counters).expired_locks += 1;
                }
                false
            }
            Err(e) => {
                warn!(lock_id = %lock_id, error = %e, "lock release failed");
                self.set_connection(ConnectionStatus::Error);
                false
            }
        }
    }

    /// Extend a lease by `ttl` (default TTL when `None`); `false` when it is not held
    pub async fn renew_lock(&self, lock_id: Uuid, ttl: Option<Duration>) -> bool {
        let ttl = ttl.unwrap_or(self.config.default_ttl);
        if ttl.is_zero() || ttl > MAX_LOCK_TTL {
            warn!(lock_id = %lock_id, ttl = ?ttl, "renewal ttl out of range");
            return false;
        }
        let mut locks = self.locks.lock().await;

        let expired = match locks.get(&lock_id) {
            None => return false,
            Some(lock) => lock.is_expired(),
        };
        if expired {
            locks.remove(&lock_id);
            lock_std(&self.counters).expired_locks += 1;
            return false;
        }

        let Some(lock) = locks.get_mut(&lock_id) else {
            return false;
        };

        match self.provider.try_renew(lock, ttl).await {
            Ok(true) => {
                lock.extend(ttl);
                lock_std(&self.counters).renewal_count += 1;
                debug!(lock_id = %lock_id, renewals = lock.renewal_count, "lock renewed");
                true
            }
            Ok(false) => false,
            Err(e) => {
                warn!(lock_id = %lock_id, error = %e, "lock renewal failed");
                self.set_connection(ConnectionStatus::Error);
                false
            }
        }
    }

    /// Lock by id; expired leases are evicted and reported as absent
    pub async fn get_lock_info(&self, lock_id: Uuid) -> Option<LockInfo> {
        let mut locks = self.locks.lock().await;
        self.evict_expired(&mut locks, |l| l.lock_id == lock_id);
        locks.get(&lock_id).cloned()
    }

    /// Unexpired locks on a resource
    pub async fn get_resource_locks(&self, resource_id: &str) -> Vec<LockInfo> {
        let mut locks = self.locks.lock().await;
        self.evict_expired(&mut locks, |l| l.resource_id == resource_id);
        locks
            .values()
            .filter(|l| l.resource_id == resource_id)
            .cloned()
            .collect()
    }

    pub async fn get_statistics(&self) -> LockStatistics {
        let active_locks = self
            .locks
            .lock()
            .await
            .values()
            .filter(|l| !l.is_expired())
            .count();

        let counters = lock_std(&self.counters);
        let average = |total: Duration, n: u64| {
            if n == 0 {
                0.0
            } else {
                total.as_secs_f64() * 1000.0 / n as f64
            }
        };

        LockStatistics {
            total_locks: counters.total_locks,
            active_locks,
            waiting_locks: self.detector.waiting_count(),
            expired_locks: counters.expired_locks,
            successful_acquisitions: counters.successful_acquisitions,
            failed_acquisitions: counters.failed_acquisitions,
            average_hold_time_ms: average(counters.total_hold_time, counters.released_locks),
            average_wait_time_ms: average(
                counters.total_wait_time,
                counters.successful_acquisitions,
            ),
            deadlock_count: self.detector.deadlock_count(),
            renewal_count: counters.renewal_count,
            connection_status: self.connection_status(),
        }
    }

    pub fn recent_deadlocks(&self) -> Vec<DeadlockInfo> {
        self.detector.recent_deadlocks()
    }

    /// Run one deadlock scan now, aborting a waiter per cycle
    pub async fn detect_deadlocks(&self) -> Vec<DeadlockInfo> {
        let snapshot = self.active_snapshot().await;
        self.detector.scan(&snapshot)
    }

    async fn active_snapshot(&self) -> Vec<LockInfo> {
        self.locks
            .lock()
            .await
            .values()
            .filter(|l| !l.is_expired())
            .cloned()
            .collect()
    }

    fn evict_expired(
        &self,
        locks: &mut HashMap<Uuid, LockInfo>,
        matches: impl Fn(&LockInfo) -> bool,
    ) {
        let before = locks.len();
        locks.retain(|_, l| !(matches(l) && l.is_expired()));
        let evicted = (before - locks.len()) as u64;
        if evicted > 0 {
            lock_std(&self.counters).expired_locks += evicted;
            debug!(evicted, "evicted expired locks");
        }
    }

    fn schedule_renewal(&self, lock_id: Uuid) {
        let interval = self.config.renewal_interval;
        if interval.is_zero() {
            return;
        }

        let manager = self.me.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };

                if !manager.renew_lock(lock_id, None).await {
                    debug!(lock_id = %lock_id, "stopping renewal, lock no longer held");
                    break;
                }

                let exhausted = manager
                    .get_lock_info(lock_id)
                    .await
                    .map_or(true, |l| l.renewal_count >= l.max_renewals);
                if exhausted {
                    debug!(lock_id = %lock_id, "stopping renewal, limit reached");
                    break;
                }
            }

            if let Some(manager) = manager.upgrade() {
                lock_std(&manager.renewals).remove(&lock_id);
            }
        });

        lock_std(&self.renewals).insert(lock_id, handle);
    }

    async fn scan_loop(manager: Weak<Self>, token: CancellationToken, period: Duration) {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let Some(manager) = manager.upgrade() else {
                break;
            };
            let found = manager.detect_deadlocks().await;
            if !found.is_empty() {
                info!(count = found.len(), "deadlock scan resolved cycles");
            }
        }
    }

    fn set_connection(&self, status: ConnectionStatus) {
        *lock_std(&self.connection) = status;
    }
}

impl Drop for DistributedLockManager {
    fn drop(&mut self) {
        if let Some(token) = lock_std(&self.scan_task).take() {
            token.cancel();
        }
        for (_, handle) in lock_std(&self.renewals).drain() {
            handle.abort();
        }
    }
}

fn lock_std<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn validate(request: &LockRequest, ttl: Duration) -> Option<String> {
    if request.resource_id.trim().is_empty() {
        return Some("resource_id must not be empty".to_string());
    }
    if request.owner_id.trim().is_empty() {
        return Some("owner_id must not be empty".to_string());
    }
    if ttl.is_zero() {
        return Some("ttl must be greater than zero".to_string());
    }
    if ttl > MAX_LOCK_TTL {
        return Some(format!("ttl must not exceed {:?}", MAX_LOCK_TTL));
    }
    None
}

fn failure(request: &LockRequest, kind: LockErrorKind, message: impl Into<String>) -> LockError {
    LockError::new(kind, message, &request.resource_id, &request.owner_id)
}

fn aborted(request: &LockRequest) -> LockError {
    failure(
        request,
        LockErrorKind::DeadlockDetected,
        "waiter aborted to break a deadlock",
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    fn fast_config() -> LockManagerConfig {
        LockManagerConfig {
            retry_delay: Duration::from_millis(10),
            ..Default::default()
        }
    }

    async fn connected(config: LockManagerConfig) -> Arc<DistributedLockManager> {
        let manager = DistributedLockManager::in_memory(config);
        manager.connect().await.unwrap();
        manager
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let manager = connected(fast_config()).await;

        let result = manager
            .acquire_lock(LockRequest::new("orders", "worker-1").with_ttl(Duration::from_secs(5)))
            .await;
        let lock = result.lock().cloned().unwrap();
        assert_eq!(result.attempts, 1);

        assert_eq!(manager.get_resource_locks("orders").await.len(), 1);
        assert!(manager.get_lock_info(lock.lock_id).await.is_some());

        assert!(manager.release_lock(lock.lock_id).await);
        assert!(!manager.release_lock(lock.lock_id).await);
        assert!(manager.get_resource_locks("orders").await.is_empty());

        let stats = manager.get_statistics().await;
        assert_eq!(stats.total_locks, 1);
        assert_eq!(stats.active_locks, 0);
        assert_eq!(stats.connection_status, ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn test_contended_lock_times_out_after_retries() {
        let manager = connected(fast_config()).await;
        manager
            .acquire_lock(LockRequest::new("r1", "a").with_ttl(Duration::from_secs(5)))
            .await;

        let started = Instant::now();
        let result = manager.acquire_lock(LockRequest::new("r1", "b")).await;

        assert_eq!(result.error().map(|e| e.kind), Some(LockErrorKind::Timeout));
        assert_eq!(result.attempts, 4);
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(manager.get_statistics().await.failed_acquisitions, 1);
    }

    #[tokio::test]
    async fn test_lock_types_are_mutually_exclusive() {
        let manager = connected(fast_config()).await;
        use crate::types::LockType;

        let read = manager
            .acquire_lock(LockRequest::new("doc", "a").with_type(LockType::Read))
            .await;
        assert!(read.is_success());

        let shared = manager
            .acquire_lock(LockRequest::new("doc", "b").with_type(LockType::Shared))
            .await;
        assert!(!shared.is_success());
    }

    #[tokio::test]
    async fn test_expired_lock_can_be_taken() {
        let manager = connected(fast_config()).await;
        let first = manager
            .acquire_lock(LockRequest::new("r", "a").with_ttl(Duration::from_millis(20)))
            .await;
        let first_id = first.lock().map(|l| l.lock_id).unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(manager.get_lock_info(first_id).await.is_none());
        let second = manager.acquire_lock(LockRequest::new("r", "b")).await;
        assert!(second.is_success());
        assert_eq!(manager.get_statistics().await.expired_locks, 1);
    }

    #[tokio::test]
    async fn test_validation_error() {
        let manager = connected(fast_config()).await;
        let result = manager.acquire_lock(LockRequest::new("", "a")).await;

        assert_eq!(
            result.error().map(|e| e.kind),
            Some(LockErrorKind::ValidationError)
        );
        assert_eq!(result.attempts, 0);
    }

    #[tokio::test]
    async fn test_oversized_ttl_is_rejected() {
        let manager = connected(fast_config()).await;

        let result = manager
            .acquire_lock(LockRequest::new("r", "a").with_ttl(Duration::from_secs(u64::MAX)))
            .await;
        assert_eq!(
            result.error().map(|e| e.kind),
            Some(LockErrorKind::ValidationError)
        );
        assert!(manager.get_resource_locks("r").await.is_empty());

        let lock = manager
            .acquire_lock(LockRequest::new("r", "a").with_ttl(MAX_LOCK_TTL))
            .await
            .lock()
            .cloned()
            .unwrap();
        assert!(!manager.renew_lock(lock.lock_id, Some(Duration::from_secs(u64::MAX))).await);
        assert!(!manager.renew_lock(lock.lock_id, Some(Duration::ZERO)).await);
        assert!(manager.renew_lock(lock.lock_id, Some(MAX_LOCK_TTL)).await);
        assert_eq!(manager.get_lock_info(lock.lock_id).await.unwrap().renewal_count, 1);
    }

    #[tokio::test]
    async fn test_overall_timeout() {
        let manager = connected(LockManagerConfig {
            max_retries: 100,
            retry_delay: Duration::from_millis(20),
            ..Default::default()
        })
        .await;
        manager.acquire_lock(LockRequest::new("r", "a")).await;

        let started = Instant::now();
        let result = manager
            .acquire_lock(LockRequest::new("r", "b").with_timeout(Duration::from_millis(50)))
            .await;

        assert_eq!(result.error().map(|e| e.kind), Some(LockErrorKind::Timeout));
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_renew_extends_lease() {
        let manager = connected(fast_config()).await;
        let lock = manager
            .acquire_lock(LockRequest::new("r", "a").with_ttl(Duration::from_millis(50)))
            .await
            .lock()
            .cloned()
            .unwrap();

        assert!(manager.renew_lock(lock.lock_id, Some(Duration::from_secs(5))).await);
        tokio::time::sleep(Duration::from_millis(60)).await;

        let info = manager.get_lock_info(lock.lock_id).await.unwrap();
        assert_eq!(info.renewal_count, 1);
        assert!(info.renewed_at.is_some());
        assert!(!manager.renew_lock(Uuid::new_v4(), None).await);
    }

    #[tokio::test]
    async fn test_automatic_renewal_until_limit() {
        let manager = connected(LockManagerConfig {
            renewal_interval: Duration::from_millis(10),
            default_ttl: Duration::from_millis(200),
            ..fast_config()
        })
        .await;

        let lock = manager
            .acquire_lock(LockRequest::new("r", "a").with_max_renewals(2))
            .await
            .lock()
            .cloned()
            .unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;

        let info = manager.get_lock_info(lock.lock_id).await.unwrap();
        assert_eq!(info.renewal_count, 2);
        assert_eq!(manager.get_statistics().await.renewal_count, 2);
    }

    #[tokio::test]
    async fn test_request_closing_cycle_fails_fast() {
        let manager = connected(LockManagerConfig {
            max_retries: 50,
            retry_delay: Duration::from_millis(10),
            ..Default::default()
        })
        .await;

        manager.acquire_lock(LockRequest::new("r1", "a")).await;
        manager.acquire_lock(LockRequest::new("r2", "b")).await;

        let waiting = manager.clone();
        let a_waits = tokio::spawn(async move {
            waiting
                .acquire_lock(LockRequest::new("r2", "a").with_timeout(Duration::from_millis(300)))
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let started = Instant::now();
        let result = manager.acquire_lock(LockRequest::new("r1", "b")).await;
        assert_eq!(
            result.error().map(|e| e.kind),
            Some(LockErrorKind::DeadlockDetected)
        );
        assert_eq!(result.attempts, 1);
        assert!(started.elapsed() < Duration::from_millis(100));

        let a_result = a_waits.await.unwrap();
        assert!(!a_result.is_success());
        assert!(manager.get_statistics().await.deadlock_count >= 1);
    }

    #[tokio::test]
    async fn test_scan_aborts_racing_waiter() {
        let manager = connected(LockManagerConfig {
            max_retries: 1000,
            retry_delay: Duration::from_millis(10),
            deadlock_scan_interval: Duration::ZERO,
            ..Default::default()
        })
        .await;

        manager.acquire_lock(LockRequest::new("r1", "a")).await;
        manager.acquire_lock(LockRequest::new("r2", "b")).await;

        // Both owners enter the graph directly, as if they raced past the pre-check
        let _a = manager.detector.register_waiter("a", "r2", 0);
        tokio::time::sleep(Duration::from_millis(5)).await;
        let b = manager.detector.register_waiter("b", "r1", 0);

        let found = manager.detect_deadlocks().await;
        assert_eq!(found.len(), 1);
        assert!(b.aborted().is_cancelled());
        assert_eq!(manager.recent_deadlocks().len(), 1);
    }

    struct BrokenProvider;

    #[async_trait]
    impl LockProvider for BrokenProvider {
        fn name(&self) -> &str {
            "broken"
        }
        async fn connect(&self) -> Result<(), ProviderError> {
            Ok(())
        }
        async fn disconnect(&self) -> Result<(), ProviderError> {
            Err(ProviderError::Connection("reset by peer".into()))
        }
        async fn try_acquire(&self, _: &LockInfo, _: Duration) -> Result<bool, ProviderError> {
            Err(ProviderError::Backend("store unavailable".into()))
        }
        async fn try_release(&self, _: &str, _: Uuid) -> Result<bool, ProviderError> {
            Err(ProviderError::Backend("store unavailable".into()))
        }
        async fn try_renew(&self, _: &LockInfo, _: Duration) -> Result<bool, ProviderError> {
            Err(ProviderError::Backend("store unavailable".into()))
        }
    }

    #[tokio::test]
    async fn test_provider_error_is_connection_error() {
        let manager = DistributedLockManager::new(fast_config(), Arc::new(BrokenProvider));
        manager.connect().await.unwrap();

        let result = manager.acquire_lock(LockRequest::new("r", "a")).await;
        assert_eq!(
            result.error().map(|e| e.kind),
            Some(LockErrorKind::ConnectionError)
        );
        assert_eq!(manager.connection_status(), ConnectionStatus::Error);

        // Teardown swallows provider errors
        manager.disconnect().await;
        assert_eq!(manager.connection_status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_disconnect_releases_everything() {
        let manager = connected(LockManagerConfig {
            renewal_interval: Duration::from_millis(10),
            ..fast_config()
        })
        .await;
        manager.acquire_lock(LockRequest::new("r1", "a")).await;
        manager.acquire_lock(LockRequest::new("r2", "a")).await;

        manager.disconnect().await;

        let stats = manager.get_statistics().await;
        assert_eq!(stats.active_locks, 0);
        assert_eq!(stats.connection_status, ConnectionStatus::Disconnected);
        assert!(lock_std(&manager.renewals).is_empty());
    }
}
