//! Lock requests, granted locks and manager configuration

use crate::error::LockError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// Longest lease a lock may be granted or renewed for
pub const MAX_LOCK_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Requested access mode, recorded on the lock.
///
/// Every mode is mutually exclusive with every other mode on the same resource.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockType {
    #[default]
    Exclusive,
    Shared,
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockStatus {
    Acquired,
    Released,
    Expired,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connected,
    #[default]
    Disconnected,
    Error,
}

/// A request to lock `resource_id` on behalf of `owner_id`
#[derive(Debug, Clone)]
pub struct LockRequest {
    pub resource_id: String,
    pub owner_id: String,
    pub lock_type: LockType,
    /// Lease length; the manager's `default_ttl` when `None`
    pub ttl: Option<Duration>,
    /// Overall acquisition deadline; the manager's `lock_timeout` when `None`
    pub timeout: Option<Duration>,
    /// Higher values survive deadlock resolution under `AbortLowestPriority`
    pub priority: i32,
    pub tags: Vec<String>,
    pub max_renewals: u32,
}

impl LockRequest {
    pub fn new(resource_id: impl Into<String>, owner_id: impl Into<String>) -> Self {
        Self {
            resource_id: resource_id.into(),
            owner_id: owner_id.into(),
            lock_type: LockType::Exclusive,
            ttl: None,
            timeout: None,
            priority: 0,
            tags: Vec::new(),
            max_renewals: 100,
        }
    }

    pub fn with_type(mut self, lock_type: LockType) -> Self {
        self.lock_type = lock_type;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
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

    pub fn with_max_renewals(mut self, max_renewals: u32) -> Self {
        self.max_renewals = max_renewals;
        self
    }
}

/// A granted lease
#[derive(Debug, Clone, Serialize)]
pub struct LockInfo {
    pub lock_id: Uuid,
    pub resource_id: String,
    pub owner_id: String,
    pub lock_type: LockType,
    pub status: LockStatus,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub renewed_at: Option<DateTime<Utc>>,
    pub renewal_count: u32,
    pub max_renewals: u32,
    pub priority: i32,
    pub tags: Vec<String>,
    /// Monotonic expiry used for all comparisons
    #[serde(skip)]
    pub(crate) deadline: Instant,
    #[serde(skip)]
    pub(crate) acquired_instant: Instant,
}

impl LockInfo {
    pub(crate) fn new(request: &LockRequest, ttl: Duration) -> Self {
        let now = Utc::now();
        let instant = Instant::now();
        Self {
            lock_id: Uuid::new_v4(),
            resource_id: request.resource_id.clone(),
            owner_id: request.owner_id.clone(),
            lock_type: request.lock_type,
            status: LockStatus::Acquired,
            acquired_at: now,
            expires_at: now + to_chrono(ttl.min(MAX_LOCK_TTL)),
            renewed_at: None,
            renewal_count: 0,
            max_renewals: request.max_renewals,
            priority: request.priority,
            tags: request.tags.clone(),
            deadline: lease_deadline(instant, ttl),
            acquired_instant: instant,
        }
    }

    /// Whether the lease has run out
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Time left on the lease
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub(crate) fn extend(&mut self, ttl: Duration) {
        let now = Utc::now();
        self.deadline = lease_deadline(Instant::now(), ttl);
        self.expires_at = now + to_chrono(ttl.min(MAX_LOCK_TTL));
        self.renewed_at = Some(now);
        self.renewal_count += 1;
    }

    pub(crate) fn held_for(&self) -> Duration {
        self.acquired_instant.elapsed()
    }
}

/// Expiry instant for a lease of `ttl` starting at `from`, capped at [`MAX_LOCK_TTL`]
pub(crate) fn lease_deadline(from: Instant, ttl: Duration) -> Instant {
    from + ttl.min(MAX_LOCK_TTL)
}

pub(crate) fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::zero())
}

/// Outcome of `acquire_lock`
#[derive(Debug, Clone)]
pub struct LockResult {
    pub outcome: Result<LockInfo, LockError>,
    pub wait_time: Duration,
    pub attempts: u32,
}

impl LockResult {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn lock(&self) -> Option<&LockInfo> {
        self.outcome.as_ref().ok()
    }

    pub fn error(&self) -> Option<&LockError> {
        self.outcome.as_ref().err()
    }
}

/// Which participant of a wait-for cycle is aborted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadlockStrategy {
    /// The waiter that started waiting most recently
    #[default]
    AbortYoungest,
    /// The waiter with the lowest request priority
    AbortLowestPriority,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum DeadlockResolution {
    /// The requester was refused before it started waiting
    RequestRejected { owner_id: String },
    /// A waiting owner was aborted by the periodic scan
    WaiterAborted { owner_id: String, resource_id: String },
}

/// A detected wait-for cycle
#[derive(Debug, Clone, Serialize)]
pub struct DeadlockInfo {
    pub deadlock_id: Uuid,
    pub detected_at: DateTime<Utc>,
    /// Owners in cycle order; each waits on a resource held by the next
    pub cycle: Vec<String>,
    pub involved_locks: Vec<Uuid>,
    pub resolution: DeadlockResolution,
}

#[derive(Debug, Clone, Serialize)]
pub struct LockStatistics {
    pub total_locks: u64,
    pub active_locks: usize,
    pub waiting_locks: usize,
    pub expired_locks: u64,
    pub successful_acquisitions: u64,
    pub failed_acquisitions: u64,
    pub average_hold_time_ms: f64,
    pub average_wait_time_ms: f64,
    pub deadlock_count: u64,
    pub renewal_count: u64,
    pub connection_status: ConnectionStatus,
}

#[derive(Debug, Clone)]
pub struct LockManagerConfig {
    pub default_ttl: Duration,
    /// Automatic renewal period; zero disables renewal
    pub renewal_interval: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub deadlock_detection: bool,
    pub deadlock_scan_interval: Duration,
    pub deadlock_strategy: DeadlockStrategy,
    /// Default overall acquisition deadline
    pub lock_timeout: Option<Duration>,
}

impl Default for LockManagerConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(30),
            renewal_interval: Duration::ZERO,
            max_retries: 3,
            retry_delay: Duration::from_millis(100),
            deadlock_detection: true,
            deadlock_scan_interval: Duration::from_secs(5),
            deadlock_strategy: DeadlockStrategy::AbortYoungest,
            lock_timeout: None,
        }
    }
}
