//! Backing store interface for cross-process locks
//!
//! A provider owns the compare-and-set semantics of the real store (Redis, etcd, SQL, ...).
//! The manager only layers retries, leases and deadlock detection on top of it.

use crate::error::ProviderError;
use crate::types::{lease_deadline, LockInfo};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

#[async_trait]
pub trait LockProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn connect(&self) -> Result<(), ProviderError>;

    async fn disconnect(&self) -> Result<(), ProviderError>;

    /// Atomically take `lock.resource_id` for `ttl`; `Ok(false)` when it is held
    async fn try_acquire(&self, lock: &LockInfo, ttl: Duration) -> Result<bool, ProviderError>;

    /// Release the lock; `Ok(false)` when `lock_id` does not hold it
    async fn try_release(&self, resource_id: &str, lock_id: Uuid) -> Result<bool, ProviderError>;

    /// Extend the lease; `Ok(false)` when the lock is no longer held
    async fn try_renew(&self, lock: &LockInfo, ttl: Duration) -> Result<bool, ProviderError>;
}

#[derive(Debug)]
struct Entry {
    lock_id: Uuid,
    expires: Instant,
}

/// Single-process provider keyed by resource, with lease expiry
#[derive(Debug, Default)]
pub struct MemoryLockProvider {
    connected: AtomicBool,
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryLockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_connected(&self) -> Result<(), ProviderError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ProviderError::NotConnected)
        }
    }
}

#[async_trait]
impl LockProvider for MemoryLockProvider {
    fn name(&self) -> &str {
        "memory"
    }

    async fn connect(&self) -> Result<(), ProviderError> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), ProviderError> {
        self.connected.store(false, Ordering::SeqCst);
        self.entries.lock().await.clear();
        Ok(())
    }

    async fn try_acquire(&self, lock: &LockInfo, ttl: Duration) -> Result<bool, ProviderError> {
        self.ensure_connected()?;
        let mut entries = self.entries.lock().await;
        let now = Instant::now();

        if let Some(existing) = entries.get(&lock.resource_id) {
            if existing.expires > now && existing.lock_id != lock.lock_id {
                return Ok(false);
            }
        }

        entries.insert(
            lock.resource_id.clone(),
            Entry {
                lock_id: lock.lock_id,
                expires: lease_deadline(now, ttl),
            },
        );
        Ok(true)
    }

    async fn try_release(&self, resource_id: &str, lock_id: Uuid) -> Result<bool, ProviderError> {
        self.ensure_connected()?;
        let mut entries = self.entries.lock().await;
        match entries.get(resource_id) {
            Some(entry) if entry.lock_id == lock_id => {
                entries.remove(resource_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn try_renew(&self, lock: &LockInfo, ttl: Duration) -> Result<bool, ProviderError> {
        self.ensure_connected()?;
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        match entries.get_mut(&lock.resource_id) {
            Some(entry) if entry.lock_id == lock.lock_id && entry.expires > now => {
                entry.expires = lease_deadline(now, ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LockRequest;

    fn lock(resource: &str, owner: &str, ttl: Duration) -> LockInfo {
        LockInfo::new(&LockRequest::new(resource, owner), ttl)
    }

    #[tokio::test]
    async fn test_requires_connection() {
        let provider = MemoryLockProvider::new();
        let l = lock("r", "a", Duration::from_secs(1));
        assert_eq!(
            provider.try_acquire(&l, Duration::from_secs(1)).await,
            Err(ProviderError::NotConnected)
        );
    }

    #[tokio::test]
    async fn test_exclusive_until_expiry() {
        let provider = MemoryLockProvider::new();
        provider.connect().await.unwrap();
        let ttl = Duration::from_millis(30);

        let a = lock("r", "a", ttl);
        let b = lock("r", "b", ttl);
        assert!(provider.try_acquire(&a, ttl).await.unwrap());
        assert!(!provider.try_acquire(&b, ttl).await.unwrap());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(provider.try_acquire(&b, ttl).await.unwrap());
        assert!(!provider.try_renew(&a, ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_release_checks_holder() {
        let provider = MemoryLockProvider::new();
        provider.connect().await.unwrap();
        let ttl = Duration::from_secs(5);
        let a = lock("r", "a", ttl);
        provider.try_acquire(&a, ttl).await.unwrap();

        assert!(!provider.try_release("r", Uuid::new_v4()).await.unwrap());
        assert!(provider.try_release("r", a.lock_id).await.unwrap());
        assert!(!provider.try_release("r", a.lock_id).await.unwrap());
    }
}
