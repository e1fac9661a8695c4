//! TTL result cache
//!
//! Values are stored as `serde_json::Value`; an entry's size is the length of its
//! serialized form. Expired entries are dropped when read and by [`ResultCache::evict_expired`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedResult {
    pub key: String,
    pub value: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub access_count: u64,
    pub last_accessed: DateTime<Utc>,
    /// Bytes of serialized JSON
    pub size: usize,
    #[serde(skip, default = "Instant::now")]
    deadline: Instant,
    #[serde(skip, default = "Instant::now")]
    touched: Instant,
}

impl CachedResult {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub total_entries: usize,
    pub total_size: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub miss_rate: f64,
    pub eviction_count: u64,
    pub expired_count: u64,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<String, CachedResult>,
    hits: u64,
    misses: u64,
    evictions: u64,
    expired: u64,
}

impl CacheState {
    fn purge_expired(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before - self.entries.len();
        self.expired += removed as u64;
        removed
    }

    fn evict_lru(&mut self) {
        let oldest = self
            .entries
            .values()
            .min_by_key(|entry| entry.touched)
            .map(|entry| entry.key.clone());
        if let Some(key) = oldest {
            self.entries.remove(&key);
            self.evictions += 1;
        }
    }
}

#[derive(Debug)]
pub struct ResultCache {
    max_entries: Option<usize>,
    state: Mutex<CacheState>,
}

impl ResultCache {
    pub fn new(max_entries: Option<usize>) -> Self {
        Self {
            max_entries,
            state: Mutex::new(CacheState::default()),
        }
    }

    /// Look up `key`, counting the access. Expired entries are removed and reported as a miss.
    pub fn get(&self, key: &str) -> Option<CachedResult> {
        let now = Instant::now();
        let mut guard = self.state();
        let state = &mut *guard;

        match state.entries.get_mut(key) {
            Some(entry) if !entry.is_expired(now) => {
                entry.access_count += 1;
                entry.last_accessed = Utc::now();
                entry.touched = now;
                let hit = entry.clone();
                state.hits += 1;
                return Some(hit);
            }
            Some(_) => {
                state.entries.remove(key);
                state.expired += 1;
            }
            None => {}
        }

        state.misses += 1;
        None
    }

    pub fn set(&self, key: impl Into<String>, value: serde_json::Value, ttl: Duration) {
        let key = key.into();
        let now = Instant::now();
        let created_at = Utc::now();
        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| created_at.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        let entry = CachedResult {
            key: key.clone(),
            size: value.to_string().len(),
            value,
            created_at,
            expires_at,
            access_count: 0,
            last_accessed: created_at,
            deadline: now.checked_add(ttl).unwrap_or(now + Duration::from_secs(86_400 * 365)),
            touched: now,
        };

        let mut state = self.state();
        state.purge_expired(now);
        state.entries.insert(key, entry);

        if let Some(max) = self.max_entries {
            while state.entries.len() > max {
                state.evict_lru();
            }
        }
    }

    pub fn remove(&self, key: &str) -> bool {
        self.state().entries.remove(key).is_some()
    }

    /// Drop expired entries; returns how many went
    pub fn evict_expired(&self) -> usize {
        self.state().purge_expired(Instant::now())
    }

    pub fn len(&self) -> usize {
        self.state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.state().entries.clear();
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state();
        let lookups = state.hits + state.misses;
        let (hit_rate, miss_rate) = if lookups > 0 {
            (
                state.hits as f64 / lookups as f64,
                state.misses as f64 / lookups as f64,
            )
        } else {
            (0.0, 0.0)
        };

        CacheStats {
            total_entries: state.entries.len(),
            total_size: state.entries.values().map(|e| e.size).sum(),
            hits: state.hits,
            misses: state.misses,
            hit_rate,
            miss_rate,
            eviction_count: state.evictions,
            expired_count: state.expired,
        }
    }

    fn state(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
