//! Per-module connection pools
//!
//! Each module gets its own list of connections. Checkout reuses an idle connection
//! when one exists and otherwise establishes a new one through the [`Connector`].
//! A slot is reserved in `Connecting` state before the connect call so concurrent
//! callers cannot overshoot the per-module or total limit while the pool lock is
//! released.

use crate::error::{ResourceError, Result};
use crate::types::ConnectionUsage;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Active,
    Idle,
    Error,
    Closed,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Active => "active",
            ConnectionStatus::Idle => "idle",
            ConnectionStatus::Error => "error",
            ConnectionStatus::Closed => "closed",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleConnection {
    pub connection_id: Uuid,
    pub module_id: String,
    pub endpoint: String,
    pub status: ConnectionStatus,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    pub usage_count: u64,
    pub error_count: u64,
    #[serde(skip)]
    idle_since: Option<Instant>,
}

impl ModuleConnection {
    fn connecting(module_id: &str) -> Self {
        let now = Utc::now();
        Self {
            connection_id: Uuid::new_v4(),
            module_id: module_id.to_string(),
            endpoint: String::new(),
            status: ConnectionStatus::Connecting,
            created_at: now,
            last_used: now,
            usage_count: 0,
            error_count: 0,
            idle_since: None,
        }
    }

    fn check_out(&mut self) {
        self.status = ConnectionStatus::Active;
        self.last_used = Utc::now();
        self.usage_count += 1;
        self.idle_since = None;
    }

    /// Counts against the per-module limit
    fn is_open(&self) -> bool {
        !matches!(self.status, ConnectionStatus::Error | ConnectionStatus::Closed)
    }
}

/// Establishes the transport behind a pooled connection and returns its endpoint
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, module_id: &str) -> Result<String>;
}

/// Connector with a fixed connect latency and `{base_url}/{module_id}` endpoints
#[derive(Debug, Clone)]
pub struct SimulatedConnector {
    latency: Duration,
    base_url: String,
}

impl SimulatedConnector {
    pub fn new(latency: Duration) -> Self {
        Self {
            latency,
            base_url: "http://localhost:3000".to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

impl Default for SimulatedConnector {
    fn default() -> Self {
        Self::new(Duration::from_millis(100))
    }
}

#[async_trait]
impl Connector for SimulatedConnector {
    async fn connect(&self, module_id: &str) -> Result<String> {
        tokio::time::sleep(self.latency).await;
        Ok(format!("{}/{}", self.base_url.trim_end_matches('/'), module_id))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    pub max_connections_per_module: usize,
    /// Idle connections older than this are closed by the sweep
    pub idle_timeout: Duration,
    /// Upper bound on a single connect call
    pub connection_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections_per_module: 10,
            idle_timeout: Duration::from_secs(300),
            connection_timeout: Duration::from_secs(5),
        }
    }
}

pub struct ConnectionPools {
    config: PoolConfig,
    /// Open connections allowed across every module
    max_total: usize,
    connector: Arc<dyn Connector>,
    pools: Mutex<HashMap<String, Vec<ModuleConnection>>>,
}

impl fmt::Debug for ConnectionPools {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPools")
            .field("config", &self.config)
            .field("max_total", &self.max_total)
            .finish_non_exhaustive()
    }
}

impl ConnectionPools {
    pub fn new(config: PoolConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            config,
            max_total: usize::MAX,
            connector,
            pools: Mutex::new(HashMap::new()),
        }
    }

    /// Cap open connections across all modules
    pub fn with_total_limit(mut self, max_total: usize) -> Self {
        self.max_total = max_total;
        self
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Check out a connection for `module_id`, reusing an idle one when possible
    pub async fn get_connection(&self, module_id: &str) -> Result<ModuleConnection> {
        if module_id.trim().is_empty() {
            return Err(ResourceError::Validation("module_id must not be empty".into()));
        }

        let connection_id = {
            let mut pools = self.pools();
            let total_open = pools
                .values()
                .flat_map(|pool| pool.iter())
                .filter(|c| c.is_open())
                .count();
            let pool = pools.entry(module_id.to_string()).or_default();

            if let Some(conn) = pool.iter_mut().find(|c| c.status == ConnectionStatus::Idle) {
                conn.check_out();
                debug!(
                    module = %module_id,
                    connection = %conn.connection_id,
                    "reused pooled connection"
                );
                return Ok(conn.clone());
            }

            if total_open >= self.max_total {
                return Err(ResourceError::InsufficientResources(format!(
                    "connection limit of {} reached",
                    self.max_total
                )));
            }

            let open = pool.iter().filter(|c| c.is_open()).count();
            if open >= self.config.max_connections_per_module {
                return Err(ResourceError::InsufficientResources(format!(
                    "connection pool for '{}' is exhausted ({} open)",
                    module_id, open
                )));
            }

            let placeholder = ModuleConnection::connecting(module_id);
            let id = placeholder.connection_id;
            pool.push(placeholder);
            id
        };

        let outcome = tokio::time::timeout(
            self.config.connection_timeout,
            self.connector.connect(module_id),
        )
        .await;

        let mut pools = self.pools();
        let conn = pools
            .get_mut(module_id)
            .and_then(|pool| pool.iter_mut().find(|c| c.connection_id == connection_id))
            .ok_or_else(|| ResourceError::NotFound(format!("connection {}", connection_id)))?;

        let failure = match outcome {
            Ok(Ok(endpoint)) => {
                conn.endpoint = endpoint;
                conn.status = ConnectionStatus::Connected;
                conn.check_out();
                debug!(
                    module = %module_id,
                    connection = %connection_id,
                    endpoint = %conn.endpoint,
                    "opened connection"
                );
                return Ok(conn.clone());
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!(
                "connect to '{}' timed out after {:?}",
                module_id, self.config.connection_timeout
            ),
        };

        conn.status = ConnectionStatus::Error;
        conn.error_count += 1;
        warn!(
            module = %module_id,
            connection = %connection_id,
            error = %failure,
            "connection failed"
        );
        Err(ResourceError::Connection(failure))
    }

    /// Return a connection to idle. `false` when it is unknown or not checked out.
    pub fn release_connection(&self, connection_id: Uuid) -> bool {
        let mut pools = self.pools();
        let Some(conn) = pools
            .values_mut()
            .flat_map(|pool| pool.iter_mut())
            .find(|c| c.connection_id == connection_id)
        else {
            return false;
        };

        if conn.status != ConnectionStatus::Active {
            return false;
        }

        conn.status = ConnectionStatus::Idle;
        conn.last_used = Utc::now();
        conn.idle_since = Some(Instant::now());
        true
    }

    pub fn get(&self, connection_id: Uuid) -> Option<ModuleConnection> {
        self.pools()
            .values()
            .flat_map(|pool| pool.iter())
            .find(|c| c.connection_id == connection_id)
            .cloned()
    }

    pub fn connections(&self, module_id: &str) -> Vec<ModuleConnection> {
        self.pools().get(module_id).cloned().unwrap_or_default()
    }

    /// Connections that count against the global connection limit
    pub fn open_count(&self) -> usize {
        self.pools()
            .values()
            .flat_map(|pool| pool.iter())
            .filter(|c| c.is_open())
            .count()
    }

    pub fn usage(&self, max_connections: u32) -> ConnectionUsage {
        let pools = self.pools();
        let mut usage = ConnectionUsage::default();

        for conn in pools.values().flat_map(|pool| pool.iter()) {
            match conn.status {
                ConnectionStatus::Active => usage.active += 1,
                ConnectionStatus::Idle => usage.idle += 1,
                ConnectionStatus::Error => usage.error += 1,
                _ => {}
            }
            if conn.status != ConnectionStatus::Closed {
                usage.total += 1;
            }
        }

        if max_connections > 0 {
            usage.pool_utilization = usage.active as f64 / max_connections as f64 * 100.0;
        }
        usage
    }

    /// Close idle connections past `idle_timeout` and drop failed ones. Returns how many went.
    pub fn sweep(&self) -> usize {
        let idle_timeout = self.config.idle_timeout;
        let mut pools = self.pools();
        let mut closed = 0;

        for pool in pools.values_mut() {
            let before = pool.len();
            pool.retain(|c| match c.status {
                ConnectionStatus::Error | ConnectionStatus::Closed => false,
                ConnectionStatus::Idle => c
                    .idle_since
                    .map_or(true, |since| since.elapsed() < idle_timeout),
                _ => true,
            });
            closed += before - pool.len();
        }
        pools.retain(|_, pool| !pool.is_empty());

        closed
    }

    /// Close every connection
    pub fn close_all(&self) -> usize {
        let mut pools = self.pools();
        let count = pools.values().map(Vec::len).sum();
        pools.clear();
        count
    }

    fn pools(&self) -> MutexGuard<'_, HashMap<String, Vec<ModuleConnection>>> {
        self.pools.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Debug, Default)]
    struct FlakyConnector {
        fail: AtomicBool,
    }

    #[async_trait]
    impl Connector for FlakyConnector {
        async fn connect(&self, module_id: &str) -> Result<String> {
            if self.fail.load(Ordering::SeqCst) {
                Err(ResourceError::Connection("refused".into()))
            } else {
                Ok(format!("mem://{}", module_id))
            }
        }
    }

    fn pools(connector: Arc<dyn Connector>) -> ConnectionPools {
        ConnectionPools::new(
            PoolConfig {
                max_connections_per_module: 2,
                idle_timeout: Duration::from_millis(50),
                connection_timeout: Duration::from_millis(200),
            },
            connector,
        )
    }

    #[tokio::test]
    async fn test_simulated_connector_endpoint() {
        let pools = pools(Arc::new(SimulatedConnector::new(Duration::from_millis(1))));
        let conn = pools.get_connection("billing").await.unwrap();

        assert_eq!(conn.endpoint, "http://localhost:3000/billing");
        assert_eq!(conn.status, ConnectionStatus::Active);
        assert_eq!(conn.usage_count, 1);
    }

    #[tokio::test]
    async fn test_idle_connection_is_reused() {
        let pools = pools(Arc::new(FlakyConnector::default()));

        let first = pools.get_connection("m").await.unwrap();
        assert!(pools.release_connection(first.connection_id));
        assert!(!pools.release_connection(first.connection_id));

        let second = pools.get_connection("m").await.unwrap();
        assert_eq!(second.connection_id, first.connection_id);
        assert_eq!(second.usage_count, 2);
        assert_eq!(pools.connections("m").len(), 1);
    }

    #[tokio::test]
    async fn test_pool_exhaustion() {
        let pools = pools(Arc::new(FlakyConnector::default()));
        pools.get_connection("m").await.unwrap();
        pools.get_connection("m").await.unwrap();

        let err = pools.get_connection("m").await.unwrap_err();
        assert!(matches!(err, ResourceError::InsufficientResources(_)));

        // other modules have their own pool
        assert!(pools.get_connection("n").await.is_ok());
    }

    #[tokio::test]
    async fn test_connect_failure_marks_error() {
        let connector = Arc::new(FlakyConnector::default());
        connector.fail.store(true, Ordering::SeqCst);
        let pools = pools(connector.clone());

        let err = pools.get_connection("m").await.unwrap_err();
        assert!(matches!(err, ResourceError::Connection(_)));

        let conns = pools.connections("m");
        assert_eq!(conns.len(), 1);
        assert_eq!(conns[0].status, ConnectionStatus::Error);
        assert_eq!(conns[0].error_count, 1);
        assert_eq!(pools.usage(10).error, 1);

        assert_eq!(pools.sweep(), 1);
        assert!(pools.connections("m").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout() {
        let pools = pools(Arc::new(SimulatedConnector::new(Duration::from_secs(10))));
        let err = pools.get_connection("slow").await.unwrap_err();

        assert!(matches!(err, ResourceError::Connection(ref m) if m.contains("timed out")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_closes_stale_idle() {
        let pools = pools(Arc::new(FlakyConnector::default()));
        let a = pools.get_connection("m").await.unwrap();
        let b = pools.get_connection("m").await.unwrap();
        pools.release_connection(a.connection_id);

        tokio::time::advance(Duration::from_millis(60)).await;
        assert_eq!(pools.sweep(), 1);

        assert!(pools.get(a.connection_id).is_none());
        assert_eq!(
            pools.get(b.connection_id).map(|c| c.status),
            Some(ConnectionStatus::Active)
        );
    }

    #[tokio::test]
    async fn test_usage_counts() {
        let pools = pools(Arc::new(FlakyConnector::default()));
        let a = pools.get_connection("m").await.unwrap();
        pools.get_connection("m").await.unwrap();
        pools.release_connection(a.connection_id);

        let usage = pools.usage(4);
        assert_eq!(usage.total, 2);
        assert_eq!(usage.active, 1);
        assert_eq!(usage.idle, 1);
        assert_eq!(usage.pool_utilization, 25.0);
        assert_eq!(pools.open_count(), 2);
    }

    #[tokio::test]
    async fn test_total_limit_spans_modules() {
        let pools = pools(Arc::new(FlakyConnector::default())).with_total_limit(2);
        let a = pools.get_connection("m").await.unwrap();
        pools.get_connection("n").await.unwrap();

        let err = pools.get_connection("o").await.unwrap_err();
        assert!(
            matches!(err, ResourceError::InsufficientResources(ref m) if m.contains("limit of 2"))
        );
        assert!(pools.connections("o").is_empty());

        // reuse does not open anything new
        pools.release_connection(a.connection_id);
        let reused = pools.get_connection("m").await.unwrap();
        assert_eq!(reused.connection_id, a.connection_id);
    }

    #[tokio::test]
    async fn test_empty_module_rejected() {
        let pools = pools(Arc::new(FlakyConnector::default()));
        assert!(matches!(
            pools.get_connection("  ").await,
            Err(ResourceError::Validation(_))
        ));
    }
}
