//! Health probes: HTTP, TCP and heartbeat TTL

use crate::error::{DiscoveryError, Result};
use crate::types::{HealthCheckKind, Protocol, ServiceRegistration};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use uuid::Uuid;

/// Result of a single probe attempt
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeOutcome {
    pub healthy: bool,
    pub response_time: Option<Duration>,
    pub message: Option<String>,
}

impl ProbeOutcome {
    pub fn healthy(response_time: Duration) -> Self {
        Self {
            healthy: true,
            response_time: Some(response_time),
            message: None,
        }
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self {
            healthy: false,
            response_time: None,
            message: Some(message.into()),
        }
    }
}

/// Executes the health check configured on a registration
#[async_trait]
pub trait ProbeExecutor: Send + Sync {
    /// `ttl` is the discovery-wide heartbeat TTL used by `ttl` checks
    async fn probe(&self, registration: &ServiceRegistration, ttl: Duration) -> ProbeOutcome;
}

/// Probes over the network with a bounded timeout per attempt
#[derive(Debug, Clone)]
pub struct NetworkProbe {
    client: Client,
}

impl NetworkProbe {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .pool_max_idle_per_host(10)
            .build()
            .map_err(|e| {
                DiscoveryError::Connection(format!("failed to create HTTP client: {}", e))
            })?;
        Ok(Self { client })
    }

    fn http_url(registration: &ServiceRegistration) -> String {
        let endpoint = registration
            .health_check
            .endpoint
            .as_deref()
            .unwrap_or("/health");

        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            return endpoint.to_string();
        }

        let scheme = match registration.protocol {
            Protocol::Https => "https",
            _ => "http",
        };
        let path = if endpoint.starts_with('/') {
            endpoint.to_string()
        } else {
            format!("/{}", endpoint)
        };
        format!(
            "{}://{}:{}{}",
            scheme, registration.address, registration.port, path
        )
    }

    async fn probe_http(&self, registration: &ServiceRegistration) -> ProbeOutcome {
        let url = Self::http_url(registration);
        let started = Instant::now();

        match self
            .client
            .get(&url)
            .timeout(registration.health_check.timeout)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => {
                ProbeOutcome::healthy(started.elapsed())
            }
            Ok(response) => {
                ProbeOutcome::unhealthy(format!("{} returned {}", url, response.status()))
            }
            Err(e) if e.is_timeout() => ProbeOutcome::unhealthy(format!(
                "{} timed out after {:?}",
                url, registration.health_check.timeout
            )),
            Err(e) => ProbeOutcome::unhealthy(format!("{} failed: {}", url, e)),
        }
    }

    async fn probe_tcp(&self, registration: &ServiceRegistration) -> ProbeOutcome {
        let timeout = registration.health_check.timeout;
        let started = Instant::now();
        let target = (registration.address.as_str(), registration.port);

        match tokio::time::timeout(timeout, TcpStream::connect(target)).await {
            Ok(Ok(_)) => ProbeOutcome::healthy(started.elapsed()),
            Ok(Err(e)) => ProbeOutcome::unhealthy(format!(
                "connect to {}:{} failed: {}",
                registration.address, registration.port, e
            )),
            Err(_) => ProbeOutcome::unhealthy(format!(
                "connect to {}:{} timed out after {:?}",
                registration.address, registration.port, timeout
            )),
        }
    }
}

/// Healthy while the last heartbeat is younger than `ttl`
pub fn check_ttl(registration: &ServiceRegistration, ttl: Duration) -> ProbeOutcome {
    let age = (Utc::now() - registration.last_heartbeat)
        .to_std()
        .unwrap_or(Duration::ZERO);

    if age < ttl {
        ProbeOutcome::healthy(Duration::ZERO)
    } else {
        ProbeOutcome::unhealthy(format!(
            "last heartbeat {:?} ago exceeds ttl {:?}",
            age, ttl
        ))
    }
}

#[async_trait]
impl ProbeExecutor for NetworkProbe {
    async fn probe(&self, registration: &ServiceRegistration, ttl: Duration) -> ProbeOutcome {
        match registration.health_check.kind {
            HealthCheckKind::Http => self.probe_http(registration).await,
            HealthCheckKind::Tcp => self.probe_tcp(registration).await,
            HealthCheckKind::Ttl => check_ttl(registration, ttl),
        }
    }
}

/// Deterministic probe for tests: every service is healthy unless scripted otherwise.
///
/// TTL checks still evaluate the heartbeat.
#[derive(Debug, Default)]
pub struct ScriptedProbe {
    outcomes: Mutex<HashMap<Uuid, bool>>,
    calls: AtomicU64,
}

impl ScriptedProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_healthy(&self, service_id: Uuid, healthy: bool) {
        self.outcomes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(service_id, healthy);
    }

    /// Number of probe attempts made
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProbeExecutor for ScriptedProbe {
    async fn probe(&self, registration: &ServiceRegistration, ttl: Duration) -> ProbeOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if registration.health_check.kind == HealthCheckKind::Ttl {
            return check_ttl(registration, ttl);
        }

        let healthy = self
            .outcomes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&registration.service_id)
            .copied()
            .unwrap_or(true);

        if healthy {
            ProbeOutcome::healthy(Duration::from_millis(1))
        } else {
            ProbeOutcome::unhealthy("scripted failure")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{HealthCheckConfig, ServiceDefinition};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Answers one connection per entry with that status line; `None` reads the
    /// request and never replies
    async fn serve_http(listener: TcpListener, replies: Vec<Option<&'static str>>) {
        let mut silent = Vec::new();
        for reply in replies {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = stream.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }

            match reply {
                Some(status) => {
                    let response = format!(
                        "HTTP/1.1 {}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
                        status
                    );
                    stream.write_all(response.as_bytes()).await.unwrap();
                    let _ = stream.shutdown().await;
                }
                None => silent.push(stream),
            }
        }
        tokio::time::sleep(Duration::from_secs(10)).await;
    }

    fn registration(kind: HealthCheckKind, port: u16) -> ServiceRegistration {
        ServiceRegistration::from_definition(
            ServiceDefinition::new("svc", "127.0.0.1", port).with_health_check(HealthCheckConfig {
                kind,
                timeout: Duration::from_millis(500),
                ..Default::default()
            }),
        )
    }

    #[test]
    fn test_http_url() {
        let mut reg = registration(HealthCheckKind::Http, 8080);
        assert_eq!(NetworkProbe::http_url(&reg), "http://127.0.0.1:8080/health");

        reg.health_check.endpoint = Some("status".into());
        reg.protocol = Protocol::Https;
        assert_eq!(NetworkProbe::http_url(&reg), "https://127.0.0.1:8080/status");

        reg.health_check.endpoint = Some("http://probe.local/ready".into());
        assert_eq!(NetworkProbe::http_url(&reg), "http://probe.local/ready");
    }

    #[test]
    fn test_ttl_check() {
        let mut reg = registration(HealthCheckKind::Ttl, 1);
        assert!(check_ttl(&reg, Duration::from_secs(10)).healthy);

        reg.last_heartbeat = Utc::now() - chrono::Duration::seconds(30);
        let outcome = check_ttl(&reg, Duration::from_secs(10));
        assert!(!outcome.healthy);
        assert!(outcome.message.is_some());
    }

    #[tokio::test]
    async fn test_tcp_probe() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let probe = NetworkProbe::new().unwrap();

        let up = probe
            .probe(&registration(HealthCheckKind::Tcp, port), Duration::from_secs(30))
            .await;
        assert!(up.healthy);

        drop(listener);
        let down = probe
            .probe(&registration(HealthCheckKind::Tcp, port), Duration::from_secs(30))
            .await;
        assert!(!down.healthy);
    }

    #[tokio::test]
    async fn test_http_check_status_and_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(serve_http(
            listener,
            vec![Some("200 OK"), Some("503 Service Unavailable"), None],
        ));

        let probe = NetworkProbe::new().unwrap();
        let mut reg = registration(HealthCheckKind::Http, port);
        reg.health_check.timeout = Duration::from_millis(200);

        let ok = probe.probe(&reg, Duration::from_secs(30)).await;
        assert!(ok.healthy, "{:?}", ok.message);
        assert!(ok.response_time.is_some());

        let unavailable = probe.probe(&reg, Duration::from_secs(30)).await;
        assert!(!unavailable.healthy);
        assert!(unavailable.message.unwrap().contains("503"));

        let started = Instant::now();
        let silent = probe.probe(&reg, Duration::from_secs(30)).await;
        assert!(!silent.healthy);
        assert!(silent.message.unwrap().contains("timed out"));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_scripted_probe() {
        let probe = ScriptedProbe::new();
        let reg = registration(HealthCheckKind::Http, 80);

        assert!(probe.probe(&reg, Duration::from_secs(1)).await.healthy);
        probe.set_healthy(reg.service_id, false);
        assert!(!probe.probe(&reg, Duration::from_secs(1)).await.healthy);
        assert_eq!(probe.calls(), 2);
    }
}
