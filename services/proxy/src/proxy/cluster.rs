//! Clusters shipped with the proxy.
//!
//! - `tcp`: a set of endpoints, round-robin among the healthy ones, with a
//!   connect timeout (2s default). A failed connect marks the endpoint
//!   unhealthy until it next succeeds.
//! - `echo`: an in-process peer that returns every byte it receives.

use std::io;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::engine::{BoxedStream, Cluster};

/// Default connect timeout for TCP endpoints.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 2_000;

/// Buffer size of the in-process echo pipe.
const ECHO_BUFFER: usize = 64 * 1024;

/// Declarative cluster definition.
///
/// ```json
/// {"name": "web", "spec": {"protocol": "tcp", "endpoints": ["10.0.0.5:8080"]}}
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSpec {
    pub name: String,
    pub spec: ClusterKind,
    /// Whether sessions may reconnect after an established stream drops.
    #[serde(default = "default_retriable")]
    pub retriable: bool,
}

fn default_retriable() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "lowercase")]
pub enum ClusterKind {
    Tcp {
        /// `host:port` strings, resolved at connect time.
        endpoints: Vec<String>,
        #[serde(default = "default_connect_timeout_ms")]
        connect_timeout_ms: u64,
    },
    Echo,
}

fn default_connect_timeout_ms() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_MS
}

/// Instantiates a cluster from its definition.
pub fn build(spec: &ClusterSpec) -> Arc<dyn Cluster> {
    match &spec.spec {
        ClusterKind::Tcp {
            endpoints,
            connect_timeout_ms,
        } => Arc::new(TcpCluster::new(
            spec.clone(),
            endpoints.clone(),
            Duration::from_millis(*connect_timeout_ms),
        )),
        ClusterKind::Echo => Arc::new(EchoCluster::new(spec.clone())),
    }
}

/// Health status of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Unknown,
}

#[derive(Debug)]
struct EndpointState {
    address: String,
    health: HealthStatus,
    last_failure: Option<Instant>,
    consecutive_failures: u32,
}

impl EndpointState {
    fn eligible(&self) -> bool {
        self.health != HealthStatus::Unhealthy
    }
}

#[derive(Debug)]
pub struct TcpCluster {
    spec: ClusterSpec,
    endpoints: RwLock<Vec<EndpointState>>,
    rr_counter: AtomicUsize,
    connect_timeout: Duration,
    connections_attempted: AtomicU64,
    connections_succeeded: AtomicU64,
}

impl TcpCluster {
    pub fn new(spec: ClusterSpec, endpoints: Vec<String>, connect_timeout: Duration) -> Self {
        let endpoints = endpoints
            .into_iter()
            .map(|address| EndpointState {
                address,
                health: HealthStatus::Unknown,
                last_failure: None,
                consecutive_failures: 0,
            })
            .collect();
        Self {
            spec,
            endpoints: RwLock::new(endpoints),
            rr_counter: AtomicUsize::new(0),
            connect_timeout,
            connections_attempted: AtomicU64::new(0),
            connections_succeeded: AtomicU64::new(0),
        }
    }

    /// Endpoint addresses in try order, starting from the round-robin
    /// position among eligible endpoints. When every endpoint is unhealthy
    /// all of them are tried.
    async fn candidates(&self) -> Vec<String> {
        let endpoints = self.endpoints.read().await;
        let mut eligible: Vec<String> = endpoints
            .iter()
            .filter(|e| e.eligible())
            .map(|e| e.address.clone())
            .collect();
        if eligible.is_empty() {
            eligible = endpoints.iter().map(|e| e.address.clone()).collect();
        }
        if !eligible.is_empty() {
            let start = self.rr_counter.fetch_add(1, Ordering::Relaxed) % eligible.len();
            eligible.rotate_left(start);
        }
        eligible
    }

    async fn try_connect(&self, address: &str) -> io::Result<TcpStream> {
        debug!(cluster = %self.spec.name, endpoint = %address, "Connecting to endpoint");
        match timeout(self.connect_timeout, TcpStream::connect(address)).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timeout")),
        }
    }

    async fn mark(&self, address: &str, healthy: bool) {
        let mut endpoints = self.endpoints.write().await;
        if let Some(state) = endpoints.iter_mut().find(|e| e.address == address) {
            if healthy {
                state.health = HealthStatus::Healthy;
                state.consecutive_failures = 0;
            } else {
                state.health = HealthStatus::Unhealthy;
                state.last_failure = Some(Instant::now());
                state.consecutive_failures += 1;
            }
        }
    }

    pub async fn health(&self) -> Vec<(String, HealthStatus)> {
        self.endpoints
            .read()
            .await
            .iter()
            .map(|e| (e.address.clone(), e.health))
            .collect()
    }
}

#[async_trait]
impl Cluster for TcpCluster {
    fn name(&self) -> &str {
        &self.spec.name
    }

    fn retriable(&self) -> bool {
        self.spec.retriable
    }

    async fn stream(&self, _metadata: &Value) -> io::Result<BoxedStream> {
        self.connections_attempted.fetch_add(1, Ordering::Relaxed);

        let candidates = self.candidates().await;
        if candidates.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("cluster \"{}\" has no endpoints", self.spec.name),
            ));
        }

        let mut last_error = None;
        for address in candidates {
            match self.try_connect(&address).await {
                Ok(stream) => {
                    self.mark(&address, true).await;
                    self.connections_succeeded.fetch_add(1, Ordering::Relaxed);
                    let _ = stream.set_nodelay(true);
                    return Ok(Box::new(stream));
                }
                Err(e) => {
                    warn!(
                        cluster = %self.spec.name,
                        endpoint = %address,
                        error = %e,
                        "Endpoint connection failed"
                    );
                    self.mark(&address, false).await;
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| io::Error::other("no endpoint connected")))
    }

    fn describe(&self) -> Value {
        let mut view = serde_json::to_value(&self.spec).unwrap_or(Value::Null);
        mp_path::set(
            &mut view,
            "/stats",
            &json!({
                "connections_attempted": self.connections_attempted.load(Ordering::Relaxed),
                "connections_succeeded": self.connections_succeeded.load(Ordering::Relaxed),
            }),
        );
        // skipped while a connect is updating health
        if let Ok(endpoints) = self.endpoints.try_read() {
            let health: Vec<Value> = endpoints
                .iter()
                .map(|e| {
                    json!({
                        "address": e.address,
                        "health": e.health,
                        "consecutive_failures": e.consecutive_failures,
                        "last_failure_ms_ago": e.last_failure.map(|at| u64::try_from(at.elapsed().as_millis()).unwrap_or(u64::MAX)),
                    })
                })
                .collect();
            mp_path::set(&mut view, "/health", &Value::Array(health));
        }
        view
    }
}

/// Loops every stream back to its opener.
#[derive(Debug)]
pub struct EchoCluster {
    spec: ClusterSpec,
}

impl EchoCluster {
    pub fn new(spec: ClusterSpec) -> Self {
        Self { spec }
    }
}

#[async_trait]
impl Cluster for EchoCluster {
    fn name(&self) -> &str {
        &self.spec.name
    }

    fn retriable(&self) -> bool {
        self.spec.retriable
    }

    async fn stream(&self, _metadata: &Value) -> io::Result<BoxedStream> {
        let (near, far) = tokio::io::duplex(ECHO_BUFFER);
        tokio::spawn(async move {
            let (mut reader, mut writer) = tokio::io::split(far);
            if let Err(e) = tokio::io::copy(&mut reader, &mut writer).await {
                debug!(error = %e, "Echo stream ended with error");
            }
        });
        Ok(Box::new(near))
    }

    fn describe(&self) -> Value {
        serde_json::to_value(&self.spec).unwrap_or(Value::Null)
    }
}
