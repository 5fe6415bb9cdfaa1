//! TCP listener.
//!
//! Accepts connections, describes each one as session metadata and hands
//! it to the [`Dispatcher`]. Routing, connecting and forwarding all happen
//! in the session; the listener only holds a connection permit until the
//! session terminates.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn, Instrument};

use crate::engine::{Dispatcher, RuleListDef, SessionRequest};

/// Default maximum concurrent connections per listener.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10000;

/// The rulelist a listener routes with: a registry name or an inline list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RuleListBinding {
    Named(String),
    Inline(RuleListDef),
}

/// Declarative listener definition.
///
/// ```json
/// {"name": "ingress", "bind": "0.0.0.0:8080", "rulelist": "main"}
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerSpec {
    pub name: String,
    pub bind: SocketAddr,
    pub rulelist: RuleListBinding,
    /// Falls back to the process-wide default when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<usize>,
}

/// Configuration for a bound listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub name: String,
    pub bind_addr: SocketAddr,
    /// Name of the registry rulelist sessions are evaluated against.
    pub rulelist: String,
    pub max_connections: usize,
}

impl ListenerConfig {
    pub fn new(name: impl Into<String>, bind_addr: SocketAddr, rulelist: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            bind_addr,
            rulelist: rulelist.into(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

/// Statistics for a listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Connections whose session is still live.
    pub connections_active: AtomicU64,
    /// Connections whose session terminated.
    pub connections_closed: AtomicU64,
    /// Connections rejected due to max limit.
    pub connections_rejected: AtomicU64,
    /// Sessions that ended without ever being routed.
    pub routing_failures: AtomicU64,
}

pub struct Listener {
    config: ListenerConfig,
    listener: TcpListener,
    dispatcher: Dispatcher,
    conn_semaphore: Arc<Semaphore>,
    stats: Arc<ListenerStats>,
}

impl Listener {
    pub async fn bind(config: ListenerConfig, dispatcher: Dispatcher) -> io::Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;

        info!(
            listener = %config.name,
            bind_addr = %local_addr,
            rulelist = %config.rulelist,
            max_connections = config.max_connections,
            "Listener bound"
        );

        Ok(Self {
            conn_semaphore: Arc::new(Semaphore::new(config.max_connections)),
            listener,
            config,
            dispatcher,
            stats: Arc::new(ListenerStats::default()),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn stats(&self) -> &ListenerStats {
        &self.stats
    }

    /// Run the listener, accepting connections until the task is dropped.
    pub async fn run(self: Arc<Self>) -> io::Result<()> {
        let local_addr = self.listener.local_addr()?;
        info!(listener = %self.config.name, bind_addr = %local_addr, "Listener started");

        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let permit = match self.conn_semaphore.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            self.stats
                                .connections_rejected
                                .fetch_add(1, Ordering::Relaxed);
                            warn!(peer_addr = %peer_addr, "Connection rejected: max connections reached");
                            continue;
                        }
                    };

                    self.stats
                        .connections_accepted
                        .fetch_add(1, Ordering::Relaxed);
                    self.stats
                        .connections_active
                        .fetch_add(1, Ordering::Relaxed);

                    let listener = Arc::clone(&self);
                    let stats = Arc::clone(&self.stats);

                    tokio::spawn(
                        async move {
                            if let Err(e) = listener.handle_connection(stream, peer_addr).await {
                                debug!(peer_addr = %peer_addr, error = %e, "Connection error");
                            }

                            stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                            stats.connections_closed.fetch_add(1, Ordering::Relaxed);
                            drop(permit);
                        }
                        .instrument(tracing::info_span!("connection", peer = %peer_addr)),
                    );
                }
                Err(e) => {
                    error!(error = %e, "Accept error");
                    // Brief sleep to avoid tight loop on persistent errors
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn handle_connection(&self, stream: TcpStream, peer_addr: SocketAddr) -> io::Result<()> {
        let local_addr = stream.local_addr()?;
        let _ = stream.set_nodelay(true);
        debug!(peer_addr = %peer_addr, local_addr = %local_addr, "Handling connection");

        let metadata = connection_metadata(&self.config.name, peer_addr, local_addr);
        let request = SessionRequest::new(metadata, self.config.rulelist.clone(), Box::new(stream));
        let session = self
            .dispatcher
            .dispatch(request)
            .await
            .map_err(io::Error::other)?;

        if let Some(outcome) = session.terminated().await {
            if outcome.is_routing_failure() {
                self.stats.routing_failures.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(())
    }
}

/// Session metadata for an accepted TCP connection.
pub fn connection_metadata(listener: &str, peer: SocketAddr, local: SocketAddr) -> Value {
    json!({
        "name": format!("TCP:{}:{}-{}:{}", peer.ip(), peer.port(), local.ip(), local.port()),
        "listener": listener,
        "IP": {
            "src_addr": peer.ip().to_string(),
            "dst_addr": local.ip().to_string(),
        },
        "TCP": {
            "src_port": peer.port(),
            "dst_port": local.port(),
        },
    })
}
