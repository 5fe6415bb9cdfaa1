//! Test harness for proxy integration tests.
//!
//! Provides a TCP echo backend, a scripted in-process cluster whose far ends
//! the test drives by hand, a queue-backed source re-acquisition hook, and
//! helpers to spawn the proxy's listener and admin API.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};

use mp_proxy::admin::{self, Admin};
use mp_proxy::engine::{BoxedStream, Cluster, SourceReacquire};
use mp_proxy::{Dispatcher, Listener, ListenerConfig, Registry};

#[allow(dead_code)]
pub struct TcpEchoBackend {
    pub addr: SocketAddr,
    pub connections: Arc<AtomicU64>,
    pub bytes_received: Arc<AtomicU64>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

#[allow(dead_code)]
impl TcpEchoBackend {
    pub async fn spawn() -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let connections = Arc::new(AtomicU64::new(0));
        let bytes_received = Arc::new(AtomicU64::new(0));

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let conn_clone = Arc::clone(&connections);
        let bytes_clone = Arc::clone(&bytes_received);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok((mut stream, _)) => {
                                conn_clone.fetch_add(1, Ordering::Relaxed);
                                let bytes = Arc::clone(&bytes_clone);
                                tokio::spawn(async move {
                                    let mut buf = vec![0u8; 8192];
                                    loop {
                                        match stream.read(&mut buf).await {
                                            Ok(0) => break,
                                            Ok(n) => {
                                                bytes.fetch_add(n as u64, Ordering::Relaxed);
                                                if stream.write_all(&buf[..n]).await.is_err() {
                                                    break;
                                                }
                                            }
                                            Err(_) => break,
                                        }
                                    }
                                });
                            }
                            Err(_) => break,
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Ok(Self {
            addr,
            connections,
            bytes_received,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn connection_count(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }
}

impl Drop for TcpEchoBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// A cluster that refuses its first `failures` connects, then hands the
/// session one end of an in-memory pipe and the test the other.
#[derive(Debug)]
pub struct ScriptedCluster {
    name: String,
    retriable: bool,
    failures: AtomicU64,
    attempts: AtomicU64,
    peers: mpsc::UnboundedSender<DuplexStream>,
}

#[allow(dead_code)]
impl ScriptedCluster {
    pub fn new(
        name: &str,
        failures: u64,
        retriable: bool,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<DuplexStream>) {
        let (peers, rx) = mpsc::unbounded_channel();
        let cluster = Arc::new(Self {
            name: name.to_string(),
            retriable,
            failures: AtomicU64::new(failures),
            attempts: AtomicU64::new(0),
            peers,
        });
        (cluster, rx)
    }

    /// Refuse every connect from now on.
    pub fn refuse_all(&self) {
        self.failures.store(u64::MAX, Ordering::Relaxed);
    }

    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Cluster for ScriptedCluster {
    fn name(&self) -> &str {
        &self.name
    }

    fn retriable(&self) -> bool {
        self.retriable
    }

    async fn stream(&self, _metadata: &Value) -> io::Result<BoxedStream> {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        let refused = self
            .failures
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "scripted refusal"));
        }
        let (near, far) = tokio::io::duplex(4096);
        let _ = self.peers.send(far);
        Ok(Box::new(near))
    }

    fn describe(&self) -> Value {
        json!({ "name": self.name, "attempts": self.attempts() })
    }
}

/// Hands out queued streams as re-acquired sources.
#[derive(Default)]
pub struct QueuedSources {
    streams: Mutex<VecDeque<DuplexStream>>,
}

#[allow(dead_code)]
impl QueuedSources {
    /// Queues a fresh source and returns the client end.
    pub fn push(&self) -> DuplexStream {
        let (client, server) = tokio::io::duplex(4096);
        self.streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(server);
        client
    }
}

#[async_trait]
impl SourceReacquire for QueuedSources {
    async fn reacquire(&self, _metadata: &Value) -> io::Result<BoxedStream> {
        self.streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .map(|s| Box::new(s) as BoxedStream)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no source queued"))
    }
}

/// Registry, dispatcher and admin for one test.
#[allow(dead_code)]
pub struct ProxyHandle {
    pub admin: Admin,
    pub dispatcher: Dispatcher,
}

#[allow(dead_code)]
impl ProxyHandle {
    pub fn new() -> Self {
        let dispatcher = Dispatcher::new(Arc::new(Registry::new()));
        let admin = Admin::new(dispatcher.clone());
        Self { admin, dispatcher }
    }

    /// Registers a collaborator cluster directly in the registry.
    pub async fn add_cluster(&self, cluster: Arc<dyn Cluster>) {
        self.dispatcher
            .registry()
            .update(|snap| {
                snap.insert_cluster(cluster);
                Ok::<_, io::Error>(())
            })
            .await
            .unwrap();
    }

    /// Adds a route to `cluster`, a catch-all rule and a rulelist `main`.
    pub async fn route_all(&self, cluster: &str, retry: Value) {
        self.admin
            .add_route(json!({"name": "r", "destination": cluster, "retry": retry}))
            .await
            .unwrap();
        self.admin
            .add_rule(json!({"name": "all", "match": "*", "action": {"route": "r"}}))
            .await
            .unwrap();
        self.admin
            .add_rulelist(json!({"name": "main", "rules": ["all"]}))
            .await
            .unwrap();
    }

    /// Binds a TCP listener on an ephemeral port and runs it.
    pub async fn spawn_listener(&self, rulelist: &str) -> io::Result<SocketAddr> {
        let config = ListenerConfig::new("test", "127.0.0.1:0".parse().unwrap(), rulelist);
        let listener = Listener::bind(config, self.dispatcher.clone()).await?;
        let addr = listener.local_addr()?;
        let listener = Arc::new(listener);
        tokio::spawn(async move {
            let _ = listener.run().await;
        });
        Ok(addr)
    }

    /// Serves the admin API on an ephemeral port and returns its base URL.
    pub async fn spawn_admin(&self) -> io::Result<String> {
        let tcp = TcpListener::bind("127.0.0.1:0").await?;
        let addr = tcp.local_addr()?;
        let admin = self.admin.clone();
        tokio::spawn(async move {
            let _ = admin::http::serve(tcp, admin).await;
        });
        Ok(format!("http://{addr}{}", admin::http::API_PREFIX))
    }
}

/// Waits for `predicate` to hold, polling briefly.
#[allow(dead_code)]
pub async fn eventually(mut predicate: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !predicate() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
