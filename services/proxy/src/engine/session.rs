//! Sessions: one routed connection from acceptance to termination.
//!
//! ```text
//! CREATED --route--> ROUTED --connect--> CONNECTED
//! CONNECTED --failure, retry allowed--> RECONNECTING --connect--> CONNECTED
//! any --no route / config error / retries exhausted / destroy--> TERMINATED
//! ```
//!
//! A session's transitions all happen on its own task, except `destroy`,
//! which flips the state to TERMINATED from outside. TERMINATED is absorbing:
//! the task observes it at its next suspension point (every await races
//! against it) and exits, dropping both streams.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::{Duration, Instant};

use mp_id::SessionId;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use super::boundary::{BoxedStream, Cluster, SourceReacquire};
use super::error::EngineError;
use super::pipe::{pipe, PipeEnd, SourceHalves, Traffic};
use super::registry::Registry;
use super::route::{FailureKind, Route, RetryPolicy};
use super::stage::run_chain;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Created,
    Routed,
    Connected,
    Reconnecting,
    Terminated,
}

/// Why a session terminated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionOutcome {
    /// The source finished and could not or need not be re-established.
    SourceClosed,
    /// No rule matched.
    Unroutable,
    /// A name in the routing chain did not resolve, or an action was malformed.
    ConfigError { reason: String },
    /// An ingress stage rejected the session before any connection attempt.
    RouteAborted { reason: String },
    /// The destination failed and the retry policy does not cover it.
    DestinationFailed { reason: String },
    /// The retry budget of a failure episode ran out.
    RetryExhausted { attempts: u32, reason: String },
    /// Destroyed by an operator or at shutdown.
    Destroyed,
}

impl SessionOutcome {
    /// Returns true for routing failures, which end a session before it
    /// ever connects.
    pub fn is_routing_failure(&self) -> bool {
        matches!(
            self,
            SessionOutcome::Unroutable
                | SessionOutcome::ConfigError { .. }
                | SessionOutcome::RouteAborted { .. }
        )
    }
}

impl From<EngineError> for SessionOutcome {
    fn from(error: EngineError) -> Self {
        if error.is_stage_failure() {
            SessionOutcome::RouteAborted {
                reason: error.to_string(),
            }
        } else {
            SessionOutcome::ConfigError {
                reason: error.to_string(),
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct SessionCounters {
    /// Every call into the cluster, initial and retried.
    pub connect_attempts: AtomicU64,
    /// Successful connects that ended a failure episode.
    pub reconnects: AtomicU64,
    pub traffic: Traffic,
}

/// Shared handle to a live or finished session.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    name: String,
    rulelist: String,
    metadata: Mutex<Value>,
    state: watch::Sender<SessionState>,
    outcome: Mutex<Option<SessionOutcome>>,
    route: Mutex<Option<Arc<Route>>>,
    counters: SessionCounters,
    task: OnceLock<AbortHandle>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Session {
    pub(crate) fn new(name: String, rulelist: String, metadata: Value) -> Self {
        Self {
            id: SessionId::new(),
            name,
            rulelist,
            metadata: Mutex::new(metadata),
            state: watch::Sender::new(SessionState::Created),
            outcome: Mutex::new(None),
            route: Mutex::new(None),
            counters: SessionCounters::default(),
            task: OnceLock::new(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rulelist(&self) -> &str {
        &self.rulelist
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn outcome(&self) -> Option<SessionOutcome> {
        lock(&self.outcome).clone()
    }

    pub fn metadata(&self) -> Value {
        lock(&self.metadata).clone()
    }

    pub fn route(&self) -> Option<Arc<Route>> {
        lock(&self.route).clone()
    }

    pub fn counters(&self) -> &SessionCounters {
        &self.counters
    }

    /// Watches state changes.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Waits until the session reaches `state` or terminates, whichever
    /// comes first, and returns the state reached.
    pub async fn reached(&self, state: SessionState) -> SessionState {
        let mut rx = self.subscribe();
        let _ = rx
            .wait_for(|s| *s == state || *s == SessionState::Terminated)
            .await;
        self.state()
    }

    /// Waits for termination and returns the outcome.
    pub async fn terminated(&self) -> Option<SessionOutcome> {
        self.reached(SessionState::Terminated).await;
        self.outcome()
    }

    /// Writes `value` into the metadata at `path` and returns the new
    /// metadata.
    pub fn set_metadata(&self, path: &str, value: &Value) -> Value {
        self.edit_metadata(|metadata| mp_path::set(metadata, path, value));
        self.metadata()
    }

    /// Runs `edit` with the metadata locked.
    pub fn edit_metadata<R>(&self, edit: impl FnOnce(&mut Value) -> R) -> R {
        edit(&mut lock(&self.metadata))
    }

    pub fn to_json(&self, recursive: bool) -> Value {
        let route = self.route().map(|r| {
            if recursive {
                json!(*r)
            } else {
                Value::String(r.name.clone())
            }
        });
        let traffic = &self.counters.traffic;
        json!({
            "id": self.id,
            "name": self.name,
            "rulelist": self.rulelist,
            "state": self.state(),
            "outcome": self.outcome(),
            "route": route,
            "metadata": self.metadata(),
            "stats": {
                "connect_attempts": self.counters.connect_attempts.load(Ordering::Relaxed),
                "reconnects": self.counters.reconnects.load(Ordering::Relaxed),
                "bytes_in": traffic.ingress.load(Ordering::Relaxed),
                "bytes_out": traffic.egress.load(Ordering::Relaxed),
            },
        })
    }

    /// Moves to `to` unless already terminated. Returns false if terminated.
    pub(crate) fn transition(&self, to: SessionState) -> bool {
        let mut from = to;
        let moved = self.state.send_if_modified(|state| {
            if *state == SessionState::Terminated {
                return false;
            }
            from = *state;
            *state = to;
            true
        });
        if moved {
            debug!(from = ?from, to = ?to, "Session state changed");
        }
        moved
    }

    /// Terminates with `outcome`. Only the first termination counts.
    pub(crate) fn terminate(&self, outcome: SessionOutcome) -> bool {
        self.state.send_if_modified(|state| {
            if *state == SessionState::Terminated {
                return false;
            }
            *lock(&self.outcome) = Some(outcome);
            *state = SessionState::Terminated;
            true
        })
    }

    pub(crate) fn attach(&self, task: AbortHandle) {
        let _ = self.task.set(task);
    }

    /// Terminates the session and aborts its task.
    pub(crate) fn destroy(&self) -> bool {
        let destroyed = self.terminate(SessionOutcome::Destroyed);
        if let Some(task) = self.task.get() {
            task.abort();
        }
        destroyed
    }

    fn commit(&self, metadata: Value, route: Arc<Route>) {
        *lock(&self.metadata) = metadata;
        *lock(&self.route) = Some(route);
    }
}

/// Resolves once the session is TERMINATED.
async fn cancelled(rx: &mut watch::Receiver<SessionState>) {
    let _ = rx.wait_for(|s| *s == SessionState::Terminated).await;
}

/// The body of a session's task.
pub(crate) struct SessionTask {
    pub(crate) session: Arc<Session>,
    pub(crate) registry: Arc<Registry>,
    pub(crate) source: BoxedStream,
    pub(crate) reacquire: Option<Arc<dyn SourceReacquire>>,
}

impl SessionTask {
    pub(crate) async fn run(self) -> SessionOutcome {
        let SessionTask {
            session,
            registry,
            source,
            reacquire,
        } = self;

        let (route, cluster) = match bind(&session, &registry) {
            Ok(binding) => binding,
            Err(outcome) => return outcome,
        };
        if !session.transition(SessionState::Routed) {
            return SessionOutcome::Destroyed;
        }
        info!(route = %route.name, cluster = %cluster.name(), "Session routed");

        let cancel = session.subscribe();
        let connector = Connector {
            session,
            cluster,
            policy: route.retry,
            reacquire,
            cancel,
            episode: None,
            retries: 0,
        };
        connector.run(SourceHalves::new(source)).await
    }
}

/// Evaluates the session's rulelist and binds it to a route and cluster.
///
/// Runs against one registry snapshot. The metadata annotations of the
/// matched action and the ingress stages are committed only on success.
fn bind(session: &Session, registry: &Registry) -> Result<(Arc<Route>, Arc<dyn Cluster>), SessionOutcome> {
    let snapshot = registry.snapshot();
    let mut metadata = session.metadata();

    let action = match snapshot.lookup(session.rulelist(), &mut metadata)? {
        Some(action) => action,
        None => return Err(SessionOutcome::Unroutable),
    };
    let Some(route) = snapshot.route_for(&action, registry.names())? else {
        return Err(SessionOutcome::ConfigError {
            reason: "matched action has no route".to_string(),
        });
    };
    let cluster = snapshot.resolve_cluster(&route)?;
    let metadata = run_chain(&route.ingress, &metadata, &*snapshot)?;

    session.commit(metadata, Arc::clone(&route));
    Ok((route, cluster))
}

/// Drives the connected part of a session: connect, pipe, retry.
struct Connector {
    session: Arc<Session>,
    cluster: Arc<dyn Cluster>,
    policy: RetryPolicy,
    reacquire: Option<Arc<dyn SourceReacquire>>,
    cancel: watch::Receiver<SessionState>,
    /// The failure that opened the current retry episode.
    episode: Option<FailureKind>,
    /// Retries spent in the current episode.
    retries: u32,
}

impl Connector {
    async fn run(mut self, mut source: SourceHalves) -> SessionOutcome {
        loop {
            let metadata = self.session.metadata();
            self.session
                .counters
                .connect_attempts
                .fetch_add(1, Ordering::Relaxed);

            let connected = tokio::select! {
                biased;
                _ = cancelled(&mut self.cancel) => return SessionOutcome::Destroyed,
                result = self.cluster.stream(&metadata) => result,
            };
            let destination = match connected {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(cluster = %self.cluster.name(), error = %e, "Connect failed");
                    if let Err(outcome) = self.backoff(FailureKind::Connect, e.to_string(), None).await {
                        return outcome;
                    }
                    continue;
                }
            };

            if !self.session.transition(SessionState::Connected) {
                return SessionOutcome::Destroyed;
            }
            if self.episode.take().is_some() {
                self.session.counters.reconnects.fetch_add(1, Ordering::Relaxed);
                info!(retries = self.retries, "Session reconnected");
            } else {
                info!("Session connected");
            }
            self.retries = 0;
            let connected_at = Instant::now();

            let end = tokio::select! {
                biased;
                _ = cancelled(&mut self.cancel) => return SessionOutcome::Destroyed,
                end = pipe(&mut source, destination, &self.session.counters.traffic) => end,
            };

            match end {
                PipeEnd::Source(reason) => {
                    debug!(reason = %reason, "Source ended");
                    match self.reacquire_source(reason, connected_at).await {
                        Ok(fresh) => source = fresh,
                        Err(outcome) => return outcome,
                    }
                }
                PipeEnd::Destination(reason) => {
                    warn!(cluster = %self.cluster.name(), reason = %reason, "Destination disconnected");
                    if !self.cluster.retriable() {
                        return SessionOutcome::DestinationFailed { reason };
                    }
                    if let Err(outcome) = self
                        .backoff(FailureKind::Disconnect, reason, Some(connected_at))
                        .await
                    {
                        return outcome;
                    }
                }
            }
        }
    }

    /// Obtains a fresh source after the old one ended.
    ///
    /// Without a re-acquisition hook, or when disconnects are not retried,
    /// the session is over.
    async fn reacquire_source(
        &mut self,
        mut reason: String,
        connected_at: Instant,
    ) -> Result<SourceHalves, SessionOutcome> {
        let Some(hook) = self.reacquire.clone() else {
            return Err(SessionOutcome::SourceClosed);
        };
        if self.policy.budget(FailureKind::Disconnect) == 0 {
            return Err(SessionOutcome::SourceClosed);
        }

        let mut connected_at = Some(connected_at);
        loop {
            self.backoff(FailureKind::Disconnect, reason, connected_at.take())
                .await?;
            let metadata = self.session.metadata();
            let result = tokio::select! {
                biased;
                _ = cancelled(&mut self.cancel) => return Err(SessionOutcome::Destroyed),
                result = hook.reacquire(&metadata) => result,
            };
            match result {
                Ok(stream) => {
                    info!("Source re-acquired");
                    return Ok(SourceHalves::new(stream));
                }
                Err(e) => {
                    warn!(error = %e, "Source re-acquisition failed");
                    reason = e.to_string();
                }
            }
        }
    }

    /// Spends one retry of the current episode and sleeps out the delay.
    ///
    /// The first failure opens an episode and fixes its kind; a successful
    /// connect closes it and refills the budget.
    async fn backoff(
        &mut self,
        failure: FailureKind,
        reason: String,
        connected_at: Option<Instant>,
    ) -> Result<(), SessionOutcome> {
        let kind = *self.episode.get_or_insert(failure);
        let budget = self.policy.budget(kind);
        if budget == 0 {
            return Err(SessionOutcome::DestinationFailed { reason });
        }
        if self.retries >= budget {
            return Err(SessionOutcome::RetryExhausted {
                attempts: self.retries,
                reason,
            });
        }
        self.retries += 1;

        if !self.session.transition(SessionState::Reconnecting) {
            return Err(SessionOutcome::Destroyed);
        }

        // Never reconnect within `timeout` of the last successful connect.
        let delay = match connected_at {
            Some(at) => self.policy.delay().saturating_sub(at.elapsed()),
            None => self.policy.delay(),
        };
        info!(
            attempt = self.retries,
            budget,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            reason = %reason,
            "Scheduling reconnect"
        );

        tokio::select! {
            biased;
            _ = cancelled(&mut self.cancel) => Err(SessionOutcome::Destroyed),
            _ = sleep_unless_zero(delay) => Ok(()),
        }
    }
}

async fn sleep_unless_zero(delay: Duration) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}
