//! Session creation and the table of live sessions.

use std::collections::BTreeMap;
use std::sync::Arc;

use mp_id::{unique_name, NameKind};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{info, warn, Instrument};

use super::boundary::{BoxedStream, SourceReacquire};
use super::error::EngineError;
use super::registry::Registry;
use super::session::{Session, SessionOutcome, SessionTask};

/// Everything a listener hands over for a new connection.
pub struct SessionRequest {
    /// Initial metadata. A string `name` field seeds the session name.
    pub metadata: Value,
    /// Rulelist evaluated to route the session.
    pub rulelist: String,
    pub stream: BoxedStream,
    pub reacquire: Option<Arc<dyn SourceReacquire>>,
}

impl SessionRequest {
    pub fn new(metadata: Value, rulelist: impl Into<String>, stream: BoxedStream) -> Self {
        Self {
            metadata,
            rulelist: rulelist.into(),
            stream,
            reacquire: None,
        }
    }

    pub fn with_reacquire(mut self, reacquire: Arc<dyn SourceReacquire>) -> Self {
        self.reacquire = Some(reacquire);
        self
    }
}

/// Live sessions by name.
#[derive(Default)]
pub struct SessionTable {
    sessions: RwLock<BTreeMap<String, Arc<Session>>>,
}

impl SessionTable {
    pub async fn get(&self, name: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(name).cloned()
    }

    pub async fn list(&self) -> Vec<Arc<Session>> {
        self.sessions.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Inserts a session under `base` or the first free suffixed variant.
    async fn insert_unique(
        &self,
        base: &str,
        make: impl FnOnce(String) -> Arc<Session>,
    ) -> Option<Arc<Session>> {
        let mut sessions = self.sessions.write().await;
        let name = unique_name(base, |n| sessions.contains_key(n))?;
        let session = make(name.clone());
        sessions.insert(name, Arc::clone(&session));
        Some(session)
    }

    /// Removes `session` if the entry under its name is still this session.
    async fn remove(&self, session: &Session) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get(session.name()) {
            Some(current) if current.id() == session.id() => {
                sessions.remove(session.name());
                true
            }
            _ => false,
        }
    }
}

/// Turns accepted connections into running sessions.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<Registry>,
    sessions: Arc<SessionTable>,
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            sessions: Arc::new(SessionTable::default()),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn sessions(&self) -> &Arc<SessionTable> {
        &self.sessions
    }

    /// Registers a session and spawns its task.
    ///
    /// The session is visible in the table before its task runs and is
    /// removed when the task finishes.
    pub async fn dispatch(&self, request: SessionRequest) -> Result<Arc<Session>, EngineError> {
        let SessionRequest {
            mut metadata,
            rulelist,
            stream,
            reacquire,
        } = request;

        let base = match metadata.get("name").and_then(Value::as_str) {
            Some(name) => name.to_string(),
            None => self.registry.names().next(NameKind::Session),
        };
        let session = self
            .sessions
            .insert_unique(&base, |name| {
                mp_path::set(&mut metadata, "/name", &Value::String(name.clone()));
                Arc::new(Session::new(name, rulelist, metadata))
            })
            .await
            .ok_or(EngineError::SessionNameExhausted(base))?;

        let task = SessionTask {
            session: Arc::clone(&session),
            registry: Arc::clone(&self.registry),
            source: stream,
            reacquire,
        };
        let span = tracing::info_span!(
            "session",
            id = %session.id(),
            name = %session.name()
        );
        let sessions = Arc::clone(&self.sessions);
        let finished = Arc::clone(&session);
        let handle = tokio::spawn(
            async move {
                let outcome = task.run().await;
                log_outcome(&outcome);
                finished.terminate(outcome);
                sessions.remove(&finished).await;
            }
            .instrument(span),
        );
        session.attach(handle.abort_handle());

        Ok(session)
    }

    /// Destroys a live session. Returns false if no such session exists.
    pub async fn destroy(&self, name: &str) -> bool {
        let Some(session) = self.sessions.get(name).await else {
            return false;
        };
        session.destroy();
        self.sessions.remove(&session).await;
        info!(session = %name, "Session destroyed");
        true
    }

    /// Destroys every live session.
    pub async fn shutdown(&self) {
        let sessions = self.sessions.list().await;
        let count = sessions.len();
        for session in sessions {
            session.destroy();
            self.sessions.remove(&session).await;
        }
        info!(count, "All sessions destroyed");
    }
}

fn log_outcome(outcome: &SessionOutcome) {
    match outcome {
        SessionOutcome::SourceClosed | SessionOutcome::Destroyed => {
            info!(outcome = ?outcome, "Session terminated");
        }
        _ => warn!(outcome = ?outcome, "Session terminated"),
    }
}
