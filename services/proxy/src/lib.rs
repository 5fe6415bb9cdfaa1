//! metaproxy
//!
//! Programmable layer-7 meta-proxy. Listeners accept connections and
//! describe them as JSON metadata; an ordered rulelist of match/action rules
//! picks a route; the route's ingress stages process the metadata and its
//! cluster supplies the destination stream; the session pipes bytes both
//! ways and applies the route's retry policy when either side fails.
//!
//! - [`engine`]: matches, rules, rulelists, routes, sessions, the registry
//!   and the dispatcher
//! - [`proxy`]: the TCP listener and the shipped clusters
//! - [`admin`]: CRUD over everything above, plus its HTTP API
//! - [`config`]: environment settings and the static startup file

pub mod admin;
pub mod config;
pub mod engine;
pub mod proxy;

pub use admin::{Admin, AdminError, EntityKind};
pub use engine::{
    Cluster, Dispatcher, EngineError, Match, Registry, Route, Rule, RuleList, Session,
    SessionOutcome, SessionRequest, SessionState,
};
pub use proxy::{Listener, ListenerConfig};
