//! Routing and session lifecycle engine.
//!
//! Path Accessor → Match → Rule → RuleList → Route → Session: each layer
//! only depends on the ones before it. The [`Registry`] holds the named
//! objects, the [`Dispatcher`] turns accepted streams into sessions.

pub mod boundary;
pub mod dispatcher;
pub mod error;
pub mod matcher;
mod pipe;
pub mod predicate;
pub mod registry;
pub mod route;
pub mod rule;
pub mod rulelist;
pub mod session;
pub mod stage;

pub use boundary::{BoxedStream, Cluster, DuplexStream, SourceReacquire};
pub use dispatcher::{Dispatcher, SessionRequest, SessionTable};
pub use error::EngineError;
pub use matcher::Match;
pub use pipe::Traffic;
pub use predicate::{Predicate, PredicateError};
pub use registry::{Registry, RegistrySnapshot, MAX_DELEGATION_HOPS};
pub use route::{
    ClusterRef, FailureKind, RetryOn, RetryPolicy, Rewrite, Route, RouteAction, RouteDef, RouteRef,
};
pub use rule::{Rule, RuleDef};
pub use rulelist::{RuleList, RuleListDef, RuleLookup, RuleRef, RuleRefDef};
pub use session::{Session, SessionCounters, SessionOutcome, SessionState};
pub use stage::{Stage, StageSpec};
