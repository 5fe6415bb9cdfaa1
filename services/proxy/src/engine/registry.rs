//! Registry of rules, rulelists, routes, clusters and stages.
//!
//! Readers take an immutable [`RegistrySnapshot`] and keep it for a whole
//! evaluation, so a concurrent admin edit is either fully visible or not
//! at all. Writers serialize on a mutex, edit a private copy of the current
//! snapshot and publish it with a single atomic swap.

use std::collections::BTreeMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use mp_id::NameAllocator;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use super::boundary::Cluster;
use super::error::EngineError;
use super::route::{ClusterRef, Route, RouteAction, RouteRef};
use super::rule::Rule;
use super::rulelist::{RuleList, RuleLookup};
use super::stage::{Stage, StageLookup};
use crate::proxy::cluster;

/// Longest chain of `{"apply": "<rulelist>"}` delegations followed.
pub const MAX_DELEGATION_HOPS: usize = 8;

/// One consistent view of every named object.
#[derive(Debug, Clone, Default)]
pub struct RegistrySnapshot {
    rules: BTreeMap<String, Arc<Rule>>,
    rulelists: BTreeMap<String, Arc<RuleList>>,
    routes: BTreeMap<String, Arc<Route>>,
    clusters: BTreeMap<String, Arc<dyn Cluster>>,
    stages: BTreeMap<String, Arc<dyn Stage>>,
}

impl RegistrySnapshot {
    pub fn rulelist(&self, name: &str) -> Option<&Arc<RuleList>> {
        self.rulelists.get(name)
    }

    pub fn route(&self, name: &str) -> Option<&Arc<Route>> {
        self.routes.get(name)
    }

    pub fn cluster(&self, name: &str) -> Option<&Arc<dyn Cluster>> {
        self.clusters.get(name)
    }

    pub fn rules(&self) -> impl Iterator<Item = &Arc<Rule>> {
        self.rules.values()
    }

    pub fn rulelists(&self) -> impl Iterator<Item = &Arc<RuleList>> {
        self.rulelists.values()
    }

    pub fn routes(&self) -> impl Iterator<Item = &Arc<Route>> {
        self.routes.values()
    }

    pub fn clusters(&self) -> impl Iterator<Item = &Arc<dyn Cluster>> {
        self.clusters.values()
    }

    pub fn stages(&self) -> impl Iterator<Item = &Arc<dyn Stage>> {
        self.stages.values()
    }

    pub fn insert_rule(&mut self, rule: Arc<Rule>) -> Option<Arc<Rule>> {
        self.rules.insert(rule.name().to_string(), rule)
    }

    pub fn remove_rule(&mut self, name: &str) -> Option<Arc<Rule>> {
        self.rules.remove(name)
    }

    pub fn insert_rulelist(&mut self, rulelist: Arc<RuleList>) -> Option<Arc<RuleList>> {
        self.rulelists.insert(rulelist.name().to_string(), rulelist)
    }

    pub fn remove_rulelist(&mut self, name: &str) -> Option<Arc<RuleList>> {
        self.rulelists.remove(name)
    }

    pub fn insert_route(&mut self, route: Arc<Route>) -> Option<Arc<Route>> {
        self.routes.insert(route.name.clone(), route)
    }

    pub fn remove_route(&mut self, name: &str) -> Option<Arc<Route>> {
        self.routes.remove(name)
    }

    pub fn insert_cluster(&mut self, cluster: Arc<dyn Cluster>) -> Option<Arc<dyn Cluster>> {
        self.clusters.insert(cluster.name().to_string(), cluster)
    }

    pub fn remove_cluster(&mut self, name: &str) -> Option<Arc<dyn Cluster>> {
        self.clusters.remove(name)
    }

    pub fn insert_stage(&mut self, stage: Arc<dyn Stage>) -> Option<Arc<dyn Stage>> {
        self.stages.insert(stage.name().to_string(), stage)
    }

    pub fn remove_stage(&mut self, name: &str) -> Option<Arc<dyn Stage>> {
        self.stages.remove(name)
    }

    /// Evaluates `rulelist` against `metadata` and returns the routing action.
    ///
    /// Actions of the form `{"apply": "<rulelist>"}` hand the decision to
    /// another rulelist. The metadata annotations (`set`, `rewrite`) of every
    /// action taken along the way are applied to `metadata`.
    pub fn lookup(
        &self,
        rulelist: &str,
        metadata: &mut Value,
    ) -> Result<Option<RouteAction>, EngineError> {
        let mut current = rulelist.to_string();
        for _ in 0..=MAX_DELEGATION_HOPS {
            let list = self
                .rulelist(&current)
                .ok_or_else(|| EngineError::RuleListNotFound(current.clone()))?;
            let Some(rule) = list.matching_rule(metadata, self)? else {
                return Ok(None);
            };
            let mut action = RouteAction::parse(rule.action())?;
            action.bound = rule.inline_route().cloned();
            action.annotate(metadata);

            match (&action.route, &action.apply) {
                (None, Some(next)) => {
                    debug!(from = %current, to = %next, "Delegating to rulelist");
                    current = next.clone();
                }
                _ => return Ok(Some(action)),
            }
        }
        Err(EngineError::RuleListLoop {
            start: rulelist.to_string(),
            limit: MAX_DELEGATION_HOPS,
        })
    }

    /// Resolves the route an action points to. An inline route prebuilt by
    /// the matching rule is reused.
    pub fn route_for(
        &self,
        action: &RouteAction,
        names: &NameAllocator,
    ) -> Result<Option<Arc<Route>>, EngineError> {
        if let Some(route) = &action.bound {
            return Ok(Some(Arc::clone(route)));
        }
        action
            .route
            .as_ref()
            .map(|route| self.resolve_route(route, names))
            .transpose()
    }

    /// Resolves a route reference. Inline definitions build a fresh route.
    pub fn resolve_route(
        &self,
        route: &RouteRef,
        names: &NameAllocator,
    ) -> Result<Arc<Route>, EngineError> {
        match route {
            RouteRef::Named(name) => self
                .route(name)
                .cloned()
                .ok_or_else(|| EngineError::RouteNotFound(name.clone())),
            RouteRef::Inline(def) => Ok(Arc::new(Route::from_def((**def).clone(), names))),
        }
    }

    /// Resolves a route's destination to a cluster. Inline destinations
    /// resolve to the instance the route owns.
    pub fn resolve_cluster(&self, route: &Route) -> Result<Arc<dyn Cluster>, EngineError> {
        match &route.destination {
            ClusterRef::Named(name) => self
                .cluster(name)
                .cloned()
                .ok_or_else(|| EngineError::ClusterNotFound(name.clone())),
            ClusterRef::Inline(spec) => Ok(route
                .inline_cluster()
                .cloned()
                .unwrap_or_else(|| cluster::build(spec))),
        }
    }
}

impl RuleLookup for RegistrySnapshot {
    fn rule(&self, name: &str) -> Option<&Arc<Rule>> {
        self.rules.get(name)
    }
}

impl StageLookup for RegistrySnapshot {
    fn stage(&self, name: &str) -> Option<&Arc<dyn Stage>> {
        self.stages.get(name)
    }
}

/// The live registry.
pub struct Registry {
    snapshot: ArcSwap<RegistrySnapshot>,
    write: Mutex<()>,
    names: NameAllocator,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(RegistrySnapshot::default()),
            write: Mutex::new(()),
            names: NameAllocator::new(),
        }
    }

    /// The current snapshot.
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.snapshot.load_full()
    }

    /// Default-name allocator for objects created through this registry.
    pub fn names(&self) -> &NameAllocator {
        &self.names
    }

    /// Applies `edit` to a copy of the current snapshot and publishes the
    /// copy if `edit` succeeds. Nothing is published on error.
    pub async fn update<T, E>(
        &self,
        edit: impl FnOnce(&mut RegistrySnapshot) -> Result<T, E>,
    ) -> Result<T, E> {
        let _writer = self.write.lock().await;
        let mut next = RegistrySnapshot::clone(&self.snapshot.load());
        let out = edit(&mut next)?;
        self.snapshot.store(Arc::new(next));
        Ok(out)
    }
}
