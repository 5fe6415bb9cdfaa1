//! Administrative surface.
//!
//! [`Admin`] is the CRUD layer over the registry and the live session table.
//! Every registry edit runs inside [`Registry::update`], so an operation
//! either publishes a complete new snapshot or leaves the old one in place.
//! [`http`] exposes the same operations as a JSON API.

mod error;
pub mod http;

use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use mp_id::NameKind;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::info;

use crate::engine::registry::RegistrySnapshot;
use crate::engine::rulelist::RuleLookup;
use crate::engine::stage::StageLookup;
use crate::engine::{
    ClusterRef, Dispatcher, Match, Registry, Route, RouteDef, Rule, RuleDef, RuleList,
    RuleListDef, RuleRef, RuleRefDef, Session, Stage, StageSpec,
};
use crate::proxy::cluster::{self, ClusterSpec};

pub use error::{AdminError, ProblemDetails};

/// The kinds of entity the admin surface manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Rule,
    RuleList,
    Route,
    Cluster,
    Stage,
    Session,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Rule => "rule",
            EntityKind::RuleList => "rulelist",
            EntityKind::Route => "route",
            EntityKind::Cluster => "cluster",
            EntityKind::Stage => "stage",
            EntityKind::Session => "session",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn parse<T: DeserializeOwned>(kind: EntityKind, value: Value) -> Result<T, AdminError> {
    serde_json::from_value(value).map_err(|e| AdminError::invalid(kind, e))
}

/// Rejects a definition whose explicit name differs from the entity edited.
fn ensure_name(kind: EntityKind, expected: &str, given: Option<&str>) -> Result<(), AdminError> {
    match given {
        Some(name) if name != expected => Err(AdminError::invalid(
            kind,
            format!("cannot rename \"{expected}\" to \"{name}\""),
        )),
        _ => Ok(()),
    }
}

/// Describes the first route or rule action that still sends to a cluster or
/// runs a stage, as matched by `uses_route` and `uses_rule`.
fn find_user(
    snap: &RegistrySnapshot,
    uses_route: impl Fn(&Route) -> bool,
    uses_rule: impl Fn(&Rule) -> bool,
) -> Option<String> {
    if let Some(route) = snap.routes().find(|r| uses_route(r)) {
        return Some(format!("route \"{}\"", route.name));
    }
    if let Some(rule) = snap.rules().find(|r| uses_rule(r)) {
        return Some(format!("rule \"{}\"", rule.name()));
    }
    snap.rulelists().find_map(|list| {
        list.inline_rules()
            .find(|r| uses_rule(r))
            .map(|rule| format!("rule \"{}\" in rulelist \"{}\"", rule.name(), list.name()))
    })
}

fn already_exists(kind: EntityKind, name: &str) -> AdminError {
    AdminError::AlreadyExists {
        kind,
        name: name.to_string(),
    }
}

/// CRUD over rules, rulelists, routes, clusters, stages and sessions.
#[derive(Clone)]
pub struct Admin {
    dispatcher: Dispatcher,
    strict: bool,
}

impl Admin {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self {
            dispatcher,
            strict: false,
        }
    }

    /// With strict validation, predicates are checked for well-formedness
    /// when a rule is written instead of evaluating to false at runtime.
    pub fn with_strict_validation(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    fn registry(&self) -> &Arc<Registry> {
        self.dispatcher.registry()
    }

    fn check_match(&self, kind: EntityKind, matcher: &Match) -> Result<(), AdminError> {
        match matcher {
            Match::Predicate(predicate) if self.strict => predicate
                .validate()
                .map_err(|e| AdminError::invalid(kind, format!("match: {e}"))),
            _ => Ok(()),
        }
    }

    /// Named entries must resolve; inline rules are checked like rules.
    fn check_rulelist(&self, list: &RuleList, snap: &RegistrySnapshot) -> Result<(), AdminError> {
        for entry in list.rules() {
            match entry {
                RuleRef::Named(name) if snap.rule(name).is_none() => {
                    return Err(AdminError::invalid(
                        EntityKind::RuleList,
                        format!("rule \"{name}\" does not exist"),
                    ));
                }
                RuleRef::Inline(rule) => self.check_match(EntityKind::RuleList, rule.matcher())?,
                RuleRef::Named(_) => {}
            }
        }
        Ok(())
    }

    /// Named destinations and stages must resolve.
    fn check_route(&self, route: &Route, snap: &RegistrySnapshot) -> Result<(), AdminError> {
        if let ClusterRef::Named(name) = &route.destination {
            if snap.cluster(name).is_none() {
                return Err(AdminError::invalid(
                    EntityKind::Route,
                    format!("cluster \"{name}\" does not exist"),
                ));
            }
        }
        for stage in &route.ingress {
            match stage {
                StageSpec::Named(name) if snap.stage(name).is_none() => {
                    return Err(AdminError::invalid(
                        EntityKind::Route,
                        format!("stage \"{name}\" is not registered"),
                    ));
                }
                StageSpec::Filter { filter } => self.check_match(EntityKind::Route, filter)?,
                _ => {}
            }
        }
        Ok(())
    }

    // Rules

    pub fn list_rules(&self) -> Vec<Value> {
        self.registry().snapshot().rules().map(|r| r.to_json()).collect()
    }

    pub fn get_rule(&self, name: &str) -> Result<Value, AdminError> {
        self.registry()
            .snapshot()
            .rule(name)
            .map(|r| r.to_json())
            .ok_or_else(|| AdminError::not_found(EntityKind::Rule, name))
    }

    pub async fn add_rule(&self, def: Value) -> Result<Value, AdminError> {
        let def: RuleDef = parse(EntityKind::Rule, def)?;
        self.check_match(EntityKind::Rule, &def.r#match)?;
        let registry = self.registry();
        let rule = registry
            .update(|snap| {
                let name = match def.name {
                    Some(name) if snap.rule(&name).is_some() => {
                        return Err(already_exists(EntityKind::Rule, &name));
                    }
                    Some(name) => name,
                    None => registry
                        .names()
                        .next_free(NameKind::Rule, |n| snap.rule(n).is_some()),
                };
                let rule = Arc::new(Rule::new(name, def.r#match, def.action));
                snap.insert_rule(Arc::clone(&rule));
                Ok(rule)
            })
            .await?;
        info!(rule = %rule.name(), "Rule added");
        Ok(rule.to_json())
    }

    /// Replaces a rule's match and action. The counters carry over.
    pub async fn update_rule(&self, name: &str, def: Value) -> Result<Value, AdminError> {
        let def: RuleDef = parse(EntityKind::Rule, def)?;
        self.replace_rule(name, def).await
    }

    async fn replace_rule(&self, name: &str, def: RuleDef) -> Result<Value, AdminError> {
        let rule = self
            .registry()
            .update(|snap| self.store_rule(snap, name, def))
            .await?;
        info!(rule = %name, "Rule updated");
        Ok(rule.to_json())
    }

    fn store_rule(
        &self,
        snap: &mut RegistrySnapshot,
        name: &str,
        def: RuleDef,
    ) -> Result<Arc<Rule>, AdminError> {
        ensure_name(EntityKind::Rule, name, def.name.as_deref())?;
        self.check_match(EntityKind::Rule, &def.r#match)?;
        let current = snap
            .rule(name)
            .ok_or_else(|| AdminError::not_found(EntityKind::Rule, name))?;
        let rule = Arc::new(current.updated(def));
        snap.insert_rule(Arc::clone(&rule));
        Ok(rule)
    }

    pub async fn delete_rule(&self, name: &str) -> Result<Value, AdminError> {
        let rule = self
            .registry()
            .update(|snap| {
                if let Some(list) = snap.rulelists().find(|l| l.references(name)) {
                    return Err(AdminError::InUse {
                        kind: EntityKind::Rule,
                        name: name.to_string(),
                        user: format!("rulelist \"{}\"", list.name()),
                    });
                }
                snap.remove_rule(name)
                    .ok_or_else(|| AdminError::not_found(EntityKind::Rule, name))
            })
            .await?;
        info!(rule = %name, "Rule deleted");
        Ok(rule.to_json())
    }

    // RuleLists

    pub fn list_rulelists(&self, recursive: bool) -> Vec<Value> {
        let snap = self.registry().snapshot();
        snap.rulelists()
            .map(|l| l.to_json(recursive, &*snap))
            .collect()
    }

    pub fn get_rulelist(&self, name: &str, recursive: bool) -> Result<Value, AdminError> {
        let snap = self.registry().snapshot();
        snap.rulelist(name)
            .map(|l| l.to_json(recursive, &*snap))
            .ok_or_else(|| AdminError::not_found(EntityKind::RuleList, name))
    }

    pub async fn add_rulelist(&self, def: Value) -> Result<Value, AdminError> {
        let mut def: RuleListDef = parse(EntityKind::RuleList, def)?;
        let registry = self.registry();
        let (name, view) = registry
            .update(|snap| {
                let name = match def.name.take() {
                    Some(name) if snap.rulelist(&name).is_some() => {
                        return Err(already_exists(EntityKind::RuleList, &name));
                    }
                    Some(name) => name,
                    None => registry
                        .names()
                        .next_free(NameKind::RuleList, |n| snap.rulelist(n).is_some()),
                };
                def.name = Some(name);
                let list = RuleList::from_def(def, registry.names());
                self.check_rulelist(&list, snap)?;
                let view = list.to_json(false, &*snap);
                let name = list.name().to_string();
                snap.insert_rulelist(Arc::new(list));
                Ok((name, view))
            })
            .await?;
        info!(rulelist = %name, "RuleList added");
        Ok(view)
    }

    /// Replaces every entry of a rulelist.
    pub async fn update_rulelist(&self, name: &str, def: Value) -> Result<Value, AdminError> {
        let def: RuleListDef = parse(EntityKind::RuleList, def)?;
        self.replace_rulelist(name, def).await
    }

    async fn replace_rulelist(&self, name: &str, def: RuleListDef) -> Result<Value, AdminError> {
        let view = self
            .registry()
            .update(|snap| self.store_rulelist(snap, name, def))
            .await?;
        info!(rulelist = %name, "RuleList updated");
        Ok(view)
    }

    fn store_rulelist(
        &self,
        snap: &mut RegistrySnapshot,
        name: &str,
        mut def: RuleListDef,
    ) -> Result<Value, AdminError> {
        ensure_name(EntityKind::RuleList, name, def.name.as_deref())?;
        if snap.rulelist(name).is_none() {
            return Err(AdminError::not_found(EntityKind::RuleList, name));
        }
        def.name = Some(name.to_string());
        let list = RuleList::from_def(def, self.registry().names());
        self.check_rulelist(&list, snap)?;
        let view = list.to_json(false, &*snap);
        snap.insert_rulelist(Arc::new(list));
        Ok(view)
    }

    pub async fn delete_rulelist(&self, name: &str) -> Result<Value, AdminError> {
        let view = self
            .registry()
            .update(|snap| {
                let view = snap
                    .rulelist(name)
                    .map(|l| l.to_json(false, &*snap))
                    .ok_or_else(|| AdminError::not_found(EntityKind::RuleList, name))?;
                snap.remove_rulelist(name);
                Ok(view)
            })
            .await?;
        info!(rulelist = %name, "RuleList deleted");
        Ok(view)
    }

    pub fn get_rulelist_entry(
        &self,
        name: &str,
        position: usize,
        recursive: bool,
    ) -> Result<Value, AdminError> {
        let snap = self.registry().snapshot();
        let list = snap
            .rulelist(name)
            .ok_or_else(|| AdminError::not_found(EntityKind::RuleList, name))?;
        list.entry_json(position, recursive, &*snap)
            .ok_or_else(|| AdminError::PositionOutOfRange {
                rulelist: name.to_string(),
                position,
                len: list.len(),
            })
    }

    /// Inserts a rule reference or inline rule at `position` (`0..=len`)
    /// and returns the updated rulelist.
    pub async fn insert_rulelist_entry(
        &self,
        name: &str,
        position: usize,
        entry: Value,
    ) -> Result<Value, AdminError> {
        let entry: RuleRefDef = parse(EntityKind::RuleList, entry)?;
        let registry = self.registry();
        let view = registry
            .update(|snap| {
                let list = snap
                    .rulelist(name)
                    .ok_or_else(|| AdminError::not_found(EntityKind::RuleList, name))?;
                let next = list
                    .with_inserted(position, RuleRef::from_def(entry, registry.names()))
                    .ok_or_else(|| AdminError::PositionOutOfRange {
                        rulelist: name.to_string(),
                        position,
                        len: list.len(),
                    })?;
                self.check_rulelist(&next, snap)?;
                let view = next.to_json(false, &*snap);
                snap.insert_rulelist(Arc::new(next));
                Ok(view)
            })
            .await?;
        info!(rulelist = %name, position, "RuleList entry inserted");
        Ok(view)
    }

    /// Removes the entry at `position` and returns it.
    pub async fn delete_rulelist_entry(&self, name: &str, position: usize) -> Result<Value, AdminError> {
        let removed = self
            .registry()
            .update(|snap| {
                let list = snap
                    .rulelist(name)
                    .ok_or_else(|| AdminError::not_found(EntityKind::RuleList, name))?;
                let out_of_range = || AdminError::PositionOutOfRange {
                    rulelist: name.to_string(),
                    position,
                    len: list.len(),
                };
                let removed = list
                    .entry_json(position, false, &*snap)
                    .ok_or_else(out_of_range)?;
                let next = list.with_removed(position).ok_or_else(out_of_range)?;
                snap.insert_rulelist(Arc::new(next));
                Ok(removed)
            })
            .await?;
        info!(rulelist = %name, position, "RuleList entry deleted");
        Ok(removed)
    }

    // Routes

    fn route_json(route: &Route, recursive: bool, snap: &RegistrySnapshot) -> Value {
        let mut view = json!(route);
        if recursive {
            if let ClusterRef::Named(name) = &route.destination {
                if let Some(cluster) = snap.cluster(name) {
                    mp_path::set(&mut view, "/destination", &cluster.describe());
                }
            }
        }
        view
    }

    pub fn list_routes(&self, recursive: bool) -> Vec<Value> {
        let snap = self.registry().snapshot();
        snap.routes()
            .map(|r| Self::route_json(r, recursive, &snap))
            .collect()
    }

    pub fn get_route(&self, name: &str, recursive: bool) -> Result<Value, AdminError> {
        let snap = self.registry().snapshot();
        snap.route(name)
            .map(|r| Self::route_json(r, recursive, &snap))
            .ok_or_else(|| AdminError::not_found(EntityKind::Route, name))
    }

    pub async fn add_route(&self, def: Value) -> Result<Value, AdminError> {
        let mut def: RouteDef = parse(EntityKind::Route, def)?;
        let registry = self.registry();
        let route = registry
            .update(|snap| {
                let name = match def.name.take() {
                    Some(name) if snap.route(&name).is_some() => {
                        return Err(already_exists(EntityKind::Route, &name));
                    }
                    Some(name) => name,
                    None => registry
                        .names()
                        .next_free(NameKind::Route, |n| snap.route(n).is_some()),
                };
                def.name = Some(name);
                let route = Arc::new(Route::from_def(def, registry.names()));
                self.check_route(&route, snap)?;
                snap.insert_route(Arc::clone(&route));
                Ok(route)
            })
            .await?;
        info!(route = %route.name, "Route added");
        Ok(json!(*route))
    }

    /// Replaces a route. Sessions already bound keep the route they bound.
    pub async fn update_route(&self, name: &str, def: Value) -> Result<Value, AdminError> {
        let def: RouteDef = parse(EntityKind::Route, def)?;
        self.replace_route(name, def).await
    }

    async fn replace_route(&self, name: &str, def: RouteDef) -> Result<Value, AdminError> {
        let route = self
            .registry()
            .update(|snap| self.store_route(snap, name, def))
            .await?;
        info!(route = %name, "Route updated");
        Ok(json!(*route))
    }

    fn store_route(
        &self,
        snap: &mut RegistrySnapshot,
        name: &str,
        mut def: RouteDef,
    ) -> Result<Arc<Route>, AdminError> {
        ensure_name(EntityKind::Route, name, def.name.as_deref())?;
        if snap.route(name).is_none() {
            return Err(AdminError::not_found(EntityKind::Route, name));
        }
        def.name = Some(name.to_string());
        let route = Arc::new(Route::from_def(def, self.registry().names()));
        self.check_route(&route, snap)?;
        snap.insert_route(Arc::clone(&route));
        Ok(route)
    }

    pub async fn delete_route(&self, name: &str) -> Result<Value, AdminError> {
        let route = self
            .registry()
            .update(|snap| {
                snap.remove_route(name)
                    .ok_or_else(|| AdminError::not_found(EntityKind::Route, name))
            })
            .await?;
        info!(route = %name, "Route deleted");
        Ok(json!(*route))
    }

    // Clusters

    pub fn list_clusters(&self) -> Vec<Value> {
        self.registry()
            .snapshot()
            .clusters()
            .map(|c| c.describe())
            .collect()
    }

    pub fn get_cluster(&self, name: &str) -> Result<Value, AdminError> {
        self.registry()
            .snapshot()
            .cluster(name)
            .map(|c| c.describe())
            .ok_or_else(|| AdminError::not_found(EntityKind::Cluster, name))
    }

    pub async fn add_cluster(&self, spec: Value) -> Result<Value, AdminError> {
        let spec: ClusterSpec = parse(EntityKind::Cluster, spec)?;
        let cluster = self
            .registry()
            .update(|snap| {
                if snap.cluster(&spec.name).is_some() {
                    return Err(already_exists(EntityKind::Cluster, &spec.name));
                }
                let cluster = cluster::build(&spec);
                snap.insert_cluster(Arc::clone(&cluster));
                Ok(cluster)
            })
            .await?;
        info!(cluster = %cluster.name(), "Cluster added");
        Ok(cluster.describe())
    }

    pub async fn delete_cluster(&self, name: &str) -> Result<Value, AdminError> {
        let cluster = self
            .registry()
            .update(|snap| {
                if let Some(user) = find_user(snap, |r| r.uses_cluster(name), |r| r.uses_cluster(name)) {
                    return Err(AdminError::InUse {
                        kind: EntityKind::Cluster,
                        name: name.to_string(),
                        user,
                    });
                }
                snap.remove_cluster(name)
                    .ok_or_else(|| AdminError::not_found(EntityKind::Cluster, name))
            })
            .await?;
        info!(cluster = %name, "Cluster deleted");
        Ok(cluster.describe())
    }

    // Stages

    pub fn list_stages(&self) -> Vec<Value> {
        self.registry()
            .snapshot()
            .stages()
            .map(|s| Value::String(s.name().to_string()))
            .collect()
    }

    /// Registers a collaborator-provided stage.
    pub async fn add_stage(&self, stage: Arc<dyn Stage>) -> Result<(), AdminError> {
        let name = stage.name().to_string();
        self.registry()
            .update(|snap| {
                if snap.stage(&name).is_some() {
                    return Err(already_exists(EntityKind::Stage, &name));
                }
                snap.insert_stage(stage);
                Ok(())
            })
            .await?;
        info!(stage = %name, "Stage registered");
        Ok(())
    }

    pub async fn delete_stage(&self, name: &str) -> Result<(), AdminError> {
        self.registry()
            .update(|snap| {
                if let Some(user) = find_user(snap, |r| r.uses_stage(name), |r| r.uses_stage(name)) {
                    return Err(AdminError::InUse {
                        kind: EntityKind::Stage,
                        name: name.to_string(),
                        user,
                    });
                }
                snap.remove_stage(name)
                    .map(|_| ())
                    .ok_or_else(|| AdminError::not_found(EntityKind::Stage, name))
            })
            .await
    }

    // Sessions

    pub async fn list_sessions(&self, recursive: bool) -> Vec<Value> {
        self.dispatcher
            .sessions()
            .list()
            .await
            .iter()
            .map(|s| s.to_json(recursive))
            .collect()
    }

    async fn session(&self, name: &str) -> Result<Arc<Session>, AdminError> {
        self.dispatcher
            .sessions()
            .get(name)
            .await
            .ok_or_else(|| AdminError::not_found(EntityKind::Session, name))
    }

    pub async fn get_session(&self, name: &str, recursive: bool) -> Result<Value, AdminError> {
        Ok(self.session(name).await?.to_json(recursive))
    }

    /// Destroys a live session and returns its final view.
    pub async fn delete_session(&self, name: &str) -> Result<Value, AdminError> {
        let session = self.session(name).await?;
        self.dispatcher.destroy(name).await;
        Ok(session.to_json(false))
    }

    // Paths

    /// JSON view of any entity, as returned by the per-kind getters.
    pub async fn get(&self, kind: EntityKind, name: &str, recursive: bool) -> Result<Value, AdminError> {
        match kind {
            EntityKind::Rule => self.get_rule(name),
            EntityKind::RuleList => self.get_rulelist(name, recursive),
            EntityKind::Route => self.get_route(name, recursive),
            EntityKind::Cluster => self.get_cluster(name),
            EntityKind::Stage => self
                .registry()
                .snapshot()
                .stage(name)
                .map(|s| json!({ "name": s.name() }))
                .ok_or_else(|| AdminError::not_found(EntityKind::Stage, name)),
            EntityKind::Session => self.get_session(name, recursive).await,
        }
    }

    /// Reads `path` inside the non-recursive view of an entity.
    pub async fn get_path(&self, kind: EntityKind, name: &str, path: &str) -> Result<Value, AdminError> {
        let view = self.get(kind, name, false).await?;
        mp_path::get(&view, path)
            .cloned()
            .ok_or_else(|| AdminError::PathNotFound {
                kind,
                name: name.to_string(),
                path: path.to_string(),
            })
    }

    /// Writes `value` at `path` inside an entity's definition and stores
    /// the result as a replacement. Returns the new view.
    ///
    /// Sessions accept writes under `/metadata` only.
    pub async fn set_path(
        &self,
        kind: EntityKind,
        name: &str,
        path: &str,
        value: Value,
    ) -> Result<Value, AdminError> {
        self.edit_path(kind, name, path, |doc, at| {
            mp_path::set(doc, at, &value);
            Ok(())
        })
        .await
    }

    /// Removes the node at `path` from an entity's definition and stores
    /// the result as a replacement. Returns the new view.
    pub async fn delete_path(
        &self,
        kind: EntityKind,
        name: &str,
        path: &str,
    ) -> Result<Value, AdminError> {
        self.edit_path(kind, name, path, |doc, at| {
            mp_path::remove(doc, at)
                .map(drop)
                .ok_or_else(|| AdminError::PathNotFound {
                    kind,
                    name: name.to_string(),
                    path: path.to_string(),
                })
        })
        .await
    }

    async fn edit_path(
        &self,
        kind: EntityKind,
        name: &str,
        path: &str,
        edit: impl FnOnce(&mut Value, &str) -> Result<(), AdminError>,
    ) -> Result<Value, AdminError> {
        if mp_path::is_root(path) {
            return Err(AdminError::invalid(kind, "the whole entity cannot be edited by path"));
        }
        let registry = self.registry();
        match kind {
            EntityKind::Rule => {
                let rule = registry
                    .update(|snap| {
                        let rule = snap.rule(name).ok_or_else(|| AdminError::not_found(kind, name))?;
                        let mut doc = json!(rule.to_def());
                        edit(&mut doc, path)?;
                        self.store_rule(snap, name, parse(kind, doc)?)
                    })
                    .await?;
                info!(rule = %name, path, "Rule updated");
                Ok(rule.to_json())
            }
            EntityKind::RuleList => {
                let view = registry
                    .update(|snap| {
                        let mut doc = snap
                            .rulelist(name)
                            .map(|l| l.to_json(false, &*snap))
                            .ok_or_else(|| AdminError::not_found(kind, name))?;
                        edit(&mut doc, path)?;
                        self.store_rulelist(snap, name, parse(kind, doc)?)
                    })
                    .await?;
                info!(rulelist = %name, path, "RuleList updated");
                Ok(view)
            }
            EntityKind::Route => {
                let route = registry
                    .update(|snap| {
                        let route = snap.route(name).ok_or_else(|| AdminError::not_found(kind, name))?;
                        let mut doc = json!(route.to_def());
                        edit(&mut doc, path)?;
                        self.store_route(snap, name, parse(kind, doc)?)
                    })
                    .await?;
                info!(route = %name, path, "Route updated");
                Ok(json!(*route))
            }
            EntityKind::Cluster => {
                let cluster = registry
                    .update(|snap| {
                        let mut doc = snap
                            .cluster(name)
                            .map(|c| c.describe())
                            .ok_or_else(|| AdminError::not_found(kind, name))?;
                        edit(&mut doc, path)?;
                        let spec: ClusterSpec = parse(kind, doc)?;
                        ensure_name(kind, name, Some(&spec.name))?;
                        let cluster = cluster::build(&spec);
                        snap.insert_cluster(Arc::clone(&cluster));
                        Ok(cluster)
                    })
                    .await?;
                info!(cluster = %name, path, "Cluster updated");
                Ok(cluster.describe())
            }
            EntityKind::Stage => Err(AdminError::invalid(kind, "stages are not editable")),
            EntityKind::Session => {
                let segments = mp_path::split(path);
                if segments.len() < 2 || segments[0] != "metadata" {
                    return Err(AdminError::invalid(
                        kind,
                        format!("only fields under /metadata are writable, got \"{path}\""),
                    ));
                }
                let inner = format!("/{}", segments[1..].join("/"));
                let session = self.session(name).await?;
                session.edit_metadata(|metadata| edit(metadata, &inner))?;
                Ok(session.to_json(false))
            }
        }
    }

    /// Everything the admin surface knows about, in one document.
    pub async fn dump(&self) -> Value {
        let snap = self.registry().snapshot();
        let sessions = self.dispatcher.sessions().list().await;
        let live = sessions
            .iter()
            .filter(|s| !matches!(s.state(), crate::engine::SessionState::Terminated))
            .count();
        let bytes: u64 = sessions
            .iter()
            .map(|s| {
                let traffic = &s.counters().traffic;
                traffic.ingress.load(Ordering::Relaxed) + traffic.egress.load(Ordering::Relaxed)
            })
            .sum();
        json!({
            "rules": snap.rules().map(|r| r.to_json()).collect::<Vec<_>>(),
            "rulelists": snap.rulelists().map(|l| l.to_json(false, &*snap)).collect::<Vec<_>>(),
            "routes": snap.routes().map(|r| json!(**r)).collect::<Vec<_>>(),
            "clusters": snap.clusters().map(|c| c.describe()).collect::<Vec<_>>(),
            "stages": snap.stages().map(|s| s.name().to_string()).collect::<Vec<_>>(),
            "sessions": sessions.iter().map(|s| s.to_json(false)).collect::<Vec<_>>(),
            "stats": {
                "sessions_live": live,
                "bytes_forwarded": bytes,
            },
        })
    }
}
