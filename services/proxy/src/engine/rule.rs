//! Rule: a match paired with an opaque action.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use mp_id::{NameAllocator, NameKind};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::trace;

use super::matcher::Match;
use super::route::{Route, RouteDef};

/// Declarative rule definition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleDef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub r#match: Match,
    #[serde(default)]
    pub action: Value,
}

/// Per-rule counters. Shared by every version of a rule so that updates
/// keep the history.
#[derive(Debug, Default)]
pub struct RuleStats {
    total_applied: AtomicU64,
}

impl RuleStats {
    pub fn total_applied(&self) -> u64 {
        self.total_applied.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
pub struct Rule {
    name: String,
    matcher: Match,
    action: Value,
    stats: Arc<RuleStats>,
    /// Route built from an inline `{"route": {...}}` action. Unnamed inline
    /// routes are called `<rule>_route`.
    inline_route: Option<Arc<Route>>,
}

fn inline_route(rule: &str, action: &Value) -> Option<Arc<Route>> {
    let def = action.get("route").filter(|def| def.is_object())?;
    let def: RouteDef = serde_json::from_value(def.clone()).ok()?;
    let name = def.name.clone().unwrap_or_else(|| format!("{rule}_route"));
    Some(Arc::new(Route::named(name, def)))
}

impl Rule {
    pub fn new(name: impl Into<String>, matcher: Match, action: Value) -> Self {
        let name = name.into();
        let inline_route = inline_route(&name, &action);
        Self {
            name,
            matcher,
            action,
            stats: Arc::default(),
            inline_route,
        }
    }

    /// Builds a rule, naming it from `names` if the definition has no name.
    pub fn from_def(def: RuleDef, names: &NameAllocator) -> Self {
        let name = def.name.unwrap_or_else(|| names.next(NameKind::Rule));
        Self::new(name, def.r#match, def.action)
    }

    /// Replaces match and action, keeping the name and the counters.
    pub fn updated(&self, def: RuleDef) -> Self {
        Self {
            name: self.name.clone(),
            inline_route: inline_route(&self.name, &def.action),
            matcher: def.r#match,
            action: def.action,
            stats: Arc::clone(&self.stats),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn matcher(&self) -> &Match {
        &self.matcher
    }

    pub fn action(&self) -> &Value {
        &self.action
    }

    pub fn total_applied(&self) -> u64 {
        self.stats.total_applied()
    }

    pub fn inline_route(&self) -> Option<&Arc<Route>> {
        self.inline_route.as_ref()
    }

    /// Returns true if the action's inline route sends to registry cluster `name`.
    pub fn uses_cluster(&self, name: &str) -> bool {
        self.inline_route.as_ref().is_some_and(|r| r.uses_cluster(name))
    }

    pub fn uses_stage(&self, name: &str) -> bool {
        self.inline_route.as_ref().is_some_and(|r| r.uses_stage(name))
    }

    /// Returns the action if the rule matches `metadata`.
    pub fn apply(&self, metadata: &Value) -> Option<&Value> {
        if !self.matcher.apply(metadata) {
            trace!(rule = %self.name, "No match");
            return None;
        }
        self.stats.total_applied.fetch_add(1, Ordering::Relaxed);
        trace!(rule = %self.name, "Match");
        Some(&self.action)
    }

    pub fn to_def(&self) -> RuleDef {
        RuleDef {
            name: Some(self.name.clone()),
            r#match: self.matcher.clone(),
            action: self.action.clone(),
        }
    }

    pub fn to_json(&self) -> Value {
        json!({
            "name": self.name,
            "match": self.matcher,
            "action": self.action,
            "stats": { "total_applied": self.total_applied() },
        })
    }
}
