//! Routes, retry policies and rule actions.

use std::sync::Arc;
use std::time::Duration;

use mp_id::{NameAllocator, NameKind};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::boundary::Cluster;
use super::error::EngineError;
use super::stage::StageSpec;
use crate::proxy::cluster::{self, ClusterSpec};

/// Default number of retries per failure episode.
pub const DEFAULT_NUM_RETRIES: u32 = 1;

/// Default delay between retries, in milliseconds.
pub const DEFAULT_RETRY_TIMEOUT_MS: u64 = 2000;

/// Which destination failures are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RetryOn {
    #[default]
    Never,
    Always,
    ConnectFailure,
    Disconnect,
}

/// The two ways a destination can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Acquiring a stream from the cluster failed.
    Connect,
    /// An established stream closed or errored.
    Disconnect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default)]
    pub retry_on: RetryOn,
    #[serde(default = "default_num_retries")]
    pub num_retries: u32,
    /// Milliseconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
}

fn default_num_retries() -> u32 {
    DEFAULT_NUM_RETRIES
}

fn default_timeout() -> u64 {
    DEFAULT_RETRY_TIMEOUT_MS
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_on: RetryOn::Never,
            num_retries: DEFAULT_NUM_RETRIES,
            timeout: DEFAULT_RETRY_TIMEOUT_MS,
        }
    }
}

impl RetryPolicy {
    /// Retries allowed for one failure episode of the given kind.
    pub fn budget(&self, kind: FailureKind) -> u32 {
        let retried = match (self.retry_on, kind) {
            (RetryOn::Always, _) => true,
            (RetryOn::ConnectFailure, FailureKind::Connect) => true,
            (RetryOn::Disconnect, FailureKind::Disconnect) => true,
            _ => false,
        };
        if retried {
            self.num_retries
        } else {
            0
        }
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.timeout)
    }
}

/// Where a route sends its traffic.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClusterRef {
    Named(String),
    Inline(ClusterSpec),
}

impl ClusterRef {
    pub fn name(&self) -> &str {
        match self {
            ClusterRef::Named(name) => name,
            ClusterRef::Inline(spec) => &spec.name,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteDef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(alias = "cluster")]
    pub destination: ClusterRef,
    #[serde(default)]
    pub ingress: Vec<StageSpec>,
    #[serde(default)]
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone, Serialize)]
pub struct Route {
    pub name: String,
    pub destination: ClusterRef,
    pub ingress: Vec<StageSpec>,
    pub retry: RetryPolicy,
    /// Instance of an inline destination, shared by every session bound
    /// to this route.
    #[serde(skip)]
    inline_cluster: Option<Arc<dyn Cluster>>,
}

impl Route {
    pub fn from_def(def: RouteDef, names: &NameAllocator) -> Self {
        let name = def.name.clone().unwrap_or_else(|| names.next(NameKind::Route));
        Self::named(name, def)
    }

    /// Builds a route called `name`, ignoring the definition's own name.
    pub fn named(name: String, def: RouteDef) -> Self {
        let inline_cluster = match &def.destination {
            ClusterRef::Inline(spec) => Some(cluster::build(spec)),
            ClusterRef::Named(_) => None,
        };
        Self {
            name,
            destination: def.destination,
            ingress: def.ingress,
            retry: def.retry,
            inline_cluster,
        }
    }

    pub fn inline_cluster(&self) -> Option<&Arc<dyn Cluster>> {
        self.inline_cluster.as_ref()
    }

    pub fn to_def(&self) -> RouteDef {
        RouteDef {
            name: Some(self.name.clone()),
            destination: self.destination.clone(),
            ingress: self.ingress.clone(),
            retry: self.retry,
        }
    }

    /// Returns true if the route sends traffic to the registry cluster `name`.
    pub fn uses_cluster(&self, name: &str) -> bool {
        matches!(&self.destination, ClusterRef::Named(n) if n == name)
    }

    /// Returns true if the route runs the registry stage `name`.
    pub fn uses_stage(&self, name: &str) -> bool {
        self.ingress
            .iter()
            .any(|s| matches!(s, StageSpec::Named(n) if n == name))
    }
}

/// Route reference inside an action.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RouteRef {
    Named(String),
    Inline(Box<RouteDef>),
}

/// A metadata write performed when an action is taken.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rewrite {
    pub path: String,
    pub value: Value,
}

/// The structured reading of a rule action.
///
/// ```json
/// {"route": "web", "set": {"tier": "gold"}, "rewrite": [{"path": "/HTTP/host", "value": "api"}]}
/// {"apply": "other-rulelist"}
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouteAction {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<RouteRef>,
    /// Defers the decision to another rulelist.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apply: Option<String>,
    /// Top-level keys merged into the metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub set: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rewrite: Vec<Rewrite>,
    /// The prebuilt inline route of the rule that produced this action.
    #[serde(skip)]
    pub bound: Option<Arc<Route>>,
}

impl RouteAction {
    pub fn parse(action: &Value) -> Result<Self, EngineError> {
        let parsed: Self = serde_json::from_value(action.clone())
            .map_err(|e| EngineError::InvalidAction(e.to_string()))?;
        if parsed.route.is_none() && parsed.apply.is_none() {
            return Err(EngineError::InvalidAction(
                "action names neither a route nor a rulelist to apply".to_string(),
            ));
        }
        Ok(parsed)
    }

    /// Applies `set` then `rewrite` to `metadata`.
    pub fn annotate(&self, metadata: &mut Value) {
        if let Some(set) = &self.set {
            if !metadata.is_object() {
                *metadata = Value::Object(Map::new());
            }
            if let Value::Object(map) = metadata {
                for (key, value) in set {
                    map.insert(key.clone(), value.clone());
                }
            }
        }
        for rewrite in &self.rewrite {
            mp_path::set(metadata, &rewrite.path, &rewrite.value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_retry_defaults() {
        let policy: RetryPolicy = serde_json::from_value(json!({})).unwrap();
        assert_eq!(policy, RetryPolicy::default());
        assert_eq!(policy.retry_on, RetryOn::Never);
        assert_eq!(policy.num_retries, 1);
        assert_eq!(policy.delay(), Duration::from_millis(2000));
    }

    #[test]
    fn test_retry_budget_per_kind() {
        let policy = |retry_on| RetryPolicy {
            retry_on,
            num_retries: 3,
            timeout: 10,
        };
        assert_eq!(policy(RetryOn::Never).budget(FailureKind::Connect), 0);
        assert_eq!(policy(RetryOn::Never).budget(FailureKind::Disconnect), 0);
        assert_eq!(policy(RetryOn::Always).budget(FailureKind::Connect), 3);
        assert_eq!(policy(RetryOn::Always).budget(FailureKind::Disconnect), 3);
        assert_eq!(policy(RetryOn::ConnectFailure).budget(FailureKind::Connect), 3);
        assert_eq!(policy(RetryOn::ConnectFailure).budget(FailureKind::Disconnect), 0);
        assert_eq!(policy(RetryOn::Disconnect).budget(FailureKind::Connect), 0);
        assert_eq!(policy(RetryOn::Disconnect).budget(FailureKind::Disconnect), 3);
    }

    #[test]
    fn test_retry_on_wire_names() {
        let policy: RetryPolicy =
            serde_json::from_value(json!({"retry_on": "connect-failure", "timeout": 50})).unwrap();
        assert_eq!(policy.retry_on, RetryOn::ConnectFailure);
        assert_eq!(policy.timeout, 50);
        assert!(serde_json::from_value::<RetryPolicy>(json!({"retry_on": "sometimes"})).is_err());
    }

    #[test]
    fn test_route_def_accepts_cluster_alias() {
        let def: RouteDef = serde_json::from_value(json!({"cluster": "backend"})).unwrap();
        let route = Route::from_def(def, &NameAllocator::new());
        assert_eq!(route.name, "Route_0");
        assert!(route.uses_cluster("backend"));
        assert_eq!(route.retry, RetryPolicy::default());
    }

    #[test]
    fn test_action_parse() {
        let action = RouteAction::parse(&json!({"route": "web"})).unwrap();
        assert!(matches!(action.route, Some(RouteRef::Named(ref n)) if n == "web"));

        let action = RouteAction::parse(&json!({
            "route": {"destination": {"name": "inline", "spec": {"protocol": "echo"}}}
        }))
        .unwrap();
        assert!(matches!(action.route, Some(RouteRef::Inline(_))));

        let action = RouteAction::parse(&json!({"apply": "next"})).unwrap();
        assert_eq!(action.apply.as_deref(), Some("next"));

        assert!(RouteAction::parse(&json!({"set": {}})).is_err());
        assert!(RouteAction::parse(&json!("web")).is_err());
    }

    #[test]
    fn test_action_annotates_metadata() {
        let action = RouteAction::parse(&json!({
            "route": "web",
            "set": {"tier": "gold"},
            "rewrite": [{"path": "/HTTP/host", "value": "api.local"}]
        }))
        .unwrap();
        let mut metadata = json!({"name": "s"});
        action.annotate(&mut metadata);
        assert_eq!(
            metadata,
            json!({"name": "s", "tier": "gold", "HTTP": {"host": "api.local"}})
        );
    }

    #[test]
    fn test_set_keys_are_not_paths() {
        let action = RouteAction::parse(&json!({
            "route": "web",
            "set": {"a/b": 1, "": "empty", "x": {"y": 2}}
        }))
        .unwrap();
        let mut metadata = json!({"name": "s", "x": {"z": 1}});
        action.annotate(&mut metadata);
        assert_eq!(
            metadata,
            json!({"name": "s", "a/b": 1, "": "empty", "x": {"y": 2}})
        );
    }

    #[test]
    fn test_set_on_root_key_keeps_metadata() {
        let action = RouteAction::parse(&json!({"route": "web", "set": {"/": "gone"}})).unwrap();
        let mut metadata = json!({"name": "s"});
        action.annotate(&mut metadata);
        assert_eq!(metadata["name"], json!("s"));
        assert_eq!(metadata["/"], json!("gone"));
    }
}
