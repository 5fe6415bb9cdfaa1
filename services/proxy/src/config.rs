//! Proxy configuration.
//!
//! Process settings come from the environment; the objects to load at
//! startup (clusters, routes, rules, rulelists, listeners) come from a JSON
//! file named by `MP_CONFIG_FILE`.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use serde_json::Value;
use tracing::info;

use crate::admin::Admin;
use crate::proxy::listener::{ListenerConfig, ListenerSpec, RuleListBinding, DEFAULT_MAX_CONNECTIONS};

/// Default admin API address.
pub const DEFAULT_ADMIN_ADDR: &str = "127.0.0.1:1234";

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

/// Process configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Static object definitions loaded at startup.
    pub config_file: PathBuf,

    /// Admin API address. `None` disables the admin API.
    pub admin_addr: Option<SocketAddr>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    pub log_format: LogFormat,

    /// Connection limit for listeners that do not set their own.
    pub max_connections: usize,

    /// Reject malformed match predicates when rules are written.
    pub strict_validation: bool,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let config_file = var("MP_CONFIG_FILE")
            .map(PathBuf::from)
            .context("Missing config file. Set MP_CONFIG_FILE.")?;

        let admin_addr = match var("MP_ADMIN_ADDR") {
            Some(addr) if addr.trim().is_empty() => None,
            Some(addr) => Some(addr),
            None => Some(DEFAULT_ADMIN_ADDR.to_string()),
        }
        .map(|addr| addr.parse())
        .transpose()
        .context("MP_ADMIN_ADDR must be a socket address (example: 127.0.0.1:1234).")?;

        let log_level = var("MP_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let log_format = match var("MP_LOG_FORMAT").as_deref() {
            None | Some("json") => LogFormat::Json,
            Some("pretty") => LogFormat::Pretty,
            Some(other) => bail!("MP_LOG_FORMAT must be \"json\" or \"pretty\", got \"{other}\"."),
        };

        let max_connections: usize = var("MP_MAX_CONNECTIONS")
            .map(|v| v.parse())
            .transpose()
            .context("MP_MAX_CONNECTIONS must be an integer.")?
            .unwrap_or(DEFAULT_MAX_CONNECTIONS)
            .max(1);

        let strict_validation = var("MP_STRICT_VALIDATION")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        Ok(Self {
            config_file,
            admin_addr,
            log_level,
            log_format,
            max_connections,
            strict_validation,
        })
    }
}

/// Objects loaded into the registry at startup.
///
/// ```json
/// {
///   "clusters": [{"name": "web", "spec": {"protocol": "tcp", "endpoints": ["10.0.0.5:80"]}}],
///   "routes": [{"name": "to-web", "destination": "web"}],
///   "rules": [{"name": "any", "match": "*", "action": {"route": "to-web"}}],
///   "rulelists": [{"name": "main", "rules": ["any"]}],
///   "listeners": [{"name": "front", "bind": "0.0.0.0:8080", "rulelist": "main"}]
/// }
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StaticConfig {
    #[serde(default)]
    pub clusters: Vec<Value>,
    #[serde(default)]
    pub routes: Vec<Value>,
    #[serde(default)]
    pub rules: Vec<Value>,
    #[serde(default)]
    pub rulelists: Vec<Value>,
    #[serde(default)]
    pub listeners: Vec<ListenerSpec>,
}

impl StaticConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).context("Config is not a valid static configuration")
    }

    /// Loads every object through `admin`, dependencies first, and returns
    /// the listeners to bind.
    ///
    /// A listener with an inline rulelist gets it registered as
    /// `<listener>_rules` unless the list names itself.
    pub async fn apply(self, admin: &Admin, default_max_connections: usize) -> Result<Vec<ListenerConfig>> {
        for (i, cluster) in self.clusters.into_iter().enumerate() {
            admin
                .add_cluster(cluster)
                .await
                .with_context(|| format!("clusters[{i}]"))?;
        }
        for (i, route) in self.routes.into_iter().enumerate() {
            admin
                .add_route(route)
                .await
                .with_context(|| format!("routes[{i}]"))?;
        }
        for (i, rule) in self.rules.into_iter().enumerate() {
            admin
                .add_rule(rule)
                .await
                .with_context(|| format!("rules[{i}]"))?;
        }
        for (i, rulelist) in self.rulelists.into_iter().enumerate() {
            admin
                .add_rulelist(rulelist)
                .await
                .with_context(|| format!("rulelists[{i}]"))?;
        }

        let mut listeners = Vec::with_capacity(self.listeners.len());
        for spec in self.listeners {
            let rulelist = match spec.rulelist {
                RuleListBinding::Named(name) => {
                    admin
                        .get_rulelist(&name, false)
                        .with_context(|| format!("listener \"{}\"", spec.name))?;
                    name
                }
                RuleListBinding::Inline(mut def) => {
                    let name = def
                        .name
                        .get_or_insert_with(|| format!("{}_rules", spec.name))
                        .clone();
                    admin
                        .add_rulelist(serde_json::to_value(def)?)
                        .await
                        .with_context(|| format!("listener \"{}\"", spec.name))?;
                    name
                }
            };
            let mut config = ListenerConfig::new(spec.name, spec.bind, rulelist);
            config.max_connections = spec.max_connections.unwrap_or(default_max_connections);
            listeners.push(config);
        }

        info!(listener_count = listeners.len(), "Static configuration loaded");
        Ok(listeners)
    }
}
