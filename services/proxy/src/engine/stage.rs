//! Ingress stages: metadata processing between routing and connecting.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::error::EngineError;
use super::matcher::Match;
use super::route::Rewrite;

/// A named, collaborator-provided stage.
pub trait Stage: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Processes `metadata` in place. An `Err` aborts the route.
    fn apply(&self, metadata: &mut Value) -> Result<(), String>;
}

/// Resolves stage names. Implemented by registry snapshots.
pub trait StageLookup {
    fn stage(&self, name: &str) -> Option<&Arc<dyn Stage>>;
}

/// One entry of a route's `ingress` chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StageSpec {
    /// A registered [`Stage`].
    Named(String),
    /// Writes values into the metadata.
    Rewrite { rewrite: Vec<Rewrite> },
    /// Aborts the route unless the metadata matches.
    Filter { filter: Match },
}

impl StageSpec {
    fn label(&self) -> &str {
        match self {
            StageSpec::Named(name) => name,
            StageSpec::Rewrite { .. } => "rewrite",
            StageSpec::Filter { .. } => "filter",
        }
    }
}

/// Runs `chain` over a copy of `metadata` and returns the processed copy.
///
/// The caller's metadata is untouched when any stage fails.
pub fn run_chain(
    chain: &[StageSpec],
    metadata: &Value,
    stages: &impl StageLookup,
) -> Result<Value, EngineError> {
    let mut working = metadata.clone();
    for spec in chain {
        let result = match spec {
            StageSpec::Named(name) => {
                let stage = stages
                    .stage(name)
                    .ok_or_else(|| EngineError::StageNotFound(name.clone()))?;
                stage.apply(&mut working)
            }
            StageSpec::Rewrite { rewrite } => {
                for entry in rewrite {
                    mp_path::set(&mut working, &entry.path, &entry.value);
                }
                Ok(())
            }
            StageSpec::Filter { filter } => {
                if filter.apply(&working) {
                    Ok(())
                } else {
                    Err("metadata rejected by filter".to_string())
                }
            }
        };
        result.map_err(|reason| EngineError::Stage {
            stage: spec.label().to_string(),
            reason,
        })?;
        debug!(stage = spec.label(), "Stage applied");
    }
    Ok(working)
}
