//! Engine error types.

use thiserror::Error;

/// Errors raised while resolving a session's route.
///
/// Every variant except [`EngineError::Stage`] describes a configuration
/// problem: a dangling name or a malformed action. Stage failures are
/// reported by the stage itself at runtime.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("rule \"{rule}\" referenced by rulelist \"{rulelist}\" does not exist")]
    RuleNotFound { rulelist: String, rule: String },

    #[error("rulelist \"{0}\" does not exist")]
    RuleListNotFound(String),

    #[error("route \"{0}\" does not exist")]
    RouteNotFound(String),

    #[error("cluster \"{0}\" does not exist")]
    ClusterNotFound(String),

    #[error("stage \"{0}\" is not registered")]
    StageNotFound(String),

    #[error("invalid action: {0}")]
    InvalidAction(String),

    #[error("rulelist delegation starting at \"{start}\" exceeded {limit} hops")]
    RuleListLoop { start: String, limit: usize },

    #[error("stage \"{stage}\" failed: {reason}")]
    Stage { stage: String, reason: String },

    #[error("no free session name derived from \"{0}\"")]
    SessionNameExhausted(String),
}

impl EngineError {
    /// Returns true for failures of a runtime stage rather than of the
    /// configuration.
    pub fn is_stage_failure(&self) -> bool {
        matches!(self, EngineError::Stage { .. })
    }
}
