//! Match: the condition half of a rule.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use super::predicate::Predicate;

/// A rule condition.
///
/// Definitions are parsed at the boundary: a string (conventionally `"*"`)
/// or an absent match is a wildcard, anything else is a predicate.
/// Predicates are not validated here.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(from = "Value", into = "Value")]
pub enum Match {
    #[default]
    Wildcard,
    Predicate(Predicate),
}

impl Match {
    /// Returns true if `metadata` satisfies the condition. Evaluation
    /// errors count as a mismatch.
    pub fn apply(&self, metadata: &Value) -> bool {
        match self {
            Match::Wildcard => true,
            Match::Predicate(predicate) => match predicate.evaluate(metadata) {
                Ok(matched) => matched,
                Err(e) => {
                    warn!(error = %e, predicate = %predicate.expr(), "Predicate evaluation failed");
                    false
                }
            },
        }
    }

    pub fn is_wildcard(&self) -> bool {
        matches!(self, Match::Wildcard)
    }
}

impl From<Value> for Match {
    fn from(value: Value) -> Self {
        match value {
            Value::Null | Value::String(_) => Match::Wildcard,
            other => Match::Predicate(Predicate::new(other)),
        }
    }
}

impl From<Match> for Value {
    fn from(matcher: Match) -> Self {
        match matcher {
            Match::Wildcard => Value::String("*".to_string()),
            Match::Predicate(predicate) => predicate.expr().clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wildcard_matches_anything() {
        let m = Match::from(json!("*"));
        assert!(m.is_wildcard());
        assert!(m.apply(&json!({})));
        assert!(m.apply(&json!(null)));
        assert!(Match::from(json!("anything")).is_wildcard());
        assert!(Match::from(Value::Null).is_wildcard());
    }

    #[test]
    fn test_predicate_dispatch() {
        let m = Match::from(json!({"op": "test", "path": "/TCP/dst_port", "value": 80}));
        assert!(!m.is_wildcard());
        assert!(m.apply(&json!({"TCP": {"dst_port": 80}})));
        assert!(!m.apply(&json!({"TCP": {"dst_port": 8080}})));
    }

    #[test]
    fn test_broken_predicate_is_false() {
        let m = Match::from(json!({"op": "frobnicate", "path": "/a"}));
        assert!(!m.apply(&json!({"a": 1})));
    }

    #[test]
    fn test_serde_roundtrip() {
        let m: Match = serde_json::from_value(json!("*")).unwrap();
        assert_eq!(serde_json::to_value(&m).unwrap(), json!("*"));

        let expr = json!({"op": "defined", "path": "/IP"});
        let m: Match = serde_json::from_value(expr.clone()).unwrap();
        assert_eq!(serde_json::to_value(&m).unwrap(), expr);
    }
}
