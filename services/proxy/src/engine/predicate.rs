//! JSON predicates over session metadata.
//!
//! A predicate is a JSON object naming an operation (`op`), the metadata
//! location it inspects (`path`) and, for most operations, an operand
//! (`value`):
//!
//! ```json
//! {"op": "starts", "path": "/HTTP/url/path", "value": "/api", "ignore_case": true}
//! ```
//!
//! Compound operations (`and`, `or`, `not`) carry their children in `apply`.
//! A compound `path` is a prefix for the children's paths. An array of
//! predicates at the top level means all of them must hold.
//!
//! Evaluation distinguishes two failure modes. A missing target or an
//! operand of the wrong type simply does not match. A structurally broken
//! predicate (no `op`, unknown `op`, missing `value`, bad regex) is a
//! [`PredicateError`].

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use regex::{Regex, RegexBuilder};
use serde_json::{Map, Value};
use thiserror::Error;

/// Structural problems in a predicate expression.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PredicateError {
    #[error("predicate must be an object or an array of objects")]
    NotAnObject,

    #[error("predicate is missing \"op\"")]
    MissingOp,

    #[error("unknown predicate operation \"{0}\"")]
    UnknownOp(String),

    #[error("operation \"{op}\" requires \"{field}\"")]
    MissingField { op: Op, field: &'static str },

    #[error("operation \"{op}\": {reason}")]
    InvalidOperand { op: Op, reason: String },
}

/// Predicate operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Test,
    Contains,
    Defined,
    Undefined,
    Starts,
    Ends,
    Matches,
    In,
    Less,
    More,
    Type,
    And,
    Or,
    Not,
}

impl Op {
    pub fn as_str(&self) -> &'static str {
        match self {
            Op::Test => "test",
            Op::Contains => "contains",
            Op::Defined => "defined",
            Op::Undefined => "undefined",
            Op::Starts => "starts",
            Op::Ends => "ends",
            Op::Matches => "matches",
            Op::In => "in",
            Op::Less => "less",
            Op::More => "more",
            Op::Type => "type",
            Op::And => "and",
            Op::Or => "or",
            Op::Not => "not",
        }
    }

    fn is_compound(&self) -> bool {
        matches!(self, Op::And | Op::Or | Op::Not)
    }

    fn needs_value(&self) -> bool {
        !matches!(
            self,
            Op::Defined | Op::Undefined | Op::And | Op::Or | Op::Not
        )
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Op {
    type Err = PredicateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "test" => Op::Test,
            "contains" => Op::Contains,
            "defined" => Op::Defined,
            "undefined" => Op::Undefined,
            "starts" => Op::Starts,
            "ends" => Op::Ends,
            "matches" => Op::Matches,
            "in" => Op::In,
            "less" => Op::Less,
            "more" => Op::More,
            "type" => Op::Type,
            "and" => Op::And,
            "or" => Op::Or,
            "not" => Op::Not,
            other => return Err(PredicateError::UnknownOp(other.to_string())),
        })
    }
}

const TYPE_NAMES: [&str; 8] = [
    "null",
    "boolean",
    "number",
    "integer",
    "string",
    "array",
    "object",
    "undefined",
];

/// `matches` patterns of one expression, keyed by pattern and case
/// folding, compiled when the predicate is built.
type Patterns = HashMap<(String, bool), Result<Regex, String>>;

/// A predicate expression. Construction accepts any JSON value.
#[derive(Debug, Clone)]
pub struct Predicate {
    expr: Value,
    patterns: Arc<Patterns>,
}

impl PartialEq for Predicate {
    fn eq(&self, other: &Self) -> bool {
        self.expr == other.expr
    }
}

impl Predicate {
    pub fn new(expr: Value) -> Self {
        let mut patterns = Patterns::new();
        compile(&expr, &mut patterns);
        Self {
            expr,
            patterns: Arc::new(patterns),
        }
    }

    pub fn expr(&self) -> &Value {
        &self.expr
    }

    /// Evaluates the predicate against `document`.
    pub fn evaluate(&self, document: &Value) -> Result<bool, PredicateError> {
        eval(&self.expr, document, "", &self.patterns)
    }

    /// Checks the expression's structure without a document.
    ///
    /// Evaluation never calls this; it is an opt-in pre-check for callers
    /// that want to reject malformed predicates up front.
    pub fn validate(&self) -> Result<(), PredicateError> {
        check(&self.expr)
    }
}

fn compile(expr: &Value, patterns: &mut Patterns) {
    match expr {
        Value::Array(all) => all.iter().for_each(|item| compile(item, patterns)),
        Value::Object(fields) => {
            if let Some(children) = fields.get("apply").and_then(Value::as_array) {
                children.iter().for_each(|child| compile(child, patterns));
            }
            if fields.get("op").and_then(Value::as_str) != Some(Op::Matches.as_str()) {
                return;
            }
            let Some(pattern) = fields.get("value").and_then(Value::as_str) else {
                return;
            };
            let ignore_case = fields
                .get("ignore_case")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            patterns
                .entry((pattern.to_string(), ignore_case))
                .or_insert_with(|| {
                    RegexBuilder::new(pattern)
                        .case_insensitive(ignore_case)
                        .build()
                        .map_err(|e| e.to_string())
                });
        }
        _ => {}
    }
}

fn eval(expr: &Value, doc: &Value, base: &str, patterns: &Patterns) -> Result<bool, PredicateError> {
    match expr {
        Value::Array(all) => {
            for item in all {
                if !eval(item, doc, base, patterns)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        Value::Object(fields) => eval_op(fields, doc, base, patterns),
        _ => Err(PredicateError::NotAnObject),
    }
}

fn eval_op(
    fields: &Map<String, Value>,
    doc: &Value,
    base: &str,
    patterns: &Patterns,
) -> Result<bool, PredicateError> {
    let op = op_of(fields)?;
    let path = fields.get("path").and_then(Value::as_str);

    if op.is_compound() {
        let children = children_of(op, fields)?;
        let base = join(base, path.unwrap_or(""));
        return match op {
            Op::And => {
                for child in children {
                    if !eval(child, doc, &base, patterns)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Op::Or => {
                for child in children {
                    if eval(child, doc, &base, patterns)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            _ => {
                for child in children {
                    if eval(child, doc, &base, patterns)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
        };
    }

    let path = path.ok_or(PredicateError::MissingField { op, field: "path" })?;
    let target = mp_path::get(doc, &join(base, path));
    let ignore_case = fields
        .get("ignore_case")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    if !op.needs_value() {
        return Ok(match op {
            Op::Defined => target.is_some(),
            _ => target.is_none(),
        });
    }

    let operand = fields
        .get("value")
        .ok_or(PredicateError::MissingField { op, field: "value" })?;

    match op {
        Op::Test => Ok(target.is_some_and(|t| equals(t, operand, ignore_case))),
        Op::Contains | Op::Starts | Op::Ends => {
            let needle = operand_str(op, operand)?;
            let Some(haystack) = target.and_then(Value::as_str) else {
                return Ok(false);
            };
            let (haystack, needle) = fold(haystack, needle, ignore_case);
            Ok(match op {
                Op::Contains => haystack.contains(needle.as_str()),
                Op::Starts => haystack.starts_with(needle.as_str()),
                _ => haystack.ends_with(needle.as_str()),
            })
        }
        Op::Matches => {
            let pattern = operand_str(op, operand)?;
            let regex = patterns
                .get(&(pattern.to_string(), ignore_case))
                .ok_or_else(|| invalid(op, "pattern was not compiled"))?
                .as_ref()
                .map_err(|reason| invalid(op, reason))?;
            Ok(target
                .and_then(Value::as_str)
                .is_some_and(|s| regex.is_match(s)))
        }
        Op::In => {
            let candidates = operand
                .as_array()
                .ok_or_else(|| invalid(op, "value must be an array"))?;
            Ok(target.is_some_and(|t| candidates.iter().any(|c| equals(t, c, ignore_case))))
        }
        Op::Less | Op::More => {
            let bound = operand
                .as_f64()
                .ok_or_else(|| invalid(op, "value must be a number"))?;
            let Some(actual) = target.and_then(Value::as_f64) else {
                return Ok(false);
            };
            Ok(if op == Op::Less {
                actual < bound
            } else {
                actual > bound
            })
        }
        Op::Type => {
            let expected = type_name(op, operand)?;
            Ok(has_type(target, expected))
        }
        _ => Err(PredicateError::UnknownOp(op.to_string())),
    }
}

fn check(expr: &Value) -> Result<(), PredicateError> {
    match expr {
        Value::Array(all) => all.iter().try_for_each(check),
        Value::Object(fields) => {
            let op = op_of(fields)?;
            if op.is_compound() {
                return children_of(op, fields)?.iter().try_for_each(check);
            }
            if fields.get("path").and_then(Value::as_str).is_none() {
                return Err(PredicateError::MissingField { op, field: "path" });
            }
            if !op.needs_value() {
                return Ok(());
            }
            let operand = fields
                .get("value")
                .ok_or(PredicateError::MissingField { op, field: "value" })?;
            match op {
                Op::Contains | Op::Starts | Op::Ends => operand_str(op, operand).map(drop),
                Op::Matches => {
                    let pattern = operand_str(op, operand)?;
                    RegexBuilder::new(pattern)
                        .build()
                        .map(drop)
                        .map_err(|e| invalid(op, &e.to_string()))
                }
                Op::In if !operand.is_array() => Err(invalid(op, "value must be an array")),
                Op::Less | Op::More if !operand.is_number() => {
                    Err(invalid(op, "value must be a number"))
                }
                Op::Type => type_name(op, operand).map(drop),
                _ => Ok(()),
            }
        }
        _ => Err(PredicateError::NotAnObject),
    }
}

fn op_of(fields: &Map<String, Value>) -> Result<Op, PredicateError> {
    fields
        .get("op")
        .and_then(Value::as_str)
        .ok_or(PredicateError::MissingOp)?
        .parse()
}

fn children_of(op: Op, fields: &Map<String, Value>) -> Result<&Vec<Value>, PredicateError> {
    fields
        .get("apply")
        .and_then(Value::as_array)
        .ok_or(PredicateError::MissingField { op, field: "apply" })
}

fn operand_str(op: Op, operand: &Value) -> Result<&str, PredicateError> {
    operand
        .as_str()
        .ok_or_else(|| invalid(op, "value must be a string"))
}

fn type_name(op: Op, operand: &Value) -> Result<&str, PredicateError> {
    let name = operand_str(op, operand)?;
    if TYPE_NAMES.contains(&name) {
        Ok(name)
    } else {
        Err(invalid(op, &format!("unknown type \"{name}\"")))
    }
}

fn invalid(op: Op, reason: &str) -> PredicateError {
    PredicateError::InvalidOperand {
        op,
        reason: reason.to_string(),
    }
}

fn join(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    format!("{base}/{path}")
}

fn fold(haystack: &str, needle: &str, ignore_case: bool) -> (String, String) {
    if ignore_case {
        (haystack.to_lowercase(), needle.to_lowercase())
    } else {
        (haystack.to_string(), needle.to_string())
    }
}

fn equals(actual: &Value, expected: &Value, ignore_case: bool) -> bool {
    match (actual, expected) {
        (Value::String(a), Value::String(e)) if ignore_case => a.to_lowercase() == e.to_lowercase(),
        (Value::Number(a), Value::Number(e)) => a == e || a.as_f64() == e.as_f64(),
        _ => actual == expected,
    }
}

fn has_type(target: Option<&Value>, expected: &str) -> bool {
    match (target, expected) {
        (None, "undefined") => true,
        (None, _) => false,
        (Some(Value::Null), "null") => true,
        (Some(Value::Bool(_)), "boolean") => true,
        (Some(Value::Number(_)), "number") => true,
        (Some(Value::Number(n)), "integer") => n.is_i64() || n.is_u64(),
        (Some(Value::String(_)), "string") => true,
        (Some(Value::Array(_)), "array") => true,
        (Some(Value::Object(_)), "object") => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn metadata() -> Value {
        json!({
            "name": "TCP:10.0.0.1:4242",
            "IP": {"src_addr": "10.0.0.1", "dst_addr": "10.0.0.2"},
            "TCP": {"src_port": 4242, "dst_port": 80},
            "HTTP": {"url": {"path": "/API/users"}, "method": "GET"},
            "tags": ["a", "b"]
        })
    }

    fn holds(expr: Value) -> bool {
        Predicate::new(expr).evaluate(&metadata()).unwrap()
    }

    #[test]
    fn test_test_operation() {
        assert!(holds(json!({"op": "test", "path": "/TCP/dst_port", "value": 80})));
        assert!(!holds(json!({"op": "test", "path": "/TCP/dst_port", "value": 81})));
        assert!(holds(json!({"op": "test", "path": "/tags", "value": ["a", "b"]})));
        assert!(holds(
            json!({"op": "test", "path": "/HTTP/method", "value": "get", "ignore_case": true})
        ));
        assert!(!holds(json!({"op": "test", "path": "/missing", "value": 1})));
    }

    #[test]
    fn test_defined_and_undefined() {
        assert!(holds(json!({"op": "defined", "path": "/IP/src_addr"})));
        assert!(!holds(json!({"op": "defined", "path": "/IP/nope"})));
        assert!(holds(json!({"op": "undefined", "path": "/IP/nope"})));
    }

    #[test]
    fn test_string_operations() {
        assert!(holds(json!({"op": "starts", "path": "/HTTP/url/path", "value": "/API"})));
        assert!(!holds(json!({"op": "starts", "path": "/HTTP/url/path", "value": "/api"})));
        assert!(holds(
            json!({"op": "starts", "path": "/HTTP/url/path", "value": "/api", "ignore_case": true})
        ));
        assert!(holds(json!({"op": "ends", "path": "/HTTP/url/path", "value": "users"})));
        assert!(holds(json!({"op": "contains", "path": "/name", "value": "10.0.0.1"})));
        // non-string target does not match
        assert!(!holds(json!({"op": "starts", "path": "/TCP/dst_port", "value": "8"})));
    }

    #[test]
    fn test_matches_operation() {
        assert!(holds(json!({"op": "matches", "path": "/IP/src_addr", "value": r"^10\.0\.\d+\.\d+$"})));
        assert!(holds(
            json!({"op": "matches", "path": "/HTTP/url/path", "value": "^/api/", "ignore_case": true})
        ));
        let err = Predicate::new(json!({"op": "matches", "path": "/name", "value": "[bad"}))
            .evaluate(&metadata())
            .unwrap_err();
        assert!(matches!(err, PredicateError::InvalidOperand { op: Op::Matches, .. }));
    }

    #[test]
    fn test_patterns_compiled_once() {
        let predicate = Predicate::new(json!({"op": "or", "apply": [
            {"op": "matches", "path": "/IP/src_addr", "value": r"^192\."},
            {"op": "matches", "path": "/HTTP/url/path", "value": "^/api/", "ignore_case": true},
            {"op": "matches", "path": "/HTTP/method", "value": "^/api/"}
        ]}));
        assert_eq!(predicate.patterns.len(), 3);
        assert!(predicate.patterns.values().all(Result::is_ok));

        let copy = predicate.clone();
        assert!(Arc::ptr_eq(&predicate.patterns, &copy.patterns));
        assert!(copy.evaluate(&metadata()).unwrap());
        assert_eq!(copy, predicate);

        let broken = Predicate::new(json!({"op": "matches", "path": "/name", "value": "[bad"}));
        assert!(broken.patterns.values().all(Result::is_err));
    }

    #[test]
    fn test_in_less_more() {
        assert!(holds(json!({"op": "in", "path": "/TCP/dst_port", "value": [80, 443]})));
        assert!(!holds(json!({"op": "in", "path": "/TCP/dst_port", "value": [8080]})));
        assert!(holds(json!({"op": "less", "path": "/TCP/dst_port", "value": 1024})));
        assert!(holds(json!({"op": "more", "path": "/TCP/src_port", "value": 1024})));
        assert!(!holds(json!({"op": "more", "path": "/HTTP/method", "value": 1})));
    }

    #[test]
    fn test_type_operation() {
        assert!(holds(json!({"op": "type", "path": "/TCP/dst_port", "value": "integer"})));
        assert!(holds(json!({"op": "type", "path": "/tags", "value": "array"})));
        assert!(holds(json!({"op": "type", "path": "/missing", "value": "undefined"})));
        assert!(!holds(json!({"op": "type", "path": "/IP", "value": "string"})));
    }

    #[test]
    fn test_compound_operations() {
        assert!(holds(json!({
            "op": "and",
            "path": "/TCP",
            "apply": [
                {"op": "test", "path": "/dst_port", "value": 80},
                {"op": "more", "path": "/src_port", "value": 1000}
            ]
        })));
        assert!(holds(json!({
            "op": "or",
            "apply": [
                {"op": "test", "path": "/TCP/dst_port", "value": 443},
                {"op": "test", "path": "/TCP/dst_port", "value": 80}
            ]
        })));
        assert!(holds(json!({
            "op": "not",
            "apply": [{"op": "defined", "path": "/HTTP/headers"}]
        })));
        assert!(holds(json!([
            {"op": "defined", "path": "/IP"},
            {"op": "defined", "path": "/TCP"}
        ])));
    }

    #[test]
    fn test_structural_errors() {
        let doc = metadata();
        let run = |expr: Value| Predicate::new(expr).evaluate(&doc);

        assert_eq!(run(json!("nope")), Err(PredicateError::NotAnObject));
        assert_eq!(run(json!({"path": "/a"})), Err(PredicateError::MissingOp));
        assert_eq!(
            run(json!({"op": "equals", "path": "/a"})),
            Err(PredicateError::UnknownOp("equals".into()))
        );
        assert_eq!(
            run(json!({"op": "test", "path": "/name"})),
            Err(PredicateError::MissingField {
                op: Op::Test,
                field: "value"
            })
        );
        assert_eq!(
            run(json!({"op": "and"})),
            Err(PredicateError::MissingField {
                op: Op::And,
                field: "apply"
            })
        );
    }

    #[test]
    fn test_validate_is_independent_of_document() {
        let good = Predicate::new(json!({
            "op": "or",
            "apply": [
                {"op": "matches", "path": "/a", "value": "^x"},
                {"op": "in", "path": "/b", "value": [1]}
            ]
        }));
        assert!(good.validate().is_ok());

        let bad_type = Predicate::new(json!({"op": "type", "path": "/a", "value": "color"}));
        assert!(bad_type.validate().is_err());

        let bad_nested = Predicate::new(json!({
            "op": "and",
            "apply": [{"op": "less", "path": "/a", "value": "ten"}]
        }));
        assert!(bad_nested.validate().is_err());

        // a structurally valid predicate on absent data is still valid
        let absent = Predicate::new(json!({"op": "test", "path": "/nowhere", "value": 1}));
        assert!(absent.validate().is_ok());
    }
}
