//! RuleList: an ordered, first-match-wins sequence of rules.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use mp_id::{NameAllocator, NameKind};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::error::EngineError;
use super::rule::{Rule, RuleDef};

/// Resolves rule names. Implemented by registry snapshots.
pub trait RuleLookup {
    fn rule(&self, name: &str) -> Option<&Arc<Rule>>;
}

impl RuleLookup for HashMap<String, Arc<Rule>> {
    fn rule(&self, name: &str) -> Option<&Arc<Rule>> {
        self.get(name)
    }
}

impl RuleLookup for BTreeMap<String, Arc<Rule>> {
    fn rule(&self, name: &str) -> Option<&Arc<Rule>> {
        self.get(name)
    }
}

/// Reference to a rule: by registry name or embedded.
#[derive(Debug, Clone)]
pub enum RuleRef {
    Named(String),
    Inline(Arc<Rule>),
}

impl RuleRef {
    pub fn from_def(def: RuleRefDef, names: &NameAllocator) -> Self {
        match def {
            RuleRefDef::Named(name) => RuleRef::Named(name),
            RuleRefDef::Inline(rule) => RuleRef::Inline(Arc::new(Rule::from_def(rule, names))),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            RuleRef::Named(name) => name,
            RuleRef::Inline(rule) => rule.name(),
        }
    }

    fn to_json(&self, recursive: bool, rules: &impl RuleLookup) -> Value {
        match self {
            RuleRef::Inline(rule) => rule.to_json(),
            RuleRef::Named(name) if recursive => rules
                .rule(name)
                .map(|rule| rule.to_json())
                .unwrap_or_else(|| Value::String(name.clone())),
            RuleRef::Named(name) => Value::String(name.clone()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RuleRefDef {
    Named(String),
    Inline(RuleDef),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleListDef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub rules: Vec<RuleRefDef>,
}

#[derive(Debug, Clone)]
pub struct RuleList {
    name: String,
    rules: Vec<RuleRef>,
}

impl RuleList {
    pub fn new(name: impl Into<String>, rules: Vec<RuleRef>) -> Self {
        Self {
            name: name.into(),
            rules,
        }
    }

    pub fn from_def(def: RuleListDef, names: &NameAllocator) -> Self {
        let name = def.name.unwrap_or_else(|| names.next(NameKind::RuleList));
        let rules = def
            .rules
            .into_iter()
            .map(|r| RuleRef::from_def(r, names))
            .collect();
        Self { name, rules }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rules(&self) -> &[RuleRef] {
        &self.rules
    }

    /// Rules defined in place rather than by reference.
    pub fn inline_rules(&self) -> impl Iterator<Item = &Arc<Rule>> {
        self.rules.iter().filter_map(|r| match r {
            RuleRef::Inline(rule) => Some(rule),
            RuleRef::Named(_) => None,
        })
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Returns true if any entry refers to the registry rule `name`.
    pub fn references(&self, rule: &str) -> bool {
        self.rules
            .iter()
            .any(|r| matches!(r, RuleRef::Named(name) if name == rule))
    }

    /// Walks the rules in order and returns the action of the first match.
    ///
    /// Named references are resolved against `rules`; a dangling name is an
    /// error even if an earlier rule would have matched had it existed.
    pub fn evaluate(
        &self,
        metadata: &Value,
        rules: &impl RuleLookup,
    ) -> Result<Option<Value>, EngineError> {
        Ok(self
            .matching_rule(metadata, rules)?
            .map(|rule| rule.action().clone()))
    }

    /// The first rule that matches `metadata`.
    pub fn matching_rule(
        &self,
        metadata: &Value,
        rules: &impl RuleLookup,
    ) -> Result<Option<Arc<Rule>>, EngineError> {
        for entry in &self.rules {
            let rule = match entry {
                RuleRef::Inline(rule) => rule,
                RuleRef::Named(name) => rules.rule(name).ok_or_else(|| EngineError::RuleNotFound {
                    rulelist: self.name.clone(),
                    rule: name.clone(),
                })?,
            };
            if rule.apply(metadata).is_some() {
                return Ok(Some(Arc::clone(rule)));
            }
        }
        Ok(None)
    }

    /// Copy with `entry` inserted at `position` (`0..=len`).
    pub fn with_inserted(&self, position: usize, entry: RuleRef) -> Option<Self> {
        if position > self.rules.len() {
            return None;
        }
        let mut next = self.clone();
        next.rules.insert(position, entry);
        Some(next)
    }

    /// Copy with the entry at `position` (`0..len`) removed.
    pub fn with_removed(&self, position: usize) -> Option<Self> {
        if position >= self.rules.len() {
            return None;
        }
        let mut next = self.clone();
        next.rules.remove(position);
        Some(next)
    }

    /// JSON view. With `recursive`, named rules are expanded in place.
    pub fn to_json(&self, recursive: bool, rules: &impl RuleLookup) -> Value {
        let entries: Vec<Value> = self
            .rules
            .iter()
            .map(|r| r.to_json(recursive, rules))
            .collect();
        json!({ "name": self.name, "rules": entries })
    }

    pub fn entry_json(&self, position: usize, recursive: bool, rules: &impl RuleLookup) -> Option<Value> {
        self.rules.get(position).map(|r| r.to_json(recursive, rules))
    }
}
