//! Default names for user-facing entities.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Highest numeric suffix tried by [`unique_name`] before giving up.
pub const MAX_NAME_SUFFIX: u32 = 20;

/// Kinds of named entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NameKind {
    Rule,
    RuleList,
    Route,
    Cluster,
    Listener,
    Session,
}

impl NameKind {
    const ALL: [NameKind; 6] = [
        NameKind::Rule,
        NameKind::RuleList,
        NameKind::Route,
        NameKind::Cluster,
        NameKind::Listener,
        NameKind::Session,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NameKind::Rule => "Rule",
            NameKind::RuleList => "RuleList",
            NameKind::Route => "Route",
            NameKind::Cluster => "Cluster",
            NameKind::Listener => "Listener",
            NameKind::Session => "Session",
        }
    }

    fn slot(self) -> usize {
        self as usize
    }
}

impl fmt::Display for NameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hands out `Kind_<n>` names, one independent counter per kind.
#[derive(Debug, Default)]
pub struct NameAllocator {
    counters: [AtomicU64; NameKind::ALL.len()],
}

impl NameAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the next default name for `kind`.
    pub fn next(&self, kind: NameKind) -> String {
        let n = self.counters[kind.slot()].fetch_add(1, Ordering::Relaxed);
        format!("{kind}_{n}")
    }

    /// Returns the next default name for `kind` that `is_taken` rejects.
    pub fn next_free(&self, kind: NameKind, is_taken: impl Fn(&str) -> bool) -> String {
        loop {
            let name = self.next(kind);
            if !is_taken(&name) {
                return name;
            }
        }
    }
}

/// Picks `base`, or `base_1` .. `base_20` if taken.
///
/// Returns `None` when every candidate is taken.
pub fn unique_name(base: &str, is_taken: impl Fn(&str) -> bool) -> Option<String> {
    if !is_taken(base) {
        return Some(base.to_string());
    }
    (1..=MAX_NAME_SUFFIX)
        .map(|suffix| format!("{base}_{suffix}"))
        .find(|candidate| !is_taken(candidate))
}
