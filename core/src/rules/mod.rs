//! The Rule Registry (spec.md §4.1): holds rules, compiles the multi-pattern
//! `RuleDatabase`, and versions it without ever losing history.

pub mod database;
pub mod pattern;

use crate::error::{Error, Result};
use crate::store::{memory::MemoryStore, HasRowId, Page, RowId, Store};
use database::{PatternSpec, RuleDatabase};
pub use pattern::{Direction, Pattern, PatternFlags};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    #[serde(default)]
    pub id: RowId,
    pub name: String,
    pub color: String,
    #[serde(default)]
    pub notes: String,
    pub enabled: bool,
    pub patterns: Vec<Pattern>,
    #[serde(default)]
    pub version: u64,
}

impl HasRowId for Rule {
    fn row_id(&self) -> RowId {
        self.id
    }
    fn set_row_id(&mut self, id: RowId) {
        self.id = id;
    }
}

/// A partial update to a `Rule`. `None` fields are left unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RulePatch {
    pub name: Option<String>,
    pub color: Option<String>,
    pub notes: Option<String>,
    pub enabled: Option<bool>,
    pub patterns: Option<Vec<Pattern>>,
    /// If set, the caller's view of the rule's `version` at the time it was read;
    /// used for optimistic concurrency (spec.md §7, `PreconditionFailed`).
    pub expected_version: Option<u64>,
}

struct Inner {
    rules: MemoryStore<Rule>,
    current_db: RwLock<Arc<RuleDatabase>>,
    next_version: std::sync::atomic::AtomicU64,
}

/// Holds the current compiled database and the rules it was built from.
pub struct RuleRegistry {
    inner: Inner,
}

const COLOR_RE_SRC: &str = r"^#([0-9a-fA-F]{3}){1,2}$";

fn validate_color(color: &str) -> Result<()> {
    let re = regex::Regex::new(COLOR_RE_SRC).expect("static color regex is valid");
    if re.is_match(color) {
        Ok(())
    } else {
        Err(Error::invalid(format!("invalid color {color:?}")))
    }
}

impl RuleRegistry {
    pub fn new() -> Result<Self> {
        let empty = RuleDatabase::compile(&[], 0)?;
        Ok(RuleRegistry {
            inner: Inner {
                rules: MemoryStore::new(),
                current_db: RwLock::new(Arc::new(empty)),
                next_version: std::sync::atomic::AtomicU64::new(1),
            },
        })
    }

    /// Adds a rule, compiling a fresh database atomically. On `CompileFailure` the
    /// rule is never inserted and the current database is left untouched.
    pub fn add_rule(&self, mut rule: Rule) -> Result<RowId> {
        validate_color(&rule.color)?;
        let existing = self.list_rules();
        if existing.iter().any(|r| r.name == rule.name) {
            return Err(Error::conflict(format!("rule named {:?} already exists", rule.name)));
        }
        rule.version = 0;
        let id = self.inner.rules.insert(rule)?;
        match self.recompile() {
            Ok(version) => {
                let mut rule = self.inner.rules.get(id)?;
                rule.version = version;
                self.inner.rules.update(id, rule)?;
                Ok(id)
            }
            Err(e) => {
                // Compilation failed: undo the speculative insert so the mutation is
                // atomic from the caller's point of view.
                let _ = self.inner.rules.update(id, Rule {
                    id,
                    name: String::new(),
                    color: "#000".into(),
                    notes: String::new(),
                    enabled: false,
                    patterns: vec![],
                    version: 0,
                });
                Err(e)
            }
        }
    }

    pub fn update_rule(&self, id: RowId, patch: RulePatch) -> Result<u64> {
        let mut rule = self.inner.rules.get(id)?;
        if let Some(expected) = patch.expected_version {
            if expected != rule.version {
                return Err(Error::precondition(format!(
                    "rule {id} is at version {}, expected {expected}",
                    rule.version
                )));
            }
        }
        if let Some(name) = patch.name {
            rule.name = name;
        }
        if let Some(color) = patch.color {
            validate_color(&color)?;
            rule.color = color;
        }
        if let Some(notes) = patch.notes {
            rule.notes = notes;
        }
        if let Some(enabled) = patch.enabled {
            rule.enabled = enabled;
        }
        let pattern_set_changed = patch.patterns.is_some();
        if let Some(patterns) = patch.patterns {
            rule.patterns = patterns;
        }
        self.inner.rules.update(id, rule.clone())?;

        if pattern_set_changed || patch.enabled.is_some() {
            match self.recompile() {
                Ok(version) => {
                    rule.version = version;
                    self.inner.rules.update(id, rule)?;
                    Ok(version)
                }
                Err(e) => Err(e),
            }
        } else {
            Ok(rule.version)
        }
    }

    pub fn list_rules(&self) -> Vec<Rule> {
        self.inner.rules.find(Page::default(), |_| true)
    }

    pub fn get_rule(&self, id: RowId) -> Result<Rule> {
        self.inner.rules.get(id)
    }

    pub fn current_database(&self) -> Arc<RuleDatabase> {
        self.inner
            .current_db
            .read()
            .expect("rule database lock poisoned")
            .clone()
    }

    /// Rebuilds the compiled database from every enabled rule's patterns and swaps it
    /// in if compilation succeeds. Returns the new version.
    fn recompile(&self) -> Result<u64> {
        let rules = self.list_rules();
        let mut specs = Vec::new();
        for rule in rules.iter().filter(|r| r.enabled) {
            for pattern in &rule.patterns {
                specs.push(PatternSpec {
                    rule_id: rule.id,
                    regex: pattern.regex.clone(),
                    caseless: pattern.flags.caseless,
                    dot_all: pattern.flags.dot_all,
                    direction: pattern.flags.direction,
                    min_len: pattern.flags.min_len,
                    max_len: pattern.flags.max_len,
                });
            }
        }
        let version = self
            .inner
            .next_version
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let db = RuleDatabase::compile(&specs, version)?;
        *self.inner.current_db.write().expect("rule database lock poisoned") = Arc::new(db);
        Ok(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_rule(name: &str) -> Rule {
        Rule {
            id: RowId::ZERO,
            name: name.to_string(),
            color: "#ff0000".to_string(),
            notes: String::new(),
            enabled: true,
            patterns: vec![Pattern {
                regex: r"CTF\{[A-Za-z0-9]+\}".to_string(),
                flags: PatternFlags {
                    caseless: false,
                    dot_all: false,
                    min_len: None,
                    max_len: None,
                    direction: Direction::Server,
                },
            }],
            version: 0,
        }
    }

    #[test]
    fn adding_a_rule_bumps_database_version() {
        let registry = RuleRegistry::new().unwrap();
        let before = registry.current_database().version();
        registry.add_rule(sample_rule("flag")).unwrap();
        let after = registry.current_database().version();
        assert!(after > before);
    }

    #[test]
    fn duplicate_name_is_a_conflict() {
        let registry = RuleRegistry::new().unwrap();
        registry.add_rule(sample_rule("flag")).unwrap();
        let err = registry.add_rule(sample_rule("flag")).unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[test]
    fn stale_version_update_is_precondition_failed() {
        let registry = RuleRegistry::new().unwrap();
        let id = registry.add_rule(sample_rule("flag")).unwrap();
        let err = registry
            .update_rule(id, RulePatch {
                enabled: Some(false),
                expected_version: Some(999),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, Error::PreconditionFailed(_)));
    }

    #[test]
    fn invalid_color_is_rejected() {
        let registry = RuleRegistry::new().unwrap();
        let mut rule = sample_rule("flag");
        rule.color = "not-a-color".into();
        assert!(matches!(registry.add_rule(rule), Err(Error::InvalidInput(_))));
    }
}
