//! The compiled, immutable multi-pattern database a `RuleRegistry` produces.
//!
//! A `RuleDatabase` never mutates once built: a new mutation compiles a brand new
//! database and atomically swaps it in (see `RuleRegistry::current`). In-flight scans
//! hold an `Arc<RuleDatabase>` and keep working against their captured version even
//! after a newer one replaces it, per spec.md §5.

use super::pattern::Direction;
use crate::error::{Error, Result};
use crate::store::RowId;
use regex::bytes::{Regex, RegexSet};
use serde::{Deserialize, Serialize};

/// An internal identifier assigned to one compiled pattern within a `RuleDatabase`.
/// Stable only within that database's `version`; scan output is translated back to
/// `rule-id` via `RuleDatabase::owning_rule`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PatternId(pub u32);

struct CompiledPattern {
    id: PatternId,
    rule_id: RowId,
    direction: Direction,
    regex: Regex,
    min_len: Option<usize>,
    max_len: Option<usize>,
}

/// One direction-filtered sub-database: a `RegexSet` for fast "did anything match"
/// membership tests, paired with the individually compiled `Regex`es needed to recover
/// match spans (`RegexSet` alone reports only which patterns matched, not where).
struct SubDatabase {
    set: RegexSet,
    /// `set`-local index -> index into `CompiledPattern` storage.
    members: Vec<usize>,
}

impl SubDatabase {
    fn empty() -> Result<Self> {
        Ok(SubDatabase {
            set: RegexSet::new(std::iter::empty::<&str>())
                .map_err(|e| Error::internal(format!("empty regex set: {e}")))?,
            members: vec![],
        })
    }
}

/// An immutable compiled pattern database, tagged by a monotonically increasing
/// `version`. See spec.md §4.1.
pub struct RuleDatabase {
    version: u64,
    patterns: Vec<CompiledPattern>,
    client_db: SubDatabase,
    server_db: SubDatabase,
}

/// Everything the registry needs to know about one pattern when asked to (re)compile.
pub struct PatternSpec {
    pub rule_id: RowId,
    pub regex: String,
    pub caseless: bool,
    pub dot_all: bool,
    pub direction: Direction,
    pub min_len: Option<usize>,
    pub max_len: Option<usize>,
}

impl RuleDatabase {
    /// The database's version. Stamped on every persisted `pattern_matches` entry so
    /// re-scans against a newer version can be distinguished from stale matches.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Compiles a new database from `specs`. Fails atomically: on error, the caller's
    /// existing database is untouched (this function never mutates anything, it only
    /// builds a fresh one).
    pub fn compile(specs: &[PatternSpec], version: u64) -> Result<RuleDatabase> {
        let mut patterns = Vec::with_capacity(specs.len());
        let mut client_members = vec![];
        let mut client_sources = vec![];
        let mut server_members = vec![];
        let mut server_sources = vec![];

        for (idx, spec) in specs.iter().enumerate() {
            let source = build_regex_source(&spec.regex, spec.caseless, spec.dot_all);
            let regex = Regex::new(&source)
                .map_err(|e| Error::invalid(format!("invalid pattern regex {:?}: {e}", spec.regex)))?;
            let id = PatternId(idx as u32);
            if spec.direction.matches_client() {
                client_members.push(idx);
                client_sources.push(source.clone());
            }
            if spec.direction.matches_server() {
                server_members.push(idx);
                server_sources.push(source.clone());
            }
            patterns.push(CompiledPattern {
                id,
                rule_id: spec.rule_id,
                direction: spec.direction,
                regex,
                min_len: spec.min_len,
                max_len: spec.max_len,
            });
        }

        let client_db = if client_sources.is_empty() {
            SubDatabase::empty()?
        } else {
            SubDatabase {
                set: RegexSet::new(&client_sources)
                    .map_err(|e| Error::internal(format!("client regex set: {e}")))?,
                members: client_members,
            }
        };
        let server_db = if server_sources.is_empty() {
            SubDatabase::empty()?
        } else {
            SubDatabase {
                set: RegexSet::new(&server_sources)
                    .map_err(|e| Error::internal(format!("server regex set: {e}")))?,
                members: server_members,
            }
        };

        Ok(RuleDatabase {
            version,
            patterns,
            client_db,
            server_db,
        })
    }

    pub(crate) fn sub_database(&self, from_client: bool) -> &SubDatabase {
        if from_client {
            &self.client_db
        } else {
            &self.server_db
        }
    }

    pub(crate) fn regex_for(&self, pattern_idx: usize) -> &Regex {
        &self.patterns[pattern_idx].regex
    }

    pub(crate) fn pattern_id_for(&self, pattern_idx: usize) -> PatternId {
        self.patterns[pattern_idx].id
    }

    /// Whether a match of `len` bytes satisfies pattern `pattern_idx`'s length bounds.
    pub(crate) fn length_ok(&self, pattern_idx: usize, len: usize) -> bool {
        let p = &self.patterns[pattern_idx];
        p.min_len.map_or(true, |min| len >= min) && p.max_len.map_or(true, |max| len <= max)
    }

    /// The longest pattern source length among compiled patterns, used by the scanner
    /// to size its cross-chunk carry-over window.
    pub(crate) fn max_pattern_hint(&self) -> usize {
        self.patterns
            .iter()
            .map(|p| p.regex.as_str().len())
            .max()
            .unwrap_or(0)
    }

    /// Translates a `PatternId` back to the rule that owns it.
    pub fn owning_rule(&self, id: PatternId) -> Option<RowId> {
        self.patterns
            .iter()
            .find(|p| p.id == id)
            .map(|p| p.rule_id)
    }

    /// Directions configured for `id`, for tests and diagnostics.
    pub fn direction_of(&self, id: PatternId) -> Option<Direction> {
        self.patterns.iter().find(|p| p.id == id).map(|p| p.direction)
    }
}

impl SubDatabase {
    pub(crate) fn candidate_members(&self, haystack: &[u8]) -> impl Iterator<Item = usize> + '_ {
        self.set.matches(haystack).into_iter().map(move |local| self.members[local])
    }
}

fn build_regex_source(pattern: &str, caseless: bool, dot_all: bool) -> String {
    let mut flags = String::new();
    if caseless {
        flags.push('i');
    }
    if dot_all {
        flags.push('s');
    }
    if flags.is_empty() {
        pattern.to_string()
    } else {
        format!("(?{flags}){pattern}")
    }
}
