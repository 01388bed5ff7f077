//! Pattern and direction types that make up a `Rule`'s pattern set.

use serde::{Deserialize, Serialize};

/// Which side of a flow a pattern is allowed to match against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Client,
    Server,
    Both,
}

impl Direction {
    /// A pattern with this direction is evaluated against client->server bytes.
    pub fn matches_client(&self) -> bool {
        matches!(self, Direction::Client | Direction::Both)
    }

    /// A pattern with this direction is evaluated against server->client bytes.
    pub fn matches_server(&self) -> bool {
        matches!(self, Direction::Server | Direction::Both)
    }
}

/// Flags refining how a pattern's regex is compiled and where it applies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternFlags {
    #[serde(default)]
    pub caseless: bool,
    #[serde(default)]
    pub dot_all: bool,
    pub min_len: Option<usize>,
    pub max_len: Option<usize>,
    pub direction: Direction,
}

/// One byte-regex pattern within a `Rule`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pattern {
    /// The regex source, matched against raw bytes (not necessarily valid UTF-8).
    pub regex: String,
    pub flags: PatternFlags,
}
