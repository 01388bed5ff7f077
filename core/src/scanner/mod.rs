//! The streaming multi-pattern byte-regex engine (spec.md §4.2).
//!
//! A `Scanner` is fed a side's bytes in arbitrary-sized chunks and reports every
//! pattern occurrence with offsets relative to the start of the whole scan, including
//! matches that straddle a chunk boundary. Memory use is bounded by the rule
//! database's size plus a carry-over window sized to the longest compiled pattern, not
//! by the total input length.

use crate::rules::database::{PatternId, RuleDatabase};
use crate::error::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// One reported occurrence: the owning pattern and its `[start, end)` byte range in
/// the scan's global coordinate space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Match {
    pub pattern_id: PatternId,
    pub start: usize,
    pub end: usize,
}

/// Lower bound on the cross-chunk carry window, so tiny rule sets still tolerate
/// reasonably-sized patterns split across small reads.
const MIN_WINDOW: usize = 256;

pub struct Scanner {
    db: Arc<RuleDatabase>,
    from_client: bool,
    carry: Vec<u8>,
    base_offset: usize,
    window: usize,
}

impl Scanner {
    pub fn new(db: Arc<RuleDatabase>, from_client: bool) -> Self {
        let window = (db.max_pattern_hint() * 4).max(MIN_WINDOW);
        Scanner {
            db,
            from_client,
            carry: Vec::new(),
            base_offset: 0,
            window,
        }
    }

    /// Feeds the next chunk of the side's bytes, appended immediately after whatever
    /// was fed previously. Returns every match newly discovered in this chunk,
    /// including ones that started in a prior chunk but only became decidable once
    /// more bytes arrived.
    pub fn feed(&mut self, chunk: &[u8], shutdown: &AtomicBool) -> Result<Vec<Match>> {
        if shutdown.load(Ordering::Relaxed) {
            return Err(Error::transient("scan aborted by shutdown"));
        }
        if self.db.is_empty() || chunk.is_empty() {
            self.absorb(chunk);
            return Ok(vec![]);
        }

        let carry_len = self.carry.len();
        let mut combined = std::mem::take(&mut self.carry);
        combined.extend_from_slice(chunk);

        let sub = self.db.sub_database(self.from_client);
        let mut matches = Vec::new();
        for idx in sub.candidate_members(&combined) {
            let re = self.db.regex_for(idx);
            for m in re.find_iter(&combined) {
                if m.end() > carry_len && self.db.length_ok(idx, m.end() - m.start()) {
                    matches.push(Match {
                        pattern_id: self.db.pattern_id_for(idx),
                        start: self.base_offset + m.start(),
                        end: self.base_offset + m.end(),
                    });
                }
            }
        }
        matches.sort_by_key(|m| (m.start, m.end));

        let keep = combined.len().min(self.window);
        self.base_offset += combined.len() - keep;
        self.carry = combined[combined.len() - keep..].to_vec();

        Ok(matches)
    }

    fn absorb(&mut self, chunk: &[u8]) {
        self.carry.extend_from_slice(chunk);
        let keep = self.carry.len().min(self.window);
        let drop = self.carry.len() - keep;
        self.base_offset += drop;
        self.carry.drain(0..drop);
    }

    /// Convenience for callers with the whole side's bytes in hand already (tests,
    /// and non-huge flows where chunking would add no value).
    pub fn scan_all(db: Arc<RuleDatabase>, from_client: bool, bytes: &[u8]) -> Result<Vec<Match>> {
        let mut scanner = Scanner::new(db, from_client);
        scanner.feed(bytes, &AtomicBool::new(false))
    }
}
