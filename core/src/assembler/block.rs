//! A `Block`: a contiguous run of bytes within a half-stream sharing one timestamp and
//! loss flag (spec.md glossary, §4.3).

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Block {
    /// Byte offset into the half-stream's buffer where this block begins.
    pub start_offset: usize,
    /// Capture time of the first packet that contributed bytes to this block.
    pub timestamp: DateTime<Utc>,
    /// True iff at least one packet contributing to this block retransmitted bytes
    /// already delivered for that sequence range.
    pub loss: bool,
}
