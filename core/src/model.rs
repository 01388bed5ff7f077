//! The document types stored and served by caronte: `PcapSession`, `Connection`,
//! and `ConnectionStream` (spec.md §3).

use crate::assembler::flow::TerminationReason;
use crate::rules::database::PatternId;
use crate::store::{HasRowId, RowId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;

/// One ingested capture file or live-capture run (spec.md §3, §4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PcapSession {
    #[serde(default)]
    pub id: RowId,
    pub name: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub invalid_packets: u64,
    pub packets_per_service: std::collections::BTreeMap<u16, u64>,
    pub status: SessionStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Processing,
    Completed,
    Failed,
}

impl HasRowId for PcapSession {
    fn row_id(&self) -> RowId {
        self.id
    }
    fn set_row_id(&mut self, id: RowId) {
        self.id = id;
    }
}

/// A finalized TCP flow (spec.md §3, §4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    #[serde(default)]
    pub id: RowId,
    pub session_id: RowId,
    pub ip_src: IpAddr,
    pub port_src: u16,
    pub ip_dst: IpAddr,
    pub port_dst: u16,
    /// The listening side's port (spec.md §3, §4.3's `service_port` rule).
    pub service_port: u16,
    pub started_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
    pub termination_reason: StoredTerminationReason,
    pub client_bytes: u64,
    pub server_bytes: u64,
    pub client_stream_ids: Vec<RowId>,
    pub server_stream_ids: Vec<RowId>,
    pub matched_rule_ids: Vec<RowId>,
    pub rule_database_version: u64,
    #[serde(default)]
    pub marked: bool,
    #[serde(default)]
    pub hidden: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoredTerminationReason {
    Graceful,
    Idle,
    ForcedFlush,
}

impl From<TerminationReason> for StoredTerminationReason {
    fn from(r: TerminationReason) -> Self {
        match r {
            TerminationReason::Graceful => StoredTerminationReason::Graceful,
            TerminationReason::Idle => StoredTerminationReason::Idle,
            TerminationReason::ForcedFlush => StoredTerminationReason::ForcedFlush,
        }
    }
}

impl HasRowId for Connection {
    fn row_id(&self) -> RowId {
        self.id
    }
    fn set_row_id(&mut self, id: RowId) {
        self.id = id;
    }
}

/// One `MaxChunkBytes`-bounded piece of a half-stream (spec.md §3, §4.4). Invariant:
/// `blocks_indexes` is strictly increasing and `block_timestamps`/`block_loss` are the
/// same length; every `pattern_matches` entry's `(start, end)` falls within `payload`
/// and entries for a given `pattern_id` are sorted ascending by `start` and
/// non-overlapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionStream {
    #[serde(default)]
    pub id: RowId,
    pub connection_id: RowId,
    pub from_client: bool,
    /// Ordinal position of this chunk within its half-stream, starting at 0.
    pub sequence: u32,
    #[serde(with = "hex")]
    pub payload: Vec<u8>,
    pub blocks_indexes: Vec<usize>,
    pub block_timestamps: Vec<DateTime<Utc>>,
    pub block_loss: Vec<bool>,
    pub pattern_matches: Vec<PatternMatch>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternMatch {
    pub pattern_id: PatternId,
    pub rule_id: RowId,
    pub start: usize,
    pub end: usize,
}

impl HasRowId for ConnectionStream {
    fn row_id(&self) -> RowId {
        self.id
    }
    fn set_row_id(&mut self, id: RowId) {
        self.id = id;
    }
}

/// The operator config `POST /setup` writes, as the first (and only) row of the
/// `settings` collection (spec.md §6, §9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub id: RowId,
    pub server_address: String,
    pub flag_regex: Option<String>,
    pub auth_required: bool,
    pub accounts: BTreeMap<String, String>,
}

impl HasRowId for Settings {
    fn row_id(&self) -> RowId {
        self.id
    }
    fn set_row_id(&mut self, id: RowId) {
        self.id = id;
    }
}
