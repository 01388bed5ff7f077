//! The Stream Reader (spec.md §4.7): merges a connection's two persisted half-streams
//! back into one ordered, format-decoded, metadata-parsed payload sequence.

pub mod format;
pub mod metadata;

use crate::error::Result;
use crate::model::{Connection, ConnectionStream};
use crate::rules::database::PatternId;
use crate::store::{memory::MemoryStore, RowId, Store};
use chrono::{DateTime, Utc};
use metadata::Metadata;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};

/// Byte range of one pattern occurrence, rewritten to be relative to the Payload's
/// own block (spec.md §4.7), clamped to `[0, block_length]`.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct RegexMatchRange {
    pub pattern_id: PatternId,
    pub from: usize,
    pub to: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct Payload {
    pub from_client: bool,
    pub content: String,
    /// The block's start offset within its side's full reassembled stream.
    pub index: usize,
    pub timestamp: DateTime<Utc>,
    pub is_retransmitted: bool,
    pub regex_matches: Vec<RegexMatchRange>,
    pub metadata: Option<Metadata>,
    pub is_metadata_continuation: bool,
}

const DEFAULT_LIMIT: usize = 8024;

#[derive(Debug, Clone)]
pub struct Query {
    pub format: String,
    pub skip: usize,
    pub limit: usize,
}

impl Default for Query {
    fn default() -> Self {
        Query { format: "default".to_string(), skip: 0, limit: DEFAULT_LIMIT }
    }
}

impl Query {
    fn effective_limit(&self) -> usize {
        if self.limit == 0 {
            DEFAULT_LIMIT
        } else {
            self.limit
        }
    }
}

/// One reassembled block in merge order, before format decoding or metadata parsing.
struct FlatBlock {
    from_client: bool,
    global_start: usize,
    global_end: usize,
    timestamp: DateTime<Utc>,
    loss: bool,
    bytes: Vec<u8>,
    matches: Vec<(PatternId, usize, usize)>,
}

pub struct StreamReader<'a> {
    connections: &'a MemoryStore<Connection>,
    streams: &'a MemoryStore<ConnectionStream>,
}

impl<'a> StreamReader<'a> {
    pub fn new(connections: &'a MemoryStore<Connection>, streams: &'a MemoryStore<ConnectionStream>) -> Self {
        StreamReader { connections, streams }
    }

    /// `shutdown` is checked before every chunk document fetched from the store
    /// (spec.md §5's deadline contract): once it flips, no further chunks are read
    /// and whatever blocks were already gathered are paginated as usual, so a
    /// cancellation past `skip` yields the partial prefix read so far, and one before
    /// `skip` naturally yields nothing once `paginate` applies the skip threshold.
    pub fn get_connection_payload(
        &self,
        connection_id: RowId,
        query: Query,
        shutdown: &AtomicBool,
    ) -> Result<Vec<Payload>> {
        let connection = self.connections.get(connection_id)?;
        let client = self.flatten_side(&connection.client_stream_ids, true, shutdown)?;
        let server = self.flatten_side(&connection.server_stream_ids, false, shutdown)?;

        let merged = merge(client, server);
        let with_metadata = attach_metadata(merged);
        Ok(paginate(with_metadata, &query))
    }

    fn flatten_side(&self, stream_ids: &[RowId], from_client: bool, shutdown: &AtomicBool) -> Result<Vec<FlatBlock>> {
        let mut blocks = Vec::new();
        let mut doc_offset = 0usize;
        for &id in stream_ids {
            if shutdown.load(Ordering::Relaxed) {
                break;
            }
            let doc = self.streams.get(id)?;
            for (i, &start) in doc.blocks_indexes.iter().enumerate() {
                let end = doc.blocks_indexes.get(i + 1).copied().unwrap_or(doc.payload.len());
                let global_start = doc_offset + start;
                let global_end = doc_offset + end;
                let matches = doc
                    .pattern_matches
                    .iter()
                    .filter(|m| m.start < global_end && m.end > global_start)
                    .map(|m| (m.pattern_id, m.start.max(global_start), m.end.min(global_end)))
                    .collect();
                blocks.push(FlatBlock {
                    from_client,
                    global_start,
                    global_end,
                    timestamp: doc.block_timestamps[i],
                    loss: doc.block_loss[i],
                    bytes: doc.payload[start..end].to_vec(),
                    matches,
                });
            }
            doc_offset += doc.payload.len();
        }
        Ok(blocks)
    }
}

/// Walks both sides in lock-step by timestamp, client-before-server on ties
/// (spec.md §4.7, invariant 5).
fn merge(mut client: Vec<FlatBlock>, mut server: Vec<FlatBlock>) -> Vec<FlatBlock> {
    client.reverse();
    server.reverse();
    let mut out = Vec::with_capacity(client.len() + server.len());
    loop {
        match (client.last(), server.last()) {
            (Some(c), Some(s)) => {
                if c.timestamp <= s.timestamp {
                    out.push(client.pop().unwrap());
                } else {
                    out.push(server.pop().unwrap());
                }
            }
            (Some(_), None) => out.push(client.pop().unwrap()),
            (None, Some(_)) => out.push(server.pop().unwrap()),
            (None, None) => break,
        }
    }
    out
}

fn attach_metadata(blocks: Vec<FlatBlock>) -> Vec<(FlatBlock, Option<Metadata>, bool)> {
    let mut out = Vec::with_capacity(blocks.len());
    let mut i = 0;
    while i < blocks.len() {
        let side = blocks[i].from_client;
        let mut j = i;
        while j < blocks.len() && blocks[j].from_client == side {
            j += 1;
        }
        let run_bytes: Vec<u8> = blocks[i..j].iter().flat_map(|b| b.bytes.iter().copied()).collect();
        let parsed = metadata::parse(&run_bytes);
        for (k, idx) in (i..j).enumerate() {
            let block = &blocks[idx];
            if k == 0 {
                out.push((clone_block(block), parsed.clone(), false));
            } else {
                out.push((clone_block(block), None, true));
            }
        }
        i = j;
    }
    out
}

fn clone_block(b: &FlatBlock) -> FlatBlock {
    FlatBlock {
        from_client: b.from_client,
        global_start: b.global_start,
        global_end: b.global_end,
        timestamp: b.timestamp,
        loss: b.loss,
        bytes: b.bytes.clone(),
        matches: b.matches.clone(),
    }
}

fn paginate(entries: Vec<(FlatBlock, Option<Metadata>, bool)>, query: &Query) -> Vec<Payload> {
    let limit = query.effective_limit();
    let threshold = query.skip + limit;
    let mut out = Vec::new();
    let mut running = 0usize;

    for (block, metadata, is_metadata_continuation) in entries {
        let before = running;
        running += block.bytes.len();
        if before + block.bytes.len() <= query.skip {
            continue;
        }

        let block_len = block.bytes.len();
        let regex_matches = block
            .matches
            .iter()
            .map(|&(pattern_id, start, end)| RegexMatchRange {
                pattern_id,
                from: (start - block.global_start).min(block_len),
                to: (end - block.global_start).min(block_len),
            })
            .collect();

        out.push(Payload {
            from_client: block.from_client,
            content: format::decode(&query.format, &block.bytes),
            index: block.global_start,
            timestamp: block.timestamp,
            is_retransmitted: block.loss,
            regex_matches,
            metadata,
            is_metadata_continuation,
        });

        if running > threshold {
            break;
        }
    }
    out
}
