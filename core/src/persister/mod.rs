//! The Stream Persister (spec.md §4.4): turns a terminated half-stream into
//! `ConnectionStream` documents, scanning the whole side for pattern matches and
//! filing each one under the first chunk document containing its start offset.

use crate::assembler::halfstream::HalfStream;
use crate::error::{Error, Result};
use crate::model::{ConnectionStream, PatternMatch};
use crate::rules::database::RuleDatabase;
use crate::scanner::Scanner;
use crate::store::{memory::MemoryStore, HasRowId, RowId, Store};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

/// Retry policy for store writes, per spec.md §7: a session is only marked failed
/// after every attempt is exhausted.
const MAX_WRITE_ATTEMPTS: u32 = 5;
const INITIAL_BACKOFF: Duration = Duration::from_millis(50);

pub struct Persister<'a> {
    streams: &'a MemoryStore<ConnectionStream>,
    max_chunk_bytes: usize,
}

/// One half-stream's persisted result: the ordered chunk ids it was split into, plus
/// the rule ids whose patterns matched anywhere in it.
pub struct PersistedHalf {
    pub stream_ids: Vec<RowId>,
    pub matched_rule_ids: Vec<RowId>,
    pub total_bytes: u64,
}

impl<'a> Persister<'a> {
    pub fn new(streams: &'a MemoryStore<ConnectionStream>, max_chunk_bytes: usize) -> Self {
        Persister { streams, max_chunk_bytes }
    }

    /// Splits `half` into chunks, scans the reassembled side against `db` (streaming
    /// across chunk boundaries), and writes the resulting `ConnectionStream`
    /// documents. Matches are kept in flow-global byte offsets and filed under the
    /// first chunk whose range contains the match's start, per spec.md §4.4 --
    /// regardless of which `Scanner::feed` call actually reported them, since a match
    /// straddling a chunk boundary is only decided once the next chunk's bytes arrive.
    ///
    /// `connection_id` is filled in once the Finalizer has allocated one (see
    /// `finalizer::Finalizer`): persisted streams carry `RowId::ZERO` as a placeholder
    /// until then, updated in place by `attach_connection`.
    pub fn persist_half(
        &self,
        half: HalfStream,
        from_client: bool,
        db: Arc<RuleDatabase>,
        shutdown: &AtomicBool,
    ) -> Result<PersistedHalf> {
        let total_bytes = half.total_bytes() as u64;
        let chunks = half.into_chunks(self.max_chunk_bytes);

        // Cumulative [start, end) range each chunk covers in the side's flow-global
        // byte offsets, computed before consuming `chunks` into documents below.
        let mut bounds = Vec::with_capacity(chunks.len());
        let mut cursor = 0usize;
        for chunk in &chunks {
            bounds.push((cursor, cursor + chunk.payload.len()));
            cursor += chunk.payload.len();
        }

        let mut scanner = Scanner::new(db.clone(), from_client);
        let mut all_matches = Vec::new();
        for chunk in &chunks {
            all_matches.extend(scanner.feed(&chunk.payload, shutdown)?);
        }

        let mut matches_by_chunk: Vec<Vec<PatternMatch>> = vec![Vec::new(); chunks.len()];
        let mut matched_rule_ids = Vec::new();
        for m in all_matches {
            let Some(rule_id) = db.owning_rule(m.pattern_id) else { continue };
            let owner = bounds
                .iter()
                .position(|(start, end)| m.start >= *start && m.start < *end)
                .unwrap_or(bounds.len().saturating_sub(1));
            matched_rule_ids.push(rule_id);
            matches_by_chunk[owner].push(PatternMatch {
                pattern_id: m.pattern_id,
                rule_id,
                start: m.start,
                end: m.end,
            });
        }

        let mut stream_ids = Vec::with_capacity(chunks.len());
        for (sequence, (chunk, pattern_matches)) in chunks.into_iter().zip(matches_by_chunk).enumerate() {
            let doc = ConnectionStream {
                id: RowId::ZERO,
                connection_id: RowId::ZERO,
                from_client,
                sequence: sequence as u32,
                blocks_indexes: chunk.blocks.iter().map(|b| b.start_offset).collect(),
                block_timestamps: chunk.blocks.iter().map(|b| b.timestamp).collect(),
                block_loss: chunk.blocks.iter().map(|b| b.loss).collect(),
                payload: chunk.payload,
                pattern_matches,
            };
            let id = insert_with_retry(self.streams, doc)?;
            stream_ids.push(id);
        }

        matched_rule_ids.sort();
        matched_rule_ids.dedup();

        Ok(PersistedHalf { stream_ids, matched_rule_ids, total_bytes })
    }

    /// Rewrites the `connection_id` of every chunk written by `persist_half` now that
    /// the Finalizer has allocated one.
    pub fn attach_connection(&self, stream_ids: &[RowId], connection_id: RowId) -> Result<()> {
        for &id in stream_ids {
            let mut doc = self.streams.get(id)?;
            doc.connection_id = connection_id;
            self.streams.update(id, doc)?;
        }
        Ok(())
    }
}

fn insert_with_retry<T>(store: &MemoryStore<T>, doc: T) -> Result<RowId>
where
    T: HasRowId + Clone + serde::Serialize + serde::de::DeserializeOwned,
{
    let mut backoff = INITIAL_BACKOFF;
    let mut last_err = None;
    for attempt in 0..MAX_WRITE_ATTEMPTS {
        match store.insert(doc.clone()) {
            Ok(id) => return Ok(id),
            Err(e @ Error::Transient(_)) => {
                log::warn!("store write attempt {attempt} failed: {e}, retrying in {backoff:?}");
                std::thread::sleep(backoff);
                backoff *= 2;
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err.unwrap_or_else(|| Error::transient("store write exhausted retries")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::halfstream::HalfStream;
    use crate::rules::database::PatternSpec;
    use crate::rules::pattern::Direction;
    use chrono::{DateTime, Duration as ChronoDuration, Utc};

    fn ts(ms: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(0, 0).unwrap() + ChronoDuration::milliseconds(ms)
    }

    fn flag_db() -> Arc<RuleDatabase> {
        let specs = vec![PatternSpec {
            rule_id: RowId(7),
            regex: r"CTF\{[A-Za-z0-9]+\}".to_string(),
            caseless: false,
            dot_all: false,
            direction: Direction::Server,
            min_len: None,
            max_len: None,
        }];
        Arc::new(RuleDatabase::compile(&specs, 1).unwrap())
    }

    #[test]
    fn persists_chunks_and_records_matches_in_flow_global_offsets() {
        let mut hs = HalfStream::new();
        hs.deliver(0, b"hello CTF{abc123} world", ts(0), ChronoDuration::milliseconds(100));
        let streams = MemoryStore::new();
        let persister = Persister::new(&streams, 1 << 20);
        let result = persister
            .persist_half(hs, false, flag_db(), &AtomicBool::new(false))
            .unwrap();
        assert_eq!(result.stream_ids.len(), 1);
        assert_eq!(result.matched_rule_ids, vec![RowId(7)]);
        let doc = streams.get(result.stream_ids[0]).unwrap();
        assert_eq!(doc.pattern_matches.len(), 1);
        let m = &doc.pattern_matches[0];
        assert_eq!(&doc.payload[m.start..m.end], b"CTF{abc123}");
    }

    #[test]
    fn match_spanning_a_chunk_boundary_is_filed_once_under_its_starting_chunk() {
        let mut hs = HalfStream::new();
        let mut payload = vec![b'a'; 60];
        payload.extend_from_slice(b"CTF{boundary}");
        payload.extend(vec![b'b'; 60]);
        hs.deliver(0, &payload, ts(0), ChronoDuration::milliseconds(100));
        let streams = MemoryStore::new();
        // Chunk boundary lands inside the flag itself.
        let persister = Persister::new(&streams, 70);
        let result = persister
            .persist_half(hs, false, flag_db(), &AtomicBool::new(false))
            .unwrap();
        assert_eq!(result.stream_ids.len(), 2);
        let first = streams.get(result.stream_ids[0]).unwrap();
        let second = streams.get(result.stream_ids[1]).unwrap();
        assert_eq!(first.pattern_matches.len(), 1);
        assert!(second.pattern_matches.is_empty());
        assert_eq!(first.pattern_matches[0].start, 60);
    }

    #[test]
    fn empty_half_stream_persists_no_chunks() {
        let streams = MemoryStore::new();
        let persister = Persister::new(&streams, 1 << 20);
        let result = persister
            .persist_half(HalfStream::new(), true, flag_db(), &AtomicBool::new(false))
            .unwrap();
        assert!(result.stream_ids.is_empty());
        assert_eq!(result.total_bytes, 0);
    }
}
