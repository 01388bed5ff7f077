//! Background re-scan queue (spec.md §9): when the rule database changes, previously
//! persisted connections need re-scanning against the new patterns without blocking
//! ingestion. Jobs are `(connection_id, target_version)` pairs, deduplicated so a
//! connection hit by several rule updates in a row only gets scanned once against the
//! latest version.

use crate::error::Result;
use crate::model::{Connection, ConnectionStream, PatternMatch};
use crate::rules::database::RuleDatabase;
use crate::scanner::Scanner;
use crate::store::{memory::MemoryStore, Page, RowId, Store};
use crossbeam_channel::{Receiver, Sender};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

#[derive(Debug, Clone, Copy)]
pub struct RescanJob {
    pub connection_id: RowId,
    pub target_version: u64,
}

/// The sending half handed to whoever observes rule-database changes (the server's
/// rule-update route handler).
#[derive(Clone)]
pub struct RescanQueue {
    tx: Sender<RescanJob>,
}

impl RescanQueue {
    pub fn enqueue(&self, job: RescanJob) {
        // An unbounded channel: a slow worker can never block rule updates, and a full
        // re-scan is always safe to skip-and-retry-later if the process restarts
        // before draining it (the job is recomputed idempotently from stored state).
        let _ = self.tx.send(job);
    }
}

/// Runs re-scan jobs against the current store, one at a time, on the calling thread.
/// Callers typically spawn this in its own `std::thread` for the process lifetime.
pub struct RescanWorker {
    rx: Receiver<RescanJob>,
    connections: Arc<MemoryStore<Connection>>,
    streams: Arc<MemoryStore<ConnectionStream>>,
}

pub fn channel(
    connections: Arc<MemoryStore<Connection>>,
    streams: Arc<MemoryStore<ConnectionStream>>,
) -> (RescanQueue, RescanWorker) {
    let (tx, rx) = crossbeam_channel::unbounded();
    (RescanQueue { tx }, RescanWorker { rx, connections, streams })
}

impl RescanWorker {
    /// Blocks, processing jobs until the queue's sender is dropped.
    pub fn run(&self, db: impl Fn() -> Arc<RuleDatabase>) {
        for job in self.rx.iter() {
            if let Err(e) = self.process(job, db()) {
                log::warn!("rescan of connection {} failed: {e}", job.connection_id);
            }
        }
    }

    /// Processes one job synchronously; exposed separately from `run` so tests (and a
    /// single-shot "drain the queue now" admin action) can call it without spawning a
    /// thread.
    pub fn process(&self, job: RescanJob, db: Arc<RuleDatabase>) -> Result<()> {
        if db.version() < job.target_version {
            // A newer job for this connection is presumably already queued or on its
            // way; nothing to do yet against this (stale) database handle.
            return Ok(());
        }

        let mut connection = self.connections.get(job.connection_id)?;
        if connection.rule_database_version >= job.target_version {
            return Ok(());
        }

        let shutdown = AtomicBool::new(false);
        let mut matched_rule_ids = Vec::new();
        rescan_side(&self.streams, &connection.client_stream_ids, true, &db, &shutdown, &mut matched_rule_ids)?;
        rescan_side(&self.streams, &connection.server_stream_ids, false, &db, &shutdown, &mut matched_rule_ids)?;

        matched_rule_ids.sort();
        matched_rule_ids.dedup();
        connection.matched_rule_ids = matched_rule_ids;
        connection.rule_database_version = db.version();
        self.connections.update(job.connection_id, connection)?;
        Ok(())
    }
}

/// Mirrors `persister::Persister::persist_half`'s filing rule: a match is assigned to
/// whichever document's byte range contains its *start* offset, not whichever feed
/// call happened to report it, since a match straddling a chunk boundary is only
/// decided once the next chunk's bytes arrive (spec.md §4.4).
fn rescan_side(
    streams: &MemoryStore<ConnectionStream>,
    stream_ids: &[RowId],
    from_client: bool,
    db: &Arc<RuleDatabase>,
    shutdown: &AtomicBool,
    matched_rule_ids: &mut Vec<RowId>,
) -> Result<()> {
    let mut docs = Vec::with_capacity(stream_ids.len());
    for &id in stream_ids {
        docs.push(streams.get(id)?);
    }

    let mut bounds = Vec::with_capacity(docs.len());
    let mut cursor = 0usize;
    for doc in &docs {
        bounds.push((cursor, cursor + doc.payload.len()));
        cursor += doc.payload.len();
    }

    let mut scanner = Scanner::new(db.clone(), from_client);
    let mut all_matches = Vec::new();
    for doc in &docs {
        all_matches.extend(scanner.feed(&doc.payload, shutdown)?);
    }

    let mut matches_by_doc: Vec<Vec<PatternMatch>> = vec![Vec::new(); docs.len()];
    for m in all_matches {
        let Some(rule_id) = db.owning_rule(m.pattern_id) else { continue };
        let owner = bounds
            .iter()
            .position(|(start, end)| m.start >= *start && m.start < *end)
            .unwrap_or(bounds.len().saturating_sub(1));
        matched_rule_ids.push(rule_id);
        matches_by_doc[owner].push(PatternMatch { pattern_id: m.pattern_id, rule_id, start: m.start, end: m.end });
    }

    for (idx, (id, mut doc)) in stream_ids.iter().zip(docs).enumerate() {
        doc.pattern_matches = std::mem::take(&mut matches_by_doc[idx]);
        streams.update(*id, doc)?;
    }
    Ok(())
}

/// Enumerates every connection still on an older rule-database version, for a startup
/// sweep or an admin-triggered "rescan everything" action.
pub fn stale_connections(connections: &MemoryStore<Connection>, current_version: u64) -> Vec<RowId> {
    connections
        .find(Page::default(), |c| c.rule_database_version < current_version)
        .into_iter()
        .map(|c| c.id)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::database::PatternSpec;
    use crate::rules::pattern::Direction;
    use crate::model::StoredTerminationReason;
    use chrono::Utc;
    use std::net::{IpAddr, Ipv4Addr};

    fn db_with_flag(version: u64) -> Arc<RuleDatabase> {
        let specs = vec![PatternSpec {
            rule_id: RowId(1),
            regex: r"CTF\{[A-Za-z0-9]+\}".to_string(),
            caseless: false,
            dot_all: false,
            direction: Direction::Server,
            min_len: None,
            max_len: None,
        }];
        Arc::new(RuleDatabase::compile(&specs, version).unwrap())
    }

    #[test]
    fn rescan_picks_up_matches_from_a_newer_database() {
        let connections: Arc<MemoryStore<Connection>> = Arc::new(MemoryStore::new());
        let streams: Arc<MemoryStore<ConnectionStream>> = Arc::new(MemoryStore::new());

        let stream_id = streams
            .insert(ConnectionStream {
                id: RowId::ZERO,
                connection_id: RowId::ZERO,
                from_client: false,
                sequence: 0,
                payload: b"CTF{newly_added}".to_vec(),
                blocks_indexes: vec![0],
                block_timestamps: vec![Utc::now()],
                block_loss: vec![false],
                pattern_matches: vec![],
            })
            .unwrap();

        let connection_id = connections
            .insert(Connection {
                id: RowId::ZERO,
                session_id: RowId(1),
                ip_src: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
                port_src: 1234,
                ip_dst: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
                port_dst: 80,
                service_port: 80,
                started_at: Utc::now(),
                closed_at: Utc::now(),
                termination_reason: StoredTerminationReason::Graceful,
                client_bytes: 0,
                server_bytes: 17,
                client_stream_ids: vec![],
                server_stream_ids: vec![stream_id],
                matched_rule_ids: vec![],
                rule_database_version: 1,
                marked: false,
                hidden: false,
            })
            .unwrap();

        let (_queue, worker) = channel(connections.clone(), streams.clone());
        worker
            .process(RescanJob { connection_id, target_version: 2 }, db_with_flag(2))
            .unwrap();

        let updated = connections.get(connection_id).unwrap();
        assert_eq!(updated.matched_rule_ids, vec![RowId(1)]);
        assert_eq!(updated.rule_database_version, 2);
    }

    #[test]
    fn rescan_files_a_boundary_spanning_match_under_its_starting_chunk() {
        let connections: Arc<MemoryStore<Connection>> = Arc::new(MemoryStore::new());
        let streams: Arc<MemoryStore<ConnectionStream>> = Arc::new(MemoryStore::new());

        let mut payload = vec![b'a'; 60];
        payload.extend_from_slice(b"CTF{boundary}");
        payload.extend(vec![b'b'; 60]);
        let (first_payload, second_payload) = payload.split_at(70);

        let first_id = streams
            .insert(ConnectionStream {
                id: RowId::ZERO,
                connection_id: RowId::ZERO,
                from_client: false,
                sequence: 0,
                payload: first_payload.to_vec(),
                blocks_indexes: vec![0],
                block_timestamps: vec![Utc::now()],
                block_loss: vec![false],
                pattern_matches: vec![],
            })
            .unwrap();
        let second_id = streams
            .insert(ConnectionStream {
                id: RowId::ZERO,
                connection_id: RowId::ZERO,
                from_client: false,
                sequence: 1,
                payload: second_payload.to_vec(),
                blocks_indexes: vec![0],
                block_timestamps: vec![Utc::now()],
                block_loss: vec![false],
                pattern_matches: vec![],
            })
            .unwrap();

        let connection_id = connections
            .insert(Connection {
                id: RowId::ZERO,
                session_id: RowId(1),
                ip_src: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
                port_src: 1234,
                ip_dst: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
                port_dst: 80,
                service_port: 80,
                started_at: Utc::now(),
                closed_at: Utc::now(),
                termination_reason: StoredTerminationReason::Graceful,
                client_bytes: 0,
                server_bytes: payload.len() as u64,
                client_stream_ids: vec![],
                server_stream_ids: vec![first_id, second_id],
                matched_rule_ids: vec![],
                rule_database_version: 1,
                marked: false,
                hidden: false,
            })
            .unwrap();

        let (_queue, worker) = channel(connections.clone(), streams.clone());
        worker
            .process(RescanJob { connection_id, target_version: 2 }, db_with_flag(2))
            .unwrap();

        let first = streams.get(first_id).unwrap();
        let second = streams.get(second_id).unwrap();
        assert_eq!(first.pattern_matches.len(), 1);
        assert!(second.pattern_matches.is_empty());
        assert_eq!(first.pattern_matches[0].start, 60);

        let updated = connections.get(connection_id).unwrap();
        assert_eq!(updated.matched_rule_ids, vec![RowId(1)]);
    }
}
