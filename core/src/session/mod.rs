//! The PCAP Session Manager (spec.md §4.6): accepts uploaded or on-disk capture
//! files, feeds them through the `Assembler`, and hands every terminated flow off to
//! the Persister/Finalizer pair on a dedicated worker thread so a slow store write
//! never stalls packet ingestion.

use crate::assembler::{Assembler, AssemblerConfig, PacketOutcome, TerminatedFlow};
use crate::error::{Error, Result};
use crate::finalizer::Finalizer;
use crate::model::{Connection, ConnectionStream, PcapSession, SessionStatus};
use crate::persister::Persister;
use crate::rules::RuleRegistry;
use crate::store::{memory::MemoryStore, HasRowId, Page, RowId, Store};
use chrono::{DateTime, Utc};
use crossbeam_channel::bounded;
use pcap_file::pcap::PcapReader;
use pcap_file::pcapng::{Block, PcapNgReader};
use std::collections::BTreeMap;
use std::io::Cursor;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration as StdDuration;

const PCAP_MAGIC_LE: [u8; 4] = [0xd4, 0xc3, 0xb2, 0xa1];
const PCAP_MAGIC_BE: [u8; 4] = [0xa1, 0xb2, 0xc3, 0xd4];
const PCAP_NS_MAGIC_LE: [u8; 4] = [0x4d, 0x3c, 0xb2, 0xa1];
const PCAP_NS_MAGIC_BE: [u8; 4] = [0xa1, 0xb2, 0x3c, 0x4d];
const PCAPNG_MAGIC: [u8; 4] = [0x0a, 0x0d, 0x0d, 0x0a];

enum CaptureFormat {
    Pcap,
    PcapNg,
}

fn detect_format(bytes: &[u8]) -> Result<CaptureFormat> {
    let head: [u8; 4] = bytes
        .get(0..4)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| Error::invalid("capture file too short to contain a magic number"))?;
    match head {
        PCAP_MAGIC_LE | PCAP_MAGIC_BE | PCAP_NS_MAGIC_LE | PCAP_NS_MAGIC_BE => Ok(CaptureFormat::Pcap),
        PCAPNG_MAGIC => Ok(CaptureFormat::PcapNg),
        _ => Err(Error::invalid("not a recognized pcap or pcapng file")),
    }
}

pub struct SessionManager {
    sessions: MemoryStore<PcapSession>,
    connections: Arc<MemoryStore<Connection>>,
    streams: Arc<MemoryStore<ConnectionStream>>,
    rules: Arc<RuleRegistry>,
    config: AssemblerConfig,
    max_chunk_bytes: usize,
    /// Flipped by the process's Ctrl+C handler; in-flight scans see it on their next
    /// chunk and abort with `Error::Transient` instead of running to completion
    /// (spec.md §7's "scan aborted by shutdown").
    shutdown: Arc<AtomicBool>,
}

impl SessionManager {
    pub fn new(
        connections: Arc<MemoryStore<Connection>>,
        streams: Arc<MemoryStore<ConnectionStream>>,
        rules: Arc<RuleRegistry>,
        config: AssemblerConfig,
        max_chunk_bytes: usize,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        SessionManager {
            sessions: MemoryStore::new(),
            connections,
            streams,
            rules,
            config,
            max_chunk_bytes,
            shutdown,
        }
    }

    pub fn list_sessions(&self, page: Page) -> Vec<PcapSession> {
        self.sessions.find(page, |_| true)
    }

    pub fn get_session(&self, id: RowId) -> Result<PcapSession> {
        self.sessions.get(id)
    }

    /// Ingests `bytes` as a whole capture file named `name`. Blocks until every packet
    /// has been fed to the assembler and every flow it produced has been persisted;
    /// the packet feed and the persistence writes still run on separate threads so a
    /// slow store never backs up the parse loop mid-file.
    ///
    /// `flush_all` controls whether flows still open when the file ends are finalized
    /// (spec.md §8 scenario S6): `true` finalizes them with `TerminationReason::ForcedFlush`;
    /// `false` drops them unfinalized. A capture file is ingested in one shot, so there is
    /// no live flow table to retain them in across calls the way a continuously-running
    /// capture would.
    pub fn ingest_capture(&self, name: String, bytes: Vec<u8>, flush_all: bool) -> Result<RowId> {
        let format = detect_format(&bytes)?;

        let session = PcapSession {
            id: RowId::ZERO,
            name,
            started_at: Utc::now(),
            completed_at: None,
            invalid_packets: 0,
            packets_per_service: BTreeMap::new(),
            status: SessionStatus::Processing,
        };
        let session_id = self.sessions.insert(session)?;

        let assembler = Assembler::new(self.config);
        let (tx, rx) = bounded::<TerminatedFlow>(256);
        let connections = self.connections.clone();
        let streams = self.streams.clone();
        let rules = self.rules.clone();
        let max_chunk_bytes = self.max_chunk_bytes;
        let shutdown = self.shutdown.clone();

        let worker = std::thread::spawn(move || -> Result<()> {
            let persister = Persister::new(&streams, max_chunk_bytes);
            let finalizer = Finalizer::new(&connections);
            for flow in rx.iter() {
                let db = rules.current_database();
                finalizer.finalize(flow, session_id, &persister, db, &shutdown)?;
            }
            Ok(())
        });

        let feed_result = self.feed_packets(&assembler, &bytes, format, &tx);

        if flush_all {
            for flow in assembler.flush_all() {
                // The receiver may already be gone if the worker died; a closed channel
                // here just means those flows won't be persisted, which is reported via
                // the session's Failed status below.
                let _ = tx.send(flow);
            }
        }
        drop(tx);

        let worker_result = worker
            .join()
            .unwrap_or_else(|_| Err(Error::internal("persistence worker panicked")));

        let mut session = self.sessions.get(session_id)?;
        session.completed_at = Some(Utc::now());
        match (&feed_result, &worker_result) {
            (Ok((invalid, per_service)), Ok(())) => {
                session.invalid_packets = *invalid;
                session.packets_per_service = per_service.clone();
                session.status = SessionStatus::Completed;
            }
            (Ok((invalid, per_service)), Err(_)) => {
                session.invalid_packets = *invalid;
                session.packets_per_service = per_service.clone();
                session.status = SessionStatus::Failed;
            }
            (Err(_), _) => {
                session.status = SessionStatus::Failed;
            }
        }
        self.sessions.update(session_id, session)?;

        feed_result?;
        worker_result?;
        Ok(session_id)
    }

    fn feed_packets(
        &self,
        assembler: &Assembler,
        bytes: &[u8],
        format: CaptureFormat,
        tx: &crossbeam_channel::Sender<TerminatedFlow>,
    ) -> Result<(u64, BTreeMap<u16, u64>)> {
        let mut invalid_packets = 0u64;
        let mut packets_per_service: BTreeMap<u16, u64> = BTreeMap::new();
        let mut apply = |data: &[u8], timestamp: DateTime<Utc>| {
            match assembler.ingest_frame(data, timestamp) {
                PacketOutcome::Accepted { service_port, terminated } => {
                    *packets_per_service.entry(service_port).or_insert(0) += 1;
                    if let Some(flow) = terminated {
                        let _ = tx.send(flow);
                    }
                }
                PacketOutcome::Invalid => invalid_packets += 1,
            }
        };

        match format {
            CaptureFormat::Pcap => {
                let mut reader = PcapReader::new(Cursor::new(bytes))
                    .map_err(|e| Error::invalid(format!("malformed pcap file: {e}")))?;
                while let Some(pkt) = reader.next_packet() {
                    let pkt = pkt.map_err(|e| Error::invalid(format!("malformed pcap packet: {e}")))?;
                    let ts = duration_to_datetime(pkt.timestamp);
                    apply(&pkt.data, ts);
                }
            }
            CaptureFormat::PcapNg => {
                let mut reader = PcapNgReader::new(Cursor::new(bytes))
                    .map_err(|e| Error::invalid(format!("malformed pcapng file: {e}")))?;
                while let Some(block) = reader.next_block() {
                    let block = block.map_err(|e| Error::invalid(format!("malformed pcapng block: {e}")))?;
                    if let Block::EnhancedPacket(epb) = block {
                        let ts = duration_to_datetime(epb.timestamp);
                        apply(&epb.data, ts);
                    }
                }
            }
        }

        Ok((invalid_packets, packets_per_service))
    }
}

fn duration_to_datetime(d: StdDuration) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(d.as_secs() as i64, d.subsec_nanos())
        .unwrap_or_else(Utc::now)
}
