//! The Connection Finalizer (spec.md §4.5): turns a persisted pair of half-streams
//! into one `Connection` record.

use crate::assembler::TerminatedFlow;
use crate::error::Result;
use crate::model::{Connection, StoredTerminationReason};
use crate::persister::Persister;
use crate::rules::database::RuleDatabase;
use crate::store::{memory::MemoryStore, Page, RowId, Store};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

pub struct Finalizer<'a> {
    connections: &'a MemoryStore<Connection>,
}

impl<'a> Finalizer<'a> {
    pub fn new(connections: &'a MemoryStore<Connection>) -> Self {
        Finalizer { connections }
    }

    /// Persists both halves of `flow` via `persister`, then inserts the `Connection`
    /// aggregate row and back-fills its id into every chunk just written -- streams
    /// and matches land in the store before the connection record that references them
    /// (spec.md §4.4's ordering requirement).
    ///
    /// Idempotent per spec.md §4.5 invariant 7: a flow identity (session, 4-tuple,
    /// start/close timestamps) that's already been finalized is looked up and returned
    /// as-is rather than persisted a second time, so replaying a flow after a crash
    /// never produces a duplicate `Connection` row.
    pub fn finalize(
        &self,
        flow: TerminatedFlow,
        session_id: RowId,
        persister: &Persister,
        db: Arc<RuleDatabase>,
        shutdown: &AtomicBool,
    ) -> Result<RowId> {
        if let Some(existing) = self.find_existing(&flow, session_id) {
            return Ok(existing);
        }

        let client = persister.persist_half(flow.client_stream, true, db.clone(), shutdown)?;
        let server = persister.persist_half(flow.server_stream, false, db.clone(), shutdown)?;

        let mut matched_rule_ids = client.matched_rule_ids.clone();
        matched_rule_ids.extend(server.matched_rule_ids.iter().copied());
        matched_rule_ids.sort();
        matched_rule_ids.dedup();

        let connection = Connection {
            id: RowId::ZERO,
            session_id,
            ip_src: flow.client.0,
            port_src: flow.client.1,
            ip_dst: flow.server.0,
            port_dst: flow.server.1,
            service_port: flow.service_port,
            started_at: flow.started_at,
            closed_at: flow.closed_at,
            termination_reason: StoredTerminationReason::from(flow.reason),
            client_bytes: client.total_bytes,
            server_bytes: server.total_bytes,
            client_stream_ids: client.stream_ids.clone(),
            server_stream_ids: server.stream_ids.clone(),
            matched_rule_ids,
            rule_database_version: db.version(),
            marked: false,
            hidden: false,
        };
        let connection_id = self.connections.insert(connection)?;

        persister.attach_connection(&client.stream_ids, connection_id)?;
        persister.attach_connection(&server.stream_ids, connection_id)?;

        Ok(connection_id)
    }

    /// Looks up a previously finalized connection with the same identity as `flow`.
    /// The 4-tuple alone isn't unique across a capture (ports get reused), so the
    /// flow's start/close timestamps are part of the key too.
    fn find_existing(&self, flow: &TerminatedFlow, session_id: RowId) -> Option<RowId> {
        self.connections
            .find(Page::default(), |c| {
                c.session_id == session_id
                    && c.ip_src == flow.client.0
                    && c.port_src == flow.client.1
                    && c.ip_dst == flow.server.0
                    && c.port_dst == flow.server.1
                    && c.started_at == flow.started_at
                    && c.closed_at == flow.closed_at
            })
            .into_iter()
            .next()
            .map(|c| c.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::flow::TerminationReason;
    use crate::assembler::halfstream::HalfStream;
    use crate::model::ConnectionStream;
    use crate::rules::database::PatternSpec;
    use crate::rules::pattern::Direction;
    use chrono::{DateTime, Duration, Utc};
    use std::net::{IpAddr, Ipv4Addr};

    fn ts(ms: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(0, 0).unwrap() + Duration::milliseconds(ms)
    }

    fn empty_db() -> Arc<RuleDatabase> {
        Arc::new(RuleDatabase::compile(&[] as &[PatternSpec], 1).unwrap())
    }

    #[test]
    fn finalize_inserts_connection_and_backfills_stream_ids() {
        let mut client_stream = HalfStream::new();
        client_stream.deliver(0, b"GET / HTTP/1.1\r\n\r\n", ts(0), Duration::milliseconds(100));
        let mut server_stream = HalfStream::new();
        server_stream.deliver(0, b"HTTP/1.1 200 OK\r\n\r\n", ts(1), Duration::milliseconds(100));

        let flow = TerminatedFlow {
            client: (IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 1234),
            server: (IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), 80),
            service_port: 80,
            started_at: ts(0),
            closed_at: ts(5),
            reason: TerminationReason::Graceful,
            client_stream,
            server_stream,
        };

        let streams: MemoryStore<ConnectionStream> = MemoryStore::new();
        let connections: MemoryStore<Connection> = MemoryStore::new();
        let persister = Persister::new(&streams, 1 << 20);
        let finalizer = Finalizer::new(&connections);

        let connection_id = finalizer
            .finalize(flow, RowId(1), &persister, empty_db(), &AtomicBool::new(false))
            .unwrap();

        let connection = connections.get(connection_id).unwrap();
        assert_eq!(connection.client_bytes, 19);
        assert_eq!(connection.server_bytes, 20);
        for id in connection.client_stream_ids.iter().chain(connection.server_stream_ids.iter()) {
            assert_eq!(streams.get(*id).unwrap().connection_id, connection_id);
        }
    }

    fn sample_flow() -> TerminatedFlow {
        let mut client_stream = HalfStream::new();
        client_stream.deliver(0, b"GET / HTTP/1.1\r\n\r\n", ts(0), Duration::milliseconds(100));
        let mut server_stream = HalfStream::new();
        server_stream.deliver(0, b"HTTP/1.1 200 OK\r\n\r\n", ts(1), Duration::milliseconds(100));

        TerminatedFlow {
            client: (IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 1234),
            server: (IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), 80),
            service_port: 80,
            started_at: ts(0),
            closed_at: ts(5),
            reason: TerminationReason::Graceful,
            client_stream,
            server_stream,
        }
    }

    #[test]
    fn finalizing_the_same_flow_twice_is_a_no_op() {
        let streams: MemoryStore<ConnectionStream> = MemoryStore::new();
        let connections: MemoryStore<Connection> = MemoryStore::new();
        let persister = Persister::new(&streams, 1 << 20);
        let finalizer = Finalizer::new(&connections);

        let first_id = finalizer
            .finalize(sample_flow(), RowId(1), &persister, empty_db(), &AtomicBool::new(false))
            .unwrap();
        let second_id = finalizer
            .finalize(sample_flow(), RowId(1), &persister, empty_db(), &AtomicBool::new(false))
            .unwrap();

        assert_eq!(first_id, second_id);
        assert_eq!(connections.find(Page::default(), |_| true).len(), 1);
    }
}
