//! A single TCP flow: its 4-tuple identity and the pair of half-stream assemblers
//! that make it up (spec.md §4.3).

use super::halfstream::HalfStream;
use chrono::{DateTime, Utc};
use std::net::IpAddr;

/// The 4-tuple a packet is parsed into, from its own IP header's point of view (not
/// yet resolved to client/server).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourTuple {
    pub src_ip: IpAddr,
    pub src_port: u16,
    pub dst_ip: IpAddr,
    pub dst_port: u16,
}

/// A flow's identity independent of packet direction: the unordered pair of
/// endpoints. Used as the `FlowTable` key so both directions of traffic land on the
/// same `Flow`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    lo: (IpAddr, u16),
    hi: (IpAddr, u16),
}

impl FlowKey {
    pub fn from_tuple(t: &FourTuple) -> Self {
        let a = (t.src_ip, t.src_port);
        let b = (t.dst_ip, t.dst_port);
        if a <= b {
            FlowKey { lo: a, hi: b }
        } else {
            FlowKey { lo: b, hi: a }
        }
    }
}

/// Why a flow stopped accepting packets, per spec.md §4.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    Graceful,
    Idle,
    ForcedFlush,
}

pub struct Flow {
    pub client: (IpAddr, u16),
    pub server: (IpAddr, u16),
    pub started_at: DateTime<Utc>,
    pub last_packet_at: DateTime<Utc>,
    pub client_stream: HalfStream,
    pub server_stream: HalfStream,
    fin_client: bool,
    fin_server: bool,
    fin_client_acked: bool,
    fin_server_acked: bool,
    rst: bool,
}

/// Parsed per-packet facts the assembler needs to drive a flow's state machine.
pub struct Segment<'a> {
    pub tuple: FourTuple,
    pub seq: u32,
    pub syn: bool,
    pub fin: bool,
    pub ack: bool,
    pub rst: bool,
    pub timestamp: DateTime<Utc>,
    pub payload: &'a [u8],
}

impl Flow {
    pub fn new(first: &Segment) -> Self {
        Flow {
            client: (first.tuple.src_ip, first.tuple.src_port),
            server: (first.tuple.dst_ip, first.tuple.dst_port),
            started_at: first.timestamp,
            last_packet_at: first.timestamp,
            client_stream: HalfStream::new(),
            server_stream: HalfStream::new(),
            fin_client: false,
            fin_server: false,
            fin_client_acked: false,
            fin_server_acked: false,
            rst: false,
        }
    }

    /// The listening side's port: the destination port of the flow's first packet
    /// (the SYN's destination), per spec.md §4.3.
    pub fn service_port(&self) -> u16 {
        self.server.1
    }

    fn from_client(&self, tuple: &FourTuple) -> bool {
        (tuple.src_ip, tuple.src_port) == self.client
    }

    /// Feeds one segment into the flow, updating the appropriate half-stream and the
    /// FIN/RST state machine. Returns `Some(reason)` if the flow is now terminated.
    ///
    /// Graceful close requires a FIN observed *and ACKed* in both directions (spec.md
    /// §4.3): a bare FIN with the ACK flag unset doesn't close that side. A
    /// retransmitted FIN can flip a side from un-ACKed to ACKed, so the flag only ever
    /// moves from false to true, never back.
    pub fn ingest(&mut self, seg: &Segment, block_gap: chrono::Duration) -> Option<TerminationReason> {
        self.last_packet_at = seg.timestamp;
        let from_client = self.from_client(&seg.tuple);

        if from_client {
            self.client_stream.deliver(seg.seq, seg.payload, seg.timestamp, block_gap);
            if seg.fin {
                self.fin_client = true;
                self.fin_client_acked |= seg.ack;
            }
        } else {
            self.server_stream.deliver(seg.seq, seg.payload, seg.timestamp, block_gap);
            if seg.fin {
                self.fin_server = true;
                self.fin_server_acked |= seg.ack;
            }
        }
        self.rst |= seg.rst;

        if self.rst {
            return Some(TerminationReason::Graceful);
        }
        if self.fin_client && self.fin_server && self.fin_client_acked && self.fin_server_acked {
            return Some(TerminationReason::Graceful);
        }
        None
    }

    pub fn idle_since(&self, now: DateTime<Utc>, idle_timeout: chrono::Duration) -> bool {
        now.signed_duration_since(self.last_packet_at) > idle_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn addr(octet: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, octet))
    }

    #[test]
    fn flow_key_is_direction_independent() {
        let t1 = FourTuple { src_ip: addr(1), src_port: 1111, dst_ip: addr(2), dst_port: 80 };
        let t2 = FourTuple { src_ip: addr(2), src_port: 80, dst_ip: addr(1), dst_port: 1111 };
        assert_eq!(FlowKey::from_tuple(&t1), FlowKey::from_tuple(&t2));
    }

    #[test]
    fn fin_both_directions_terminates_gracefully() {
        let ts = DateTime::<Utc>::from_timestamp(0, 0).unwrap();
        let tuple = FourTuple { src_ip: addr(1), src_port: 1111, dst_ip: addr(2), dst_port: 80 };
        let first = Segment { tuple, seq: 0, syn: true, fin: false, ack: false, rst: false, timestamp: ts, payload: b"" };
        let mut flow = Flow::new(&first);
        assert_eq!(flow.service_port(), 80);

        let gap = chrono::Duration::milliseconds(100);
        let client_fin = Segment { tuple, seq: 0, syn: false, fin: true, ack: true, rst: false, timestamp: ts, payload: b"" };
        assert!(flow.ingest(&client_fin, gap).is_none());

        let server_tuple = FourTuple { src_ip: addr(2), src_port: 80, dst_ip: addr(1), dst_port: 1111 };
        let server_fin = Segment { tuple: server_tuple, seq: 0, syn: false, fin: true, ack: true, rst: false, timestamp: ts, payload: b"" };
        assert_eq!(flow.ingest(&server_fin, gap), Some(TerminationReason::Graceful));
    }

    #[test]
    fn fin_without_ack_does_not_terminate() {
        let ts = DateTime::<Utc>::from_timestamp(0, 0).unwrap();
        let tuple = FourTuple { src_ip: addr(1), src_port: 1111, dst_ip: addr(2), dst_port: 80 };
        let first = Segment { tuple, seq: 0, syn: true, fin: false, ack: false, rst: false, timestamp: ts, payload: b"" };
        let mut flow = Flow::new(&first);

        let gap = chrono::Duration::milliseconds(100);
        // Client's FIN arrives without the ACK flag set: fin_client is recorded but
        // not yet acked, so it alone can't complete a graceful close.
        let client_fin = Segment { tuple, seq: 0, syn: false, fin: true, ack: false, rst: false, timestamp: ts, payload: b"" };
        assert!(flow.ingest(&client_fin, gap).is_none());

        let server_tuple = FourTuple { src_ip: addr(2), src_port: 80, dst_ip: addr(1), dst_port: 1111 };
        let server_fin = Segment { tuple: server_tuple, seq: 0, syn: false, fin: true, ack: true, rst: false, timestamp: ts, payload: b"" };
        assert!(flow.ingest(&server_fin, gap).is_none());

        // A later, retransmitted client FIN that does carry ACK completes the close.
        let client_fin_acked = Segment { tuple, seq: 0, syn: false, fin: true, ack: true, rst: false, timestamp: ts, payload: b"" };
        assert_eq!(flow.ingest(&client_fin_acked, gap), Some(TerminationReason::Graceful));
    }
}
