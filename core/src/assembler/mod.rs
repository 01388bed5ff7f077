//! The TCP Assembler (spec.md §4.3): turns raw packets into per-flow, per-direction
//! byte streams with block metadata.

pub mod block;
pub mod flow;
pub mod halfstream;
pub mod table;

use chrono::{DateTime, Duration, Utc};
use flow::{FlowKey, FourTuple, Segment, TerminationReason};
use pnet::packet::ethernet::{EtherTypes, EthernetPacket};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::ipv6::Ipv6Packet;
use pnet::packet::tcp::{TcpFlags, TcpPacket};
use pnet::packet::Packet as PnetPacket;
use std::net::IpAddr;
use table::FlowTable;

/// Tunables the assembler needs from `Config` (spec.md §9).
#[derive(Debug, Clone, Copy)]
pub struct AssemblerConfig {
    pub block_gap: Duration,
    pub idle_flow: Duration,
}

/// A flow that has reached a terminal state and is ready for the Persister.
pub struct TerminatedFlow {
    pub client: (IpAddr, u16),
    pub server: (IpAddr, u16),
    pub service_port: u16,
    pub started_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
    pub reason: TerminationReason,
    pub client_stream: halfstream::HalfStream,
    pub server_stream: halfstream::HalfStream,
}

/// Outcome of handing one packet to the assembler.
pub enum PacketOutcome {
    /// Accepted and applied to a flow. Carries the flow's destination service port so
    /// callers can maintain `packets_per_service` (spec.md §4.6).
    Accepted { service_port: u16, terminated: Option<TerminatedFlow> },
    /// Not IP/TCP, truncated, or otherwise unparseable. Counted as `invalid_packets`.
    Invalid,
}

pub struct Assembler {
    table: FlowTable,
    config: AssemblerConfig,
}

impl Assembler {
    pub fn new(config: AssemblerConfig) -> Self {
        Assembler { table: FlowTable::new(), config }
    }

    /// Parses `frame` (an Ethernet frame as captured) and applies it to the
    /// appropriate flow. Never propagates per-packet parse errors: malformed input
    /// increments the caller's `invalid_packets` counter via `PacketOutcome::Invalid`
    /// instead (spec.md §7).
    pub fn ingest_frame(&self, frame: &[u8], timestamp: DateTime<Utc>) -> PacketOutcome {
        match parse_segment(frame, timestamp) {
            Some(seg) => self.ingest_segment(&seg),
            None => PacketOutcome::Invalid,
        }
    }

    fn ingest_segment(&self, seg: &Segment) -> PacketOutcome {
        let key = FlowKey::from_tuple(&seg.tuple);
        let block_gap = self.config.block_gap;
        let tuple = seg.tuple;

        let (service_port, reason) = self.table.with_flow(
            key,
            || flow::Flow::new(seg),
            |f| (f.service_port(), f.ingest(seg, block_gap)),
        );
        let _ = tuple;

        let terminated = reason.and_then(|reason| {
            self.table.remove(&key).map(|flow| finalize(flow, reason))
        });

        PacketOutcome::Accepted { service_port, terminated }
    }

    /// Forces every currently open flow closed, per a session's `flush_all=true` or
    /// process shutdown (spec.md §4.6, §5).
    pub fn flush_all(&self) -> Vec<TerminatedFlow> {
        self.table
            .drain_all()
            .into_iter()
            .map(|(_, flow)| finalize(flow, TerminationReason::ForcedFlush))
            .collect()
    }

    /// Closes every flow idle longer than the configured `idle_flow` timeout.
    pub fn reap_idle(&self, now: DateTime<Utc>) -> Vec<TerminatedFlow> {
        self.table
            .drain_idle(now, self.config.idle_flow)
            .into_iter()
            .map(|(_, flow)| finalize(flow, TerminationReason::Idle))
            .collect()
    }
}

fn finalize(flow: flow::Flow, reason: TerminationReason) -> TerminatedFlow {
    TerminatedFlow {
        client: flow.client,
        server: flow.server,
        service_port: flow.service_port(),
        started_at: flow.started_at,
        closed_at: flow.last_packet_at,
        reason,
        client_stream: flow.client_stream,
        server_stream: flow.server_stream,
    }
}

/// Parses an Ethernet frame down to a TCP `Segment`. Returns `None` for anything that
/// isn't a well-formed IPv4/IPv6-over-TCP packet (UDP, ARP, truncated frames, etc. are
/// all simply not this assembler's concern and are reported as invalid upstream).
fn parse_segment<'a>(frame: &'a [u8], timestamp: DateTime<Utc>) -> Option<Segment<'a>> {
    let eth = EthernetPacket::new(frame)?;
    match eth.get_ethertype() {
        EtherTypes::Ipv4 => parse_ipv4(eth.payload(), timestamp),
        EtherTypes::Ipv6 => parse_ipv6(eth.payload(), timestamp),
        _ => None,
    }
}

fn parse_ipv4(data: &[u8], timestamp: DateTime<Utc>) -> Option<Segment> {
    let ipv4 = Ipv4Packet::new(data)?;
    if ipv4.get_next_level_protocol() != IpNextHeaderProtocols::Tcp {
        return None;
    }
    let src_ip = IpAddr::V4(ipv4.get_source());
    let dst_ip = IpAddr::V4(ipv4.get_destination());
    parse_tcp(ipv4.payload(), src_ip, dst_ip, timestamp)
}

fn parse_ipv6(data: &[u8], timestamp: DateTime<Utc>) -> Option<Segment> {
    let ipv6 = Ipv6Packet::new(data)?;
    if ipv6.get_next_header() != IpNextHeaderProtocols::Tcp {
        return None;
    }
    let src_ip = IpAddr::V6(ipv6.get_source());
    let dst_ip = IpAddr::V6(ipv6.get_destination());
    parse_tcp(ipv6.payload(), src_ip, dst_ip, timestamp)
}

fn parse_tcp(data: &[u8], src_ip: IpAddr, dst_ip: IpAddr, timestamp: DateTime<Utc>) -> Option<Segment> {
    let tcp = TcpPacket::new(data)?;
    let tuple = FourTuple {
        src_ip,
        src_port: tcp.get_source(),
        dst_ip,
        dst_port: tcp.get_destination(),
    };
    let flags = tcp.get_flags();
    Some(Segment {
        tuple,
        seq: tcp.get_sequence(),
        syn: flags & TcpFlags::SYN != 0,
        fin: flags & TcpFlags::FIN != 0,
        ack: flags & TcpFlags::ACK != 0,
        rst: flags & TcpFlags::RST != 0,
        timestamp,
        payload: tcp.payload(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pnet::packet::ethernet::{MutableEthernetPacket, EtherTypes as ET};
    use pnet::packet::ipv4::MutableIpv4Packet;
    use pnet::packet::tcp::{MutableTcpPacket, TcpFlags as TF};
    use pnet::packet::ip::IpNextHeaderProtocols as INP;
    use pnet::util::MacAddr;

    fn build_frame(src_port: u16, dst_port: u16, seq: u32, flags: u8, payload: &[u8]) -> Vec<u8> {
        let tcp_len = 20 + payload.len();
        let mut tcp_buf = vec![0u8; tcp_len];
        {
            let mut tcp = MutableTcpPacket::new(&mut tcp_buf).unwrap();
            tcp.set_source(src_port);
            tcp.set_destination(dst_port);
            tcp.set_sequence(seq);
            tcp.set_data_offset(5);
            tcp.set_flags(flags);
            tcp.set_window(1024);
            tcp.set_payload(payload);
        }

        let ip_len = 20 + tcp_len;
        let mut ip_buf = vec![0u8; ip_len];
        {
            let mut ip = MutableIpv4Packet::new(&mut ip_buf).unwrap();
            ip.set_version(4);
            ip.set_header_length(5);
            ip.set_total_length(ip_len as u16);
            ip.set_ttl(64);
            ip.set_next_level_protocol(INP::Tcp);
            ip.set_source("10.0.0.1".parse().unwrap());
            ip.set_destination("10.0.0.2".parse().unwrap());
            ip.set_payload(&tcp_buf);
        }

        let eth_len = 14 + ip_len;
        let mut eth_buf = vec![0u8; eth_len];
        {
            let mut eth = MutableEthernetPacket::new(&mut eth_buf).unwrap();
            eth.set_source(MacAddr::new(1, 2, 3, 4, 5, 6));
            eth.set_destination(MacAddr::new(6, 5, 4, 3, 2, 1));
            eth.set_ethertype(ET::Ipv4);
            eth.set_payload(&ip_buf);
        }
        eth_buf
    }

    #[test]
    fn accepts_well_formed_tcp_frame() {
        let frame = build_frame(1234, 80, 0, TF::SYN, b"");
        let now = Utc::now();
        let assembler = Assembler::new(AssemblerConfig { block_gap: Duration::milliseconds(100), idle_flow: Duration::seconds(300) });
        match assembler.ingest_frame(&frame, now) {
            PacketOutcome::Accepted { service_port, .. } => assert_eq!(service_port, 80),
            PacketOutcome::Invalid => panic!("expected accepted"),
        }
    }

    #[test]
    fn rejects_truncated_frame() {
        let assembler = Assembler::new(AssemblerConfig { block_gap: Duration::milliseconds(100), idle_flow: Duration::seconds(300) });
        assert!(matches!(assembler.ingest_frame(&[0u8; 4], Utc::now()), PacketOutcome::Invalid));
    }

    #[test]
    fn fin_both_sides_terminates_and_reassembles_bytes() {
        let assembler = Assembler::new(AssemblerConfig { block_gap: Duration::milliseconds(100), idle_flow: Duration::seconds(300) });
        let now = Utc::now();

        assembler.ingest_frame(&build_frame(1234, 80, 0, TF::SYN, b""), now);
        let request = b"GET / HTTP/1.1\r\n\r\n";
        assembler.ingest_frame(&build_frame(1234, 80, 0, TF::ACK | TF::PSH, request), now);

        let response = b"HTTP/1.1 200 OK\r\n\r\n";
        // Server's segment: source/destination swapped relative to the client frame.
        let server_frame = build_frame(80, 1234, 0, TF::ACK | TF::PSH, response);
        // Patch IPs so source/destination also swap (build_frame hardcodes them).
        let server_frame = swap_ips(server_frame);
        assembler.ingest_frame(&server_frame, now);

        assembler.ingest_frame(&build_frame(1234, 80, request.len() as u32, TF::FIN | TF::ACK, b""), now);
        let outcome = assembler.ingest_frame(&swap_ips(build_frame(80, 1234, response.len() as u32, TF::FIN | TF::ACK, b"")), now);

        match outcome {
            PacketOutcome::Accepted { terminated: Some(flow), .. } => {
                assert_eq!(flow.client_stream.buffer(), request);
                assert_eq!(flow.server_stream.buffer(), response);
            }
            _ => panic!("expected flow to terminate"),
        }
    }

    fn swap_ips(mut frame: Vec<u8>) -> Vec<u8> {
        let mut ip = MutableIpv4Packet::new(&mut frame[14..]).unwrap();
        let src = ip.get_source();
        let dst = ip.get_destination();
        ip.set_source(dst);
        ip.set_destination(src);
        frame
    }
}
