//! Raw datagram synthesis for the paths smoltcp does not cover: RST
//! segments answering rejected or failed flows, and UDP payloads carried
//! back to the client outside the socket set.

use super::checksum;
use super::state::FlowKey;
use crate::device::{IpMeta, TcpHeader};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

const TCP_HEADER_LEN: usize = 20;
const UDP_HEADER_LEN: usize = 8;
const HOP_LIMIT: u8 = 64;
const PROTO_TCP: u8 = 6;
const PROTO_UDP: u8 = 17;

/// Answer a client segment with RST/ACK as if the destination refused it.
/// `ip`/`tcp` describe the offending client->server segment; the reset
/// travels the other way, so addresses and ports flip.
pub(super) fn build_tcp_reset(ip: &IpMeta, tcp: &TcpHeader, payload_len: usize) -> Option<Vec<u8>> {
    let mut segment = Vec::with_capacity(TCP_HEADER_LEN);
    segment.extend_from_slice(&tcp.dst_port.to_be_bytes());
    segment.extend_from_slice(&tcp.src_port.to_be_bytes());
    let sequence = if tcp.flags.ack { tcp.ack_number } else { 0 };
    segment.extend_from_slice(&sequence.to_be_bytes());
    segment.extend_from_slice(&acknowledgement_for(tcp, payload_len).to_be_bytes());
    segment.push(((TCP_HEADER_LEN / 4) as u8) << 4);
    segment.push(0x14); // RST | ACK
    segment.extend_from_slice(&[0u8; 6]); // window, checksum, urgent pointer
    assemble(ip.dst, ip.src, PROTO_TCP, segment, 16)
}

/// A reset acknowledges everything the offending segment occupied in
/// sequence space: the payload plus one each for SYN and FIN.
fn acknowledgement_for(tcp: &TcpHeader, payload_len: usize) -> u32 {
    tcp.seq_number
        .wrapping_add(payload_len as u32)
        .wrapping_add(u32::from(tcp.flags.syn))
        .wrapping_add(u32::from(tcp.flags.fin))
}

/// Wrap an upstream payload as a server->client UDP datagram for `key`
/// (whose src side is the client).
pub(super) fn build_udp_response(key: &FlowKey, payload: &[u8]) -> Option<Vec<u8>> {
    let length = UDP_HEADER_LEN + payload.len();
    let mut segment = Vec::with_capacity(length);
    segment.extend_from_slice(&key.dst_port.to_be_bytes());
    segment.extend_from_slice(&key.src_port.to_be_bytes());
    segment.extend_from_slice(&(length as u16).to_be_bytes());
    segment.extend_from_slice(&0u16.to_be_bytes());
    segment.extend_from_slice(payload);
    assemble(key.dst_ip, key.src_ip, PROTO_UDP, segment, 6)
}

/// Patch the transport checksum into `segment` at `checksum_at`, then
/// prepend the IP header for the address family. A mixed v4/v6 pair cannot
/// belong to a tracked flow and yields None.
fn assemble(
    src: IpAddr,
    dst: IpAddr,
    protocol: u8,
    mut segment: Vec<u8>,
    checksum_at: usize,
) -> Option<Vec<u8>> {
    let sum = checksum::transport(src, dst, protocol, &segment);
    segment[checksum_at..checksum_at + 2].copy_from_slice(&sum.to_be_bytes());
    let mut packet = match (src, dst) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => ipv4_header(src, dst, protocol, segment.len()),
        (IpAddr::V6(src), IpAddr::V6(dst)) => ipv6_header(src, dst, protocol, segment.len()),
        _ => return None,
    };
    packet.extend_from_slice(&segment);
    Some(packet)
}

fn ipv4_header(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, payload_len: usize) -> Vec<u8> {
    let mut header = Vec::with_capacity(20 + payload_len);
    header.push(0x45); // version 4, five 32-bit words, no options
    header.push(0); // dscp/ecn
    header.extend_from_slice(&((20 + payload_len) as u16).to_be_bytes());
    header.extend_from_slice(&[0u8; 4]); // identification, flags, fragment offset
    header.push(HOP_LIMIT);
    header.push(protocol);
    header.extend_from_slice(&0u16.to_be_bytes()); // checksum, patched below
    header.extend_from_slice(&src.octets());
    header.extend_from_slice(&dst.octets());
    let sum = checksum::ip_header(&header);
    header[10..12].copy_from_slice(&sum.to_be_bytes());
    header
}

fn ipv6_header(src: Ipv6Addr, dst: Ipv6Addr, next_header: u8, payload_len: usize) -> Vec<u8> {
    let mut header = Vec::with_capacity(40 + payload_len);
    header.push(0x60); // version 6
    header.extend_from_slice(&[0u8; 3]); // traffic class, flow label
    header.extend_from_slice(&(payload_len as u16).to_be_bytes());
    header.push(next_header);
    header.push(HOP_LIMIT);
    header.extend_from_slice(&src.octets());
    header.extend_from_slice(&dst.octets());
    header
}
