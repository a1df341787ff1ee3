use super::upstream::UpstreamHandle;
use crate::device::{ParsedPacket, Transport};
use smoltcp::iface::SocketHandle;
use std::collections::VecDeque;
use std::net::IpAddr;
use std::time::Instant as StdInstant;

pub(super) const TCP_RX_BUFFER_SIZE: usize = 64 * 1024;
pub(super) const TCP_TX_BUFFER_SIZE: usize = 64 * 1024;
pub(super) const UDP_PACKET_METADATA: usize = 64;
pub(super) const UDP_BUFFER_SIZE: usize = 32 * 1024;
pub(super) const MAX_STAGED_PAYLOADS: usize = 32;
pub(super) const MAX_STAGED_BYTES: usize = 64 * 1024;
pub(super) const SNIFF_PEEK_BYTES: usize = 4096;

#[derive(Clone, Copy, Hash, Eq, PartialEq, Debug)]
pub enum FlowKind {
    Tcp,
    Udp,
}

/// 5-tuple identifying a NAT entry. `src` is the client side.
#[derive(Clone, Copy, Hash, Eq, PartialEq, Debug)]
pub struct FlowKey {
    pub src_ip: IpAddr,
    pub src_port: u16,
    pub dst_ip: IpAddr,
    pub dst_port: u16,
    pub kind: FlowKind,
}

impl FlowKey {
    pub fn from_packet(packet: &ParsedPacket<'_>) -> Option<Self> {
        match &packet.transport {
            Transport::Tcp(tcp) => Some(FlowKey {
                src_ip: packet.ip.src,
                src_port: tcp.src_port,
                dst_ip: packet.ip.dst,
                dst_port: tcp.dst_port,
                kind: FlowKind::Tcp,
            }),
            Transport::Udp(udp) => Some(FlowKey {
                src_ip: packet.ip.src,
                src_port: udp.src_port,
                dst_ip: packet.ip.dst,
                dst_port: udp.dst_port,
                kind: FlowKind::Udp,
            }),
            Transport::Icmp => None,
        }
    }
}

/// Runtime half of a flow: the stack socket, the upstream I/O handle, and
/// the small staging queue for upstream payloads the stack socket could not
/// yet absorb. Bookkeeping lives on the NAT entry.
pub(super) struct RuntimeFlow {
    pub(super) socket: Option<SocketHandle>,
    pub(super) upstream: Option<UpstreamHandle>,
    pub(super) staged: VecDeque<Vec<u8>>,
    pub(super) staged_bytes: usize,
    /// Some while the flow waits for a sniffable client payload.
    pub(super) sniff_deadline: Option<StdInstant>,
    /// Half-close toward the upstream already signalled.
    pub(super) upstream_eof: bool,
}

impl RuntimeFlow {
    pub(super) fn new(socket: Option<SocketHandle>) -> Self {
        Self {
            socket,
            upstream: None,
            staged: VecDeque::new(),
            staged_bytes: 0,
            sniff_deadline: None,
            upstream_eof: false,
        }
    }
}

/// Queue `payload` for later delivery into the stack socket. Bounded; when
/// a cap would be exceeded the payload is refused and the caller closes the
/// flow. Nothing is evicted, byte order toward the client must hold.
pub(super) fn stage_payload(flow: &mut RuntimeFlow, payload: &[u8]) -> bool {
    if payload.is_empty() {
        return true;
    }
    if payload.len() > MAX_STAGED_BYTES {
        return false;
    }
    if flow.staged.len() >= MAX_STAGED_PAYLOADS
        || flow.staged_bytes + payload.len() > MAX_STAGED_BYTES
    {
        return false;
    }
    flow.staged.push_back(payload.to_vec());
    flow.staged_bytes += payload.len();
    true
}
