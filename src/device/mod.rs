//! Virtual tunnel device: zero-copy packet parsing plus the bounded rx/tx
//! FIFOs bridging the platform boundary and the userspace stack. Implements
//! smoltcp's `Device` so the interface consumes the rx queue and emits into
//! the tx queue directly.

use crate::error::CoreError;
use parking_lot::Mutex;
use smoltcp::phy::{Device, DeviceCapabilities, Medium, RxToken, TxToken};
use smoltcp::time::Instant;
use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

pub const MAX_BATCH: usize = 64;

/// IP-layer metadata of a parsed datagram.
#[derive(Debug, Clone, Copy)]
pub struct IpMeta {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub protocol: u8,
    pub ttl: u8,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpFlags {
    pub syn: bool,
    pub ack: bool,
    pub fin: bool,
    pub rst: bool,
    pub psh: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq_number: u32,
    pub ack_number: u32,
    pub flags: TcpFlags,
}

#[derive(Debug, Clone, Copy)]
pub struct UdpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub length: u16,
}

#[derive(Debug, Clone)]
pub enum Transport {
    Tcp(TcpHeader),
    Udp(UdpHeader),
    Icmp,
}

/// Borrowed view of a validated datagram. The payload slice points into the
/// caller's buffer; nothing is copied.
#[derive(Debug, Clone)]
pub struct ParsedPacket<'a> {
    pub ip: IpMeta,
    pub transport: Transport,
    pub payload_offset: usize,
    pub payload: &'a [u8],
}

impl ParsedPacket<'_> {
    pub fn is_ipv6(&self) -> bool {
        self.ip.src.is_ipv6()
    }
}

/// Parse and validate one IP datagram.
///
/// Checksums are not verified here; the stack validates TCP/UDP checksums
/// when it consumes the frame.
pub fn parse_packet(packet: &[u8]) -> Result<ParsedPacket<'_>, CoreError> {
    if packet.is_empty() {
        return Err(CoreError::InvalidPacket("empty packet"));
    }
    let version = packet[0] >> 4;
    match version {
        4 => parse_ipv4(packet),
        6 => parse_ipv6(packet),
        _ => Err(CoreError::InvalidPacket("unsupported IP version")),
    }
}

fn parse_ipv4(packet: &[u8]) -> Result<ParsedPacket<'_>, CoreError> {
    if packet.len() < 20 {
        return Err(CoreError::InvalidPacket("truncated IPv4 header"));
    }
    let header_len = usize::from(packet[0] & 0x0F) * 4;
    if header_len < 20 || header_len > packet.len() {
        return Err(CoreError::InvalidPacket("bad IPv4 header length"));
    }
    let total_len = u16::from_be_bytes([packet[2], packet[3]]) as usize;
    if total_len > packet.len() || total_len < header_len {
        return Err(CoreError::InvalidPacket("bad IPv4 total length"));
    }
    let protocol = packet[9];
    let ip = IpMeta {
        src: IpAddr::V4(Ipv4Addr::new(
            packet[12], packet[13], packet[14], packet[15],
        )),
        dst: IpAddr::V4(Ipv4Addr::new(
            packet[16], packet[17], packet[18], packet[19],
        )),
        protocol,
        ttl: packet[8],
    };
    let transport_bytes = &packet[header_len..total_len];
    match protocol {
        6 => parse_tcp(ip, header_len, transport_bytes),
        17 => parse_udp(ip, header_len, transport_bytes),
        1 => Ok(ParsedPacket {
            ip,
            transport: Transport::Icmp,
            payload_offset: header_len,
            payload: transport_bytes,
        }),
        _ => Err(CoreError::InvalidPacket("unsupported protocol")),
    }
}

fn parse_ipv6(packet: &[u8]) -> Result<ParsedPacket<'_>, CoreError> {
    if packet.len() < 40 {
        return Err(CoreError::InvalidPacket("truncated IPv6 header"));
    }
    let payload_len = u16::from_be_bytes([packet[4], packet[5]]) as usize;
    if 40 + payload_len > packet.len() {
        return Err(CoreError::InvalidPacket("bad IPv6 payload length"));
    }
    let next_header = packet[6];
    let mut src = [0u8; 16];
    let mut dst = [0u8; 16];
    src.copy_from_slice(&packet[8..24]);
    dst.copy_from_slice(&packet[24..40]);
    let ip = IpMeta {
        src: IpAddr::V6(Ipv6Addr::from(src)),
        dst: IpAddr::V6(Ipv6Addr::from(dst)),
        protocol: next_header,
        ttl: packet[7],
    };
    let transport_bytes = &packet[40..40 + payload_len];
    match next_header {
        6 => parse_tcp(ip, 40, transport_bytes),
        17 => parse_udp(ip, 40, transport_bytes),
        58 => Ok(ParsedPacket {
            ip,
            transport: Transport::Icmp,
            payload_offset: 40,
            payload: transport_bytes,
        }),
        _ => Err(CoreError::InvalidPacket("unsupported protocol")),
    }
}

fn parse_tcp(ip: IpMeta, ip_header_len: usize, segment: &[u8]) -> Result<ParsedPacket<'_>, CoreError> {
    if segment.len() < 20 {
        return Err(CoreError::InvalidPacket("truncated TCP header"));
    }
    let data_offset = usize::from(segment[12] >> 4) * 4;
    if data_offset < 20 || data_offset > segment.len() {
        return Err(CoreError::InvalidPacket("bad TCP data offset"));
    }
    let flags_byte = segment[13];
    let header = TcpHeader {
        src_port: u16::from_be_bytes([segment[0], segment[1]]),
        dst_port: u16::from_be_bytes([segment[2], segment[3]]),
        seq_number: u32::from_be_bytes([segment[4], segment[5], segment[6], segment[7]]),
        ack_number: u32::from_be_bytes([segment[8], segment[9], segment[10], segment[11]]),
        flags: TcpFlags {
            syn: flags_byte & 0x02 != 0,
            ack: flags_byte & 0x10 != 0,
            fin: flags_byte & 0x01 != 0,
            rst: flags_byte & 0x04 != 0,
            psh: flags_byte & 0x08 != 0,
        },
    };
    Ok(ParsedPacket {
        ip,
        transport: Transport::Tcp(header),
        payload_offset: ip_header_len + data_offset,
        payload: &segment[data_offset..],
    })
}

fn parse_udp(ip: IpMeta, ip_header_len: usize, datagram: &[u8]) -> Result<ParsedPacket<'_>, CoreError> {
    if datagram.len() < 8 {
        return Err(CoreError::InvalidPacket("truncated UDP header"));
    }
    let length = u16::from_be_bytes([datagram[4], datagram[5]]);
    if (length as usize) < 8 || (length as usize) > datagram.len() {
        return Err(CoreError::InvalidPacket("bad UDP length"));
    }
    let header = UdpHeader {
        src_port: u16::from_be_bytes([datagram[0], datagram[1]]),
        dst_port: u16::from_be_bytes([datagram[2], datagram[3]]),
        length,
    };
    Ok(ParsedPacket {
        ip,
        transport: Transport::Udp(header),
        payload_offset: ip_header_len + 8,
        payload: &datagram[8..length as usize],
    })
}

struct SharedQueues {
    rx: VecDeque<Vec<u8>>,
    tx: VecDeque<Vec<u8>>,
    capacity: usize,
    rx_dropped: u64,
    tx_dropped: u64,
}

impl SharedQueues {
    fn new(capacity: usize) -> Self {
        Self {
            rx: VecDeque::with_capacity(capacity),
            tx: VecDeque::with_capacity(capacity),
            capacity,
            rx_dropped: 0,
            tx_dropped: 0,
        }
    }
}

/// Device exposed to smoltcp. All state lives behind the shared queues so
/// the device stays `Clone` + lightweight.
#[derive(Clone)]
pub struct VirtDevice {
    inner: Arc<Mutex<SharedQueues>>,
    mtu: usize,
}

/// Handle used by the boundary shim to push/pull packets without borrowing
/// the smoltcp device mutably.
#[derive(Clone)]
pub struct DeviceHandle {
    inner: Arc<Mutex<SharedQueues>>,
    mtu: usize,
}

impl VirtDevice {
    pub fn new(mtu: usize, queue_capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SharedQueues::new(queue_capacity.max(16)))),
            mtu: mtu.max(crate::config::MIN_MTU),
        }
    }

    pub fn handle(&self) -> DeviceHandle {
        DeviceHandle {
            inner: Arc::clone(&self.inner),
            mtu: self.mtu,
        }
    }
}

impl DeviceHandle {
    /// Enqueue a platform-delivered datagram toward the stack. Drop-tail:
    /// returns `false` and bumps the drop counter when the queue is full or
    /// the frame exceeds the MTU.
    pub fn push_rx(&self, packet: &[u8]) -> bool {
        if packet.is_empty() {
            return true;
        }
        let mut guard = self.inner.lock();
        if packet.len() > self.mtu || guard.rx.len() >= guard.capacity {
            guard.rx_dropped += 1;
            return false;
        }
        guard.rx.push_back(packet.to_vec());
        true
    }

    /// Enqueue a synthesized datagram toward the platform (same drop-tail
    /// policy as the stack's own transmissions).
    pub fn push_tx(&self, packet: Vec<u8>) -> bool {
        let mut guard = self.inner.lock();
        if guard.tx.len() >= guard.capacity {
            guard.tx_dropped += 1;
            return false;
        }
        guard.tx.push_back(packet);
        true
    }

    pub fn pop_rx_batch(&self, max: usize) -> Vec<Vec<u8>> {
        let mut guard = self.inner.lock();
        let count = max.min(guard.rx.len());
        guard.rx.drain(..count).collect()
    }

    pub fn pop_tx_batch(&self, max: usize) -> Vec<Vec<u8>> {
        let mut guard = self.inner.lock();
        let count = max.min(guard.tx.len());
        guard.tx.drain(..count).collect()
    }

    /// Empty only the platform→stack queue; synthesized teardown packets in
    /// tx stay readable.
    pub fn clear_rx(&self) {
        self.inner.lock().rx.clear();
    }

    pub fn rx_len(&self) -> usize {
        self.inner.lock().rx.len()
    }

    pub fn tx_len(&self) -> usize {
        self.inner.lock().tx.len()
    }

    /// (rx_dropped, tx_dropped) since creation.
    pub fn drop_counts(&self) -> (u64, u64) {
        let guard = self.inner.lock();
        (guard.rx_dropped, guard.tx_dropped)
    }
}

impl Device for VirtDevice {
    type RxToken<'a>
        = QueueRxToken
    where
        Self: 'a;
    type TxToken<'a>
        = QueueTxToken
    where
        Self: 'a;

    fn receive(&mut self, _timestamp: Instant) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        let mut guard = self.inner.lock();
        guard.rx.pop_front().map(|packet| {
            let rx = QueueRxToken { buffer: packet };
            let tx = QueueTxToken {
                inner: Arc::clone(&self.inner),
                mtu: self.mtu,
            };
            (rx, tx)
        })
    }

    fn transmit(&mut self, _timestamp: Instant) -> Option<Self::TxToken<'_>> {
        Some(QueueTxToken {
            inner: Arc::clone(&self.inner),
            mtu: self.mtu,
        })
    }

    fn capabilities(&self) -> DeviceCapabilities {
        let mut caps = DeviceCapabilities::default();
        caps.max_transmission_unit = self.mtu;
        caps.medium = Medium::Ip;
        caps
    }
}

pub struct QueueRxToken {
    buffer: Vec<u8>,
}

pub struct QueueTxToken {
    inner: Arc<Mutex<SharedQueues>>,
    mtu: usize,
}

impl RxToken for QueueRxToken {
    fn consume<R, F>(self, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut buffer = self.buffer;
        f(&mut buffer)
    }
}

impl TxToken for QueueTxToken {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut frame = vec![0u8; len.min(self.mtu)];
        let result = f(&mut frame);
        let mut guard = self.inner.lock();
        if guard.tx.len() >= guard.capacity {
            guard.tx_dropped += 1;
        } else {
            guard.tx.push_back(frame);
        }
        result
    }
}

#[cfg(test)]
mod tests;
