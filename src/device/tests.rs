use super::*;
use crate::error::CoreError;

const TEST_CAPACITY: usize = 256;
const TEST_MTU: usize = 1500;

fn make_device() -> (VirtDevice, DeviceHandle) {
    let device = VirtDevice::new(TEST_MTU, TEST_CAPACITY);
    let handle = device.handle();
    (device, handle)
}

/// Minimal IPv4 header followed by `rest`.
fn make_ipv4(protocol: u8, rest: &[u8]) -> Vec<u8> {
    let total_len = 20 + rest.len();
    let mut packet = vec![0u8; total_len];
    packet[0] = 0x45;
    packet[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
    packet[8] = 64;
    packet[9] = protocol;
    packet[12..16].copy_from_slice(&[10, 0, 0, 2]);
    packet[16..20].copy_from_slice(&[1, 2, 3, 4]);
    packet[20..].copy_from_slice(rest);
    packet
}

fn make_tcp_segment(payload: &[u8]) -> Vec<u8> {
    let mut segment = vec![0u8; 20 + payload.len()];
    segment[0..2].copy_from_slice(&40000u16.to_be_bytes());
    segment[2..4].copy_from_slice(&80u16.to_be_bytes());
    segment[4..8].copy_from_slice(&1000u32.to_be_bytes());
    segment[12] = 5 << 4;
    segment[13] = 0x02; // SYN
    segment[20..].copy_from_slice(payload);
    segment
}

#[test]
fn parses_tcp_syn() {
    let packet = make_ipv4(6, &make_tcp_segment(b"hi"));
    let parsed = parse_packet(&packet).expect("parse failed");
    assert_eq!(parsed.ip.protocol, 6);
    assert_eq!(parsed.ip.ttl, 64);
    match parsed.transport {
        Transport::Tcp(tcp) => {
            assert_eq!(tcp.src_port, 40000);
            assert_eq!(tcp.dst_port, 80);
            assert_eq!(tcp.seq_number, 1000);
            assert!(tcp.flags.syn);
            assert!(!tcp.flags.ack);
        }
        _ => panic!("expected TCP transport"),
    }
    assert_eq!(parsed.payload, b"hi");
    assert_eq!(parsed.payload_offset, 40);
}

#[test]
fn parses_udp_datagram() {
    let mut datagram = vec![0u8; 8 + 4];
    datagram[0..2].copy_from_slice(&5353u16.to_be_bytes());
    datagram[2..4].copy_from_slice(&53u16.to_be_bytes());
    datagram[4..6].copy_from_slice(&12u16.to_be_bytes());
    datagram[8..].copy_from_slice(&[1, 2, 3, 4]);
    let packet = make_ipv4(17, &datagram);
    let parsed = parse_packet(&packet).expect("parse failed");
    match parsed.transport {
        Transport::Udp(udp) => {
            assert_eq!(udp.src_port, 5353);
            assert_eq!(udp.dst_port, 53);
            assert_eq!(udp.length, 12);
        }
        _ => panic!("expected UDP transport"),
    }
    assert_eq!(parsed.payload, &[1, 2, 3, 4]);
}

#[test]
fn icmp_is_recognized() {
    let packet = make_ipv4(1, &[8, 0, 0, 0, 0, 0, 0, 0]);
    let parsed = parse_packet(&packet).expect("parse failed");
    assert!(matches!(parsed.transport, Transport::Icmp));
}

#[test]
fn unknown_protocol_is_invalid() {
    let packet = make_ipv4(47, &[0u8; 8]);
    assert!(matches!(
        parse_packet(&packet),
        Err(CoreError::InvalidPacket("unsupported protocol"))
    ));
}

#[test]
fn ihl_beyond_total_length_is_invalid() {
    let mut packet = make_ipv4(6, &make_tcp_segment(&[]));
    // IHL claims 60 bytes of options while total length stays at 40.
    packet[0] = 0x4F;
    assert!(matches!(
        parse_packet(&packet),
        Err(CoreError::InvalidPacket(_))
    ));
}

#[test]
fn total_length_beyond_slice_is_invalid() {
    let mut packet = make_ipv4(6, &make_tcp_segment(&[]));
    packet[2..4].copy_from_slice(&9000u16.to_be_bytes());
    assert!(matches!(
        parse_packet(&packet),
        Err(CoreError::InvalidPacket(_))
    ));
}

#[test]
fn parses_ipv6_tcp() {
    let segment = make_tcp_segment(b"v6");
    let mut packet = vec![0u8; 40 + segment.len()];
    packet[0] = 0x60;
    packet[4..6].copy_from_slice(&(segment.len() as u16).to_be_bytes());
    packet[6] = 6;
    packet[7] = 64;
    packet[23] = 2; // src ::2
    packet[39] = 1; // dst ::1
    packet[40..].copy_from_slice(&segment);
    let parsed = parse_packet(&packet).expect("parse failed");
    assert!(parsed.is_ipv6());
    assert!(matches!(parsed.transport, Transport::Tcp(_)));
    assert_eq!(parsed.payload, b"v6");
}

#[test]
fn rx_drop_tail_when_full() {
    let (_, handle) = make_device();
    let packet = make_ipv4(6, &make_tcp_segment(&[]));
    for _ in 0..TEST_CAPACITY {
        assert!(handle.push_rx(&packet));
    }
    assert!(!handle.push_rx(&packet));
    assert_eq!(handle.rx_len(), TEST_CAPACITY);
    assert_eq!(handle.drop_counts().0, 1);
}

#[test]
fn rx_batches_preserve_order() {
    let (_, handle) = make_device();
    for tag in 0u8..5 {
        let packet = make_ipv4(6, &make_tcp_segment(&[tag]));
        handle.push_rx(&packet);
    }
    let first = handle.pop_rx_batch(3);
    assert_eq!(first.len(), 3);
    assert_eq!(*first[0].last().unwrap(), 0);
    assert_eq!(*first[2].last().unwrap(), 2);
    let rest = handle.pop_rx_batch(MAX_BATCH);
    assert_eq!(rest.len(), 2);
    assert!(handle.pop_rx_batch(MAX_BATCH).is_empty());
}

#[test]
fn stack_transmissions_land_in_tx() {
    let (mut device, handle) = make_device();
    let tx1 = device.transmit(Instant::from_millis(0)).unwrap();
    tx1.consume(16, |buffer| buffer.fill(0xAA));
    let tx2 = device.transmit(Instant::from_millis(0)).unwrap();
    tx2.consume(24, |buffer| buffer.fill(0xBB));

    let frames = handle.pop_tx_batch(MAX_BATCH);
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0], vec![0xAA; 16]);
    assert_eq!(frames[1], vec![0xBB; 24]);
}

#[test]
fn tx_drop_tail_counts() {
    let (mut device, handle) = make_device();
    for _ in 0..TEST_CAPACITY + 3 {
        let tx = device.transmit(Instant::from_millis(0)).unwrap();
        tx.consume(8, |_| {});
    }
    assert_eq!(handle.tx_len(), TEST_CAPACITY);
    assert_eq!(handle.drop_counts().1, 3);
}

#[test]
fn receive_consumes_rx_queue() {
    let (mut device, handle) = make_device();
    let packet = make_ipv4(6, &make_tcp_segment(b"x"));
    handle.push_rx(&packet);
    let (rx, _) = device
        .receive(Instant::from_millis(0))
        .expect("rx token missing");
    let mut captured = Vec::new();
    rx.consume(|buffer| captured.extend_from_slice(buffer));
    assert_eq!(captured, packet);
    assert!(device.receive(Instant::from_millis(0)).is_none());
}
